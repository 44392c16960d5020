use crate::accel::Stream;
use crate::collective::staging::{self, CompletionEvents};
use crate::error::Result;
use crate::tensor::{flatten_bytes, Tensor};
use crate::transport::Context;
use crate::types::Tag;
use crate::work::Job;
use std::sync::Arc;

/// Allgather with flattened exchange: all local inputs are concatenated
/// into one buffer, gathered once, and the flat result is sliced back into
/// the nested output lists. Row `j` of the flat result is rank `j / k`'s
/// input `j % k`, where `k` is the local input count.
pub(crate) struct AllgatherJob {
    pub context: Arc<Context>,
    pub outputs: Vec<Vec<Tensor>>,
    pub inputs: Vec<Tensor>,
    pub tag: Tag,
}

impl AllgatherJob {
    fn allgather_dense(&self, outputs: &[Vec<Tensor>], inputs: &[Tensor]) -> Result<()> {
        let flat_input = flatten_bytes(inputs)?;
        let mut flat_output = vec![0u8; flat_input.len() * self.context.size as usize];
        self.context
            .allgather(self.tag, &flat_input, &mut flat_output)?;

        let row = inputs[0].dense()?.nbytes();
        for list in outputs {
            for (j, tensor) in list.iter().enumerate() {
                tensor
                    .dense()?
                    .write_bytes(&flat_output[j * row..(j + 1) * row])?;
            }
        }
        Ok(())
    }
}

impl Job for AllgatherJob {
    fn run(&self) -> Result<()> {
        self.allgather_dense(&self.outputs, &self.inputs)
    }
}

/// Accelerator variant: stage inputs into pinned shadows, allocate pinned
/// shadows for every output, run the host allgather over the shadows, and
/// copy each output list back on its own side stream.
pub(crate) struct StagedAllgatherJob {
    inner: AllgatherJob,
    input_streams: Vec<Stream>,
    output_streams: Vec<Stream>,
    shadow_inputs: Vec<Tensor>,
    shadow_outputs: Vec<Vec<Tensor>>,
    events: CompletionEvents,
}

impl StagedAllgatherJob {
    pub(crate) fn new(
        context: Arc<Context>,
        outputs: Vec<Vec<Tensor>>,
        inputs: Vec<Tensor>,
        tag: Tag,
    ) -> Result<StagedAllgatherJob> {
        let input_streams = staging::init_streams(&inputs);
        let output_streams = staging::init_streams_nested(&outputs);

        let mut shadow_inputs = Vec::with_capacity(inputs.len());
        for (i, tensor) in inputs.iter().enumerate() {
            let shadow = Tensor::from_dense(tensor.dense()?.pinned_like());
            staging::copy_async(shadow.dense()?, tensor.dense()?, &input_streams[i]);
            shadow_inputs.push(shadow);
        }

        let mut shadow_outputs = Vec::with_capacity(outputs.len());
        for list in &outputs {
            let mut shadows = Vec::with_capacity(list.len());
            for tensor in list {
                shadows.push(Tensor::from_dense(tensor.dense()?.pinned_like()));
            }
            shadow_outputs.push(shadows);
        }

        Ok(StagedAllgatherJob {
            inner: AllgatherJob {
                context,
                outputs,
                inputs,
                tag,
            },
            input_streams,
            output_streams,
            shadow_inputs,
            shadow_outputs,
            events: CompletionEvents::default(),
        })
    }
}

impl Job for StagedAllgatherJob {
    fn run(&self) -> Result<()> {
        for stream in self.input_streams.iter().chain(&self.output_streams) {
            stream.synchronize();
        }

        self.inner
            .allgather_dense(&self.shadow_outputs, &self.shadow_inputs)?;

        for (i, list) in self.inner.outputs.iter().enumerate() {
            for (j, tensor) in list.iter().enumerate() {
                staging::copy_async(
                    tensor.dense()?,
                    self.shadow_outputs[i][j].dense()?,
                    &self.output_streams[i],
                );
            }
            staging::record_completion(&self.events, &list[0], &self.output_streams[i]);
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        staging::block_current_streams(&self.events);
        Ok(())
    }
}
