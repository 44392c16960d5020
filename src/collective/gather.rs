use crate::accel::Stream;
use crate::collective::staging::{self, CompletionEvents};
use crate::error::Result;
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::{Rank, Tag};
use crate::work::Job;
use std::sync::Arc;

/// Gather every rank's single input onto the root, which unflattens the
/// received buffer into its per-rank output slots.
pub(crate) struct GatherJob {
    pub context: Arc<Context>,
    pub outputs: Vec<Vec<Tensor>>,
    pub inputs: Vec<Tensor>,
    pub root: Rank,
    pub tag: Tag,
}

impl GatherJob {
    fn gather_dense(&self, outputs: &[Vec<Tensor>], inputs: &[Tensor]) -> Result<()> {
        let input = inputs[0].dense()?;
        let in_bytes = input.read_bytes();

        if self.context.rank == self.root {
            let row = in_bytes.len();
            let mut flat = vec![0u8; row * self.context.size as usize];
            self.context
                .gather(self.tag, self.root, &in_bytes, Some(&mut flat))?;

            for (i, tensor) in outputs[0].iter().enumerate() {
                tensor.dense()?.write_bytes(&flat[i * row..(i + 1) * row])?;
            }
        } else {
            self.context.gather(self.tag, self.root, &in_bytes, None)?;
        }
        Ok(())
    }
}

impl Job for GatherJob {
    fn run(&self) -> Result<()> {
        self.gather_dense(&self.outputs, &self.inputs)
    }
}

/// Accelerator variant.
pub(crate) struct StagedGatherJob {
    inner: GatherJob,
    input_streams: Vec<Stream>,
    output_streams: Vec<Stream>,
    shadow_inputs: Vec<Tensor>,
    shadow_outputs: Vec<Vec<Tensor>>,
    events: CompletionEvents,
}

impl StagedGatherJob {
    pub(crate) fn new(
        context: Arc<Context>,
        outputs: Vec<Vec<Tensor>>,
        inputs: Vec<Tensor>,
        root: Rank,
        tag: Tag,
    ) -> Result<StagedGatherJob> {
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

        Ok(StagedGatherJob {
            inner: GatherJob {
                context,
                outputs,
                inputs,
                root,
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

impl Job for StagedGatherJob {
    fn run(&self) -> Result<()> {
        for stream in self.input_streams.iter().chain(&self.output_streams) {
            stream.synchronize();
        }

        self.inner
            .gather_dense(&self.shadow_outputs, &self.shadow_inputs)?;

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
