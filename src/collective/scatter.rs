use crate::accel::Stream;
use crate::collective::staging::{self, CompletionEvents};
use crate::error::Result;
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::{Rank, Tag};
use crate::work::Job;
use std::sync::Arc;

/// Scatter the root's per-rank inputs; every rank's single output receives
/// its chunk.
pub(crate) struct ScatterJob {
    pub context: Arc<Context>,
    pub outputs: Vec<Tensor>,
    pub inputs: Vec<Vec<Tensor>>,
    pub root: Rank,
    pub tag: Tag,
}

impl ScatterJob {
    fn scatter_dense(&self, outputs: &[Tensor], inputs: &[Vec<Tensor>]) -> Result<()> {
        let chunks: Vec<Vec<u8>> = if self.context.rank == self.root {
            inputs[0]
                .iter()
                .map(|t| t.dense().map(|d| d.read_bytes()))
                .collect::<Result<_>>()?
        } else {
            Vec::new()
        };

        let output = outputs[0].dense()?;
        output.with_bytes_mut(|buf| self.context.scatter(self.tag, self.root, &chunks, buf))
    }
}

impl Job for ScatterJob {
    fn run(&self) -> Result<()> {
        self.scatter_dense(&self.outputs, &self.inputs)
    }
}

/// Accelerator variant.
pub(crate) struct StagedScatterJob {
    inner: ScatterJob,
    input_streams: Vec<Stream>,
    output_streams: Vec<Stream>,
    shadow_inputs: Vec<Vec<Tensor>>,
    shadow_outputs: Vec<Tensor>,
    events: CompletionEvents,
}

impl StagedScatterJob {
    pub(crate) fn new(
        context: Arc<Context>,
        outputs: Vec<Tensor>,
        inputs: Vec<Vec<Tensor>>,
        root: Rank,
        tag: Tag,
    ) -> Result<StagedScatterJob> {
        let input_streams = staging::init_streams_nested(&inputs);
        let output_streams = staging::init_streams(&outputs);

        let mut shadow_inputs = Vec::with_capacity(inputs.len());
        for (i, list) in inputs.iter().enumerate() {
            let mut shadows = Vec::with_capacity(list.len());
            for tensor in list {
                let shadow = Tensor::from_dense(tensor.dense()?.pinned_like());
                staging::copy_async(shadow.dense()?, tensor.dense()?, &input_streams[i]);
                shadows.push(shadow);
            }
            shadow_inputs.push(shadows);
        }

        let mut shadow_outputs = Vec::with_capacity(outputs.len());
        for tensor in &outputs {
            shadow_outputs.push(Tensor::from_dense(tensor.dense()?.pinned_like()));
        }

        Ok(StagedScatterJob {
            inner: ScatterJob {
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

impl Job for StagedScatterJob {
    fn run(&self) -> Result<()> {
        for stream in self.input_streams.iter().chain(&self.output_streams) {
            stream.synchronize();
        }

        self.inner
            .scatter_dense(&self.shadow_outputs, &self.shadow_inputs)?;

        for (i, tensor) in self.inner.outputs.iter().enumerate() {
            staging::copy_async(
                tensor.dense()?,
                self.shadow_outputs[i].dense()?,
                &self.output_streams[i],
            );
            staging::record_completion(&self.events, tensor, &self.output_streams[i]);
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        staging::block_current_streams(&self.events);
        Ok(())
    }
}
