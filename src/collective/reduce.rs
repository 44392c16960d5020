use crate::accel::Stream;
use crate::collective::staging::{self, CompletionEvents};
use crate::error::Result;
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::{Rank, ReduceOp, Tag};
use crate::work::Job;
use std::sync::Arc;

/// Reduce a single tensor onto the root rank.
pub(crate) struct ReduceJob {
    pub context: Arc<Context>,
    pub inputs: Vec<Tensor>,
    pub root_rank: Rank,
    pub root_tensor: usize,
    pub op: ReduceOp,
    pub tag: Tag,
}

impl ReduceJob {
    fn reduce_one(&self, tensor: &Tensor) -> Result<()> {
        let dense = tensor.dense()?;
        let count = dense.numel();
        let dtype = dense.dtype();
        dense.with_bytes_mut(|buf| {
            self.context
                .reduce(self.tag, self.root_rank, buf, count, dtype, self.op)
        })
    }
}

impl Job for ReduceJob {
    fn run(&self) -> Result<()> {
        self.reduce_one(&self.inputs[self.root_tensor])
    }
}

/// Accelerator variant: stage in, reduce the shadows on the host, copy
/// each shadow back onto its input.
pub(crate) struct StagedReduceJob {
    inner: ReduceJob,
    streams: Vec<Stream>,
    shadows: Vec<Tensor>,
    events: CompletionEvents,
}

impl StagedReduceJob {
    pub(crate) fn new(
        context: Arc<Context>,
        inputs: Vec<Tensor>,
        root_rank: Rank,
        root_tensor: usize,
        op: ReduceOp,
        tag: Tag,
    ) -> Result<StagedReduceJob> {
        let streams = staging::init_streams(&inputs);
        let mut shadows = Vec::with_capacity(inputs.len());
        for (i, tensor) in inputs.iter().enumerate() {
            let shadow = Tensor::from_dense(tensor.dense()?.pinned_like());
            staging::copy_async(shadow.dense()?, tensor.dense()?, &streams[i]);
            shadows.push(shadow);
        }
        Ok(StagedReduceJob {
            inner: ReduceJob {
                context,
                inputs,
                root_rank,
                root_tensor,
                op,
                tag,
            },
            streams,
            shadows,
            events: CompletionEvents::default(),
        })
    }
}

impl Job for StagedReduceJob {
    fn run(&self) -> Result<()> {
        for stream in &self.streams {
            stream.synchronize();
        }

        self.inner.reduce_one(&self.shadows[self.inner.root_tensor])?;

        for (i, tensor) in self.inner.inputs.iter().enumerate() {
            staging::copy_async(tensor.dense()?, self.shadows[i].dense()?, &self.streams[i]);
            staging::record_completion(&self.events, tensor, &self.streams[i]);
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        staging::block_current_streams(&self.events);
        Ok(())
    }
}
