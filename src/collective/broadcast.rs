use crate::accel::Stream;
use crate::collective::staging::{self, CompletionEvents};
use crate::error::Result;
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::{Rank, Tag};
use crate::work::Job;
use std::sync::Arc;

/// Broadcast the root tensor from the root rank, then copy it into every
/// other entry of the local list.
pub(crate) struct BroadcastJob {
    pub context: Arc<Context>,
    pub inputs: Vec<Tensor>,
    pub root_rank: Rank,
    pub root_tensor: usize,
    pub tag: Tag,
}

impl BroadcastJob {
    fn broadcast_one(&self, tensor: &Tensor) -> Result<()> {
        let dense = tensor.dense()?;
        dense.with_bytes_mut(|buf| self.context.broadcast(self.tag, self.root_rank, buf))
    }
}

impl Job for BroadcastJob {
    fn run(&self) -> Result<()> {
        self.broadcast_one(&self.inputs[self.root_tensor])?;

        for (i, tensor) in self.inputs.iter().enumerate() {
            if i == self.root_tensor {
                continue;
            }
            tensor.copy_from(&self.inputs[self.root_tensor])?;
        }
        Ok(())
    }
}

/// Accelerator variant: the root stages its tensor into a pinned shadow on
/// a side stream, the host broadcast runs on the shadow, and the result is
/// copied back onto every input asynchronously.
pub(crate) struct StagedBroadcastJob {
    inner: BroadcastJob,
    streams: Vec<Stream>,
    shadow: Tensor,
    events: CompletionEvents,
}

impl StagedBroadcastJob {
    pub(crate) fn new(
        context: Arc<Context>,
        inputs: Vec<Tensor>,
        root_rank: Rank,
        root_tensor: usize,
        tag: Tag,
    ) -> Result<StagedBroadcastJob> {
        let streams = staging::init_streams(&inputs);
        let shadow = Tensor::from_dense(inputs[root_tensor].dense()?.pinned_like());
        if context.rank == root_rank {
            staging::copy_async(
                shadow.dense()?,
                inputs[root_tensor].dense()?,
                &streams[root_tensor],
            );
        }
        Ok(StagedBroadcastJob {
            inner: BroadcastJob {
                context,
                inputs,
                root_rank,
                root_tensor,
                tag,
            },
            streams,
            shadow,
            events: CompletionEvents::default(),
        })
    }
}

impl Job for StagedBroadcastJob {
    fn run(&self) -> Result<()> {
        // Wait for the stage-in copy before touching the shadow.
        if self.inner.context.rank == self.inner.root_rank {
            self.streams[self.inner.root_tensor].synchronize();
        }

        self.inner.broadcast_one(&self.shadow)?;

        for (i, tensor) in self.inner.inputs.iter().enumerate() {
            staging::copy_async(tensor.dense()?, self.shadow.dense()?, &self.streams[i]);
            staging::record_completion(&self.events, tensor, &self.streams[i]);
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        staging::block_current_streams(&self.events);
        Ok(())
    }
}
