use crate::accel::Stream;
use crate::collective::staging::{self, CompletionEvents};
use crate::error::Result;
use crate::tensor::{flatten_bytes, Tensor};
use crate::transport::Context;
use crate::types::{ReduceOp, Tag};
use crate::work::Job;
use std::sync::Arc;

/// Run the transport allreduce over the first tensor's buffer.
///
/// Only the first entry of a multi-tensor list carries the result; the
/// callers copy it into the remaining entries. This mirrors the upstream
/// transport contract for multi-tensor allreduce.
pub(crate) fn allreduce_dense(
    context: &Context,
    tensors: &[Tensor],
    op: ReduceOp,
    tag: Tag,
) -> Result<()> {
    let first = tensors[0].dense()?;
    let count = first.numel();
    let dtype = first.dtype();
    first.with_bytes_mut(|buf| context.allreduce(tag, buf, count, dtype, op))
}

pub(crate) struct AllreduceJob {
    pub context: Arc<Context>,
    pub inputs: Vec<Tensor>,
    pub op: ReduceOp,
    pub tag: Tag,
}

impl Job for AllreduceJob {
    fn run(&self) -> Result<()> {
        allreduce_dense(&self.context, &self.inputs, self.op, self.tag)?;

        // The first entry holds the result; fan it out locally.
        for tensor in &self.inputs[1..] {
            tensor.copy_from(&self.inputs[0])?;
        }
        Ok(())
    }
}

/// Flatten all inputs into one contiguous buffer, allreduce once, then
/// slice the reduced bytes back into each input.
pub(crate) struct AllreduceCoalescedJob {
    pub context: Arc<Context>,
    pub inputs: Vec<Tensor>,
    pub op: ReduceOp,
    pub tag: Tag,
}

impl Job for AllreduceCoalescedJob {
    fn run(&self) -> Result<()> {
        let dtype = self.inputs[0].dtype();
        let mut flat = flatten_bytes(&self.inputs)?;
        let count = flat.len() / dtype.size_in_bytes();
        self.context
            .allreduce(self.tag, &mut flat, count, dtype, self.op)?;

        let mut offset = 0;
        for tensor in &self.inputs {
            let dense = tensor.dense()?;
            let nbytes = dense.nbytes();
            dense.write_bytes(&flat[offset..offset + nbytes])?;
            offset += nbytes;
        }
        Ok(())
    }
}

/// Accelerator variant: stage every input into a pinned shadow, allreduce
/// the shadows on the host, then copy the first shadow back onto every
/// input.
pub(crate) struct StagedAllreduceJob {
    inner: AllreduceJob,
    streams: Vec<Stream>,
    shadows: Vec<Tensor>,
    events: CompletionEvents,
}

impl StagedAllreduceJob {
    pub(crate) fn new(
        context: Arc<Context>,
        inputs: Vec<Tensor>,
        op: ReduceOp,
        tag: Tag,
    ) -> Result<StagedAllreduceJob> {
        let streams = staging::init_streams(&inputs);
        let mut shadows = Vec::with_capacity(inputs.len());
        for (i, tensor) in inputs.iter().enumerate() {
            let shadow = Tensor::from_dense(tensor.dense()?.pinned_like());
            staging::copy_async(shadow.dense()?, tensor.dense()?, &streams[i]);
            shadows.push(shadow);
        }
        Ok(StagedAllreduceJob {
            inner: AllreduceJob {
                context,
                inputs,
                op,
                tag,
            },
            streams,
            shadows,
            events: CompletionEvents::default(),
        })
    }
}

impl Job for StagedAllreduceJob {
    fn run(&self) -> Result<()> {
        for stream in &self.streams {
            stream.synchronize();
        }

        allreduce_dense(
            &self.inner.context,
            &self.shadows,
            self.inner.op,
            self.inner.tag,
        )?;

        // Only the first shadow carries the result; copy it back to every
        // input on its side stream.
        for (i, tensor) in self.inner.inputs.iter().enumerate() {
            staging::copy_async(tensor.dense()?, self.shadows[0].dense()?, &self.streams[i]);
            staging::record_completion(&self.events, tensor, &self.streams[i]);
        }
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        staging::block_current_streams(&self.events);
        Ok(())
    }
}
