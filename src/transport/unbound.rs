use crate::error::{CohortError, Result};
use crate::tensor::{DenseTensor, Tensor};
use crate::transport::context::Context;
use crate::transport::device::Slot;
use crate::types::{Rank, Tag};
use std::sync::{Arc, Mutex, PoisonError};

enum PendingOp {
    Idle,
    SendPosted,
    Recv { srcs: Vec<Rank>, tag: Tag },
}

/// A point-to-point buffer bound to a context but not to a peer: the peer
/// and tag are chosen per operation.
///
/// Sends are eager — the payload is snapshotted and delivered to the
/// destination mailbox when `send` is called, so `wait_send` only confirms
/// the hand-off. Receives are posted by `recv`/`recv_any` and matched in
/// `wait_recv`, which writes the payload into the underlying tensor and
/// reports the source rank.
pub struct UnboundBuffer {
    context: Arc<Context>,
    tensor: DenseTensor,
    pending: Mutex<PendingOp>,
}

impl UnboundBuffer {
    pub(crate) fn new(context: Arc<Context>, tensor: &Tensor) -> Result<UnboundBuffer> {
        Ok(UnboundBuffer {
            context,
            tensor: tensor.dense()?.clone(),
            pending: Mutex::new(PendingOp::Idle),
        })
    }

    /// Post an asynchronous send of the buffer contents to `dst`.
    pub fn send(&self, dst: Rank, tag: Tag) -> Result<()> {
        if dst >= self.context.size {
            return Err(CohortError::InvalidRank {
                rank: dst,
                world_size: self.context.size,
            });
        }
        let payload = self.tensor.read_bytes();
        self.context
            .send_slot(dst, Slot::Direct(tag), &payload, "send")?;
        *self.lock_pending() = PendingOp::SendPosted;
        Ok(())
    }

    /// Post an asynchronous receive from `src`.
    pub fn recv(&self, src: Rank, tag: Tag) -> Result<()> {
        self.recv_any(vec![src], tag)
    }

    /// Post an asynchronous receive accepting any source in `srcs`.
    pub fn recv_any(&self, srcs: Vec<Rank>, tag: Tag) -> Result<()> {
        for &src in &srcs {
            if src >= self.context.size {
                return Err(CohortError::InvalidRank {
                    rank: src,
                    world_size: self.context.size,
                });
            }
        }
        if srcs.is_empty() {
            return Err(CohortError::invalid_argument(
                "recv",
                "requires at least one source rank",
            ));
        }
        *self.lock_pending() = PendingOp::Recv { srcs, tag };
        Ok(())
    }

    /// Wait for a posted send to complete.
    pub fn wait_send(&self) -> Result<()> {
        match &*self.lock_pending() {
            PendingOp::SendPosted => Ok(()),
            _ => Err(CohortError::invalid_argument(
                "wait_send",
                "no pending send on this buffer",
            )),
        }
    }

    /// Wait for a posted receive, fill the tensor, and return the source.
    pub fn wait_recv(&self) -> Result<Rank> {
        let (srcs, tag) = {
            let mut pending = self.lock_pending();
            match std::mem::replace(&mut *pending, PendingOp::Idle) {
                PendingOp::Recv { srcs, tag } => (srcs, tag),
                other => {
                    *pending = other;
                    return Err(CohortError::invalid_argument(
                        "wait_recv",
                        "no pending receive on this buffer",
                    ));
                }
            }
        };

        let (src, payload) = self.context.recv_slot(&srcs, Slot::Direct(tag), "recv")?;
        if payload.len() != self.tensor.nbytes() {
            return Err(CohortError::BufferSizeMismatch {
                expected: self.tensor.nbytes(),
                actual: payload.len(),
            });
        }
        self.tensor.write_bytes(&payload)?;
        Ok(src)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingOp> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
