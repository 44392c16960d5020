//! Handles for in-flight collective and point-to-point operations.

use crate::error::{CohortError, Result};
use crate::tensor::Tensor;
use crate::transport::UnboundBuffer;
use crate::types::Rank;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// A handle to an in-flight operation. Returned by every process-group
/// entrypoint; the caller blocks on `wait()` for completion.
pub trait Work: Send + Sync {
    /// Block until the operation completes, re-raising any captured
    /// failure.
    fn wait(&self) -> Result<()>;

    /// Output tensors, where the operation publishes them separately from
    /// its inputs. Meaningful once the operation has completed.
    fn result(&self) -> Option<Vec<Tensor>> {
        None
    }

    /// The peer a receive completed from. Only populated on `RecvWork`.
    fn source_rank(&self) -> Option<Rank> {
        None
    }
}

impl std::fmt::Debug for dyn Work {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Work").finish_non_exhaustive()
    }
}

/// The body of a queued collective. `run` executes on a worker thread;
/// `synchronize` executes on the waiting caller's thread after a
/// successful run, so accelerator variants can order the caller's current
/// stream after their copy-backs.
pub(crate) trait Job: Send + Sync {
    fn run(&self) -> Result<()>;

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    fn result(&self) -> Option<Vec<Tensor>> {
        None
    }
}

enum WorkState {
    Pending,
    Running,
    Completed,
    Failed(CohortError),
}

/// A queued collective job plus its completion state machine:
/// pending -> running -> completed | failed. Transitions are final; there
/// is no cancellation.
pub struct AsyncWork {
    job: Box<dyn Job>,
    state: Mutex<WorkState>,
    done: Condvar,
}

impl AsyncWork {
    pub(crate) fn new(job: Box<dyn Job>) -> Arc<AsyncWork> {
        Arc::new(AsyncWork {
            job,
            state: Mutex::new(WorkState::Pending),
            done: Condvar::new(),
        })
    }

    /// Run the job on the current (worker) thread, capturing errors and
    /// panics into the state machine.
    pub(crate) fn execute(work: &Arc<AsyncWork>) {
        {
            let mut state = work.lock_state();
            *state = WorkState::Running;
        }

        let outcome =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work.job.run()));
        let next = match outcome {
            Ok(Ok(())) => WorkState::Completed,
            Ok(Err(e)) => WorkState::Failed(e),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                tracing::warn!(msg, "collective job panicked");
                WorkState::Failed(CohortError::Panic(msg))
            }
        };

        let mut state = work.lock_state();
        *state = next;
        work.done.notify_all();
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WorkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Work for AsyncWork {
    fn wait(&self) -> Result<()> {
        let mut state = self.lock_state();
        loop {
            match &*state {
                WorkState::Pending | WorkState::Running => {
                    state = self
                        .done
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                WorkState::Completed => {
                    drop(state);
                    // Post-completion step on the caller's thread: blocks
                    // the caller's current device stream on the copy-back
                    // events of accelerator variants.
                    return self.job.synchronize();
                }
                WorkState::Failed(e) => return Err(e.clone()),
            }
        }
    }

    fn result(&self) -> Option<Vec<Tensor>> {
        self.job.result()
    }
}

/// Handle for a posted point-to-point send. Captures the tensor so its
/// memory stays live until the send is waited out.
pub struct SendWork {
    #[allow(dead_code)]
    tensor: Tensor,
    buffer: UnboundBuffer,
}

impl SendWork {
    pub(crate) fn new(tensor: Tensor, buffer: UnboundBuffer) -> SendWork {
        SendWork { tensor, buffer }
    }
}

impl Work for SendWork {
    fn wait(&self) -> Result<()> {
        self.buffer.wait_send()
    }
}

/// Handle for a posted point-to-point receive. After `wait`, the source
/// rank the transport matched is available via `source_rank`.
pub struct RecvWork {
    #[allow(dead_code)]
    tensor: Tensor,
    buffer: UnboundBuffer,
    src_rank: Mutex<Option<Rank>>,
}

impl RecvWork {
    pub(crate) fn new(tensor: Tensor, buffer: UnboundBuffer) -> RecvWork {
        RecvWork {
            tensor,
            buffer,
            src_rank: Mutex::new(None),
        }
    }
}

impl Work for RecvWork {
    fn wait(&self) -> Result<()> {
        let src = self.buffer.wait_recv()?;
        *self
            .src_rank
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(src);
        Ok(())
    }

    fn source_rank(&self) -> Option<Rank> {
        *self
            .src_rank
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
