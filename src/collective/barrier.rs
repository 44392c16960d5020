use crate::error::Result;
use crate::transport::Context;
use crate::types::Tag;
use crate::work::{AsyncWork, Job, Work};
use std::sync::{Arc, Weak};

/// Barrier: wait out a snapshot of all work that was queued or in progress
/// when the barrier was issued, then run the transport barrier.
///
/// The snapshot holds weak references so a completed-and-dropped work item
/// is not kept alive by a later barrier; prior failures are re-raised here,
/// failing the barrier itself.
pub(crate) struct BarrierJob {
    pub context: Arc<Context>,
    pub prior_work: Vec<Weak<AsyncWork>>,
    pub tag: Tag,
}

impl Job for BarrierJob {
    fn run(&self) -> Result<()> {
        for weak in &self.prior_work {
            if let Some(work) = weak.upgrade() {
                work.wait()?;
            }
        }

        self.context.barrier(self.tag)
    }
}
