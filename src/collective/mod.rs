//! Collective job implementations consumed by the dispatch engine.
//!
//! Each collective has a host job and a staged accelerator variant; the
//! facade picks one based on where the first tensor lives.

mod allgather;
mod allreduce;
mod barrier;
mod broadcast;
mod gather;
mod reduce;
mod scatter;
mod sparse;
mod staging;
pub(crate) mod validate;

pub(crate) use allgather::{AllgatherJob, StagedAllgatherJob};
pub(crate) use allreduce::{AllreduceCoalescedJob, AllreduceJob, StagedAllreduceJob};
pub(crate) use barrier::BarrierJob;
pub(crate) use broadcast::{BroadcastJob, StagedBroadcastJob};
pub(crate) use gather::{GatherJob, StagedGatherJob};
pub(crate) use reduce::{ReduceJob, StagedReduceJob};
pub(crate) use scatter::{ScatterJob, StagedScatterJob};
pub(crate) use sparse::{SparseAllreduceJob, StagedSparseAllreduceJob};
