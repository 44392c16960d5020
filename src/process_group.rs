//! The process-group facade and its work-dispatch engine.
//!
//! A fixed set of peer processes (ranks `0..size`) shares a store for
//! rendezvous and one transport context per configured device. Every
//! collective entrypoint validates its arguments, allocates a tag from the
//! monotonic collective counter, routes onto `contexts[tag % contexts]`,
//! and queues a job for the worker pool. Callers block on the returned
//! work handle.
//!
//! Ranks must issue collectives in the same order: tags are agreed upon
//! implicitly through issue order, and nothing re-serializes jobs that
//! landed on different workers.

use crate::collective::validate::{
    assert_dense, assert_layout_match, assert_non_empty, assert_root_rank, assert_root_tensor,
    assert_same_device, assert_single_element, assert_type_and_sizes_match, check_single_tensor,
};
use crate::collective::{
    AllgatherJob, AllreduceCoalescedJob, AllreduceJob, BarrierJob, BroadcastJob, GatherJob,
    ReduceJob, ScatterJob, SparseAllreduceJob, StagedAllgatherJob, StagedAllreduceJob,
    StagedBroadcastJob, StagedGatherJob, StagedReduceJob, StagedScatterJob,
    StagedSparseAllreduceJob,
};
use crate::config::GroupOptions;
use crate::error::{CohortError, Result};
use crate::store::{PrefixStore, Store};
use crate::tensor::Tensor;
use crate::transport::Context;
use crate::types::{Device, Layout, Rank, ReduceOp, Tag};
use crate::work::{AsyncWork, Job, RecvWork, SendWork, Work};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    pub root_rank: Rank,
    pub root_tensor: usize,
}

#[derive(Debug, Clone)]
pub struct AllreduceOptions {
    pub op: ReduceOp,
}

impl Default for AllreduceOptions {
    fn default() -> Self {
        Self { op: ReduceOp::Sum }
    }
}

#[derive(Debug, Clone)]
pub struct AllreduceCoalescedOptions {
    pub op: ReduceOp,
}

impl Default for AllreduceCoalescedOptions {
    fn default() -> Self {
        Self { op: ReduceOp::Sum }
    }
}

#[derive(Debug, Clone)]
pub struct ReduceOptions {
    pub root_rank: Rank,
    pub root_tensor: usize,
    pub op: ReduceOp,
}

impl Default for ReduceOptions {
    fn default() -> Self {
        Self {
            root_rank: 0,
            root_tensor: 0,
            op: ReduceOp::Sum,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GatherOptions {
    pub root_rank: Rank,
}

#[derive(Debug, Clone, Default)]
pub struct ScatterOptions {
    pub root_rank: Rank,
}

struct EngineState {
    queue: VecDeque<Arc<AsyncWork>>,
    in_progress: Vec<Option<Arc<AsyncWork>>>,
    stop: bool,
}

struct EngineShared {
    state: Mutex<EngineState>,
    produce: Condvar,
    consume: Condvar,
}

impl EngineShared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run_loop(shared: &EngineShared, index: usize) {
    let mut state = shared.lock();
    while !state.stop {
        if state.queue.is_empty() {
            state = shared
                .produce
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        }

        let work = state.queue.pop_front().expect("queue is non-empty");
        state.in_progress[index] = Some(Arc::clone(&work));
        drop(state);

        // Notify after releasing the lock so the waiter does not
        // immediately block on it.
        shared.consume.notify_one();

        AsyncWork::execute(&work);

        state = shared.lock();
        state.in_progress[index] = None;
    }
    tracing::trace!(worker = index, "worker stopped");
}

/// The collective-communication process group.
///
/// Immutable after construction. Dropping it drains pending work, stops
/// the workers, and joins them; in-flight jobs are never interrupted.
pub struct ProcessGroup {
    rank: Rank,
    size: u32,
    contexts: Vec<Arc<Context>>,
    shared: Arc<EngineShared>,
    workers: Vec<thread::JoinHandle<()>>,
    collective_counter: AtomicU64,
}

impl std::fmt::Debug for ProcessGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl ProcessGroup {
    /// Connect a context for every configured device (rendezvousing
    /// through the store, with keys prefixed per context index) and start
    /// the worker pool.
    pub fn new(
        store: Arc<dyn Store>,
        rank: Rank,
        size: u32,
        options: GroupOptions,
    ) -> Result<ProcessGroup> {
        if size == 0 {
            return Err(CohortError::invalid_argument(
                "process group",
                "size must be positive",
            ));
        }
        if rank >= size {
            return Err(CohortError::InvalidRank {
                rank,
                world_size: size,
            });
        }
        if options.devices.is_empty() {
            return Err(CohortError::invalid_argument(
                "process group",
                "no device(s) specified",
            ));
        }
        if options.threads == 0 {
            return Err(CohortError::invalid_argument(
                "process group",
                "requires at least one worker thread",
            ));
        }

        // The same device may appear multiple times; each entry still gets
        // an independent context and rendezvous namespace.
        let mut contexts = Vec::with_capacity(options.devices.len());
        for (i, device) in options.devices.iter().enumerate() {
            let prefixed = PrefixStore::new(i.to_string(), Arc::clone(&store));
            contexts.push(Context::connect_full_mesh(
                &prefixed,
                Arc::clone(device),
                rank,
                size,
                options.timeout,
            )?);
        }

        let shared = Arc::new(EngineShared {
            state: Mutex::new(EngineState {
                queue: VecDeque::new(),
                in_progress: vec![None; options.threads],
                stop: false,
            }),
            produce: Condvar::new(),
            consume: Condvar::new(),
        });

        let workers = (0..options.threads)
            .map(|i| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("cohort-worker-{i}"))
                    .spawn(move || run_loop(&shared, i))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        tracing::debug!(
            rank,
            size,
            contexts = contexts.len(),
            threads = options.threads,
            "process group ready"
        );

        Ok(ProcessGroup {
            rank,
            size,
            contexts,
            shared,
            workers,
            collective_counter: AtomicU64::new(0),
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Strictly monotonic across the whole process. Never called before
    /// validation succeeds, so a rejected entrypoint cannot desynchronize
    /// tags across ranks.
    fn next_tag(&self) -> Tag {
        self.collective_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn context_for(&self, tag: Tag) -> Arc<Context> {
        Arc::clone(&self.contexts[(tag % self.contexts.len() as u64) as usize])
    }

    fn enqueue(&self, work: Arc<AsyncWork>) {
        let mut state = self.shared.lock();
        state.queue.push_back(work);
        drop(state);
        self.shared.produce.notify_one();
    }

    fn submit(&self, job: Box<dyn Job>) -> Arc<dyn Work> {
        let work = AsyncWork::new(job);
        self.enqueue(Arc::clone(&work));
        work
    }

    pub fn broadcast(
        &self,
        inputs: Vec<Tensor>,
        opts: BroadcastOptions,
    ) -> Result<Arc<dyn Work>> {
        const OP: &str = "broadcast";
        assert_root_rank(OP, opts.root_rank, self.size)?;
        assert_root_tensor(OP, opts.root_tensor, inputs.len())?;
        assert_dense(OP, &inputs)?;
        assert_same_device(OP, &inputs)?;
        assert_type_and_sizes_match(OP, &inputs, inputs[0].dtype(), &inputs[0].shape().to_vec())?;

        let tag = self.next_tag();
        let context = self.context_for(tag);
        let job: Box<dyn Job> = match inputs[0].device() {
            Device::Cpu => Box::new(BroadcastJob {
                context,
                inputs,
                root_rank: opts.root_rank,
                root_tensor: opts.root_tensor,
                tag,
            }),
            Device::Accel(_) => Box::new(StagedBroadcastJob::new(
                context,
                inputs,
                opts.root_rank,
                opts.root_tensor,
                tag,
            )?),
        };
        Ok(self.submit(job))
    }

    pub fn allreduce(
        &self,
        inputs: Vec<Tensor>,
        opts: AllreduceOptions,
    ) -> Result<Arc<dyn Work>> {
        const OP: &str = "allreduce";
        assert_non_empty(OP, &inputs)?;
        assert_layout_match(OP, &inputs)?;
        assert_same_device(OP, &inputs)?;
        assert_type_and_sizes_match(OP, &inputs, inputs[0].dtype(), &inputs[0].shape().to_vec())?;

        let layout = inputs[0].layout();
        if layout == Layout::Sparse && opts.op != ReduceOp::Sum {
            return Err(CohortError::invalid_argument(
                OP,
                "unsupported reduction operation (allreduce of sparse tensors only works with sum)",
            ));
        }

        let tag = self.next_tag();
        let context = self.context_for(tag);
        let job: Box<dyn Job> = match (inputs[0].device(), layout) {
            (Device::Cpu, Layout::Strided) => Box::new(AllreduceJob {
                context,
                inputs,
                op: opts.op,
                tag,
            }),
            (Device::Cpu, Layout::Sparse) => {
                Box::new(SparseAllreduceJob::new(context, inputs, tag))
            }
            (Device::Accel(_), Layout::Strided) => {
                Box::new(StagedAllreduceJob::new(context, inputs, opts.op, tag)?)
            }
            (Device::Accel(_), Layout::Sparse) => {
                Box::new(StagedSparseAllreduceJob::new(context, inputs, tag)?)
            }
        };
        Ok(self.submit(job))
    }

    pub fn allreduce_coalesced(
        &self,
        inputs: Vec<Tensor>,
        opts: AllreduceCoalescedOptions,
    ) -> Result<Arc<dyn Work>> {
        const OP: &str = "allreduce_coalesced";
        assert_non_empty(OP, &inputs)?;
        // Inputs are flattened and concatenated, so layout, type, and
        // device must agree; shapes may differ.
        assert_dense(OP, &inputs)?;
        assert_same_device(OP, &inputs)?;
        if inputs.iter().any(|t| t.dtype() != inputs[0].dtype()) {
            return Err(CohortError::invalid_argument(
                OP,
                "tensors must all have the same type",
            ));
        }
        if inputs[0].device().is_accel() {
            return Err(CohortError::invalid_argument(OP, "unsupported device type"));
        }

        let tag = self.next_tag();
        let context = self.context_for(tag);
        Ok(self.submit(Box::new(AllreduceCoalescedJob {
            context,
            inputs,
            op: opts.op,
            tag,
        })))
    }

    pub fn reduce(&self, inputs: Vec<Tensor>, opts: ReduceOptions) -> Result<Arc<dyn Work>> {
        const OP: &str = "reduce";
        assert_root_rank(OP, opts.root_rank, self.size)?;
        assert_root_tensor(OP, opts.root_tensor, inputs.len())?;
        assert_single_element(OP, &inputs)?;
        assert_dense(OP, &inputs)?;

        let tag = self.next_tag();
        let context = self.context_for(tag);
        let job: Box<dyn Job> = match inputs[0].device() {
            Device::Cpu => Box::new(ReduceJob {
                context,
                inputs,
                root_rank: opts.root_rank,
                root_tensor: opts.root_tensor,
                op: opts.op,
                tag,
            }),
            Device::Accel(_) => Box::new(StagedReduceJob::new(
                context,
                inputs,
                opts.root_rank,
                opts.root_tensor,
                opts.op,
                tag,
            )?),
        };
        Ok(self.submit(job))
    }

    pub fn allgather(
        &self,
        outputs: Vec<Vec<Tensor>>,
        inputs: Vec<Tensor>,
    ) -> Result<Arc<dyn Work>> {
        const OP: &str = "allgather";
        assert_non_empty(OP, &inputs)?;
        if inputs.len() != outputs.len() {
            return Err(CohortError::invalid_argument(
                OP,
                "requires input/output tensor lists to have the same length",
            ));
        }
        let expected = inputs.len() * self.size as usize;
        for (i, list) in outputs.iter().enumerate() {
            if list.len() != expected {
                return Err(CohortError::invalid_argument(
                    OP,
                    format!(
                        "invalid output tensor list at index {i} \
                         (expected length {expected}, got {})",
                        list.len()
                    ),
                ));
            }
        }
        assert_dense(OP, &inputs)?;
        assert_same_device(OP, &inputs)?;

        let dtype = inputs[0].dtype();
        let shape = inputs[0].shape().to_vec();
        let device = inputs[0].device();
        assert_type_and_sizes_match(OP, &inputs, dtype, &shape)?;
        for list in &outputs {
            assert_type_and_sizes_match(OP, list, dtype, &shape)?;
            self.assert_on_device(OP, device, list)?;
        }

        let tag = self.next_tag();
        let context = self.context_for(tag);
        let job: Box<dyn Job> = match device {
            Device::Cpu => Box::new(AllgatherJob {
                context,
                outputs,
                inputs,
                tag,
            }),
            Device::Accel(_) => Box::new(StagedAllgatherJob::new(context, outputs, inputs, tag)?),
        };
        Ok(self.submit(job))
    }

    pub fn gather(
        &self,
        outputs: Vec<Vec<Tensor>>,
        inputs: Vec<Tensor>,
        opts: GatherOptions,
    ) -> Result<Arc<dyn Work>> {
        const OP: &str = "gather";
        assert_root_rank(OP, opts.root_rank, self.size)?;
        assert_single_element(OP, &inputs)?;
        assert_dense(OP, &inputs)?;

        let dtype = inputs[0].dtype();
        let shape = inputs[0].shape().to_vec();
        let device = inputs[0].device();

        if self.rank == opts.root_rank {
            if outputs.len() != 1 || outputs[0].len() != self.size as usize {
                return Err(CohortError::invalid_argument(
                    OP,
                    "requires a single-element output list containing a list with <size> tensors",
                ));
            }
            assert_type_and_sizes_match(OP, &outputs[0], dtype, &shape)?;
            self.assert_on_device(OP, device, &outputs[0])?;
        } else if !outputs.is_empty() {
            return Err(CohortError::invalid_argument(
                OP,
                "requires empty output on non-root",
            ));
        }

        let tag = self.next_tag();
        let context = self.context_for(tag);
        let job: Box<dyn Job> = match device {
            Device::Cpu => Box::new(GatherJob {
                context,
                outputs,
                inputs,
                root: opts.root_rank,
                tag,
            }),
            Device::Accel(_) => Box::new(StagedGatherJob::new(
                context,
                outputs,
                inputs,
                opts.root_rank,
                tag,
            )?),
        };
        Ok(self.submit(job))
    }

    pub fn scatter(
        &self,
        outputs: Vec<Tensor>,
        inputs: Vec<Vec<Tensor>>,
        opts: ScatterOptions,
    ) -> Result<Arc<dyn Work>> {
        const OP: &str = "scatter";
        assert_root_rank(OP, opts.root_rank, self.size)?;
        assert_single_element(OP, &outputs)?;
        assert_dense(OP, &outputs)?;

        let dtype = outputs[0].dtype();
        let shape = outputs[0].shape().to_vec();
        let device = outputs[0].device();

        if self.rank == opts.root_rank {
            if inputs.len() != 1 || inputs[0].len() != self.size as usize {
                return Err(CohortError::invalid_argument(
                    OP,
                    "requires a single-element input list containing a list with <size> tensors",
                ));
            }
            assert_type_and_sizes_match(OP, &inputs[0], dtype, &shape)?;
            self.assert_on_device(OP, device, &inputs[0])?;
        } else if !inputs.is_empty() {
            return Err(CohortError::invalid_argument(
                OP,
                "requires empty input on non-root",
            ));
        }

        let tag = self.next_tag();
        let context = self.context_for(tag);
        let job: Box<dyn Job> = match device {
            Device::Cpu => Box::new(ScatterJob {
                context,
                outputs,
                inputs,
                root: opts.root_rank,
                tag,
            }),
            Device::Accel(_) => Box::new(StagedScatterJob::new(
                context,
                outputs,
                inputs,
                opts.root_rank,
                tag,
            )?),
        };
        Ok(self.submit(job))
    }

    /// Not implemented by this backend.
    pub fn reduce_scatter(
        &self,
        _outputs: Vec<Tensor>,
        _inputs: Vec<Vec<Tensor>>,
    ) -> Result<Arc<dyn Work>> {
        Err(CohortError::unsupported(
            "process group does not support reduce_scatter",
        ))
    }

    /// Tagged point-to-point send of a single contiguous dense tensor. The
    /// user-supplied tag also routes the operation onto a context.
    pub fn send(&self, tensors: Vec<Tensor>, dst: Rank, tag: Tag) -> Result<Arc<dyn Work>> {
        let tensor = check_single_tensor("send", &tensors)?.clone();
        if dst >= self.size {
            return Err(CohortError::InvalidRank {
                rank: dst,
                world_size: self.size,
            });
        }

        let context = self.context_for(tag);
        let buffer = context.create_unbound_buffer(&tensor)?;
        buffer.send(dst, tag)?;

        // The work captures the tensor to keep its memory live and the
        // buffer to synchronize on completion.
        Ok(Arc::new(SendWork::new(tensor, buffer)))
    }

    pub fn recv(&self, tensors: Vec<Tensor>, src: Rank, tag: Tag) -> Result<Arc<dyn Work>> {
        let tensor = check_single_tensor("recv", &tensors)?.clone();
        if src >= self.size {
            return Err(CohortError::InvalidRank {
                rank: src,
                world_size: self.size,
            });
        }

        let context = self.context_for(tag);
        let buffer = context.create_unbound_buffer(&tensor)?;
        buffer.recv(src, tag)?;
        Ok(Arc::new(RecvWork::new(tensor, buffer)))
    }

    /// Receive from any peer; the matched source is reported through
    /// `source_rank()` after wait.
    pub fn recv_anysource(&self, tensors: Vec<Tensor>, tag: Tag) -> Result<Arc<dyn Work>> {
        let tensor = check_single_tensor("recv_anysource", &tensors)?.clone();

        let context = self.context_for(tag);
        let buffer = context.create_unbound_buffer(&tensor)?;
        buffer.recv_any((0..self.size).collect(), tag)?;
        Ok(Arc::new(RecvWork::new(tensor, buffer)))
    }

    /// Barrier over a snapshot of all currently queued and in-progress
    /// work: the barrier does not complete before everything issued ahead
    /// of it has run.
    pub fn barrier(&self) -> Result<Arc<dyn Work>> {
        let mut prior_work: Vec<Weak<AsyncWork>> = Vec::new();
        {
            let state = self.shared.lock();
            prior_work.extend(state.in_progress.iter().flatten().map(Arc::downgrade));
            prior_work.extend(state.queue.iter().map(Arc::downgrade));
        }

        let tag = self.next_tag();
        let context = self.context_for(tag);
        Ok(self.submit(Box::new(BarrierJob {
            context,
            prior_work,
            tag,
        })))
    }

    fn assert_on_device(
        &self,
        op: &'static str,
        device: Device,
        tensors: &[Tensor],
    ) -> Result<()> {
        if tensors.iter().any(|t| t.device() != device) {
            return Err(CohortError::invalid_argument(
                op,
                "tensors must all be on the same device",
            ));
        }
        Ok(())
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        while !state.queue.is_empty() {
            state = self
                .shared
                .consume
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        state.stop = true;
        drop(state);

        self.shared.produce.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        tracing::debug!(rank = self.rank, "process group stopped");
    }
}
