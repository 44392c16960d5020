use crate::error::{CohortError, Result};
use crate::reduce::reduce_slice;
use crate::store::Store;
use crate::tensor::Tensor;
use crate::transport::device::{MeshDevice, Slot};
use crate::transport::unbound::UnboundBuffer;
use crate::types::{DataType, Rank, ReduceOp, Tag};
use std::sync::Arc;
use std::time::Duration;

/// Integer ceiling of log2(n). Returns 0 for n <= 1.
pub(crate) fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        return 0;
    }
    u32::BITS - (n - 1).leading_zeros()
}

/// Chunk partition layout for ring-based collectives.
///
/// Divides `count` elements among `world` ranks, distributing remainder
/// elements to the first `remainder` ranks (one extra element each).
pub(crate) struct ChunkLayout {
    pub offsets: Vec<usize>,
    pub base_chunk: usize,
    pub remainder: usize,
}

impl ChunkLayout {
    pub fn new(count: usize, world: usize) -> Self {
        let base_chunk = count / world;
        let remainder = count % world;

        let offsets: Vec<usize> = (0..world)
            .scan(0usize, |acc, i| {
                let off = *acc;
                *acc += if i < remainder {
                    base_chunk + 1
                } else {
                    base_chunk
                };
                Some(off)
            })
            .collect();

        Self {
            offsets,
            base_chunk,
            remainder,
        }
    }

    pub fn chunk_count(&self, i: usize) -> usize {
        if i < self.remainder {
            self.base_chunk + 1
        } else {
            self.base_chunk
        }
    }
}

/// One fully-connected transport attachment for a fixed `(rank, size)`.
///
/// A process group holds several contexts and routes each collective onto
/// one of them by tag; every context also serves tagged point-to-point
/// traffic through [`UnboundBuffer`]s.
pub struct Context {
    pub rank: Rank,
    pub size: u32,
    timeout: Duration,
    device: Arc<MeshDevice>,
    comm_id: u64,
}

impl Context {
    /// Rendezvous through the store and attach to the device's comm.
    ///
    /// Rank 0 allocates the comm and publishes its id; every rank then
    /// attaches, announces itself, and waits until the whole mesh has
    /// arrived.
    pub fn connect_full_mesh(
        store: &dyn Store,
        device: Arc<MeshDevice>,
        rank: Rank,
        size: u32,
        timeout: Duration,
    ) -> Result<Arc<Context>> {
        if size == 0 {
            return Err(CohortError::invalid_argument(
                "connect_full_mesh",
                "size must be positive",
            ));
        }
        if rank >= size {
            return Err(CohortError::InvalidRank {
                rank,
                world_size: size,
            });
        }

        if rank == 0 {
            let comm_id = device.create_comm(size);
            store.set("comm", comm_id.to_le_bytes().to_vec())?;
        }
        store.wait_timeout(&["comm".to_owned()], timeout)?;
        let raw = store.get("comm")?;
        let comm_id = u64::from_le_bytes(raw.as_slice().try_into().map_err(|_| {
            CohortError::invalid_argument("connect_full_mesh", "malformed comm id in store")
        })?);

        device.attach(comm_id, rank, size)?;
        store.set(&format!("attached/{rank}"), vec![1])?;
        let keys: Vec<String> = (0..size).map(|r| format!("attached/{r}")).collect();
        store.wait_timeout(&keys, timeout)?;

        tracing::debug!(rank, size, comm_id, "connected full mesh");

        Ok(Arc::new(Context {
            rank,
            size,
            timeout,
            device,
            comm_id,
        }))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Point-to-point buffer over a contiguous dense tensor.
    pub fn create_unbound_buffer(self: &Arc<Self>, tensor: &Tensor) -> Result<UnboundBuffer> {
        UnboundBuffer::new(Arc::clone(self), tensor)
    }

    pub(crate) fn send_slot(
        &self,
        dst: Rank,
        slot: Slot,
        data: &[u8],
        operation: &'static str,
    ) -> Result<()> {
        self.device
            .post(self.comm_id, self.rank, dst, slot, data.to_vec())
            .map_err(|e| CohortError::CollectiveFailed {
                operation,
                rank: dst,
                reason: e.to_string(),
            })
    }

    pub(crate) fn recv_slot(
        &self,
        srcs: &[Rank],
        slot: Slot,
        operation: &'static str,
    ) -> Result<(Rank, Vec<u8>)> {
        self.device
            .match_recv(self.comm_id, self.rank, srcs, slot, self.timeout, operation)
    }

    fn send_to(&self, dst: Rank, slot: Slot, data: &[u8], operation: &'static str) -> Result<()> {
        self.send_slot(dst, slot, data, operation)
    }

    fn recv_from(
        &self,
        src: Rank,
        slot: Slot,
        operation: &'static str,
        expected: usize,
    ) -> Result<Vec<u8>> {
        let (_, data) = self.recv_slot(&[src], slot, operation)?;
        if data.len() != expected {
            return Err(CohortError::BufferSizeMismatch {
                expected,
                actual: data.len(),
            });
        }
        Ok(data)
    }

    /// Tree broadcast from `root`: each rank receives from its parent in a
    /// binary tree (remapped so the root is logical rank 0), then forwards
    /// to its children.
    pub fn broadcast(&self, tag: Tag, root: Rank, buf: &mut [u8]) -> Result<()> {
        let world = self.size as usize;
        if world <= 1 {
            return Ok(());
        }
        self.check_rank(root)?;

        let slot = Slot::Collective(tag);
        let rank = self.rank as usize;
        let root = root as usize;
        let logical = |r: usize| (r + world - root) % world;
        let physical = |l: usize| (l + root) % world;
        let my_logical = logical(rank);

        if my_logical != 0 {
            let parent = physical((my_logical - 1) / 2);
            let data = self.recv_from(parent as Rank, slot, "broadcast", buf.len())?;
            buf.copy_from_slice(&data);
        }

        for child in [2 * my_logical + 1, 2 * my_logical + 2] {
            if child < world {
                self.send_to(physical(child) as Rank, slot, buf, "broadcast")?;
            }
        }
        Ok(())
    }

    /// Ring allreduce, in place.
    ///
    /// Phase 1 (scatter-reduce): N-1 rounds, each rank forwards one chunk
    /// to its successor and folds the chunk received from its predecessor.
    /// Phase 2 (allgather): N-1 rounds circulating the fully reduced
    /// chunks. Every chunk is folded in the same ring order on all ranks,
    /// so results are bitwise identical everywhere.
    pub fn allreduce(
        &self,
        tag: Tag,
        buf: &mut [u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let elem_size = dtype.size_in_bytes();
        if buf.len() != count * elem_size {
            return Err(CohortError::BufferSizeMismatch {
                expected: count * elem_size,
                actual: buf.len(),
            });
        }
        let world = self.size as usize;
        if world <= 1 {
            return Ok(());
        }

        let slot = Slot::Collective(tag);
        let rank = self.rank as usize;
        let layout = ChunkLayout::new(count, world);
        let next = ((rank + 1) % world) as Rank;
        let prev = ((rank + world - 1) % world) as Rank;

        for step in 0..(world - 1) {
            let send_idx = (rank + world - step) % world;
            let send_off = layout.offsets[send_idx] * elem_size;
            let send_len = layout.chunk_count(send_idx) * elem_size;

            let recv_idx = (rank + world - step - 1) % world;
            let recv_off = layout.offsets[recv_idx] * elem_size;
            let recv_count = layout.chunk_count(recv_idx);
            let recv_len = recv_count * elem_size;

            self.send_to(next, slot, &buf[send_off..send_off + send_len], "allreduce")?;
            let received = self.recv_from(prev, slot, "allreduce", recv_len)?;
            reduce_slice(
                &mut buf[recv_off..recv_off + recv_len],
                &received,
                recv_count,
                dtype,
                op,
            );
        }

        for step in 0..(world - 1) {
            let send_idx = (rank + world + 1 - step) % world;
            let send_off = layout.offsets[send_idx] * elem_size;
            let send_len = layout.chunk_count(send_idx) * elem_size;

            let recv_idx = (rank + world - step) % world;
            let recv_off = layout.offsets[recv_idx] * elem_size;
            let recv_len = layout.chunk_count(recv_idx) * elem_size;

            self.send_to(next, slot, &buf[send_off..send_off + send_len], "allreduce")?;
            let received = self.recv_from(prev, slot, "allreduce", recv_len)?;
            buf[recv_off..recv_off + recv_len].copy_from_slice(&received);
        }

        Ok(())
    }

    /// Binomial tree reduce onto `root`. Only the root's buffer receives
    /// the result; other ranks' buffers are left untouched.
    ///
    /// Non-power-of-two worlds first fold the excess ranks into the lower
    /// power-of-two range, then run log2 rounds over that range.
    pub fn reduce(
        &self,
        tag: Tag,
        root: Rank,
        buf: &mut [u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        let elem_size = dtype.size_in_bytes();
        if buf.len() != count * elem_size {
            return Err(CohortError::BufferSizeMismatch {
                expected: count * elem_size,
                actual: buf.len(),
            });
        }
        let world = self.size as usize;
        if world <= 1 {
            return Ok(());
        }
        self.check_rank(root)?;

        let slot = Slot::Collective(tag);
        let rank = self.rank as usize;
        let root = root as usize;
        let vrank = (rank + world - root) % world;
        let physical = |v: usize| ((v + root) % world) as Rank;

        let p2 = if world.is_power_of_two() {
            world
        } else {
            world.next_power_of_two() >> 1
        };
        let excess = world - p2;

        // Accumulate in a scratch copy so non-root callers keep their input.
        let mut scratch = buf.to_vec();

        let mut participating = true;
        if vrank < excess {
            let received = self.recv_from(physical(vrank + p2), slot, "reduce", scratch.len())?;
            reduce_slice(&mut scratch, &received, count, dtype, op);
        } else if vrank >= p2 {
            self.send_to(physical(vrank - p2), slot, &scratch, "reduce")?;
            participating = false;
        }

        if participating {
            let log2 = p2.trailing_zeros() as usize;
            for round in 0..log2 {
                let mask = 1usize << round;
                let partner = vrank ^ mask;
                if vrank & mask != 0 {
                    self.send_to(physical(partner), slot, &scratch, "reduce")?;
                    break;
                } else if partner < p2 {
                    let received = self.recv_from(physical(partner), slot, "reduce", scratch.len())?;
                    reduce_slice(&mut scratch, &received, count, dtype, op);
                }
            }
        }

        if rank == root {
            buf.copy_from_slice(&scratch);
        }
        Ok(())
    }

    /// Ring allgather: each rank contributes `input`, `output` receives all
    /// contributions concatenated in rank order.
    pub fn allgather(&self, tag: Tag, input: &[u8], output: &mut [u8]) -> Result<()> {
        let world = self.size as usize;
        let chunk = input.len();
        if output.len() != chunk * world {
            return Err(CohortError::BufferSizeMismatch {
                expected: chunk * world,
                actual: output.len(),
            });
        }
        if world <= 1 {
            output.copy_from_slice(input);
            return Ok(());
        }

        let slot = Slot::Collective(tag);
        let rank = self.rank as usize;
        output[rank * chunk..(rank + 1) * chunk].copy_from_slice(input);

        let next = ((rank + 1) % world) as Rank;
        let prev = ((rank + world - 1) % world) as Rank;

        for step in 0..(world - 1) {
            let send_idx = (rank + world - step) % world;
            let recv_idx = (rank + world - step - 1) % world;

            self.send_to(
                next,
                slot,
                &output[send_idx * chunk..(send_idx + 1) * chunk],
                "allgather",
            )?;
            let received = self.recv_from(prev, slot, "allgather", chunk)?;
            output[recv_idx * chunk..(recv_idx + 1) * chunk].copy_from_slice(&received);
        }

        Ok(())
    }

    /// Flat gather: the root collects each rank's `input` into `output`,
    /// ordered by rank. `output` is required on the root and ignored
    /// elsewhere.
    pub fn gather(
        &self,
        tag: Tag,
        root: Rank,
        input: &[u8],
        output: Option<&mut [u8]>,
    ) -> Result<()> {
        let world = self.size as usize;
        self.check_rank(root)?;
        let slot = Slot::Collective(tag);
        let chunk = input.len();

        if self.rank == root {
            let output = output.ok_or_else(|| {
                CohortError::invalid_argument("gather", "root rank requires an output buffer")
            })?;
            if output.len() != chunk * world {
                return Err(CohortError::BufferSizeMismatch {
                    expected: chunk * world,
                    actual: output.len(),
                });
            }
            let root_idx = root as usize;
            output[root_idx * chunk..(root_idx + 1) * chunk].copy_from_slice(input);
            for r in 0..self.size {
                if r == root {
                    continue;
                }
                let received = self.recv_from(r, slot, "gather", chunk)?;
                let r = r as usize;
                output[r * chunk..(r + 1) * chunk].copy_from_slice(&received);
            }
        } else {
            self.send_to(root, slot, input, "gather")?;
        }
        Ok(())
    }

    /// Flat scatter: the root sends `inputs[r]` to rank `r`; every rank's
    /// `output` receives its chunk. `inputs` is ignored off-root.
    pub fn scatter(
        &self,
        tag: Tag,
        root: Rank,
        inputs: &[Vec<u8>],
        output: &mut [u8],
    ) -> Result<()> {
        let world = self.size as usize;
        self.check_rank(root)?;
        let slot = Slot::Collective(tag);

        if self.rank == root {
            if inputs.len() != world {
                return Err(CohortError::invalid_argument(
                    "scatter",
                    format!("root requires {world} inputs, got {}", inputs.len()),
                ));
            }
            for (r, data) in inputs.iter().enumerate() {
                if data.len() != output.len() {
                    return Err(CohortError::BufferSizeMismatch {
                        expected: output.len(),
                        actual: data.len(),
                    });
                }
                if r as Rank == root {
                    continue;
                }
                self.send_to(r as Rank, slot, data, "scatter")?;
            }
            output.copy_from_slice(&inputs[root as usize]);
        } else {
            let received = self.recv_from(root, slot, "scatter", output.len())?;
            output.copy_from_slice(&received);
        }
        Ok(())
    }

    /// Dissemination barrier: ceil(log2(N)) rounds of token exchange at
    /// doubling distances.
    pub fn barrier(&self, tag: Tag) -> Result<()> {
        let world = self.size as usize;
        if world <= 1 {
            return Ok(());
        }
        let slot = Slot::Collective(tag);
        let rank = self.rank as usize;

        for round in 0..ceil_log2(self.size) {
            let dist = 1usize << round;
            let to = ((rank + dist) % world) as Rank;
            let from = ((rank + world - dist) % world) as Rank;
            self.send_to(to, slot, &[], "barrier")?;
            self.recv_from(from, slot, "barrier", 0)?;
        }
        Ok(())
    }

    fn check_rank(&self, rank: Rank) -> Result<()> {
        if rank >= self.size {
            return Err(CohortError::InvalidRank {
                rank,
                world_size: self.size,
            });
        }
        Ok(())
    }
}
