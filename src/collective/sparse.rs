use crate::accel::Stream;
use crate::collective::staging::{self, CompletionEvents};
use crate::error::{CohortError, Result};
use crate::tensor::{DenseTensor, SparseTensor, Tensor};
use crate::transport::Context;
use crate::types::{DataType, Device, Tag};
use crate::work::Job;
use std::sync::{Arc, Mutex, PoisonError};

const MAX_SPARSE_DIM: usize = 4;
const MAX_DENSE_DIM: usize = 4;

/// Dimensionality record exchanged before the data: four sparse sizes,
/// four dense sizes (zero-padded), and the nnz. Nine i64 values per rank,
/// carried in one flat buffer so it can travel through a fixed-size
/// allgather.
#[derive(Clone, Copy, Default)]
struct SparseMetadata {
    data: [i64; 9],
}

impl SparseMetadata {
    const DIM: usize = 9;

    fn populate(tensor: &SparseTensor) -> Result<SparseMetadata> {
        let sparse_dim = tensor.sparse_dim();
        let dense_dim = tensor.dense_dim();
        if sparse_dim > MAX_SPARSE_DIM || dense_dim > MAX_DENSE_DIM {
            return Err(CohortError::invalid_argument(
                "sparse allreduce",
                format!(
                    "supports at most {MAX_SPARSE_DIM} sparse and {MAX_DENSE_DIM} dense dimensions"
                ),
            ));
        }

        let mut data = [0i64; Self::DIM];
        for (i, &size) in tensor.shape()[..sparse_dim].iter().enumerate() {
            data[i] = size as i64;
        }
        for (i, &size) in tensor.dense_shape().iter().enumerate() {
            data[MAX_SPARSE_DIM + i] = size as i64;
        }
        data[8] = tensor.nnz() as i64;
        Ok(SparseMetadata { data })
    }

    fn from_row(row: &[i64]) -> SparseMetadata {
        let mut data = [0i64; Self::DIM];
        data.copy_from_slice(row);
        SparseMetadata { data }
    }

    /// Reconstructed sparse-then-dense sizes, stopping at the zero padding.
    fn sizes(&self) -> Vec<i64> {
        let mut sizes = Vec::new();
        for &v in &self.data[..MAX_SPARSE_DIM] {
            if v <= 0 {
                break;
            }
            sizes.push(v);
        }
        for &v in &self.data[MAX_SPARSE_DIM..MAX_SPARSE_DIM + MAX_DENSE_DIM] {
            if v <= 0 {
                break;
            }
            sizes.push(v);
        }
        sizes
    }

    fn nnz(&self) -> i64 {
        self.data[8]
    }
}

/// Sparse allreduce (SUM), implemented with three fixed-size allgathers:
/// metadata, indices padded to the largest nnz, and values padded the same
/// way. Every rank reconstructs each peer's tensor, sums them locally, and
/// coalesces the result. Everyone pays `O(size * max_nnz)` because the
/// transport offers allgather, not allgatherv.
pub(crate) fn allreduce_sparse(context: &Context, inputs: &[Tensor], tag: Tag) -> Result<Tensor> {
    let mut input = inputs[0].sparse()?.clone();
    for tensor in &inputs[1..] {
        input = input.add(tensor.sparse()?)?;
    }
    let input = input.coalesce()?;

    let metadata = allgather_metadata(context, &input, tag)?;

    // Every peer must agree on dimensionality before any data moves.
    let expected = metadata[context.rank as usize].sizes();
    for (i, meta) in metadata.iter().enumerate() {
        if i == context.rank as usize {
            continue;
        }
        let actual = meta.sizes();
        if actual != expected {
            return Err(CohortError::DimensionMismatch {
                rank: i as u32,
                expected,
                actual,
            });
        }
    }

    let indices = allgather_indices(context, &input, &metadata, tag)?;
    let values = allgather_values(context, &input, &metadata, tag)?;

    let shape = input.shape().to_vec();
    let mut output: Option<SparseTensor> = None;
    for (idx, val) in indices.into_iter().zip(values) {
        let peer = SparseTensor::new(idx, val, shape.clone())?;
        output = Some(match output {
            None => peer,
            Some(acc) => acc.add(&peer)?,
        });
    }
    let output = output
        .expect("context size is positive")
        .coalesce()?;

    Ok(Tensor::from_sparse(output))
}

fn allgather_metadata(
    context: &Context,
    input: &SparseTensor,
    tag: Tag,
) -> Result<Vec<SparseMetadata>> {
    let own = SparseMetadata::populate(input)?;
    let mut chunk = vec![0u8; SparseMetadata::DIM * 8];
    for (i, v) in own.data.iter().enumerate() {
        chunk[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
    }

    let mut flat = vec![0u8; chunk.len() * context.size as usize];
    context.allgather(tag, &chunk, &mut flat)?;

    let metadata = (0..context.size as usize)
        .map(|r| {
            let row: Vec<i64> = (0..SparseMetadata::DIM)
                .map(|i| {
                    let off = (r * SparseMetadata::DIM + i) * 8;
                    i64::from_le_bytes(flat[off..off + 8].try_into().expect("8-byte row entry"))
                })
                .collect();
            SparseMetadata::from_row(&row)
        })
        .collect();
    Ok(metadata)
}

fn max_nnz(metadata: &[SparseMetadata]) -> usize {
    metadata.iter().map(|m| m.nnz()).max().unwrap_or(0) as usize
}

/// Exchange indices padded to `[sparse_dim, max_nnz]` per rank, then slice
/// each peer's actual `[sparse_dim, nnz_i]` back out.
fn allgather_indices(
    context: &Context,
    input: &SparseTensor,
    metadata: &[SparseMetadata],
    tag: Tag,
) -> Result<Vec<DenseTensor>> {
    let sparse_dim = input.sparse_dim();
    let nnz = input.nnz();
    let padded = max_nnz(metadata);

    let own = input.indices().to_vec::<i64>()?;
    let mut chunk = vec![0u8; sparse_dim * padded * 8];
    for d in 0..sparse_dim {
        for j in 0..nnz {
            let off = (d * padded + j) * 8;
            chunk[off..off + 8].copy_from_slice(&own[d * nnz + j].to_le_bytes());
        }
    }

    let mut flat = vec![0u8; chunk.len() * context.size as usize];
    context.allgather(tag, &chunk, &mut flat)?;

    let mut result = Vec::with_capacity(metadata.len());
    for (r, meta) in metadata.iter().enumerate() {
        let nnz_r = meta.nnz() as usize;
        let mut idx = vec![0i64; sparse_dim * nnz_r];
        for d in 0..sparse_dim {
            for j in 0..nnz_r {
                let off = ((r * sparse_dim + d) * padded + j) * 8;
                idx[d * nnz_r + j] =
                    i64::from_le_bytes(flat[off..off + 8].try_into().expect("8-byte index"));
            }
        }
        result.push(
            Tensor::from_vec(&idx, &[sparse_dim, nnz_r])
                .dense()?
                .clone(),
        );
    }
    Ok(result)
}

/// Exchange values padded to `[max_nnz, dense_shape...]` per rank.
fn allgather_values(
    context: &Context,
    input: &SparseTensor,
    metadata: &[SparseMetadata],
    tag: Tag,
) -> Result<Vec<DenseTensor>> {
    let padded = max_nnz(metadata);
    let row = input.dense_numel() * input.dtype().size_in_bytes();

    let own = input.values().read_bytes();
    let mut chunk = vec![0u8; padded * row];
    chunk[..own.len()].copy_from_slice(&own);

    let mut flat = vec![0u8; chunk.len() * context.size as usize];
    context.allgather(tag, &chunk, &mut flat)?;

    let mut result = Vec::with_capacity(metadata.len());
    for (r, meta) in metadata.iter().enumerate() {
        let nnz_r = meta.nnz() as usize;
        let mut shape = vec![nnz_r];
        shape.extend_from_slice(input.dense_shape());
        let values = DenseTensor::zeros(input.dtype(), &shape, Device::Cpu);
        let start = r * chunk.len();
        values.write_bytes(&flat[start..start + nnz_r * row])?;
        result.push(values);
    }
    Ok(result)
}

/// Sparse allreduce job. Publishes one deep clone of the coalesced result
/// per original input through `result()`.
pub(crate) struct SparseAllreduceJob {
    pub context: Arc<Context>,
    pub inputs: Vec<Tensor>,
    pub outputs: Mutex<Vec<Tensor>>,
    pub tag: Tag,
}

impl SparseAllreduceJob {
    pub(crate) fn new(context: Arc<Context>, inputs: Vec<Tensor>, tag: Tag) -> SparseAllreduceJob {
        SparseAllreduceJob {
            context,
            inputs,
            outputs: Mutex::new(Vec::new()),
            tag,
        }
    }
}

impl Job for SparseAllreduceJob {
    fn run(&self) -> Result<()> {
        let output = allreduce_sparse(&self.context, &self.inputs, self.tag)?;

        let outputs: Vec<Tensor> = self.inputs.iter().map(|_| output.deep_clone()).collect();
        *self
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = outputs;
        Ok(())
    }

    fn result(&self) -> Option<Vec<Tensor>> {
        Some(
            self.outputs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        )
    }
}

/// Accelerator variant. Coalescing and the device-to-host copy both happen
/// on the side stream, so the caller is never blocked on them; results are
/// copied back onto each input's device asynchronously.
pub(crate) struct StagedSparseAllreduceJob {
    context: Arc<Context>,
    inputs: Vec<Tensor>,
    outputs: Mutex<Vec<Tensor>>,
    tag: Tag,
    streams: Vec<Stream>,
    staged: Arc<Mutex<Vec<Option<Tensor>>>>,
    events: CompletionEvents,
}

impl StagedSparseAllreduceJob {
    pub(crate) fn new(
        context: Arc<Context>,
        inputs: Vec<Tensor>,
        tag: Tag,
    ) -> Result<StagedSparseAllreduceJob> {
        let streams = staging::init_streams(&inputs);
        let staged = Arc::new(Mutex::new(vec![None; inputs.len()]));

        for (i, tensor) in inputs.iter().enumerate() {
            let sparse = tensor.sparse()?.clone();
            let slot = Arc::clone(&staged);
            streams[i].enqueue(move || match sparse.coalesce() {
                Ok(coalesced) => {
                    let host = coalesced.deep_clone_on(Device::Cpu);
                    slot.lock().unwrap_or_else(PoisonError::into_inner)[i] =
                        Some(Tensor::from_sparse(host));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "sparse stage-in failed");
                }
            });
        }

        Ok(StagedSparseAllreduceJob {
            context,
            inputs,
            outputs: Mutex::new(Vec::new()),
            tag,
            streams,
            staged,
            events: CompletionEvents::default(),
        })
    }
}

impl Job for StagedSparseAllreduceJob {
    fn run(&self) -> Result<()> {
        for stream in &self.streams {
            stream.synchronize();
        }

        let staged: Vec<Tensor> = self
            .staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                CohortError::invalid_argument("sparse allreduce", "stage-in failed on a side stream")
            })?;

        let output = allreduce_sparse(&self.context, &staged, self.tag)?;
        let result = output.sparse()?;

        let mut outputs = Vec::with_capacity(self.inputs.len());
        for (i, tensor) in self.inputs.iter().enumerate() {
            let device = tensor.device();
            let indices = DenseTensor::zeros(DataType::I64, result.indices().shape(), device);
            let values = DenseTensor::zeros(result.dtype(), result.values().shape(), device);
            staging::copy_async(&indices, result.indices(), &self.streams[i]);
            staging::copy_async(&values, result.values(), &self.streams[i]);
            staging::record_completion(&self.events, tensor, &self.streams[i]);

            let device_result = SparseTensor::new(indices, values, result.shape().to_vec())?
                .assume_coalesced();
            outputs.push(Tensor::from_sparse(device_result));
        }

        *self
            .outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = outputs;
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        staging::block_current_streams(&self.events);
        Ok(())
    }

    fn result(&self) -> Option<Vec<Tensor>> {
        Some(
            self.outputs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sparse(indices: &[i64], values: &[f32], dim: usize) -> SparseTensor {
        let idx = Tensor::from_vec(indices, &[1, indices.len()]);
        let val = Tensor::from_vec(values, &[values.len()]);
        Tensor::sparse_coo(&idx, &val, &[dim])
            .unwrap()
            .sparse()
            .unwrap()
            .clone()
    }

    #[test]
    fn test_metadata_roundtrip() {
        let t = sparse(&[0, 2], &[1.0, 3.0], 4);
        let meta = SparseMetadata::populate(&t).unwrap();
        assert_eq!(meta.nnz(), 2);
        assert_eq!(meta.sizes(), vec![4]);

        let rebuilt = SparseMetadata::from_row(&meta.data);
        assert_eq!(rebuilt.sizes(), vec![4]);
        assert_eq!(rebuilt.nnz(), 2);
    }

    #[test]
    fn test_metadata_rejects_deep_tensors() {
        let idx = Tensor::from_vec(&[0i64, 0, 0, 0, 0], &[5, 1]);
        let val = Tensor::from_vec(&[1.0f32], &[1]);
        let t = Tensor::sparse_coo(&idx, &val, &[2, 2, 2, 2, 2]).unwrap();
        assert!(SparseMetadata::populate(t.sparse().unwrap()).is_err());
    }

    #[test]
    fn test_metadata_dense_dims() {
        let idx = Tensor::from_vec(&[1i64], &[1, 1]);
        let val = Tensor::from_vec(&[1.0f32, 2.0], &[1, 2]);
        let t = Tensor::sparse_coo(&idx, &val, &[3, 2]).unwrap();
        let meta = SparseMetadata::populate(t.sparse().unwrap()).unwrap();
        assert_eq!(meta.sizes(), vec![3, 2]);
    }
}
