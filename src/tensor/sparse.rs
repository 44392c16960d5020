use crate::error::{CohortError, Result};
use crate::reduce::reduce_slice;
use crate::tensor::DenseTensor;
use crate::types::{DataType, Device, ReduceOp};

/// A COO sparse tensor: `indices` is `i64` with shape `[sparse_dim, nnz]`,
/// `values` has shape `[nnz, dense_shape...]`. The overall shape is the
/// sparse dimensions followed by the dense dimensions.
#[derive(Clone)]
pub(crate) struct SparseTensor {
    shape: Vec<usize>,
    sparse_dim: usize,
    indices: DenseTensor,
    values: DenseTensor,
    coalesced: bool,
}

impl SparseTensor {
    pub(crate) fn new(
        indices: DenseTensor,
        values: DenseTensor,
        shape: Vec<usize>,
    ) -> Result<Self> {
        let invalid = |reason: &str| CohortError::invalid_argument("sparse_coo", reason.to_owned());

        if indices.dtype() != DataType::I64 {
            return Err(invalid("indices must have dtype i64"));
        }
        if indices.shape().len() != 2 {
            return Err(invalid("indices must have shape [sparse_dim, nnz]"));
        }
        let sparse_dim = indices.shape()[0];
        let nnz = indices.shape()[1];
        if sparse_dim == 0 || sparse_dim > shape.len() {
            return Err(invalid("sparse_dim must be in [1, shape.len()]"));
        }
        if values.shape().is_empty() || values.shape()[0] != nnz {
            return Err(invalid("values must have shape [nnz, dense_shape...]"));
        }
        if sparse_dim + values.shape().len() - 1 != shape.len()
            || values.shape()[1..] != shape[sparse_dim..]
        {
            return Err(invalid("values shape does not match the dense dimensions"));
        }

        Ok(Self {
            shape,
            sparse_dim,
            indices,
            values,
            coalesced: false,
        })
    }

    pub(crate) fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub(crate) fn dtype(&self) -> DataType {
        self.values.dtype()
    }

    pub(crate) fn device(&self) -> Device {
        self.values.device()
    }

    pub(crate) fn sparse_dim(&self) -> usize {
        self.sparse_dim
    }

    pub(crate) fn dense_dim(&self) -> usize {
        self.shape.len() - self.sparse_dim
    }

    pub(crate) fn dense_shape(&self) -> &[usize] {
        &self.shape[self.sparse_dim..]
    }

    pub(crate) fn dense_numel(&self) -> usize {
        self.dense_shape().iter().product()
    }

    pub(crate) fn nnz(&self) -> usize {
        self.indices.shape()[1]
    }

    pub(crate) fn is_coalesced(&self) -> bool {
        self.coalesced
    }

    pub(crate) fn indices(&self) -> &DenseTensor {
        &self.indices
    }

    pub(crate) fn values(&self) -> &DenseTensor {
        &self.values
    }

    pub(crate) fn deep_clone(&self) -> Self {
        Self {
            shape: self.shape.clone(),
            sparse_dim: self.sparse_dim,
            indices: self.indices.deep_clone(),
            values: self.values.deep_clone(),
            coalesced: self.coalesced,
        }
    }

    /// Mark the tensor coalesced without re-sorting. Used when publishing
    /// a result whose indices are already unique and sorted into freshly
    /// allocated device storage.
    pub(crate) fn assume_coalesced(mut self) -> Self {
        self.coalesced = true;
        self
    }

    pub(crate) fn deep_clone_on(&self, device: Device) -> Self {
        Self {
            shape: self.shape.clone(),
            sparse_dim: self.sparse_dim,
            indices: self.indices.deep_clone_on(device),
            values: self.values.deep_clone_on(device),
            coalesced: self.coalesced,
        }
    }

    /// Flattened coordinate of column `j`, validating index bounds.
    fn flat_key(&self, idx: &[i64], nnz: usize, j: usize) -> Result<i64> {
        let mut key = 0i64;
        for d in 0..self.sparse_dim {
            let v = idx[d * nnz + j];
            if v < 0 || v as usize >= self.shape[d] {
                return Err(CohortError::invalid_argument(
                    "sparse tensor",
                    format!("index {v} out of bounds for dimension {d}"),
                ));
            }
            key = key * self.shape[d] as i64 + v;
        }
        Ok(key)
    }

    /// Concatenate two sparse tensors of the same shape. The result is not
    /// coalesced; duplicate coordinates are resolved by `coalesce`.
    pub(crate) fn add(&self, other: &SparseTensor) -> Result<SparseTensor> {
        if self.shape != other.shape || self.sparse_dim != other.sparse_dim {
            return Err(CohortError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: other.shape.clone(),
            });
        }
        if self.dtype() != other.dtype() {
            return Err(CohortError::DTypeMismatch {
                expected: self.dtype(),
                actual: other.dtype(),
            });
        }

        let (n1, n2) = (self.nnz(), other.nnz());
        let nnz = n1 + n2;
        let sdim = self.sparse_dim;

        let idx1 = self.indices.to_vec::<i64>()?;
        let idx2 = other.indices.to_vec::<i64>()?;
        let mut idx = vec![0i64; sdim * nnz];
        for d in 0..sdim {
            idx[d * nnz..d * nnz + n1].copy_from_slice(&idx1[d * n1..(d + 1) * n1]);
            idx[d * nnz + n1..(d + 1) * nnz].copy_from_slice(&idx2[d * n2..(d + 1) * n2]);
        }

        let indices = dense_from_i64(&idx, &[sdim, nnz], self.device());

        let mut vals = self.values.read_bytes();
        vals.extend_from_slice(&other.values.read_bytes());
        let mut values_shape = vec![nnz];
        values_shape.extend_from_slice(self.dense_shape());
        let values = DenseTensor::zeros(self.dtype(), &values_shape, self.device());
        values.write_bytes(&vals)?;

        SparseTensor::new(indices, values, self.shape.clone())
    }

    /// Sort indices and merge duplicate coordinates by summing their values.
    pub(crate) fn coalesce(&self) -> Result<SparseTensor> {
        let nnz = self.nnz();
        if self.coalesced || nnz <= 1 {
            let mut out = self.deep_clone();
            out.coalesced = true;
            return Ok(out);
        }

        let sdim = self.sparse_dim;
        let idx = self.indices.to_vec::<i64>()?;
        let mut keys = vec![0i64; nnz];
        for (j, key) in keys.iter_mut().enumerate() {
            *key = self.flat_key(&idx, nnz, j)?;
        }

        let mut order: Vec<usize> = (0..nnz).collect();
        order.sort_by_key(|&j| keys[j]);

        let dense_numel = self.dense_numel();
        let row = dense_numel * self.dtype().size_in_bytes();
        let vals = self.values.read_bytes();

        let mut kept: Vec<usize> = Vec::with_capacity(nnz);
        let mut out_vals: Vec<u8> = Vec::with_capacity(vals.len());
        let mut last_key: Option<i64> = None;
        for &j in &order {
            if last_key == Some(keys[j]) {
                let start = out_vals.len() - row;
                reduce_slice(
                    &mut out_vals[start..],
                    &vals[j * row..(j + 1) * row],
                    dense_numel,
                    self.dtype(),
                    ReduceOp::Sum,
                );
            } else {
                kept.push(j);
                out_vals.extend_from_slice(&vals[j * row..(j + 1) * row]);
                last_key = Some(keys[j]);
            }
        }

        let new_nnz = kept.len();
        let mut out_idx = vec![0i64; sdim * new_nnz];
        for d in 0..sdim {
            for (col, &j) in kept.iter().enumerate() {
                out_idx[d * new_nnz + col] = idx[d * nnz + j];
            }
        }

        let indices = dense_from_i64(&out_idx, &[sdim, new_nnz], self.device());
        let mut values_shape = vec![new_nnz];
        values_shape.extend_from_slice(self.dense_shape());
        let values = DenseTensor::zeros(self.dtype(), &values_shape, self.device());
        values.write_bytes(&out_vals)?;

        let mut out = SparseTensor::new(indices, values, self.shape.clone())?;
        out.coalesced = true;
        Ok(out)
    }

    /// Materialize as a dense host tensor, scatter-adding each stored row.
    pub(crate) fn to_dense(&self) -> Result<DenseTensor> {
        let out = DenseTensor::zeros(self.dtype(), &self.shape, Device::Cpu);
        let nnz = self.nnz();
        let idx = self.indices.to_vec::<i64>()?;
        let dense_numel = self.dense_numel();
        let row = dense_numel * self.dtype().size_in_bytes();
        let vals = self.values.read_bytes();

        out.with_bytes_mut(|bytes| -> Result<()> {
            for j in 0..nnz {
                let key = self.flat_key(&idx, nnz, j)? as usize;
                reduce_slice(
                    &mut bytes[key * row..(key + 1) * row],
                    &vals[j * row..(j + 1) * row],
                    dense_numel,
                    self.dtype(),
                    ReduceOp::Sum,
                );
            }
            Ok(())
        })?;
        Ok(out)
    }
}

fn dense_from_i64(data: &[i64], shape: &[usize], device: Device) -> DenseTensor {
    let t = DenseTensor::zeros(DataType::I64, shape, device);
    t.with_bytes_mut(|bytes| {
        for (i, v) in data.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
        }
    });
    t
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn sparse_1d(indices: &[i64], values: &[f32], dim: usize) -> Tensor {
        let idx = Tensor::from_vec(indices, &[1, indices.len()]);
        let val = Tensor::from_vec(values, &[values.len()]);
        Tensor::sparse_coo(&idx, &val, &[dim]).unwrap()
    }

    #[test]
    fn test_to_dense() {
        let t = sparse_1d(&[0, 2], &[1.0, 3.0], 4);
        let dense = t.to_dense().unwrap();
        assert_eq!(dense.to_vec::<f32>().unwrap(), vec![1.0, 0.0, 3.0, 0.0]);
    }

    #[test]
    fn test_coalesce_merges_duplicates() {
        let t = sparse_1d(&[2, 0, 2], &[1.0, 5.0, 2.0], 4);
        let c = t.sparse().unwrap().coalesce().unwrap();
        assert!(c.is_coalesced());
        assert_eq!(c.nnz(), 2);
        assert_eq!(c.indices().to_vec::<i64>().unwrap(), vec![0, 2]);
        assert_eq!(c.values().to_vec::<f32>().unwrap(), vec![5.0, 3.0]);
    }

    #[test]
    fn test_add_concatenates() {
        let a = sparse_1d(&[0], &[1.0], 4);
        let b = sparse_1d(&[3], &[7.0], 4);
        let sum = a.sparse().unwrap().add(b.sparse().unwrap()).unwrap();
        assert_eq!(sum.nnz(), 2);
        let dense = sum.to_dense().unwrap();
        assert_eq!(dense.to_vec::<f32>().unwrap(), vec![1.0, 0.0, 0.0, 7.0]);
    }

    #[test]
    fn test_add_then_coalesce_sums_overlaps() {
        let a = sparse_1d(&[0, 2], &[1.0, 3.0], 4);
        let b = sparse_1d(&[2, 3], &[5.0, 7.0], 4);
        let sum = a.sparse().unwrap().add(b.sparse().unwrap()).unwrap();
        let c = sum.coalesce().unwrap();
        assert_eq!(c.nnz(), 3);
        let dense = c.to_dense().unwrap();
        assert_eq!(dense.to_vec::<f32>().unwrap(), vec![1.0, 0.0, 8.0, 7.0]);
    }

    #[test]
    fn test_dense_dims() {
        let idx = Tensor::from_vec(&[0i64, 1], &[1, 2]);
        let val = Tensor::from_vec(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2]);
        let t = Tensor::sparse_coo(&idx, &val, &[3, 2]).unwrap();
        let s = t.sparse().unwrap();
        assert_eq!(s.sparse_dim(), 1);
        assert_eq!(s.dense_dim(), 1);
        assert_eq!(s.dense_shape(), &[2]);
        let dense = s.to_dense().unwrap();
        assert_eq!(
            dense.to_vec::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 0.0, 0.0]
        );
    }

    #[test]
    fn test_empty_sparse() {
        let t = sparse_1d(&[], &[], 4);
        assert_eq!(t.sparse().unwrap().nnz(), 0);
        let dense = t.to_dense().unwrap();
        assert_eq!(dense.to_vec::<f32>().unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_out_of_bounds_index_rejected() {
        let t = sparse_1d(&[5], &[1.0], 4);
        assert!(t.to_dense().is_err());
    }

    #[test]
    fn test_new_rejects_bad_indices_dtype() {
        let idx = Tensor::from_vec(&[0i32], &[1, 1]);
        let val = Tensor::from_vec(&[1.0f32], &[1]);
        assert!(Tensor::sparse_coo(&idx, &val, &[4]).is_err());
    }
}
