//! Minimal dense/sparse tensor model backing the collective engine.
//!
//! A `Tensor` is a cheap handle: clones share storage, and storage is
//! guarded by a mutex so queued work items can fill outputs from worker
//! threads while the caller holds the same handle. Dense tensors are always
//! contiguous; sparse tensors are COO with `i64` indices.

mod sparse;

pub(crate) use sparse::SparseTensor;

use crate::accel::PinnedBuf;
use crate::error::{CohortError, Result};
use crate::types::{DataType, Device, Layout};
use std::sync::{Arc, Mutex, PoisonError};

/// Rust types that map onto a [`DataType`].
pub trait Element: Copy + Send + 'static {
    const DTYPE: DataType;

    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:expr),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: DataType = $dtype;

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(bytes.try_into().expect("slice length matches type size"))
                }

                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_element!(
    f32 => DataType::F32,
    f64 => DataType::F64,
    i8 => DataType::I8,
    u8 => DataType::U8,
    i32 => DataType::I32,
    i64 => DataType::I64,
);

impl Element for half::f16 {
    const DTYPE: DataType = DataType::F16;

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        half::f16::from_le_bytes(bytes.try_into().expect("slice length matches type size"))
    }

    #[inline]
    fn write_le(self, bytes: &mut [u8]) {
        bytes.copy_from_slice(&self.to_le_bytes());
    }
}

/// Backing bytes: plain heap memory, or a recycled buffer from the pinned
/// pool when the tensor is a host shadow for accelerator staging.
pub(crate) enum StorageBuf {
    Plain(Vec<u8>),
    Pinned(PinnedBuf),
}

impl StorageBuf {
    fn as_slice(&self) -> &[u8] {
        match self {
            StorageBuf::Plain(v) => v,
            StorageBuf::Pinned(b) => b,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            StorageBuf::Plain(v) => v,
            StorageBuf::Pinned(b) => b,
        }
    }
}

pub(crate) struct Storage {
    data: Mutex<StorageBuf>,
}

impl Storage {
    pub(crate) fn plain(bytes: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(StorageBuf::Plain(bytes)),
        })
    }

    pub(crate) fn pinned(buf: PinnedBuf) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(StorageBuf::Pinned(buf)),
        })
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_slice())
    }

    pub(crate) fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_mut_slice())
    }
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1];
    }
    strides
}

/// A dense, contiguous tensor handle. Clones share storage.
#[derive(Clone)]
pub(crate) struct DenseTensor {
    dtype: DataType,
    shape: Vec<usize>,
    strides: Vec<usize>,
    device: Device,
    storage: Arc<Storage>,
}

impl DenseTensor {
    pub(crate) fn zeros(dtype: DataType, shape: &[usize], device: Device) -> Self {
        let numel: usize = shape.iter().product();
        Self {
            dtype,
            shape: shape.to_vec(),
            strides: contiguous_strides(shape),
            device,
            storage: Storage::plain(vec![0u8; numel * dtype.size_in_bytes()]),
        }
    }

    /// Host shadow with the same shape and dtype, backed by the pinned pool.
    pub(crate) fn pinned_like(&self) -> Self {
        let buf = crate::accel::pinned_pool().checkout(self.nbytes());
        Self {
            dtype: self.dtype,
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            device: Device::Cpu,
            storage: Storage::pinned(buf),
        }
    }

    pub(crate) fn dtype(&self) -> DataType {
        self.dtype
    }

    pub(crate) fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub(crate) fn device(&self) -> Device {
        self.device
    }

    pub(crate) fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub(crate) fn nbytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }

    pub(crate) fn is_contiguous(&self) -> bool {
        self.strides == contiguous_strides(&self.shape)
    }

    pub(crate) fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.storage.with(f)
    }

    pub(crate) fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.storage.with_mut(f)
    }

    pub(crate) fn read_bytes(&self) -> Vec<u8> {
        self.storage.with(|b| b.to_vec())
    }

    pub(crate) fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.storage.with_mut(|dst| {
            if dst.len() != bytes.len() {
                return Err(CohortError::BufferSizeMismatch {
                    expected: dst.len(),
                    actual: bytes.len(),
                });
            }
            dst.copy_from_slice(bytes);
            Ok(())
        })
    }

    /// Element-wise copy from `src`. Requires matching dtype and element
    /// count; shapes may differ (flattened views copy byte-for-byte).
    pub(crate) fn copy_from(&self, src: &DenseTensor) -> Result<()> {
        if self.dtype != src.dtype {
            return Err(CohortError::DTypeMismatch {
                expected: self.dtype,
                actual: src.dtype,
            });
        }
        if self.numel() != src.numel() {
            return Err(CohortError::ShapeMismatch {
                expected: self.shape.clone(),
                actual: src.shape.clone(),
            });
        }
        self.write_bytes(&src.read_bytes())
    }

    pub(crate) fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if self.dtype != T::DTYPE {
            return Err(CohortError::DTypeMismatch {
                expected: self.dtype,
                actual: T::DTYPE,
            });
        }
        let size = self.dtype.size_in_bytes();
        Ok(self.with_bytes(|bytes| {
            (0..self.numel())
                .map(|i| T::read_le(&bytes[i * size..(i + 1) * size]))
                .collect()
        }))
    }

    /// Copy the data into fresh storage.
    pub(crate) fn deep_clone(&self) -> Self {
        Self {
            dtype: self.dtype,
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            device: self.device,
            storage: Storage::plain(self.read_bytes()),
        }
    }

    /// Same data, different device marker. Used when publishing staged
    /// results back onto accelerator tensors.
    pub(crate) fn deep_clone_on(&self, device: Device) -> Self {
        let mut t = self.deep_clone();
        t.device = device;
        t
    }
}

#[derive(Clone)]
pub(crate) enum TensorRepr {
    Dense(DenseTensor),
    Sparse(SparseTensor),
}

/// The tensor handle accepted and returned by the process group.
#[derive(Clone)]
pub struct Tensor {
    pub(crate) repr: TensorRepr,
}

impl Tensor {
    /// Dense zero tensor on the host.
    pub fn zeros(shape: &[usize], dtype: DataType) -> Self {
        Self::zeros_on(shape, dtype, Device::Cpu)
    }

    /// Dense zero tensor on the given device.
    pub fn zeros_on(shape: &[usize], dtype: DataType, device: Device) -> Self {
        Self {
            repr: TensorRepr::Dense(DenseTensor::zeros(dtype, shape, device)),
        }
    }

    /// Dense host tensor from a slice of elements.
    pub fn from_vec<T: Element>(data: &[T], shape: &[usize]) -> Self {
        Self::from_vec_on(data, shape, Device::Cpu)
    }

    /// Dense tensor from a slice of elements, on the given device.
    pub fn from_vec_on<T: Element>(data: &[T], shape: &[usize], device: Device) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(numel, data.len(), "shape does not match element count");
        let tensor = DenseTensor::zeros(T::DTYPE, shape, device);
        let size = T::DTYPE.size_in_bytes();
        tensor.with_bytes_mut(|bytes| {
            for (i, v) in data.iter().enumerate() {
                v.write_le(&mut bytes[i * size..(i + 1) * size]);
            }
        });
        Self {
            repr: TensorRepr::Dense(tensor),
        }
    }

    /// Sparse COO tensor from an index tensor (`i64`, `[sparse_dim, nnz]`)
    /// and a value tensor (`[nnz, dense_shape...]`).
    pub fn sparse_coo(indices: &Tensor, values: &Tensor, shape: &[usize]) -> Result<Self> {
        let indices = indices.dense()?.clone();
        let values = values.dense()?.clone();
        let sparse = SparseTensor::new(indices, values, shape.to_vec())?;
        Ok(Self {
            repr: TensorRepr::Sparse(sparse),
        })
    }

    pub fn dtype(&self) -> DataType {
        match &self.repr {
            TensorRepr::Dense(t) => t.dtype(),
            TensorRepr::Sparse(s) => s.dtype(),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match &self.repr {
            TensorRepr::Dense(t) => t.shape(),
            TensorRepr::Sparse(s) => s.shape(),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn device(&self) -> Device {
        match &self.repr {
            TensorRepr::Dense(t) => t.device(),
            TensorRepr::Sparse(s) => s.device(),
        }
    }

    pub fn layout(&self) -> Layout {
        match &self.repr {
            TensorRepr::Dense(_) => Layout::Strided,
            TensorRepr::Sparse(_) => Layout::Sparse,
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.repr, TensorRepr::Sparse(_))
    }

    pub fn is_contiguous(&self) -> bool {
        match &self.repr {
            TensorRepr::Dense(t) => t.is_contiguous(),
            TensorRepr::Sparse(_) => false,
        }
    }

    /// Whether a sparse tensor has unique, sorted indices. Dense tensors
    /// are trivially coalesced.
    pub fn is_coalesced(&self) -> bool {
        match &self.repr {
            TensorRepr::Dense(_) => true,
            TensorRepr::Sparse(s) => s.is_coalesced(),
        }
    }

    /// Read out a dense tensor's elements. Fails on sparse layout or a
    /// dtype mismatch.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.dense()?.to_vec()
    }

    /// Materialize as a dense host tensor. Dense tensors are deep-cloned.
    pub fn to_dense(&self) -> Result<Tensor> {
        match &self.repr {
            TensorRepr::Dense(t) => Ok(Tensor {
                repr: TensorRepr::Dense(t.deep_clone()),
            }),
            TensorRepr::Sparse(s) => Ok(Tensor {
                repr: TensorRepr::Dense(s.to_dense()?),
            }),
        }
    }

    /// Copy the data into fresh storage.
    pub fn deep_clone(&self) -> Tensor {
        match &self.repr {
            TensorRepr::Dense(t) => Tensor {
                repr: TensorRepr::Dense(t.deep_clone()),
            },
            TensorRepr::Sparse(s) => Tensor {
                repr: TensorRepr::Sparse(s.deep_clone()),
            },
        }
    }

    /// Element-wise copy from another dense tensor.
    pub fn copy_from(&self, src: &Tensor) -> Result<()> {
        self.dense()?.copy_from(src.dense()?)
    }

    pub(crate) fn dense(&self) -> Result<&DenseTensor> {
        match &self.repr {
            TensorRepr::Dense(t) => Ok(t),
            TensorRepr::Sparse(_) => Err(CohortError::invalid_argument(
                "tensor",
                "expected a dense tensor, got sparse layout",
            )),
        }
    }

    pub(crate) fn sparse(&self) -> Result<&SparseTensor> {
        match &self.repr {
            TensorRepr::Sparse(s) => Ok(s),
            TensorRepr::Dense(_) => Err(CohortError::invalid_argument(
                "tensor",
                "expected a sparse tensor, got strided layout",
            )),
        }
    }

    pub(crate) fn from_dense(t: DenseTensor) -> Tensor {
        Tensor {
            repr: TensorRepr::Dense(t),
        }
    }

    pub(crate) fn from_sparse(s: SparseTensor) -> Tensor {
        Tensor {
            repr: TensorRepr::Sparse(s),
        }
    }
}

/// Concatenate the raw bytes of a dense tensor list, in order.
pub(crate) fn flatten_bytes(tensors: &[Tensor]) -> Result<Vec<u8>> {
    let total: usize = tensors
        .iter()
        .map(|t| t.dense().map(DenseTensor::nbytes).unwrap_or(0))
        .sum();
    let mut flat = Vec::with_capacity(total);
    for t in tensors {
        flat.extend_from_slice(&t.dense()?.read_bytes());
    }
    Ok(flat)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_roundtrip() {
        let t = Tensor::from_vec(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2]);
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.numel(), 4);
        assert_eq!(t.dtype(), DataType::F32);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_f16_roundtrip() {
        let data: Vec<half::f16> = [0.5f32, 1.5, -2.0]
            .iter()
            .map(|&v| half::f16::from_f32(v))
            .collect();
        let t = Tensor::from_vec(&data, &[3]);
        assert_eq!(t.dtype(), DataType::F16);
        assert_eq!(t.to_vec::<half::f16>().unwrap(), data);
    }

    #[test]
    fn test_clone_shares_storage() {
        let a = Tensor::from_vec(&[0i32; 4], &[4]);
        let b = a.clone();
        b.copy_from(&Tensor::from_vec(&[9i32; 4], &[4])).unwrap();
        assert_eq!(a.to_vec::<i32>().unwrap(), vec![9; 4]);
    }

    #[test]
    fn test_deep_clone_detaches_storage() {
        let a = Tensor::from_vec(&[1i64, 2], &[2]);
        let b = a.deep_clone();
        b.copy_from(&Tensor::from_vec(&[7i64, 7], &[2])).unwrap();
        assert_eq!(a.to_vec::<i64>().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_copy_from_rejects_dtype_mismatch() {
        let a = Tensor::zeros(&[2], DataType::F32);
        let b = Tensor::zeros(&[2], DataType::F64);
        assert!(a.copy_from(&b).is_err());
    }

    #[test]
    fn test_to_vec_rejects_dtype_mismatch() {
        let a = Tensor::zeros(&[2], DataType::F32);
        assert!(a.to_vec::<i32>().is_err());
    }

    #[test]
    fn test_flatten_bytes() {
        let a = Tensor::from_vec(&[1i32, 2], &[2]);
        let b = Tensor::from_vec(&[3i32], &[1]);
        let flat = flatten_bytes(&[a, b]).unwrap();
        assert_eq!(flat.len(), 12);
        assert_eq!(i32::read_le(&flat[8..12]), 3);
    }

    #[test]
    fn test_contiguous_strides() {
        assert_eq!(contiguous_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(contiguous_strides(&[5]), vec![1]);
        assert!(contiguous_strides(&[]).is_empty());
    }

    #[test]
    fn test_zeros_on_device() {
        let t = Tensor::zeros_on(&[2], DataType::F32, Device::Accel(0));
        assert_eq!(t.device(), Device::Accel(0));
        assert!(t.device().is_accel());
    }
}
