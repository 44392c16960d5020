//! Shared argument predicates. Every entrypoint runs these before
//! allocating a tag, so a rejected call never advances the collective
//! counter and peers stay tag-synchronized.

use crate::error::{CohortError, Result};
use crate::tensor::Tensor;
use crate::types::{DataType, Layout, Rank};

fn invalid(op: &'static str, reason: impl Into<String>) -> CohortError {
    CohortError::invalid_argument(op, reason)
}

pub(crate) fn assert_root_rank(op: &'static str, root: Rank, size: u32) -> Result<()> {
    if root >= size {
        return Err(invalid(op, format!("invalid root rank: {root}")));
    }
    Ok(())
}

pub(crate) fn assert_root_tensor(op: &'static str, index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(invalid(op, format!("invalid root tensor: {index}")));
    }
    Ok(())
}

pub(crate) fn assert_non_empty(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    if tensors.is_empty() {
        return Err(invalid(op, "requires non-empty tensor list"));
    }
    Ok(())
}

pub(crate) fn assert_single_element(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    assert_non_empty(op, tensors)?;
    if tensors.len() != 1 {
        return Err(invalid(op, "requires a single-element tensor list"));
    }
    Ok(())
}

pub(crate) fn assert_dense(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    assert_non_empty(op, tensors)?;
    if tensors.iter().any(|t| t.layout() != Layout::Strided) {
        return Err(invalid(op, "requires dense tensors"));
    }
    Ok(())
}

pub(crate) fn assert_layout_match(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    assert_non_empty(op, tensors)?;
    let layout = tensors[0].layout();
    if tensors.iter().any(|t| t.layout() != layout) {
        return Err(invalid(op, "tensors must all have the same layout"));
    }
    Ok(())
}

pub(crate) fn assert_same_device(op: &'static str, tensors: &[Tensor]) -> Result<()> {
    assert_non_empty(op, tensors)?;
    let device = tensors[0].device();
    if tensors.iter().any(|t| t.device() != device) {
        return Err(invalid(op, "tensors must all be on the same device"));
    }
    Ok(())
}

/// Every tensor must match the given dtype and shape.
pub(crate) fn assert_type_and_sizes_match(
    op: &'static str,
    tensors: &[Tensor],
    dtype: DataType,
    shape: &[usize],
) -> Result<()> {
    for t in tensors {
        if t.dtype() != dtype {
            return Err(invalid(
                op,
                format!("tensors must all have dtype {dtype}, got {}", t.dtype()),
            ));
        }
        if t.shape() != shape {
            return Err(invalid(
                op,
                format!("tensors must all have sizes {shape:?}, got {:?}", t.shape()),
            ));
        }
    }
    Ok(())
}

/// Point-to-point precondition: exactly one contiguous dense tensor.
pub(crate) fn check_single_tensor<'a>(
    op: &'static str,
    tensors: &'a [Tensor],
) -> Result<&'a Tensor> {
    if tensors.len() != 1 {
        return Err(invalid(op, "takes a single tensor"));
    }
    let tensor = &tensors[0];
    if tensor.is_sparse() {
        return Err(invalid(op, "input tensor has to be dense"));
    }
    if !tensor.is_contiguous() {
        return Err(invalid(op, "input tensor has to be contiguous"));
    }
    Ok(tensor)
}
