use crate::types::{DataType, Rank};

pub type Result<T> = std::result::Result<T, CohortError>;

/// Errors produced by the process group, its transport, and its tensors.
///
/// Every variant is `Clone`: a failure captured inside a queued work item
/// is stored on the work and re-raised from each `wait()` call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CohortError {
    #[error("{op}: {reason}")]
    InvalidArgument { op: &'static str, reason: String },

    #[error("{0}")]
    Unsupported(String),

    #[error("invalid rank {rank}: world size is {world_size}")]
    InvalidRank { rank: Rank, world_size: u32 },

    #[error("{operation} failed at rank {rank}: {reason}")]
    CollectiveFailed {
        operation: &'static str,
        rank: Rank,
        reason: String,
    },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("buffer size mismatch: expected {expected} bytes, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    #[error("dtype mismatch: expected {expected}, got {actual}")]
    DTypeMismatch {
        expected: DataType,
        actual: DataType,
    },

    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("sparse dimensions do not match: rank {rank} has {actual:?}, expected {expected:?}")]
    DimensionMismatch {
        rank: Rank,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },

    #[error("store key \"{key}\" not set within {timeout_ms}ms")]
    StoreTimeout { key: String, timeout_ms: u64 },

    #[error("collective job panicked: {0}")]
    Panic(String),
}

impl CohortError {
    /// Create an `InvalidArgument` error for the named entrypoint.
    pub fn invalid_argument(op: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            op,
            reason: reason.into(),
        }
    }

    /// Create an `Unsupported` error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let e = CohortError::invalid_argument("broadcast", "requires non-empty tensor list");
        assert_eq!(e.to_string(), "broadcast: requires non-empty tensor list");
    }

    #[test]
    fn test_invalid_rank_display() {
        let e = CohortError::InvalidRank {
            rank: 4,
            world_size: 4,
        };
        assert_eq!(e.to_string(), "invalid rank 4: world size is 4");
    }

    #[test]
    fn test_timeout_display() {
        let e = CohortError::Timeout {
            operation: "recv",
            timeout_ms: 5000,
        };
        assert_eq!(e.to_string(), "recv timed out after 5000ms");
    }

    #[test]
    fn test_errors_are_cloneable() {
        let e = CohortError::DimensionMismatch {
            rank: 1,
            expected: vec![4],
            actual: vec![5],
        };
        let e2 = e.clone();
        assert_eq!(e.to_string(), e2.to_string());
    }
}
