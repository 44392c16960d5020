/// Rank of a participant in the process group (0-indexed).
pub type Rank = u32;

/// Monotonic identifier naming one collective (or a user-chosen
/// point-to-point channel). Used for cross-rank matching and for routing
/// onto a transport context.
pub type Tag = u64;

/// Element types supported by the collective engine.
///
/// The transport needs a concrete element type at call time, so the engine
/// dispatches over this closed set. Anything else is rejected before a tag
/// is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    I8 = 3,
    U8 = 4,
    I32 = 5,
    I64 = 6,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::F16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::I8 => "i8",
            DataType::U8 => "u8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for collective communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    Sum,
    /// Element-wise product across ranks.
    Prod,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Prod => f.write_str("prod"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// Tensor memory layouts understood by the engine.
///
/// Sparse tensors are accepted only where explicitly documented
/// (allreduce with `ReduceOp::Sum`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    Strided,
    Sparse,
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layout::Strided => f.write_str("strided"),
            Layout::Sparse => f.write_str("sparse"),
        }
    }
}

/// Where a tensor's memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    /// Host memory; collectives run on it directly.
    Cpu,
    /// Accelerator memory, identified by ordinal. Collectives stage
    /// through pinned host shadows on side streams.
    Accel(u32),
}

impl Device {
    pub const fn is_accel(self) -> bool {
        matches!(self, Device::Accel(_))
    }

    /// Accelerator ordinal, if this is an accelerator device.
    pub const fn ordinal(self) -> Option<u32> {
        match self {
            Device::Cpu => None,
            Device::Accel(d) => Some(d),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accel(d) => write!(f, "accel:{d}"),
        }
    }
}
