pub mod accel;
pub mod collective;
pub mod config;
pub mod error;
pub mod process_group;
pub(crate) mod reduce;
pub mod store;
pub mod tensor;
pub mod transport;
pub mod types;
pub mod work;

pub use config::GroupOptions;
pub use error::{CohortError, Result};
pub use process_group::{
    AllreduceCoalescedOptions, AllreduceOptions, BroadcastOptions, GatherOptions, ProcessGroup,
    ReduceOptions, ScatterOptions,
};
pub use store::{HashStore, PrefixStore, Store};
pub use tensor::{Element, Tensor};
pub use transport::{Context, MeshDevice, UnboundBuffer};
pub use types::{DataType, Device, Layout, Rank, ReduceOp, Tag};
pub use work::{AsyncWork, RecvWork, SendWork, Work};
