//! In-process transport: a mesh device connecting every rank, contexts
//! attached to it, and unbound buffers for tagged point-to-point traffic.
//!
//! The process group treats this module the way it would treat a TCP or
//! RDMA backend: contexts expose fixed-size collectives plus unbound
//! send/recv, and everything above them is transport-agnostic.

mod context;
mod device;
mod unbound;

pub use context::Context;
pub use device::MeshDevice;
pub use unbound::UnboundBuffer;
