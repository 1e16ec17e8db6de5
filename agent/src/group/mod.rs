//! Cross-process communication for one tensor-parallel fleet

pub mod barrier;
pub mod process_group;
pub mod rendezvous;
pub mod wire;

pub use barrier::{BarrierHost, BarrierMember};
pub use process_group::{Channel, ChannelKind, ProcessGroup};
pub use rendezvous::{find_available_port, Rendezvous, DEFAULT_BASE_PORT};
