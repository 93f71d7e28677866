//! Signal handling shared by every spawned process

pub mod forward;
pub mod registry;

pub use forward::SignalForwarder;
pub use registry::{Disposition, RegistrationId, SignalCallback, SignalRegistry};
