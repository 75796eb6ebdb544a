//! Gateway runtime: the shared tag store, per-device acquisition loops, and
//! the orchestrator that wires them together from a fleet configuration.

pub mod acquisition;
pub mod orchestrator;
pub mod store;

pub use acquisition::{AcquisitionLoop, WriteCommand};
pub use orchestrator::Gateway;
pub use store::{Subscriber, TagStore};
