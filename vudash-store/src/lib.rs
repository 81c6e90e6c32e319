pub mod error;
pub mod registry;
pub mod snapshot;

pub use error::{Error, Result};
pub use registry::TokenRegistry;
pub use snapshot::{Snapshot, SnapshotStore};
