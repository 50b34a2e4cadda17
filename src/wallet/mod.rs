pub mod service;
pub mod sync;
pub mod types;

pub use service::{ExplorerService, NodeStatus, StatusResult};
pub use types::*;
