//! Tracked branches: consolidated status across servers and the cached
//! queries over it.

pub mod aggregator;
pub mod service;
pub mod status;

pub use service::TrackedService;
pub use status::{ChainAtServerStatus, ConsolidatedStatus, SuiteCurrentStatus};
