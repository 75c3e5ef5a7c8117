//! Build-chain model: loading chains from a CI server, merging them, and
//! keeping per-day history with suite pass rates.

pub mod context;
pub mod failure_rate;
pub mod history;
pub mod keys;
pub mod loader;
