//! Coordination kernel over a consistent key-value store.
//!
//! - [`watch`]: resilient prefix watch streams and their consumers
//! - [`mirror`]: in-memory projections of a prefix
//! - [`session`]: lease-backed sessions and distributed mutexes
//! - [`task`]: at-most-once cluster tasks and event orchestrators
mod config;
mod errors;
mod metrics;
mod utils;

pub mod mirror;
pub mod session;
pub mod store;
pub mod task;
pub mod watch;

pub use config::*;
pub use errors::*;
pub use metrics::*;
