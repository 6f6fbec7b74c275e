//! Task execution
//!
//! One module per job kind plus the shared runtime that reads from the TSDB,
//! commits results through the ledger and settles jobs with the queue.

mod anomaly;
mod forecast;
mod runtime;
mod train;

#[cfg(test)]
pub(crate) mod testing;

pub use runtime::{JobRunner, TaskSettings};
