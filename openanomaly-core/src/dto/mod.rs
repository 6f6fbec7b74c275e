//! Data Transfer Objects for inter-service communication
//!
//! Request and response bodies of the scheduler API, shared by the scheduler
//! (server side) and the client crate used by workers and the CLI.

pub mod job;
pub mod leader;
pub mod ledger;
pub mod pipeline;
