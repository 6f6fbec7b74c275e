//! Core domain types
//!
//! These types represent the entities shared between the scheduler (which
//! persists and enqueues them) and the worker (which executes them).

pub mod job;
pub mod lease;
pub mod pipeline;
pub mod result;
pub mod series;
