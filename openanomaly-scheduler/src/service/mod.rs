//! Service Module
//!
//! Leadership, tick planning and the scheduling loop, plus the pipeline
//! operations behind the API.

pub mod leader;
pub mod pipeline;
pub mod planner;
pub mod scheduler;

pub use leader::LeaderElector;
pub use pipeline as pipeline_service;
pub use scheduler::{Scheduler, SchedulerError};
