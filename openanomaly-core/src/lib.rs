//! OpenAnomaly Core
//!
//! Core types and abstractions shared by the OpenAnomaly scheduler, worker and CLI.
//!
//! This crate contains:
//! - Domain types: pipelines, jobs, leases, series and results
//! - DTOs: request/response bodies for the scheduler API
//! - Ports: the storage, TSDB and model engine traits every service codes against
//! - Scoring: the closed set of anomaly scoring techniques
//! - Memory backends used by tests and single-process deployments

pub mod domain;
pub mod dto;
pub mod duration;
pub mod engine;
pub mod error;
pub mod memory;
pub mod schedule;
pub mod schema;
pub mod scoring;
pub mod store;
pub mod tsdb;
