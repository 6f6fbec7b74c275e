//! Repository Module
//!
//! Postgres implementations of the storage ports. Each submodule holds the
//! queries for one table plus a thin store type implementing the matching
//! trait from `openanomaly_core::store`.

pub mod job;
pub mod lease;
pub mod ledger;
pub mod pipeline;

pub use job::PgJobQueue;
pub use lease::PgLeaseStore;
pub use ledger::PgResultLedger;
pub use pipeline::PgRegistry;

use openanomaly_core::error::StoreError;

pub(crate) fn backend(err: sqlx::Error) -> StoreError {
    tracing::error!("Database error: {:?}", err);
    StoreError::Backend(err.to_string())
}
