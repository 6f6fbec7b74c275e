//! Leadership DTOs

use serde::{Deserialize, Serialize};

use crate::domain::lease::{Lease, Leadership};

/// Role of the answering scheduler instance and the lease it observes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderStatus {
    pub instance_id: String,
    pub leadership: Leadership,
    pub lease: Option<Lease>,
}
