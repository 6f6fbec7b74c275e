//! Leader lease types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonically increasing token issued with every successful acquisition.
/// Stores reject writes carrying a token older than the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FencingToken(pub u64);

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder_id: String,
    pub fencing_token: FencingToken,
    pub expires_at: DateTime<Utc>,
}

/// Role of a scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Leadership {
    #[default]
    Standby,
    Active { fencing_token: FencingToken },
}

impl Leadership {
    pub fn is_active(&self) -> bool {
        matches!(self, Leadership::Active { .. })
    }

    pub fn token(&self) -> Option<FencingToken> {
        match self {
            Leadership::Active { fencing_token } => Some(*fencing_token),
            Leadership::Standby => None,
        }
    }
}
