use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::principal::PrincipalId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DelegationId(pub i64);

impl std::fmt::Display for DelegationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub id: DelegationId,
    pub delegator_id: PrincipalId,
    pub delegatee_id: PrincipalId,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active: bool,
    pub created_by: PrincipalId,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Delegation {
    /// Window bounds are inclusive on both ends.
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        self.active && self.starts_at <= now && now <= self.expires_at
    }

    pub fn overlaps(&self, starts_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> bool {
        self.active && self.starts_at <= expires_at && starts_at <= self.expires_at
    }
}
