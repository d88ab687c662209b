use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::org::DisplayNames;
use crate::domain::principal::PrincipalId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CommitteeId(pub i64);

impl std::fmt::Display for CommitteeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitteeMemberRole {
    Chair,
    Secretary,
    Member,
}

impl CommitteeMemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chair => "CHAIR",
            Self::Secretary => "SECRETARY",
            Self::Member => "MEMBER",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CHAIR" => Some(Self::Chair),
            "SECRETARY" => Some(Self::Secretary),
            "MEMBER" => Some(Self::Member),
            _ => None,
        }
    }
}

/// A seat is held either by a named principal or by whoever holds a role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum MemberRef {
    Principal(PrincipalId),
    Role(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeMember {
    pub id: i64,
    pub member: MemberRef,
    pub role: CommitteeMemberRole,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committee {
    pub id: CommitteeId,
    pub names: DisplayNames,
    pub code: Option<String>,
    pub active: bool,
    pub members: Vec<CommitteeMember>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CommitteeError {
    #[error("committee {committee_id} has {count} active members tagged {role}")]
    DuplicateOfficer { committee_id: CommitteeId, role: &'static str, count: usize },
}

impl Committee {
    pub fn active_members(&self) -> impl Iterator<Item = &CommitteeMember> {
        self.members.iter().filter(|member| member.active)
    }

    pub fn active_with_role(&self, role: CommitteeMemberRole) -> Vec<&CommitteeMember> {
        self.active_members().filter(|member| member.role == role).collect()
    }

    pub fn has_active_officer(&self, role: CommitteeMemberRole) -> bool {
        !self.active_with_role(role).is_empty()
    }

    /// At most one active CHAIR and one active SECRETARY.
    pub fn check_officers(&self) -> Result<(), CommitteeError> {
        for role in [CommitteeMemberRole::Chair, CommitteeMemberRole::Secretary] {
            let count = self.active_with_role(role).len();
            if count > 1 {
                return Err(CommitteeError::DuplicateOfficer {
                    committee_id: self.id,
                    role: role.as_str(),
                    count,
                });
            }
        }
        Ok(())
    }
}
