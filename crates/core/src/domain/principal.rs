use serde::{Deserialize, Serialize};

use crate::domain::org::{LegacyKey, LegacyKind};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrincipalId(pub String);

impl PrincipalId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl std::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Legacy fixed-depth placement of a principal. Any subset of the five
/// levels may be filled; the deepest filled level is the most specific.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgPlacement {
    pub directorate_id: Option<i64>,
    pub unit_id: Option<i64>,
    pub department_id: Option<i64>,
    pub section_id: Option<i64>,
    pub division_id: Option<i64>,
}

impl OrgPlacement {
    /// Filled placement levels in node-fallback order: division, section,
    /// unit, department, directorate.
    pub fn fallback_keys(&self) -> Vec<LegacyKey> {
        [
            (LegacyKind::Division, self.division_id),
            (LegacyKind::Section, self.section_id),
            (LegacyKind::Unit, self.unit_id),
            (LegacyKind::Department, self.department_id),
            (LegacyKind::Directorate, self.directorate_id),
        ]
        .into_iter()
        .filter_map(|(kind, id)| id.map(|id| LegacyKey::new(kind, id)))
        .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    pub display_name: String,
    pub email: Option<String>,
    pub role: String,
    pub active: bool,
    pub placement: OrgPlacement,
}
