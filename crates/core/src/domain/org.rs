use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::principal::PrincipalId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrgNodeId(pub i64);

impl std::fmt::Display for OrgNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Levels of the legacy fixed-depth hierarchy, in projection order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LegacyKind {
    Organization,
    Directorate,
    Unit,
    Department,
    Section,
    Division,
    Team,
}

impl LegacyKind {
    pub const ALL: [LegacyKind; 7] = [
        Self::Organization,
        Self::Directorate,
        Self::Unit,
        Self::Department,
        Self::Section,
        Self::Division,
        Self::Team,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Organization => "ORGANIZATION",
            Self::Directorate => "DIRECTORATE",
            Self::Unit => "UNIT",
            Self::Department => "DEPARTMENT",
            Self::Section => "SECTION",
            Self::Division => "DIVISION",
            Self::Team => "TEAM",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ORGANIZATION" => Some(Self::Organization),
            "DIRECTORATE" => Some(Self::Directorate),
            "UNIT" => Some(Self::Unit),
            "DEPARTMENT" => Some(Self::Department),
            "SECTION" => Some(Self::Section),
            "DIVISION" => Some(Self::Division),
            "TEAM" => Some(Self::Team),
            _ => None,
        }
    }

    /// Node type code a projected node of this level carries.
    pub fn node_type_code(&self) -> &'static str {
        self.as_str()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LegacyKey {
    pub kind: LegacyKind,
    pub id: i64,
}

impl LegacyKey {
    pub fn new(kind: LegacyKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl std::fmt::Display for LegacyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind.as_str(), self.id)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayNames {
    pub local: String,
    pub english: Option<String>,
}

impl DisplayNames {
    pub fn new(local: impl Into<String>) -> Self {
        Self { local: local.into(), english: None }
    }

    pub fn with_english(mut self, english: impl Into<String>) -> Self {
        self.english = Some(english.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgNodeType {
    pub code: String,
    pub names: DisplayNames,
    pub sort_rank: i32,
    pub allow_in_approvals: bool,
    pub show_in_routing: bool,
    pub show_in_chart: bool,
    pub active: bool,
    pub allowed_parent_codes: BTreeSet<String>,
}

impl OrgNodeType {
    /// Rank given to types created on the fly during a sync pass.
    pub const FALLBACK_RANK: i32 = 999;

    pub fn fallback(code: &str) -> Self {
        Self {
            code: code.to_string(),
            names: DisplayNames::new(code),
            sort_rank: Self::FALLBACK_RANK,
            allow_in_approvals: false,
            show_in_routing: false,
            show_in_chart: false,
            active: true,
            allowed_parent_codes: BTreeSet::new(),
        }
    }

    /// Seed types mirroring the legacy hierarchy.
    pub fn defaults() -> Vec<Self> {
        let seed: [(LegacyKind, &str, i32, &[&str]); 7] = [
            (LegacyKind::Organization, "Organization", 10, &[]),
            (LegacyKind::Directorate, "Directorate", 20, &["ORGANIZATION"]),
            (LegacyKind::Unit, "Unit", 30, &["DIRECTORATE"]),
            (LegacyKind::Department, "Department", 40, &["DIRECTORATE", "UNIT"]),
            (LegacyKind::Section, "Section", 50, &["DEPARTMENT", "UNIT", "DIRECTORATE"]),
            (LegacyKind::Division, "Division", 60, &["SECTION"]),
            (LegacyKind::Team, "Team", 70, &["SECTION", "DIVISION"]),
        ];

        seed.into_iter()
            .map(|(kind, english, rank, parents)| Self {
                code: kind.node_type_code().to_string(),
                names: DisplayNames::new(english).with_english(english),
                sort_rank: rank,
                allow_in_approvals: true,
                show_in_routing: true,
                show_in_chart: true,
                active: true,
                allowed_parent_codes: parents.iter().map(|code| code.to_string()).collect(),
            })
            .collect()
    }

    pub fn allows_parent(&self, parent_code: &str) -> bool {
        self.allowed_parent_codes.contains(parent_code)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrgNode {
    pub id: OrgNodeId,
    pub type_code: String,
    pub parent_id: Option<OrgNodeId>,
    pub names: DisplayNames,
    pub code: Option<String>,
    pub active: bool,
    pub sort_order: i32,
    pub legacy: Option<LegacyKey>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAssignment {
    pub principal_id: PrincipalId,
    pub node_id: OrgNodeId,
    pub title: Option<String>,
    pub is_primary: bool,
}

/// Parent references a legacy record may carry. Which ones are consulted
/// depends on the record's level.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyParents {
    pub organization_id: Option<i64>,
    pub directorate_id: Option<i64>,
    pub unit_id: Option<i64>,
    pub department_id: Option<i64>,
    pub section_id: Option<i64>,
    pub division_id: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyOrgEntity {
    pub key: LegacyKey,
    pub names: DisplayNames,
    pub code: Option<String>,
    pub active: bool,
    pub parents: LegacyParents,
}

impl LegacyOrgEntity {
    /// Candidate parents in precedence order. The first one that exists in
    /// the legacy data wins.
    pub fn parent_candidates(&self) -> Vec<LegacyKey> {
        use LegacyKind::{Department, Directorate, Division, Organization, Section, Unit};

        let p = &self.parents;
        let candidates: Vec<(LegacyKind, Option<i64>)> = match self.key.kind {
            LegacyKind::Organization => Vec::new(),
            LegacyKind::Directorate => vec![(Organization, p.organization_id)],
            LegacyKind::Unit => vec![(Directorate, p.directorate_id)],
            LegacyKind::Department => {
                vec![(Unit, p.unit_id), (Directorate, p.directorate_id)]
            }
            LegacyKind::Section => vec![
                (Department, p.department_id),
                (Unit, p.unit_id),
                (Directorate, p.directorate_id),
            ],
            LegacyKind::Division => vec![(Section, p.section_id)],
            LegacyKind::Team => vec![(Division, p.division_id), (Section, p.section_id)],
        };

        candidates
            .into_iter()
            .filter_map(|(kind, id)| id.map(|id| LegacyKey::new(kind, id)))
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyAssignment {
    pub principal_id: PrincipalId,
    pub unit: LegacyKey,
    pub title: Option<String>,
    pub is_primary: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickerMode {
    Approvals,
    Routing,
    Chart,
    All,
}

impl PickerMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approvals" => Some(Self::Approvals),
            "routing" | "routes" => Some(Self::Routing),
            "chart" => Some(Self::Chart),
            "all" | "" => Some(Self::All),
            _ => None,
        }
    }

    pub fn admits(&self, node_type: Option<&OrgNodeType>) -> bool {
        match self {
            Self::All => true,
            Self::Approvals => node_type.is_some_and(|t| t.allow_in_approvals),
            Self::Routing => node_type.is_some_and(|t| t.show_in_routing),
            Self::Chart => node_type.is_some_and(|t| t.show_in_chart),
        }
    }
}
