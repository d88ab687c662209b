use serde::{Deserialize, Serialize};

use crate::approvals::validation::ValidationError;
use crate::domain::committee::CommitteeId;
use crate::domain::org::{LegacyKind, OrgNodeId};
use crate::domain::principal::PrincipalId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TemplateId(pub String);

impl std::fmt::Display for TemplateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepTemplateId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Sequential,
    ParallelSync,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "SEQUENTIAL",
            Self::ParallelSync => "PARALLEL_SYNC",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SEQUENTIAL" => Some(Self::Sequential),
            "PARALLEL_SYNC" | "PARALLEL" => Some(Self::ParallelSync),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApproverKind {
    User,
    Role,
    Directorate,
    Unit,
    Department,
    Section,
    Division,
    OrgNode,
    Committee,
}

impl ApproverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Role => "ROLE",
            Self::Directorate => "DIRECTORATE",
            Self::Unit => "UNIT",
            Self::Department => "DEPARTMENT",
            Self::Section => "SECTION",
            Self::Division => "DIVISION",
            Self::OrgNode => "ORG_NODE",
            Self::Committee => "COMMITTEE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "USER" => Some(Self::User),
            "ROLE" => Some(Self::Role),
            "DIRECTORATE" => Some(Self::Directorate),
            "UNIT" => Some(Self::Unit),
            "DEPARTMENT" => Some(Self::Department),
            "SECTION" => Some(Self::Section),
            "DIVISION" => Some(Self::Division),
            "ORG_NODE" => Some(Self::OrgNode),
            "COMMITTEE" => Some(Self::Committee),
            _ => None,
        }
    }

    fn org_level(&self) -> Option<LegacyKind> {
        match self {
            Self::Directorate => Some(LegacyKind::Directorate),
            Self::Unit => Some(LegacyKind::Unit),
            Self::Department => Some(LegacyKind::Department),
            Self::Section => Some(LegacyKind::Section),
            Self::Division => Some(LegacyKind::Division),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommitteeDeliveryMode {
    #[default]
    All,
    Chair,
    Secretary,
}

impl CommitteeDeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Chair => "CHAIR",
            Self::Secretary => "SECRETARY",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ALL" | "" => Some(Self::All),
            "CHAIR" => Some(Self::Chair),
            "SECRETARY" => Some(Self::Secretary),
            _ => None,
        }
    }
}

/// Persisted shape of an approver specification: a discriminator plus one
/// nullable reference column per kind.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverFields {
    pub kind: ApproverKind,
    pub principal_id: Option<PrincipalId>,
    pub role_code: Option<String>,
    pub directorate_id: Option<i64>,
    pub unit_id: Option<i64>,
    pub department_id: Option<i64>,
    pub section_id: Option<i64>,
    pub division_id: Option<i64>,
    pub org_node_id: Option<OrgNodeId>,
    pub committee_id: Option<CommitteeId>,
    pub committee_delivery: CommitteeDeliveryMode,
}

impl ApproverFields {
    pub fn empty(kind: ApproverKind) -> Self {
        Self {
            kind,
            principal_id: None,
            role_code: None,
            directorate_id: None,
            unit_id: None,
            department_id: None,
            section_id: None,
            division_id: None,
            org_node_id: None,
            committee_id: None,
            committee_delivery: CommitteeDeliveryMode::All,
        }
    }

    /// Kinds whose reference column is populated. A blank role code does
    /// not count.
    pub fn populated(&self) -> Vec<ApproverKind> {
        let role_populated =
            self.role_code.as_deref().map(|role| !role.trim().is_empty()).unwrap_or(false);
        [
            (ApproverKind::User, self.principal_id.is_some()),
            (ApproverKind::Role, role_populated),
            (ApproverKind::Directorate, self.directorate_id.is_some()),
            (ApproverKind::Unit, self.unit_id.is_some()),
            (ApproverKind::Department, self.department_id.is_some()),
            (ApproverKind::Section, self.section_id.is_some()),
            (ApproverKind::Division, self.division_id.is_some()),
            (ApproverKind::OrgNode, self.org_node_id.is_some()),
            (ApproverKind::Committee, self.committee_id.is_some()),
        ]
        .into_iter()
        .filter_map(|(kind, populated)| populated.then_some(kind))
        .collect()
    }

    fn level_id(&self, level: LegacyKind) -> Option<i64> {
        match level {
            LegacyKind::Directorate => self.directorate_id,
            LegacyKind::Unit => self.unit_id,
            LegacyKind::Department => self.department_id,
            LegacyKind::Section => self.section_id,
            LegacyKind::Division => self.division_id,
            _ => None,
        }
    }
}

/// Validated approver specification.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApproverSpec {
    User { principal_id: PrincipalId },
    Role { role_code: String },
    OrgLevel { level: LegacyKind, unit_id: i64 },
    OrgNode { node_id: OrgNodeId },
    Committee { committee_id: CommitteeId, delivery: CommitteeDeliveryMode },
}

impl ApproverSpec {
    pub fn user(principal_id: impl Into<String>) -> Self {
        Self::User { principal_id: PrincipalId::new(principal_id) }
    }

    pub fn role(role_code: impl Into<String>) -> Self {
        Self::Role { role_code: role_code.into() }
    }

    pub fn committee(committee_id: CommitteeId, delivery: CommitteeDeliveryMode) -> Self {
        Self::Committee { committee_id, delivery }
    }

    /// Structural check: exactly one populated reference column and it
    /// matches the declared kind.
    pub fn from_fields(fields: &ApproverFields) -> Result<Self, ValidationError> {
        let populated = fields.populated();
        match populated.as_slice() {
            [] => return Err(ValidationError::MissingReference { kind: fields.kind.as_str() }),
            [only] if *only != fields.kind => {
                return Err(ValidationError::ReferenceKindMismatch {
                    kind: fields.kind.as_str(),
                    populated: only.as_str(),
                });
            }
            [_] => {}
            many => {
                return Err(ValidationError::MultipleReferences {
                    kind: fields.kind.as_str(),
                    populated: many.iter().map(ApproverKind::as_str).collect(),
                });
            }
        }

        let spec = match fields.kind {
            ApproverKind::User => fields
                .principal_id
                .clone()
                .map(|principal_id| Self::User { principal_id }),
            ApproverKind::Role => fields
                .role_code
                .as_deref()
                .map(|role| Self::Role { role_code: role.trim().to_string() }),
            ApproverKind::OrgNode => fields.org_node_id.map(|node_id| Self::OrgNode { node_id }),
            ApproverKind::Committee => fields.committee_id.map(|committee_id| Self::Committee {
                committee_id,
                delivery: fields.committee_delivery,
            }),
            kind => kind.org_level().and_then(|level| {
                fields.level_id(level).map(|unit_id| Self::OrgLevel { level, unit_id })
            }),
        };

        spec.ok_or(ValidationError::MissingReference { kind: fields.kind.as_str() })
    }

    pub fn kind(&self) -> ApproverKind {
        match self {
            Self::User { .. } => ApproverKind::User,
            Self::Role { .. } => ApproverKind::Role,
            Self::OrgLevel { level, .. } => match level {
                LegacyKind::Directorate => ApproverKind::Directorate,
                LegacyKind::Unit => ApproverKind::Unit,
                LegacyKind::Department => ApproverKind::Department,
                LegacyKind::Section => ApproverKind::Section,
                _ => ApproverKind::Division,
            },
            Self::OrgNode { .. } => ApproverKind::OrgNode,
            Self::Committee { .. } => ApproverKind::Committee,
        }
    }

    /// Role a step assigned to this spec is "held by", for request routing
    /// and escalation bookkeeping.
    pub fn role_hint(&self) -> Option<&str> {
        match self {
            Self::Role { role_code } => Some(role_code.as_str()),
            _ => None,
        }
    }

    pub fn to_fields(&self) -> ApproverFields {
        let mut fields = ApproverFields::empty(self.kind());
        match self {
            Self::User { principal_id } => fields.principal_id = Some(principal_id.clone()),
            Self::Role { role_code } => fields.role_code = Some(role_code.clone()),
            Self::OrgLevel { level, unit_id } => match level {
                LegacyKind::Directorate => fields.directorate_id = Some(*unit_id),
                LegacyKind::Unit => fields.unit_id = Some(*unit_id),
                LegacyKind::Department => fields.department_id = Some(*unit_id),
                LegacyKind::Section => fields.section_id = Some(*unit_id),
                _ => fields.division_id = Some(*unit_id),
            },
            Self::OrgNode { node_id } => fields.org_node_id = Some(*node_id),
            Self::Committee { committee_id, delivery } => {
                fields.committee_id = Some(*committee_id);
                fields.committee_delivery = *delivery;
            }
        }
        fields
    }
}

impl std::fmt::Display for ApproverSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User { principal_id } => write!(f, "USER {principal_id}"),
            Self::Role { role_code } => write!(f, "ROLE {role_code}"),
            Self::OrgLevel { level, unit_id } => write!(f, "{} {unit_id}", level.as_str()),
            Self::OrgNode { node_id } => write!(f, "ORG_NODE {node_id}"),
            Self::Committee { committee_id, delivery } => {
                write!(f, "COMMITTEE {committee_id} ({})", delivery.as_str())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelAssignee {
    pub id: String,
    pub approver: ApproverFields,
}

/// Longest SLA, in days, a template or setting may carry.
pub const MAX_SLA_DAYS: u32 = 3650;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub id: StepTemplateId,
    pub step_order: u32,
    pub mode: ExecutionMode,
    pub approver: ApproverFields,
    pub sla_days: Option<u32>,
    pub co_assignees: Vec<ParallelAssignee>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: TemplateId,
    pub name: String,
    pub sla_days_default: Option<u32>,
    pub active: bool,
    pub steps: Vec<StepTemplate>,
}

impl WorkflowTemplate {
    pub fn step(&self, step_order: u32) -> Option<&StepTemplate> {
        self.steps.iter().find(|step| step.step_order == step_order)
    }

    pub fn first_step(&self) -> Option<&StepTemplate> {
        self.steps.iter().min_by_key(|step| step.step_order)
    }

    pub fn next_step_after(&self, step_order: u32) -> Option<&StepTemplate> {
        self.steps
            .iter()
            .filter(|step| step.step_order > step_order)
            .min_by_key(|step| step.step_order)
    }

    /// Step override, then template default, then the system default.
    pub fn sla_days_for(&self, step: &StepTemplate, system_default: u32) -> u32 {
        step.sla_days.or(self.sla_days_default).unwrap_or(system_default)
    }

    /// Removes a step and renumbers the remaining ones 1..n.
    pub fn remove_step(&mut self, step_order: u32) -> Option<StepTemplate> {
        let index = self.steps.iter().position(|step| step.step_order == step_order)?;
        let removed = self.steps.remove(index);
        self.resequence();
        Some(removed)
    }

    pub fn resequence(&mut self) {
        self.steps.sort_by_key(|step| step.step_order);
        for (index, step) in self.steps.iter_mut().enumerate() {
            step.step_order = index as u32 + 1;
        }
    }
}
