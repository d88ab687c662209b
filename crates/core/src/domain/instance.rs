use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::principal::PrincipalId;
use crate::domain::request::RequestId;
use crate::domain::template::{ApproverSpec, ExecutionMode, TemplateId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceStepId(pub String);

impl std::fmt::Display for InstanceStepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
    Skipped,
    Escalated,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Skipped => "SKIPPED",
            Self::Escalated => "ESCALATED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "APPROVED" => Some(Self::Approved),
            "REJECTED" => Some(Self::Rejected),
            "SKIPPED" => Some(Self::Skipped),
            "ESCALATED" => Some(Self::Escalated),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Approved,
    Rejected,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Some(Self::Approved),
            "reject" | "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn step_status(&self) -> StepStatus {
        match self {
            Self::Approved => StepStatus::Approved,
            Self::Rejected => StepStatus::Rejected,
        }
    }
}

/// One resolved identity expected to act on a step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepParticipant {
    pub principal_id: PrincipalId,
    pub decision: Option<Decision>,
    /// Differs from `principal_id` when the decision came through a
    /// delegation.
    pub decided_by: Option<PrincipalId>,
    pub note: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl StepParticipant {
    pub fn outstanding(principal_id: PrincipalId) -> Self {
        Self { principal_id, decision: None, decided_by: None, note: None, decided_at: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStep {
    pub id: InstanceStepId,
    pub step_order: u32,
    pub mode: ExecutionMode,
    pub approver: ApproverSpec,
    /// Role recorded for routing at materialization time, when the approver
    /// is role based.
    pub resolved_role: Option<String>,
    pub status: StepStatus,
    pub participants: Vec<StepParticipant>,
    pub started_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub decided_by: Option<PrincipalId>,
    pub decision_note: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl InstanceStep {
    pub fn is_unresolvable(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn participant(&self, principal_id: &PrincipalId) -> Option<&StepParticipant> {
        self.participants.iter().find(|p| &p.principal_id == principal_id)
    }

    pub fn outstanding_count(&self) -> usize {
        self.participants.iter().filter(|p| p.decision.is_none()).count()
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == StepStatus::Pending && self.due_at < now
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub request_id: RequestId,
    pub template_id: TemplateId,
    pub current_step_order: Option<u32>,
    pub completed: bool,
    pub outcome: Option<Decision>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub steps: Vec<InstanceStep>,
}

impl WorkflowInstance {
    /// The pending step at the current pointer. After an escalation the
    /// replacement step shares the order of the step it replaced, so the
    /// most recently materialized one wins.
    pub fn current_step(&self) -> Option<&InstanceStep> {
        let order = self.current_step_order?;
        self.steps
            .iter()
            .rev()
            .find(|step| step.step_order == order && step.status == StepStatus::Pending)
    }

    pub fn step(&self, step_id: &InstanceStepId) -> Option<&InstanceStep> {
        self.steps.iter().find(|step| &step.id == step_id)
    }

    pub(crate) fn step_mut(&mut self, step_id: &InstanceStepId) -> Option<&mut InstanceStep> {
        self.steps.iter_mut().find(|step| &step.id == step_id)
    }
}
