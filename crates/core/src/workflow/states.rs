use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::validation::ValidationError;
use crate::domain::instance::{
    Decision, InstanceId, InstanceStepId, StepStatus, WorkflowInstance,
};
use crate::domain::principal::PrincipalId;
use crate::domain::request::{RequestId, RequestStatus};
use crate::domain::template::TemplateId;

/// How decisions on a PARALLEL_SYNC step aggregate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelDecisionPolicy {
    /// The first rejection finalizes the step; approval needs everyone.
    #[default]
    AnyRejectWins,
    /// Wait for every participant, then reject if anyone rejected.
    RequireAll,
}

impl ParallelDecisionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnyRejectWins => "any_reject_wins",
            Self::RequireAll => "require_all",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "any_reject_wins" => Some(Self::AnyRejectWins),
            "require_all" => Some(Self::RequireAll),
            _ => None,
        }
    }

    /// Aggregate for the recorded decisions, or `None` while the step must
    /// stay pending.
    pub fn aggregate(&self, decisions: &[Option<Decision>]) -> Option<Decision> {
        let any_rejected = decisions.iter().any(|d| *d == Some(Decision::Rejected));
        let all_decided = decisions.iter().all(Option::is_some);

        match self {
            Self::AnyRejectWins if any_rejected => Some(Decision::Rejected),
            _ if !all_decided || decisions.is_empty() => None,
            _ if any_rejected => Some(Decision::Rejected),
            _ => Some(Decision::Approved),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionCommand {
    pub step_id: InstanceStepId,
    pub decision: Decision,
    pub note: Option<String>,
}

/// New request-level state after an engine call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestUpdate {
    pub status: RequestStatus,
    pub current_role: Option<String>,
    pub current_step_started_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineOutcome {
    pub instance: WorkflowInstance,
    /// `None` when the request row needs no change, e.g. a parallel step
    /// still waiting on other participants.
    pub request: Option<RequestUpdate>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("template {0} is inactive")]
    TemplateInactive(TemplateId),
    #[error("template {0} has no steps")]
    TemplateHasNoSteps(TemplateId),
    #[error("template step {step_order} is invalid: {reason}")]
    InvalidTemplateStep { step_order: u32, reason: ValidationError },
    #[error("instance step {0} does not exist")]
    StepNotFound(InstanceStepId),
    #[error("instance step {step_id} is {}, not PENDING", .status.as_str())]
    ConcurrencyConflict { step_id: InstanceStepId, status: StepStatus },
    #[error("{principal_id} already decided step {step_id}")]
    AlreadyDecided { step_id: InstanceStepId, principal_id: PrincipalId },
    #[error("instance {0} is already completed")]
    InstanceCompleted(InstanceId),
    #[error("request {0} already has a workflow instance")]
    AlreadyStarted(RequestId),
    #[error("{actor} is not an approver of step {step_id}")]
    NotAuthorized { step_id: InstanceStepId, actor: PrincipalId },
    #[error("step {step_order} SLA of {sla_days} days puts its due date out of range")]
    DueDateOutOfRange { step_order: u32, sla_days: u32 },
}

impl WorkflowError {
    /// Conflicts are no-op failures: the caller raced someone else.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConcurrencyConflict { .. }
                | Self::AlreadyDecided { .. }
                | Self::InstanceCompleted(_)
                | Self::AlreadyStarted(_)
        )
    }
}
