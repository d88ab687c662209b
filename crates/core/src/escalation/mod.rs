use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::approvals::normalize_key;
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome};
use crate::config::EscalationConfig;
use crate::domain::request::{RequestId, RequestStatus, WorkflowRequest};
use crate::domain::template::MAX_SLA_DAYS;

pub const SCHEDULER_ACTOR: &str = "escalation-scheduler";

/// Hard floor on the worker sleep between ticks.
pub const MIN_POLL_INTERVAL_SECS: u64 = 10;

/// Keys of the `system_setting` store the scheduler reads and writes.
pub mod keys {
    pub const SLA_DAYS: &str = "SLA_DAYS";
    pub const ESCALATION_DAYS: &str = "ESCALATION_DAYS";
    pub const ESCALATION_THROTTLE_SECS: &str = "ESCALATION_THROTTLE_SECS";
    pub const ESCALATION_INTERVAL_SECS: &str = "ESCALATION_INTERVAL_SECS";
    pub const ESCALATION_LAST_RUN: &str = "ESCALATION_LAST_RUN";
}

/// Timestamp a request's age is measured from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeBasis {
    #[default]
    CreatedAt,
    StepStartedAt,
}

impl AgeBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreatedAt => "created_at",
            Self::StepStartedAt => "step_started_at",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "created_at" | "created" => Some(Self::CreatedAt),
            "step_started_at" | "step_started" => Some(Self::StepStartedAt),
            _ => None,
        }
    }

    /// Requests that never recorded a step start fall back to creation.
    pub fn anchor(&self, request: &WorkflowRequest) -> DateTime<Utc> {
        match self {
            Self::CreatedAt => request.created_at,
            Self::StepStartedAt => request.current_step_started_at.unwrap_or(request.created_at),
        }
    }
}

/// Fixed role remapping applied on escalation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationRoleMap {
    routes: BTreeMap<String, String>,
    fallback: String,
}

impl Default for EscalationRoleMap {
    fn default() -> Self {
        Self::new(Self::DEFAULT_FALLBACK)
            .with_route("dept_head", "secretary_general")
            .with_route("finance", "secretary_general")
    }
}

impl EscalationRoleMap {
    pub const DEFAULT_FALLBACK: &'static str = "secretary_general";
    /// Role assumed for requests that never recorded one.
    pub const DEFAULT_SOURCE: &'static str = "dept_head";

    pub fn new(fallback: impl Into<String>) -> Self {
        Self { routes: BTreeMap::new(), fallback: fallback.into() }
    }

    pub fn with_route(mut self, from: &str, to: impl Into<String>) -> Self {
        self.routes.insert(normalize_key(from), to.into());
        self
    }

    pub fn source_role(current: Option<&str>) -> String {
        current
            .map(str::trim)
            .filter(|role| !role.is_empty())
            .unwrap_or(Self::DEFAULT_SOURCE)
            .to_string()
    }

    pub fn next_role(&self, current: Option<&str>) -> String {
        let source = Self::source_role(current);
        self.routes.get(&normalize_key(&source)).cloned().unwrap_or_else(|| self.fallback.clone())
    }
}

/// Escalation numbers in effect for one tick: config values overridden by
/// whatever the settings store holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EscalationSettings {
    pub sla_days: u32,
    pub grace_days: u32,
    pub throttle_secs: u64,
    pub poll_interval_secs: u64,
    pub last_run: Option<DateTime<Utc>>,
}

impl EscalationSettings {
    /// Absent, unparsable or out-of-range stored values fall back to `config`.
    pub fn resolve(stored: &BTreeMap<String, String>, config: &EscalationConfig) -> Self {
        fn stored_number<T: std::str::FromStr>(
            stored: &BTreeMap<String, String>,
            key: &str,
        ) -> Option<T> {
            stored.get(key).and_then(|value| value.trim().parse::<T>().ok())
        }

        let stored_days = |key: &str| {
            stored_number::<u32>(stored, key).filter(|days| *days <= MAX_SLA_DAYS)
        };

        Self {
            sla_days: stored_days(keys::SLA_DAYS).unwrap_or(config.sla_days),
            grace_days: stored_days(keys::ESCALATION_DAYS).unwrap_or(config.grace_days),
            throttle_secs: stored_number(stored, keys::ESCALATION_THROTTLE_SECS)
                .unwrap_or(config.throttle_secs),
            poll_interval_secs: stored_number(stored, keys::ESCALATION_INTERVAL_SECS)
                .unwrap_or(config.poll_interval_secs),
            last_run: stored
                .get(keys::ESCALATION_LAST_RUN)
                .and_then(|value| DateTime::parse_from_rfc3339(value.trim()).ok())
                .map(|value| value.with_timezone(&Utc)),
        }
    }

    pub fn threshold_days(&self) -> u32 {
        self.sla_days.saturating_add(self.grace_days)
    }

    /// Requests anchored before this instant are overdue. A threshold
    /// reaching past the calendar start means nothing is.
    pub fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        Duration::try_days(i64::from(self.threshold_days()))
            .and_then(|threshold| now.checked_sub_signed(threshold))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// True while the previous sweep is younger than the throttle window.
    pub fn is_throttled(&self, now: DateTime<Utc>) -> bool {
        let window = i64::try_from(self.throttle_secs).ok().and_then(Duration::try_seconds);
        self.last_run.is_some_and(|last_run| {
            window.map_or(true, |window| now.signed_duration_since(last_run) < window)
        })
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs.max(MIN_POLL_INTERVAL_SECS))
    }
}

/// One request to escalate in the current sweep.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PlannedEscalation {
    pub request_id: RequestId,
    pub from_status: RequestStatus,
    pub from_role: String,
    pub to_role: String,
    pub anchor: DateTime<Utc>,
}

impl PlannedEscalation {
    pub fn apply(&self, request: &mut WorkflowRequest, now: DateTime<Utc>) {
        request.status = RequestStatus::Escalated;
        request.is_escalated = true;
        request.escalated_at = Some(now);
        request.current_role = Some(self.to_role.clone());
    }

    pub fn audit_event(
        &self,
        correlation_id: &str,
        settings: &EscalationSettings,
        now: DateTime<Utc>,
    ) -> AuditEvent {
        AuditEvent::new(
            Some(self.request_id.clone()),
            correlation_id,
            "request.escalated",
            AuditCategory::Escalation,
            SCHEDULER_ACTOR,
            AuditOutcome::Success,
        )
        .with_transition(self.from_status.as_str(), RequestStatus::Escalated.as_str())
        .with_note(format!(
            "Escalated from {} to {} after {} days",
            self.from_role,
            self.to_role,
            settings.threshold_days()
        ))
        .with_metadata("from_role", self.from_role.clone())
        .with_metadata("to_role", self.to_role.clone())
        .with_metadata("sla_days", settings.sla_days.to_string())
        .with_metadata("grace_days", settings.grace_days.to_string())
        .at(now)
    }
}

/// Result of one scheduler tick. Skipping is a normal outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Skipped { last_run: Option<DateTime<Utc>> },
    Swept { escalated: usize },
}

/// Selects requests past `sla + grace` that are neither final nor already
/// escalated. Order follows the input.
pub fn plan_sweep(
    requests: &[WorkflowRequest],
    settings: &EscalationSettings,
    basis: AgeBasis,
    roles: &EscalationRoleMap,
    now: DateTime<Utc>,
) -> Vec<PlannedEscalation> {
    let deadline = settings.deadline(now);

    requests
        .iter()
        .filter(|request| !request.status.is_final() && !request.is_escalated)
        .filter_map(|request| {
            let anchor = basis.anchor(request);
            (anchor < deadline).then(|| PlannedEscalation {
                request_id: request.id.clone(),
                from_status: request.status,
                from_role: EscalationRoleMap::source_role(request.current_role.as_deref()),
                to_role: roles.next_role(request.current_role.as_deref()),
                anchor,
            })
        })
        .collect()
}
