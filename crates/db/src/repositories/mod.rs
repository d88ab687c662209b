use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite};
use thiserror::Error;

use routewise_core::approvals::ValidationError;
use routewise_core::delegation::{ActingIdentity, DelegationError, DelegationGrant};
use routewise_core::domain::committee::CommitteeId;
use routewise_core::domain::delegation::{Delegation, DelegationId};
use routewise_core::domain::instance::{Decision, InstanceStepId, WorkflowInstance};
use routewise_core::domain::org::OrgNodeId;
use routewise_core::domain::principal::PrincipalId;
use routewise_core::domain::request::{RequestId, WorkflowRequest};
use routewise_core::domain::template::{
    ApproverFields, ApproverKind, CommitteeDeliveryMode, TemplateId, WorkflowTemplate,
};
use routewise_core::errors::{ApplicationError, DomainError};
use routewise_core::workflow::{EngineOutcome, WorkflowError};

pub mod delegation;
pub mod directory;
pub mod escalation;
pub mod org;
pub mod outbox;
pub mod settings;
pub mod template;
pub mod workflow;

pub use delegation::SqlDelegationRepository;
pub use directory::SqlDirectoryRepository;
pub use escalation::SqlEscalationRepository;
pub use org::SqlOrgRepository;
pub use outbox::SqlOutboxRepository;
pub use settings::SqlSettingsRepository;
pub use template::SqlTemplateRepository;
pub use workflow::SqlWorkflowRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl RepositoryError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    /// True for domain conflicts: a decision that lost a race, an edit to a
    /// template in use, an overlapping delegation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Domain(error) if error.is_conflict())
    }
}

impl From<ValidationError> for RepositoryError {
    fn from(value: ValidationError) -> Self {
        Self::Domain(value.into())
    }
}

impl From<WorkflowError> for RepositoryError {
    fn from(value: WorkflowError) -> Self {
        Self::Domain(value.into())
    }
}

impl From<DelegationError> for RepositoryError {
    fn from(value: DelegationError) -> Self {
        Self::Domain(value.into())
    }
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => Self::Persistence(error.to_string()),
            RepositoryError::Decode(message) => Self::Persistence(message),
            RepositoryError::NotFound { entity, id } => Self::NotFound { entity, id },
            RepositoryError::Domain(error) => Self::Domain(error),
        }
    }
}

#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn find_by_id(&self, id: &TemplateId)
        -> Result<Option<WorkflowTemplate>, RepositoryError>;
    async fn instance_count(&self, id: &TemplateId) -> Result<u64, RepositoryError>;
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn find_request(&self, id: &RequestId)
        -> Result<Option<WorkflowRequest>, RepositoryError>;

    async fn find_instance_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError>;

    async fn start_instance(
        &self,
        request_id: &RequestId,
        template_id: &TemplateId,
        actor_id: &PrincipalId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<EngineOutcome, RepositoryError>;

    async fn record_decision(
        &self,
        step_id: &InstanceStepId,
        decision: Decision,
        actor_id: &PrincipalId,
        note: Option<String>,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<EngineOutcome, RepositoryError>;
}

#[async_trait]
pub trait DelegationRepository: Send + Sync {
    async fn grant(
        &self,
        grant: &DelegationGrant,
        actor_id: &PrincipalId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<Delegation, RepositoryError>;

    async fn revoke(
        &self,
        id: DelegationId,
        actor_id: &PrincipalId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<Delegation, RepositoryError>;

    async fn acting_identity(
        &self,
        actor_id: &PrincipalId,
        now: DateTime<Utc>,
    ) -> Result<ActingIdentity, RepositoryError>;
}

pub(crate) fn column<T>(row: &SqliteRow, name: &str) -> Result<T, RepositoryError>
where
    T: for<'r> sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(|e| RepositoryError::Decode(e.to_string()))
}

pub(crate) fn flag(row: &SqliteRow, name: &str) -> Result<bool, RepositoryError> {
    column::<i64>(row, name).map(|value| value != 0)
}

pub(crate) fn small_number(row: &SqliteRow, name: &str) -> Result<Option<u32>, RepositoryError> {
    column::<Option<i64>>(row, name)?
        .map(|value| {
            u32::try_from(value)
                .map_err(|_| RepositoryError::Decode(format!("{name} is out of range: {value}")))
        })
        .transpose()
}

pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(name: &str, raw: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|value| value.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("{name} `{raw}`: {e}")))
}

pub(crate) fn timestamp(row: &SqliteRow, name: &str) -> Result<DateTime<Utc>, RepositoryError> {
    let raw: String = column(row, name)?;
    parse_timestamp(name, &raw)
}

pub(crate) fn optional_timestamp(
    row: &SqliteRow,
    name: &str,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    let raw: Option<String> = column(row, name)?;
    raw.map(|raw| parse_timestamp(name, &raw)).transpose()
}

/// The approver columns shared by step templates, co-assignees and
/// instance steps, in bind order.
pub(crate) const APPROVER_COLUMNS: &str = "approver_kind, principal_id, role_code, \
     directorate_id, unit_id, department_id, section_id, division_id, org_node_id, \
     committee_id, committee_delivery";

pub(crate) fn bind_approver<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    fields: &ApproverFields,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(fields.kind.as_str())
        .bind(fields.principal_id.as_ref().map(|id| id.0.clone()))
        .bind(fields.role_code.clone())
        .bind(fields.directorate_id)
        .bind(fields.unit_id)
        .bind(fields.department_id)
        .bind(fields.section_id)
        .bind(fields.division_id)
        .bind(fields.org_node_id.map(|id| id.0))
        .bind(fields.committee_id.map(|id| id.0))
        .bind(fields.committee_delivery.as_str())
}

pub(crate) fn approver_from_row(row: &SqliteRow) -> Result<ApproverFields, RepositoryError> {
    let kind: String = column(row, "approver_kind")?;
    let kind = ApproverKind::parse(&kind)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown approver kind `{kind}`")))?;
    let delivery: String = column(row, "committee_delivery")?;
    let committee_delivery = CommitteeDeliveryMode::parse(&delivery)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown committee delivery `{delivery}`")))?;

    Ok(ApproverFields {
        kind,
        principal_id: column::<Option<String>>(row, "principal_id")?.map(PrincipalId),
        role_code: column(row, "role_code")?,
        directorate_id: column(row, "directorate_id")?,
        unit_id: column(row, "unit_id")?,
        department_id: column(row, "department_id")?,
        section_id: column(row, "section_id")?,
        division_id: column(row, "division_id")?,
        org_node_id: column::<Option<i64>>(row, "org_node_id")?.map(OrgNodeId),
        committee_id: column::<Option<i64>>(row, "committee_id")?.map(CommitteeId),
        committee_delivery,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use chrono::{DateTime, TimeZone, Utc};

    use routewise_core::domain::principal::{OrgPlacement, Principal, PrincipalId};

    use crate::{connect_with_settings, migrations, DbPool};

    pub(crate) async fn pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    pub(crate) fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("valid timestamp")
            + chrono::Duration::days(n)
    }

    pub(crate) fn principal(id: &str, role: &str) -> Principal {
        Principal {
            id: PrincipalId::new(id),
            display_name: id.to_string(),
            email: Some(format!("{id}@example.org")),
            role: role.to_string(),
            active: true,
            placement: OrgPlacement::default(),
        }
    }
}
