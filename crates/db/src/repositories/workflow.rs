use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;
use tracing::{info, warn};
use uuid::Uuid;

use routewise_core::approvals::ApproverResolver;
use routewise_core::delegation::DelegationResolver;
use routewise_core::domain::instance::{
    Decision, InstanceId, InstanceStep, InstanceStepId, StepParticipant, StepStatus,
    WorkflowInstance,
};
use routewise_core::domain::principal::PrincipalId;
use routewise_core::domain::request::{RequestId, RequestStatus, WorkflowRequest};
use routewise_core::domain::template::{ApproverSpec, ExecutionMode, TemplateId};
use routewise_core::workflow::{
    DecisionCommand, EngineOutcome, InstanceEngine, RequestUpdate, WorkflowError,
};

use super::delegation::resolve_acting;
use super::directory::load_directory;
use super::outbox::Outbox;
use super::template::load_template;
use super::{
    approver_from_row, bind_approver, column, flag, format_timestamp, optional_timestamp,
    small_number, timestamp, RepositoryError, WorkflowRepository, APPROVER_COLUMNS,
};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, requester_id, title, status, current_role, is_escalated, \
     escalated_at, created_at, current_step_started_at";

/// Requests and the instances driving them. Every mutation runs the pure
/// engine against a snapshot read inside the same transaction, then writes
/// the new snapshot together with its audit and notification rows.
pub struct SqlWorkflowRepository {
    pool: DbPool,
    engine: InstanceEngine,
    resolver: DelegationResolver,
}

impl SqlWorkflowRepository {
    pub fn new(pool: DbPool, engine: InstanceEngine, resolver: DelegationResolver) -> Self {
        Self { pool, engine, resolver }
    }

    pub async fn create_request(&self, request: &WorkflowRequest) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO workflow_request (id, requester_id, title, status, current_role,
                                           is_escalated, escalated_at, created_at,
                                           current_step_started_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id.0)
        .bind(&request.requester_id.0)
        .bind(request.title.trim())
        .bind(request.status.as_str())
        .bind(&request.current_role)
        .bind(request.is_escalated)
        .bind(request.escalated_at.map(format_timestamp))
        .bind(format_timestamp(request.created_at))
        .bind(request.current_step_started_at.map(format_timestamp))
        .bind(format_timestamp(request.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_instance_by_step(
        &self,
        step_id: &InstanceStepId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let Some(instance_id) = instance_id_for_step(&mut conn, step_id).await? else {
            return Ok(None);
        };
        load_instance(&mut conn, &instance_id).await
    }
}

#[async_trait]
impl WorkflowRepository for SqlWorkflowRepository {
    async fn find_request(&self, id: &RequestId) -> Result<Option<WorkflowRequest>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        load_request(&mut conn, id).await
    }

    async fn find_instance_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Option<WorkflowInstance>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        load_instance_for_request(&mut conn, request_id).await
    }

    async fn start_instance(
        &self,
        request_id: &RequestId,
        template_id: &TemplateId,
        actor_id: &PrincipalId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<EngineOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let request = load_request(&mut *tx, request_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("request", request_id))?;
        if load_instance_for_request(&mut *tx, request_id).await?.is_some() {
            return Err(WorkflowError::AlreadyStarted(request_id.clone()).into());
        }
        let template = load_template(&mut *tx, template_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("template", template_id))?;
        let directory = load_directory(&mut *tx).await?;

        let outbox = Outbox::default();
        let outcome = self.engine.start(
            InstanceId(Uuid::new_v4().to_string()),
            &request,
            &template,
            actor_id,
            &ApproverResolver::new(&directory),
            &outbox.context(now, correlation_id),
        )?;

        persist_instance(&mut *tx, &outcome.instance).await?;
        if let Some(update) = &outcome.request {
            apply_request_update(&mut *tx, request_id, update, now).await?;
        }
        outbox.flush(&mut *tx).await?;
        tx.commit().await?;

        info!(
            event_name = "workflow.instance_started",
            correlation_id,
            request_id = %request_id,
            instance_id = %outcome.instance.id,
            template_id = %template_id,
            "workflow instance started"
        );
        log_unresolvable(&[], &outcome.instance, correlation_id);
        Ok(outcome)
    }

    async fn record_decision(
        &self,
        step_id: &InstanceStepId,
        decision: Decision,
        actor_id: &PrincipalId,
        note: Option<String>,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<EngineOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let instance_id = instance_id_for_step(&mut *tx, step_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("instance step", step_id))?;
        let instance = load_instance(&mut *tx, &instance_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("instance", &instance_id))?;
        let request = load_request(&mut *tx, &instance.request_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("request", &instance.request_id))?;
        let template = load_template(&mut *tx, &instance.template_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("template", &instance.template_id))?;
        let directory = load_directory(&mut *tx).await?;
        let acting = resolve_acting(&mut *tx, &self.resolver, actor_id, now).await?;

        let command = DecisionCommand {
            step_id: step_id.clone(),
            decision,
            note: note.map(|note| note.trim().to_string()).filter(|note| !note.is_empty()),
        };
        let outbox = Outbox::default();
        let decided = self.engine.decide(
            &instance,
            &request,
            &template,
            &command,
            &acting,
            &ApproverResolver::new(&directory),
            &outbox.context(now, correlation_id),
        );
        let outcome = match decided {
            Ok(outcome) => outcome,
            Err(error) => {
                if error.is_conflict() {
                    info!(
                        event_name = "workflow.decision_conflict",
                        correlation_id,
                        step_id = %step_id,
                        actor = %actor_id,
                        error = %error,
                        "decision rejected as a conflict"
                    );
                }
                return Err(error.into());
            }
        };

        claim_decision(&mut *tx, &instance, &outcome.instance, step_id).await?;
        persist_instance(&mut *tx, &outcome.instance).await?;
        if let Some(update) = &outcome.request {
            apply_request_update(&mut *tx, &request.id, update, now).await?;
        }
        outbox.flush(&mut *tx).await?;
        tx.commit().await?;

        info!(
            event_name = "workflow.decision_recorded",
            correlation_id,
            request_id = %request.id,
            step_id = %step_id,
            actor = %acting.actor.id,
            on_behalf_of = %acting.effective.id,
            decision = decision.as_str(),
            completed = outcome.instance.completed,
            "decision recorded"
        );
        log_unresolvable(&instance.steps, &outcome.instance, correlation_id);
        Ok(outcome)
    }
}

/// Writes the decided step and participant with `... AND still undecided`
/// guards. A writer that lost the race sees zero affected rows and gets a
/// conflict instead of overwriting the winner.
async fn claim_decision(
    conn: &mut SqliteConnection,
    before: &WorkflowInstance,
    after: &WorkflowInstance,
    step_id: &InstanceStepId,
) -> Result<(), RepositoryError> {
    let (Some(old), Some(new)) = (before.step(step_id), after.step(step_id)) else {
        return Err(WorkflowError::StepNotFound(step_id.clone()).into());
    };
    let conflict = || -> RepositoryError {
        WorkflowError::ConcurrencyConflict { step_id: step_id.clone(), status: new.status }.into()
    };

    for participant in &new.participants {
        let was_open = old
            .participant(&participant.principal_id)
            .is_some_and(|previous| previous.decision.is_none());
        if !was_open || participant.decision.is_none() {
            continue;
        }
        let result = sqlx::query(
            "UPDATE workflow_step_participant
             SET decision = ?, decided_by = ?, note = ?, decided_at = ?
             WHERE step_id = ? AND principal_id = ? AND decision IS NULL",
        )
        .bind(participant.decision.map(|d| d.as_str()))
        .bind(participant.decided_by.as_ref().map(|id| id.0.as_str()))
        .bind(&participant.note)
        .bind(participant.decided_at.map(format_timestamp))
        .bind(&step_id.0)
        .bind(&participant.principal_id.0)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(conflict());
        }
    }

    if new.status != StepStatus::Pending {
        let result = sqlx::query(
            "UPDATE workflow_instance_step
             SET status = ?, decided_by = ?, decision_note = ?, decided_at = ?
             WHERE id = ? AND status = 'PENDING'",
        )
        .bind(new.status.as_str())
        .bind(new.decided_by.as_ref().map(|id| id.0.as_str()))
        .bind(&new.decision_note)
        .bind(new.decided_at.map(format_timestamp))
        .bind(&step_id.0)
        .execute(&mut *conn)
        .await?;
        if result.rows_affected() == 0 {
            return Err(conflict());
        }
    }
    Ok(())
}

fn log_unresolvable(previous: &[InstanceStep], instance: &WorkflowInstance, correlation_id: &str) {
    let known: HashSet<&InstanceStepId> = previous.iter().map(|step| &step.id).collect();
    for step in instance.steps.iter().filter(|step| !known.contains(&step.id)) {
        if step.is_unresolvable() {
            warn!(
                event_name = "workflow.step_unresolvable",
                correlation_id,
                request_id = %instance.request_id,
                step_id = %step.id,
                step_order = step.step_order,
                approver = %step.approver,
                "step has no resolvable approver; left pending"
            );
        }
    }
}

pub(crate) async fn load_request(
    conn: &mut SqliteConnection,
    id: &RequestId,
) -> Result<Option<WorkflowRequest>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM workflow_request WHERE id = ?"))
        .bind(&id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(row_to_request).transpose()
}

/// Requests the escalation sweep may consider: not final, not yet escalated.
pub(crate) async fn load_open_requests(
    conn: &mut SqliteConnection,
) -> Result<Vec<WorkflowRequest>, RepositoryError> {
    let rows = sqlx::query(&format!(
        "SELECT {REQUEST_COLUMNS} FROM workflow_request
         WHERE status NOT IN ('APPROVED', 'REJECTED') AND is_escalated = 0
         ORDER BY created_at, id"
    ))
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_request).collect()
}

pub(crate) async fn apply_request_update(
    conn: &mut SqliteConnection,
    id: &RequestId,
    update: &RequestUpdate,
    now: DateTime<Utc>,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "UPDATE workflow_request
         SET status = ?, current_role = ?, current_step_started_at = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(update.status.as_str())
    .bind(&update.current_role)
    .bind(update.current_step_started_at.map(format_timestamp))
    .bind(format_timestamp(now))
    .bind(&id.0)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn row_to_request(row: &SqliteRow) -> Result<WorkflowRequest, RepositoryError> {
    let status: String = column(row, "status")?;
    Ok(WorkflowRequest {
        id: RequestId(column(row, "id")?),
        requester_id: PrincipalId(column(row, "requester_id")?),
        title: column(row, "title")?,
        status: RequestStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown request status `{status}`")))?,
        current_role: column(row, "current_role")?,
        is_escalated: flag(row, "is_escalated")?,
        escalated_at: optional_timestamp(row, "escalated_at")?,
        created_at: timestamp(row, "created_at")?,
        current_step_started_at: optional_timestamp(row, "current_step_started_at")?,
    })
}

async fn instance_id_for_step(
    conn: &mut SqliteConnection,
    step_id: &InstanceStepId,
) -> Result<Option<InstanceId>, RepositoryError> {
    let row = sqlx::query("SELECT instance_id FROM workflow_instance_step WHERE id = ?")
        .bind(&step_id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(|row| column(row, "instance_id").map(InstanceId)).transpose()
}

pub(crate) async fn load_instance_for_request(
    conn: &mut SqliteConnection,
    request_id: &RequestId,
) -> Result<Option<WorkflowInstance>, RepositoryError> {
    let row = sqlx::query("SELECT id FROM workflow_instance WHERE request_id = ?")
        .bind(&request_id.0)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let id = InstanceId(column(&row, "id")?);
    load_instance(conn, &id).await
}

pub(crate) async fn load_instance(
    conn: &mut SqliteConnection,
    id: &InstanceId,
) -> Result<Option<WorkflowInstance>, RepositoryError> {
    let Some(row) = sqlx::query(
        "SELECT id, request_id, template_id, current_step_order, completed, outcome,
                started_at, completed_at
         FROM workflow_instance WHERE id = ?",
    )
    .bind(&id.0)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };

    let participant_rows = sqlx::query(
        "SELECT step_id, principal_id, decision, decided_by, note, decided_at
         FROM workflow_step_participant
         WHERE step_id IN (SELECT id FROM workflow_instance_step WHERE instance_id = ?)
         ORDER BY rowid",
    )
    .bind(&id.0)
    .fetch_all(&mut *conn)
    .await?;
    let mut participants: HashMap<String, Vec<StepParticipant>> = HashMap::new();
    for row in &participant_rows {
        let step_id: String = column(row, "step_id")?;
        participants.entry(step_id).or_default().push(row_to_participant(row)?);
    }

    let sql = format!(
        "SELECT id, step_order, execution_mode, {APPROVER_COLUMNS}, resolved_role, status,
                started_at, due_at, decided_by, decision_note, decided_at
         FROM workflow_instance_step WHERE instance_id = ? ORDER BY seq"
    );
    let step_rows = sqlx::query(&sql).bind(&id.0).fetch_all(&mut *conn).await?;
    let steps = step_rows
        .iter()
        .map(|row| -> Result<InstanceStep, RepositoryError> {
            let id: String = column(row, "id")?;
            let participants = participants.remove(&id).unwrap_or_default();
            row_to_step(row, InstanceStepId(id), participants)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let outcome: Option<String> = column(&row, "outcome")?;
    let outcome = outcome
        .map(|raw| {
            Decision::parse(&raw)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown outcome `{raw}`")))
        })
        .transpose()?;

    Ok(Some(WorkflowInstance {
        id: InstanceId(column(&row, "id")?),
        request_id: RequestId(column(&row, "request_id")?),
        template_id: TemplateId(column(&row, "template_id")?),
        current_step_order: small_number(&row, "current_step_order")?,
        completed: flag(&row, "completed")?,
        outcome,
        started_at: timestamp(&row, "started_at")?,
        completed_at: optional_timestamp(&row, "completed_at")?,
        steps,
    }))
}

fn row_to_step(
    row: &SqliteRow,
    id: InstanceStepId,
    participants: Vec<StepParticipant>,
) -> Result<InstanceStep, RepositoryError> {
    let mode: String = column(row, "execution_mode")?;
    let status: String = column(row, "status")?;
    let approver = ApproverSpec::from_fields(&approver_from_row(row)?)
        .map_err(|e| RepositoryError::Decode(format!("instance step {id}: {e}")))?;

    Ok(InstanceStep {
        step_order: small_number(row, "step_order")?
            .ok_or_else(|| RepositoryError::Decode(format!("instance step {id} has no order")))?,
        mode: ExecutionMode::parse(&mode)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown execution mode `{mode}`")))?,
        approver,
        resolved_role: column(row, "resolved_role")?,
        status: StepStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown step status `{status}`")))?,
        participants,
        started_at: timestamp(row, "started_at")?,
        due_at: timestamp(row, "due_at")?,
        decided_by: column::<Option<String>>(row, "decided_by")?.map(PrincipalId),
        decision_note: column(row, "decision_note")?,
        decided_at: optional_timestamp(row, "decided_at")?,
        id,
    })
}

fn row_to_participant(row: &SqliteRow) -> Result<StepParticipant, RepositoryError> {
    let decision: Option<String> = column(row, "decision")?;
    let decision = decision
        .map(|raw| {
            Decision::parse(&raw)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown decision `{raw}`")))
        })
        .transpose()?;

    Ok(StepParticipant {
        principal_id: PrincipalId(column(row, "principal_id")?),
        decision,
        decided_by: column::<Option<String>>(row, "decided_by")?.map(PrincipalId),
        note: column(row, "note")?,
        decided_at: optional_timestamp(row, "decided_at")?,
    })
}

/// Upserts the instance row, every step (keyed by id, sequenced by
/// position) and every participant.
pub(crate) async fn persist_instance(
    conn: &mut SqliteConnection,
    instance: &WorkflowInstance,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO workflow_instance (id, request_id, template_id, current_step_order, completed,
                                        outcome, started_at, completed_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             current_step_order = excluded.current_step_order,
             completed = excluded.completed,
             outcome = excluded.outcome,
             completed_at = excluded.completed_at",
    )
    .bind(&instance.id.0)
    .bind(&instance.request_id.0)
    .bind(&instance.template_id.0)
    .bind(instance.current_step_order.map(i64::from))
    .bind(instance.completed)
    .bind(instance.outcome.map(|outcome| outcome.as_str()))
    .bind(format_timestamp(instance.started_at))
    .bind(instance.completed_at.map(format_timestamp))
    .execute(&mut *conn)
    .await?;

    for (seq, step) in instance.steps.iter().enumerate() {
        let sql = format!(
            "INSERT INTO workflow_instance_step (id, instance_id, seq, step_order, execution_mode,
                 {APPROVER_COLUMNS}, resolved_role, status, started_at, due_at, decided_by,
                 decision_note, decided_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 decided_by = excluded.decided_by,
                 decision_note = excluded.decision_note,
                 decided_at = excluded.decided_at"
        );
        let query = sqlx::query(&sql)
            .bind(&step.id.0)
            .bind(&instance.id.0)
            .bind(seq as i64)
            .bind(i64::from(step.step_order))
            .bind(step.mode.as_str());
        bind_approver(query, &step.approver.to_fields())
            .bind(&step.resolved_role)
            .bind(step.status.as_str())
            .bind(format_timestamp(step.started_at))
            .bind(format_timestamp(step.due_at))
            .bind(step.decided_by.as_ref().map(|id| id.0.as_str()))
            .bind(&step.decision_note)
            .bind(step.decided_at.map(format_timestamp))
            .execute(&mut *conn)
            .await?;

        for participant in &step.participants {
            sqlx::query(
                "INSERT INTO workflow_step_participant (step_id, principal_id, decision,
                                                        decided_by, note, decided_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(step_id, principal_id) DO UPDATE SET
                     decision = excluded.decision,
                     decided_by = excluded.decided_by,
                     note = excluded.note,
                     decided_at = excluded.decided_at",
            )
            .bind(&step.id.0)
            .bind(&participant.principal_id.0)
            .bind(participant.decision.map(|d| d.as_str()))
            .bind(participant.decided_by.as_ref().map(|id| id.0.as_str()))
            .bind(&participant.note)
            .bind(participant.decided_at.map(format_timestamp))
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}
