use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::info;

use routewise_core::approvals::validation::check_structural_edit;
use routewise_core::approvals::TemplateValidator;
use routewise_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use routewise_core::domain::principal::PrincipalId;
use routewise_core::domain::template::{
    ExecutionMode, ParallelAssignee, StepTemplate, StepTemplateId, TemplateId, WorkflowTemplate,
};

use super::directory::load_directory;
use super::outbox::insert_audit_events;
use super::{
    approver_from_row, bind_approver, column, flag, format_timestamp, small_number,
    RepositoryError, TemplateRepository, APPROVER_COLUMNS,
};
use crate::DbPool;

pub struct SqlTemplateRepository {
    pool: DbPool,
}

impl SqlTemplateRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Validates `template` against current master data, then replaces the
    /// stored template and its step rows. Once instances exist only the name
    /// and active flag may change.
    pub async fn save(
        &self,
        template: &WorkflowTemplate,
        actor: &PrincipalId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<(), RepositoryError> {
        let directory = {
            let mut conn = self.pool.acquire().await?;
            load_directory(&mut conn).await?
        };
        TemplateValidator::new(&directory).validate_template(template)?;

        let mut tx = self.pool.begin().await?;
        let stored = load_template(&mut *tx, &template.id).await?;
        if let Some(stored) = &stored {
            let instances = count_instances(&mut *tx, &template.id).await?;
            check_structural_edit(stored, template, instances)?;
        }

        sqlx::query(
            "INSERT INTO workflow_template (id, name, sla_days_default, active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 sla_days_default = excluded.sla_days_default,
                 active = excluded.active,
                 updated_at = excluded.updated_at",
        )
        .bind(&template.id.0)
        .bind(template.name.trim())
        .bind(template.sla_days_default.map(i64::from))
        .bind(template.active)
        .bind(format_timestamp(now))
        .bind(format_timestamp(now))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM workflow_step_template WHERE template_id = ?")
            .bind(&template.id.0)
            .execute(&mut *tx)
            .await?;
        for step in &template.steps {
            insert_step(&mut *tx, &template.id, step).await?;
        }

        let event = AuditEvent::new(
            None,
            correlation_id,
            if stored.is_some() { "template.updated" } else { "template.created" },
            AuditCategory::Template,
            actor.0.clone(),
            AuditOutcome::Success,
        )
        .with_note(format!("{} ({} steps)", template.name.trim(), template.steps.len()))
        .with_metadata("template_id", template.id.0.clone())
        .at(now);
        insert_audit_events(&mut *tx, &[event]).await?;

        tx.commit().await?;
        info!(
            event_name = "template.saved",
            correlation_id,
            template_id = %template.id,
            steps = template.steps.len(),
            "workflow template saved"
        );
        Ok(())
    }

    /// Removes one step and renumbers the rest 1..n.
    pub async fn remove_step(
        &self,
        template_id: &TemplateId,
        step_order: u32,
        actor: &PrincipalId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<WorkflowTemplate, RepositoryError> {
        let mut template = self
            .find_by_id(template_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("template", template_id))?;
        template
            .remove_step(step_order)
            .ok_or_else(|| RepositoryError::not_found("template step", step_order))?;
        template.resequence();

        self.save(&template, actor, now, correlation_id).await?;
        Ok(template)
    }
}

#[async_trait::async_trait]
impl TemplateRepository for SqlTemplateRepository {
    async fn find_by_id(
        &self,
        id: &TemplateId,
    ) -> Result<Option<WorkflowTemplate>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        load_template(&mut conn, id).await
    }

    async fn instance_count(&self, id: &TemplateId) -> Result<u64, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        count_instances(&mut conn, id).await
    }
}

async fn count_instances(
    conn: &mut SqliteConnection,
    id: &TemplateId,
) -> Result<u64, RepositoryError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM workflow_instance WHERE template_id = ?")
        .bind(&id.0)
        .fetch_one(&mut *conn)
        .await?;
    Ok(u64::try_from(count).unwrap_or(0))
}

async fn insert_step(
    conn: &mut SqliteConnection,
    template_id: &TemplateId,
    step: &StepTemplate,
) -> Result<(), RepositoryError> {
    let sql = format!(
        "INSERT INTO workflow_step_template (id, template_id, step_order, execution_mode, sla_days,
                                             {APPROVER_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    let query = sqlx::query(&sql)
        .bind(&step.id.0)
        .bind(&template_id.0)
        .bind(i64::from(step.step_order))
        .bind(step.mode.as_str())
        .bind(step.sla_days.map(i64::from));
    bind_approver(query, &step.approver).execute(&mut *conn).await?;

    let sql = format!(
        "INSERT INTO workflow_step_assignee (id, step_template_id, position, {APPROVER_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    for (position, assignee) in step.co_assignees.iter().enumerate() {
        let query = sqlx::query(&sql)
            .bind(&assignee.id)
            .bind(&step.id.0)
            .bind(i64::try_from(position).unwrap_or(i64::MAX));
        bind_approver(query, &assignee.approver).execute(&mut *conn).await?;
    }
    Ok(())
}

pub(crate) async fn load_template(
    conn: &mut SqliteConnection,
    id: &TemplateId,
) -> Result<Option<WorkflowTemplate>, RepositoryError> {
    let Some(row) =
        sqlx::query("SELECT id, name, sla_days_default, active FROM workflow_template WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&mut *conn)
            .await?
    else {
        return Ok(None);
    };

    let sql = format!(
        "SELECT id, step_template_id, {APPROVER_COLUMNS}
         FROM workflow_step_assignee
         WHERE step_template_id IN (SELECT id FROM workflow_step_template WHERE template_id = ?)
         ORDER BY step_template_id, position"
    );
    let rows = sqlx::query(&sql).bind(&id.0).fetch_all(&mut *conn).await?;
    let mut assignees: HashMap<String, Vec<ParallelAssignee>> = HashMap::new();
    for row in &rows {
        let step_id: String = column(row, "step_template_id")?;
        assignees
            .entry(step_id)
            .or_default()
            .push(ParallelAssignee { id: column(row, "id")?, approver: approver_from_row(row)? });
    }

    let sql = format!(
        "SELECT id, step_order, execution_mode, sla_days, {APPROVER_COLUMNS}
         FROM workflow_step_template WHERE template_id = ? ORDER BY step_order"
    );
    let rows = sqlx::query(&sql).bind(&id.0).fetch_all(&mut *conn).await?;
    let steps = rows
        .iter()
        .map(|row| -> Result<StepTemplate, RepositoryError> {
            let step_id: String = column(row, "id")?;
            let mode: String = column(row, "execution_mode")?;
            Ok(StepTemplate {
                step_order: small_number(row, "step_order")?.unwrap_or_default(),
                mode: ExecutionMode::parse(&mode)
                    .ok_or_else(|| RepositoryError::Decode(format!("unknown mode `{mode}`")))?,
                approver: approver_from_row(row)?,
                sla_days: small_number(row, "sla_days")?,
                co_assignees: assignees.remove(&step_id).unwrap_or_default(),
                id: StepTemplateId(step_id),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(WorkflowTemplate {
        id: TemplateId(column(&row, "id")?),
        name: column(&row, "name")?,
        sla_days_default: small_number(&row, "sla_days_default")?,
        active: flag(&row, "active")?,
        steps,
    }))
}
