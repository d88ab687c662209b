use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{info, warn};

use routewise_core::approvals::ApproverResolver;
use routewise_core::audit::AuditSink;
use routewise_core::config::EscalationConfig;
use routewise_core::domain::request::WorkflowRequest;
use routewise_core::escalation::{keys, plan_sweep, EscalationSettings, TickOutcome};
use routewise_core::notify::{NotificationKind, NotificationRequest, NotificationSink};
use routewise_core::workflow::InstanceEngine;

use super::directory::load_directory;
use super::outbox::Outbox;
use super::settings::{load_all, store};
use super::template::load_template;
use super::workflow::{load_instance_for_request, load_open_requests, persist_instance};
use super::{format_timestamp, RepositoryError};
use crate::DbPool;

/// One escalation sweep per tick, committed as a single transaction.
pub struct SqlEscalationRepository {
    pool: DbPool,
    engine: InstanceEngine,
}

impl SqlEscalationRepository {
    pub fn new(pool: DbPool, engine: InstanceEngine) -> Self {
        Self { pool, engine }
    }

    /// Reads the throttle state, escalates every overdue request in one
    /// transaction, then records the run. A failed sweep rolls back and
    /// leaves the last-run marker untouched so the next tick retries.
    pub async fn run_tick(
        &self,
        config: &EscalationConfig,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<TickOutcome, RepositoryError> {
        let settings = {
            let mut conn = self.pool.acquire().await?;
            EscalationSettings::resolve(&load_all(&mut conn).await?, config)
        };
        if settings.is_throttled(now) {
            info!(
                event_name = "escalation.tick_skipped",
                correlation_id,
                last_run = ?settings.last_run,
                throttle_secs = settings.throttle_secs,
                "escalation sweep skipped inside throttle window"
            );
            return Ok(TickOutcome::Skipped { last_run: settings.last_run });
        }

        let escalated = match self.sweep(config, &settings, now, correlation_id).await {
            Ok(escalated) => escalated,
            Err(error) => {
                warn!(
                    event_name = "escalation.tick_failed",
                    correlation_id,
                    error = %error,
                    "escalation sweep failed and was rolled back"
                );
                return Err(error);
            }
        };

        let mut conn = self.pool.acquire().await?;
        store(&mut conn, keys::ESCALATION_LAST_RUN, &format_timestamp(now), now).await?;
        info!(
            event_name = "escalation.tick_swept",
            correlation_id,
            escalated,
            sla_days = settings.sla_days,
            grace_days = settings.grace_days,
            "escalation sweep committed"
        );
        Ok(TickOutcome::Swept { escalated })
    }

    async fn sweep(
        &self,
        config: &EscalationConfig,
        settings: &EscalationSettings,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<usize, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let requests = load_open_requests(&mut *tx).await?;
        let plan = plan_sweep(&requests, settings, config.age_basis, &config.role_map(), now);
        if plan.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }
        let directory = load_directory(&mut *tx).await?;
        let resolver = ApproverResolver::new(&directory);

        let mut escalated = 0;
        for planned in &plan {
            let Some(mut request) =
                requests.iter().find(|request| request.id == planned.request_id).cloned()
            else {
                continue;
            };
            let before = request.clone();
            planned.apply(&mut request, now);
            let outbox = Outbox::default();
            outbox.audit.emit(planned.audit_event(correlation_id, settings, now));

            let instance = load_instance_for_request(&mut *tx, &request.id)
                .await?
                .filter(|instance| !instance.completed);
            let mut step_started_at = request.current_step_started_at;
            let mut replaced = None;
            match instance {
                Some(instance) => {
                    let template = load_template(&mut *tx, &instance.template_id)
                        .await?
                        .ok_or_else(|| RepositoryError::not_found("template", &instance.template_id))?;
                    replaced = self.engine.escalate_current_step(
                        &instance,
                        &before,
                        &template,
                        &planned.to_role,
                        &resolver,
                        &outbox.context(now, correlation_id),
                    )?;
                    if let Some(replaced) = &replaced {
                        if replaced.current_step().is_some_and(|step| step.is_unresolvable()) {
                            warn!(
                                event_name = "workflow.step_unresolvable",
                                correlation_id,
                                request_id = %request.id,
                                role = %planned.to_role,
                                "escalated step has no resolvable approver; left pending"
                            );
                        }
                        step_started_at = replaced.current_step().map(|step| step.started_at);
                    }
                }
                None => {
                    for holder in resolver.resolve_role(&planned.to_role) {
                        outbox.notifications.enqueue(NotificationRequest::new(
                            holder,
                            NotificationKind::Escalated,
                            request.id.clone(),
                            format!("{}: escalated to {}", request.title, planned.to_role),
                            now,
                        ));
                    }
                }
            }

            if !mark_escalated(&mut *tx, &request, step_started_at, now).await? {
                warn!(
                    event_name = "escalation.request_already_escalated",
                    correlation_id,
                    request_id = %request.id,
                    "request was escalated concurrently; skipped"
                );
                continue;
            }
            if let Some(replaced) = &replaced {
                persist_instance(&mut *tx, replaced).await?;
            }
            outbox.flush(&mut *tx).await?;
            escalated += 1;
        }

        tx.commit().await?;
        Ok(escalated)
    }
}

/// Guarded on `is_escalated = 0` so a row escalated by a concurrent sweep
/// is left alone. Returns whether the row was updated.
async fn mark_escalated(
    conn: &mut SqliteConnection,
    request: &WorkflowRequest,
    step_started_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        "UPDATE workflow_request
         SET status = ?, is_escalated = 1, escalated_at = ?, current_role = ?,
             current_step_started_at = ?, updated_at = ?
         WHERE id = ? AND is_escalated = 0",
    )
    .bind(request.status.as_str())
    .bind(request.escalated_at.map(format_timestamp))
    .bind(&request.current_role)
    .bind(step_started_at.map(format_timestamp))
    .bind(format_timestamp(now))
    .bind(&request.id.0)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use routewise_core::config::EscalationConfig;
    use routewise_core::delegation::DelegationResolver;
    use routewise_core::domain::instance::{Decision, StepStatus};
    use routewise_core::domain::principal::PrincipalId;
    use routewise_core::domain::request::{RequestId, RequestStatus, WorkflowRequest};
    use routewise_core::domain::template::{
        ApproverSpec, ExecutionMode, StepTemplate, StepTemplateId, TemplateId, WorkflowTemplate,
    };
    use routewise_core::escalation::{keys, TickOutcome};
    use routewise_core::notify::NotificationKind;
    use routewise_core::workflow::InstanceEngine;

    use super::{mark_escalated, SqlEscalationRepository};
    use crate::repositories::testing::{day, pool, principal};
    use crate::repositories::{
        SqlDirectoryRepository, SqlOutboxRepository, SqlSettingsRepository,
        SqlTemplateRepository, SqlWorkflowRepository, WorkflowRepository,
    };
    use crate::DbPool;

    fn request(id: &str, created_at: DateTime<Utc>) -> WorkflowRequest {
        WorkflowRequest {
            id: RequestId(id.to_string()),
            requester_id: PrincipalId::new("requester"),
            title: format!("Request {id}"),
            status: RequestStatus::Pending,
            current_role: Some("dept_head".to_string()),
            is_escalated: false,
            escalated_at: None,
            created_at,
            current_step_started_at: None,
        }
    }

    fn config() -> EscalationConfig {
        EscalationConfig { throttle_secs: 3600, ..EscalationConfig::default() }
    }

    async fn seeded() -> (DbPool, SqlWorkflowRepository, SqlEscalationRepository) {
        let pool = pool().await;
        let directory = SqlDirectoryRepository::new(pool.clone());
        for (id, role) in
            [("requester", "staff"), ("head", "dept_head"), ("sg", "secretary_general")]
        {
            directory.upsert_principal(&principal(id, role)).await.expect("principal");
        }
        let workflow = SqlWorkflowRepository::new(
            pool.clone(),
            InstanceEngine::default(),
            DelegationResolver::new(["ADMIN"]),
        );
        let escalation = SqlEscalationRepository::new(pool.clone(), InstanceEngine::default());
        (pool, workflow, escalation)
    }

    #[tokio::test]
    async fn escalates_only_requests_strictly_past_the_threshold() {
        let (pool, workflow, escalation) = seeded().await;
        // SLA 3 + grace 2: the deadline at day 5 is exactly day 0.
        workflow.create_request(&request("on-edge", day(0))).await.expect("request");
        workflow
            .create_request(&request("overdue", day(0) - Duration::seconds(1)))
            .await
            .expect("request");
        let mut done = request("done", day(-10));
        done.status = RequestStatus::Approved;
        workflow.create_request(&done).await.expect("request");

        let outcome = escalation.run_tick(&config(), day(5), "tick-1").await.expect("tick");
        assert_eq!(outcome, TickOutcome::Swept { escalated: 1 });

        let overdue = workflow
            .find_request(&RequestId("overdue".to_string()))
            .await
            .expect("find")
            .expect("row");
        assert_eq!(overdue.status, RequestStatus::Escalated);
        assert!(overdue.is_escalated);
        assert_eq!(overdue.escalated_at, Some(day(5)));
        assert_eq!(overdue.current_role.as_deref(), Some("secretary_general"));

        let edge = workflow
            .find_request(&RequestId("on-edge".to_string()))
            .await
            .expect("find")
            .expect("row");
        assert_eq!(edge.status, RequestStatus::Pending);

        let outbox = SqlOutboxRepository::new(pool.clone());
        let audit = outbox.audit_by_type("request.escalated").await.expect("audit");
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].metadata.get("from_role").map(String::as_str), Some("dept_head"));
        let queued = outbox
            .notifications_for_request(&RequestId("overdue".to_string()))
            .await
            .expect("queue");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].notification.kind, NotificationKind::Escalated);
        assert_eq!(queued[0].notification.recipient, PrincipalId::new("sg"));

        let last_run = SqlSettingsRepository::new(pool)
            .get(keys::ESCALATION_LAST_RUN)
            .await
            .expect("setting");
        assert!(last_run.is_some());
    }

    #[tokio::test]
    async fn second_tick_inside_throttle_window_is_skipped() {
        let (_pool, workflow, escalation) = seeded().await;
        workflow.create_request(&request("old", day(-9))).await.expect("request");

        let first = escalation.run_tick(&config(), day(0), "tick-1").await.expect("tick");
        assert_eq!(first, TickOutcome::Swept { escalated: 1 });

        let second = escalation
            .run_tick(&config(), day(0) + Duration::minutes(30), "tick-2")
            .await
            .expect("tick");
        assert_eq!(second, TickOutcome::Skipped { last_run: Some(day(0)) });

        // Window elapsed: the escalated row is not picked up again.
        let third = escalation.run_tick(&config(), day(1), "tick-3").await.expect("tick");
        assert_eq!(third, TickOutcome::Swept { escalated: 0 });
    }

    #[tokio::test]
    async fn stored_settings_override_config_thresholds() {
        let (pool, workflow, escalation) = seeded().await;
        let settings = SqlSettingsRepository::new(pool);
        settings.set(keys::SLA_DAYS, "1", day(0)).await.expect("set");
        settings.set(keys::ESCALATION_DAYS, "0", day(0)).await.expect("set");
        workflow.create_request(&request("young", day(-2))).await.expect("request");

        let outcome = escalation.run_tick(&config(), day(0), "tick-1").await.expect("tick");
        assert_eq!(outcome, TickOutcome::Swept { escalated: 1 });
    }

    #[tokio::test]
    async fn running_instance_gets_a_replacement_step_for_the_escalated_role() {
        let (pool, workflow, escalation) = seeded().await;
        let template = WorkflowTemplate {
            id: TemplateId("tpl-simple".to_string()),
            name: "Simple".to_string(),
            sla_days_default: None,
            active: true,
            steps: vec![StepTemplate {
                id: StepTemplateId("st-1".to_string()),
                step_order: 1,
                mode: ExecutionMode::Sequential,
                approver: ApproverSpec::role("dept_head").to_fields(),
                sla_days: Some(2),
                co_assignees: Vec::new(),
            }],
        };
        SqlTemplateRepository::new(pool.clone())
            .save(&template, &PrincipalId::new("head"), day(0), "seed")
            .await
            .expect("template");

        let request_id = RequestId("req-1".to_string());
        workflow.create_request(&request("req-1", day(0))).await.expect("request");
        let started = workflow
            .start_instance(&request_id, &template.id, &PrincipalId::new("requester"), day(0), "c")
            .await
            .expect("start");
        let original = started.instance.current_step().expect("step").id.clone();

        let outcome = escalation.run_tick(&config(), day(6), "tick-1").await.expect("tick");
        assert_eq!(outcome, TickOutcome::Swept { escalated: 1 });

        let instance = workflow
            .find_instance_for_request(&request_id)
            .await
            .expect("load")
            .expect("instance");
        assert_eq!(instance.steps.len(), 2);
        assert_eq!(instance.step(&original).expect("original").status, StepStatus::Escalated);
        let replacement = instance.current_step().expect("replacement");
        assert_eq!(replacement.step_order, 1);
        assert_eq!(replacement.approver, ApproverSpec::role("secretary_general"));
        assert!(replacement.participant(&PrincipalId::new("sg")).is_some());

        let request = workflow.find_request(&request_id).await.expect("find").expect("row");
        assert_eq!(request.status, RequestStatus::Escalated);
        assert_eq!(request.current_step_started_at, Some(day(6)));

        let outcome = workflow
            .record_decision(
                &replacement.id,
                Decision::Approved,
                &PrincipalId::new("sg"),
                Some("handled".to_string()),
                day(6) + Duration::hours(1),
                "decide",
            )
            .await
            .expect("escalated role decides");
        assert!(outcome.instance.completed);
    }

    #[tokio::test]
    async fn marking_an_already_escalated_row_reports_no_update() {
        let (pool, workflow, _escalation) = seeded().await;
        let mut overdue = request("overdue", day(-9));
        workflow.create_request(&overdue).await.expect("request");
        overdue.status = RequestStatus::Escalated;
        overdue.is_escalated = true;
        overdue.escalated_at = Some(day(0));

        let mut conn = pool.acquire().await.expect("conn");
        assert!(mark_escalated(&mut conn, &overdue, None, day(0)).await.expect("first"));
        assert!(!mark_escalated(&mut conn, &overdue, None, day(1)).await.expect("second"));
        drop(conn);

        let stored = workflow
            .find_request(&RequestId("overdue".to_string()))
            .await
            .expect("find")
            .expect("row");
        assert_eq!(stored.escalated_at, Some(day(0)));
    }
}
