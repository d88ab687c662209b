use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;

use routewise_core::audit::{AuditCategory, AuditEvent, AuditOutcome, InMemoryAuditSink};
use routewise_core::domain::principal::PrincipalId;
use routewise_core::domain::request::RequestId;
use routewise_core::notify::{InMemoryNotificationSink, NotificationKind, NotificationRequest};
use routewise_core::workflow::EngineContext;

use super::{column, format_timestamp, optional_timestamp, timestamp, RepositoryError};
use crate::DbPool;

/// Audit and notification buffers for one unit of work. The engine writes
/// into them; `flush` copies them into the outbox tables on the caller's
/// transaction so they commit or roll back with the state change.
#[derive(Clone, Default)]
pub struct Outbox {
    pub audit: InMemoryAuditSink,
    pub notifications: InMemoryNotificationSink,
}

impl Outbox {
    pub fn context<'a>(&'a self, now: DateTime<Utc>, correlation_id: &'a str) -> EngineContext<'a> {
        EngineContext {
            now,
            correlation_id,
            audit: &self.audit,
            notifications: &self.notifications,
        }
    }

    pub async fn flush(&self, conn: &mut SqliteConnection) -> Result<(), RepositoryError> {
        insert_audit_events(conn, &self.audit.events()).await?;
        insert_notifications(conn, &self.notifications.queued()).await
    }
}

pub async fn insert_audit_events(
    conn: &mut SqliteConnection,
    events: &[AuditEvent],
) -> Result<(), RepositoryError> {
    for event in events {
        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| RepositoryError::Decode(e.to_string()))?;
        sqlx::query(
            "INSERT INTO audit_event (id, request_id, correlation_id, event_type, category, actor,
                                      outcome, old_state, new_state, note, metadata_json, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(event.request_id.as_ref().map(|id| id.0.as_str()))
        .bind(&event.correlation_id)
        .bind(&event.event_type)
        .bind(event.category.as_str())
        .bind(&event.actor)
        .bind(event.outcome.as_str())
        .bind(&event.old_state)
        .bind(&event.new_state)
        .bind(&event.note)
        .bind(metadata)
        .bind(format_timestamp(event.occurred_at))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn insert_notifications(
    conn: &mut SqliteConnection,
    notifications: &[NotificationRequest],
) -> Result<(), RepositoryError> {
    for notification in notifications {
        sqlx::query(
            "INSERT INTO notification_outbox (recipient_id, kind, request_id, subject, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&notification.recipient.0)
        .bind(notification.kind.as_str())
        .bind(&notification.request_id.0)
        .bind(&notification.subject)
        .bind(format_timestamp(notification.created_at))
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QueuedNotification {
    pub id: i64,
    pub notification: NotificationRequest,
    pub delivered_at: Option<DateTime<Utc>>,
}

pub struct SqlOutboxRepository {
    pool: DbPool,
}

impl SqlOutboxRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn audit_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, request_id, correlation_id, event_type, category, actor, outcome,
                    old_state, new_state, note, metadata_json, occurred_at
             FROM audit_event WHERE request_id = ? ORDER BY occurred_at ASC, rowid ASC",
        )
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_audit_event).collect()
    }

    pub async fn audit_by_type(&self, event_type: &str) -> Result<Vec<AuditEvent>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, request_id, correlation_id, event_type, category, actor, outcome,
                    old_state, new_state, note, metadata_json, occurred_at
             FROM audit_event WHERE event_type = ? ORDER BY occurred_at ASC, rowid ASC",
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_audit_event).collect()
    }

    pub async fn notifications_for_request(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<QueuedNotification>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, recipient_id, kind, request_id, subject, created_at, delivered_at
             FROM notification_outbox WHERE request_id = ? ORDER BY id ASC",
        )
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_notification).collect()
    }

    pub async fn pending_notifications(
        &self,
        limit: u32,
    ) -> Result<Vec<QueuedNotification>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, recipient_id, kind, request_id, subject, created_at, delivered_at
             FROM notification_outbox WHERE delivered_at IS NULL ORDER BY id ASC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_notification).collect()
    }

    /// Marks one queued notification as handed to the transport.
    pub async fn mark_delivered(
        &self,
        id: i64,
        delivered_at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE notification_outbox SET delivered_at = ? WHERE id = ? AND delivered_at IS NULL",
        )
        .bind(format_timestamp(delivered_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn row_to_audit_event(row: &SqliteRow) -> Result<AuditEvent, RepositoryError> {
    let category: String = column(row, "category")?;
    let outcome: String = column(row, "outcome")?;
    let metadata: String = column(row, "metadata_json")?;
    let metadata: BTreeMap<String, String> =
        serde_json::from_str(&metadata).map_err(|e| RepositoryError::Decode(e.to_string()))?;

    Ok(AuditEvent {
        event_id: column(row, "id")?,
        request_id: column::<Option<String>>(row, "request_id")?.map(RequestId),
        correlation_id: column(row, "correlation_id")?,
        event_type: column(row, "event_type")?,
        category: AuditCategory::parse(&category)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown audit category `{category}`")))?,
        actor: column(row, "actor")?,
        outcome: AuditOutcome::parse(&outcome)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown audit outcome `{outcome}`")))?,
        old_state: column(row, "old_state")?,
        new_state: column(row, "new_state")?,
        note: column(row, "note")?,
        metadata,
        occurred_at: timestamp(row, "occurred_at")?,
    })
}

fn row_to_notification(row: &SqliteRow) -> Result<QueuedNotification, RepositoryError> {
    let kind: String = column(row, "kind")?;
    let kind = NotificationKind::parse(&kind)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown notification kind `{kind}`")))?;

    Ok(QueuedNotification {
        id: column(row, "id")?,
        notification: NotificationRequest::new(
            PrincipalId(column(row, "recipient_id")?),
            kind,
            RequestId(column(row, "request_id")?),
            column::<String>(row, "subject")?,
            timestamp(row, "created_at")?,
        ),
        delivered_at: optional_timestamp(row, "delivered_at")?,
    })
}

#[cfg(test)]
mod tests {
    use routewise_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
    use routewise_core::domain::principal::PrincipalId;
    use routewise_core::domain::request::RequestId;
    use routewise_core::notify::{NotificationKind, NotificationRequest, NotificationSink};

    use super::{Outbox, SqlOutboxRepository};
    use crate::repositories::testing::{day, pool};

    #[tokio::test]
    async fn flushed_buffers_round_trip_through_the_outbox_tables() {
        let pool = pool().await;
        let outbox = Outbox::default();
        let request_id = RequestId("REQ-1".to_string());

        outbox.audit.emit(
            AuditEvent::new(
                Some(request_id.clone()),
                "corr-1",
                "workflow.step_opened",
                AuditCategory::Workflow,
                "workflow-engine",
                AuditOutcome::Flagged,
            )
            .with_transition("NOT_STARTED", "PENDING")
            .with_metadata("step_order", "2")
            .at(day(0)),
        );
        outbox.notifications.enqueue(NotificationRequest::new(
            PrincipalId::new("head"),
            NotificationKind::ActionRequired,
            request_id.clone(),
            "Budget: action required",
            day(0),
        ));

        let mut tx = pool.begin().await.expect("begin");
        outbox.flush(&mut *tx).await.expect("flush");
        tx.commit().await.expect("commit");

        let repo = SqlOutboxRepository::new(pool);
        let events = repo.audit_for_request(&request_id).await.expect("audit");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, AuditOutcome::Flagged);
        assert_eq!(events[0].metadata.get("step_order").map(String::as_str), Some("2"));
        assert_eq!(events[0].occurred_at, day(0));

        let pending = repo.pending_notifications(10).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].notification.kind, NotificationKind::ActionRequired);

        assert!(repo.mark_delivered(pending[0].id, day(1)).await.expect("deliver"));
        assert!(!repo.mark_delivered(pending[0].id, day(2)).await.expect("deliver again"));
        assert!(repo.pending_notifications(10).await.expect("pending").is_empty());
    }

    #[tokio::test]
    async fn rolled_back_flush_leaves_no_rows() {
        let pool = pool().await;
        let outbox = Outbox::default();
        let request_id = RequestId("REQ-2".to_string());
        outbox.notifications.enqueue(NotificationRequest::new(
            PrincipalId::new("head"),
            NotificationKind::Escalated,
            request_id.clone(),
            "escalated",
            day(0),
        ));

        let mut tx = pool.begin().await.expect("begin");
        outbox.flush(&mut *tx).await.expect("flush");
        tx.rollback().await.expect("rollback");

        let repo = SqlOutboxRepository::new(pool);
        assert!(repo.notifications_for_request(&request_id).await.expect("list").is_empty());
    }
}
