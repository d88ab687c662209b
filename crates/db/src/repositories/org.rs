use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use tracing::{info, warn};

use routewise_core::audit::{AuditCategory, AuditEvent, AuditOutcome};
use routewise_core::domain::org::{
    LegacyAssignment, LegacyKey, OrgNode, OrgNodeId, OrgNodeType, PickerMode,
};
use routewise_core::domain::principal::PrincipalId;
use routewise_core::org::{
    plan_projection, LegacyOrgSnapshot, OrgTree, PickerNode, ProjectionPlan, SyncReport,
};

use super::directory::{display_names, legacy_key, load_legacy_units};
use super::outbox::insert_audit_events;
use super::{column, flag, format_timestamp, RepositoryError};
use crate::DbPool;

const SYNC_ACTOR: &str = "org-sync";

/// The generalized org tree and its projection from the legacy units.
pub struct SqlOrgRepository {
    pool: DbPool,
}

impl SqlOrgRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn load_tree(&self) -> Result<OrgTree, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let types = load_types(&mut conn).await?;
        let nodes = load_nodes(&mut conn).await?;
        Ok(OrgTree::new(nodes, types))
    }

    pub async fn picker(&self, mode: PickerMode) -> Result<Vec<PickerNode>, RepositoryError> {
        Ok(self.load_tree().await?.picker_tree(mode))
    }

    pub async fn chart(&self) -> Result<Vec<PickerNode>, RepositoryError> {
        Ok(self.load_tree().await?.chart_tree())
    }

    /// `node_id` followed by its ancestors, nearest first.
    pub async fn node_ancestor_ids(
        &self,
        node_id: OrgNodeId,
    ) -> Result<Vec<OrgNodeId>, RepositoryError> {
        Ok(self.load_tree().await?.node_ancestor_ids(node_id))
    }

    /// What `sync` would report, without writing anything.
    pub async fn preview(&self) -> Result<SyncReport, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let plan = plan(&mut conn).await?;
        let projected = projected_keys(&mut conn).await?;
        Ok(plan.preview(&projected))
    }

    /// Rebuilds the projection from the legacy tables in one transaction.
    pub async fn sync(
        &self,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<SyncReport, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let plan = plan(&mut *tx).await?;
        let mut report = SyncReport { warnings: plan.warnings.clone(), ..SyncReport::default() };

        for node_type in &plan.types_to_create {
            insert_type(&mut *tx, node_type).await?;
            report.types_created += 1;
        }

        let mut node_ids: HashMap<LegacyKey, i64> = HashMap::new();
        for node in &plan.nodes {
            let existing: Option<i64> =
                sqlx::query_scalar("SELECT id FROM org_node WHERE legacy_type = ? AND legacy_id = ?")
                    .bind(node.key.kind.as_str())
                    .bind(node.key.id)
                    .fetch_optional(&mut *tx)
                    .await?;
            let parent_id = node.parent.and_then(|parent| node_ids.get(&parent).copied());

            let id: i64 = sqlx::query_scalar(
                "INSERT INTO org_node (type_code, parent_id, name_local, name_english, code, active,
                                       legacy_type, legacy_id, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(legacy_type, legacy_id) DO UPDATE SET
                     type_code = excluded.type_code,
                     parent_id = excluded.parent_id,
                     name_local = excluded.name_local,
                     name_english = excluded.name_english,
                     code = excluded.code,
                     active = excluded.active,
                     updated_at = excluded.updated_at
                 RETURNING id",
            )
            .bind(&node.type_code)
            .bind(parent_id)
            .bind(&node.names.local)
            .bind(&node.names.english)
            .bind(&node.code)
            .bind(node.active)
            .bind(node.key.kind.as_str())
            .bind(node.key.id)
            .bind(format_timestamp(now))
            .fetch_one(&mut *tx)
            .await?;

            node_ids.insert(node.key, id);
            if existing.is_some() {
                report.nodes_updated += 1;
            } else {
                report.nodes_created += 1;
            }
        }

        let principals: BTreeSet<&PrincipalId> =
            plan.assignments.iter().map(|assignment| &assignment.principal_id).collect();
        for principal_id in principals {
            sqlx::query("UPDATE org_node_assignment SET is_primary = 0 WHERE principal_id = ?")
                .bind(&principal_id.0)
                .execute(&mut *tx)
                .await?;
        }
        for assignment in &plan.assignments {
            let Some(node_id) = node_ids.get(&assignment.unit) else {
                continue;
            };
            sqlx::query(
                "INSERT INTO org_node_assignment (principal_id, node_id, title, is_primary)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(principal_id, node_id) DO UPDATE SET
                     title = excluded.title,
                     is_primary = excluded.is_primary",
            )
            .bind(&assignment.principal_id.0)
            .bind(node_id)
            .bind(&assignment.title)
            .bind(assignment.is_primary)
            .execute(&mut *tx)
            .await?;
            report.assignments_upserted += 1;
        }

        let outcome =
            if report.warnings.is_empty() { AuditOutcome::Success } else { AuditOutcome::Flagged };
        let event = AuditEvent::new(
            None,
            correlation_id,
            "org.synced",
            AuditCategory::OrgSync,
            SYNC_ACTOR,
            outcome,
        )
        .with_note(format!(
            "{} nodes created, {} updated, {} types created, {} assignments",
            report.nodes_created,
            report.nodes_updated,
            report.types_created,
            report.assignments_upserted
        ))
        .with_metadata("warnings", report.warnings.len().to_string())
        .at(now);
        insert_audit_events(&mut *tx, &[event]).await?;

        tx.commit().await?;

        for warning in &report.warnings {
            warn!(event_name = "org.sync.warning", correlation_id, warning = %warning, "org sync warning");
        }
        info!(
            event_name = "org.sync.completed",
            correlation_id,
            nodes_created = report.nodes_created,
            nodes_updated = report.nodes_updated,
            types_created = report.types_created,
            assignments_upserted = report.assignments_upserted,
            "org hierarchy projection rebuilt"
        );
        Ok(report)
    }
}

async fn plan(conn: &mut SqliteConnection) -> Result<ProjectionPlan, RepositoryError> {
    let snapshot = LegacyOrgSnapshot {
        entities: load_legacy_units(conn).await?,
        assignments: load_legacy_assignments(conn).await?,
    };
    let types = load_types(conn).await?;
    Ok(plan_projection(&snapshot, &types))
}

async fn load_legacy_assignments(
    conn: &mut SqliteConnection,
) -> Result<Vec<LegacyAssignment>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT principal_id, legacy_type, legacy_id, title, is_primary
         FROM legacy_org_assignment ORDER BY principal_id, legacy_type, legacy_id",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> Result<LegacyAssignment, RepositoryError> {
            Ok(LegacyAssignment {
                principal_id: PrincipalId(column(row, "principal_id")?),
                unit: legacy_key(row, "legacy_type", "legacy_id")?,
                title: column(row, "title")?,
                is_primary: flag(row, "is_primary")?,
            })
        })
        .collect()
}

async fn projected_keys(conn: &mut SqliteConnection) -> Result<BTreeSet<LegacyKey>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT legacy_type, legacy_id FROM org_node
         WHERE legacy_type IS NOT NULL AND legacy_id IS NOT NULL",
    )
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(|row| legacy_key(row, "legacy_type", "legacy_id")).collect()
}

pub(crate) async fn load_types(
    conn: &mut SqliteConnection,
) -> Result<Vec<OrgNodeType>, RepositoryError> {
    let rows = sqlx::query("SELECT type_code, parent_type_code FROM org_node_type_parent")
        .fetch_all(&mut *conn)
        .await?;
    let mut parents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for row in &rows {
        let type_code: String = column(row, "type_code")?;
        parents.entry(type_code).or_default().insert(column(row, "parent_type_code")?);
    }

    let rows = sqlx::query(
        "SELECT code, name_local, name_english, sort_rank, allow_in_approvals, show_in_routing,
                show_in_chart, active
         FROM org_node_type ORDER BY sort_rank, code",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> Result<OrgNodeType, RepositoryError> {
            let code: String = column(row, "code")?;
            let sort_rank: i64 = column(row, "sort_rank")?;
            Ok(OrgNodeType {
                names: display_names(row)?,
                sort_rank: i32::try_from(sort_rank)
                    .map_err(|_| RepositoryError::Decode(format!("sort_rank {sort_rank}")))?,
                allow_in_approvals: flag(row, "allow_in_approvals")?,
                show_in_routing: flag(row, "show_in_routing")?,
                show_in_chart: flag(row, "show_in_chart")?,
                active: flag(row, "active")?,
                allowed_parent_codes: parents.remove(&code).unwrap_or_default(),
                code,
            })
        })
        .collect()
}

pub(crate) async fn load_nodes(conn: &mut SqliteConnection) -> Result<Vec<OrgNode>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT id, type_code, parent_id, name_local, name_english, code, active, sort_order,
                legacy_type, legacy_id
         FROM org_node ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> Result<OrgNode, RepositoryError> {
            let legacy_type: Option<String> = column(row, "legacy_type")?;
            let legacy = match legacy_type {
                Some(_) => Some(legacy_key(row, "legacy_type", "legacy_id")?),
                None => None,
            };
            let sort_order: i64 = column(row, "sort_order")?;
            Ok(OrgNode {
                id: OrgNodeId(column(row, "id")?),
                type_code: column(row, "type_code")?,
                parent_id: column::<Option<i64>>(row, "parent_id")?.map(OrgNodeId),
                names: display_names(row)?,
                code: column(row, "code")?,
                active: flag(row, "active")?,
                sort_order: i32::try_from(sort_order)
                    .map_err(|_| RepositoryError::Decode(format!("sort_order {sort_order}")))?,
                legacy,
            })
        })
        .collect()
}

async fn insert_type(
    conn: &mut SqliteConnection,
    node_type: &OrgNodeType,
) -> Result<(), RepositoryError> {
    sqlx::query(
        "INSERT INTO org_node_type (code, name_local, name_english, sort_rank, allow_in_approvals,
                                    show_in_routing, show_in_chart, active)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(code) DO NOTHING",
    )
    .bind(&node_type.code)
    .bind(&node_type.names.local)
    .bind(&node_type.names.english)
    .bind(node_type.sort_rank)
    .bind(node_type.allow_in_approvals)
    .bind(node_type.show_in_routing)
    .bind(node_type.show_in_chart)
    .bind(node_type.active)
    .execute(&mut *conn)
    .await?;

    for parent in &node_type.allowed_parent_codes {
        sqlx::query(
            "INSERT INTO org_node_type_parent (type_code, parent_type_code) VALUES (?, ?)
             ON CONFLICT(type_code, parent_type_code) DO NOTHING",
        )
        .bind(&node_type.code)
        .bind(parent)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Changes the flags that decide where nodes of a type show up.
pub async fn set_type_visibility(
    pool: &DbPool,
    code: &str,
    allow_in_approvals: bool,
    show_in_routing: bool,
    show_in_chart: bool,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        "UPDATE org_node_type
         SET allow_in_approvals = ?, show_in_routing = ?, show_in_chart = ?
         WHERE code = ?",
    )
    .bind(allow_in_approvals)
    .bind(show_in_routing)
    .bind(show_in_chart)
    .bind(code)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::not_found("org node type", code));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use routewise_core::approvals::{ApproverResolver, Directory};
    use routewise_core::domain::org::{
        DisplayNames, LegacyAssignment, LegacyKey, LegacyKind, LegacyOrgEntity, LegacyParents,
        OrgNodeId, PickerMode,
    };
    use routewise_core::domain::principal::PrincipalId;
    use routewise_core::domain::template::ApproverSpec;

    use super::{set_type_visibility, SqlOrgRepository};
    use crate::repositories::outbox::SqlOutboxRepository;
    use crate::repositories::testing::{day, pool, principal};
    use crate::repositories::{RepositoryError, SqlDirectoryRepository};
    use crate::DbPool;

    fn unit(kind: LegacyKind, id: i64, parents: LegacyParents) -> LegacyOrgEntity {
        LegacyOrgEntity {
            key: LegacyKey::new(kind, id),
            names: DisplayNames::new(format!("{} {id}", kind.as_str())),
            code: None,
            active: true,
            parents,
        }
    }

    async fn seeded() -> DbPool {
        let pool = pool().await;
        let directory = SqlDirectoryRepository::new(pool.clone());
        for entity in [
            unit(LegacyKind::Directorate, 1, LegacyParents::default()),
            unit(LegacyKind::Unit, 10, LegacyParents { directorate_id: Some(1), ..Default::default() }),
            unit(
                LegacyKind::Department,
                100,
                LegacyParents { unit_id: Some(10), directorate_id: Some(1), ..Default::default() },
            ),
            unit(
                LegacyKind::Section,
                1000,
                LegacyParents { department_id: Some(100), ..Default::default() },
            ),
        ] {
            directory.upsert_legacy_unit(&entity).await.expect("legacy unit");
        }

        directory.upsert_principal(&principal("head", "Dept_Head")).await.expect("principal");
        for (kind, id, primary) in [(LegacyKind::Department, 100, true), (LegacyKind::Section, 1000, false)] {
            directory
                .upsert_legacy_assignment(&LegacyAssignment {
                    principal_id: PrincipalId::new("head"),
                    unit: LegacyKey::new(kind, id),
                    title: Some("Head".to_string()),
                    is_primary: primary,
                })
                .await
                .expect("assignment");
        }
        pool
    }

    #[tokio::test]
    async fn second_sync_creates_no_rows() {
        let pool = seeded().await;
        let repo = SqlOrgRepository::new(pool.clone());

        let preview = repo.preview().await.expect("preview");
        assert_eq!(preview.nodes_created, 4);

        let first = repo.sync(day(0), "sync-1").await.expect("first sync");
        assert_eq!(first.nodes_created, 4);
        assert_eq!(first.types_created, 7);
        assert_eq!(first.assignments_upserted, 2);
        assert!(first.warnings.is_empty());

        let count = |sql: &'static str| {
            let pool = pool.clone();
            async move { sqlx::query_scalar::<_, i64>(sql).fetch_one(&pool).await.expect("count") }
        };
        let nodes = count("SELECT COUNT(*) FROM org_node").await;
        let assignments = count("SELECT COUNT(*) FROM org_node_assignment").await;

        let second = repo.sync(day(1), "sync-2").await.expect("second sync");
        assert_eq!(second.nodes_created, 0);
        assert_eq!(second.nodes_updated, 4);
        assert_eq!(second.types_created, 0);
        assert_eq!(count("SELECT COUNT(*) FROM org_node").await, nodes);
        assert_eq!(count("SELECT COUNT(*) FROM org_node_assignment").await, assignments);
        assert_eq!(
            count("SELECT COUNT(*) FROM org_node_assignment WHERE is_primary = 1").await,
            1
        );

        let audits = SqlOutboxRepository::new(pool).audit_by_type("org.synced").await.expect("audit");
        assert_eq!(audits.len(), 2);
    }

    #[tokio::test]
    async fn projected_tree_feeds_picker_and_node_resolution() {
        let pool = seeded().await;
        let repo = SqlOrgRepository::new(pool.clone());
        repo.sync(day(0), "sync").await.expect("sync");

        let tree = repo.load_tree().await.expect("tree");
        assert_eq!(tree.len(), 4);
        assert!(tree.parent_type_violations().is_empty());

        let roots = repo.picker(PickerMode::All).await.expect("picker");
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].type_code, "DIRECTORATE");
        assert_eq!(roots[0].children[0].type_code, "UNIT");

        set_type_visibility(&pool, "UNIT", false, true, false).await.expect("flags");
        let approvals = repo.picker(PickerMode::Approvals).await.expect("picker");
        let unit = &approvals[0].children[0];
        assert_eq!(unit.type_code, "UNIT");
        assert!(!unit.eligible);
        assert!(unit.children[0].eligible);

        let chart = repo.chart().await.expect("chart");
        assert_eq!(chart[0].children[0].type_code, "DEPARTMENT");

        let directory = SqlDirectoryRepository::new(pool).load().await.expect("directory");
        let department = directory
            .node_for_legacy(&LegacyKey::new(LegacyKind::Department, 100))
            .expect("department node");
        let ancestors = repo.node_ancestor_ids(department).await.expect("ancestors");
        assert_eq!(ancestors.len(), 3);
        assert_eq!(ancestors[0], department);

        let resolver = ApproverResolver::new(&directory);
        let holders = resolver.resolve(&ApproverSpec::OrgNode { node_id: department });
        assert!(holders.contains(&PrincipalId::new("head")));
        let section = directory
            .node_for_legacy(&LegacyKey::new(LegacyKind::Section, 1000))
            .expect("section node");
        assert!(resolver.resolve(&ApproverSpec::OrgNode { node_id: section }).is_empty());
        assert!(repo.node_ancestor_ids(OrgNodeId(9_999)).await.expect("ancestors").is_empty());
    }

    #[tokio::test]
    async fn unknown_type_visibility_change_is_not_found() {
        let pool = pool().await;
        let error = set_type_visibility(&pool, "NOPE", true, true, true)
            .await
            .expect_err("unknown type");
        assert!(matches!(error, RepositoryError::NotFound { .. }));
    }
}
