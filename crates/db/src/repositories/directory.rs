use std::collections::HashMap;

use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;

use routewise_core::approvals::InMemoryDirectory;
use routewise_core::delegation::PermissionTable;
use routewise_core::domain::committee::{
    Committee, CommitteeId, CommitteeMember, CommitteeMemberRole, MemberRef,
};
use routewise_core::domain::org::{
    DisplayNames, LegacyAssignment, LegacyKey, LegacyKind, LegacyOrgEntity, LegacyParents,
    NodeAssignment, OrgNodeId,
};
use routewise_core::domain::principal::{OrgPlacement, Principal, PrincipalId};
use routewise_core::errors::DomainError;

use super::{column, flag, RepositoryError};
use crate::DbPool;

/// Principals, committees, legacy org units and permission grants: the
/// master data approver resolution reads.
pub struct SqlDirectoryRepository {
    pool: DbPool,
}

impl SqlDirectoryRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Snapshot of every table the resolver consults.
    pub async fn load(&self) -> Result<InMemoryDirectory, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        load_directory(&mut conn).await
    }

    pub async fn find_principal(
        &self,
        id: &PrincipalId,
    ) -> Result<Option<Principal>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        find_principal(&mut conn, id).await
    }

    pub async fn upsert_principal(&self, principal: &Principal) -> Result<(), RepositoryError> {
        let placement = &principal.placement;
        sqlx::query(
            "INSERT INTO principal (id, display_name, email, role, active, directorate_id,
                                    unit_id, department_id, section_id, division_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 display_name = excluded.display_name,
                 email = excluded.email,
                 role = excluded.role,
                 active = excluded.active,
                 directorate_id = excluded.directorate_id,
                 unit_id = excluded.unit_id,
                 department_id = excluded.department_id,
                 section_id = excluded.section_id,
                 division_id = excluded.division_id",
        )
        .bind(&principal.id.0)
        .bind(&principal.display_name)
        .bind(&principal.email)
        .bind(&principal.role)
        .bind(principal.active)
        .bind(placement.directorate_id)
        .bind(placement.unit_id)
        .bind(placement.department_id)
        .bind(placement.section_id)
        .bind(placement.division_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Replaces the committee and its member list. A list with two active
    /// chairs or secretaries is refused before anything is written.
    pub async fn upsert_committee(&self, committee: &Committee) -> Result<(), RepositoryError> {
        committee
            .check_officers()
            .map_err(|e| RepositoryError::Domain(DomainError::InvariantViolation(e.to_string())))?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO committee (id, name_local, name_english, code, active)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 name_local = excluded.name_local,
                 name_english = excluded.name_english,
                 code = excluded.code,
                 active = excluded.active",
        )
        .bind(committee.id.0)
        .bind(&committee.names.local)
        .bind(&committee.names.english)
        .bind(&committee.code)
        .bind(committee.active)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM committee_member WHERE committee_id = ?")
            .bind(committee.id.0)
            .execute(&mut *tx)
            .await?;

        for member in &committee.members {
            let (principal_id, role_code) = match &member.member {
                MemberRef::Principal(id) => (Some(id.0.as_str()), None),
                MemberRef::Role(role) => (None, Some(role.as_str())),
            };
            sqlx::query(
                "INSERT INTO committee_member (id, committee_id, principal_id, role_code,
                                               member_role, active)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(member.id)
            .bind(committee.id.0)
            .bind(principal_id)
            .bind(role_code)
            .bind(member.role.as_str())
            .bind(member.active)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_legacy_unit(&self, entity: &LegacyOrgEntity) -> Result<(), RepositoryError> {
        let parents = &entity.parents;
        sqlx::query(
            "INSERT INTO legacy_org_unit (legacy_type, legacy_id, name_local, name_english, code,
                                          active, organization_id, directorate_id, unit_id,
                                          department_id, section_id, division_id)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(legacy_type, legacy_id) DO UPDATE SET
                 name_local = excluded.name_local,
                 name_english = excluded.name_english,
                 code = excluded.code,
                 active = excluded.active,
                 organization_id = excluded.organization_id,
                 directorate_id = excluded.directorate_id,
                 unit_id = excluded.unit_id,
                 department_id = excluded.department_id,
                 section_id = excluded.section_id,
                 division_id = excluded.division_id",
        )
        .bind(entity.key.kind.as_str())
        .bind(entity.key.id)
        .bind(&entity.names.local)
        .bind(&entity.names.english)
        .bind(&entity.code)
        .bind(entity.active)
        .bind(parents.organization_id)
        .bind(parents.directorate_id)
        .bind(parents.unit_id)
        .bind(parents.department_id)
        .bind(parents.section_id)
        .bind(parents.division_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_legacy_assignment(
        &self,
        assignment: &LegacyAssignment,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO legacy_org_assignment (principal_id, legacy_type, legacy_id, title, is_primary)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(principal_id, legacy_type, legacy_id) DO UPDATE SET
                 title = excluded.title,
                 is_primary = excluded.is_primary",
        )
        .bind(&assignment.principal_id.0)
        .bind(assignment.unit.kind.as_str())
        .bind(assignment.unit.id)
        .bind(&assignment.title)
        .bind(assignment.is_primary)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn grant_principal_permission(
        &self,
        principal_id: &PrincipalId,
        key: &str,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO principal_permission (principal_id, permission_key) VALUES (?, ?)
             ON CONFLICT(principal_id, permission_key) DO NOTHING",
        )
        .bind(&principal_id.0)
        .bind(key.trim().to_ascii_uppercase())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn grant_role_permission(&self, role: &str, key: &str) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO role_permission (role, permission_key) VALUES (?, ?)
             ON CONFLICT(role, permission_key) DO NOTHING",
        )
        .bind(role.trim())
        .bind(key.trim().to_ascii_uppercase())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn permission_table(&self) -> Result<PermissionTable, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        load_permission_table(&mut conn).await
    }
}

pub(crate) async fn find_principal(
    conn: &mut SqliteConnection,
    id: &PrincipalId,
) -> Result<Option<Principal>, RepositoryError> {
    let row = sqlx::query(
        "SELECT id, display_name, email, role, active, directorate_id, unit_id, department_id,
                section_id, division_id
         FROM principal WHERE id = ?",
    )
    .bind(&id.0)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_principal).transpose()
}

pub(crate) async fn load_permission_table(
    conn: &mut SqliteConnection,
) -> Result<PermissionTable, RepositoryError> {
    let mut table = PermissionTable::default();

    let rows = sqlx::query("SELECT principal_id, permission_key FROM principal_permission")
        .fetch_all(&mut *conn)
        .await?;
    for row in &rows {
        let principal_id: String = column(row, "principal_id")?;
        let key: String = column(row, "permission_key")?;
        table.grant_principal(PrincipalId(principal_id), &key);
    }

    let rows = sqlx::query("SELECT role, permission_key FROM role_permission")
        .fetch_all(&mut *conn)
        .await?;
    for row in &rows {
        let role: String = column(row, "role")?;
        let key: String = column(row, "permission_key")?;
        table.grant_role(&role, &key);
    }

    Ok(table)
}

pub(crate) async fn load_directory(
    conn: &mut SqliteConnection,
) -> Result<InMemoryDirectory, RepositoryError> {
    let mut directory = InMemoryDirectory::default();

    let rows = sqlx::query(
        "SELECT id, display_name, email, role, active, directorate_id, unit_id, department_id,
                section_id, division_id
         FROM principal ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await?;
    for row in &rows {
        directory.insert_principal(row_to_principal(row)?);
    }

    for committee in load_committees(conn).await? {
        directory.insert_committee(committee);
    }

    for entity in load_legacy_units(conn).await? {
        directory.insert_legacy_entity(entity);
    }

    let rows = sqlx::query(
        "SELECT id, legacy_type, legacy_id FROM org_node
         WHERE legacy_type IS NOT NULL AND legacy_id IS NOT NULL",
    )
    .fetch_all(&mut *conn)
    .await?;
    for row in &rows {
        let key = legacy_key(row, "legacy_type", "legacy_id")?;
        directory.insert_projected_node(key, OrgNodeId(column(row, "id")?));
    }

    let rows = sqlx::query(
        "SELECT principal_id, node_id, title, is_primary FROM org_node_assignment
         ORDER BY principal_id, node_id",
    )
    .fetch_all(&mut *conn)
    .await?;
    for row in &rows {
        directory.insert_assignment(NodeAssignment {
            principal_id: PrincipalId(column(row, "principal_id")?),
            node_id: OrgNodeId(column(row, "node_id")?),
            title: column(row, "title")?,
            is_primary: flag(row, "is_primary")?,
        });
    }

    Ok(directory)
}

async fn load_committees(conn: &mut SqliteConnection) -> Result<Vec<Committee>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT id, committee_id, principal_id, role_code, member_role, active
         FROM committee_member ORDER BY committee_id, id",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut members: HashMap<i64, Vec<CommitteeMember>> = HashMap::new();
    for row in &rows {
        let committee_id: i64 = column(row, "committee_id")?;
        let principal_id: Option<String> = column(row, "principal_id")?;
        let role_code: Option<String> = column(row, "role_code")?;
        let member = match (principal_id, role_code) {
            (Some(id), _) => MemberRef::Principal(PrincipalId(id)),
            (None, Some(role)) => MemberRef::Role(role),
            (None, None) => {
                return Err(RepositoryError::Decode(format!(
                    "committee {committee_id} has a member with no principal and no role"
                )))
            }
        };
        let role: String = column(row, "member_role")?;
        let role = CommitteeMemberRole::parse(&role)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown member role `{role}`")))?;

        members.entry(committee_id).or_default().push(CommitteeMember {
            id: column(row, "id")?,
            member,
            role,
            active: flag(row, "active")?,
        });
    }

    let rows = sqlx::query(
        "SELECT id, name_local, name_english, code, active FROM committee ORDER BY id",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> Result<Committee, RepositoryError> {
            let id: i64 = column(row, "id")?;
            Ok(Committee {
                id: CommitteeId(id),
                names: display_names(row)?,
                code: column(row, "code")?,
                active: flag(row, "active")?,
                members: members.remove(&id).unwrap_or_default(),
            })
        })
        .collect()
}

pub(crate) async fn load_legacy_units(
    conn: &mut SqliteConnection,
) -> Result<Vec<LegacyOrgEntity>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT legacy_type, legacy_id, name_local, name_english, code, active, organization_id,
                directorate_id, unit_id, department_id, section_id, division_id
         FROM legacy_org_unit ORDER BY legacy_type, legacy_id",
    )
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| -> Result<LegacyOrgEntity, RepositoryError> {
            Ok(LegacyOrgEntity {
                key: legacy_key(row, "legacy_type", "legacy_id")?,
                names: display_names(row)?,
                code: column(row, "code")?,
                active: flag(row, "active")?,
                parents: LegacyParents {
                    organization_id: column(row, "organization_id")?,
                    directorate_id: column(row, "directorate_id")?,
                    unit_id: column(row, "unit_id")?,
                    department_id: column(row, "department_id")?,
                    section_id: column(row, "section_id")?,
                    division_id: column(row, "division_id")?,
                },
            })
        })
        .collect()
}

pub(crate) fn row_to_principal(row: &SqliteRow) -> Result<Principal, RepositoryError> {
    Ok(Principal {
        id: PrincipalId(column(row, "id")?),
        display_name: column(row, "display_name")?,
        email: column(row, "email")?,
        role: column(row, "role")?,
        active: flag(row, "active")?,
        placement: OrgPlacement {
            directorate_id: column(row, "directorate_id")?,
            unit_id: column(row, "unit_id")?,
            department_id: column(row, "department_id")?,
            section_id: column(row, "section_id")?,
            division_id: column(row, "division_id")?,
        },
    })
}

pub(crate) fn display_names(row: &SqliteRow) -> Result<DisplayNames, RepositoryError> {
    Ok(DisplayNames { local: column(row, "name_local")?, english: column(row, "name_english")? })
}

pub(crate) fn legacy_key(
    row: &SqliteRow,
    kind_column: &str,
    id_column: &str,
) -> Result<LegacyKey, RepositoryError> {
    let kind: String = column(row, kind_column)?;
    let kind = LegacyKind::parse(&kind)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown legacy type `{kind}`")))?;
    Ok(LegacyKey::new(kind, column(row, id_column)?))
}
