use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;
use tracing::info;

use routewise_core::delegation::{
    revoke_audit_event, validate_grant, ActingIdentity, DelegationGrant, DelegationResolver,
};
use routewise_core::domain::delegation::{Delegation, DelegationId};
use routewise_core::domain::principal::{Principal, PrincipalId};

use super::directory::{find_principal, load_permission_table};
use super::outbox::insert_audit_events;
use super::{column, flag, format_timestamp, timestamp, DelegationRepository, RepositoryError};
use crate::DbPool;

const DELEGATION_COLUMNS: &str = "id, delegator_id, delegatee_id, starts_at, expires_at, active, \
     created_by, note, created_at";

pub struct SqlDelegationRepository {
    pool: DbPool,
    resolver: DelegationResolver,
}

impl SqlDelegationRepository {
    pub fn new(pool: DbPool, resolver: DelegationResolver) -> Self {
        Self { pool, resolver }
    }

    pub async fn find(&self, id: DelegationId) -> Result<Option<Delegation>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        find_delegation(&mut conn, id).await
    }

    /// Active delegations to `delegatee` whose window covers `now`.
    pub async fn active_for_delegatee(
        &self,
        delegatee: &PrincipalId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Delegation>, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        let mut delegations = load_active_for_delegatee(&mut conn, delegatee).await?;
        delegations.retain(|delegation| delegation.covers(now));
        Ok(delegations)
    }
}

#[async_trait]
impl DelegationRepository for SqlDelegationRepository {
    async fn grant(
        &self,
        grant: &DelegationGrant,
        actor_id: &PrincipalId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<Delegation, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        for id in [&grant.delegator, &grant.delegatee] {
            if find_principal(&mut *tx, id).await?.is_none() {
                return Err(RepositoryError::not_found("principal", id));
            }
        }
        let acting = resolve_acting(&mut *tx, &self.resolver, actor_id, now).await?;
        let table = load_permission_table(&mut *tx).await?;
        self.resolver.authorize_grant(&acting, &grant.delegator, &table)?;

        let existing = load_active_for_delegatee(&mut *tx, &grant.delegatee).await?;
        let validated = validate_grant(grant, &acting.actor.id, &existing)?;

        let result = sqlx::query(
            "INSERT INTO delegation (delegator_id, delegatee_id, starts_at, expires_at, active,
                                     created_by, note, created_at)
             VALUES (?, ?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(&validated.delegator.0)
        .bind(&validated.delegatee.0)
        .bind(format_timestamp(validated.starts_at))
        .bind(format_timestamp(validated.expires_at))
        .bind(&validated.created_by.0)
        .bind(&validated.note)
        .bind(format_timestamp(now))
        .execute(&mut *tx)
        .await?;
        let id = DelegationId(result.last_insert_rowid());

        insert_audit_events(&mut *tx, &[validated.audit_event(id, correlation_id).at(now)]).await?;
        let delegation = find_delegation(&mut *tx, id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("delegation", id))?;
        tx.commit().await?;

        info!(
            event_name = "delegation.granted",
            correlation_id,
            delegation_id = %id,
            delegator = %delegation.delegator_id,
            delegatee = %delegation.delegatee_id,
            "delegation granted"
        );
        Ok(delegation)
    }

    async fn revoke(
        &self,
        id: DelegationId,
        actor_id: &PrincipalId,
        now: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<Delegation, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let delegation = find_delegation(&mut *tx, id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("delegation", id))?;
        let acting = resolve_acting(&mut *tx, &self.resolver, actor_id, now).await?;
        let table = load_permission_table(&mut *tx).await?;
        self.resolver.authorize_revoke(&acting, &delegation, &table)?;

        sqlx::query("UPDATE delegation SET active = 0 WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        insert_audit_events(
            &mut *tx,
            &[revoke_audit_event(&delegation, &acting.actor.id, correlation_id).at(now)],
        )
        .await?;
        tx.commit().await?;

        info!(
            event_name = "delegation.revoked",
            correlation_id,
            delegation_id = %id,
            actor = %acting.actor.id,
            "delegation revoked"
        );
        Ok(Delegation { active: false, ..delegation })
    }

    async fn acting_identity(
        &self,
        actor_id: &PrincipalId,
        now: DateTime<Utc>,
    ) -> Result<ActingIdentity, RepositoryError> {
        let mut conn = self.pool.acquire().await?;
        resolve_acting(&mut conn, &self.resolver, actor_id, now).await
    }
}

/// Resolves who `actor_id` acts as at `now`. Privileged principals skip the
/// delegation table entirely.
pub(crate) async fn resolve_acting(
    conn: &mut SqliteConnection,
    resolver: &DelegationResolver,
    actor_id: &PrincipalId,
    now: DateTime<Utc>,
) -> Result<ActingIdentity, RepositoryError> {
    let actor = find_principal(&mut *conn, actor_id)
        .await?
        .ok_or_else(|| RepositoryError::not_found("principal", actor_id))?;
    if !resolver.requires_lookup(&actor) {
        return Ok(resolver.effective_identity(&actor, &Vec::<Delegation>::new(), |_| None, now));
    }

    let delegations = load_active_for_delegatee(&mut *conn, &actor.id).await?;
    let mut delegators: HashMap<PrincipalId, Principal> = HashMap::new();
    for delegation in delegations.iter().filter(|delegation| delegation.covers(now)) {
        if delegators.contains_key(&delegation.delegator_id) {
            continue;
        }
        if let Some(principal) = find_principal(&mut *conn, &delegation.delegator_id).await? {
            delegators.insert(principal.id.clone(), principal);
        }
    }

    Ok(resolver.effective_identity(&actor, &delegations, |id| delegators.get(id).cloned(), now))
}

pub(crate) async fn load_active_for_delegatee(
    conn: &mut SqliteConnection,
    delegatee: &PrincipalId,
) -> Result<Vec<Delegation>, RepositoryError> {
    let rows = sqlx::query(&format!(
        "SELECT {DELEGATION_COLUMNS} FROM delegation
         WHERE delegatee_id = ? AND active = 1
         ORDER BY expires_at DESC, id DESC"
    ))
    .bind(&delegatee.0)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_delegation).collect()
}

async fn find_delegation(
    conn: &mut SqliteConnection,
    id: DelegationId,
) -> Result<Option<Delegation>, RepositoryError> {
    let row = sqlx::query(&format!("SELECT {DELEGATION_COLUMNS} FROM delegation WHERE id = ?"))
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(row_to_delegation).transpose()
}

fn row_to_delegation(row: &SqliteRow) -> Result<Delegation, RepositoryError> {
    Ok(Delegation {
        id: DelegationId(column(row, "id")?),
        delegator_id: PrincipalId(column(row, "delegator_id")?),
        delegatee_id: PrincipalId(column(row, "delegatee_id")?),
        starts_at: timestamp(row, "starts_at")?,
        expires_at: timestamp(row, "expires_at")?,
        active: flag(row, "active")?,
        created_by: PrincipalId(column(row, "created_by")?),
        note: column(row, "note")?,
        created_at: timestamp(row, "created_at")?,
    })
}
