use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Days, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::{AuditCategory, AuditEvent, AuditOutcome};
use crate::domain::delegation::{Delegation, DelegationId};
use crate::domain::principal::{Principal, PrincipalId};

pub const DELEGATION_MANAGE: &str = "DELEGATION_MANAGE";
pub const DELEGATION_SELF: &str = "DELEGATION_SELF";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DelegationError {
    #[error("a principal cannot delegate to themselves")]
    SelfDelegation,
    #[error("delegation window ends before it starts")]
    InvertedWindow,
    #[error("delegation day count must be at least 1")]
    ZeroDays,
    #[error("delegation window runs past the supported calendar range")]
    WindowOutOfRange,
    #[error("{delegatee} already has an active delegation overlapping this window (#{existing})")]
    Overlap { delegatee: PrincipalId, existing: DelegationId },
    #[error("{actor} may not grant delegations on behalf of {delegator}")]
    GrantNotAllowed { actor: PrincipalId, delegator: PrincipalId },
    #[error("{actor} may not revoke delegation #{delegation_id}")]
    RevokeNotAllowed { actor: PrincipalId, delegation_id: DelegationId },
    #[error("delegation #{0} is already inactive")]
    AlreadyInactive(DelegationId),
}

/// Identity used for a request: who is really acting and whose authority
/// they are acting with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActingIdentity {
    pub actor: Principal,
    pub effective: Principal,
    pub delegation_id: Option<DelegationId>,
    pub privileged: bool,
}

impl ActingIdentity {
    pub fn is_delegated(&self) -> bool {
        self.delegation_id.is_some()
    }

    /// Ids the request may act as, actor first.
    pub fn principal_ids(&self) -> Vec<&PrincipalId> {
        if self.is_delegated() {
            vec![&self.actor.id, &self.effective.id]
        } else {
            vec![&self.actor.id]
        }
    }
}

/// Delegations visible to the resolver.
pub trait DelegationSource {
    fn delegations_to(&self, delegatee: &PrincipalId) -> Vec<&Delegation>;
}

impl DelegationSource for [Delegation] {
    fn delegations_to(&self, delegatee: &PrincipalId) -> Vec<&Delegation> {
        self.iter().filter(|delegation| &delegation.delegatee_id == delegatee).collect()
    }
}

impl DelegationSource for Vec<Delegation> {
    fn delegations_to(&self, delegatee: &PrincipalId) -> Vec<&Delegation> {
        self.as_slice().delegations_to(delegatee)
    }
}

/// Per-principal and per-role permission grants.
#[derive(Clone, Debug, Default)]
pub struct PermissionTable {
    principal_grants: HashMap<PrincipalId, BTreeSet<String>>,
    role_grants: HashMap<String, BTreeSet<String>>,
}

impl PermissionTable {
    pub fn grant_principal(&mut self, principal_id: PrincipalId, key: &str) {
        self.principal_grants.entry(principal_id).or_default().insert(permission_key(key));
    }

    pub fn grant_role(&mut self, role: &str, key: &str) {
        self.role_grants
            .entry(role.trim().to_lowercase())
            .or_default()
            .insert(permission_key(key));
    }

    pub fn allows(&self, principal: &Principal, key: &str) -> bool {
        let key = permission_key(key);
        if key.is_empty() {
            return false;
        }

        let direct =
            self.principal_grants.get(&principal.id).is_some_and(|grants| grants.contains(&key));
        direct
            || self
                .role_grants
                .get(&principal.role.trim().to_lowercase())
                .is_some_and(|grants| grants.contains(&key))
    }
}

#[derive(Clone, Debug)]
pub struct DelegationResolver {
    privileged_roles: BTreeSet<String>,
}

impl DelegationResolver {
    pub fn new<I, S>(privileged_roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let privileged_roles = privileged_roles
            .into_iter()
            .map(|role| normalize_role(role.as_ref()))
            .filter(|role| !role.is_empty())
            .collect();
        Self { privileged_roles }
    }

    pub fn is_privileged(&self, role: &str) -> bool {
        self.privileged_roles.contains(&normalize_role(role))
    }

    /// Whether resolving `actor` needs the delegation store at all.
    /// Privileged principals never consult it.
    pub fn requires_lookup(&self, actor: &Principal) -> bool {
        !self.is_privileged(&actor.role)
    }

    /// The delegator of the active delegation to `actor` covering `now`,
    /// or `actor` itself. `delegators` resolves delegator ids; a delegation
    /// whose delegator cannot be found, or is inactive, is ignored.
    pub fn effective_identity<S, F>(
        &self,
        actor: &Principal,
        source: &S,
        delegators: F,
        now: DateTime<Utc>,
    ) -> ActingIdentity
    where
        S: DelegationSource + ?Sized,
        F: Fn(&PrincipalId) -> Option<Principal>,
    {
        let direct = ActingIdentity {
            actor: actor.clone(),
            effective: actor.clone(),
            delegation_id: None,
            privileged: self.is_privileged(&actor.role),
        };
        if direct.privileged || !actor.active {
            return direct;
        }

        let mut candidates: Vec<&Delegation> = source
            .delegations_to(&actor.id)
            .into_iter()
            .filter(|delegation| delegation.covers(now))
            .collect();
        candidates.sort_by(|a, b| (b.expires_at, b.id).cmp(&(a.expires_at, a.id)));

        for delegation in candidates {
            if let Some(delegator) = delegators(&delegation.delegator_id).filter(|p| p.active) {
                return ActingIdentity {
                    actor: actor.clone(),
                    effective: delegator,
                    delegation_id: Some(delegation.id),
                    privileged: false,
                };
            }
        }
        direct
    }

    pub fn permits(&self, principal: &Principal, key: &str, table: &PermissionTable) -> bool {
        self.is_privileged(&principal.role) || table.allows(principal, key)
    }

    /// OR of the real actor's and the effective identity's grants, so a
    /// delegation only ever adds capability.
    pub fn has_permission(
        &self,
        acting: &ActingIdentity,
        key: &str,
        table: &PermissionTable,
    ) -> bool {
        self.permits(&acting.actor, key, table)
            || (acting.is_delegated() && self.permits(&acting.effective, key, table))
    }

    /// Holders of `DELEGATION_MANAGE` may grant for anyone; holders of
    /// `DELEGATION_SELF` only for themselves.
    pub fn authorize_grant(
        &self,
        acting: &ActingIdentity,
        delegator: &PrincipalId,
        table: &PermissionTable,
    ) -> Result<(), DelegationError> {
        let self_grant = &acting.actor.id == delegator
            && self.has_permission(acting, DELEGATION_SELF, table);
        let allowed = self_grant || self.has_permission(acting, DELEGATION_MANAGE, table);
        if allowed {
            Ok(())
        } else {
            Err(DelegationError::GrantNotAllowed {
                actor: acting.actor.id.clone(),
                delegator: delegator.clone(),
            })
        }
    }

    pub fn authorize_revoke(
        &self,
        acting: &ActingIdentity,
        delegation: &Delegation,
        table: &PermissionTable,
    ) -> Result<(), DelegationError> {
        if !delegation.active {
            return Err(DelegationError::AlreadyInactive(delegation.id));
        }
        if acting.actor.id == delegation.delegator_id
            || self.has_permission(acting, DELEGATION_MANAGE, table)
        {
            Ok(())
        } else {
            Err(DelegationError::RevokeNotAllowed {
                actor: acting.actor.id.clone(),
                delegation_id: delegation.id,
            })
        }
    }
}

/// Lowercase, fold Latin diacritics, and drop everything that is not a
/// letter or digit, so `Super-Admin`, `super_admin` and `SUPER ADMIN`
/// compare equal.
pub fn normalize_role(raw: &str) -> String {
    raw.chars()
        .filter(|c| !('\u{0300}'..='\u{036f}').contains(c))
        .flat_map(char::to_lowercase)
        .map(fold_diacritic)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

fn fold_diacritic(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'è' | 'é' | 'ê' | 'ë' | 'ē' => 'e',
        'ì' | 'í' | 'î' | 'ï' | 'ī' => 'i',
        'ñ' | 'ń' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' => 'o',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' => 'u',
        'ý' | 'ÿ' => 'y',
        'š' | 'ś' => 's',
        'ž' | 'ź' | 'ż' => 'z',
        other => other,
    }
}

fn permission_key(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

/// How a grant expresses its window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DelegationWindow {
    /// 00:00:00 through 23:59:59 of one day.
    SingleDay { day: NaiveDate },
    /// `days` consecutive whole days starting at `start`.
    Days { start: NaiveDate, days: u32 },
    Explicit { starts_at: DateTime<Utc>, expires_at: DateTime<Utc> },
}

impl DelegationWindow {
    pub fn bounds(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), DelegationError> {
        let (starts_at, expires_at) = match *self {
            Self::SingleDay { day } => (start_of(day), end_of(day)?),
            Self::Days { start, days } => {
                if days == 0 {
                    return Err(DelegationError::ZeroDays);
                }
                let last = start
                    .checked_add_days(Days::new(u64::from(days) - 1))
                    .ok_or(DelegationError::WindowOutOfRange)?;
                (start_of(start), end_of(last)?)
            }
            Self::Explicit { starts_at, expires_at } => (starts_at, expires_at),
        };

        if expires_at < starts_at {
            return Err(DelegationError::InvertedWindow);
        }
        Ok((starts_at, expires_at))
    }
}

fn start_of(day: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&day.and_time(NaiveTime::default()))
}

fn end_of(day: NaiveDate) -> Result<DateTime<Utc>, DelegationError> {
    start_of(day)
        .checked_add_signed(Duration::seconds(86_399))
        .ok_or(DelegationError::WindowOutOfRange)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationGrant {
    pub delegator: PrincipalId,
    pub delegatee: PrincipalId,
    pub window: DelegationWindow,
    pub note: Option<String>,
}

/// A grant that passed validation, ready to persist.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedGrant {
    pub delegator: PrincipalId,
    pub delegatee: PrincipalId,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_by: PrincipalId,
    pub note: Option<String>,
}

impl ValidatedGrant {
    pub fn audit_event(&self, delegation_id: DelegationId, correlation_id: &str) -> AuditEvent {
        AuditEvent::new(
            None,
            correlation_id,
            "delegation.granted",
            AuditCategory::Delegation,
            self.created_by.0.clone(),
            AuditOutcome::Success,
        )
        .with_note(format!(
            "Delegation #{delegation_id} from {} to {} until {}",
            self.delegator,
            self.delegatee,
            self.expires_at.to_rfc3339()
        ))
        .with_metadata("delegation_id", delegation_id.to_string())
    }
}

/// Checks a grant against the active delegations already held by the same
/// delegatee. Overlap on the delegator side is allowed.
pub fn validate_grant(
    grant: &DelegationGrant,
    created_by: &PrincipalId,
    existing: &[Delegation],
) -> Result<ValidatedGrant, DelegationError> {
    if grant.delegator == grant.delegatee {
        return Err(DelegationError::SelfDelegation);
    }
    let (starts_at, expires_at) = grant.window.bounds()?;

    if let Some(clash) = existing.iter().find(|delegation| {
        delegation.delegatee_id == grant.delegatee && delegation.overlaps(starts_at, expires_at)
    }) {
        return Err(DelegationError::Overlap {
            delegatee: grant.delegatee.clone(),
            existing: clash.id,
        });
    }

    Ok(ValidatedGrant {
        delegator: grant.delegator.clone(),
        delegatee: grant.delegatee.clone(),
        starts_at,
        expires_at,
        created_by: created_by.clone(),
        note: grant.note.as_ref().map(|note| note.trim().to_string()).filter(|n| !n.is_empty()),
    })
}

pub fn revoke_audit_event(
    delegation: &Delegation,
    actor: &PrincipalId,
    correlation_id: &str,
) -> AuditEvent {
    AuditEvent::new(
        None,
        correlation_id,
        "delegation.revoked",
        AuditCategory::Delegation,
        actor.0.clone(),
        AuditOutcome::Success,
    )
    .with_transition("active", "inactive")
    .with_note(format!("Delegation #{} revoked", delegation.id))
    .with_metadata("delegation_id", delegation.id.to_string())
}
