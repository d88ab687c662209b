use std::collections::BTreeSet;

use crate::approvals::Directory;
use crate::domain::committee::{CommitteeId, CommitteeMember, CommitteeMemberRole, MemberRef};
use crate::domain::principal::PrincipalId;
use crate::domain::template::CommitteeDeliveryMode;

/// Picks the effective recipients of a committee step.
pub struct CommitteeDeliveryResolver<'a, D: Directory + ?Sized> {
    directory: &'a D,
}

impl<'a, D: Directory + ?Sized> CommitteeDeliveryResolver<'a, D> {
    pub fn new(directory: &'a D) -> Self {
        Self { directory }
    }

    /// Role seats are expanded through `resolve_role`. An inactive or
    /// unknown committee, or a missing officer, resolves to an empty set.
    pub fn resolve<F>(
        &self,
        committee_id: CommitteeId,
        mode: CommitteeDeliveryMode,
        resolve_role: F,
    ) -> BTreeSet<PrincipalId>
    where
        F: Fn(&str) -> BTreeSet<PrincipalId>,
    {
        let Some(committee) = self.directory.committee(committee_id).filter(|c| c.active) else {
            return BTreeSet::new();
        };

        let seats: Vec<&CommitteeMember> = match mode {
            CommitteeDeliveryMode::All => committee.active_members().collect(),
            CommitteeDeliveryMode::Chair => {
                committee.active_with_role(CommitteeMemberRole::Chair).into_iter().take(1).collect()
            }
            CommitteeDeliveryMode::Secretary => committee
                .active_with_role(CommitteeMemberRole::Secretary)
                .into_iter()
                .take(1)
                .collect(),
        };

        let mut recipients = BTreeSet::new();
        for seat in seats {
            match &seat.member {
                MemberRef::Principal(principal_id) => {
                    let active =
                        self.directory.principal(principal_id).is_some_and(|p| p.active);
                    if active {
                        recipients.insert(principal_id.clone());
                    }
                }
                MemberRef::Role(role) => recipients.extend(resolve_role(role)),
            }
        }
        recipients
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::approvals::fixtures::{budget_committee, directory, seat};
    use crate::approvals::{ApproverResolver, CommitteeDeliveryResolver};
    use crate::domain::committee::{Committee, CommitteeId, CommitteeMemberRole, MemberRef};
    use crate::domain::principal::PrincipalId;
    use crate::domain::template::CommitteeDeliveryMode;

    fn ids(values: &[&str]) -> BTreeSet<PrincipalId> {
        values.iter().map(|value| PrincipalId::new(*value)).collect()
    }

    #[test]
    fn chair_and_secretary_pick_single_officer() {
        let directory = directory();
        let roles = ApproverResolver::new(&directory);
        let resolver = CommitteeDeliveryResolver::new(&directory);

        let chair =
            resolver.resolve(CommitteeId(1), CommitteeDeliveryMode::Chair, |r| roles.resolve_role(r));
        let secretary = resolver
            .resolve(CommitteeId(1), CommitteeDeliveryMode::Secretary, |r| roles.resolve_role(r));

        assert_eq!(chair, ids(&["cm-chair"]));
        assert_eq!(secretary, ids(&["cm-sec"]));
    }

    #[test]
    fn missing_officer_resolves_empty_instead_of_failing() {
        let mut committee = budget_committee();
        for member in &mut committee.members {
            if member.role == CommitteeMemberRole::Chair {
                member.active = false;
            }
        }
        let directory = directory().with_committee(committee);
        let roles = ApproverResolver::new(&directory);
        let resolver = CommitteeDeliveryResolver::new(&directory);

        let chair =
            resolver.resolve(CommitteeId(1), CommitteeDeliveryMode::Chair, |r| roles.resolve_role(r));
        assert!(chair.is_empty());
    }

    #[test]
    fn role_held_chair_expands_to_every_role_holder() {
        let committee = Committee {
            members: vec![seat(
                9,
                MemberRef::Role("AUDITOR".to_string()),
                CommitteeMemberRole::Chair,
            )],
            ..budget_committee()
        };
        let directory = directory().with_committee(committee);
        let roles = ApproverResolver::new(&directory);
        let resolver = CommitteeDeliveryResolver::new(&directory);

        let chair =
            resolver.resolve(CommitteeId(1), CommitteeDeliveryMode::Chair, |r| roles.resolve_role(r));
        assert_eq!(chair, ids(&["aud-1", "aud-2"]));
    }

    #[test]
    fn inactive_committee_has_no_recipients() {
        let committee = Committee { active: false, ..budget_committee() };
        let directory = directory().with_committee(committee);
        let roles = ApproverResolver::new(&directory);
        let resolver = CommitteeDeliveryResolver::new(&directory);

        let all =
            resolver.resolve(CommitteeId(1), CommitteeDeliveryMode::All, |r| roles.resolve_role(r));
        assert!(all.is_empty());
    }
}
