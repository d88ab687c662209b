pub mod committee;
pub mod validation;

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::domain::committee::{Committee, CommitteeId};
use crate::domain::org::{LegacyKey, LegacyOrgEntity, NodeAssignment, OrgNodeId};
use crate::domain::principal::{Principal, PrincipalId};
use crate::domain::template::ApproverSpec;
use crate::org::hierarchy::MAX_ANCESTOR_HOPS;

pub use committee::CommitteeDeliveryResolver;
pub use validation::{TemplateValidator, ValidationError};

/// Read-only view of the master data approver resolution depends on.
pub trait Directory {
    fn principal(&self, id: &PrincipalId) -> Option<&Principal>;
    fn principals(&self) -> &[Principal];
    fn committee(&self, id: CommitteeId) -> Option<&Committee>;
    fn legacy_entity(&self, key: &LegacyKey) -> Option<&LegacyOrgEntity>;
    fn node_for_legacy(&self, key: &LegacyKey) -> Option<OrgNodeId>;
    fn assignments_of(&self, principal_id: &PrincipalId) -> &[NodeAssignment];
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDirectory {
    principals: Vec<Principal>,
    principal_index: HashMap<PrincipalId, usize>,
    committees: HashMap<CommitteeId, Committee>,
    legacy: HashMap<LegacyKey, LegacyOrgEntity>,
    legacy_nodes: HashMap<LegacyKey, OrgNodeId>,
    assignments: HashMap<PrincipalId, Vec<NodeAssignment>>,
}

impl InMemoryDirectory {
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.insert_principal(principal);
        self
    }

    pub fn with_committee(mut self, committee: Committee) -> Self {
        self.committees.insert(committee.id, committee);
        self
    }

    pub fn with_legacy_entity(mut self, entity: LegacyOrgEntity) -> Self {
        self.legacy.insert(entity.key, entity);
        self
    }

    pub fn with_projected_node(mut self, key: LegacyKey, node_id: OrgNodeId) -> Self {
        self.legacy_nodes.insert(key, node_id);
        self
    }

    pub fn with_assignment(mut self, assignment: NodeAssignment) -> Self {
        self.insert_assignment(assignment);
        self
    }

    pub fn insert_principal(&mut self, principal: Principal) {
        match self.principal_index.get(&principal.id) {
            Some(&index) => self.principals[index] = principal,
            None => {
                self.principal_index.insert(principal.id.clone(), self.principals.len());
                self.principals.push(principal);
            }
        }
    }

    pub fn insert_committee(&mut self, committee: Committee) {
        self.committees.insert(committee.id, committee);
    }

    pub fn insert_legacy_entity(&mut self, entity: LegacyOrgEntity) {
        self.legacy.insert(entity.key, entity);
    }

    pub fn insert_projected_node(&mut self, key: LegacyKey, node_id: OrgNodeId) {
        self.legacy_nodes.insert(key, node_id);
    }

    pub fn insert_assignment(&mut self, assignment: NodeAssignment) {
        self.assignments.entry(assignment.principal_id.clone()).or_default().push(assignment);
    }
}

impl Directory for InMemoryDirectory {
    fn principal(&self, id: &PrincipalId) -> Option<&Principal> {
        self.principal_index.get(id).and_then(|&index| self.principals.get(index))
    }

    fn principals(&self) -> &[Principal] {
        &self.principals
    }

    fn committee(&self, id: CommitteeId) -> Option<&Committee> {
        self.committees.get(&id)
    }

    fn legacy_entity(&self, key: &LegacyKey) -> Option<&LegacyOrgEntity> {
        self.legacy.get(key)
    }

    fn node_for_legacy(&self, key: &LegacyKey) -> Option<OrgNodeId> {
        self.legacy_nodes.get(key).copied()
    }

    fn assignments_of(&self, principal_id: &PrincipalId) -> &[NodeAssignment] {
        self.assignments.get(principal_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepResolution {
    Resolved(BTreeSet<PrincipalId>),
    Unresolvable,
}

impl StepResolution {
    pub fn principals(&self) -> BTreeSet<PrincipalId> {
        match self {
            Self::Resolved(set) => set.clone(),
            Self::Unresolvable => BTreeSet::new(),
        }
    }
}

pub struct ApproverResolver<'a, D: Directory + ?Sized> {
    directory: &'a D,
}

impl<'a, D: Directory + ?Sized> ApproverResolver<'a, D> {
    pub fn new(directory: &'a D) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &'a D {
        self.directory
    }

    /// Principals currently authorized to act for `spec`. Only active
    /// principals are returned; an empty set is a valid answer.
    pub fn resolve(&self, spec: &ApproverSpec) -> BTreeSet<PrincipalId> {
        match spec {
            ApproverSpec::User { principal_id } => self
                .directory
                .principal(principal_id)
                .filter(|principal| principal.active)
                .map(|principal| principal.id.clone())
                .into_iter()
                .collect(),
            ApproverSpec::Role { role_code } => self.resolve_role(role_code),
            ApproverSpec::OrgLevel { level, unit_id } => {
                let target = LegacyKey::new(*level, *unit_id);
                self.active_principals()
                    .filter(|principal| self.placement_reaches(principal, &target))
                    .map(|principal| principal.id.clone())
                    .collect()
            }
            ApproverSpec::OrgNode { node_id } => self
                .active_principals()
                .filter(|principal| self.assigned_nodes(principal).contains(node_id))
                .map(|principal| principal.id.clone())
                .collect(),
            ApproverSpec::Committee { committee_id, delivery } => {
                CommitteeDeliveryResolver::new(self.directory).resolve(
                    *committee_id,
                    *delivery,
                    |role| self.resolve_role(role),
                )
            }
        }
    }

    pub fn resolve_step(
        &self,
        primary: &ApproverSpec,
        co_assignees: &[ApproverSpec],
    ) -> StepResolution {
        let mut resolved = self.resolve(primary);
        for spec in co_assignees {
            resolved.extend(self.resolve(spec));
        }

        if resolved.is_empty() {
            StepResolution::Unresolvable
        } else {
            StepResolution::Resolved(resolved)
        }
    }

    pub fn resolve_role(&self, role_code: &str) -> BTreeSet<PrincipalId> {
        let wanted = normalize_key(role_code);
        if wanted.is_empty() {
            return BTreeSet::new();
        }

        self.active_principals()
            .filter(|principal| normalize_key(&principal.role) == wanted)
            .map(|principal| principal.id.clone())
            .collect()
    }

    fn active_principals(&self) -> impl Iterator<Item = &'a Principal> {
        let directory: &'a D = self.directory;
        directory.principals().iter().filter(|principal| principal.active)
    }

    fn placement_reaches(&self, principal: &Principal, target: &LegacyKey) -> bool {
        principal.placement.fallback_keys().into_iter().any(|start| {
            if start == *target {
                return true;
            }

            let mut visited = HashSet::from([start]);
            let mut current = start;
            while let Some(parent) = self.legacy_parent(&current) {
                if parent == *target {
                    return true;
                }
                if !visited.insert(parent) || visited.len() > MAX_ANCESTOR_HOPS {
                    break;
                }
                current = parent;
            }
            false
        })
    }

    fn legacy_parent(&self, key: &LegacyKey) -> Option<LegacyKey> {
        let entity = self.directory.legacy_entity(key)?;
        entity
            .parent_candidates()
            .into_iter()
            .find(|candidate| self.directory.legacy_entity(candidate).is_some())
    }

    fn assigned_nodes(&self, principal: &Principal) -> BTreeSet<OrgNodeId> {
        let assignments = self.directory.assignments_of(&principal.id);

        let primary: BTreeSet<OrgNodeId> = assignments
            .iter()
            .filter(|assignment| assignment.is_primary)
            .map(|assignment| assignment.node_id)
            .collect();
        if !primary.is_empty() {
            return primary;
        }

        if !assignments.is_empty() {
            return assignments.iter().map(|assignment| assignment.node_id).collect();
        }

        principal
            .placement
            .fallback_keys()
            .iter()
            .find_map(|key| self.directory.node_for_legacy(key))
            .into_iter()
            .collect()
    }
}

pub(crate) fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}


#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::fixtures::{directory, placed, principal};
    use super::{ApproverResolver, InMemoryDirectory, StepResolution};
    use crate::domain::committee::CommitteeId;
    use crate::domain::org::{LegacyKind, NodeAssignment, OrgNodeId};
    use crate::domain::principal::{OrgPlacement, PrincipalId};
    use crate::domain::template::{ApproverSpec, CommitteeDeliveryMode};

    fn ids(values: &[&str]) -> BTreeSet<PrincipalId> {
        values.iter().map(|value| PrincipalId::new(*value)).collect()
    }

    #[test]
    fn user_spec_resolves_only_active_principal() {
        let directory = directory();
        let resolver = ApproverResolver::new(&directory);

        assert_eq!(resolver.resolve(&ApproverSpec::user("clerk")), ids(&["clerk"]));
        assert!(resolver.resolve(&ApproverSpec::user("retired")).is_empty());
        assert!(resolver.resolve(&ApproverSpec::user("nobody")).is_empty());
    }

    #[test]
    fn role_spec_is_case_and_whitespace_insensitive() {
        let directory = directory();
        let resolver = ApproverResolver::new(&directory);

        assert_eq!(resolver.resolve(&ApproverSpec::role(" DEPT_HEAD ")), ids(&["head"]));
        assert_eq!(resolver.resolve(&ApproverSpec::role("auditor")), ids(&["aud-1", "aud-2"]));
    }

    #[test]
    fn org_level_spec_follows_legacy_parent_chain() {
        let directory = directory();
        let resolver = ApproverResolver::new(&directory);

        let unit = ApproverSpec::OrgLevel { level: LegacyKind::Unit, unit_id: 10 };
        assert_eq!(resolver.resolve(&unit), ids(&["clerk", "head"]));

        let directorate = ApproverSpec::OrgLevel { level: LegacyKind::Directorate, unit_id: 1 };
        assert_eq!(resolver.resolve(&directorate), ids(&["clerk", "director", "head"]));

        let section = ApproverSpec::OrgLevel { level: LegacyKind::Section, unit_id: 1000 };
        assert_eq!(resolver.resolve(&section), ids(&["clerk"]));
    }

    #[test]
    fn org_node_spec_prefers_assignments_then_legacy_fallback() {
        let directory = directory();
        let resolver = ApproverResolver::new(&directory);

        let department_node = ApproverSpec::OrgNode { node_id: OrgNodeId(40) };
        assert_eq!(resolver.resolve(&department_node), ids(&["director", "head"]));

        let section_node = ApproverSpec::OrgNode { node_id: OrgNodeId(50) };
        assert_eq!(resolver.resolve(&section_node), ids(&["clerk"]));
    }

    #[test]
    fn primary_assignment_shadows_other_assignments() {
        let directory = directory()
            .with_assignment(NodeAssignment {
                principal_id: PrincipalId::new("head"),
                node_id: OrgNodeId(77),
                title: None,
                is_primary: true,
            })
            .with_assignment(NodeAssignment {
                principal_id: PrincipalId::new("head"),
                node_id: OrgNodeId(78),
                title: None,
                is_primary: false,
            });
        let resolver = ApproverResolver::new(&directory);

        assert_eq!(
            resolver.resolve(&ApproverSpec::OrgNode { node_id: OrgNodeId(77) }),
            ids(&["head"])
        );
        assert!(resolver.resolve(&ApproverSpec::OrgNode { node_id: OrgNodeId(78) }).is_empty());
        assert_eq!(
            resolver.resolve(&ApproverSpec::OrgNode { node_id: OrgNodeId(40) }),
            ids(&["director"])
        );
    }

    #[test]
    fn committee_all_unions_principal_and_role_seats() {
        let directory = directory();
        let resolver = ApproverResolver::new(&directory);

        let spec = ApproverSpec::committee(CommitteeId(1), CommitteeDeliveryMode::All);
        assert_eq!(resolver.resolve(&spec), ids(&["aud-1", "aud-2", "cm-chair", "cm-sec"]));
    }

    #[test]
    fn step_with_no_resolvable_identity_is_flagged() {
        let directory = directory();
        let resolver = ApproverResolver::new(&directory);

        let resolution =
            resolver.resolve_step(&ApproverSpec::role("treasurer"), &[ApproverSpec::user("ghost")]);
        assert_eq!(resolution, StepResolution::Unresolvable);

        let resolution =
            resolver.resolve_step(&ApproverSpec::role("treasurer"), &[ApproverSpec::user("clerk")]);
        assert_eq!(resolution, StepResolution::Resolved(ids(&["clerk"])));
    }

    fn arbitrary_spec() -> impl Strategy<Value = ApproverSpec> {
        prop_oneof![
            prop::sample::select(vec!["head", "clerk", "director", "retired", "ghost"])
                .prop_map(ApproverSpec::user),
            prop::sample::select(vec!["dept_head", "AUDITOR", "clerk", "none"])
                .prop_map(ApproverSpec::role),
            (
                prop::sample::select(LegacyKind::ALL.to_vec()),
                prop::sample::select(vec![1_i64, 10, 100, 1000]),
            )
                .prop_map(|(level, unit_id)| ApproverSpec::OrgLevel { level, unit_id }),
            prop::sample::select(vec![40_i64, 50, 77]).prop_map(|id| ApproverSpec::OrgNode {
                node_id: OrgNodeId(id)
            }),
            prop::sample::select(vec![
                CommitteeDeliveryMode::All,
                CommitteeDeliveryMode::Chair,
                CommitteeDeliveryMode::Secretary,
            ])
            .prop_map(|delivery| ApproverSpec::committee(CommitteeId(1), delivery)),
        ]
    }

    proptest! {
        #[test]
        fn resolution_is_deterministic(spec in arbitrary_spec()) {
            let directory = directory();
            let resolver = ApproverResolver::new(&directory);
            let first = resolver.resolve(&spec);
            let second = resolver.resolve(&spec);
            prop_assert_eq!(&first, &second);

            let rebuilt = directory.clone();
            let again = ApproverResolver::new(&rebuilt).resolve(&spec);
            prop_assert_eq!(first, again);
        }
    }

    #[test]
    fn org_level_outside_the_parent_chain_resolves_empty() {
        use crate::approvals::fixtures::legacy;
        use crate::domain::org::LegacyParents;

        let directory = InMemoryDirectory::default()
            .with_legacy_entity(legacy(
                LegacyKind::Department,
                5,
                LegacyParents { unit_id: Some(6), ..LegacyParents::default() },
            ))
            .with_legacy_entity(legacy(
                LegacyKind::Unit,
                6,
                LegacyParents { directorate_id: Some(7), ..LegacyParents::default() },
            ))
            .with_legacy_entity(legacy(LegacyKind::Directorate, 7, LegacyParents::default()))
            .with_principal(placed(
                "p",
                "clerk",
                OrgPlacement { department_id: Some(5), ..OrgPlacement::default() },
            ))
            .with_principal(principal("q", "clerk"));
        let resolver = ApproverResolver::new(&directory);

        let spec = ApproverSpec::OrgLevel { level: LegacyKind::Directorate, unit_id: 99 };
        assert!(resolver.resolve(&spec).is_empty());
        let spec = ApproverSpec::OrgLevel { level: LegacyKind::Directorate, unit_id: 7 };
        assert_eq!(resolver.resolve(&spec), ids(&["p"]));
    }
}
