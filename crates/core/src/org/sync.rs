use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::org::{DisplayNames, LegacyAssignment, LegacyKey, LegacyOrgEntity, OrgNodeType};
use crate::domain::principal::PrincipalId;

/// Everything the projection reads from the legacy tables.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LegacyOrgSnapshot {
    pub entities: Vec<LegacyOrgEntity>,
    pub assignments: Vec<LegacyAssignment>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedNode {
    pub key: LegacyKey,
    pub parent: Option<LegacyKey>,
    pub type_code: String,
    pub names: DisplayNames,
    pub code: Option<String>,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedAssignment {
    pub principal_id: PrincipalId,
    pub unit: LegacyKey,
    pub title: Option<String>,
    pub is_primary: bool,
}

/// Ordered upserts for one sync pass. Nodes are listed parents first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProjectionPlan {
    pub types_to_create: Vec<OrgNodeType>,
    pub nodes: Vec<PlannedNode>,
    pub assignments: Vec<PlannedAssignment>,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub types_created: usize,
    pub assignments_upserted: usize,
    pub warnings: Vec<String>,
}

impl ProjectionPlan {
    /// Report the plan would produce against the given already-projected
    /// legacy keys, without applying anything.
    pub fn preview(&self, projected: &BTreeSet<LegacyKey>) -> SyncReport {
        let nodes_updated = self.nodes.iter().filter(|node| projected.contains(&node.key)).count();
        SyncReport {
            nodes_created: self.nodes.len() - nodes_updated,
            nodes_updated,
            types_created: self.types_to_create.len(),
            assignments_upserted: self.assignments.len(),
            warnings: self.warnings.clone(),
        }
    }
}

/// Builds the projection of `snapshot` onto org nodes.
///
/// When `existing_types` is empty the default type set is seeded. Otherwise
/// a missing type is created with the fallback rank.
pub fn plan_projection(
    snapshot: &LegacyOrgSnapshot,
    existing_types: &[OrgNodeType],
) -> ProjectionPlan {
    let entities: BTreeMap<LegacyKey, &LegacyOrgEntity> =
        snapshot.entities.iter().map(|entity| (entity.key, entity)).collect();

    let mut types: BTreeMap<String, OrgNodeType> =
        existing_types.iter().map(|t| (t.code.clone(), t.clone())).collect();
    let mut types_to_create = Vec::new();
    if types.is_empty() {
        for node_type in OrgNodeType::defaults() {
            types.insert(node_type.code.clone(), node_type.clone());
            types_to_create.push(node_type);
        }
    }

    let mut plan = ProjectionPlan::default();

    // BTreeMap order is legacy kind order, so parents precede children.
    for (key, entity) in &entities {
        let type_code = key.kind.node_type_code();
        if !types.contains_key(type_code) {
            let created = OrgNodeType::fallback(type_code);
            types.insert(type_code.to_string(), created.clone());
            types_to_create.push(created);
        }

        let parent = entity
            .parent_candidates()
            .into_iter()
            .find(|candidate| entities.contains_key(candidate));

        if let Some(parent) = parent {
            let parent_code = parent.kind.node_type_code();
            let allowed = types.get(type_code).is_some_and(|t| t.allows_parent(parent_code));
            if !allowed {
                plan.warnings.push(format!(
                    "{key} is placed under {parent} but {type_code} does not allow {parent_code} parents"
                ));
            }
        }

        plan.nodes.push(PlannedNode {
            key: *key,
            parent,
            type_code: type_code.to_string(),
            names: entity.names.clone(),
            code: entity.code.clone(),
            active: entity.active,
        });
    }

    plan.assignments = plan_assignments(&snapshot.assignments, &entities, &mut plan.warnings);
    plan.types_to_create = types_to_create;
    plan
}

/// Drops assignments to unknown units and leaves every principal with
/// exactly one primary assignment.
fn plan_assignments(
    assignments: &[LegacyAssignment],
    entities: &BTreeMap<LegacyKey, &LegacyOrgEntity>,
    warnings: &mut Vec<String>,
) -> Vec<PlannedAssignment> {
    let mut by_principal: BTreeMap<PrincipalId, BTreeMap<LegacyKey, PlannedAssignment>> =
        BTreeMap::new();

    for assignment in assignments {
        if !entities.contains_key(&assignment.unit) {
            warnings.push(format!(
                "assignment of {} to {} skipped: unit does not exist",
                assignment.principal_id, assignment.unit
            ));
            continue;
        }

        let slot = by_principal.entry(assignment.principal_id.clone()).or_default();
        let planned = slot.entry(assignment.unit).or_insert_with(|| PlannedAssignment {
            principal_id: assignment.principal_id.clone(),
            unit: assignment.unit,
            title: None,
            is_primary: false,
        });
        if assignment.title.is_some() {
            planned.title = assignment.title.clone();
        }
        planned.is_primary |= assignment.is_primary;
    }

    let mut planned = Vec::new();
    for (_, units) in by_principal {
        let mut units: Vec<PlannedAssignment> = units.into_values().collect();
        let primary = units.iter().position(|unit| unit.is_primary).unwrap_or(0);
        for (index, unit) in units.iter_mut().enumerate() {
            unit.is_primary = index == primary;
        }
        planned.extend(units);
    }
    planned
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use super::{plan_projection, LegacyOrgSnapshot, ProjectionPlan, SyncReport};
    use crate::domain::org::{
        DisplayNames, LegacyAssignment, LegacyKey, LegacyKind, LegacyOrgEntity, LegacyParents,
        OrgNodeType,
    };
    use crate::domain::principal::PrincipalId;

    fn entity(kind: LegacyKind, id: i64, parents: LegacyParents) -> LegacyOrgEntity {
        LegacyOrgEntity {
            key: LegacyKey::new(kind, id),
            names: DisplayNames::new(format!("{} {id}", kind.as_str())),
            code: Some(format!("{}-{id}", &kind.as_str()[..3])),
            active: true,
            parents,
        }
    }

    fn snapshot() -> LegacyOrgSnapshot {
        LegacyOrgSnapshot {
            entities: vec![
                entity(
                    LegacyKind::Section,
                    30,
                    LegacyParents {
                        department_id: Some(99),
                        unit_id: Some(10),
                        directorate_id: Some(2),
                        ..LegacyParents::default()
                    },
                ),
                entity(
                    LegacyKind::Directorate,
                    2,
                    LegacyParents { organization_id: Some(1), ..LegacyParents::default() },
                ),
                entity(LegacyKind::Organization, 1, LegacyParents::default()),
                entity(
                    LegacyKind::Unit,
                    10,
                    LegacyParents { directorate_id: Some(2), ..LegacyParents::default() },
                ),
                entity(
                    LegacyKind::Department,
                    20,
                    LegacyParents { directorate_id: Some(2), ..LegacyParents::default() },
                ),
                entity(
                    LegacyKind::Team,
                    50,
                    LegacyParents { section_id: Some(30), ..LegacyParents::default() },
                ),
            ],
            assignments: vec![
                LegacyAssignment {
                    principal_id: PrincipalId::new("u-1"),
                    unit: LegacyKey::new(LegacyKind::Section, 30),
                    title: Some("Clerk".to_string()),
                    is_primary: false,
                },
                LegacyAssignment {
                    principal_id: PrincipalId::new("u-1"),
                    unit: LegacyKey::new(LegacyKind::Department, 20),
                    title: None,
                    is_primary: false,
                },
                LegacyAssignment {
                    principal_id: PrincipalId::new("u-2"),
                    unit: LegacyKey::new(LegacyKind::Unit, 10),
                    title: None,
                    is_primary: true,
                },
                LegacyAssignment {
                    principal_id: PrincipalId::new("u-2"),
                    unit: LegacyKey::new(LegacyKind::Section, 30),
                    title: None,
                    is_primary: true,
                },
                LegacyAssignment {
                    principal_id: PrincipalId::new("u-3"),
                    unit: LegacyKey::new(LegacyKind::Division, 404),
                    title: None,
                    is_primary: true,
                },
            ],
        }
    }

    /// Minimal projector mirroring the repository's upsert semantics.
    #[derive(Default)]
    struct InMemoryProjection {
        types: BTreeSet<String>,
        nodes: BTreeMap<LegacyKey, (Option<LegacyKey>, String)>,
        assignments: BTreeMap<(PrincipalId, LegacyKey), bool>,
    }

    impl InMemoryProjection {
        fn existing_types(&self) -> Vec<OrgNodeType> {
            self.types.iter().map(|code| OrgNodeType::fallback(code)).collect()
        }

        fn apply(&mut self, plan: &ProjectionPlan) -> SyncReport {
            let report = plan.preview(&self.nodes.keys().copied().collect());
            for node_type in &plan.types_to_create {
                self.types.insert(node_type.code.clone());
            }
            for node in &plan.nodes {
                self.nodes.insert(node.key, (node.parent, node.names.local.clone()));
            }
            for assignment in &plan.assignments {
                self.assignments.insert(
                    (assignment.principal_id.clone(), assignment.unit),
                    assignment.is_primary,
                );
            }
            report
        }
    }

    #[test]
    fn parents_are_planned_before_children_with_precedence() {
        let plan = plan_projection(&snapshot(), &[]);

        let order: Vec<LegacyKind> = plan.nodes.iter().map(|node| node.key.kind).collect();
        assert_eq!(
            order,
            vec![
                LegacyKind::Organization,
                LegacyKind::Directorate,
                LegacyKind::Unit,
                LegacyKind::Department,
                LegacyKind::Section,
                LegacyKind::Team,
            ]
        );

        let parent_of = |kind: LegacyKind| {
            plan.nodes.iter().find(|node| node.key.kind == kind).and_then(|node| node.parent)
        };
        assert_eq!(
            parent_of(LegacyKind::Department),
            Some(LegacyKey::new(LegacyKind::Directorate, 2))
        );
        // Department 99 does not exist, so the unit wins over the directorate.
        assert_eq!(parent_of(LegacyKind::Section), Some(LegacyKey::new(LegacyKind::Unit, 10)));
        assert_eq!(parent_of(LegacyKind::Team), Some(LegacyKey::new(LegacyKind::Section, 30)));
        assert_eq!(parent_of(LegacyKind::Organization), None);
    }

    #[test]
    fn default_types_are_seeded_only_on_first_pass() {
        let plan = plan_projection(&snapshot(), &[]);
        assert_eq!(plan.types_to_create.len(), 7);
        assert!(plan.warnings.iter().all(|warning| !warning.contains("does not allow")));

        let existing: Vec<OrgNodeType> = OrgNodeType::defaults()
            .into_iter()
            .filter(|node_type| node_type.code != "TEAM")
            .collect();
        let plan = plan_projection(&snapshot(), &existing);
        assert_eq!(plan.types_to_create.len(), 1);
        assert_eq!(plan.types_to_create[0].code, "TEAM");
        assert_eq!(plan.types_to_create[0].sort_rank, OrgNodeType::FALLBACK_RANK);
    }

    #[test]
    fn each_principal_ends_with_exactly_one_primary() {
        let plan = plan_projection(&snapshot(), &[]);

        let primaries = |who: &str| {
            plan.assignments
                .iter()
                .filter(|a| a.principal_id.0 == who && a.is_primary)
                .map(|a| a.unit)
                .collect::<Vec<_>>()
        };
        assert_eq!(primaries("u-1"), vec![LegacyKey::new(LegacyKind::Department, 20)]);
        assert_eq!(primaries("u-2"), vec![LegacyKey::new(LegacyKind::Unit, 10)]);
        assert!(primaries("u-3").is_empty());
        assert!(plan.warnings.iter().any(|warning| warning.contains("DIVISION#404")));
    }

    #[test]
    fn second_pass_creates_nothing() {
        let mut store = InMemoryProjection::default();

        let first = store.apply(&plan_projection(&snapshot(), &store.existing_types()));
        assert_eq!(first.nodes_created, 6);
        assert_eq!(first.types_created, 7);

        let rows_after_first = (store.nodes.len(), store.assignments.len(), store.types.len());
        let second = store.apply(&plan_projection(&snapshot(), &store.existing_types()));

        assert_eq!(second.nodes_created, 0);
        assert_eq!(second.nodes_updated, 6);
        assert_eq!(second.types_created, 0);
        assert_eq!(
            (store.nodes.len(), store.assignments.len(), store.types.len()),
            rows_after_first
        );
    }

    #[test]
    fn altered_type_rules_produce_parent_warnings() {
        let mut types = OrgNodeType::defaults();
        for node_type in &mut types {
            if node_type.code == "SECTION" {
                node_type.allowed_parent_codes.remove("UNIT");
            }
        }

        let plan = plan_projection(&snapshot(), &types);
        assert_eq!(
            plan.warnings.iter().filter(|warning| warning.contains("does not allow")).count(),
            1
        );
    }
}
