use std::collections::BTreeSet;

use thiserror::Error;

use crate::approvals::Directory;
use crate::domain::committee::{CommitteeId, CommitteeMemberRole};
use crate::domain::template::{
    ApproverFields, ApproverSpec, CommitteeDeliveryMode, ExecutionMode, StepTemplate,
    WorkflowTemplate, MAX_SLA_DAYS,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("approver kind {kind} requires its reference field to be set")]
    MissingReference { kind: &'static str },
    #[error("approver kind {kind} has several reference fields set: {populated:?}")]
    MultipleReferences { kind: &'static str, populated: Vec<&'static str> },
    #[error("approver kind {kind} has the {populated} reference set instead of its own")]
    ReferenceKindMismatch { kind: &'static str, populated: &'static str },
    #[error("committee {committee_id} does not exist")]
    UnknownCommittee { committee_id: CommitteeId },
    #[error("committee {committee_id} has no active {role}")]
    MissingCommitteeOfficer { committee_id: CommitteeId, role: &'static str },
    #[error("template name must not be blank")]
    BlankTemplateName,
    #[error("step order must be at least 1")]
    InvalidStepOrder,
    #[error("step order {step_order} appears more than once")]
    DuplicateStepOrder { step_order: u32 },
    #[error("SLA of {sla_days} days is outside 1..={max}")]
    SlaOutOfRange { sla_days: u32, max: u32 },
    #[error("step {step_order} is SEQUENTIAL and cannot carry co-assignees")]
    CoAssigneesOnSequentialStep { step_order: u32 },
    #[error("step {step_order}: {reason}")]
    Step { step_order: u32, reason: Box<ValidationError> },
    #[error("step {step_order} co-assignee {position}: {reason}")]
    CoAssignee { step_order: u32, position: usize, reason: Box<ValidationError> },
    #[error("template {template_id} has instances; only its name and active flag may change")]
    TemplateInUse { template_id: String },
}

impl ValidationError {
    /// Innermost error, without step or co-assignee context.
    pub fn root(&self) -> &ValidationError {
        match self {
            Self::Step { reason, .. } | Self::CoAssignee { reason, .. } => reason.root(),
            other => other,
        }
    }
}

/// Save-time checks for templates and their approver specs.
pub struct TemplateValidator<'a, D: Directory + ?Sized> {
    directory: &'a D,
}

impl<'a, D: Directory + ?Sized> TemplateValidator<'a, D> {
    pub fn new(directory: &'a D) -> Self {
        Self { directory }
    }

    pub fn validate_approver(
        &self,
        fields: &ApproverFields,
    ) -> Result<ApproverSpec, ValidationError> {
        let spec = ApproverSpec::from_fields(fields)?;

        if let ApproverSpec::Committee { committee_id, delivery } = &spec {
            let committee = self
                .directory
                .committee(*committee_id)
                .ok_or(ValidationError::UnknownCommittee { committee_id: *committee_id })?;

            let officer = match delivery {
                CommitteeDeliveryMode::All => None,
                CommitteeDeliveryMode::Chair => Some(CommitteeMemberRole::Chair),
                CommitteeDeliveryMode::Secretary => Some(CommitteeMemberRole::Secretary),
            };
            if let Some(role) = officer {
                if !committee.has_active_officer(role) {
                    return Err(ValidationError::MissingCommitteeOfficer {
                        committee_id: *committee_id,
                        role: role.as_str(),
                    });
                }
            }
        }

        Ok(spec)
    }

    pub fn validate_step(&self, step: &StepTemplate) -> Result<(), ValidationError> {
        let step_order = step.step_order;
        if step_order == 0 {
            return Err(ValidationError::InvalidStepOrder);
        }

        self.validate_approver(&step.approver)
            .and_then(|_| step.sla_days.map_or(Ok(()), check_sla_days))
            .map_err(|reason| ValidationError::Step { step_order, reason: Box::new(reason) })?;

        if step.mode == ExecutionMode::Sequential && !step.co_assignees.is_empty() {
            return Err(ValidationError::CoAssigneesOnSequentialStep { step_order });
        }

        for (index, assignee) in step.co_assignees.iter().enumerate() {
            self.validate_approver(&assignee.approver).map_err(|reason| {
                ValidationError::CoAssignee {
                    step_order,
                    position: index + 1,
                    reason: Box::new(reason),
                }
            })?;
        }

        Ok(())
    }

    pub fn validate_template(&self, template: &WorkflowTemplate) -> Result<(), ValidationError> {
        if template.name.trim().is_empty() {
            return Err(ValidationError::BlankTemplateName);
        }
        if let Some(sla_days) = template.sla_days_default {
            check_sla_days(sla_days)?;
        }

        let mut seen = BTreeSet::new();
        for step in &template.steps {
            if !seen.insert(step.step_order) {
                return Err(ValidationError::DuplicateStepOrder { step_order: step.step_order });
            }
        }

        template.steps.iter().try_for_each(|step| self.validate_step(step))
    }
}

fn check_sla_days(sla_days: u32) -> Result<(), ValidationError> {
    if (1..=MAX_SLA_DAYS).contains(&sla_days) {
        Ok(())
    } else {
        Err(ValidationError::SlaOutOfRange { sla_days, max: MAX_SLA_DAYS })
    }
}

/// Rejects a structural change to a template that already has instances.
pub fn check_structural_edit(
    stored: &WorkflowTemplate,
    updated: &WorkflowTemplate,
    instance_count: u64,
) -> Result<(), ValidationError> {
    let structural_change =
        stored.steps != updated.steps || stored.sla_days_default != updated.sla_days_default;
    if instance_count > 0 && structural_change {
        return Err(ValidationError::TemplateInUse { template_id: stored.id.0.clone() });
    }
    Ok(())
}
