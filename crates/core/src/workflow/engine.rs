use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::approvals::{ApproverResolver, Directory, StepResolution};
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use crate::delegation::ActingIdentity;
use crate::domain::instance::{
    Decision, InstanceId, InstanceStep, InstanceStepId, StepParticipant, StepStatus,
    WorkflowInstance,
};
use crate::domain::principal::PrincipalId;
use crate::domain::request::{RequestStatus, WorkflowRequest};
use crate::domain::template::{ApproverSpec, ExecutionMode, StepTemplate, WorkflowTemplate};
use crate::notify::{NotificationKind, NotificationRequest, NotificationSink};
use crate::workflow::states::{
    DecisionCommand, EngineOutcome, ParallelDecisionPolicy, RequestUpdate, WorkflowError,
};

const ENGINE_ACTOR: &str = "workflow-engine";

pub struct EngineContext<'a> {
    pub now: DateTime<Utc>,
    pub correlation_id: &'a str,
    pub audit: &'a dyn AuditSink,
    pub notifications: &'a dyn NotificationSink,
}

impl EngineContext<'_> {
    fn emit(&self, event: AuditEvent) {
        self.audit.emit(event.at(self.now));
    }

    fn notify(&self, recipient: &PrincipalId, kind: NotificationKind, request: &WorkflowRequest, subject: String) {
        self.notifications.enqueue(NotificationRequest::new(
            recipient.clone(),
            kind,
            request.id.clone(),
            subject,
            self.now,
        ));
    }
}

struct StepDraft {
    step_order: u32,
    mode: ExecutionMode,
    approver: ApproverSpec,
    co_assignees: Vec<ApproverSpec>,
    due_at: DateTime<Utc>,
    notify_kind: NotificationKind,
}

/// Drives workflow instances. Every call works on a snapshot and returns
/// the new snapshot; nothing is persisted here.
#[derive(Clone, Debug)]
pub struct InstanceEngine {
    policy: ParallelDecisionPolicy,
    default_sla_days: u32,
}

impl Default for InstanceEngine {
    fn default() -> Self {
        Self::new(ParallelDecisionPolicy::default(), Self::DEFAULT_SLA_DAYS)
    }
}

impl InstanceEngine {
    pub const DEFAULT_SLA_DAYS: u32 = 3;

    pub fn new(policy: ParallelDecisionPolicy, default_sla_days: u32) -> Self {
        Self { policy, default_sla_days }
    }

    pub fn policy(&self) -> ParallelDecisionPolicy {
        self.policy
    }

    pub fn start<D: Directory + ?Sized>(
        &self,
        instance_id: InstanceId,
        request: &WorkflowRequest,
        template: &WorkflowTemplate,
        actor: &PrincipalId,
        resolver: &ApproverResolver<'_, D>,
        ctx: &EngineContext<'_>,
    ) -> Result<EngineOutcome, WorkflowError> {
        if !template.active {
            return Err(WorkflowError::TemplateInactive(template.id.clone()));
        }
        let first = template
            .first_step()
            .ok_or_else(|| WorkflowError::TemplateHasNoSteps(template.id.clone()))?;
        let draft = self.draft(template, first, NotificationKind::ActionRequired, ctx.now)?;

        let mut instance = WorkflowInstance {
            id: instance_id,
            request_id: request.id.clone(),
            template_id: template.id.clone(),
            current_step_order: None,
            completed: false,
            outcome: None,
            started_at: ctx.now,
            completed_at: None,
            steps: Vec::new(),
        };

        ctx.emit(
            AuditEvent::new(
                Some(request.id.clone()),
                ctx.correlation_id,
                "workflow.instance_started",
                AuditCategory::Workflow,
                actor.0.clone(),
                AuditOutcome::Success,
            )
            .with_transition(request.status.as_str(), RequestStatus::InProgress.as_str())
            .with_metadata("instance_id", instance.id.0.clone())
            .with_metadata("template_id", template.id.0.clone()),
        );

        self.open_step(&mut instance, request, draft, resolver, ctx);
        Ok(EngineOutcome { request: Some(in_progress(&instance)), instance })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn decide<D: Directory + ?Sized>(
        &self,
        instance: &WorkflowInstance,
        request: &WorkflowRequest,
        template: &WorkflowTemplate,
        command: &DecisionCommand,
        acting: &ActingIdentity,
        resolver: &ApproverResolver<'_, D>,
        ctx: &EngineContext<'_>,
    ) -> Result<EngineOutcome, WorkflowError> {
        if instance.completed {
            return Err(WorkflowError::InstanceCompleted(instance.id.clone()));
        }
        let step = instance
            .step(&command.step_id)
            .ok_or_else(|| WorkflowError::StepNotFound(command.step_id.clone()))?;
        let is_current = instance.current_step().is_some_and(|current| current.id == step.id);
        if step.status != StepStatus::Pending || !is_current {
            return Err(WorkflowError::ConcurrencyConflict {
                step_id: step.id.clone(),
                status: step.status,
            });
        }

        let slot = participant_slot(step, acting)?;
        let mut next = instance.clone();
        let Some(step) = next.step_mut(&command.step_id) else {
            return Err(WorkflowError::StepNotFound(command.step_id.clone()));
        };

        if let Some(principal_id) = &slot {
            if let Some(participant) =
                step.participants.iter_mut().find(|p| &p.principal_id == principal_id)
            {
                participant.decision = Some(command.decision);
                participant.decided_by = Some(acting.actor.id.clone());
                participant.note = command.note.clone();
                participant.decided_at = Some(ctx.now);
            }
        }

        let aggregate = match step.mode {
            ExecutionMode::Sequential => Some(command.decision),
            ExecutionMode::ParallelSync => {
                let decisions: Vec<Option<Decision>> =
                    step.participants.iter().map(|p| p.decision).collect();
                self.policy.aggregate(&decisions)
            }
        };
        let step_order = step.step_order;
        let mode = step.mode;
        let outstanding = step.outstanding_count();

        if aggregate.is_some() {
            step.status = aggregate.map(|d| d.step_status()).unwrap_or(StepStatus::Pending);
            step.decided_by = Some(acting.actor.id.clone());
            step.decision_note = command.note.clone();
            step.decided_at = Some(ctx.now);
        }

        // Resolve the follow-up step before emitting anything so a broken
        // template leaves no trace of a half-applied decision.
        let follow_up = match aggregate {
            Some(Decision::Approved) => template
                .next_step_after(step_order)
                .map(|next_step| {
                    self.draft(template, next_step, NotificationKind::ActionRequired, ctx.now)
                })
                .transpose()?,
            _ => None,
        };

        if mode == ExecutionMode::ParallelSync {
            let principal = slot.as_ref().map(|id| id.0.clone()).unwrap_or_default();
            let mut event = AuditEvent::new(
                Some(request.id.clone()),
                ctx.correlation_id,
                "workflow.participant_decided",
                AuditCategory::Workflow,
                acting.actor.id.0.clone(),
                AuditOutcome::Success,
            )
            .with_transition(StepStatus::Pending.as_str(), command.decision.as_str())
            .with_metadata("step_id", command.step_id.0.clone())
            .with_metadata("participant", principal)
            .with_metadata("outstanding", outstanding.to_string());
            if let Some(note) = &command.note {
                event = event.with_note(note.clone());
            }
            ctx.emit(event);
        }

        let Some(decision) = aggregate else {
            return Ok(EngineOutcome { instance: next, request: None });
        };

        let mut event = AuditEvent::new(
            Some(request.id.clone()),
            ctx.correlation_id,
            "workflow.step_decided",
            AuditCategory::Workflow,
            acting.actor.id.0.clone(),
            AuditOutcome::Success,
        )
        .with_transition(StepStatus::Pending.as_str(), decision.step_status().as_str())
        .with_metadata("step_id", command.step_id.0.clone())
        .with_metadata("step_order", step_order.to_string())
        .with_metadata("mode", mode.as_str());
        if acting.is_delegated() {
            event = event.with_metadata("on_behalf_of", acting.effective.id.0.clone());
        }
        if slot.is_none() {
            event = event.with_metadata("privileged_override", "true");
        }
        if mode == ExecutionMode::Sequential {
            if let Some(note) = &command.note {
                event = event.with_note(note.clone());
            }
        }
        ctx.emit(event);

        match (decision, follow_up) {
            (Decision::Approved, Some(draft)) => {
                ctx.notify(
                    &request.requester_id,
                    NotificationKind::StepApproved,
                    request,
                    format!("{}: step {step_order} approved", request.title),
                );
                self.open_step(&mut next, request, draft, resolver, ctx);
                Ok(EngineOutcome { request: Some(in_progress(&next)), instance: next })
            }
            (decision, _) => Ok(self.complete(next, request, decision, &acting.actor.id, ctx)),
        }
    }

    /// `None` when there is no pending step to escalate.
    pub fn escalate_current_step<D: Directory + ?Sized>(
        &self,
        instance: &WorkflowInstance,
        request: &WorkflowRequest,
        template: &WorkflowTemplate,
        escalated_role: &str,
        resolver: &ApproverResolver<'_, D>,
        ctx: &EngineContext<'_>,
    ) -> Result<Option<WorkflowInstance>, WorkflowError> {
        if instance.completed {
            return Ok(None);
        }
        let Some(current) = instance.current_step() else {
            return Ok(None);
        };
        let step_order = current.step_order;
        let step_id = current.id.clone();

        let sla_days = template
            .step(step_order)
            .map(|step| template.sla_days_for(step, self.default_sla_days))
            .unwrap_or(self.default_sla_days);
        let draft = StepDraft {
            step_order,
            mode: ExecutionMode::Sequential,
            approver: ApproverSpec::role(escalated_role),
            co_assignees: Vec::new(),
            due_at: due_at(ctx.now, step_order, sla_days)?,
            notify_kind: NotificationKind::Escalated,
        };

        let mut next = instance.clone();
        let Some(step) = next.step_mut(&step_id) else {
            return Ok(None);
        };
        step.status = StepStatus::Escalated;
        step.decided_at = Some(ctx.now);
        step.decision_note = Some(format!("Escalated to {escalated_role}"));

        ctx.emit(
            AuditEvent::new(
                Some(request.id.clone()),
                ctx.correlation_id,
                "workflow.step_escalated",
                AuditCategory::Escalation,
                ENGINE_ACTOR,
                AuditOutcome::Success,
            )
            .with_transition(StepStatus::Pending.as_str(), StepStatus::Escalated.as_str())
            .with_metadata("step_id", step_id.0.clone())
            .with_metadata("escalated_role", escalated_role),
        );

        self.open_step(&mut next, request, draft, resolver, ctx);
        Ok(Some(next))
    }

    fn draft(
        &self,
        template: &WorkflowTemplate,
        step: &StepTemplate,
        notify_kind: NotificationKind,
        now: DateTime<Utc>,
    ) -> Result<StepDraft, WorkflowError> {
        let step_order = step.step_order;
        let invalid = move |reason| WorkflowError::InvalidTemplateStep { step_order, reason };

        let approver = ApproverSpec::from_fields(&step.approver).map_err(invalid)?;
        let co_assignees = match step.mode {
            ExecutionMode::Sequential => Vec::new(),
            ExecutionMode::ParallelSync => step
                .co_assignees
                .iter()
                .map(|assignee| ApproverSpec::from_fields(&assignee.approver))
                .collect::<Result<Vec<_>, _>>()
                .map_err(invalid)?,
        };

        Ok(StepDraft {
            step_order,
            mode: step.mode,
            approver,
            co_assignees,
            due_at: due_at(now, step_order, template.sla_days_for(step, self.default_sla_days))?,
            notify_kind,
        })
    }

    fn open_step<D: Directory + ?Sized>(
        &self,
        instance: &mut WorkflowInstance,
        request: &WorkflowRequest,
        draft: StepDraft,
        resolver: &ApproverResolver<'_, D>,
        ctx: &EngineContext<'_>,
    ) {
        let resolution = resolver.resolve_step(&draft.approver, &draft.co_assignees);
        let participants: Vec<StepParticipant> =
            resolution.principals().into_iter().map(StepParticipant::outstanding).collect();
        let due_at = draft.due_at;

        let step = InstanceStep {
            id: InstanceStepId(Uuid::new_v4().to_string()),
            step_order: draft.step_order,
            mode: draft.mode,
            resolved_role: draft.approver.role_hint().map(str::to_string),
            approver: draft.approver,
            status: StepStatus::Pending,
            participants,
            started_at: ctx.now,
            due_at,
            decided_by: None,
            decision_note: None,
            decided_at: None,
        };

        let (event_type, outcome) = match resolution {
            StepResolution::Resolved(_) => ("workflow.step_opened", AuditOutcome::Success),
            StepResolution::Unresolvable => ("workflow.step_unresolvable", AuditOutcome::Flagged),
        };
        let mut event = AuditEvent::new(
            Some(request.id.clone()),
            ctx.correlation_id,
            event_type,
            AuditCategory::Workflow,
            ENGINE_ACTOR,
            outcome,
        )
        .with_transition("NOT_STARTED", StepStatus::Pending.as_str())
        .with_metadata("step_id", step.id.0.clone())
        .with_metadata("step_order", step.step_order.to_string())
        .with_metadata("approver", step.approver.to_string())
        .with_metadata("participants", step.participants.len().to_string())
        .with_metadata("due_at", due_at.to_rfc3339());
        if step.is_unresolvable() {
            event = event.with_note("no resolvable approver");
        }
        ctx.emit(event);

        for participant in &step.participants {
            ctx.notify(
                &participant.principal_id,
                draft.notify_kind,
                request,
                format!("{}: step {} awaits your decision", request.title, step.step_order),
            );
        }

        instance.current_step_order = Some(step.step_order);
        instance.steps.push(step);
    }

    fn complete(
        &self,
        mut instance: WorkflowInstance,
        request: &WorkflowRequest,
        outcome: Decision,
        actor: &PrincipalId,
        ctx: &EngineContext<'_>,
    ) -> EngineOutcome {
        instance.completed = true;
        instance.outcome = Some(outcome);
        instance.completed_at = Some(ctx.now);

        let (status, kind) = match outcome {
            Decision::Approved => (RequestStatus::Approved, NotificationKind::RequestApproved),
            Decision::Rejected => (RequestStatus::Rejected, NotificationKind::RequestRejected),
        };

        ctx.emit(
            AuditEvent::new(
                Some(request.id.clone()),
                ctx.correlation_id,
                "workflow.instance_completed",
                AuditCategory::Workflow,
                actor.0.clone(),
                AuditOutcome::Success,
            )
            .with_transition(request.status.as_str(), status.as_str())
            .with_metadata("instance_id", instance.id.0.clone()),
        );
        ctx.notify(
            &request.requester_id,
            kind,
            request,
            format!("{}: {}", request.title, status.as_str().to_lowercase()),
        );

        EngineOutcome {
            instance,
            request: Some(RequestUpdate {
                status,
                current_role: None,
                current_step_started_at: None,
            }),
        }
    }
}

fn in_progress(instance: &WorkflowInstance) -> RequestUpdate {
    let current = instance.current_step();
    RequestUpdate {
        status: RequestStatus::InProgress,
        current_role: current.and_then(|step| step.resolved_role.clone()),
        current_step_started_at: current.map(|step| step.started_at),
    }
}

fn due_at(
    now: DateTime<Utc>,
    step_order: u32,
    sla_days: u32,
) -> Result<DateTime<Utc>, WorkflowError> {
    Duration::try_days(i64::from(sla_days))
        .and_then(|sla| now.checked_add_signed(sla))
        .ok_or(WorkflowError::DueDateOutOfRange { step_order, sla_days })
}

// Real actor first, then the delegator. `None` is a privileged override.
fn participant_slot(
    step: &InstanceStep,
    acting: &ActingIdentity,
) -> Result<Option<PrincipalId>, WorkflowError> {
    let mut already_decided = None;
    for principal_id in acting.principal_ids() {
        match step.participant(principal_id) {
            Some(participant) if participant.decision.is_none() => {
                return Ok(Some(principal_id.clone()));
            }
            Some(_) => already_decided = Some(principal_id.clone()),
            None => {}
        }
    }

    if let Some(principal_id) = already_decided {
        return Err(WorkflowError::AlreadyDecided { step_id: step.id.clone(), principal_id });
    }
    if step.mode == ExecutionMode::Sequential && acting.privileged {
        return Ok(None);
    }
    Err(WorkflowError::NotAuthorized { step_id: step.id.clone(), actor: acting.actor.id.clone() })
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use super::{EngineContext, InstanceEngine};
    use crate::approvals::fixtures::{directory, principal};
    use crate::approvals::{ApproverResolver, Directory, InMemoryDirectory};
    use crate::audit::{AuditOutcome, InMemoryAuditSink};
    use crate::delegation::ActingIdentity;
    use crate::domain::committee::CommitteeId;
    use crate::domain::delegation::DelegationId;
    use crate::domain::instance::{
        Decision, InstanceId, InstanceStepId, StepStatus, WorkflowInstance,
    };
    use crate::domain::principal::{Principal, PrincipalId};
    use crate::domain::request::{RequestId, RequestStatus, WorkflowRequest};
    use crate::domain::template::{
        ApproverFields, ApproverKind, ApproverSpec, CommitteeDeliveryMode, ExecutionMode,
        StepTemplate, StepTemplateId, TemplateId, WorkflowTemplate,
    };
    use crate::notify::{InMemoryNotificationSink, NotificationKind};
    use crate::workflow::states::{
        DecisionCommand, EngineOutcome, ParallelDecisionPolicy, WorkflowError,
    };

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap() + Duration::days(n)
    }

    struct Harness {
        directory: InMemoryDirectory,
        audit: InMemoryAuditSink,
        notifications: InMemoryNotificationSink,
        engine: InstanceEngine,
        template: WorkflowTemplate,
        request: WorkflowRequest,
    }

    impl Harness {
        fn new(policy: ParallelDecisionPolicy) -> Self {
            Self {
                directory: directory().with_principal(principal("requester", "staff")),
                audit: InMemoryAuditSink::default(),
                notifications: InMemoryNotificationSink::default(),
                engine: InstanceEngine::new(policy, 3),
                template: budget_template(),
                request: WorkflowRequest {
                    id: RequestId("req-1".to_string()),
                    requester_id: PrincipalId::new("requester"),
                    title: "Laptop purchase".to_string(),
                    status: RequestStatus::Pending,
                    current_role: None,
                    is_escalated: false,
                    escalated_at: None,
                    created_at: day(0),
                    current_step_started_at: None,
                },
            }
        }

        fn ctx(&self, now: DateTime<Utc>) -> EngineContext<'_> {
            EngineContext {
                now,
                correlation_id: "corr-test",
                audit: &self.audit,
                notifications: &self.notifications,
            }
        }

        fn start(&mut self) -> WorkflowInstance {
            let resolver = ApproverResolver::new(&self.directory);
            let outcome = self
                .engine
                .start(
                    InstanceId("inst-1".to_string()),
                    &self.request,
                    &self.template,
                    &PrincipalId::new("requester"),
                    &resolver,
                    &self.ctx(day(0)),
                )
                .expect("start");
            self.apply(&outcome);
            outcome.instance
        }

        fn decide(
            &mut self,
            instance: &WorkflowInstance,
            who: &str,
            decision: Decision,
            now: DateTime<Utc>,
        ) -> Result<EngineOutcome, WorkflowError> {
            let acting = self.acting(who, false);
            self.decide_as(instance, &acting, decision, now)
        }

        fn decide_as(
            &mut self,
            instance: &WorkflowInstance,
            acting: &ActingIdentity,
            decision: Decision,
            now: DateTime<Utc>,
        ) -> Result<EngineOutcome, WorkflowError> {
            let step_id = current_step_id(instance);
            let resolver = ApproverResolver::new(&self.directory);
            let outcome = self.engine.decide(
                instance,
                &self.request,
                &self.template,
                &DecisionCommand { step_id, decision, note: None },
                acting,
                &resolver,
                &self.ctx(now),
            )?;
            self.apply(&outcome);
            Ok(outcome)
        }

        fn apply(&mut self, outcome: &EngineOutcome) {
            if let Some(update) = &outcome.request {
                self.request.status = update.status;
                self.request.current_role = update.current_role.clone();
                self.request.current_step_started_at = update.current_step_started_at;
            }
        }

        fn acting(&self, who: &str, privileged: bool) -> ActingIdentity {
            let actor = self
                .directory
                .principals()
                .iter()
                .find(|p| p.id.0 == who)
                .cloned()
                .unwrap_or_else(|| principal(who, "staff"));
            ActingIdentity { effective: actor.clone(), actor, delegation_id: None, privileged }
        }

        fn event_types(&self) -> Vec<String> {
            self.audit.events().into_iter().map(|event| event.event_type).collect()
        }
    }

    fn current_step_id(instance: &WorkflowInstance) -> InstanceStepId {
        instance.current_step().map(|step| step.id.clone()).unwrap_or_else(|| {
            instance.steps.last().map(|step| step.id.clone()).expect("instance has steps")
        })
    }

    fn step(order: u32, mode: ExecutionMode, approver: ApproverSpec, sla: u32) -> StepTemplate {
        StepTemplate {
            id: StepTemplateId(format!("st-{order}")),
            step_order: order,
            mode,
            approver: approver.to_fields(),
            sla_days: Some(sla),
            co_assignees: Vec::new(),
        }
    }

    fn budget_template() -> WorkflowTemplate {
        WorkflowTemplate {
            id: TemplateId("tpl-budget".to_string()),
            name: "Budget approval".to_string(),
            sla_days_default: None,
            active: true,
            steps: vec![
                step(1, ExecutionMode::Sequential, ApproverSpec::role("dept_head"), 2),
                step(
                    2,
                    ExecutionMode::ParallelSync,
                    ApproverSpec::committee(CommitteeId(1), CommitteeDeliveryMode::All),
                    3,
                ),
            ],
        }
    }

    fn participant_ids(instance: &WorkflowInstance) -> Vec<String> {
        instance
            .current_step()
            .map(|step| step.participants.iter().map(|p| p.principal_id.0.clone()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn budget_request_completes_when_every_committee_member_approves() {
        let mut h = Harness::new(ParallelDecisionPolicy::AnyRejectWins);
        let instance = h.start();

        assert_eq!(h.request.status, RequestStatus::InProgress);
        assert_eq!(h.request.current_role.as_deref(), Some("dept_head"));
        let first = instance.current_step().expect("step 1");
        assert_eq!(first.due_at, day(2));
        assert_eq!(participant_ids(&instance), vec!["head"]);

        let instance = h.decide(&instance, "head", Decision::Approved, day(1)).expect("head").instance;
        let second = instance.current_step().expect("step 2");
        assert_eq!(second.step_order, 2);
        assert_eq!(second.due_at, day(4));
        assert_eq!(participant_ids(&instance), vec!["aud-1", "aud-2", "cm-chair", "cm-sec"]);
        assert_eq!(h.request.current_role, None);

        let mut instance = instance;
        for (who, at) in [("cm-chair", 2), ("aud-1", 2), ("aud-2", 3)] {
            let outcome = h.decide(&instance, who, Decision::Approved, day(at)).expect(who);
            assert!(outcome.request.is_none(), "{who} should not resolve the step");
            instance = outcome.instance;
        }
        let outcome = h.decide(&instance, "cm-sec", Decision::Approved, day(3)).expect("last");

        assert!(outcome.instance.completed);
        assert_eq!(outcome.instance.outcome, Some(Decision::Approved));
        assert_eq!(h.request.status, RequestStatus::Approved);
        assert_eq!(
            h.event_types(),
            vec![
                "workflow.instance_started",
                "workflow.step_opened",
                "workflow.step_decided",
                "workflow.step_opened",
                "workflow.participant_decided",
                "workflow.participant_decided",
                "workflow.participant_decided",
                "workflow.participant_decided",
                "workflow.step_decided",
                "workflow.instance_completed",
            ]
        );
        let requester_kinds: Vec<NotificationKind> = h
            .notifications
            .queued()
            .into_iter()
            .filter(|n| n.recipient.0 == "requester")
            .map(|n| n.kind)
            .collect();
        assert_eq!(
            requester_kinds,
            vec![NotificationKind::StepApproved, NotificationKind::RequestApproved]
        );
    }

    #[test]
    fn single_committee_rejection_finalizes_under_any_reject_wins() {
        let mut h = Harness::new(ParallelDecisionPolicy::AnyRejectWins);
        let instance = h.start();
        let instance = h.decide(&instance, "head", Decision::Approved, day(1)).expect("head").instance;

        let outcome = h.decide(&instance, "aud-2", Decision::Rejected, day(2)).expect("reject");

        assert!(outcome.instance.completed);
        assert_eq!(outcome.instance.outcome, Some(Decision::Rejected));
        assert_eq!(h.request.status, RequestStatus::Rejected);
        let step = outcome.instance.steps.last().expect("step 2");
        assert_eq!(step.status, StepStatus::Rejected);
        assert_eq!(step.outstanding_count(), 3);
    }

    #[test]
    fn require_all_waits_for_everyone_before_rejecting() {
        let mut h = Harness::new(ParallelDecisionPolicy::RequireAll);
        let instance = h.start();
        let mut instance =
            h.decide(&instance, "head", Decision::Approved, day(1)).expect("head").instance;

        let outcome = h.decide(&instance, "aud-1", Decision::Rejected, day(2)).expect("reject");
        assert!(outcome.request.is_none());
        assert!(!outcome.instance.completed);
        instance = outcome.instance;

        for who in ["aud-2", "cm-chair"] {
            instance = h.decide(&instance, who, Decision::Approved, day(2)).expect(who).instance;
        }
        let outcome = h.decide(&instance, "cm-sec", Decision::Approved, day(3)).expect("last");

        assert_eq!(outcome.instance.outcome, Some(Decision::Rejected));
        assert_eq!(h.request.status, RequestStatus::Rejected);
    }

    #[test]
    fn sequential_rejection_skips_later_steps() {
        let mut h = Harness::new(ParallelDecisionPolicy::AnyRejectWins);
        let instance = h.start();

        let outcome = h.decide(&instance, "head", Decision::Rejected, day(1)).expect("reject");

        assert!(outcome.instance.completed);
        assert_eq!(outcome.instance.steps.len(), 1);
        assert_eq!(h.request.status, RequestStatus::Rejected);
    }

    #[test]
    fn deciding_from_a_stale_snapshot_is_a_conflict() {
        let mut h = Harness::new(ParallelDecisionPolicy::AnyRejectWins);
        let stale = h.start();
        let step_id = current_step_id(&stale);
        let fresh = h.decide(&stale, "head", Decision::Approved, day(1)).expect("head").instance;

        let resolver = ApproverResolver::new(&h.directory);
        let err = h
            .engine
            .decide(
                &fresh,
                &h.request,
                &h.template,
                &DecisionCommand { step_id, decision: Decision::Rejected, note: None },
                &h.acting("head", false),
                &resolver,
                &h.ctx(day(1)),
            )
            .expect_err("step 1 is already approved");

        assert!(err.is_conflict());
        assert!(matches!(
            err,
            WorkflowError::ConcurrencyConflict { status: StepStatus::Approved, .. }
        ));
    }

    #[test]
    fn participant_cannot_decide_twice() {
        let mut h = Harness::new(ParallelDecisionPolicy::RequireAll);
        let instance = h.start();
        let instance = h.decide(&instance, "head", Decision::Approved, day(1)).expect("head").instance;
        let instance =
            h.decide(&instance, "cm-chair", Decision::Approved, day(2)).expect("first").instance;

        let err = h.decide(&instance, "cm-chair", Decision::Rejected, day(2)).expect_err("twice");
        assert!(matches!(err, WorkflowError::AlreadyDecided { .. }));
    }

    #[test]
    fn outsiders_are_refused_and_privileged_override_is_sequential_only() {
        let mut h = Harness::new(ParallelDecisionPolicy::AnyRejectWins);
        let instance = h.start();

        let err = h.decide(&instance, "clerk", Decision::Approved, day(1)).expect_err("clerk");
        assert!(matches!(err, WorkflowError::NotAuthorized { .. }));

        let admin = h.acting("director", true);
        let outcome =
            h.decide_as(&instance, &admin, Decision::Approved, day(1)).expect("override");
        let decided = &outcome.instance.steps[0];
        assert_eq!(decided.decided_by, Some(PrincipalId::new("director")));
        let override_event = h
            .audit
            .events()
            .into_iter()
            .find(|event| event.event_type == "workflow.step_decided")
            .expect("step decided event");
        assert_eq!(
            override_event.metadata.get("privileged_override").map(String::as_str),
            Some("true")
        );

        let err = h
            .decide_as(&outcome.instance, &admin, Decision::Approved, day(2))
            .expect_err("parallel step");
        assert!(matches!(err, WorkflowError::NotAuthorized { .. }));
    }

    #[test]
    fn delegatee_decides_in_the_delegators_slot() {
        let mut h = Harness::new(ParallelDecisionPolicy::RequireAll);
        let instance = h.start();
        let instance = h.decide(&instance, "head", Decision::Approved, day(1)).expect("head").instance;

        let clerk = h.acting("clerk", false).actor;
        let chair: Principal = h.acting("cm-chair", false).actor;
        let acting = ActingIdentity {
            actor: clerk,
            effective: chair,
            delegation_id: Some(DelegationId(5)),
            privileged: false,
        };
        let outcome = h.decide_as(&instance, &acting, Decision::Approved, day(2)).expect("proxy");

        let step = outcome.instance.current_step().expect("step 2 still pending");
        let slot = step.participant(&PrincipalId::new("cm-chair")).expect("chair slot");
        assert_eq!(slot.decision, Some(Decision::Approved));
        assert_eq!(slot.decided_by, Some(PrincipalId::new("clerk")));
        assert_eq!(step.outstanding_count(), 3);
    }

    #[test]
    fn unresolvable_step_stays_pending_and_is_flagged() {
        let mut h = Harness::new(ParallelDecisionPolicy::AnyRejectWins);
        h.template.steps[0] =
            step(1, ExecutionMode::Sequential, ApproverSpec::role("treasurer"), 2);

        let instance = h.start();

        let step = instance.current_step().expect("pending step");
        assert!(step.is_unresolvable());
        assert_eq!(step.status, StepStatus::Pending);
        let flagged = h
            .audit
            .events()
            .into_iter()
            .find(|event| event.event_type == "workflow.step_unresolvable")
            .expect("flagged event");
        assert_eq!(flagged.outcome, AuditOutcome::Flagged);
        assert_eq!(flagged.note.as_deref(), Some("no resolvable approver"));
        assert!(h.notifications.queued().is_empty());
    }

    #[test]
    fn start_rejects_inactive_and_empty_templates() {
        let mut h = Harness::new(ParallelDecisionPolicy::AnyRejectWins);
        let resolver_dir = h.directory.clone();
        let resolver = ApproverResolver::new(&resolver_dir);

        h.template.active = false;
        let err = h
            .engine
            .start(
                InstanceId("inst-x".to_string()),
                &h.request,
                &h.template,
                &PrincipalId::new("requester"),
                &resolver,
                &h.ctx(day(0)),
            )
            .expect_err("inactive");
        assert!(matches!(err, WorkflowError::TemplateInactive(_)));

        h.template.active = true;
        h.template.steps.clear();
        let err = h
            .engine
            .start(
                InstanceId("inst-y".to_string()),
                &h.request,
                &h.template,
                &PrincipalId::new("requester"),
                &resolver,
                &h.ctx(day(0)),
            )
            .expect_err("empty");
        assert!(matches!(err, WorkflowError::TemplateHasNoSteps(_)));
        assert!(h.audit.events().is_empty());
    }

    #[test]
    fn broken_next_step_leaves_no_audit_trace() {
        let mut h = Harness::new(ParallelDecisionPolicy::AnyRejectWins);
        h.template.steps[1].approver = ApproverFields::empty(ApproverKind::Role);
        let instance = h.start();
        let before = h.audit.events().len();

        let err = h.decide(&instance, "head", Decision::Approved, day(1)).expect_err("broken");

        assert!(matches!(err, WorkflowError::InvalidTemplateStep { step_order: 2, .. }));
        assert_eq!(h.audit.events().len(), before);
    }

    #[test]
    fn escalation_replaces_the_pending_step_with_a_role_step() {
        let mut h = Harness::new(ParallelDecisionPolicy::AnyRejectWins);
        h.directory.insert_principal(principal("sg", "secretary_general"));
        let instance = h.start();
        let original = current_step_id(&instance);

        let resolver = ApproverResolver::new(&h.directory);
        let escalated = h
            .engine
            .escalate_current_step(
                &instance,
                &h.request,
                &h.template,
                "secretary_general",
                &resolver,
                &h.ctx(day(5)),
            )
            .expect("escalate")
            .expect("pending step");

        assert_eq!(escalated.step(&original).map(|s| s.status), Some(StepStatus::Escalated));
        let replacement = escalated.current_step().expect("replacement");
        assert_ne!(replacement.id, original);
        assert_eq!(replacement.step_order, 1);
        assert_eq!(replacement.mode, ExecutionMode::Sequential);
        assert_eq!(replacement.resolved_role.as_deref(), Some("secretary_general"));
        assert_eq!(participant_ids(&escalated), vec!["sg"]);
        assert!(h
            .notifications
            .queued()
            .iter()
            .any(|n| n.recipient.0 == "sg" && n.kind == NotificationKind::Escalated));

        let outcome = h.decide(&escalated, "sg", Decision::Approved, day(5)).expect("sg");
        assert_eq!(outcome.instance.current_step().map(|s| s.step_order), Some(2));
    }

    #[test]
    fn sla_beyond_the_calendar_fails_without_panicking() {
        let mut h = Harness::new(ParallelDecisionPolicy::AnyRejectWins);
        h.template.steps[1].sla_days = Some(u32::MAX);
        let instance = h.start();
        let before = h.audit.events().len();

        let err = h.decide(&instance, "head", Decision::Approved, day(1)).expect_err("overflow");
        assert_eq!(err, WorkflowError::DueDateOutOfRange { step_order: 2, sla_days: u32::MAX });
        assert_eq!(h.audit.events().len(), before);

        h.template.steps[0].sla_days = Some(u32::MAX);
        let resolver = ApproverResolver::new(&h.directory);
        let err = h
            .engine
            .escalate_current_step(
                &instance,
                &h.request,
                &h.template,
                "secretary_general",
                &resolver,
                &h.ctx(day(5)),
            )
            .expect_err("overflow");
        assert!(matches!(err, WorkflowError::DueDateOutOfRange { step_order: 1, .. }));
        assert_eq!(h.audit.events().len(), before);
    }
}
