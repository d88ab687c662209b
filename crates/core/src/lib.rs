pub mod approvals;
pub mod audit;
pub mod config;
pub mod delegation;
pub mod domain;
pub mod errors;
pub mod escalation;
pub mod notify;
pub mod org;
pub mod workflow;

pub use approvals::{
    ApproverResolver, CommitteeDeliveryResolver, Directory, InMemoryDirectory, StepResolution,
    TemplateValidator, ValidationError,
};
pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use config::{AppConfig, ConfigError, LoadOptions};
pub use delegation::{ActingIdentity, DelegationError, DelegationResolver, PermissionTable};
pub use domain::instance::{Decision, InstanceId, InstanceStepId, StepStatus, WorkflowInstance};
pub use domain::principal::{Principal, PrincipalId};
pub use domain::request::{RequestId, RequestStatus, WorkflowRequest};
pub use domain::template::{ApproverSpec, TemplateId, WorkflowTemplate};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use escalation::{AgeBasis, EscalationRoleMap, EscalationSettings, TickOutcome};
pub use notify::{InMemoryNotificationSink, NotificationKind, NotificationRequest, NotificationSink};
pub use org::{OrgError, OrgTree, PickerNode, SyncReport};
pub use workflow::{
    DecisionCommand, EngineContext, EngineOutcome, InstanceEngine, ParallelDecisionPolicy,
    WorkflowError,
};
