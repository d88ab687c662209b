pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_config, connect_with_settings, DbPool};
pub use repositories::outbox::Outbox;
pub use repositories::{
    DelegationRepository, RepositoryError, SqlDelegationRepository, SqlDirectoryRepository,
    SqlEscalationRepository, SqlOrgRepository, SqlOutboxRepository, SqlSettingsRepository,
    SqlTemplateRepository, SqlWorkflowRepository, TemplateRepository, WorkflowRepository,
};
