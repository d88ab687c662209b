use chrono::Utc;
use routewise_db::SqlOrgRepository;
use tracing::info;

use crate::commands::{
    load_config, open_database, operation_failure, runtime, to_data, CommandResult, Failure,
};

/// Projects the legacy org tables onto org nodes. `dry_run` computes the
/// report without writing.
pub fn run(dry_run: bool) -> CommandResult {
    let config = match load_config("org-sync") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("org-sync") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let repository = SqlOrgRepository::new(pool.clone());
        let report = if dry_run {
            repository.preview().await
        } else {
            repository.sync(Utc::now(), "cli-org-sync").await
        }
        .map_err(operation_failure)?;
        pool.close().await;
        Ok::<_, Failure>(report)
    });

    match result {
        Ok(report) => {
            info!(
                event_name = "cli.org_sync.completed",
                correlation_id = "cli-org-sync",
                dry_run,
                nodes_created = report.nodes_created,
                nodes_updated = report.nodes_updated,
                warnings = report.warnings.len(),
                "org sync command finished"
            );
            let verb = if dry_run { "would create" } else { "created" };
            CommandResult::success_with_data(
                "org-sync",
                format!(
                    "{verb} {} nodes, updated {} nodes, {} warnings",
                    report.nodes_created,
                    report.nodes_updated,
                    report.warnings.len()
                ),
                to_data(&report),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("org-sync", error_class, message, exit_code)
        }
    }
}
