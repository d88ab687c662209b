use chrono::Utc;
use routewise_core::escalation::TickOutcome;
use routewise_db::SqlEscalationRepository;

use crate::commands::{
    load_config, open_database, operation_failure, runtime, to_data, CommandResult, Failure,
};

/// Runs a single escalation tick, subject to the same throttle as the
/// server's worker.
pub fn run() -> CommandResult {
    let config = match load_config("escalate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("escalate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let repository = SqlEscalationRepository::new(pool.clone(), config.workflow.engine());
        let outcome = repository
            .run_tick(&config.escalation, Utc::now(), "cli-escalate")
            .await
            .map_err(operation_failure)?;
        pool.close().await;
        Ok::<_, Failure>(outcome)
    });

    match result {
        Ok(outcome) => {
            let message = match &outcome {
                TickOutcome::Skipped { .. } => "skipped: inside throttle window".to_string(),
                TickOutcome::Swept { escalated } => format!("escalated {escalated} requests"),
            };
            CommandResult::success_with_data("escalate", message, to_data(&outcome))
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("escalate", error_class, message, exit_code)
        }
    }
}
