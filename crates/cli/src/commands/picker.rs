use routewise_core::domain::org::PickerMode;
use routewise_db::SqlOrgRepository;

use crate::commands::{
    load_config, open_database, operation_failure, runtime, to_data, CommandResult, Failure,
    EXIT_CONFIG,
};

pub fn run(mode: &str) -> CommandResult {
    let Some(parsed) = PickerMode::parse(mode) else {
        return CommandResult::failure(
            "picker",
            "invalid_argument",
            format!("unknown picker mode `{mode}`; expected approvals, routing, chart or all"),
            EXIT_CONFIG,
        );
    };
    let config = match load_config("picker") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("picker") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let result = runtime.block_on(async {
        let pool = open_database(&config).await?;
        let nodes =
            SqlOrgRepository::new(pool.clone()).picker(parsed).await.map_err(operation_failure)?;
        pool.close().await;
        Ok::<_, Failure>(nodes)
    });

    match result {
        Ok(nodes) => CommandResult::success_with_data(
            "picker",
            format!("{} root nodes", nodes.len()),
            to_data(&nodes),
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("picker", error_class, message, exit_code)
        }
    }
}
