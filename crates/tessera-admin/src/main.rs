use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use tessera_common::TesseraError;

mod commands;
mod config;
mod logging;

use commands::Services;
use config::{Cli, Configuration};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let configuration = match Configuration::new(&cli) {
        Ok(configuration) => configuration,
        Err(e) => {
            eprintln!("Failed to load configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let _logging_guard = match logging::init_logging(&configuration.logging_config()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(cli, &configuration).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<TesseraError>() {
                Some(err) => {
                    let code = err.error_code();
                    error!(code = code.code, "{}: {}", code.message, err);
                }
                None => error!("{:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli, configuration: &Configuration) -> anyhow::Result<()> {
    let user = cli.user_context();
    let persistence = configuration.persistence().await?;
    info!(
        "Tessera admin using storage mode {}",
        persistence.storage_mode()
    );

    let services = Services::new(persistence, configuration);
    commands::run(cli.command, &services, &user).await
}
