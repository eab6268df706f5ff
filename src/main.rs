use pinaffinity::commands::{dispatch, Cli, Commands};
use pinaffinity::error::ErrorSeverity;
use pinaffinity::utils::{init_logger, ConfigPaths};
use std::process::ExitCode;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();
    let command = cli.command();

    // The enforcing instance also logs to the runtime directory
    let log_file = cli.logging.log_file.clone().or_else(|| match command {
        Commands::Run(_) => ConfigPaths::new().ok().map(|paths| paths.log_file),
        _ => None,
    });
    if let Err(err) = init_logger(cli.logging.log_level.as_deref(), log_file) {
        eprintln!("Failed to initialize logging: {err}");
    }

    match dispatch(command).await {
        Ok(code) => code,
        Err(err) => {
            tracing::debug!("{err:?}");
            eprintln!("{}: {}", err.category().display_name(), err.user_message());
            if err.severity() >= ErrorSeverity::High {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
