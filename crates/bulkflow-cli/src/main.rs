//! Bulkflow CLI - Main entry point

use bulkflow_cli::commands::{self, Invocation};
use bulkflow_cli::{Cli, Commands};
use bulkflow_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use clap::Parser;
use std::process;
use tracing::error;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.markdown_help {
        println!("{}", clap_markdown::help_markdown::<Cli>());
        return;
    }

    if cli.command.is_none() {
        eprintln!("Error: A subcommand is required");
        eprintln!();
        eprintln!("For more information, try '--help'.");
        process::exit(2);
    }

    // Verbose: debug to the console. Otherwise warnings only, so stdout stays pure JSON and
    // stderr is left to the spinner.
    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Warn
    };
    let log_config = LogConfig::builder()
        .level(level)
        .output(LogOutput::Console)
        .log_file_prefix("bulkflow")
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env_with(log_config.clone()).unwrap_or(log_config);

    // The CLI works without logging
    let guard = init_logging(&log_config).ok();

    if let Err(e) = execute_command(&cli).await {
        error!(error = %e, "Command failed");
        eprintln!("Error: {}", e);
        drop(guard);
        process::exit(e.exit_code());
    }
}

async fn execute_command(cli: &Cli) -> bulkflow_cli::Result<()> {
    let Some(ref command) = cli.command else {
        return Ok(());
    };

    let invocation = Invocation {
        dry_run: cli.dry_run,
        show_progress: !cli.no_progress,
    };

    match command {
        Commands::Run { request } => commands::run::run(request, invocation).await,

        Commands::Load { source } => commands::load::run(source, invocation).await,

        Commands::Generate {
            orders,
            lines_per_order,
            company_id,
            start_order_number,
            options,
        } => {
            commands::generate::run(
                *orders,
                *lines_per_order,
                *company_id,
                *start_order_number,
                options,
                invocation,
            )
            .await
        }

        Commands::Migrate => commands::migrate::run().await,
    }
}
