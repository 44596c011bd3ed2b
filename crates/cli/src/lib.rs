pub mod commands;
pub mod logging;

use clap::{Parser, Subcommand};
use leadflow_core::config::{AppConfig, LoadOptions};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "leadflow",
    about = "Leadflow operator CLI",
    long_about = "Operate the lead pipeline: migrations, config inspection, readiness checks and one-off lead runs.",
    after_help = "Examples:\n  leadflow doctor --json\n  leadflow config\n  leadflow process --message \"Fui demitido sem justa causa\" --name Joana"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, completion provider readiness, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Run one lead through the agent pipeline and print the execution result")]
    Process {
        #[arg(long, help = "Message sent by the lead")]
        message: String,
        #[arg(long, help = "Lead name")]
        name: Option<String>,
        #[arg(long, help = "Lead e-mail")]
        email: Option<String>,
        #[arg(long, default_value = "cli", help = "Channel the message arrived on")]
        channel: String,
        #[arg(long, help = "How long to wait for the result, in milliseconds")]
        timeout_ms: Option<u64>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    if let Ok(config) = AppConfig::load(LoadOptions::default()) {
        logging::init_logging(&config);
    }

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Process { message, name, email, channel, timeout_ms } => {
            commands::process::run(commands::process::ProcessArgs {
                message,
                name,
                email,
                channel,
                timeout_ms,
            })
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
