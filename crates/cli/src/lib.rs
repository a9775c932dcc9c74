pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rehearse_core::config::{AppConfig, LoadOptions, LogFormat};

#[derive(Debug, Parser)]
#[command(
    name = "rehearse",
    about = "Rehearse operator CLI",
    long_about = "Inspect configuration, check readiness, preview composed prompts, and run single turns of the response pipeline.",
    after_help = "Examples:\n  rehearse doctor --json\n  rehearse config\n  rehearse compose --role forward_guidance --transcript session.json\n  rehearse turn --transcript session.json --text \"Jag förstår\""
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, role templates, and guardrail rules")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Print the composed prompt payload for one role without calling the model")]
    Compose {
        #[arg(long, help = "Role key, e.g. forward_guidance")]
        role: String,
        #[arg(long, help = "Session snapshot JSON file")]
        transcript: PathBuf,
        #[arg(long, help = "User text for this turn")]
        text: Option<String>,
    },
    #[command(about = "Run one full turn against the configured completion endpoint")]
    Turn {
        #[arg(long, help = "Session snapshot JSON file")]
        transcript: PathBuf,
        #[arg(long, help = "User text for this turn")]
        text: String,
        #[arg(long, help = "Comma-separated role keys; defaults to the session's enabled roles")]
        roles: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    if let Ok(config) = AppConfig::load(LoadOptions::default()) {
        init_logging(&config);
    }

    let result = match cli.command {
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Compose { role, transcript, text } => {
            commands::compose::run(&role, &transcript, text.as_deref())
        }
        Command::Turn { transcript, text, roles } => {
            commands::turn::run(&transcript, &text, roles.as_deref())
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

/// Logs go to stderr so command output on stdout stays machine-readable.
fn init_logging(config: &AppConfig) {
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_max_level(log_level);

    let _ = match config.logging.format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
