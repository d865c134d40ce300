use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use certwarden::{
    config::{Config, DEFAULT_CONFIG_FILE},
    lifecycle::{CycleOutcome, CycleReport, Lifecycle},
    reload::{ReloadOutcome, ReloadReport},
};
use clap::{Parser, Subcommand};
use eyre::WrapErr as _;

/// Keeps the TLS certificate of a multi-service deployment valid.
#[derive(Debug, Parser)]
#[command(name = "certwarden", version, about, long_about = None)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, env = "CERTWARDEN_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Inspect the deployed certificate; exits 1 when it needs attention.
    Check {
        /// Print the certificate record as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Obtain a new certificate regardless of the current one.
    Issue,

    /// Renew the certificate if it is inside the warning window.
    Renew,

    /// Print a human-readable report. Always exits 0, even without a usable config.
    Status,

    /// Check periodically until terminated. SIGUSR1 triggers a renewal.
    Run,
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let code = match cli.command {
        Command::Check { json } => {
            let report = load(&cli.config)?.check();

            match (&report.inspection, json) {
                (Ok(record), true) => println!("{}", serde_json::to_string_pretty(record)?),
                _ => println!("{report}"),
            }

            report.exit_code()
        }

        Command::Issue => print_cycle(&load(&cli.config)?.issue().await),

        Command::Renew => print_cycle(&load(&cli.config)?.renew().await),

        Command::Status => {
            print!("{}", status_report(&cli.config));
            0
        }

        Command::Run => {
            Arc::new(load(&cli.config)?)
                .run(std::future::pending())
                .await
                .wrap_err("could not install signal handlers")?;
            0
        }
    };

    Ok(ExitCode::from(code))
}

fn load(config: &Path) -> eyre::Result<Lifecycle> {
    let config = Config::load(config).wrap_err("could not load configuration")?;
    Ok(config.build_lifecycle())
}

/// Status of the deployment at `config`, or why there is nothing to report on.
fn status_report(config: &Path) -> String {
    match Config::load(config) {
        Ok(config) => config.build_lifecycle().status().to_string(),
        Err(err) => format!("MISSING: {err}\n"),
    }
}

fn print_cycle(report: &CycleReport) -> u8 {
    match &report.outcome {
        CycleOutcome::NoAction(action) => println!("No renewal needed ({action})."),

        CycleOutcome::Deferred(days) => {
            println!("Certificate expires in {days} days; renewal advised.");
        }

        CycleOutcome::Renewed { valid_days, reload } => {
            println!("Certificate renewed, valid {valid_days} days.");
            print_reload(reload);
        }

        CycleOutcome::Fallback { reload } => {
            eprintln!("WARNING: running on self-signed fallback certificate.");
            print_reload(reload);
        }

        CycleOutcome::Failed(err) => {
            eprintln!("{}: {err}", err.kind());
            if let Some(hint) = err.hint() {
                eprintln!("hint: {hint}");
            }
        }
    }

    report.exit_code()
}

fn print_reload(report: &ReloadReport) {
    for res in &report.results {
        match &res.result {
            Ok(()) => println!("  reloaded {}", res.name),
            Err(err) if res.required => eprintln!("  ReloadFailed: {err}"),
            Err(err) => eprintln!("  ReloadFailed (optional): {err}"),
        }
    }

    if report.outcome == ReloadOutcome::DegradedSuccess {
        eprintln!("WARNING: certificate deployed but not every required service reloaded.");
    }
}
