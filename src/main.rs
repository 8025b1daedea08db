//! `gpib-server`: run a measurement script against GPIB controllers.

use clap::Parser;
use gpib_daq::app::{RunOutcome, Runner};
use gpib_daq::config::Settings;
use gpib_daq::{loader, logging};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "gpib-server")]
#[command(about = "Drive GPIB instruments from JSON scripts")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Script to execute (defaults to `script_name` from the settings)
    script: Option<String>,

    /// Settings file
    #[arg(short, long, default_value = "gpib.toml")]
    config: PathBuf,

    /// Write example definition files into DIR and exit
    #[arg(long, value_name = "DIR")]
    generate_examples: Option<PathBuf>,
}

fn exit(outcome: RunOutcome) -> ExitCode {
    ExitCode::from(outcome.exit_code())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Some(dir) = cli.generate_examples {
        let _ = logging::init("info");
        return match loader::write_examples(&dir) {
            Ok(paths) => {
                for path in paths {
                    info!("Wrote {}", path.display());
                }
                exit(RunOutcome::Ok)
            }
            Err(e) => {
                error!("Failed to write examples: {:#}", e);
                exit(RunOutcome::FatalInternalError)
            }
        };
    }

    let mut settings = match Settings::load_from(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            let _ = logging::init("info");
            error!("{}", e);
            return exit(RunOutcome::FailedToLoadConfiguration);
        }
    };
    if let Some(script) = cli.script.filter(|s| !s.is_empty()) {
        settings.script_name = script;
    }
    if let Err(e) = logging::init(&settings.log_level) {
        eprintln!("{e:#}");
    }
    info!("gpib-server {}", env!("CARGO_PKG_VERSION"));

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling...");
            interrupt.cancel();
        }
    });

    let outcome = Runner::new(settings).run(&cancel).await;
    info!("Exiting with {:?}", outcome);
    exit(outcome)
}
