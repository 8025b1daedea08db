//! Run orchestration: load definitions, wire controllers to the output
//! pipeline, connect, execute the script and tear everything down.
//!
//! ```text
//! Controller ──ControllerEvent──▶ dispatcher task ──▶ OutputPipeline ──▶ LineWriter tasks
//!                                                                   └──▶ SideChannel
//! ```
//!
//! The dispatcher owns the pipeline. It stops once every controller has been
//! dropped, which happens after the script finished and the controllers were
//! disconnected.

use crate::adapters::{Connector, SerialConnector};
use crate::config::Settings;
use crate::data::OutputPipeline;
use crate::error::GpibError;
use crate::instrument::Controller;
use crate::loader;
use crate::messages::{ControllerEvent, ErrorSink, EventSink};
use crate::scripting::{Bench, Script, ScriptOutcome};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// How a run ended. Each variant is a process exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Script succeeded
    Ok,
    /// Unexpected internal failure
    FatalInternalError,
    /// Settings could not be loaded
    FailedToLoadConfiguration,
    /// A definition file could not be loaded
    FailedToDeserializeObjects,
    /// Definitions are inconsistent
    FailedToInitializeObjects,
    /// A required controller is missing
    FailedToConnectToControllers,
    /// The script failed
    FailedToExecuteScript,
    /// The run was cancelled
    Canceled,
    /// The script is invalid (duplicate lane names)
    InvalidScript,
}

impl RunOutcome {
    /// Process exit code.
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Ok => 0,
            RunOutcome::FatalInternalError => 1,
            RunOutcome::FailedToLoadConfiguration => 2,
            RunOutcome::FailedToDeserializeObjects => 3,
            RunOutcome::FailedToInitializeObjects => 4,
            RunOutcome::FailedToConnectToControllers => 5,
            RunOutcome::FailedToExecuteScript => 6,
            RunOutcome::Canceled => 8,
            RunOutcome::InvalidScript => 9,
        }
    }
}

/// Executes one script against the configured definitions.
pub struct Runner {
    settings: Settings,
    connector: Arc<dyn Connector>,
    errors: ErrorSink,
}

impl Runner {
    /// Runner opening real serial ports.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            connector: Arc::new(SerialConnector),
            errors: ErrorSink::discard(),
        }
    }

    /// Open controller links through `connector` instead.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Report recoverable errors to `errors` in addition to the log.
    pub fn with_error_sink(mut self, errors: ErrorSink) -> Self {
        self.errors = errors;
        self
    }

    /// Settings in use.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Load, connect, run, tear down.
    pub async fn run(&self, cancel: &CancellationToken) -> RunOutcome {
        let settings = &self.settings;
        let errors = &self.errors;

        info!("Loading definitions...");
        let loaded = loader::load_catalogs(&settings.paths.catalogs, errors).and_then(|catalogs| {
            let controllers = loader::load_controllers(&settings.paths.controllers, errors)?;
            let script = loader::load_script(&settings.paths.scripts, &settings.script_name)?;
            Ok((catalogs, controllers, script))
        });
        let (catalogs, controllers, script) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("{}", e);
                return RunOutcome::FailedToDeserializeObjects;
            }
        };
        if let Err(e) = script.validate() {
            error!("{}", e);
            return RunOutcome::InvalidScript;
        }

        info!("Initializing objects...");
        for controller in &controllers {
            for instrument in controller.instruments.iter() {
                if !catalogs.contains_key(&instrument.catalog) {
                    error!(
                        "Instrument '{}' of controller '{}' uses unknown command set '{}'",
                        instrument.name, controller.name, instrument.catalog
                    );
                    return RunOutcome::FailedToInitializeObjects;
                }
            }
        }

        let (events, events_rx) = EventSink::channel();
        let pipeline = OutputPipeline::new(settings.output.clone(), errors.clone());
        let dispatcher = spawn_dispatcher(events_rx, pipeline);

        let mut bench = Bench::new(errors.clone());
        for (name, catalog) in catalogs {
            bench.add_catalog(name, catalog);
        }
        for config in controllers {
            bench.add_controller(Controller::new(
                config,
                &settings.engine,
                self.connector.clone(),
                events.clone(),
                errors.clone(),
            ));
        }
        drop(events);

        let outcome = self.execute(&script, bench, cancel).await;

        match dispatcher.await {
            Ok(pipeline) if outcome == RunOutcome::Canceled => pipeline.shutdown().await,
            Ok(pipeline) => pipeline.close().await,
            Err(e) => {
                error!("Event dispatcher failed: {}", e);
                return RunOutcome::FatalInternalError;
            }
        }
        info!("Run finished: {:?}", outcome);
        outcome
    }

    async fn execute(&self, script: &Script, bench: Bench, cancel: &CancellationToken) -> RunOutcome {
        let settings = &self.settings;
        let required = script.required_controllers(&settings.engine);

        info!("Connecting to controllers...");
        let mut connected = Vec::new();
        for name in &required {
            let controller = match bench.controller(name) {
                Ok(controller) => controller.clone(),
                Err(e) => {
                    error!("{}", e);
                    disconnect_all(&connected).await;
                    return RunOutcome::FailedToConnectToControllers;
                }
            };
            // failures are reported by the controller; the others keep running
            let _ = controller.connect().await;
            connected.push(controller);
        }

        info!("Executing script '{}'...", script.name);
        let bench = Arc::new(bench);
        let result = script.run(bench, &settings.engine, cancel).await;
        disconnect_all(&connected).await;

        match result {
            Ok(report) => match report.outcome {
                ScriptOutcome::Succeeded => RunOutcome::Ok,
                ScriptOutcome::Cancelled => RunOutcome::Canceled,
                ScriptOutcome::Failed => RunOutcome::FailedToExecuteScript,
            },
            Err(GpibError::ScriptValidation(e)) => {
                error!("{}", e);
                RunOutcome::InvalidScript
            }
            Err(e) => {
                error!("{}", e);
                RunOutcome::FailedToExecuteScript
            }
        }
    }
}

async fn disconnect_all(controllers: &[Controller]) {
    for controller in controllers {
        controller.disconnect().await;
    }
}

fn spawn_dispatcher(
    mut rx: mpsc::UnboundedReceiver<ControllerEvent>,
    mut pipeline: OutputPipeline,
) -> JoinHandle<OutputPipeline> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            pipeline.handle(event);
        }
        pipeline
    })
}
