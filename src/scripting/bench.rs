//! Everything a script runs against: connected controllers and instrument catalogs.

use super::path::CommandRef;
use crate::catalog::{CommandCatalog, CommandTemplate, Instrument};
use crate::error::{GpibError, GpibResult};
use crate::instrument::Controller;
use crate::messages::ErrorSink;
use std::collections::HashMap;
use std::sync::Arc;

/// A command reference resolved against the bench.
#[derive(Clone, Debug)]
pub struct Resolved {
    /// Addressed controller
    pub controller: Controller,
    /// Instrument to select first, for three-segment references
    pub instrument: Option<Arc<Instrument>>,
    /// Catalog template
    pub command: Arc<CommandTemplate>,
}

/// Read-only lookup tables shared by all lanes of a run.
#[derive(Clone, Debug, Default)]
pub struct Bench {
    controllers: HashMap<String, Controller>,
    catalogs: HashMap<String, Arc<CommandCatalog>>,
    errors: ErrorSink,
}

impl Bench {
    /// Empty bench reporting to `errors`.
    pub fn new(errors: ErrorSink) -> Self {
        Self {
            controllers: HashMap::new(),
            catalogs: HashMap::new(),
            errors,
        }
    }

    /// Register a controller under its name.
    pub fn add_controller(&mut self, controller: Controller) {
        self.controllers
            .insert(controller.name().to_string(), controller);
    }

    /// Register an instrument catalog.
    pub fn add_catalog(&mut self, name: impl Into<String>, catalog: CommandCatalog) {
        self.catalogs.insert(name.into(), Arc::new(catalog));
    }

    /// Look up a controller.
    pub fn controller(&self, name: &str) -> GpibResult<&Controller> {
        self.controllers
            .get(name)
            .ok_or_else(|| GpibError::not_found("controller", name))
    }

    /// Look up an instrument catalog.
    pub fn catalog(&self, name: &str) -> GpibResult<&Arc<CommandCatalog>> {
        self.catalogs
            .get(name)
            .ok_or_else(|| GpibError::not_found("command set", name))
    }

    /// All registered controllers.
    pub fn controllers(&self) -> impl Iterator<Item = &Controller> {
        self.controllers.values()
    }

    /// Error sink shared by the lanes.
    pub fn errors(&self) -> &ErrorSink {
        &self.errors
    }

    /// Resolve a parsed reference.
    ///
    /// Two segments name a controller-level command; three name an instrument
    /// and a command from the instrument's catalog.
    pub fn resolve(&self, reference: &CommandRef<'_>) -> GpibResult<Resolved> {
        let controller = self.controller(reference.controller())?;
        match reference.instrument() {
            Some(name) => {
                let instrument = controller.instrument(name)?;
                let command = self
                    .catalog(&instrument.catalog)?
                    .get(reference.command())?
                    .clone();
                Ok(Resolved {
                    controller: controller.clone(),
                    instrument: Some(instrument),
                    command,
                })
            }
            None => Ok(Resolved {
                controller: controller.clone(),
                instrument: None,
                command: controller.command(reference.command())?,
            }),
        }
    }
}
