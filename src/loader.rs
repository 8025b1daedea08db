//! Loading controller, catalog and script definitions from JSON files.
//!
//! Every `*.json` file of a directory is one definition. Controller and catalog
//! files that fail to parse are reported and skipped; duplicate names are a
//! load error.

use crate::adapters::PortConfig;
use crate::catalog::{CommandCatalog, CommandTemplate, Instrument, InstrumentCatalog};
use crate::error::{GpibError, GpibResult};
use crate::instrument::ControllerConfig;
use crate::messages::ErrorSink;
use crate::scripting::{Lane, Script};
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

fn json_files(dir: &Path) -> GpibResult<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|e| GpibError::Load {
        path: dir.display().to_string(),
        message: e.to_string(),
    })?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();
    Ok(files)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> GpibResult<T> {
    let text = fs::read_to_string(path).map_err(|e| GpibError::Load {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_str(&text).map_err(|e| GpibError::Load {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Parse every file in `dir`, reporting and skipping those that fail.
fn load_all<T: DeserializeOwned>(dir: &Path, errors: &ErrorSink) -> GpibResult<Vec<T>> {
    let mut items = Vec::new();
    for path in json_files(dir)? {
        match read_json(&path) {
            Ok(item) => {
                debug!("Loaded '{}'", path.display());
                items.push(item);
            }
            Err(e) => errors.report("loader", &e, None),
        }
    }
    Ok(items)
}

/// Load every controller definition in `dir`.
pub fn load_controllers(dir: &Path, errors: &ErrorSink) -> GpibResult<Vec<ControllerConfig>> {
    let controllers: Vec<ControllerConfig> = load_all(dir, errors)?;
    let mut seen = std::collections::HashSet::new();
    for controller in &controllers {
        if !seen.insert(controller.name.as_str()) {
            return Err(GpibError::Load {
                path: dir.display().to_string(),
                message: format!("Duplicate controller name '{}'", controller.name),
            });
        }
    }
    info!("Loaded {} controllers from '{}'", controllers.len(), dir.display());
    Ok(controllers)
}

/// Load every instrument catalog in `dir`, keyed by catalog name.
pub fn load_catalogs(
    dir: &Path,
    errors: &ErrorSink,
) -> GpibResult<HashMap<String, CommandCatalog>> {
    let mut catalogs = HashMap::new();
    for catalog in load_all::<InstrumentCatalog>(dir, errors)? {
        if catalogs.contains_key(&catalog.name) {
            return Err(GpibError::Load {
                path: dir.display().to_string(),
                message: format!("Duplicate command set name '{}'", catalog.name),
            });
        }
        catalogs.insert(catalog.name, catalog.commands);
    }
    info!("Loaded {} command sets from '{}'", catalogs.len(), dir.display());
    Ok(catalogs)
}

/// Find the script called `name` in `dir`.
pub fn load_script(dir: &Path, name: &str) -> GpibResult<Script> {
    for path in json_files(dir)? {
        let Ok(script) = read_json::<Script>(&path) else {
            debug!("Skipping '{}': not a script", path.display());
            continue;
        };
        if script.name == name {
            info!("Loaded script '{}' from '{}'", name, path.display());
            return Ok(script);
        }
    }
    Err(GpibError::Load {
        path: dir.display().to_string(),
        message: format!("No script named '{name}'"),
    })
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {:?}", dir))?;
    }
    let json = serde_json::to_string_pretty(value).context("Failed to serialize example")?;
    fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

/// Write an example controller, command set and script into `dir`.
///
/// Returns the paths written.
pub fn write_examples(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut controller = ControllerConfig::new("ExampleController", PortConfig::new("/dev/ttyUSB0"));
    controller.commands = CommandCatalog::try_from(vec![
        CommandTemplate::new("select", "++addr {0}"),
        CommandTemplate::new("version", "++ver").with_response(1000),
    ])?;
    controller.instruments = vec![Instrument::new("dmm", 22, "DMM", "ExampleInstrument")].try_into()?;

    let catalog = InstrumentCatalog {
        name: "ExampleInstrument".into(),
        commands: CommandCatalog::try_from(vec![
            CommandTemplate::new("identify", "*IDN?").with_response(1000).with_output(),
            CommandTemplate::new("read", "READ?").with_response(3000).with_output(),
            CommandTemplate::new("range", "CONF:VOLT:DC {0}"),
        ])?,
    };

    let lane = Lane::new(
        "Example",
        vec![
            "ExampleController.version".into(),
            "ExampleController.dmm.identify".into(),
            "var:r=10".into(),
            "ExampleController.dmm.range(${r})".into(),
            "delay=500".into(),
            "ExampleController.dmm.read".into(),
        ],
    );
    let script = Script {
        name: "ExampleScript".into(),
        terminate_all_threads_on_error: false,
        lanes: vec![lane],
    };

    let paths = vec![
        dir.join("controllers").join("controller.json"),
        dir.join("instruments").join("instrument.json"),
        dir.join("scripts").join("script.json"),
    ];
    write_json(&controller, &paths[0])?;
    write_json(&catalog, &paths[1])?;
    write_json(&script, &paths[2])?;
    info!("Wrote example definitions to '{}'", dir.display());
    Ok(paths)
}
