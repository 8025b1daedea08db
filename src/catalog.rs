//! Command templates, command catalogs and instrument directories.
//!
//! These are the read-only lookup types shared by controllers and instruments.
//! Both a controller and an instrument command set hold one [`CommandCatalog`];
//! there is no type hierarchy between them.
//!
//! All three types deserialize from the plain JSON lists used by the definition
//! files, rejecting duplicate names at load time.

use crate::error::{GpibError, GpibResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn default_timeout_ms() -> u64 {
    3000
}

/// A named, reusable command definition.
///
/// Templates are immutable once loaded. [`CommandTemplate::parameterize`] yields a
/// new value with `{0}`, `{1}`, ... placeholders filled in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    /// Unique name within the owning catalog
    pub name: String,
    /// Command text, may contain positional placeholders
    pub command: String,
    /// Whether the instrument answers this command
    #[serde(default)]
    pub await_response: bool,
    /// Reply deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Number of leading characters stripped from a reply
    #[serde(default)]
    pub response_prefix_length: usize,
    /// Reply used to verify the command took effect
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_response: Option<String>,
    /// Forward successful replies to the output pipeline
    #[serde(default)]
    pub output_response: bool,
}

impl CommandTemplate {
    /// Create a template with default flags.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            await_response: false,
            timeout_ms: default_timeout_ms(),
            response_prefix_length: 0,
            expected_response: None,
            output_response: false,
        }
    }

    /// Mark the command as answered, with the given deadline.
    pub fn with_response(mut self, timeout_ms: u64) -> Self {
        self.await_response = true;
        self.timeout_ms = timeout_ms;
        self
    }

    /// Strip `len` leading characters from every reply.
    pub fn with_prefix_length(mut self, len: usize) -> Self {
        self.response_prefix_length = len;
        self
    }

    /// Require this reply for verification.
    pub fn with_expected(mut self, expected: impl Into<String>) -> Self {
        self.expected_response = Some(expected.into());
        self
    }

    /// Forward replies to the output pipeline.
    pub fn with_output(mut self) -> Self {
        self.output_response = true;
        self
    }

    /// Reply deadline as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Fill positional placeholders in the command text and the expected reply.
    ///
    /// The template itself is left untouched.
    pub fn parameterize<S: AsRef<str>>(&self, args: &[S]) -> GpibResult<CommandTemplate> {
        let vars: HashMap<String, String> = args
            .iter()
            .enumerate()
            .map(|(i, a)| (i.to_string(), a.as_ref().trim().to_string()))
            .collect();

        let mut out = self.clone();
        out.command = format_template(&self.command, &vars)?;
        if let Some(expected) = &self.expected_response {
            out.expected_response = Some(format_template(expected, &vars)?);
        }
        Ok(out)
    }
}

/// Format a `strfmt` template, mapping failures onto [`GpibError::Template`].
pub(crate) fn format_template(
    template: &str,
    vars: &HashMap<String, String>,
) -> GpibResult<String> {
    strfmt::strfmt(template, vars).map_err(|e| GpibError::Template {
        template: template.to_string(),
        message: e.to_string(),
    })
}

/// Immutable mapping from command name to template.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<CommandTemplate>", into = "Vec<CommandTemplate>")]
pub struct CommandCatalog {
    commands: HashMap<String, Arc<CommandTemplate>>,
}

impl CommandCatalog {
    /// Look up a command by name.
    pub fn get(&self, name: &str) -> GpibResult<&Arc<CommandTemplate>> {
        self.commands
            .get(name)
            .ok_or_else(|| GpibError::not_found("command", name))
    }

    /// Whether the catalog defines `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Number of commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// True when no command is defined.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl TryFrom<Vec<CommandTemplate>> for CommandCatalog {
    type Error = GpibError;

    fn try_from(list: Vec<CommandTemplate>) -> Result<Self, Self::Error> {
        let mut commands = HashMap::with_capacity(list.len());
        for cmd in list {
            let name = cmd.name.clone();
            if commands.insert(name.clone(), Arc::new(cmd)).is_some() {
                return Err(GpibError::Config(format!("Duplicate command name '{name}'")));
            }
        }
        Ok(Self { commands })
    }
}

impl From<CommandCatalog> for Vec<CommandTemplate> {
    fn from(catalog: CommandCatalog) -> Self {
        let mut list: Vec<CommandTemplate> = catalog
            .commands
            .into_values()
            .map(|c| (*c).clone())
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

/// Named command set shared by every instrument of one model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstrumentCatalog {
    /// Catalog name referenced by [`Instrument::catalog`]
    pub name: String,
    /// Commands understood by the model
    #[serde(rename = "command_set")]
    pub commands: CommandCatalog,
}

/// A device reachable at a numeric bus address through a controller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    /// Unique name within the owning controller
    pub name: String,
    /// GPIB primary address
    pub address: u32,
    /// Free-form type tag, used for output keying
    #[serde(rename = "type", default)]
    pub instrument_type: String,
    /// Name of the instrument catalog holding this device's commands
    #[serde(rename = "command_set_name")]
    pub catalog: String,
}

impl Instrument {
    /// Create an instrument entry.
    pub fn new(
        name: impl Into<String>,
        address: u32,
        instrument_type: impl Into<String>,
        catalog: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            instrument_type: instrument_type.into(),
            catalog: catalog.into(),
        }
    }
}

/// Per-controller mapping from instrument name to address and metadata.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Instrument>", into = "Vec<Instrument>")]
pub struct InstrumentDirectory {
    instruments: HashMap<String, Arc<Instrument>>,
}

impl InstrumentDirectory {
    /// Resolve an instrument by name.
    pub fn get(&self, name: &str) -> GpibResult<&Arc<Instrument>> {
        self.instruments
            .get(name)
            .ok_or_else(|| GpibError::not_found("instrument", name))
    }

    /// Iterate over all instruments.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Instrument>> {
        self.instruments.values()
    }

    /// Number of instruments.
    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    /// True when the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

impl TryFrom<Vec<Instrument>> for InstrumentDirectory {
    type Error = GpibError;

    fn try_from(list: Vec<Instrument>) -> Result<Self, Self::Error> {
        let mut instruments = HashMap::with_capacity(list.len());
        for instr in list {
            let name = instr.name.clone();
            if instruments.insert(name.clone(), Arc::new(instr)).is_some() {
                return Err(GpibError::Config(format!(
                    "Duplicate instrument name '{name}'"
                )));
            }
        }
        Ok(Self { instruments })
    }
}

impl From<InstrumentDirectory> for Vec<Instrument> {
    fn from(dir: InstrumentDirectory) -> Self {
        let mut list: Vec<Instrument> = dir
            .instruments
            .into_values()
            .map(|i| (*i).clone())
            .collect();
        list.sort_by_key(|i| i.address);
        list
    }
}
