//! Custom error types for the controller.
//!
//! This module defines the primary error type, `GpibError`, for the whole crate.
//! Using the `thiserror` crate, it provides one place that names every fault the
//! protocol engine, the script engine and the output pipeline can produce.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: the serial transport could not be opened or closed. Fatal to
//!   that controller only.
//! - **`Send`**: a command could not be written. Wraps [`SendError`]; always
//!   recoverable and retried by the issuing lane.
//! - **`FrameTimeout`**: no receive terminator arrived within the command deadline.
//! - **`Resolution`** / **`Expression`**: a lane referenced an unknown controller,
//!   instrument or command, or carried a malformed variable expression. Aborts the
//!   issuing lane only.
//! - **`OutputIo`**: a destination write kept failing after the bounded retries.
//! - **`ScriptValidation`**: the script is rejected before any lane starts.
//! - **`Config`** / **`Load`**: settings or definition files could not be read.
//!
//! Protocol and pipeline errors never unwind across component boundaries. They are
//! handed to an [`ErrorSink`](crate::messages::ErrorSink) instead.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type GpibResult<T> = std::result::Result<T, GpibError>;

#[derive(Error, Debug)]
pub enum GpibError {
    #[error("Connection error on '{port}': {source}")]
    Connection {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Send(#[from] SendError),

    #[error("Command '{command}' timed out after {timeout_ms} ms")]
    FrameTimeout { command: String, timeout_ms: u64 },

    #[error("Unknown {kind} '{name}'")]
    Resolution { kind: &'static str, name: String },

    #[error("Instrument '{instrument}' did not confirm selection (reply: {reply:?})")]
    Selection {
        instrument: String,
        reply: Option<String>,
    },

    #[error("Invalid expression '{0}'")]
    Expression(String),

    #[error("Invalid command template '{template}': {message}")]
    Template { template: String, message: String },

    #[error("Output write to '{path}' failed after {attempts} attempts: {source}")]
    OutputIo {
        path: String,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Script validation error: {0}")]
    ScriptValidation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to load '{path}': {message}")]
    Load { path: String, message: String },
}

impl GpibError {
    /// Shorthand for a not-found resolution failure.
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::Resolution {
            kind,
            name: name.into(),
        }
    }
}

/// Why a `Send` was refused. None of these change the controller's session.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("Controller '{0}' is busy awaiting a reply")]
    Busy(String),

    #[error("Serial port of controller '{0}' is not open")]
    NotConnected(String),

    #[error("Write to controller '{0}' timed out")]
    WriteTimeout(String),

    #[error("Write to controller '{controller}' failed: {source}")]
    Io {
        controller: String,
        #[source]
        source: std::io::Error,
    },
}
