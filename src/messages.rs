//! Message types passed between the protocol engine, the script engine and the
//! output pipeline.
//!
//! Controllers never call into the pipeline directly. They push
//! [`ControllerEvent`]s into an [`EventSink`] and recoverable faults into an
//! [`ErrorSink`]; both wrap unbounded `tokio::sync::mpsc` senders so the receive
//! path never blocks on a slow consumer.

use crate::catalog::{CommandTemplate, Instrument};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// One completed reply, the unit consumed by the output pipeline.
#[derive(Clone, Debug)]
pub struct ResponseEvent {
    /// Name of the controller that framed the reply
    pub controller: String,
    /// Instrument selected when the reply arrived, if any
    pub instrument: Option<Arc<Instrument>>,
    /// Command the reply answers
    pub command: Arc<CommandTemplate>,
    /// Reply text with terminator and prefix removed
    pub response: String,
    /// Receipt time
    pub timestamp: DateTime<Local>,
}

impl ResponseEvent {
    /// Instrument name, or an empty string for controller-level commands.
    pub fn instrument_name(&self) -> &str {
        self.instrument.as_deref().map_or("", |i| i.name.as_str())
    }
}

/// Emitted when a command's deadline passes before its frame completes.
#[derive(Clone, Debug)]
pub struct TimeoutEvent {
    /// Controller name
    pub controller: String,
    /// Instrument selected when the command was sent
    pub instrument: Option<Arc<Instrument>>,
    /// The command left unanswered
    pub command: Arc<CommandTemplate>,
}

/// Which way terminal traffic flowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Written to the controller
    Sent,
    /// Read from the controller
    Received,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sent => f.write_str(">>"),
            Direction::Received => f.write_str("<<"),
        }
    }
}

/// Everything a controller reports while running.
#[derive(Clone, Debug)]
pub enum ControllerEvent {
    /// A frame completed
    Response(ResponseEvent),
    /// A command deadline expired
    Timeout(TimeoutEvent),
    /// Raw traffic for the terminal log
    Terminal {
        controller: String,
        direction: Direction,
        text: String,
    },
}

/// Non-blocking sender for [`ControllerEvent`]s.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ControllerEvent>>,
}

impl EventSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ControllerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every event.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Queue an event. Never blocks; a closed receiver is ignored.
    pub fn emit(&self, event: ControllerEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// A recoverable fault handed to the error sink.
#[derive(Clone, Debug)]
pub struct ErrorReport {
    /// Component that raised the error (controller, lane, writer path, ...)
    pub source: String,
    /// Rendered error
    pub error: String,
    /// Extra data, e.g. the command text being processed
    pub context: Option<String>,
    /// When the error was reported
    pub timestamp: DateTime<Local>,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.source, self.error)?;
        if let Some(ctx) = &self.context {
            write!(f, " ({ctx})")?;
        }
        Ok(())
    }
}

/// Uniform error channel passed to every component at construction.
///
/// Every report is logged at `warn` level and, when a receiver exists, queued
/// for the caller.
#[derive(Clone, Debug, Default)]
pub struct ErrorSink {
    tx: Option<mpsc::UnboundedSender<ErrorReport>>,
}

impl ErrorSink {
    /// Create a sink and the receiver that drains it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ErrorReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that only logs.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Report an error raised by `source`.
    pub fn report(&self, source: &str, error: impl fmt::Display, context: Option<&str>) {
        let report = ErrorReport {
            source: source.to_string(),
            error: error.to_string(),
            context: context.map(str::to_string),
            timestamp: Local::now(),
        };
        warn!("{}", report);
        if let Some(tx) = &self.tx {
            let _ = tx.send(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn error_sink_delivers_reports() {
        let (sink, mut rx) = ErrorSink::channel();
        sink.report("ctrl", "port closed", Some("++ver"));
        let report = rx.try_recv().unwrap();
        assert_eq!(report.source, "ctrl");
        assert_eq!(report.to_string(), "[ctrl] port closed (++ver)");
    }

    #[test]
    #[traced_test]
    fn reports_are_logged() {
        ErrorSink::discard().report("gpib0", "write timeout", None);
        assert!(logs_contain("[gpib0] write timeout"));
    }

    #[test]
    fn discard_sinks_do_not_panic() {
        ErrorSink::discard().report("x", "y", None);
        EventSink::discard().emit(ControllerEvent::Terminal {
            controller: "c".into(),
            direction: Direction::Sent,
            text: "t".into(),
        });
    }
}
