//! Output pipeline: routes response records and terminal traffic to writers.
//!
//! Destination keys are file paths. A response's key comes from the configured
//! [`OutputSeparation`] rendered through the label template and then the path
//! template; a terminal chunk's key comes from the terminal log template and
//! the controller name. Writers are created on first use and cached for the
//! rest of the session.

use super::side_channel::{ResponsePacket, SideChannel};
use super::writer::{LineWriter, Mirror, WriterOptions};
use crate::catalog::format_template;
use crate::config::{OutputSeparation, OutputSettings};
use crate::error::GpibResult;
use crate::error_recovery::RetryPolicy;
use crate::messages::{ControllerEvent, Direction, ErrorSink, ResponseEvent};
use chrono::Local;
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Consumes controller events and persists them through per-key writers.
pub struct OutputPipeline {
    settings: OutputSettings,
    session_stamp: String,
    mirror: Mirror,
    errors: ErrorSink,
    cancel: CancellationToken,
    writers: HashMap<PathBuf, LineWriter>,
    side_channel: Option<SideChannel>,
}

impl OutputPipeline {
    /// Create the pipeline. Must be called inside a tokio runtime when the
    /// broadcast side channel is enabled.
    pub fn new(settings: OutputSettings, errors: ErrorSink) -> Self {
        let session_stamp = Local::now()
            .format(&settings.path_timestamp_format)
            .to_string();
        let mirror = if settings.echo_to_console {
            Mirror::Stdout
        } else {
            Mirror::None
        };
        let cancel = CancellationToken::new();
        let side_channel = settings
            .broadcast
            .then(|| SideChannel::spawn(settings.broadcast_capacity, cancel.child_token()));
        Self {
            settings,
            session_stamp,
            mirror,
            errors,
            cancel,
            writers: HashMap::new(),
            side_channel,
        }
    }

    /// Mirror every line written from now on to `mirror`.
    pub fn with_mirror(mut self, mirror: Mirror) -> Self {
        self.mirror = mirror;
        self
    }

    /// Subscribe to the broadcast side channel, if enabled.
    pub fn subscribe(&self) -> Option<broadcast::Receiver<ResponsePacket>> {
        self.side_channel.as_ref().map(SideChannel::subscribe)
    }

    /// Paths of the writers created so far.
    pub fn destinations(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.writers.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Route any controller event. Timeouts are not recorded; failures go to
    /// the error sink.
    pub fn handle(&mut self, event: ControllerEvent) {
        let result = match event {
            ControllerEvent::Response(event) => self.queue_response(&event).map(|_| ()),
            ControllerEvent::Terminal {
                controller,
                direction,
                text,
            } => self.queue_terminal(&controller, direction, &text),
            ControllerEvent::Timeout(_) => Ok(()),
        };
        if let Err(e) = result {
            self.errors.report("output", &e, None);
        }
    }

    /// Queue a response record.
    ///
    /// Returns `false` without doing anything when the command does not
    /// forward its replies.
    pub fn queue_response(&mut self, event: &ResponseEvent) -> GpibResult<bool> {
        if !event.command.output_response {
            return Ok(false);
        }
        let path = self.response_destination(event)?;
        let line = self.format_line(event)?;
        self.writer(path).enqueue(line);
        if let Some(side_channel) = &self.side_channel {
            side_channel.publish(event.clone());
        }
        Ok(true)
    }

    /// Queue raw terminal traffic of `controller`. A no-op when terminal logs
    /// are disabled.
    pub fn queue_terminal(
        &mut self,
        controller: &str,
        direction: Direction,
        text: &str,
    ) -> GpibResult<()> {
        let Some(template) = &self.settings.terminal_log_path else {
            return Ok(());
        };
        let vars = HashMap::from([
            ("controller".to_string(), controller.to_string()),
            ("timestamp".to_string(), self.session_stamp.clone()),
        ]);
        let path = PathBuf::from(format_template(template, &vars)?);
        let line = format!(
            "{} {} {}",
            Local::now().format(&self.settings.line_timestamp_format),
            direction,
            text.trim_end_matches(['\r', '\n'])
        );
        self.writer(path).enqueue(line);
        Ok(())
    }

    /// Destination file of a response record.
    pub fn response_destination(&self, event: &ResponseEvent) -> GpibResult<PathBuf> {
        let settings = &self.settings;
        let group = event.instrument.as_deref().map(|instrument| match settings.separation {
            OutputSeparation::None => "",
            OutputSeparation::InstrumentType => instrument.instrument_type.as_str(),
            OutputSeparation::InstrumentModel => instrument.catalog.as_str(),
            OutputSeparation::InstrumentName => instrument.name.as_str(),
        });
        let label = match (settings.separation, group) {
            (OutputSeparation::None, _) => String::new(),
            (_, Some(group)) => label(&settings.label_format, group)?,
            (_, None) => label(&settings.label_format, &event.controller)?,
        };
        let vars = HashMap::from([
            ("label".to_string(), label),
            ("timestamp".to_string(), self.session_stamp.clone()),
        ]);
        Ok(PathBuf::from(format_template(&settings.path, &vars)?))
    }

    fn format_line(&self, event: &ResponseEvent) -> GpibResult<String> {
        let vars = HashMap::from([
            (
                "timestamp".to_string(),
                event
                    .timestamp
                    .format(&self.settings.line_timestamp_format)
                    .to_string(),
            ),
            ("controller".to_string(), event.controller.clone()),
            ("instrument".to_string(), event.instrument_name().to_string()),
            ("command".to_string(), event.command.command.clone()),
            ("response".to_string(), event.response.clone()),
        ]);
        format_template(&self.settings.line_format, &vars)
    }

    fn writer(&mut self, path: PathBuf) -> &LineWriter {
        let settings = &self.settings;
        let mirror = &self.mirror;
        let errors = &self.errors;
        let cancel = &self.cancel;
        self.writers.entry(path).or_insert_with_key(|path| {
            debug!("New output destination '{}'", path.display());
            LineWriter::spawn(
                path.clone(),
                WriterOptions {
                    policy: RetryPolicy::new(settings.retries, settings.retry_delay),
                    flush_each_line: settings.flush_each_line,
                    mirror: mirror.clone(),
                },
                errors.clone(),
                cancel.child_token(),
            )
        })
    }

    /// Let every writer and the side channel finish their queues, then stop.
    pub async fn close(self) {
        let count = self.writers.len();
        join_all(self.writers.into_values().map(LineWriter::join)).await;
        if let Some(side_channel) = self.side_channel {
            side_channel.join().await;
        }
        info!("Output pipeline stopped ({} writers)", count);
    }

    /// Stop every writer and the side channel without draining their queues.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.close().await;
    }
}

fn label(format: &str, group: &str) -> GpibResult<String> {
    let vars = HashMap::from([("label".to_string(), group.to_string())]);
    format_template(format, &vars)
}
