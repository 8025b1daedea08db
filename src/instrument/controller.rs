//! Controller protocol engine.
//!
//! A [`Controller`] owns the serial link to one GPIB-to-serial adapter. It sends
//! one command at a time, frames the reply out of the incoming byte stream and
//! enforces a per-command deadline.
//!
//! # Session state
//!
//! All mutable state (transport handle, pending reply, last command, last
//! selected instrument, last response, receive buffer) sits behind one
//! `tokio::sync::Mutex`. `send` and the reader task both take it, so at most one
//! command is in flight and the buffer is only ever touched atomically.
//!
//! ```text
//! Idle --send--> AwaitingReply --frame--> Idle
//!                      \-------timeout--> Idle
//! ```
//!
//! "Busy" is exactly "a reply deadline is armed". The deadline is a spawned
//! timer tagged with a generation number; whichever of frame completion or the
//! timer takes the pending slot first wins, so busy clears exactly once per send.

use super::framing::{strip_response_prefix, Framer};
use crate::adapters::{Connector, DynSerial, PortConfig};
use crate::catalog::{CommandCatalog, CommandTemplate, Instrument, InstrumentDirectory};
use crate::config::EngineSettings;
use crate::error::{GpibError, GpibResult, SendError};
use crate::messages::{
    ControllerEvent, Direction, ErrorSink, EventSink, ResponseEvent, TimeoutEvent,
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

fn default_terminator() -> String {
    "\r\n".to_string()
}

fn default_permissive() -> bool {
    true
}

fn default_select_command() -> String {
    "select".to_string()
}

/// Static definition of a controller, as loaded from its definition file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Globally unique controller name
    pub name: String,
    /// Serial line settings
    pub port: PortConfig,
    /// Terminator of received frames
    #[serde(default = "default_terminator")]
    pub end_of_receive: String,
    /// Match only the terminator's last character
    #[serde(default = "default_permissive")]
    pub permissive_end_of_receive: bool,
    /// Terminator appended to every command
    #[serde(default = "default_terminator")]
    pub end_of_send: String,
    /// Catalog command selecting an address, parameterized with it
    #[serde(default = "default_select_command")]
    pub address_select_command: String,
    /// Optional catalog command verifying the selection
    #[serde(default)]
    pub address_query_command: Option<String>,
    /// Controller-level commands
    #[serde(default, rename = "command_set")]
    pub commands: CommandCatalog,
    /// Instruments on this controller's bus
    #[serde(default, rename = "instrument_set")]
    pub instruments: InstrumentDirectory,
}

impl ControllerConfig {
    /// Controller with CRLF terminators and empty catalogs.
    pub fn new(name: impl Into<String>, port: PortConfig) -> Self {
        Self {
            name: name.into(),
            port,
            end_of_receive: default_terminator(),
            permissive_end_of_receive: default_permissive(),
            end_of_send: default_terminator(),
            address_select_command: default_select_command(),
            address_query_command: None,
            commands: CommandCatalog::default(),
            instruments: InstrumentDirectory::default(),
        }
    }
}

struct PendingReply {
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct Session {
    writer: Option<WriteHalf<DynSerial>>,
    reader: Option<JoinHandle<()>>,
    pending: Option<PendingReply>,
    generation: u64,
    last_command: Option<Arc<CommandTemplate>>,
    last_instrument: Option<Arc<Instrument>>,
    last_response: Option<ResponseEvent>,
    buffer: String,
}

impl Session {
    fn disarm(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.timer.abort();
        }
    }

    fn close_transport(&mut self) -> Option<WriteHalf<DynSerial>> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.disarm();
        self.buffer.clear();
        self.writer.take()
    }
}

struct Shared {
    config: ControllerConfig,
    framer: Framer,
    poll_interval: Duration,
    connector: Arc<dyn Connector>,
    events: EventSink,
    errors: ErrorSink,
    session: Mutex<Session>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let _ = self.session.get_mut().close_transport();
    }
}

/// Protocol engine for one GPIB-to-serial adapter.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("name", &self.shared.config.name)
            .field("port", &self.shared.config.port.name)
            .finish()
    }
}

impl Controller {
    /// Create a disconnected controller.
    pub fn new(
        config: ControllerConfig,
        engine: &EngineSettings,
        connector: Arc<dyn Connector>,
        events: EventSink,
        errors: ErrorSink,
    ) -> Self {
        let framer = Framer::new(
            config.end_of_receive.clone(),
            config.permissive_end_of_receive,
        );
        Self {
            shared: Arc::new(Shared {
                config,
                framer,
                poll_interval: engine.poll_interval,
                connector,
                events,
                errors,
                session: Mutex::new(Session::default()),
            }),
        }
    }

    /// Controller name.
    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    /// Static definition.
    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// Resolve an instrument on this controller's bus.
    pub fn instrument(&self, name: &str) -> GpibResult<Arc<Instrument>> {
        self.shared.config.instruments.get(name).cloned()
    }

    /// Resolve a controller-level command.
    pub fn command(&self, name: &str) -> GpibResult<Arc<CommandTemplate>> {
        self.shared.config.commands.get(name).cloned()
    }

    /// Open the transport, closing any previous one first.
    ///
    /// Failure is reported to the error sink and leaves the controller unusable.
    pub async fn connect(&self) -> GpibResult<()> {
        self.shared.connect().await
    }

    /// Close the transport if open. Idempotent.
    pub async fn disconnect(&self) {
        let writer = self.shared.session.lock().await.close_transport();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
            info!("Controller '{}' disconnected", self.name());
        }
    }

    /// Whether a transport is open.
    pub async fn is_connected(&self) -> bool {
        self.shared.session.lock().await.writer.is_some()
    }

    /// Whether a reply deadline is armed.
    pub async fn is_busy(&self) -> bool {
        self.shared.session.lock().await.pending.is_some()
    }

    /// Send one command.
    ///
    /// Refused without touching the session when the controller is busy or the
    /// transport is closed. A write timeout is a recoverable [`SendError`].
    pub async fn send(&self, command: Arc<CommandTemplate>) -> Result<(), SendError> {
        self.shared.send(command).await
    }

    /// Sleep in poll-interval steps until not busy or `cancel` fires.
    ///
    /// Returns `true` when the controller went idle. Never blocks indefinitely:
    /// every armed deadline eventually clears busy.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        loop {
            if !self.is_busy().await {
                return true;
            }
            if cancel.is_cancelled() {
                return false;
            }
            tokio::time::sleep(self.shared.poll_interval).await;
        }
    }

    /// Route the bus to `instrument`.
    ///
    /// Returns `Ok(false)` without any traffic when the instrument is already
    /// selected, `Ok(true)` after a confirmed selection round-trip.
    pub async fn select_instrument(
        &self,
        instrument: &Arc<Instrument>,
        cancel: &CancellationToken,
    ) -> GpibResult<bool> {
        {
            let session = self.shared.session.lock().await;
            if session.pending.is_some() {
                return Err(SendError::Busy(self.name().to_string()).into());
            }
            if session.writer.is_none() {
                return Err(SendError::NotConnected(self.name().to_string()).into());
            }
            if session
                .last_instrument
                .as_ref()
                .is_some_and(|last| last.address == instrument.address)
            {
                return Ok(false);
            }
        }

        let config = &self.shared.config;
        let address = [instrument.address.to_string()];
        let mut last = Arc::new(
            config
                .commands
                .get(&config.address_select_command)?
                .parameterize(&address)?,
        );
        let unconfirmed = || GpibError::Selection {
            instrument: instrument.name.clone(),
            reply: None,
        };
        self.send(last.clone()).await?;
        if !self.wait(cancel).await {
            return Err(unconfirmed());
        }

        if let Some(query) = &config.address_query_command {
            last = Arc::new(config.commands.get(query)?.parameterize(&address)?);
            self.send(last.clone()).await?;
            if !self.wait(cancel).await {
                return Err(unconfirmed());
            }
        }

        let mut session = self.shared.session.lock().await;
        let reply = session.last_response.as_ref().map(|r| r.response.clone());
        let confirmed = match &last.expected_response {
            None => true,
            Some(expected) => reply.as_deref() == Some(expected.as_str()),
        };
        if !confirmed {
            return Err(GpibError::Selection {
                instrument: instrument.name.clone(),
                reply,
            });
        }
        debug!(
            "Controller '{}' selected '{}' at address {}",
            self.name(),
            instrument.name,
            instrument.address
        );
        session.last_instrument = Some(instrument.clone());
        Ok(true)
    }

    /// Most recent completed reply since the last send.
    pub async fn last_response(&self) -> Option<ResponseEvent> {
        self.shared.session.lock().await.last_response.clone()
    }

    /// Command awaiting its reply, if any.
    pub async fn last_command(&self) -> Option<Arc<CommandTemplate>> {
        self.shared.session.lock().await.last_command.clone()
    }

    /// Currently selected instrument.
    pub async fn last_instrument(&self) -> Option<Arc<Instrument>> {
        self.shared.session.lock().await.last_instrument.clone()
    }
}

impl Shared {
    fn emit_terminal(&self, direction: Direction, text: &str) {
        self.events.emit(ControllerEvent::Terminal {
            controller: self.config.name.clone(),
            direction,
            text: text.to_string(),
        });
    }

    async fn connect(self: &Arc<Self>) -> GpibResult<()> {
        let mut session = self.session.lock().await;
        if let Some(mut old) = session.close_transport() {
            let _ = old.shutdown().await;
        }

        let stream = match self.connector.open(&self.config.port).await {
            Ok(stream) => stream,
            Err(source) => {
                let err = GpibError::Connection {
                    port: self.config.port.name.clone(),
                    source,
                };
                self.errors.report(&self.config.name, &err, None);
                return Err(err);
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        session.reader = Some(spawn_reader(Arc::downgrade(self), reader));
        session.writer = Some(writer);
        info!(
            "Controller '{}' connected on '{}'",
            self.config.name, self.config.port.name
        );
        Ok(())
    }

    async fn send(self: &Arc<Self>, command: Arc<CommandTemplate>) -> Result<(), SendError> {
        let name = &self.config.name;
        let mut session = self.session.lock().await;
        if session.pending.is_some() {
            return Err(SendError::Busy(name.clone()));
        }
        if session.writer.is_none() {
            return Err(SendError::NotConnected(name.clone()));
        }

        let payload = format!("{}{}", command.command, self.config.end_of_send);
        let flush = command.command.len() * 2 < self.config.port.write_buffer_size;
        let write_timeout = self.config.port.write_timeout();
        let Some(writer) = session.writer.as_mut() else {
            return Err(SendError::NotConnected(name.clone()));
        };

        let written = tokio::time::timeout(write_timeout, async {
            writer.write_all(payload.as_bytes()).await?;
            if flush {
                writer.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        })
        .await;
        match written {
            Ok(Ok(())) => {}
            Err(_) => return Err(SendError::WriteTimeout(name.clone())),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
                return Err(SendError::WriteTimeout(name.clone()));
            }
            Ok(Err(source)) => {
                self.errors
                    .report(name, &source, Some(command.command.as_str()));
                return Err(SendError::Io {
                    controller: name.clone(),
                    source,
                });
            }
        }

        session.last_command = Some(command.clone());
        session.last_response = None;
        if command.await_response {
            session.generation = session.generation.wrapping_add(1);
            let generation = session.generation;
            let timer = spawn_timer(Arc::downgrade(self), generation, command.timeout());
            session.pending = Some(PendingReply { generation, timer });
        }
        drop(session);

        debug!("[{}] Sent command: {}", name, command.command);
        self.emit_terminal(Direction::Sent, &command.command);
        Ok(())
    }

    async fn on_data(&self, chunk: &str) {
        self.emit_terminal(Direction::Received, chunk);

        let mut session = self.session.lock().await;
        session.buffer.push_str(chunk);
        if !self.framer.is_complete(&session.buffer) {
            return;
        }

        session.disarm();
        let frame = self.framer.trim(&session.buffer).to_string();
        session.buffer.clear();

        let Some(command) = session.last_command.take() else {
            debug!("[{}] Discarding stray frame: {:?}", self.config.name, frame);
            return;
        };
        let response = match strip_response_prefix(&frame, command.response_prefix_length) {
            Some(reply) => reply.to_string(),
            None => {
                self.errors.report(
                    &self.config.name,
                    format!(
                        "Reply shorter than {}-character prefix",
                        command.response_prefix_length
                    ),
                    Some(frame.as_str()),
                );
                String::new()
            }
        };
        debug!("[{}] Received response: {}", self.config.name, response);

        let event = ResponseEvent {
            controller: self.config.name.clone(),
            instrument: session.last_instrument.clone(),
            command,
            response,
            timestamp: Local::now(),
        };
        session.last_response = Some(event.clone());
        drop(session);
        self.events.emit(ControllerEvent::Response(event));
    }

    async fn on_timeout(&self, generation: u64) {
        let mut session = self.session.lock().await;
        let armed = session
            .pending
            .as_ref()
            .is_some_and(|p| p.generation == generation);
        if !armed {
            return;
        }
        session.pending = None;
        session.buffer.clear();
        let command = session.last_command.take();
        let instrument = session.last_instrument.clone();
        drop(session);

        if let Some(command) = command {
            let err = GpibError::FrameTimeout {
                command: command.command.clone(),
                timeout_ms: command.timeout_ms,
            };
            self.errors.report(
                &self.config.name,
                &err,
                instrument.as_deref().map(|i| i.name.as_str()),
            );
            self.events.emit(ControllerEvent::Timeout(TimeoutEvent {
                controller: self.config.name.clone(),
                instrument,
                command,
            }));
        }
    }

    async fn on_read_error(&self, error: std::io::Error) {
        self.session.lock().await.buffer.clear();
        self.errors
            .report(&self.config.name, &error, Some("serial read"));
    }
}

fn spawn_timer(shared: Weak<Shared>, generation: u64, timeout: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if let Some(shared) = shared.upgrade() {
            shared.on_timeout(generation).await;
        }
    })
}

fn spawn_reader(shared: Weak<Shared>, mut reader: ReadHalf<DynSerial>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 1024];
        // bytes of a character split across reads
        let mut undecoded: Vec<u8> = Vec::new();
        loop {
            let read = reader.read(&mut buf).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            match read {
                Ok(0) => {
                    shared.errors.report(
                        &shared.config.name,
                        "Serial link closed by peer",
                        None,
                    );
                    return;
                }
                Ok(n) => {
                    undecoded.extend_from_slice(&buf[..n]);
                    let chunk = decode_complete(&mut undecoded);
                    if !chunk.is_empty() {
                        shared.on_data(&chunk).await;
                    }
                }
                Err(e) => {
                    shared.on_read_error(e).await;
                    return;
                }
            }
        }
    })
}

/// Decode the complete UTF-8 prefix of `bytes`, leaving an incomplete trailing
/// character in place. Invalid sequences become U+FFFD.
fn decode_complete(bytes: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        let error = match std::str::from_utf8(bytes) {
            Ok(text) => {
                out.push_str(text);
                bytes.clear();
                return out;
            }
            Err(e) => e,
        };
        let valid = error.valid_up_to();
        out.push_str(&String::from_utf8_lossy(&bytes[..valid]));
        match error.error_len() {
            None => {
                bytes.drain(..valid);
                return out;
            }
            Some(len) => {
                out.push(char::REPLACEMENT_CHARACTER);
                bytes.drain(..valid + len);
            }
        }
    }
}
