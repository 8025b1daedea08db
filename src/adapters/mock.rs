//! In-memory transports for testing without hardware.
//!
//! - [`MemoryConnector`] hands controllers one end of a `tokio::io::duplex` link and
//!   keeps the other end for the test. Write failures and open failures can be
//!   injected.
//! - [`SimulatedBus`] sits on the device end of such a link and emulates a
//!   GPIB-to-serial adapter with instruments behind it: it tracks the selected
//!   address and answers from reply tables.

use super::serial_adapter::{Connector, DynSerial, PortConfig};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tracing::debug;

const LINK_CAPACITY: usize = 4096;

#[derive(Default)]
struct MemoryInner {
    devices: Mutex<VecDeque<DuplexStream>>,
    bus: Mutex<Option<SimulatedBus>>,
    fail_writes: Arc<AtomicUsize>,
    fail_open: AtomicBool,
    opened: AtomicUsize,
}

/// Connector producing in-memory links.
///
/// # Example
///
/// ```rust,ignore
/// let connector = MemoryConnector::new();
/// controller.connect().await?;
/// let mut device = connector.take_device().unwrap();
/// ```
#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<MemoryInner>,
}

impl MemoryConnector {
    /// Connector whose device ends are collected by [`take_device`](Self::take_device).
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that attaches a clone of `bus` to every opened link.
    pub fn with_bus(bus: SimulatedBus) -> Self {
        let connector = Self::default();
        if let Ok(mut slot) = connector.inner.bus.lock() {
            *slot = Some(bus);
        }
        connector
    }

    /// Device end of the oldest link not yet taken.
    pub fn take_device(&self) -> Option<DuplexStream> {
        self.inner.devices.lock().ok()?.pop_front()
    }

    /// Make the next `count` writes fail with a write timeout.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.fail_writes.store(count, Ordering::SeqCst);
    }

    /// Make every subsequent open fail.
    pub fn fail_open(&self, fail: bool) {
        self.inner.fail_open.store(fail, Ordering::SeqCst);
    }

    /// How many links were opened.
    pub fn open_count(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, config: &PortConfig) -> io::Result<DynSerial> {
        if self.inner.fail_open.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("No such port: {}", config.name),
            ));
        }
        let (host, device) = tokio::io::duplex(LINK_CAPACITY);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);

        let bus = self.inner.bus.lock().ok().and_then(|b| b.clone());
        match bus {
            Some(bus) => {
                bus.spawn(device);
            }
            None => {
                if let Ok(mut devices) = self.inner.devices.lock() {
                    devices.push_back(device);
                }
            }
        }

        Ok(Box::new(FlakyLink {
            inner: host,
            fail_writes: self.inner.fail_writes.clone(),
        }))
    }
}

/// Host end of an in-memory link with injectable write failures.
struct FlakyLink {
    inner: DuplexStream,
    fail_writes: Arc<AtomicUsize>,
}

impl AsyncRead for FlakyLink {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FlakyLink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let injected = self
            .fail_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "injected write timeout",
            )));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Emulated adapter with instruments behind it.
///
/// Lines starting with the address-select prefix change the selected address.
/// Lines starting with the controller prefix are answered from the controller
/// table; anything else from the selected instrument's table. Unknown lines get
/// no reply.
#[derive(Clone, Debug)]
pub struct SimulatedBus {
    address_select_prefix: String,
    controller_prefix: String,
    newline: String,
    reply_terminator: String,
    reply_delay: Duration,
    controller: HashMap<String, String>,
    instruments: HashMap<u32, HashMap<String, String>>,
    received: Arc<Mutex<Vec<String>>>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self {
            address_select_prefix: "++addr ".to_string(),
            controller_prefix: "++".to_string(),
            newline: "\r\n".to_string(),
            reply_terminator: "\r\n".to_string(),
            reply_delay: Duration::ZERO,
            controller: HashMap::new(),
            instruments: HashMap::new(),
            received: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl SimulatedBus {
    /// Bus using `++addr N` selection and CRLF line endings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `command` with `reply` at controller level.
    pub fn controller_reply(mut self, command: &str, reply: &str) -> Self {
        self.controller.insert(command.to_string(), reply.to_string());
        self
    }

    /// Answer `command` with `reply` while `address` is selected.
    pub fn instrument_reply(mut self, address: u32, command: &str, reply: &str) -> Self {
        self.instruments
            .entry(address)
            .or_default()
            .insert(command.to_string(), reply.to_string());
        self
    }

    /// Terminator appended to every reply.
    pub fn with_reply_terminator(mut self, terminator: &str) -> Self {
        self.reply_terminator = terminator.to_string();
        self
    }

    /// Pause before every reply.
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    /// Every line received so far, across all links.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Serve `stream` until the host end closes.
    pub fn spawn(&self, stream: DuplexStream) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.serve(stream).await {
                debug!("Simulated bus stopped: {}", e);
            }
        })
    }

    async fn serve(self, mut stream: DuplexStream) -> io::Result<()> {
        let mut pending = String::new();
        let mut selected: Option<u32> = None;
        let mut buf = [0u8; 256];

        loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            pending.push_str(&String::from_utf8_lossy(&buf[..n]));

            while let Some(idx) = pending.find(&self.newline) {
                let line: String = pending[..idx].to_string();
                pending.drain(..idx + self.newline.len());
                if let Ok(mut received) = self.received.lock() {
                    received.push(line.clone());
                }

                if let Some(addr) = line.strip_prefix(&self.address_select_prefix) {
                    selected = addr.trim().parse().ok();
                    continue;
                }
                let reply = if line.starts_with(&self.controller_prefix) {
                    self.controller.get(&line)
                } else {
                    selected
                        .and_then(|a| self.instruments.get(&a))
                        .and_then(|table| table.get(&line))
                };
                if let Some(reply) = reply {
                    if !self.reply_delay.is_zero() {
                        tokio::time::sleep(self.reply_delay).await;
                    }
                    let payload = format!("{}{}", reply, self.reply_terminator);
                    stream.write_all(payload.as_bytes()).await?;
                    stream.flush().await?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bus_answers_selected_instrument() {
        let bus = SimulatedBus::new()
            .controller_reply("++ver", "Adapter 1.0")
            .instrument_reply(5, "*IDN?", "DMM");
        let (mut host, device) = tokio::io::duplex(256);
        bus.spawn(device);

        host.write_all(b"++ver\r\n").await.unwrap();
        let mut buf = [0u8; 64];
        let n = host.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Adapter 1.0\r\n");

        host.write_all(b"++addr 5\r\n*IDN?\r\n").await.unwrap();
        let n = host.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"DMM\r\n");

        assert_eq!(bus.received(), vec!["++ver", "++addr 5", "*IDN?"]);
    }

    #[tokio::test]
    async fn memory_connector_injects_write_failures() {
        let connector = MemoryConnector::new();
        let mut link = connector.open(&PortConfig::new("mem")).await.unwrap();
        assert_eq!(connector.open_count(), 1);
        let _device = connector.take_device().unwrap();

        connector.fail_next_writes(1);
        let err = link.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        link.write_all(b"x").await.unwrap();
    }

    #[tokio::test]
    async fn memory_connector_open_failure() {
        let connector = MemoryConnector::new();
        connector.fail_open(true);
        assert!(connector.open(&PortConfig::new("mem")).await.is_err());
    }
}
