//! Serial transport for GPIB-to-serial controller adapters.
//!
//! A controller talks to its adapter through a [`SerialIo`] stream obtained from a
//! [`Connector`]. The production connector, [`SerialConnector`], opens a real port
//! with `tokio-serial`; tests use the in-memory connector from
//! [`mock`](super::mock).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream to a controller adapter.
pub trait SerialIo: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> SerialIo for T {}

/// Boxed transport handed to a controller on connect.
pub type DynSerial = Box<dyn SerialIo>;

/// Parity modes for serial communication
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SerialParity {
    #[default]
    None,
    Even,
    Odd,
}

/// Stop bit count
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_data_bits() -> u8 {
    8
}

fn default_write_timeout_ms() -> u64 {
    500
}

fn default_write_buffer_size() -> usize {
    4096
}

/// Configuration for a serial port connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Path to the serial device (e.g., "/dev/ttyUSB0", "COM3")
    pub name: String,
    /// Baud rate (9600, 115200, etc.)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (5 to 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity setting
    #[serde(default)]
    pub parity: SerialParity,
    /// Stop bits
    #[serde(default)]
    pub stop_bits: StopBits,
    /// Deadline for a single write
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Size of the adapter's send buffer; small payloads are flushed immediately
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self::new("COM1")
    }
}

impl PortConfig {
    /// Port with default line settings (115200 8N1).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: SerialParity::None,
            stop_bits: StopBits::One,
            write_timeout_ms: default_write_timeout_ms(),
            write_buffer_size: default_write_buffer_size(),
        }
    }

    /// Write deadline as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Opens transports for controllers.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open the port described by `config`.
    async fn open(&self, config: &PortConfig) -> io::Result<DynSerial>;
}

/// Connector for real serial ports.
#[derive(Clone, Copy, Debug, Default)]
pub struct SerialConnector;

#[cfg(feature = "instrument_serial")]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, config: &PortConfig) -> io::Result<DynSerial> {
        use tokio_serial::SerialPortBuilderExt;

        let data_bits = match config.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Unsupported data bits: {other}"),
                ))
            }
        };
        let parity = match config.parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Even => tokio_serial::Parity::Even,
            SerialParity::Odd => tokio_serial::Parity::Odd,
        };
        let stop_bits = match config.stop_bits {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        };

        let port = tokio_serial::new(&config.name, config.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(io::Error::from)?;

        tracing::debug!(
            "Serial port '{}' opened at {} baud",
            config.name,
            config.baud_rate
        );
        Ok(Box::new(port))
    }
}

#[cfg(not(feature = "instrument_serial"))]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(&self, _config: &PortConfig) -> io::Result<DynSerial> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "Serial support not enabled. Rebuild with --features instrument_serial",
        ))
    }
}
