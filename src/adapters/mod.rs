//! Transport adapters
//!
//! Low-level I/O abstraction between a controller and its serial link.

pub mod mock;
pub mod serial_adapter;

pub use mock::{MemoryConnector, SimulatedBus};
pub use serial_adapter::{Connector, DynSerial, PortConfig, SerialConnector, SerialIo, SerialParity, StopBits};
