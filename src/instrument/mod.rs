//! Controller protocol engine and reply framing.

pub mod controller;
pub mod framing;

pub use controller::{Controller, ControllerConfig};
pub use framing::{strip_response_prefix, Framer};
