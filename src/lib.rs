//! Core library for the GPIB controller server.
//!
//! Laboratory instruments sit behind GPIB-to-serial controller adapters. This
//! crate drives them from scripts and records their replies:
//!
//! - [`instrument`]: the per-controller protocol engine (framing, single
//!   in-flight command, reply deadlines, instrument selection)
//! - [`scripting`]: lanes running command sequences concurrently against shared
//!   controllers, and the script orchestrator
//! - [`data`]: the output pipeline writing records to keyed files and a
//!   broadcast channel
//!
//! Definitions are plain JSON ([`loader`]); settings come from TOML and the
//! environment ([`config`]). The `gpib-server` binary wires everything together
//! through [`app::Runner`].

pub mod adapters;
pub mod app;
pub mod catalog;
pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod loader;
pub mod logging;
pub mod messages;
pub mod scripting;
