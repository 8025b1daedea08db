//! Script execution engine.
//!
//! A [`Script`] is a set of [`Lane`]s launched together against a [`Bench`] of
//! controllers and instrument catalogs. Each lane runs in its own task; lanes
//! sharing a controller arbitrate through the controller's busy check alone.
//!
//! # Architecture
//!
//! ```text
//! Script::run
//!     ├── Lane task ──┐
//!     ├── Lane task ──┼── Bench::resolve ── Controller::select_instrument
//!     └── Lane task ──┘                     Controller::send / wait
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gpib_daq::scripting::{Bench, Script, ScriptOutcome};
//!
//! let script: Script = serde_json::from_str(&json)?;
//! let report = script.run(Arc::new(bench), &settings.engine, &cancel).await?;
//! assert_eq!(report.outcome, ScriptOutcome::Succeeded);
//! ```

pub mod bench;
pub mod expression;
pub mod lane;
pub mod path;
pub mod script;

pub use bench::{Bench, Resolved};
pub use expression::{format_significant, Variables};
pub use lane::{Lane, LaneOutcome};
pub use path::CommandRef;
pub use script::{Script, ScriptOutcome, ScriptReport};
