//! Script orchestration: launch every lane, watch completions, aggregate.

use super::bench::Bench;
use super::lane::{Lane, LaneOutcome};
use super::path::CommandRef;
use crate::config::EngineSettings;
use crate::error::{GpibError, GpibResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn default_script_name() -> String {
    "ExampleScript".to_string()
}

/// Overall result of a script run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// Every lane completed and nothing was cancelled
    Succeeded,
    /// At least one lane did not complete, or abort-on-error fired
    Failed,
    /// The caller cancelled the run
    Cancelled,
}

/// Outcome of a run with the per-lane details.
#[derive(Clone, Debug)]
pub struct ScriptReport {
    /// Aggregate outcome
    pub outcome: ScriptOutcome,
    /// Outcome of every lane, by name
    pub lanes: HashMap<String, LaneOutcome>,
}

/// A named set of lanes launched together.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Script {
    /// Script name, looked up by the loader
    #[serde(default = "default_script_name")]
    pub name: String,
    /// Cancel every lane once one fails
    #[serde(default)]
    pub terminate_all_threads_on_error: bool,
    /// Lanes
    #[serde(default, rename = "threads")]
    pub lanes: Vec<Lane>,
}

impl Script {
    /// Reject duplicate lane names.
    pub fn validate(&self) -> GpibResult<()> {
        let mut seen = HashSet::new();
        for lane in &self.lanes {
            if !seen.insert(lane.name.as_str()) {
                return Err(GpibError::ScriptValidation(format!(
                    "Duplicate lane name '{}' in script '{}'",
                    lane.name, self.name
                )));
            }
        }
        Ok(())
    }

    /// Distinct controller names referenced by any lane's command entries, in
    /// first-use order. Delay and variable pseudo-commands are skipped.
    pub fn required_controllers(&self, engine: &EngineSettings) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for entry in self.lanes.iter().flat_map(|l| l.commands.iter()) {
            if entry.starts_with(engine.delay_prefix.as_str())
                || entry.starts_with(engine.variable_prefix.as_str())
            {
                continue;
            }
            let Some(reference) = CommandRef::parse(entry, &engine.path_delimiter) else {
                continue;
            };
            let controller = reference.controller();
            if !names.iter().any(|n| n == controller) {
                names.push(controller.to_string());
            }
        }
        names
    }

    /// Run every lane and aggregate the outcomes.
    ///
    /// Lanes start staggered by their cumulative startup delays and may finish
    /// in any order. Cancelling `cancel` stops all lanes and yields
    /// [`ScriptOutcome::Cancelled`]; abort-on-error only cancels a token derived
    /// from it, so the two stay distinguishable.
    pub async fn run(
        &self,
        bench: Arc<Bench>,
        engine: &EngineSettings,
        cancel: &CancellationToken,
    ) -> GpibResult<ScriptReport> {
        self.validate()?;
        let lanes_token = cancel.child_token();
        info!(
            "Starting script '{}' with {} lanes",
            self.name,
            self.lanes.len()
        );

        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        let mut offset = Duration::ZERO;
        for lane in &self.lanes {
            offset += lane.start_delay();
            let lane = lane.clone();
            let bench = bench.clone();
            let engine = engine.clone();
            let token = lanes_token.clone();
            let name = lane.name.clone();
            let handle = tasks.spawn(async move {
                let outcome = tokio::select! {
                    _ = tokio::time::sleep(offset) => lane.run(bench, &engine, &token).await,
                    _ = token.cancelled() => LaneOutcome::Cancelled,
                };
                (lane.name, outcome)
            });
            names.insert(handle.id(), name);
        }

        let mut lanes = HashMap::new();
        let mut failed = false;
        while let Some(joined) = tasks.join_next().await {
            let (name, outcome) = joined_lane(&self.name, joined, &names);
            if !outcome.is_success() {
                failed = true;
                if self.terminate_all_threads_on_error
                    && outcome != LaneOutcome::Cancelled
                    && !lanes_token.is_cancelled()
                {
                    warn!(
                        "Lane '{}' ended with {:?}, cancelling remaining lanes",
                        name, outcome
                    );
                    lanes_token.cancel();
                }
            }
            lanes.insert(name, outcome);
        }

        let outcome = if cancel.is_cancelled() {
            ScriptOutcome::Cancelled
        } else if failed || lanes_token.is_cancelled() {
            ScriptOutcome::Failed
        } else {
            ScriptOutcome::Succeeded
        };
        info!("Script '{}' finished: {:?}", self.name, outcome);
        Ok(ScriptReport { outcome, lanes })
    }
}

/// Outcome of a joined lane task. A panicked task counts as a failed lane and
/// is attributed through its task id.
fn joined_lane(
    script: &str,
    joined: Result<(String, LaneOutcome), JoinError>,
    names: &HashMap<task::Id, String>,
) -> (String, LaneOutcome) {
    match joined {
        Ok(done) => done,
        Err(e) => {
            let name = names.get(&e.id()).cloned().unwrap_or_default();
            error!("Lane '{}' of script '{}' failed: {}", name, script, e);
            (name, LaneOutcome::Failed)
        }
    }
}
