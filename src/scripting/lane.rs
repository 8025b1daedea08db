//! Execution lanes.
//!
//! A lane walks its command list, handling three kinds of entries:
//!
//! - `delay=<ms>`: sleep, without the inter-command interval afterwards
//! - `var:<name>=<expression>`: update the lane's variable environment
//! - `controller[.instrument].command[(args)]`: select the instrument if any,
//!   send the command and wait for its reply
//!
//! The prefixes and the path delimiter come from [`EngineSettings`].
//!
//! A refused send (busy, closed, write timeout) or a failed selection is retried
//! up to the lane's budget. A busy refusal first waits for the controller to go
//! idle. Running out of attempts aborts the lane, unless the entry was the
//! last one of the list: then only the iteration ends. Resolution
//! and expression errors end the lane immediately and are reported through the
//! bench's error sink.

use super::bench::Bench;
use super::expression::Variables;
use super::path::CommandRef;
use crate::config::EngineSettings;
use crate::error::{GpibError, GpibResult, SendError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn default_timeout_retry() -> u32 {
    3
}

fn default_loop_count() -> i64 {
    1
}

fn default_interval_ms() -> u64 {
    1000
}

/// How a lane run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LaneOutcome {
    /// Every iteration ran to the end
    Completed,
    /// An entry other than the last ran out of send attempts
    Aborted,
    /// Cancellation was observed
    Cancelled,
    /// An unresolvable reference or malformed pseudo-command ended the lane
    Failed,
}

impl LaneOutcome {
    /// Whether the lane finished successfully.
    pub fn is_success(self) -> bool {
        self == LaneOutcome::Completed
    }
}

/// One independently scheduled command sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lane {
    /// Unique within the script
    pub name: String,
    /// Entries, executed in order
    #[serde(default)]
    pub commands: Vec<String>,
    /// Send attempts per entry
    #[serde(default = "default_timeout_retry")]
    pub timeout_retry: u32,
    /// Entry the first iteration starts at
    #[serde(default)]
    pub loop_index: usize,
    /// Iterations; negative repeats forever
    #[serde(default = "default_loop_count")]
    pub loop_count: i64,
    /// Pause after every non-delay entry
    #[serde(default = "default_interval_ms")]
    pub default_command_interval_ms: u64,
    /// Pause before the lane starts
    #[serde(default = "default_interval_ms")]
    pub start_delay_ms: u64,
}

impl Lane {
    /// Lane with the default budget and timing.
    pub fn new(name: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            name: name.into(),
            commands,
            timeout_retry: default_timeout_retry(),
            loop_index: 0,
            loop_count: default_loop_count(),
            default_command_interval_ms: default_interval_ms(),
            start_delay_ms: default_interval_ms(),
        }
    }

    /// Inter-command interval.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.default_command_interval_ms)
    }

    /// Startup delay.
    pub fn start_delay(&self) -> Duration {
        Duration::from_millis(self.start_delay_ms)
    }

    /// Run the lane to completion, abort or cancellation.
    ///
    /// Errors never escape: they are reported to the bench's error sink and
    /// turn into [`LaneOutcome::Failed`].
    pub async fn run(
        &self,
        bench: Arc<Bench>,
        engine: &EngineSettings,
        cancel: &CancellationToken,
    ) -> LaneOutcome {
        let mut run = LaneRun {
            lane: self,
            bench: &bench,
            engine,
            cancel,
            vars: Variables::new(),
        };
        match run.execute().await {
            Ok(outcome) => {
                info!("Lane '{}' finished: {:?}", self.name, outcome);
                outcome
            }
            Err((entry, e)) => {
                bench
                    .errors()
                    .report(&format!("lane {}", self.name), &e, Some(entry.as_str()));
                LaneOutcome::Failed
            }
        }
    }
}

/// What an entry asks of the command loop afterwards.
enum Step {
    /// Sleep the interval, then continue
    Next,
    /// Continue without the interval
    NextNoPause,
    /// Stop the iteration: attempts exhausted
    Abort,
}

struct LaneRun<'a> {
    lane: &'a Lane,
    bench: &'a Bench,
    engine: &'a EngineSettings,
    cancel: &'a CancellationToken,
    vars: Variables,
}

impl LaneRun<'_> {
    async fn execute(&mut self) -> Result<LaneOutcome, (String, GpibError)> {
        let lane = self.lane;
        if lane.commands.is_empty() {
            return Ok(LaneOutcome::Completed);
        }
        let mut remaining = lane.loop_count;
        let mut first = true;

        while lane.loop_count < 0 || remaining > 0 {
            remaining = remaining.saturating_sub(1);
            if self.cancel.is_cancelled() {
                return Ok(LaneOutcome::Cancelled);
            }

            let start = if first { lane.loop_index } else { 0 };
            let last = lane.commands.len() - 1;
            for (index, entry) in lane.commands.iter().enumerate().skip(start) {
                if self.cancel.is_cancelled() {
                    return Ok(LaneOutcome::Cancelled);
                }
                let step = self
                    .entry(entry)
                    .await
                    .map_err(|e| (entry.clone(), e))?;
                match step {
                    Step::Next => {
                        pause(lane.interval(), self.cancel).await;
                    }
                    Step::NextNoPause => {}
                    Step::Abort => {
                        if self.cancel.is_cancelled() {
                            return Ok(LaneOutcome::Cancelled);
                        }
                        if index == last {
                            // the iteration ends here anyway
                            warn!(
                                "Lane '{}' gave up on final entry '{}' after {} attempts",
                                lane.name, entry, lane.timeout_retry
                            );
                            break;
                        }
                        warn!(
                            "Lane '{}' gave up on '{}' after {} attempts",
                            lane.name, entry, lane.timeout_retry
                        );
                        return Ok(LaneOutcome::Aborted);
                    }
                }
            }
            first = false;
        }
        Ok(LaneOutcome::Completed)
    }

    async fn entry(&mut self, entry: &str) -> GpibResult<Step> {
        let engine = self.engine;
        if let Some(ms) = entry.strip_prefix(engine.delay_prefix.as_str()) {
            let ms: u64 = ms
                .trim()
                .parse()
                .map_err(|_| GpibError::Expression(entry.to_string()))?;
            pause(Duration::from_millis(ms), self.cancel).await;
            return Ok(Step::NextNoPause);
        }
        if let Some(statement) = entry.strip_prefix(engine.variable_prefix.as_str()) {
            let value = self.vars.assign(statement)?;
            debug!("Lane '{}' set {} -> {}", self.lane.name, statement, value);
            return Ok(Step::Next);
        }

        let text = self.vars.substitute(entry);
        let Some(reference) = CommandRef::parse(&text, &engine.path_delimiter) else {
            return Ok(Step::Next);
        };
        if self.send_with_retry(&reference).await? {
            Ok(Step::Next)
        } else {
            Ok(Step::Abort)
        }
    }

    /// Returns `false` when every attempt was refused.
    async fn send_with_retry(&self, reference: &CommandRef<'_>) -> GpibResult<bool> {
        let target = self.bench.resolve(reference)?;
        let command = match &reference.args {
            Some(args) => Arc::new(target.command.parameterize(args.as_slice())?),
            None => target.command.clone(),
        };
        let controller = &target.controller;

        for attempt in 1..=self.lane.timeout_retry {
            if self.cancel.is_cancelled() {
                break;
            }
            if let Some(instrument) = &target.instrument {
                match controller.select_instrument(instrument, self.cancel).await {
                    Ok(true) => pause(self.lane.interval(), self.cancel).await,
                    Ok(false) => {}
                    Err(e @ (GpibError::Send(_) | GpibError::Selection { .. })) => {
                        debug!(
                            "Lane '{}' attempt {}: selection failed: {}",
                            self.lane.name, attempt, e
                        );
                        if matches!(e, GpibError::Send(SendError::Busy(_))) {
                            controller.wait(self.cancel).await;
                        }
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            match controller.send(command.clone()).await {
                Ok(()) => {
                    controller.wait(self.cancel).await;
                    return Ok(true);
                }
                Err(e) => {
                    debug!(
                        "Lane '{}' attempt {}: send refused: {}",
                        self.lane.name, attempt, e
                    );
                    // another lane owns the controller; back off until it is idle
                    if matches!(e, SendError::Busy(_)) {
                        controller.wait(self.cancel).await;
                    }
                }
            }
        }
        Ok(false)
    }
}

/// Sleep for `duration` unless `cancel` fires first.
async fn pause(duration: Duration, cancel: &CancellationToken) {
    if duration.is_zero() {
        return;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = cancel.cancelled() => {}
    }
}
