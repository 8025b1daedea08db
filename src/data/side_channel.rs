//! Broadcast side channel for external subscribers.

use crate::messages::ResponseEvent;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Structured form of a recorded response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePacket {
    /// Receipt time
    pub timestamp: DateTime<Local>,
    /// Controller name
    pub controller: String,
    /// Instrument name, empty for controller-level commands
    pub instrument: String,
    /// Command text as sent
    pub command: String,
    /// Reply text
    pub response: String,
}

impl From<&ResponseEvent> for ResponsePacket {
    fn from(event: &ResponseEvent) -> Self {
        Self {
            timestamp: event.timestamp,
            controller: event.controller.clone(),
            instrument: event.instrument_name().to_string(),
            command: event.command.command.clone(),
            response: event.response.clone(),
        }
    }
}

impl ResponsePacket {
    /// JSON encoding used on external links.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Task converting queued events into packets on a broadcast sender.
#[derive(Debug)]
pub struct SideChannel {
    queue: mpsc::UnboundedSender<ResponseEvent>,
    sender: broadcast::Sender<ResponsePacket>,
    task: JoinHandle<()>,
}

impl SideChannel {
    /// Start the side channel with room for `capacity` packets per subscriber.
    pub fn spawn(capacity: usize, cancel: CancellationToken) -> Self {
        let (queue, mut rx) = mpsc::unbounded_channel::<ResponseEvent>();
        let (sender, _) = broadcast::channel(capacity.max(1));
        let out = sender.clone();
        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                // no subscribers is not an error
                if out.send(ResponsePacket::from(&event)).is_err() {
                    trace!("No broadcast subscribers");
                }
            }
        });
        Self {
            queue,
            sender,
            task,
        }
    }

    /// Queue an event for broadcasting.
    pub fn publish(&self, event: ResponseEvent) {
        let _ = self.queue.send(event);
    }

    /// New subscriber receiving packets published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ResponsePacket> {
        self.sender.subscribe()
    }

    /// Close the queue and wait for the task to exit.
    pub async fn join(self) {
        drop(self.queue);
        let _ = self.task.await;
    }
}
