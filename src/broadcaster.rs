use crate::models::{DashboardEvent, RunDetail, StreamEnvelope};
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkError {
    /// The subscriber is alive but its queue is full; this event is skipped.
    Full,
    /// The subscriber is gone and will be unregistered.
    Closed,
}

/// Transport seam for one connected client.
pub trait EventSink: Send {
    fn deliver(&self, envelope: &StreamEnvelope) -> Result<(), SinkError>;
}

impl EventSink for mpsc::Sender<StreamEnvelope> {
    fn deliver(&self, envelope: &StreamEnvelope) -> Result<(), SinkError> {
        self.try_send(envelope.clone()).map_err(|error| match error {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

pub type SubscriberId = u64;

/// Fan-out to the current set of subscribers.
///
/// Delivery is best effort and never reports failure to the publisher. A sink that
/// reports `Closed` is dropped on the spot; a `Full` sink just misses the event.
#[derive(Default)]
pub struct OutputBroadcaster {
    subscribers: BTreeMap<SubscriberId, Box<dyn EventSink>>,
    next_subscriber: SubscriberId,
    next_seq: u64,
}

impl OutputBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `sink` after handing it the snapshot of in-flight runs. A sink that
    /// cannot take the snapshot is never registered.
    pub fn subscribe(&mut self, sink: Box<dyn EventSink>, active_runs: Vec<RunDetail>) -> SubscriberId {
        let id = self.next_subscriber;
        self.next_subscriber += 1;

        let snapshot = self.envelope(DashboardEvent::ActiveRunsSnapshot { runs: active_runs });
        match sink.deliver(&snapshot) {
            Ok(()) => {
                self.subscribers.insert(id, sink);
                tracing::info!(subscriber = id, "subscriber connected");
            }
            Err(error) => {
                tracing::debug!(subscriber = id, ?error, "subscriber rejected snapshot; not registered");
            }
        }
        id
    }

    /// Idempotent.
    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            tracing::info!(subscriber = id, "subscriber disconnected");
        }
        removed
    }

    /// Returns how many subscribers accepted the event.
    pub fn publish(&mut self, event: DashboardEvent) -> usize {
        let envelope = self.envelope(event);
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, sink) in &self.subscribers {
            match sink.deliver(&envelope) {
                Ok(()) => delivered += 1,
                Err(SinkError::Full) => {
                    tracing::debug!(
                        subscriber = id,
                        run_id = ?envelope.event.run_id(),
                        event = envelope.event.kind(),
                        "subscriber queue full; event skipped"
                    );
                }
                Err(SinkError::Closed) => closed.push(*id),
            }
        }

        for id in closed {
            self.subscribers.remove(&id);
            tracing::info!(subscriber = id, "dropped closed subscriber");
        }

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn envelope(&mut self, event: DashboardEvent) -> StreamEnvelope {
        let seq = self.next_seq;
        self.next_seq += 1;
        StreamEnvelope {
            seq,
            timestamp: Utc::now(),
            event,
        }
    }
}
