use super::StreamKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Started,
    Chunk,
    Finished,
    Disconnected,
    Error,
}

/// What the panel needs to reflect a session transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub kind: StreamKind,
    pub event: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl LifecycleEvent {
    pub fn new(kind: StreamKind, event: EventType, payload: Option<String>) -> Self {
        Self { kind, event, payload }
    }
}

/// Receiver of lifecycle events. Implementations must not block and must not
/// call back into the stream manager.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, event: LifecycleEvent);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequencedEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

#[derive(Debug, Serialize)]
pub struct EventsPage {
    pub events: Vec<SequencedEvent>,
    /// Pass back as `since` to continue where this page ended.
    pub next: u64,
    /// True when events after `since` were already evicted from the buffer.
    pub truncated: bool,
}

#[derive(Debug, Default)]
struct HubState {
    last_seq: u64,
    buffer: VecDeque<SequencedEvent>,
}

/// Sequences lifecycle events, keeps the most recent ones for polling clients
/// and fans them out to streaming subscribers.
#[derive(Debug)]
pub struct EventHub {
    state: Mutex<HubState>,
    capacity: usize,
    tx: broadcast::Sender<SequencedEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            state: Mutex::new(HubState::default()),
            capacity,
            tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequencedEvent> {
        self.tx.subscribe()
    }

    pub fn read_since(&self, since: u64) -> EventsPage {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let events: Vec<SequencedEvent> = state
            .buffer
            .iter()
            .filter(|e| e.seq > since)
            .cloned()
            .collect();
        let oldest = state
            .buffer
            .front()
            .map(|e| e.seq)
            .unwrap_or(state.last_seq.saturating_add(1));
        EventsPage {
            truncated: since.saturating_add(1) < oldest,
            next: state.last_seq.max(since),
            events,
        }
    }
}

impl EventSink for EventHub {
    fn emit(&self, event: LifecycleEvent) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_seq += 1;
        let sequenced = SequencedEvent {
            seq: state.last_seq,
            at: Utc::now(),
            event,
        };
        trace!(seq = sequenced.seq, kind = ?sequenced.event.kind, event = ?sequenced.event.event, "Publishing lifecycle event");
        state.buffer.push_back(sequenced.clone());
        while state.buffer.len() > self.capacity {
            state.buffer.pop_front();
        }
        // No subscribers is fine; pollers still see the buffer.
        let _ = self.tx.send(sequenced);
    }
}
