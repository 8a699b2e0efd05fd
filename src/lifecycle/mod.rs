//! Ownership of the long-running streams behind the manage modal.
//!
//! Each [`StreamKind`] has one slot holding at most one live run and a token
//! counter. Every start issues a new token; the forwarding task of a run tags
//! everything it delivers with the token it was started under, and deliveries
//! whose token is no longer current are dropped. Gate check and emit happen
//! under the same lock, so nothing from a superseded run is emitted once
//! `start` or `stop` has returned.

pub mod events;

use crate::runner::{CloseHandle, CommandRunner, RunHandle, RunOptions, Settled};
use chrono::{DateTime, Utc};
use events::{EventSink, EventType, LifecycleEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    LogFollow,
    Terminal,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::LogFollow, StreamKind::Terminal];
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::LogFollow => write!(f, "log follow"),
            StreamKind::Terminal => write!(f, "terminal"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Skip the `Disconnected` marker.
    pub silent: bool,
    /// Leave the token untouched; only used when a restart follows immediately.
    pub keep_token: bool,
}

impl StopOptions {
    pub fn silent() -> Self {
        Self { silent: true, keep_token: false }
    }

    pub fn announced() -> Self {
        Self { silent: false, keep_token: false }
    }
}

/// Snapshot of a session. The close handle never leaves the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub kind: StreamKind,
    pub token: u64,
    pub target: String,
    pub started_at: DateTime<Utc>,
}

/// Gate counters for one slot, reported by `manage_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub token: u64,
    pub active: bool,
    /// Chunks and outcomes dropped because their run had been superseded.
    pub discarded: u64,
}

#[derive(Debug)]
struct ActiveSession {
    info: SessionInfo,
    close: CloseHandle,
}

#[derive(Debug, Default)]
struct Slot {
    token: u64,
    active: Option<ActiveSession>,
    discarded: u64,
}

#[derive(Debug, Default)]
struct Slots {
    log_follow: Slot,
    terminal: Slot,
}

impl Slots {
    fn get(&self, kind: StreamKind) -> &Slot {
        match kind {
            StreamKind::LogFollow => &self.log_follow,
            StreamKind::Terminal => &self.terminal,
        }
    }

    fn get_mut(&mut self, kind: StreamKind) -> &mut Slot {
        match kind {
            StreamKind::LogFollow => &mut self.log_follow,
            StreamKind::Terminal => &mut self.terminal,
        }
    }
}

#[derive(Clone)]
pub struct StreamManager {
    runner: Arc<dyn CommandRunner>,
    sink: Arc<dyn EventSink>,
    slots: Arc<Mutex<Slots>>,
}

impl fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamManager").field("slots", &self.slots).finish_non_exhaustive()
    }
}

impl StreamManager {
    pub fn new(runner: Arc<dyn CommandRunner>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            runner,
            sink,
            slots: Arc::new(Mutex::new(Slots::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, kind: StreamKind, event: EventType, payload: Option<String>) {
        self.sink.emit(LifecycleEvent::new(kind, event, payload));
    }

    /// Replaces whatever `kind` is running with `argv`. Never blocks; output
    /// arrives through the event sink. A spawn failure is reported as an
    /// `Error` event and leaves the slot idle.
    #[instrument(skip_all, fields(kind = %kind, target = %target))]
    pub fn start(&self, kind: StreamKind, target: &str, argv: Vec<String>, options: &RunOptions) -> SessionInfo {
        let mut slots = self.lock();
        self.stop_locked(
            &mut slots,
            kind,
            StopOptions { silent: true, keep_token: true },
        );

        let slot = slots.get_mut(kind);
        slot.token += 1;
        let info = SessionInfo {
            kind,
            token: slot.token,
            target: target.to_string(),
            started_at: Utc::now(),
        };

        match self.runner.run(&argv, options) {
            Ok(RunHandle { chunks, settled, close }) => {
                slot.active = Some(ActiveSession {
                    info: info.clone(),
                    close,
                });
                info!(token = info.token, "Session started");
                self.emit(kind, EventType::Started, Some(argv.join(" ")));
                tokio::spawn(self.clone().forward(kind, info.token, chunks, settled));
            }
            Err(e) => {
                warn!(token = info.token, error = %e, "Session failed to start");
                self.emit(kind, EventType::Error, Some(e.to_string()));
            }
        }
        info
    }

    /// Ends the session of `kind`, if any. Returns whether one was active.
    #[instrument(skip_all, fields(kind = %kind, silent = opts.silent))]
    pub fn stop(&self, kind: StreamKind, opts: StopOptions) -> bool {
        let mut slots = self.lock();
        self.stop_locked(&mut slots, kind, opts)
    }

    /// Silently ends every session.
    pub fn shutdown(&self) {
        let mut slots = self.lock();
        for kind in StreamKind::ALL {
            self.stop_locked(&mut slots, kind, StopOptions::silent());
        }
    }

    fn stop_locked(&self, slots: &mut Slots, kind: StreamKind, opts: StopOptions) -> bool {
        let slot = slots.get_mut(kind);
        let Some(active) = slot.active.take() else {
            return false;
        };
        active.close.close();
        if !opts.keep_token {
            slot.token += 1;
        }
        debug!(token = active.info.token, silent = opts.silent, keep_token = opts.keep_token, "Session stopped");
        if !opts.silent {
            self.emit(kind, EventType::Disconnected, None);
        }
        true
    }

    async fn forward(
        self,
        kind: StreamKind,
        token: u64,
        mut chunks: mpsc::UnboundedReceiver<String>,
        settled: oneshot::Receiver<Settled>,
    ) {
        while let Some(chunk) = chunks.recv().await {
            self.deliver_chunk(kind, token, chunk);
        }
        let outcome = settled
            .await
            .unwrap_or_else(|_| Settled::Failed("stream ended without an exit status".to_string()));
        self.deliver_settled(kind, token, outcome);
    }

    /// Forwards `chunk` if `token` is still the live session of `kind`.
    pub fn deliver_chunk(&self, kind: StreamKind, token: u64, chunk: String) -> bool {
        let mut slots = self.lock();
        let slot = slots.get_mut(kind);
        if slot.token != token || slot.active.is_none() {
            slot.discarded += 1;
            debug!(kind = %kind, token, current = slot.token, "Discarding stale chunk");
            return false;
        }
        self.emit(kind, EventType::Chunk, Some(chunk));
        true
    }

    /// Applies a run's outcome if `token` is still the live session of `kind`.
    pub fn deliver_settled(&self, kind: StreamKind, token: u64, outcome: Settled) -> bool {
        let mut slots = self.lock();
        let slot = slots.get_mut(kind);
        if slot.token != token || slot.active.is_none() {
            slot.discarded += 1;
            debug!(kind = %kind, token, current = slot.token, outcome = ?outcome, "Discarding stale outcome");
            return false;
        }
        slot.active = None;
        match outcome {
            Settled::Success => {
                info!(kind = %kind, token, "Session finished");
                self.emit(kind, EventType::Finished, None);
            }
            Settled::Failed(message) => {
                info!(kind = %kind, token, error = %message, "Session failed");
                self.emit(kind, EventType::Error, Some(message));
            }
            Settled::Cancelled => {
                info!(kind = %kind, token, "Session cancelled by the runner");
                self.emit(kind, EventType::Disconnected, None);
            }
        }
        true
    }

    pub fn session(&self, kind: StreamKind) -> Option<SessionInfo> {
        self.lock().get(kind).active.as_ref().map(|a| a.info.clone())
    }

    pub fn stats(&self, kind: StreamKind) -> StreamStats {
        let slots = self.lock();
        let slot = slots.get(kind);
        StreamStats {
            token: slot.token,
            active: slot.active.is_some(),
            discarded: slot.discarded,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::events::{EventSink, LifecycleEvent};
    use std::time::Duration;
    use tokio::sync::mpsc;

    pub struct RecordingSink {
        tx: mpsc::UnboundedSender<LifecycleEvent>,
    }

    impl RecordingSink {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<LifecycleEvent>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { tx }, rx)
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, event: LifecycleEvent) {
            let _ = self.tx.send(event);
        }
    }

    pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<LifecycleEvent>) -> LifecycleEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within timeout")
            .expect("sink still open")
    }

    pub async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition within timeout");
    }
}
