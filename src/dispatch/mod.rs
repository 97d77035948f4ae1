//! Batched command dispatch
//!
//! Reporting commands accumulate in an in-memory queue and leave the process
//! as one batch when the queue gets old enough, long enough, or a flush is
//! requested. Delivery is best-effort: a batch that exhausts its retries is
//! dropped with a warning, never re-enqueued, and the queue is cleared after
//! every flush regardless of outcome.
//!
//! [`Dispatcher`] is the synchronous core holding all queue and retry state;
//! [`worker`] wraps it in a dedicated task behind a bounded channel so the
//! host loop never blocks on network latency.

mod transport;
mod worker;

pub use transport::{BatchResponse, HttpTransport, RecordingTransport, Transport};
pub use worker::{spawn_dispatcher, DispatchHandle};

use std::time::Duration;

use tokio::time::Instant;

use chrono::{DateTime, Utc};
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

use crate::config::TelemetryConfig;
use crate::error::{Error, Result};

/// What a command reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A sampled metric data point
    Metric,
    /// A hyperparameter value
    Parameter,
    /// Host/system details
    SystemInfo,
    /// Captured stdout text
    Stdout,
}

impl EventKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Metric => "metric",
            Self::Parameter => "parameter",
            Self::SystemInfo => "system_info",
            Self::Stdout => "stdout",
        }
    }
}

/// The sampling axis a slot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleAxis {
    /// Batch-level iterations
    Batch,
    /// Epoch-level iterations
    Epoch,
}

/// Identity of a reporting slot within one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotKey {
    /// Axis the slot belongs to
    pub axis: SampleAxis,
    /// 1-based slot index within the axis budget
    pub slot: usize,
}

/// One queued reporting event. Immutable once enqueued.
///
/// Serializes as the wire triple `[kind, payload, iso_timestamp]`; the slot
/// key only drives in-queue overwrites and never leaves the process.
#[derive(Debug, Clone)]
pub struct Command {
    /// Event kind
    pub kind: EventKind,
    /// Kind-specific payload
    pub payload: serde_json::Value,
    /// Time the event was produced
    pub timestamp: DateTime<Utc>,
    /// Slot identity for sampled events
    pub slot: Option<SlotKey>,
}

impl Command {
    /// Create a command stamped with the current time.
    #[must_use]
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
            slot: None,
        }
    }

    /// Attach the slot identity of a sampled event.
    #[must_use]
    pub const fn with_slot(mut self, axis: SampleAxis, slot: usize) -> Self {
        self.slot = Some(SlotKey { axis, slot });
        self
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(self.kind.as_str())?;
        seq.serialize_element(&self.payload)?;
        seq.serialize_element(&self.timestamp.to_rfc3339())?;
        seq.end()
    }
}

/// One flushed batch as POSTed to the collector.
#[derive(Debug, Clone, Serialize)]
pub struct CommandBatch {
    /// Queued commands in order
    pub cmds: Vec<Command>,
    /// Session auth token
    pub token: String,
    /// Monotonic batch sequence number, starting at 0
    pub sequence: u64,
}

/// Callback invoked when the collector requests a stop.
pub type StopCallback = Box<dyn FnMut() + Send>;

/// The command queue with its flush, retry, and stop state.
pub struct Dispatcher {
    queue: Vec<Command>,
    queue_started: Option<Instant>,
    flush_requested: bool,
    sequence: u64,
    stopped: bool,
    token: String,
    flush_interval: Duration,
    keep_alive_interval: Duration,
    last_post: Instant,
    max_queue_len: usize,
    max_retries: u32,
    retry_interval: Duration,
    stop_callback: Option<StopCallback>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queue_len", &self.queue.len())
            .field("sequence", &self.sequence)
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher for a registered session.
    #[must_use]
    pub fn new(config: &TelemetryConfig, token: impl Into<String>) -> Self {
        Self {
            queue: Vec::new(),
            queue_started: None,
            flush_requested: false,
            sequence: 0,
            stopped: false,
            token: token.into(),
            flush_interval: config.dispatch_interval(),
            keep_alive_interval: config.keep_alive_interval(),
            last_post: Instant::now(),
            max_queue_len: config.max_queue_len,
            max_retries: config.max_retries,
            retry_interval: config.retry_interval(),
            stop_callback: None,
        }
    }

    /// Register the stop callback. When set, it wins over the
    /// [`Error::ExperimentStopped`] return path.
    pub fn set_stop_callback(&mut self, callback: StopCallback) {
        self.stop_callback = Some(callback);
    }

    /// Number of queued commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Sequence number the next batch will carry.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Whether the collector has requested a stop.
    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// The configured flush-age trigger.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    /// The configured idle keep-alive interval.
    #[must_use]
    pub const fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
    }

    /// Whether the session has been quiet long enough that the collector
    /// needs a keep-alive to keep it open.
    #[must_use]
    pub fn keep_alive_due(&self, now: Instant) -> bool {
        !self.stopped
            && self.queue.is_empty()
            && now.duration_since(self.last_post) > self.keep_alive_interval
    }

    /// Append a command, or overwrite in place when it targets a slot that
    /// already has a queued entry (the newer data point supersedes the one
    /// not yet shipped, keeping its relative position).
    ///
    /// After a stop this is an inert no-op.
    pub fn enqueue(&mut self, command: Command) {
        if self.stopped {
            tracing::debug!(kind = command.kind.as_str(), "session stopped, dropping command");
            return;
        }
        if let Some(key) = command.slot {
            if let Some(existing) = self
                .queue
                .iter_mut()
                .find(|queued| queued.slot == Some(key))
            {
                *existing = command;
                return;
            }
        }
        if self.queue.is_empty() {
            self.queue_started = Some(Instant::now());
        }
        self.queue.push(command);
    }

    /// Ask for a flush on the next service pass.
    pub fn request_flush(&mut self) {
        self.flush_requested = true;
    }

    /// Whether a flush is due at `now`: the queue is non-empty and older
    /// than the flush interval, or it hit the length bound, or a flush was
    /// explicitly requested.
    #[must_use]
    pub fn should_flush(&self, now: Instant) -> bool {
        if self.queue.is_empty() {
            return false;
        }
        if self.flush_requested || self.queue.len() >= self.max_queue_len {
            return true;
        }
        self.queue_started
            .is_some_and(|started| now.duration_since(started) > self.flush_interval)
    }

    /// Drain the queue into one batch and POST it.
    ///
    /// Transport failures are retried `max_retries` times with a fixed sleep
    /// in between; exhaustion drops the batch with a warning. The queue is
    /// cleared unconditionally, success or failure.
    ///
    /// # Errors
    ///
    /// [`Error::ExperimentStopped`] when the collector's response carries a
    /// stop indicator and no stop callback is registered. The callback,
    /// when present, is invoked instead and `Ok(())` is returned.
    pub async fn flush<T: Transport>(&mut self, transport: &T) -> Result<()> {
        self.flush_requested = false;
        if self.queue.is_empty() || self.stopped {
            return Ok(());
        }

        let batch = CommandBatch {
            cmds: std::mem::take(&mut self.queue),
            token: self.token.clone(),
            sequence: self.sequence,
        };
        self.queue_started = None;
        self.sequence += 1;

        let mut failures = 0;
        let response = loop {
            match transport.post_batch(&batch).await {
                Ok(response) => break response,
                Err(err) => {
                    failures += 1;
                    if failures > self.max_retries {
                        tracing::warn!(
                            sequence = batch.sequence,
                            commands = batch.cmds.len(),
                            error = %err,
                            "dropping batch after exhausting retries"
                        );
                        return Ok(());
                    }
                    tracing::debug!(
                        sequence = batch.sequence,
                        attempt = failures,
                        error = %err,
                        "batch POST failed, retrying"
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        };
        self.last_post = Instant::now();
        self.handle_response(&response)
    }

    /// Post an empty batch to keep the idle session open on the collector.
    ///
    /// Best-effort: a transport failure is logged and swallowed, the next
    /// due tick tries again.
    ///
    /// # Errors
    ///
    /// [`Error::ExperimentStopped`], as for [`flush`](Self::flush).
    pub async fn keep_alive<T: Transport>(&mut self, transport: &T) -> Result<()> {
        let batch = CommandBatch {
            cmds: Vec::new(),
            token: self.token.clone(),
            sequence: self.sequence,
        };
        self.sequence += 1;
        self.last_post = Instant::now();
        match transport.post_batch(&batch).await {
            Ok(response) => self.handle_response(&response),
            Err(err) => {
                tracing::debug!(error = %err, "keep-alive POST failed");
                Ok(())
            }
        }
    }

    /// Act on the collector's stop indicator: the registered callback wins
    /// over the error return path.
    fn handle_response(&mut self, response: &BatchResponse) -> Result<()> {
        if !response.stopped {
            return Ok(());
        }
        self.stopped = true;
        tracing::info!("collector requested experiment stop");
        if let Some(callback) = self.stop_callback.as_mut() {
            callback();
            return Ok(());
        }
        Err(Error::ExperimentStopped)
    }
}
