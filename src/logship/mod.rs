//! Log shipping over a private loopback socket
//!
//! The shipper intercepts the process's ordinary log output and relays it to
//! the collector without ever blocking the host: records pass a per-logger
//! prefix filter, go over an in-process channel to a background task, and
//! leave through a loopback socket served to a forked forwarder process.
//! Until a forwarder connects, records sit in a bounded buffer (oldest
//! evicted); on connect the buffer drains in original order before any newer
//! record. Shutdown sends a zero-length frame and half-closes the write
//! side; the forwarder exits on end-of-stream or when the parent process
//! disappears.

mod filter;
mod frame;
mod layer;

pub mod forwarder;

pub use filter::LevelFilter;
pub use frame::{read_frame, write_end_frame, write_frame, write_raw_frame};
pub use layer::ShipperLayer;

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::TelemetryConfig;
use crate::error::Result;

/// Severity of a log record, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail
    Debug,
    /// Routine information
    Info,
    /// Something unexpected but recoverable
    Warning,
    /// A failed operation
    Error,
    /// The process cannot continue
    Critical,
}

impl LogLevel {
    /// Lowercase wire name of the level.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s.to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" | "err" => Ok(Self::Error),
            "critical" | "fatal" => Ok(Self::Critical),
            _ => Err(()),
        }
    }
}

/// One log record as shipped to the collector.
///
/// The logger name drives filtering only and stays out of the wire frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogRecord {
    /// Severity
    pub level: LogLevel,
    /// Dot-separated logger name (not serialized)
    #[serde(skip)]
    pub logger: String,
    /// Log message text
    pub message: String,
    /// Record category (e.g. "log", "stdout")
    pub category: String,
    /// Emission time, ISO-8601 with an explicit UTC offset
    #[serde(serialize_with = "serialize_ts")]
    pub ts: DateTime<FixedOffset>,
}

/// chrono's default formatting writes `Z` at offset zero; the collector
/// expects an explicit `+00:00`.
fn serialize_ts<S: serde::Serializer>(
    ts: &DateTime<FixedOffset>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::AutoSi, false))
}

impl LogRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(
        level: LogLevel,
        logger: impl Into<String>,
        message: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            level,
            logger: logger.into(),
            message: message.into(),
            category: category.into(),
            ts: Utc::now().fixed_offset(),
        }
    }
}

enum ShipperMsg {
    Record(LogRecord),
    Shutdown,
}

/// How often a shipper without a forwarder process repeats its warning.
const DEGRADED_WARN_INTERVAL: Duration = Duration::from_secs(60);

/// The log-shipping subsystem: loopback listener, pre-connect buffer, and
/// the forked forwarder process.
pub struct LogShipper {
    tx: mpsc::UnboundedSender<ShipperMsg>,
    filter: LevelFilter,
    local_port: u16,
    task: Mutex<Option<JoinHandle<()>>>,
    forwarder: std::sync::Mutex<Option<std::process::Child>>,
}

impl fmt::Debug for LogShipper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogShipper")
            .field("local_port", &self.local_port)
            .finish_non_exhaustive()
    }
}

impl LogShipper {
    /// Bind the loopback listener and fork the forwarder process.
    ///
    /// A forwarder that fails to spawn degrades the shipper to buffering
    /// (bounded) with a warning; the host is never crashed over it.
    ///
    /// # Errors
    ///
    /// Socket bind failure or an unparseable filter string.
    pub async fn activate(config: &TelemetryConfig) -> Result<Self> {
        Self::activate_inner(config, true).await
    }

    /// Bind the listener without forking a forwarder.
    ///
    /// For hosts (and tests) that connect their own relay to
    /// [`local_port`](Self::local_port).
    ///
    /// # Errors
    ///
    /// Socket bind failure or an unparseable filter string.
    pub async fn activate_detached(config: &TelemetryConfig) -> Result<Self> {
        Self::activate_inner(config, false).await
    }

    async fn activate_inner(config: &TelemetryConfig, fork_forwarder: bool) -> Result<Self> {
        let filter = LevelFilter::from_entries(LogLevel::Info, &config.parsed_log_filters()?);
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_port = listener.local_addr()?.port();

        let forwarder = if fork_forwarder {
            match forwarder::spawn(&config.endpoint, local_port, std::process::id()) {
                Ok(child) => Some(child),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "failed to spawn log forwarder, buffering locally"
                    );
                    None
                }
            }
        } else {
            None
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let capacity = config.log_buffer_capacity;
        let degraded = fork_forwarder && forwarder.is_none();
        let task = tokio::spawn(shipper_loop(listener, rx, capacity, degraded));

        Ok(Self {
            tx,
            filter,
            local_port,
            task: Mutex::new(Some(task)),
            forwarder: std::sync::Mutex::new(forwarder),
        })
    }

    /// Port of the loopback listener the forwarder connects to.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Ship one record, subject to the per-logger level filter.
    ///
    /// Never blocks; after shutdown the record is silently dropped.
    pub fn ship(&self, record: LogRecord) {
        if !self.filter.allows(&record.logger, record.level) {
            return;
        }
        let _ = self.tx.send(ShipperMsg::Record(record));
    }

    /// Send the termination frame, half-close the socket, and stop the
    /// background task. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(ShipperMsg::Shutdown);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        let child = self
            .forwarder
            .lock()
            .ok()
            .and_then(|mut guard| guard.take());
        if let Some(child) = child {
            reap_forwarder(child);
        }
    }
}

/// Background task: accepts the forwarder connection and swaps between the
/// pre-connect buffer and direct socket writes.
async fn shipper_loop(
    listener: TcpListener,
    mut rx: mpsc::UnboundedReceiver<ShipperMsg>,
    capacity: usize,
    mut degraded: bool,
) {
    let mut buffer: VecDeque<LogRecord> = VecDeque::new();
    let mut conn: Option<OwnedWriteHalf> = None;
    let mut eviction_warned = false;
    let mut degraded_warn = tokio::time::interval(DEGRADED_WARN_INTERVAL);
    degraded_warn.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(ShipperMsg::Record(record)) => {
                    if let Some(writer) = conn.as_mut() {
                        if let Err(err) = frame::write_frame(writer, &record).await {
                            tracing::warn!(error = %err, "forwarder write failed, re-buffering");
                            conn = None;
                            eviction_warned = false;
                            push_bounded(&mut buffer, record, capacity, &mut eviction_warned);
                        }
                    } else {
                        push_bounded(&mut buffer, record, capacity, &mut eviction_warned);
                    }
                }
                Some(ShipperMsg::Shutdown) | None => {
                    if conn.is_none() && !buffer.is_empty() {
                        // Last-chance zero-timeout poll for a forwarder that
                        // connected but was not yet accepted.
                        if let Ok(Ok((stream, _))) = tokio::time::timeout(
                            std::time::Duration::ZERO,
                            listener.accept(),
                        )
                        .await
                        {
                            let (_read_half, mut writer) = stream.into_split();
                            if drain_buffer(&mut buffer, &mut writer).await {
                                conn = Some(writer);
                            }
                        }
                    }
                    if let Some(mut writer) = conn.take() {
                        let _ = frame::write_end_frame(&mut writer).await;
                        let _ = tokio::io::AsyncWriteExt::shutdown(&mut writer).await;
                    }
                    break;
                }
            },
            accepted = listener.accept(), if conn.is_none() => {
                if let Ok((stream, peer)) = accepted {
                    tracing::debug!(%peer, "log forwarder connected");
                    let (_read_half, mut writer) = stream.into_split();
                    degraded = false;
                    if drain_buffer(&mut buffer, &mut writer).await {
                        eviction_warned = false;
                        conn = Some(writer);
                    }
                }
            }
            _ = degraded_warn.tick(), if degraded && conn.is_none() => {
                tracing::warn!(
                    buffered = buffer.len(),
                    "log forwarder unavailable, records buffered locally"
                );
            }
        }
    }
}

/// Collect the forwarder child's exit status so it never lingers as a
/// zombie. A child still relaying its tail is waited on from the blocking
/// pool.
fn reap_forwarder(mut child: std::process::Child) {
    match child.try_wait() {
        Ok(Some(status)) => tracing::debug!(%status, "log forwarder exited"),
        Ok(None) => {
            tokio::task::spawn_blocking(move || {
                let _ = child.wait();
            });
        }
        Err(err) => tracing::debug!(error = %err, "failed to reap log forwarder"),
    }
}

/// Flush the pre-connect buffer in original order. Returns false (leaving
/// the unwritten tail buffered) when the socket fails mid-drain.
async fn drain_buffer(buffer: &mut VecDeque<LogRecord>, writer: &mut OwnedWriteHalf) -> bool {
    while let Some(record) = buffer.pop_front() {
        if let Err(err) = frame::write_frame(writer, &record).await {
            tracing::warn!(error = %err, "forwarder write failed during drain");
            buffer.push_front(record);
            return false;
        }
    }
    true
}

fn push_bounded(
    buffer: &mut VecDeque<LogRecord>,
    record: LogRecord,
    capacity: usize,
    warned: &mut bool,
) {
    if buffer.len() >= capacity {
        buffer.pop_front();
        if !*warned {
            tracing::warn!(capacity, "log buffer full, evicting oldest records");
            *warned = true;
        }
    }
    buffer.push_back(record);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warning);
        assert!(LogLevel::Warning < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Critical);
    }

    #[test]
    fn test_level_parse_aliases() {
        assert_eq!("WARN".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warning));
        assert_eq!("fatal".parse::<LogLevel>(), Ok(LogLevel::Critical));
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_record_wire_shape_omits_logger() {
        let record = LogRecord::new(LogLevel::Error, "trainer.io", "disk full", "log");
        let wire = serde_json::to_value(&record).unwrap();
        let object = wire.as_object().unwrap();
        assert_eq!(object.len(), 4);
        assert_eq!(object["level"], "error");
        assert_eq!(object["message"], "disk full");
        assert_eq!(object["category"], "log");
        assert!(!object.contains_key("logger"));
    }

    #[test]
    fn test_timestamp_carries_explicit_utc_offset() {
        let record = LogRecord::new(LogLevel::Info, "trainer", "tick", "log");
        let wire = serde_json::to_value(&record).unwrap();
        let ts = wire["ts"].as_str().unwrap();
        assert!(ts.ends_with("+00:00"), "got {ts}");
        assert!(!ts.ends_with('Z'));
        // The wire form parses back to the same instant.
        let back: LogRecord = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(back.ts, record.ts);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reap_collects_exited_child() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        while child.try_wait().unwrap().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Status is already cached; the reap must not panic or block.
        reap_forwarder(child);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let shipper = LogShipper::activate_detached(&TelemetryConfig::default())
            .await
            .unwrap();
        shipper.shutdown().await;
        shipper.shutdown().await;
    }
}
