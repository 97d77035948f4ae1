//! Collector transport
//!
//! A [`Transport`] moves one serialized batch (or a session begin/end call)
//! to the remote collector. [`HttpTransport`] is the production
//! implementation; [`RecordingTransport`] captures traffic in memory for
//! tests and supports failure injection.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::session::{Session, SessionRequest};

use super::CommandBatch;

/// Collector response to a batch POST.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchResponse {
    /// True when the collector asks the experiment to stop
    #[serde(default)]
    pub stopped: bool,
}

/// Moves batches and session calls to the collector.
pub trait Transport: Send + Sync {
    /// POST one batch.
    fn post_batch(&self, batch: &CommandBatch)
        -> impl Future<Output = Result<BatchResponse>> + Send;

    /// Register a session, yielding the auth token for subsequent batches.
    fn begin_session(&self, req: &SessionRequest) -> impl Future<Output = Result<Session>> + Send;

    /// End the session identified by `token`.
    fn end_session(&self, token: &str) -> impl Future<Output = Result<()>> + Send;
}

impl<T: Transport> Transport for std::sync::Arc<T> {
    fn post_batch(
        &self,
        batch: &CommandBatch,
    ) -> impl Future<Output = Result<BatchResponse>> + Send {
        self.as_ref().post_batch(batch)
    }

    fn begin_session(&self, req: &SessionRequest) -> impl Future<Output = Result<Session>> + Send {
        self.as_ref().begin_session(req)
    }

    fn end_session(&self, token: &str) -> impl Future<Output = Result<()>> + Send {
        self.as_ref().end_session(token)
    }
}

/// HTTP transport against the collector's callback endpoints.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a transport for the given collector base URL.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Transport for HttpTransport {
    async fn post_batch(&self, batch: &CommandBatch) -> Result<BatchResponse> {
        let response = self
            .client
            .post(self.url("/callback/step"))
            .json(batch)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn begin_session(&self, req: &SessionRequest) -> Result<Session> {
        let response = self
            .client
            .post(self.url("/callback/begin"))
            .json(req)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    async fn end_session(&self, token: &str) -> Result<()> {
        self.client
            .post(self.url("/callback/end"))
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// In-memory transport for tests: records every delivered batch, can fail
/// the next N post attempts, and can answer a chosen sequence with
/// `stopped: true`.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    batches: Mutex<Vec<CommandBatch>>,
    attempts: AtomicU64,
    fail_remaining: AtomicU32,
    stop_on_sequence: Mutex<Option<u64>>,
}

impl RecordingTransport {
    /// Create an empty recording transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` post attempts fail with a transport error.
    pub fn fail_next(&self, n: u32) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Answer the batch with this sequence number with `stopped: true`.
    pub fn stop_on_sequence(&self, sequence: u64) {
        *self.stop_on_sequence.lock().unwrap() = Some(sequence);
    }

    /// All successfully delivered batches, in order.
    pub fn batches(&self) -> Vec<CommandBatch> {
        self.batches.lock().unwrap().clone()
    }

    /// Total post attempts, including failed ones.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    async fn post_batch(&self, batch: &CommandBatch) -> Result<BatchResponse> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Transport("injected failure".into()));
        }
        self.batches.lock().unwrap().push(batch.clone());
        let stopped = *self.stop_on_sequence.lock().unwrap() == Some(batch.sequence);
        Ok(BatchResponse { stopped })
    }

    async fn begin_session(&self, req: &SessionRequest) -> Result<Session> {
        Ok(Session {
            token: format!("test-token-{}", req.experiment_name),
            project_id: "test-project".into(),
            experiment_id: "test-experiment".into(),
            allow_source_tracking: false,
        })
    }

    async fn end_session(&self, _token: &str) -> Result<()> {
        Ok(())
    }
}
