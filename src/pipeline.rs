//! The telemetry client
//!
//! [`Telemetry`] wires the pieces together for a host training loop: scope
//! enter/exit feeds the [`ScopeStack`], reported metrics update the active
//! accumulator, iteration boundaries run through the per-axis
//! [`PointSampler`]s, and sampled points become commands on the dispatch
//! worker. The collector's stop request is surfaced cooperatively — through
//! the registered callback when one exists, otherwise as a single
//! [`Error::ExperimentStopped`] — after which reporting calls are inert.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::adapters::AdapterRegistry;
use crate::config::TelemetryConfig;
use crate::dispatch::{
    spawn_dispatcher, Command, DispatchHandle, Dispatcher, EventKind, SampleAxis, Transport,
};
use crate::error::{Error, Result};
use crate::sampler::PointSampler;
use crate::scope::{MetricValue, ScopeKind, ScopeStack};
use crate::session::{Session, SessionRequest};

/// Callback invoked once when the collector requests a stop.
pub type StopCallback = Box<dyn FnMut() + Send>;

/// Shared stop state between the dispatch worker and the host-facing client.
struct StopState {
    stopped: AtomicBool,
    surfaced: AtomicBool,
    callback: Mutex<Option<StopCallback>>,
}

impl StopState {
    fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            surfaced: AtomicBool::new(false),
            callback: Mutex::new(None),
        }
    }

    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.callback.lock() {
            if let Some(callback) = guard.as_mut() {
                if !self.surfaced.swap(true, Ordering::SeqCst) {
                    callback();
                }
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Client-side telemetry pipeline for one experiment session.
///
/// Single-threaded from the host's perspective: all scope and metric calls
/// come from the host loop's own call sequence, while network I/O runs on
/// the background dispatch worker.
pub struct Telemetry<T: Transport> {
    session: Session,
    transport: T,
    scopes: ScopeStack,
    batch_sampler: PointSampler,
    epoch_sampler: PointSampler,
    pending_batch: HashMap<String, f64>,
    pending_epoch: HashMap<String, f64>,
    dispatch: DispatchHandle,
    worker: JoinHandle<()>,
    stop: Arc<StopState>,
    registry: AdapterRegistry,
}

impl<T: Transport + Clone + 'static> Telemetry<T> {
    /// Register a session with the collector and start the dispatch worker.
    ///
    /// Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Invalid configuration, or a failed session registration.
    pub async fn start(
        config: TelemetryConfig,
        transport: T,
        experiment_name: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        let session = transport
            .begin_session(&SessionRequest::new(experiment_name))
            .await?;

        let stop = Arc::new(StopState::new());
        let mut dispatcher = Dispatcher::new(&config, session.token.clone());
        let state = Arc::clone(&stop);
        dispatcher.set_stop_callback(Box::new(move || state.mark_stopped()));

        let (dispatch, worker) = spawn_dispatcher(dispatcher, transport.clone());

        Ok(Self {
            session,
            transport,
            scopes: ScopeStack::new(),
            batch_sampler: PointSampler::new(config.batch_sample_budget),
            epoch_sampler: PointSampler::new(config.epoch_sample_budget),
            pending_batch: HashMap::new(),
            pending_epoch: HashMap::new(),
            dispatch,
            worker,
            stop,
            registry: AdapterRegistry::new(),
        })
    }

    /// The registered session.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// The client-owned framework adapter registry.
    pub fn adapters(&mut self) -> &mut AdapterRegistry {
        &mut self.registry
    }

    /// Whether the collector has requested a stop.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Register the stop callback. The callback wins over the
    /// [`Error::ExperimentStopped`] return path; registering after the stop
    /// already arrived invokes it immediately (once).
    pub fn on_stop(&self, callback: StopCallback) {
        if let Ok(mut guard) = self.stop.callback.lock() {
            *guard = Some(callback);
            if self.stop.is_stopped() && !self.stop.surfaced.swap(true, Ordering::SeqCst) {
                if let Some(cb) = guard.as_mut() {
                    cb();
                }
            }
        }
    }

    /// Enter a scope.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidNesting`] for a strict-scope violation.
    pub fn enter(&mut self, kind: ScopeKind) -> Result<()> {
        self.scopes.enter(kind)
    }

    /// Exit a scope, returning its final per-name averages.
    ///
    /// # Errors
    ///
    /// [`Error::ScopeMismatch`] when `kind` is not the innermost scope.
    pub fn exit(&mut self, kind: ScopeKind) -> Result<HashMap<String, MetricValue>> {
        self.scopes.exit(kind)
    }

    /// Report one metric observation into the active scope.
    ///
    /// Numeric values also become candidates for the batch/epoch samplers at
    /// the next iteration boundary. Inert after a stop.
    pub fn report_metric(&mut self, name: &str, value: impl Into<MetricValue>, is_custom: bool) {
        if self.stop.is_stopped() {
            tracing::debug!(metric = name, "session stopped, ignoring metric report");
            return;
        }
        let value = value.into();
        if let MetricValue::Number(v) = value {
            self.pending_batch.insert(name.to_string(), v);
            self.pending_epoch.insert(name.to_string(), v);
        }
        self.scopes.record_metric(name, value, is_custom);
    }

    /// Report a hyperparameter; enqueued directly, bypassing the samplers.
    pub fn report_parameter(&mut self, name: &str, value: serde_json::Value) {
        if self.stop.is_stopped() {
            tracing::debug!(parameter = name, "session stopped, ignoring parameter");
            return;
        }
        let payload = serde_json::json!({ "name": name, "value": value });
        self.dispatch
            .try_enqueue(Command::new(EventKind::Parameter, payload));
    }

    /// Report host/system details (hardware, library versions); enqueued
    /// directly, bypassing the samplers.
    pub fn report_system_info(&mut self, info: serde_json::Value) {
        if self.stop.is_stopped() {
            tracing::debug!("session stopped, ignoring system info");
            return;
        }
        self.dispatch
            .try_enqueue(Command::new(EventKind::SystemInfo, info));
    }

    /// Report one line of captured standard output.
    pub fn report_stdout(&mut self, line: &str) {
        if self.stop.is_stopped() {
            tracing::debug!("session stopped, ignoring stdout line");
            return;
        }
        let payload = serde_json::json!({ "line": line });
        self.dispatch
            .try_enqueue(Command::new(EventKind::Stdout, payload));
    }

    /// Close one batch iteration: run the metrics reported since the last
    /// boundary through the batch sampler and enqueue the sampled point.
    ///
    /// # Errors
    ///
    /// [`Error::ExperimentStopped`], once, when the collector requested a
    /// stop and no callback is registered.
    pub fn batch_end(&mut self, step: u64) -> Result<()> {
        self.check_stopped()?;
        let changed: Vec<(String, f64)> = self.pending_batch.drain().collect();
        let has_validation = self.scopes.take_validation_flag();
        Self::sample_and_enqueue(
            &mut self.batch_sampler,
            &self.dispatch,
            SampleAxis::Batch,
            step,
            &changed,
            has_validation,
        );
        Ok(())
    }

    /// Close one epoch iteration, sampling on the epoch axis.
    ///
    /// # Errors
    ///
    /// [`Error::ExperimentStopped`], once, as for [`batch_end`](Self::batch_end).
    pub fn epoch_end(&mut self, epoch: u64) -> Result<()> {
        self.check_stopped()?;
        let changed: Vec<(String, f64)> = self.pending_epoch.drain().collect();
        Self::sample_and_enqueue(
            &mut self.epoch_sampler,
            &self.dispatch,
            SampleAxis::Epoch,
            epoch,
            &changed,
            false,
        );
        Ok(())
    }

    fn sample_and_enqueue(
        sampler: &mut PointSampler,
        dispatch: &DispatchHandle,
        axis: SampleAxis,
        step: u64,
        changed: &[(String, f64)],
        has_validation: bool,
    ) {
        let borrowed: Vec<(&str, f64)> = changed
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
            .collect();
        let Some(slot) = sampler.observe(&borrowed) else {
            return;
        };
        let metrics: serde_json::Map<String, serde_json::Value> = changed
            .iter()
            .map(|(name, value)| (name.clone(), serde_json::json!(value)))
            .collect();
        let payload = serde_json::json!({
            "step": step,
            "metrics": metrics,
            "has_validation": has_validation,
        });
        dispatch.try_enqueue(Command::new(EventKind::Metric, payload).with_slot(axis, slot));
    }

    /// Flush the command queue now and wait for the attempt to finish.
    ///
    /// # Errors
    ///
    /// [`Error::ExperimentStopped`] surfaced from the flush, or
    /// [`Error::ChannelClosed`] when the worker is gone.
    pub async fn flush(&self) -> Result<()> {
        self.dispatch.flush().await?;
        self.check_stopped()
    }

    /// Flush the residue, stop the worker, and end the session.
    ///
    /// # Errors
    ///
    /// Transport failure on the session-end call.
    pub async fn end(self) -> Result<()> {
        // A stop discovered during the final flush is not an error here;
        // the session is ending either way.
        match self.dispatch.shutdown().await {
            Ok(()) | Err(Error::ExperimentStopped | Error::ChannelClosed) => {}
            Err(err) => return Err(err),
        }
        let _ = self.worker.await;
        self.transport.end_session(&self.session.token).await
    }

    /// Error path of the stop signal: fires once, only without a callback.
    fn check_stopped(&self) -> Result<()> {
        if !self.stop.is_stopped() {
            return Ok(());
        }
        let has_callback = self
            .stop
            .callback
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        if !has_callback && !self.stop.surfaced.swap(true, Ordering::SeqCst) {
            return Err(Error::ExperimentStopped);
        }
        tracing::debug!("session stopped, reporting call is a no-op");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::RecordingTransport;

    async fn telemetry() -> (Telemetry<Arc<RecordingTransport>>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let telemetry = Telemetry::start(
            TelemetryConfig::default(),
            Arc::clone(&transport),
            "unit-test",
        )
        .await
        .unwrap();
        (telemetry, transport)
    }

    #[tokio::test]
    async fn test_start_registers_session() {
        let (telemetry, _transport) = telemetry().await;
        assert_eq!(telemetry.session().token, "test-token-unit-test");
        telemetry.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_end_enqueues_sampled_point() {
        let (mut telemetry, transport) = telemetry().await;
        telemetry.enter(ScopeKind::Experiment).unwrap();
        telemetry.report_metric("loss", 0.5, false);
        telemetry.batch_end(1).unwrap();
        telemetry.flush().await.unwrap();

        let batches = transport.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].cmds.len(), 1);
        telemetry.exit(ScopeKind::Experiment).unwrap();
        telemetry.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_flag_reaches_payload() {
        let (mut telemetry, transport) = telemetry().await;
        telemetry.enter(ScopeKind::Experiment).unwrap();
        telemetry.enter(ScopeKind::EpochLoop).unwrap();
        telemetry.enter(ScopeKind::Validation).unwrap();
        telemetry.exit(ScopeKind::Validation).unwrap();

        telemetry.report_metric("val_loss", 0.3, false);
        telemetry.batch_end(1).unwrap();
        telemetry.flush().await.unwrap();

        let batches = transport.batches();
        let wire = serde_json::to_value(&batches[0].cmds[0]).unwrap();
        assert_eq!(wire[1]["has_validation"], true);
        telemetry.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_system_info_and_stdout_bypass_the_samplers() {
        let (mut telemetry, transport) = telemetry().await;
        telemetry.report_system_info(serde_json::json!({ "gpu": "A100", "ram_gb": 512 }));
        telemetry.report_stdout("epoch 1 complete");
        telemetry.flush().await.unwrap();

        let batches = transport.batches();
        assert_eq!(batches[0].cmds.len(), 2);
        assert_eq!(batches[0].cmds[0].kind, EventKind::SystemInfo);
        assert_eq!(batches[0].cmds[1].kind, EventKind::Stdout);
        assert_eq!(batches[0].cmds[1].payload["line"], "epoch 1 complete");
        telemetry.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_surfaces_once_then_inert() {
        let (mut telemetry, transport) = telemetry().await;
        transport.stop_on_sequence(0);

        telemetry.enter(ScopeKind::Experiment).unwrap();
        telemetry.report_metric("loss", 0.5, false);
        telemetry.batch_end(1).unwrap();

        let err = telemetry.flush().await.unwrap_err();
        assert!(matches!(err, Error::ExperimentStopped));
        assert!(telemetry.is_stopped());

        // Surfaced once: subsequent reporting calls are quiet no-ops.
        telemetry.report_metric("loss", 0.4, false);
        telemetry.batch_end(2).unwrap();
        telemetry.end().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_callback_wins() {
        let (mut telemetry, transport) = telemetry().await;
        transport.stop_on_sequence(0);

        let invoked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&invoked);
        telemetry.on_stop(Box::new(move || flag.store(true, Ordering::SeqCst)));

        telemetry.enter(ScopeKind::Experiment).unwrap();
        telemetry.report_metric("loss", 0.5, false);
        telemetry.batch_end(1).unwrap();

        // With a callback registered the flush does not error.
        telemetry.flush().await.unwrap();
        assert!(invoked.load(Ordering::SeqCst));
        telemetry.end().await.unwrap();
    }
}
