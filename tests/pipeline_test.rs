//! End-to-end pipeline tests: host loop through sampling and dispatch
//!
//! Drives [`Telemetry`] against a [`RecordingTransport`] and reconstructs the
//! collector's view of the sample set from the recorded batches.

use std::collections::HashMap;
use std::sync::Arc;

use mltrack::dispatch::{EventKind, RecordingTransport, SampleAxis};
use mltrack::scope::ScopeKind;
use mltrack::{Telemetry, TelemetryConfig};

async fn telemetry(
    config: TelemetryConfig,
) -> (Telemetry<Arc<RecordingTransport>>, Arc<RecordingTransport>) {
    let transport = Arc::new(RecordingTransport::new());
    let telemetry = Telemetry::start(config, Arc::clone(&transport), "pipeline-test")
        .await
        .unwrap();
    (telemetry, transport)
}

/// Replay every recorded batch in order, applying slot overwrites the way
/// the collector does, and return the surviving slot -> step mapping for
/// one sampling axis.
fn reconstruct_samples(transport: &RecordingTransport, axis: SampleAxis) -> HashMap<usize, u64> {
    let mut samples = HashMap::new();
    for batch in transport.batches() {
        for cmd in &batch.cmds {
            if cmd.kind != EventKind::Metric {
                continue;
            }
            let Some(key) = cmd.slot else { continue };
            if key.axis != axis {
                continue;
            }
            let step = cmd.payload["step"].as_u64().unwrap();
            samples.insert(key.slot, step);
        }
    }
    samples
}

#[tokio::test]
async fn test_global_minimum_survives_long_run() {
    let (mut telemetry, transport) = telemetry(TelemetryConfig::default()).await;
    telemetry.enter(ScopeKind::Experiment).unwrap();
    telemetry.enter(ScopeKind::EpochLoop).unwrap();
    telemetry.enter(ScopeKind::BatchLoop).unwrap();

    // 1,200 iterations against a budget of 1,000, with the global minimum
    // loss buried at step 47. Flushing every step keeps the worker drained
    // and makes the recorded batch stream deterministic.
    for step in 1..=1200u64 {
        let loss = if step == 47 {
            0.01
        } else {
            1.0 + step as f64 * 0.001
        };
        telemetry.report_metric("loss", loss, false);
        telemetry.batch_end(step).unwrap();
        telemetry.flush().await.unwrap();
    }

    let samples = reconstruct_samples(&transport, SampleAxis::Batch);
    assert_eq!(samples.len(), 1000, "sample set must fill the budget exactly");
    assert!(
        samples.values().any(|&step| step == 47),
        "the global-minimum step must survive eviction"
    );

    telemetry.exit(ScopeKind::BatchLoop).unwrap();
    telemetry.exit(ScopeKind::EpochLoop).unwrap();
    telemetry.exit(ScopeKind::Experiment).unwrap();
    telemetry.end().await.unwrap();
}

#[tokio::test]
async fn test_batch_and_epoch_axes_sample_independently() {
    let config = TelemetryConfig {
        batch_sample_budget: 16,
        epoch_sample_budget: 4,
        ..TelemetryConfig::default()
    };
    let (mut telemetry, transport) = telemetry(config).await;
    telemetry.enter(ScopeKind::Experiment).unwrap();

    for epoch in 1..=3u64 {
        for batch in 1..=4u64 {
            let step = (epoch - 1) * 4 + batch;
            telemetry.report_metric("loss", 1.0 / step as f64, false);
            telemetry.batch_end(step).unwrap();
        }
        telemetry.report_metric("val_accuracy", 0.5 + epoch as f64 * 0.1, false);
        telemetry.epoch_end(epoch).unwrap();
        telemetry.flush().await.unwrap();
    }

    let batch_samples = reconstruct_samples(&transport, SampleAxis::Batch);
    let epoch_samples = reconstruct_samples(&transport, SampleAxis::Epoch);

    // Both axes are in their fill phase, so every iteration is retained
    // and slot numbering restarts per axis.
    assert_eq!(batch_samples.len(), 12);
    assert_eq!(epoch_samples.len(), 3);
    assert_eq!(epoch_samples[&2], 2);

    telemetry.exit(ScopeKind::Experiment).unwrap();
    telemetry.end().await.unwrap();
}

#[tokio::test]
async fn test_parameters_bypass_the_samplers() {
    let config = TelemetryConfig {
        batch_sample_budget: 1,
        ..TelemetryConfig::default()
    };
    let (mut telemetry, transport) = telemetry(config).await;
    telemetry.enter(ScopeKind::Experiment).unwrap();

    for i in 0..5 {
        telemetry.report_parameter("learning_rate", serde_json::json!(0.1 / f64::from(i + 1)));
    }
    telemetry.flush().await.unwrap();

    let parameters: usize = transport
        .batches()
        .iter()
        .flat_map(|batch| &batch.cmds)
        .filter(|cmd| cmd.kind == EventKind::Parameter)
        .count();
    assert_eq!(parameters, 5, "every parameter report is enqueued as-is");

    telemetry.exit(ScopeKind::Experiment).unwrap();
    telemetry.end().await.unwrap();
}
