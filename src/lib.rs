//! # mltrack: Client-Side Telemetry for Training Loops
//!
//! mltrack embeds in a long-running numeric computation (an iterative
//! training loop) and ships its telemetry to a remote collector without
//! ever stalling the computation itself.
//!
//! ## Pieces
//!
//! - [`scope`] — nesting-validated scope tracking with per-scope metric
//!   accumulators, merged child-into-parent on exit
//! - [`sampler`] — reservoir sampling over a fixed slot budget, with
//!   extremum-holding slots pinned against eviction
//! - [`dispatch`] — the batched command queue, its flush/retry policy, and
//!   the background worker that keeps network I/O off the host loop
//! - [`logship`] — loopback log socket, forked forwarder process, and a
//!   `tracing` layer feeding it
//! - [`pipeline`] — the [`Telemetry`] client tying it all together
//!
//! Delivery is best-effort and at-most-once by design: a batch that cannot
//! be delivered is dropped with a warning, never queued durably.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mltrack::dispatch::HttpTransport;
//! use mltrack::scope::ScopeKind;
//! use mltrack::{Telemetry, TelemetryConfig};
//!
//! # async fn example() -> mltrack::Result<()> {
//! let config = TelemetryConfig {
//!     endpoint: "https://collector.example.com".into(),
//!     ..TelemetryConfig::default()
//! };
//! let transport = HttpTransport::new(&config.endpoint);
//! let mut telemetry = Telemetry::start(config, transport, "resnet-sweep-4").await?;
//!
//! telemetry.enter(ScopeKind::Experiment)?;
//! telemetry.enter(ScopeKind::EpochLoop)?;
//! for step in 1..=100u32 {
//!     telemetry.report_metric("loss", 1.0 / f64::from(step), false);
//!     telemetry.batch_end(u64::from(step))?;
//! }
//! telemetry.exit(ScopeKind::EpochLoop)?;
//! telemetry.exit(ScopeKind::Experiment)?;
//! telemetry.end().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod adapters;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod logship;
pub mod pipeline;
pub mod sampler;
pub mod scope;
pub mod session;

pub use config::TelemetryConfig;
pub use error::{Error, Result};
pub use pipeline::Telemetry;
