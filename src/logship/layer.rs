//! tracing integration
//!
//! A `tracing-subscriber` layer that converts every emitted event into a
//! [`LogRecord`] and hands it to the shipper. Subscription is explicit: the
//! host installs the layer, and dropping the subscriber (or shutting the
//! shipper down) ends the forwarding.

use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::{LogLevel, LogRecord, LogShipper};

/// Layer forwarding tracing events to a [`LogShipper`].
pub struct ShipperLayer {
    shipper: Arc<LogShipper>,
    category: String,
}

impl ShipperLayer {
    /// Create a layer shipping events under the "log" category.
    #[must_use]
    pub fn new(shipper: Arc<LogShipper>) -> Self {
        Self {
            shipper,
            category: "log".to_string(),
        }
    }

    /// Override the category attached to shipped records.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }
}

impl<S: Subscriber> Layer<S> for ShipperLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord::new(
            map_level(*metadata.level()),
            metadata.target(),
            visitor.message,
            self.category.clone(),
        );
        self.shipper.ship(record);
    }
}

fn map_level(level: Level) -> LogLevel {
    if level == Level::ERROR {
        LogLevel::Error
    } else if level == Level::WARN {
        LogLevel::Warning
    } else if level == Level::INFO {
        LogLevel::Info
    } else {
        LogLevel::Debug
    }
}

/// Extracts the `message` field from an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}
