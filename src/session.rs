//! Session registration with the collector
//!
//! A session is registered once at pipeline start (yielding the auth token
//! every batch carries) and ended once at shutdown. The types here mirror the
//! collector's begin/end payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An active reporting session, as returned by the collector's begin call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    /// Auth token attached to every batch
    pub token: String,
    /// Project the experiment was filed under
    pub project_id: String,
    /// Collector-assigned experiment id
    pub experiment_id: String,
    /// Whether the collector wants source tracking data for this session
    #[serde(default)]
    pub allow_source_tracking: bool,
}

/// Request body for session registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Experiment name chosen by the host
    pub experiment_name: String,
    /// Wall-clock start of the session
    pub started_at: DateTime<Utc>,
}

impl SessionRequest {
    /// Create a registration request stamped with the current time.
    #[must_use]
    pub fn new(experiment_name: impl Into<String>) -> Self {
        Self {
            experiment_name: experiment_name.into(),
            started_at: Utc::now(),
        }
    }
}
