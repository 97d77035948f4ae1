//! Per-logger-name level filtering
//!
//! Thresholds are registered against dot-separated logger-name prefixes and
//! stored in a trie keyed on name segments. A record is kept when its level
//! is at or above the threshold of the longest matching ancestor prefix;
//! the root holds the default.

use std::collections::HashMap;

use super::LogLevel;

#[derive(Debug, Default)]
struct Node {
    threshold: Option<LogLevel>,
    children: HashMap<String, Node>,
}

/// Prefix trie of per-logger-name level thresholds.
#[derive(Debug)]
pub struct LevelFilter {
    root: Node,
    default_level: LogLevel,
}

impl Default for LevelFilter {
    fn default() -> Self {
        Self::new(LogLevel::Info)
    }
}

impl LevelFilter {
    /// Create a filter with the given root default threshold.
    #[must_use]
    pub fn new(default_level: LogLevel) -> Self {
        Self {
            root: Node::default(),
            default_level,
        }
    }

    /// Build a filter from parsed `(name, level)` pairs.
    ///
    /// An empty name sets the root default.
    #[must_use]
    pub fn from_entries(default_level: LogLevel, entries: &[(String, LogLevel)]) -> Self {
        let mut filter = Self::new(default_level);
        for (name, level) in entries {
            filter.set(name, *level);
        }
        filter
    }

    /// Register a threshold for a logger-name prefix.
    pub fn set(&mut self, name: &str, level: LogLevel) {
        if name.is_empty() {
            self.default_level = level;
            return;
        }
        let mut node = &mut self.root;
        for segment in name.split('.') {
            node = node.children.entry(segment.to_string()).or_default();
        }
        node.threshold = Some(level);
    }

    /// Threshold applying to a logger name: the longest matching ancestor
    /// prefix, or the root default.
    #[must_use]
    pub fn threshold_for(&self, logger: &str) -> LogLevel {
        let mut node = &self.root;
        let mut threshold = self.default_level;
        if logger.is_empty() {
            return threshold;
        }
        for segment in logger.split('.') {
            match node.children.get(segment) {
                Some(child) => {
                    if let Some(level) = child.threshold {
                        threshold = level;
                    }
                    node = child;
                }
                None => break,
            }
        }
        threshold
    }

    /// Whether a record at `level` from `logger` passes the filter.
    #[must_use]
    pub fn allows(&self, logger: &str, level: LogLevel) -> bool {
        level >= self.threshold_for(logger)
    }
}
