//! Per-scope running metric statistics
//!
//! Each active scope owns one accumulator. Numeric metrics are kept as
//! `(sum, count)` pairs so that merging a child scope into its parent is a
//! plain component-wise addition; the division into an average is deferred
//! until read. Non-numeric metrics are latest-value-wins with a count of 1.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// A metric value as reported by the host.
///
/// Numbers participate in running averages; anything else (labels, git
/// hashes, phase names) is carried latest-value-wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetricValue {
    /// A numeric observation, averaged over the scope
    Number(f64),
    /// A non-numeric observation, latest value wins
    Text(String),
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<&str> for MetricValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for MetricValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

/// Internal per-metric state.
#[derive(Debug, Clone, PartialEq)]
enum Stat {
    /// Deferred average: `sum` of observations and their `count`
    Running { sum: f64, count: u64 },
    /// Latest non-numeric value, count pinned to 1
    Latest(String),
}

/// Running statistics for a named set of metrics within one scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricAccumulator {
    stats: HashMap<String, Stat>,
    custom: HashSet<String>,
}

impl MetricAccumulator {
    /// Create an empty accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no metric has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Number of distinct metric names recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    /// Record one observation.
    ///
    /// Numeric values extend the running average; non-numeric values replace
    /// the previous value and force the count to 1. `is_custom` tags the
    /// name as host-defined rather than framework-produced.
    pub fn record(&mut self, name: &str, value: impl Into<MetricValue>, is_custom: bool) {
        match value.into() {
            MetricValue::Number(v) => match self.stats.get_mut(name) {
                Some(Stat::Running { sum, count }) => {
                    *sum += v;
                    *count += 1;
                }
                _ => {
                    self.stats
                        .insert(name.to_string(), Stat::Running { sum: v, count: 1 });
                }
            },
            MetricValue::Text(v) => {
                self.stats.insert(name.to_string(), Stat::Latest(v));
            }
        }
        if is_custom {
            self.custom.insert(name.to_string());
        }
    }

    /// Merge another accumulator into this one.
    ///
    /// Numeric metrics combine as `(va*ca + vb*cb)/(ca+cb)` with
    /// `count = ca+cb`, which makes the operation commutative and
    /// associative. For non-numeric metrics the other side's latest value
    /// wins, as it is the more recent observation.
    pub fn merge(&mut self, other: &Self) {
        for (name, stat) in &other.stats {
            match (self.stats.get_mut(name), stat) {
                (
                    Some(Stat::Running { sum, count }),
                    Stat::Running {
                        sum: osum,
                        count: ocount,
                    },
                ) => {
                    *sum += osum;
                    *count += ocount;
                }
                (_, stat) => {
                    self.stats.insert(name.clone(), stat.clone());
                }
            }
        }
        self.custom.extend(other.custom.iter().cloned());
    }

    /// Current average for one metric, or `None` if never recorded.
    #[must_use]
    pub fn average(&self, name: &str) -> Option<MetricValue> {
        self.stats.get(name).map(|stat| match stat {
            #[allow(clippy::cast_precision_loss)]
            Stat::Running { sum, count } => MetricValue::Number(sum / *count as f64),
            Stat::Latest(v) => MetricValue::Text(v.clone()),
        })
    }

    /// All current per-name averages.
    #[must_use]
    pub fn averages(&self) -> HashMap<String, MetricValue> {
        self.stats
            .keys()
            .map(|name| {
                let value = self.average(name).unwrap_or(MetricValue::Number(0.0));
                (name.clone(), value)
            })
            .collect()
    }

    /// Observation count for one metric (1 for non-numeric entries).
    #[must_use]
    pub fn count(&self, name: &str) -> u64 {
        match self.stats.get(name) {
            Some(Stat::Running { count, .. }) => *count,
            Some(Stat::Latest(_)) => 1,
            None => 0,
        }
    }

    /// Whether the name was tagged as host-defined.
    #[must_use]
    pub fn is_custom(&self, name: &str) -> bool {
        self.custom.contains(name)
    }

    /// Names recorded via framework instrumentation (not tagged custom).
    #[must_use]
    pub fn framework_names(&self) -> Vec<&str> {
        self.stats
            .keys()
            .filter(|name| !self.custom.contains(*name))
            .map(String::as_str)
            .collect()
    }

    /// Names tagged as host-defined.
    #[must_use]
    pub fn custom_names(&self) -> Vec<&str> {
        self.custom.iter().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average() {
        let mut acc = MetricAccumulator::new();
        acc.record("loss", 1.0, false);
        acc.record("loss", 2.0, false);
        acc.record("loss", 3.0, false);

        assert_eq!(acc.average("loss"), Some(MetricValue::Number(2.0)));
        assert_eq!(acc.count("loss"), 3);
    }

    #[test]
    fn test_text_latest_wins() {
        let mut acc = MetricAccumulator::new();
        acc.record("phase", "warmup", true);
        acc.record("phase", "steady", true);

        assert_eq!(
            acc.average("phase"),
            Some(MetricValue::Text("steady".into()))
        );
        assert_eq!(acc.count("phase"), 1);
    }

    #[test]
    fn test_text_overwrites_numeric() {
        let mut acc = MetricAccumulator::new();
        acc.record("lr", 0.1, false);
        acc.record("lr", "scheduled", false);
        assert_eq!(acc.count("lr"), 1);
        assert_eq!(acc.average("lr"), Some(MetricValue::Text("scheduled".into())));
    }

    #[test]
    fn test_merge_weighted() {
        let mut a = MetricAccumulator::new();
        a.record("loss", 1.0, false);
        a.record("loss", 2.0, false); // avg 1.5, count 2

        let mut b = MetricAccumulator::new();
        b.record("loss", 6.0, false); // avg 6.0, count 1

        a.merge(&b);
        // (1.5*2 + 6.0*1) / 3 = 3.0
        assert_eq!(a.average("loss"), Some(MetricValue::Number(3.0)));
        assert_eq!(a.count("loss"), 3);
    }

    #[test]
    fn test_merge_commutative() {
        let mut a = MetricAccumulator::new();
        a.record("x", 1.0, false);
        a.record("x", 5.0, false);
        let mut b = MetricAccumulator::new();
        b.record("x", 2.0, false);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        let (Some(MetricValue::Number(va)), Some(MetricValue::Number(vb))) =
            (ab.average("x"), ba.average("x"))
        else {
            panic!("expected numeric averages");
        };
        assert!((va - vb).abs() < 1e-9);
    }

    #[test]
    fn test_merge_disjoint_names() {
        let mut a = MetricAccumulator::new();
        a.record("loss", 1.0, false);
        let mut b = MetricAccumulator::new();
        b.record("acc", 0.9, true);

        a.merge(&b);
        assert_eq!(a.len(), 2);
        assert!(a.is_custom("acc"));
        assert!(!a.is_custom("loss"));
    }

    #[test]
    fn test_custom_vs_framework_names() {
        let mut acc = MetricAccumulator::new();
        acc.record("loss", 0.5, false);
        acc.record("my_metric", 1.0, true);

        assert_eq!(acc.framework_names(), vec!["loss"]);
        assert_eq!(acc.custom_names(), vec!["my_metric"]);
    }
}
