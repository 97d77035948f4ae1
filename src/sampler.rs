//! Budget-bounded iteration sampling
//!
//! A training run can produce millions of iterations while the collector
//! retains a fixed number of reporting slots per axis. The sampler is a
//! reservoir over `1..=budget`: the first `budget` calls fill their own slot,
//! after which each call draws a random occupied slot to overwrite. Slots
//! holding the current running minimum or maximum of a tracked metric are
//! pinned and excluded from eviction, so a downsampled time series never
//! silently drops the global best or worst observation.
//!
//! Single-threaded, driven by the host's own call sequence.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Which running extremum pinned a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extremum {
    /// Running minimum holder
    Min,
    /// Running maximum holder
    Max,
}

/// Per-metric running extrema.
#[derive(Debug, Clone, Copy)]
struct Extrema {
    min: f64,
    max: f64,
}

/// Reservoir sampler with pinned extremal slots.
///
/// Call index `i` is 1-based; slots are the indices `1..=budget`. Eviction
/// draws range over `[2, i]`, so slot 1 (the first iteration) is never
/// displaced.
#[derive(Debug)]
pub struct PointSampler {
    budget: usize,
    calls: u64,
    extrema: HashMap<String, Extrema>,
    protected: HashMap<(String, Extremum), usize>,
    rng: StdRng,
}

impl PointSampler {
    /// Create a sampler with the given slot budget.
    ///
    /// A zero budget disables sampling entirely: `observe` never reports.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self::with_rng(budget, StdRng::from_entropy())
    }

    /// Create a sampler with an explicit RNG, for deterministic tests.
    #[must_use]
    pub fn with_rng(budget: usize, rng: StdRng) -> Self {
        Self {
            budget,
            calls: 0,
            extrema: HashMap::new(),
            protected: HashMap::new(),
            rng,
        }
    }

    /// The fixed slot budget.
    #[must_use]
    pub const fn budget(&self) -> usize {
        self.budget
    }

    /// Number of observe calls so far.
    #[must_use]
    pub const fn calls(&self) -> u64 {
        self.calls
    }

    /// Observe one iteration and decide which slot, if any, to (re)report.
    ///
    /// `changed` lists the metrics whose value changed this iteration. The
    /// fill phase (`i <= budget`) always reports slot `i`. Afterwards a
    /// uniform draw over `[2, i]` picks an eviction target, rejected when it
    /// falls outside the reservoir or on a pinned slot; the draw is retried
    /// once per changed metric before the call is skipped entirely.
    ///
    /// A call that sets a new running minimum or maximum for a metric pins
    /// the chosen slot for that extremum, releasing the metric's previous
    /// pin of the same kind.
    pub fn observe(&mut self, changed: &[(&str, f64)]) -> Option<usize> {
        self.calls += 1;
        if self.budget == 0 {
            return None;
        }
        let i = self.calls;

        let new_extrema = self.update_extrema(changed);

        let budget = self.budget as u64;
        let slot = if i <= budget {
            #[allow(clippy::cast_possible_truncation)]
            Some(i as usize)
        } else {
            let attempts = 1 + changed.len();
            let mut found = None;
            for _ in 0..attempts {
                let r = self.rng.gen_range(2..=i);
                if r <= budget {
                    #[allow(clippy::cast_possible_truncation)]
                    let r = r as usize;
                    if !self.is_pinned(r) {
                        found = Some(r);
                        break;
                    }
                }
            }
            found
        };

        if let Some(slot) = slot {
            for key in new_extrema {
                // Releases the previous holder for this (metric, kind) pair.
                self.protected.insert(key, slot);
            }
        }
        slot
    }

    /// Slot currently pinned for a metric's given extremum, if any.
    #[must_use]
    pub fn pinned_slot(&self, metric: &str, kind: Extremum) -> Option<usize> {
        self.protected.get(&(metric.to_string(), kind)).copied()
    }

    /// Whether the slot is pinned for any metric.
    #[must_use]
    pub fn is_pinned(&self, slot: usize) -> bool {
        self.protected.values().any(|&s| s == slot)
    }

    /// Update running extrema; returns the `(metric, kind)` pairs that set a
    /// new extremum this call. A metric's first observation sets both.
    fn update_extrema(&mut self, changed: &[(&str, f64)]) -> Vec<(String, Extremum)> {
        let mut fresh = Vec::new();
        for &(name, value) in changed {
            match self.extrema.get_mut(name) {
                Some(ext) => {
                    if value < ext.min {
                        ext.min = value;
                        fresh.push((name.to_string(), Extremum::Min));
                    }
                    if value > ext.max {
                        ext.max = value;
                        fresh.push((name.to_string(), Extremum::Max));
                    }
                }
                None => {
                    self.extrema.insert(
                        name.to_string(),
                        Extrema {
                            min: value,
                            max: value,
                        },
                    );
                    fresh.push((name.to_string(), Extremum::Min));
                    fresh.push((name.to_string(), Extremum::Max));
                }
            }
        }
        fresh
    }
}
