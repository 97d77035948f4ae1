//! Scope tracking for the host computation
//!
//! The host signals its position in the training loop by entering and
//! exiting nested scopes (experiment, loop, epoch, batch, train, validation,
//! test). The stack validates nesting against a fixed allowed-parent table,
//! owns one [`MetricAccumulator`] per active scope, and folds a child's
//! statistics into its parent on exit.
//!
//! Strict kinds fail with [`Error::InvalidNesting`] on a violation; the
//! advisory kinds (`Validation`, `Test`) only log the violation and proceed,
//! so a slightly misinstrumented host keeps making forward progress.
//!
//! All calls must come from the host's own call sequence; the stack is
//! single-threaded and takes no locks.

mod accumulator;

pub use accumulator::{MetricAccumulator, MetricValue};

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// The kind of a logical scope in the host computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKind {
    /// Outermost scope for the whole experiment
    Experiment,
    /// A generic iteration loop
    Loop,
    /// A loop over epochs
    EpochLoop,
    /// A loop over batches within an epoch
    BatchLoop,
    /// A training phase
    Train,
    /// A validation phase (advisory nesting)
    Validation,
    /// A test phase (advisory nesting)
    Test,
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Experiment => "experiment",
            Self::Loop => "loop",
            Self::EpochLoop => "epoch_loop",
            Self::BatchLoop => "batch_loop",
            Self::Train => "train",
            Self::Validation => "validation",
            Self::Test => "test",
        };
        f.write_str(name)
    }
}

impl ScopeKind {
    /// Whether a nesting violation is fatal (`true`) or merely logged.
    #[must_use]
    pub const fn is_strict(self) -> bool {
        !matches!(self, Self::Validation | Self::Test)
    }

    /// Whether `parent` (the current top of stack, `None` when empty) is an
    /// allowed parent for this kind.
    #[must_use]
    pub fn allows_parent(self, parent: Option<Self>) -> bool {
        match self {
            // Must be outermost.
            Self::Experiment => parent.is_none(),
            Self::Loop | Self::EpochLoop => {
                matches!(parent, Some(Self::Experiment | Self::Train))
            }
            Self::BatchLoop => matches!(
                parent,
                Some(Self::EpochLoop | Self::Train | Self::Test | Self::Validation)
            ),
            Self::Train => matches!(parent, Some(Self::Loop | Self::BatchLoop)),
            Self::Validation => {
                matches!(parent, Some(Self::Loop | Self::EpochLoop | Self::BatchLoop))
            }
            Self::Test => matches!(
                parent,
                Some(Self::Experiment | Self::Loop | Self::EpochLoop | Self::BatchLoop)
            ),
        }
    }
}

/// One active scope: its kind and the statistics gathered inside it.
#[derive(Debug)]
pub struct Scope {
    kind: ScopeKind,
    accumulator: MetricAccumulator,
}

impl Scope {
    fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            accumulator: MetricAccumulator::new(),
        }
    }

    /// The scope's kind.
    #[must_use]
    pub const fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// The statistics gathered so far in this scope.
    #[must_use]
    pub const fn accumulator(&self) -> &MetricAccumulator {
        &self.accumulator
    }
}

/// Nesting-validated stack of active scopes.
///
/// The empty stack is the valid initial and terminal state.
#[derive(Debug, Default)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
    iteration_has_validation: bool,
}

impl ScopeStack {
    /// Create an empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active scopes.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// True when no scope is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }

    /// Kind of the innermost active scope, if any.
    #[must_use]
    pub fn current_kind(&self) -> Option<ScopeKind> {
        self.scopes.last().map(Scope::kind)
    }

    /// Enter a new scope.
    ///
    /// Entering `Validation` additionally raises the transient
    /// iteration-has-validation flag consumed by the next batch/loop step.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidNesting`] when `kind` is strict and the current top
    /// of stack is not an allowed parent. Advisory kinds log the violation
    /// and enter anyway.
    pub fn enter(&mut self, kind: ScopeKind) -> Result<()> {
        let parent = self.current_kind();
        if !kind.allows_parent(parent) {
            let parent_name =
                parent.map_or_else(|| "<empty>".to_string(), |p| p.to_string());
            if kind.is_strict() {
                return Err(Error::InvalidNesting {
                    child: kind.to_string(),
                    parent: parent_name,
                });
            }
            tracing::error!(
                scope = %kind,
                parent = %parent_name,
                "invalid scope nesting, entering anyway"
            );
        }
        if kind == ScopeKind::Validation {
            self.iteration_has_validation = true;
        }
        self.scopes.push(Scope::new(kind));
        Ok(())
    }

    /// Exit the innermost scope.
    ///
    /// On success the popped accumulator is merged into the new top (if the
    /// stack is non-empty) and its final per-name averages are returned.
    ///
    /// # Errors
    ///
    /// [`Error::ScopeMismatch`] when `kind` differs from the current top;
    /// the stack is left unchanged in that case.
    pub fn exit(&mut self, kind: ScopeKind) -> Result<HashMap<String, MetricValue>> {
        let top = self.current_kind().ok_or_else(|| Error::ScopeMismatch {
            expected: kind.to_string(),
            found: "<empty>".to_string(),
        })?;
        if top != kind {
            return Err(Error::ScopeMismatch {
                expected: kind.to_string(),
                found: top.to_string(),
            });
        }

        // Checked non-empty above.
        let popped = self.scopes.pop().ok_or_else(|| Error::ScopeMismatch {
            expected: kind.to_string(),
            found: "<empty>".to_string(),
        })?;
        let averages = popped.accumulator.averages();
        if let Some(parent) = self.scopes.last_mut() {
            parent.accumulator.merge(&popped.accumulator);
        }
        Ok(averages)
    }

    /// Record one metric observation into the innermost scope.
    ///
    /// Outside any scope the observation is dropped with a debug log; the
    /// pipeline never fails the host over a stray report.
    pub fn record_metric(&mut self, name: &str, value: impl Into<MetricValue>, is_custom: bool) {
        match self.scopes.last_mut() {
            Some(scope) => scope.accumulator.record(name, value, is_custom),
            None => {
                tracing::debug!(metric = name, "metric reported outside any scope, dropped");
            }
        }
    }

    /// Statistics of the innermost scope, if any.
    #[must_use]
    pub fn current_accumulator(&self) -> Option<&MetricAccumulator> {
        self.scopes.last().map(Scope::accumulator)
    }

    /// Read and clear the iteration-has-validation flag.
    ///
    /// Set when a `Validation` scope is entered; consumed by the next
    /// batch/loop step.
    pub fn take_validation_flag(&mut self) -> bool {
        std::mem::take(&mut self.iteration_has_validation)
    }
}
