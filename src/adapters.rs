//! Framework adapter seams
//!
//! The pipeline itself is framework-agnostic; integrations with particular
//! numeric libraries plug in through these capability traits. Selection is
//! by explicit registration against a name, never by runtime type
//! inspection, and the registry is owned by the client instance rather than
//! living in process-wide state.

use std::collections::HashMap;

use crate::error::Result;
use crate::scope::MetricValue;

/// Produces stable hashes of a model's weights and structure.
///
/// One implementation per framework integration.
pub trait WeightsHasher: Send {
    /// Hash of the current weight values.
    ///
    /// # Errors
    ///
    /// Framework-specific extraction failure.
    fn weights_hash(&mut self) -> Result<u64>;

    /// Hash of the model structure (shapes and wiring, not values).
    ///
    /// # Errors
    ///
    /// Framework-specific extraction failure.
    fn structure_hash(&mut self) -> Result<u64>;
}

/// Evaluates a named framework variable to a reportable value.
pub trait VariableEvaluator: Send {
    /// Evaluate one variable by name.
    ///
    /// # Errors
    ///
    /// Unknown variable, or framework-specific evaluation failure.
    fn evaluate(&mut self, name: &str) -> Result<MetricValue>;
}

/// Explicit, client-owned registry of framework adapters.
#[derive(Default)]
pub struct AdapterRegistry {
    hashers: HashMap<String, Box<dyn WeightsHasher>>,
    evaluators: HashMap<String, Box<dyn VariableEvaluator>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("hashers", &self.hashers.keys().collect::<Vec<_>>())
            .field("evaluators", &self.evaluators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a weights hasher under a framework name.
    pub fn register_hasher(&mut self, name: impl Into<String>, hasher: Box<dyn WeightsHasher>) {
        self.hashers.insert(name.into(), hasher);
    }

    /// Register a variable evaluator under a framework name.
    pub fn register_evaluator(
        &mut self,
        name: impl Into<String>,
        evaluator: Box<dyn VariableEvaluator>,
    ) {
        self.evaluators.insert(name.into(), evaluator);
    }

    /// The hasher registered under `name`, if any.
    ///
    /// The `'static` bound on the trait object keeps the registry's boxed
    /// lifetime out of the `&mut self` borrow.
    pub fn hasher(&mut self, name: &str) -> Option<&mut (dyn WeightsHasher + 'static)> {
        self.hashers.get_mut(name).map(Box::as_mut)
    }

    /// The evaluator registered under `name`, if any.
    pub fn evaluator(&mut self, name: &str) -> Option<&mut (dyn VariableEvaluator + 'static)> {
        self.evaluators.get_mut(name).map(Box::as_mut)
    }

    /// Names with a registered hasher.
    #[must_use]
    pub fn hasher_names(&self) -> Vec<&str> {
        self.hashers.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedHasher(u64);

    impl WeightsHasher for FixedHasher {
        fn weights_hash(&mut self) -> Result<u64> {
            Ok(self.0)
        }

        fn structure_hash(&mut self) -> Result<u64> {
            Ok(self.0.wrapping_mul(31))
        }
    }

    struct UppercaseEvaluator;

    impl VariableEvaluator for UppercaseEvaluator {
        fn evaluate(&mut self, name: &str) -> Result<MetricValue> {
            Ok(MetricValue::Text(name.to_uppercase()))
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = AdapterRegistry::new();
        registry.register_hasher("burn", Box::new(FixedHasher(7)));

        let hasher = registry.hasher("burn").unwrap();
        assert_eq!(hasher.weights_hash().unwrap(), 7);
        assert!(registry.hasher("torch").is_none());
    }

    #[test]
    fn test_looked_up_adapter_outlives_the_lookup_call() {
        let mut registry = AdapterRegistry::new();
        registry.register_evaluator("burn", Box::new(UppercaseEvaluator));

        // Hold the returned trait object across further use, then look up
        // again once the first borrow ends.
        let evaluator = registry.evaluator("burn").unwrap();
        let value = evaluator.evaluate("lr").unwrap();
        assert_eq!(value, MetricValue::Text("LR".into()));
        assert!(registry.evaluator("burn").is_some());
        assert!(registry.evaluator("torch").is_none());
    }
}
