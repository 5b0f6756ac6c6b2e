/*!
Concurrency-safe registry of failure scenarios.

The catalog is a guarded, copy-on-write collection: mutations clone the
underlying vector, validate, then swap an `Arc` snapshot in place. Decision
calls read a snapshot and never observe a half-applied mutation; concurrent
updates serialize on the write lock, so no update is lost.

Registration order is preserved and meaningful — within a category, scenarios
are evaluated in the order they were registered ([`ScenarioCatalog::decision_order`]).
*/

use std::sync::{Arc, RwLock};

use miette::Diagnostic;
use thiserror::Error;

use crate::scenario::{FailureCategory, FailureScenario, ScenarioParams, ValidationError};

/// Errors from catalog mutations and lookups.
#[derive(Debug, Error, Diagnostic)]
pub enum CatalogError {
    #[error("scenario {name:?} is already registered")]
    #[diagnostic(
        code(faultline::catalog::duplicate_name),
        help("Scenario names are unique; update or disable the existing entry instead.")
    )]
    DuplicateName { name: String },

    #[error("scenario {name:?} is not registered")]
    #[diagnostic(
        code(faultline::catalog::not_found),
        help("List the catalog to see the registered scenario names.")
    )]
    NotFound { name: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),
}

/// Shared, thread-safe scenario registry.
///
/// Cloning the catalog clones the handle, not the contents: all clones see the
/// same registry.
///
/// # Examples
///
/// ```
/// use faultline::catalog::ScenarioCatalog;
/// use faultline::scenario::FailureCategory;
///
/// let catalog = ScenarioCatalog::with_defaults();
/// assert_eq!(catalog.len(), 11);
///
/// let behavioral: Vec<_> = catalog
///     .list(Some(FailureCategory::Behavioral), false)
///     .collect();
/// assert_eq!(behavioral.len(), 2);
/// ```
#[derive(Clone, Debug)]
pub struct ScenarioCatalog {
    inner: Arc<RwLock<Arc<Vec<FailureScenario>>>>,
}

impl Default for ScenarioCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl ScenarioCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(Vec::new()))),
        }
    }

    /// Creates a catalog seeded with the stock scenarios
    /// ([`crate::scenario::default_scenarios`]).
    #[must_use]
    pub fn with_defaults() -> Self {
        let catalog = Self::new();
        let seeded = Arc::new(crate::scenario::default_scenarios());
        *catalog.inner.write().unwrap() = seeded;
        catalog
    }

    /// Registers a new scenario.
    ///
    /// Validates first and rejects duplicates; on any error the catalog is
    /// unchanged.
    pub fn register(&self, scenario: FailureScenario) -> Result<(), CatalogError> {
        scenario.validate()?;
        let mut guard = self.inner.write().unwrap();
        if guard.iter().any(|s| s.name == scenario.name) {
            return Err(CatalogError::DuplicateName {
                name: scenario.name,
            });
        }
        let mut next = guard.as_ref().clone();
        next.push(scenario);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Replaces the parameters of an existing scenario, keeping its
    /// registration position (and therefore its decision priority).
    pub fn update(&self, name: &str, params: ScenarioParams) -> Result<(), CatalogError> {
        params.validate()?;
        let mut guard = self.inner.write().unwrap();
        let Some(pos) = guard.iter().position(|s| s.name == name) else {
            return Err(CatalogError::NotFound {
                name: name.to_string(),
            });
        };
        let mut next = guard.as_ref().clone();
        next[pos].params = params;
        *guard = Arc::new(next);
        Ok(())
    }

    /// Sets the enabled flag of an existing scenario.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), CatalogError> {
        let mut guard = self.inner.write().unwrap();
        let Some(pos) = guard.iter().position(|s| s.name == name) else {
            return Err(CatalogError::NotFound {
                name: name.to_string(),
            });
        };
        if guard[pos].enabled != enabled {
            let mut next = guard.as_ref().clone();
            next[pos].enabled = enabled;
            *guard = Arc::new(next);
        }
        Ok(())
    }

    /// Enables a scenario.
    pub fn enable(&self, name: &str) -> Result<(), CatalogError> {
        self.set_enabled(name, true)
    }

    /// Disables a scenario. It stays listable but is never selected again
    /// until re-enabled.
    pub fn disable(&self, name: &str) -> Result<(), CatalogError> {
        self.set_enabled(name, false)
    }

    /// Looks up a scenario by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<FailureScenario> {
        self.snapshot().iter().find(|s| s.name == name).cloned()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().iter().any(|s| s.name == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Cheap point-in-time view of the registry, in registration order.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<FailureScenario>> {
        self.inner.read().unwrap().clone()
    }

    /// Lazily filtered view of the catalog. The returned iterator is a
    /// detached snapshot: catalog mutations after this call do not affect it,
    /// and cloning it restarts iteration from the beginning.
    #[must_use]
    pub fn list(
        &self,
        category: Option<FailureCategory>,
        enabled_only: bool,
    ) -> ScenarioIter {
        ScenarioIter {
            snapshot: self.snapshot(),
            pos: 0,
            category,
            enabled_only,
        }
    }

    /// Enabled scenarios in decision-priority order: category rank first
    /// (output_quality → behavioral → integration → resource), registration
    /// order within a category.
    #[must_use]
    pub fn decision_order(&self) -> Vec<FailureScenario> {
        let mut scenarios: Vec<FailureScenario> = self
            .snapshot()
            .iter()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        // Stable sort keeps registration order within each category.
        scenarios.sort_by_key(FailureScenario::category);
        scenarios
    }

    /// Number of *enabled* scenarios in the given category. Drives the
    /// anti-repetition exemption: a mode that is the only enabled scenario in
    /// its category may repeat.
    #[must_use]
    pub fn enabled_in_category(&self, category: FailureCategory) -> usize {
        self.snapshot()
            .iter()
            .filter(|s| s.enabled && s.category() == category)
            .count()
    }
}

/// Snapshot-backed iterator returned by [`ScenarioCatalog::list`].
#[derive(Clone, Debug)]
pub struct ScenarioIter {
    snapshot: Arc<Vec<FailureScenario>>,
    pos: usize,
    category: Option<FailureCategory>,
    enabled_only: bool,
}

impl Iterator for ScenarioIter {
    type Item = FailureScenario;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(scenario) = self.snapshot.get(self.pos) {
            self.pos += 1;
            if let Some(category) = self.category {
                if scenario.category() != category {
                    continue;
                }
            }
            if self.enabled_only && !scenario.enabled {
                continue;
            }
            return Some(scenario.clone());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{OutputQualityParams, ResourceParams};

    fn quality(name: &str, probability: f64) -> FailureScenario {
        FailureScenario::new(
            name,
            "test scenario",
            ScenarioParams::OutputQuality(OutputQualityParams {
                probability,
                responses: vec!["canned".into()],
            }),
        )
    }

    #[test]
    fn register_rejects_duplicates_without_partial_write() {
        let catalog = ScenarioCatalog::new();
        catalog.register(quality("a", 0.5)).expect("first register");
        let err = catalog.register(quality("a", 0.9)).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateName { .. }));
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("a").unwrap().probability(), 0.5);
    }

    #[test]
    fn invalid_params_leave_catalog_untouched() {
        let catalog = ScenarioCatalog::new();
        assert!(catalog.register(quality("bad", 2.0)).is_err());
        assert!(catalog.is_empty());

        catalog.register(quality("ok", 0.2)).expect("register");
        let err = catalog
            .update(
                "ok",
                ScenarioParams::OutputQuality(OutputQualityParams {
                    probability: -1.0,
                    responses: vec!["x".into()],
                }),
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::Validation(_)));
        assert_eq!(catalog.get("ok").unwrap().probability(), 0.2);
    }

    #[test]
    fn update_unknown_name_is_not_found() {
        let catalog = ScenarioCatalog::new();
        let err = catalog
            .update(
                "ghost",
                ScenarioParams::Resource(ResourceParams {
                    probability: 0.1,
                    error_message: "nope".into(),
                    limit: None,
                }),
            )
            .unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { .. }));
    }

    #[test]
    fn list_iterator_is_a_detached_snapshot() {
        let catalog = ScenarioCatalog::with_defaults();
        let iter = catalog.list(None, true);
        catalog.disable("hallucination").expect("disable");

        // The iterator still sees the pre-mutation view.
        let seen: Vec<_> = iter.clone().map(|s| s.name).collect();
        assert!(seen.contains(&"hallucination".to_string()));

        // A fresh listing reflects the mutation.
        let enabled: Vec<_> = catalog.list(None, true).map(|s| s.name).collect();
        assert!(!enabled.contains(&"hallucination".to_string()));
        // ...but the scenario itself stays listable.
        let all: Vec<_> = catalog.list(None, false).map(|s| s.name).collect();
        assert!(all.contains(&"hallucination".to_string()));
    }

    #[test]
    fn decision_order_is_category_major_registration_minor() {
        let catalog = ScenarioCatalog::with_defaults();
        let order: Vec<String> = catalog.decision_order().iter().map(|s| s.name.clone()).collect();
        assert_eq!(
            order,
            vec![
                "hallucination",
                "incorrect_reasoning",
                "off_topic",
                "infinite_loop",
                "stuck_pattern",
                "api_timeout",
                "auth_error",
                "service_unavailable",
                "token_limit",
                "memory_exhaustion",
                "rate_limiting",
            ]
        );
    }

    #[test]
    fn concurrent_updates_do_not_lose_writes() {
        let catalog = ScenarioCatalog::with_defaults();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let catalog = catalog.clone();
                std::thread::spawn(move || {
                    catalog
                        .register(quality(&format!("extra-{i}"), 0.01))
                        .expect("register");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        assert_eq!(catalog.len(), 11 + 8);
    }
}
