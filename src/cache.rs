use crate::models::OptimizationResult;
use crate::param_utils::parameter_signature;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Memoizes scored runs so a parameter set is simulated at most once per data window.
#[derive(Clone, Default)]
pub struct ResultCache {
    local_cache: Arc<DashMap<String, OptimizationResult>>,
    hits: Arc<AtomicUsize>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_cache_key(scope: &str, parameters: &BTreeMap<String, f64>) -> String {
        format!("{}|{}", scope, parameter_signature(parameters))
    }

    pub fn check_cache(
        &self,
        scope: &str,
        parameters: &BTreeMap<String, f64>,
    ) -> Option<OptimizationResult> {
        let cache_key = Self::get_cache_key(scope, parameters);
        let cached = self.local_cache.get(&cache_key).map(|entry| entry.clone());
        if cached.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        cached
    }

    pub fn store_cache(&self, scope: &str, result: &OptimizationResult) {
        let cache_key = Self::get_cache_key(scope, &result.parameters);
        self.local_cache.insert(cache_key, result.clone());
    }

    pub fn len(&self) -> usize {
        self.local_cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local_cache.is_empty()
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.local_cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PerformanceMetrics;

    fn result(lookback: f64, score: f64) -> OptimizationResult {
        let mut parameters = BTreeMap::new();
        parameters.insert("lookback_window".to_string(), lookback);
        OptimizationResult {
            parameters,
            metrics: PerformanceMetrics::default(),
            score,
            penalty_factor: 1.0,
        }
    }

    #[test]
    fn entries_are_scoped_by_window() {
        let cache = ResultCache::new();
        let stored = result(20.0, 0.5);
        cache.store_cache("w1", &stored);

        assert_eq!(cache.check_cache("w1", &stored.parameters), Some(stored.clone()));
        assert!(cache.check_cache("w2", &stored.parameters).is_none());
        assert!(cache.check_cache("w1", &result(30.0, 0.0).parameters).is_none());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
