//! Bounded concurrent object fetching

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::core::Error;
use crate::core::types::Result;
use crate::object::{SpatialObject, SpatialQuery};

/// Configuration for the loader pool
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Maximum number of fetches in flight
    pub max_concurrent: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { max_concurrent: 6 }
    }
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::Config("loader concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

/// Request to fetch an object with priority
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub id: String,
    /// Higher loads first
    pub priority: f32,
}

impl LoadRequest {
    pub fn new(id: impl Into<String>, priority: f32) -> Self {
        Self {
            id: id.into(),
            priority,
        }
    }
}

/// Result of a fetch
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult {
    Loaded(SpatialObject),
    NotFound(String),
    Error(String, String),
}

impl LoadResult {
    pub fn id(&self) -> &str {
        match self {
            LoadResult::Loaded(object) => &object.id,
            LoadResult::NotFound(id) | LoadResult::Error(id, _) => id,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LoaderStats {
    pub requested: u64,
    pub loaded: u64,
    pub not_found: u64,
    pub errors: u64,
    pub peak_in_flight: usize,
}

#[derive(Default)]
struct Counters {
    requested: AtomicU64,
    loaded: AtomicU64,
    not_found: AtomicU64,
    errors: AtomicU64,
    peak_in_flight: AtomicUsize,
}

/// Fetches objects from the spatial index with at most
/// `max_concurrent` requests in flight.
pub struct ObjectLoader<S> {
    spatial: Arc<S>,
    max_concurrent: usize,
    counters: Counters,
}

impl<S: SpatialQuery> ObjectLoader<S> {
    pub fn new(spatial: Arc<S>, config: &LoaderConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            spatial,
            max_concurrent: config.max_concurrent,
            counters: Counters::default(),
        })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Fetch every requested object, highest priority first.
    ///
    /// # Arguments
    /// * `requests` - Objects to fetch with their priorities
    ///
    /// # Returns
    /// One result per request, in request order. A fetch task that dies
    /// yields [`LoadResult::Error`] for its request.
    pub async fn load(&self, requests: Vec<LoadRequest>) -> Vec<LoadResult> {
        let total = requests.len();
        self.counters.requested.fetch_add(total as u64, Ordering::Relaxed);

        let ids: Vec<String> = requests.iter().map(|r| r.id.clone()).collect();
        let mut pending: Vec<(usize, LoadRequest)> = requests.into_iter().enumerate().collect();
        // Highest priority at the end so pop() takes it
        pending.sort_by(|a, b| a.1.priority.total_cmp(&b.1.priority).then(b.0.cmp(&a.0)));

        let mut results: Vec<Option<LoadResult>> = vec![None; total];
        let mut active_tasks = JoinSet::new();

        loop {
            // Start new tasks while we have capacity
            while active_tasks.len() < self.max_concurrent {
                let Some((index, request)) = pending.pop() else { break };
                let spatial = self.spatial.clone();
                active_tasks.spawn(async move { (index, Self::load_object_task(spatial, request.id).await) });
            }
            self.counters
                .peak_in_flight
                .fetch_max(active_tasks.len(), Ordering::Relaxed);

            match active_tasks.join_next().await {
                Some(Ok((index, result))) => {
                    self.record(&result);
                    results[index] = Some(result);
                }
                Some(Err(e)) => {
                    log::error!("Object load task failed: {}", e);
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }

        results
            .into_iter()
            .zip(ids)
            .map(|(result, id)| result.unwrap_or_else(|| LoadResult::Error(id, "load task failed".to_string())))
            .collect()
    }

    /// Task that fetches a single object
    async fn load_object_task(spatial: Arc<S>, id: String) -> LoadResult {
        match spatial.fetch_object(&id).await {
            Ok(Some(object)) => LoadResult::Loaded(object),
            Ok(None) => LoadResult::NotFound(id),
            Err(e) => {
                log::warn!("Fetch of {} failed: {}", id, e);
                LoadResult::Error(id, e.to_string())
            }
        }
    }

    fn record(&self, result: &LoadResult) {
        let counter = match result {
            LoadResult::Loaded(_) => &self.counters.loaded,
            LoadResult::NotFound(_) => &self.counters.not_found,
            LoadResult::Error(..) => &self.counters.errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> LoaderStats {
        LoaderStats {
            requested: self.counters.requested.load(Ordering::Relaxed),
            loaded: self.counters.loaded.load(Ordering::Relaxed),
            not_found: self.counters.not_found.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            peak_in_flight: self.counters.peak_in_flight.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::Aabb;
    use crate::object::InMemorySpatialIndex;
    use std::time::Duration;

    fn index(n: usize) -> Arc<InMemorySpatialIndex> {
        let objects = (0..n).map(|i| SpatialObject::new(format!("obj-{i:02}"), "outlet", "electrical", 3));
        Arc::new(InMemorySpatialIndex::from_objects(objects).with_latency(Duration::from_millis(10)))
    }

    struct FailingIndex;

    impl SpatialQuery for FailingIndex {
        async fn query_range(&self, _bounds: &Aabb) -> Result<Vec<SpatialObject>> {
            Err(Error::Spatial("offline".into()))
        }

        async fn fetch_object(&self, _id: &str) -> Result<Option<SpatialObject>> {
            Err(Error::Spatial("offline".into()))
        }
    }

    struct PanickingIndex(InMemorySpatialIndex);

    impl SpatialQuery for PanickingIndex {
        async fn query_range(&self, bounds: &Aabb) -> Result<Vec<SpatialObject>> {
            self.0.query_range(bounds).await
        }

        async fn fetch_object(&self, id: &str) -> Result<Option<SpatialObject>> {
            if id == "boom" {
                panic!("index crashed on {id}");
            }
            self.0.fetch_object(id).await
        }
    }

    #[tokio::test]
    async fn test_panicked_fetch_keeps_slot() {
        let index = PanickingIndex(InMemorySpatialIndex::from_objects([
            SpatialObject::new("ok", "outlet", "electrical", 3),
        ]));
        let loader = ObjectLoader::new(Arc::new(index), &LoaderConfig::default()).unwrap();
        let results = loader
            .load(vec![LoadRequest::new("boom", 1.0), LoadRequest::new("ok", 0.5)])
            .await;

        assert_eq!(results.len(), 2);
        assert!(matches!(&results[0], LoadResult::Error(id, _) if id == "boom"));
        assert!(matches!(&results[1], LoadResult::Loaded(o) if o.id == "ok"));
        assert_eq!(loader.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_loads_in_request_order() {
        let loader = ObjectLoader::new(index(5), &LoaderConfig::default()).unwrap();
        let requests = vec![
            LoadRequest::new("obj-03", 0.1),
            LoadRequest::new("obj-01", 0.9),
            LoadRequest::new("missing", 0.5),
        ];
        let results = loader.load(requests).await;

        let ids: Vec<&str> = results.iter().map(LoadResult::id).collect();
        assert_eq!(ids, vec!["obj-03", "obj-01", "missing"]);
        assert!(matches!(results[0], LoadResult::Loaded(_)));
        assert_eq!(results[2], LoadResult::NotFound("missing".into()));

        let stats = loader.stats();
        assert_eq!(stats.requested, 3);
        assert_eq!(stats.loaded, 2);
        assert_eq!(stats.not_found, 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let loader = ObjectLoader::new(index(20), &LoaderConfig { max_concurrent: 3 }).unwrap();
        let requests = (0..20).map(|i| LoadRequest::new(format!("obj-{i:02}"), i as f32)).collect();
        let results = loader.load(requests).await;

        assert_eq!(results.len(), 20);
        assert!(results.iter().all(|r| matches!(r, LoadResult::Loaded(_))));
        assert_eq!(loader.stats().peak_in_flight, 3);
    }

    #[tokio::test]
    async fn test_errors_become_results() {
        let loader = ObjectLoader::new(Arc::new(FailingIndex), &LoaderConfig::default()).unwrap();
        let results = loader.load(vec![LoadRequest::new("x", 1.0)]).await;
        assert!(matches!(&results[0], LoadResult::Error(id, msg) if id == "x" && msg.contains("offline")));
        assert_eq!(loader.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_empty_request() {
        let loader = ObjectLoader::new(index(1), &LoaderConfig::default()).unwrap();
        assert!(loader.load(Vec::new()).await.is_empty());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(ObjectLoader::new(index(1), &LoaderConfig { max_concurrent: 0 }).is_err());
    }
}
