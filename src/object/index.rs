//! Spatial range-query collaborator

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::core::Error;
use crate::math::Aabb;
use crate::object::SpatialObject;

/// Range-query interface onto the upstream spatial index.
///
/// These calls are the engine's suspension points. Implementations may be
/// in-process or remote; timeouts are the caller's concern and should be
/// surfaced as an ordinary `Err`.
pub trait SpatialQuery: Send + Sync + 'static {
    /// Return every object whose bounds intersect `bounds`
    fn query_range(
        &self,
        bounds: &Aabb,
    ) -> impl Future<Output = Result<Vec<SpatialObject>, Error>> + Send;

    /// Fetch a single object by id
    fn fetch_object(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<SpatialObject>, Error>> + Send;
}

/// Simple in-memory index with optional simulated transport latency.
#[derive(Default)]
pub struct InMemorySpatialIndex {
    objects: HashMap<String, SpatialObject>,
    latency: Option<Duration>,
}

impl InMemorySpatialIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index from an object list (later duplicates win)
    pub fn from_objects(objects: impl IntoIterator<Item = SpatialObject>) -> Self {
        let mut index = Self::new();
        for object in objects {
            index.insert(object);
        }
        index
    }

    /// Delay every call by `latency` to mimic a remote index
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&mut self, object: SpatialObject) {
        self.objects.insert(object.id.clone(), object);
    }

    pub fn remove(&mut self, id: &str) -> Option<SpatialObject> {
        self.objects.remove(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl SpatialQuery for InMemorySpatialIndex {
    async fn query_range(&self, bounds: &Aabb) -> Result<Vec<SpatialObject>, Error> {
        self.simulate_latency().await;

        let mut hits: Vec<SpatialObject> = self
            .objects
            .values()
            .filter(|o| o.bounds().intersects(bounds))
            .cloned()
            .collect();
        // Stable output order keeps compression and budgets deterministic
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(hits)
    }

    async fn fetch_object(&self, id: &str) -> Result<Option<SpatialObject>, Error> {
        self.simulate_latency().await;
        Ok(self.objects.get(id).cloned())
    }
}
