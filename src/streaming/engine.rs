//! Viewport-driven streaming orchestrator
//!
//! Ties the viewport manager, progressive disclosure, differential
//! compression and the smart cache together behind three async entry points:
//! [`StreamingEngine::set_viewport`], [`StreamingEngine::stream_object`] and
//! [`StreamingEngine::stream_objects`].
//!
//! Suspension happens only while waiting on the spatial index. Cache,
//! compression and viewport state are updated synchronously under their own
//! locks, and no lock is held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::types::{DVec3, PropertyMap, Result};
use crate::object::{SpatialObject, SpatialQuery};
use crate::streaming::budget::{BundleBudget, UserRole};
use crate::streaming::cache::{CacheStatus, CacheTier, SmartCache, estimate_size};
use crate::streaming::config::StreamingConfig;
use crate::streaming::delta::{Compressed, Decompressed, DifferentialCompressor, ObjectDelta};
use crate::streaming::loader::{LoadRequest, LoadResult, ObjectLoader};
use crate::streaming::lod::{LodLevel, ProgressiveDisclosure};
use crate::streaming::viewport::{QueryMode, ViewportBounds, ViewportManager};

/// Value stored in the engine's cache
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum CachedPayload {
    Bundle(Arc<StreamBundle>),
    Object(Arc<SpatialObject>),
}

/// Response to a viewport update
#[derive(Clone, Debug, Serialize)]
pub struct StreamBundle {
    pub cache_key: String,
    pub viewport: ViewportBounds,
    pub role: UserRole,
    /// Level derived from the viewport area
    pub requested_lod: LodLevel,
    /// Level actually served after budget checks
    pub lod: LodLevel,
    pub objects: Vec<Compressed>,
    /// Base properties of every template referenced by `objects`
    pub templates: BTreeMap<String, PropertyMap>,
    pub compressed_count: usize,
    /// Uncompressed size of the served objects
    pub estimated_bytes: usize,
    /// Serialized size of `objects` plus `templates`
    pub total_bytes: usize,
    /// Smaller of the level and role budgets
    pub budget_bytes: Option<usize>,
    pub utilization: f64,
    pub fits_budget: bool,
    pub from_cache: bool,
    /// The spatial query failed; the bundle may be missing objects
    pub partial: bool,
    /// A newer viewport arrived while this one was loading
    pub stale: bool,
}

impl StreamBundle {
    fn empty(viewport: ViewportBounds, role: UserRole) -> Self {
        Self {
            cache_key: String::new(),
            viewport,
            role,
            requested_lod: LodLevel::BuildingOutline,
            lod: LodLevel::BuildingOutline,
            objects: Vec::new(),
            templates: BTreeMap::new(),
            compressed_count: 0,
            estimated_bytes: 0,
            total_bytes: 0,
            budget_bytes: role.budget(),
            utilization: 0.0,
            fits_budget: true,
            from_cache: false,
            partial: false,
            stale: false,
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Rebuild the full objects carried by this bundle.
    ///
    /// Deltas whose template is missing from the bundle are skipped.
    pub fn expand(&self) -> Vec<SpatialObject> {
        self.objects
            .iter()
            .filter_map(|entry| match entry {
                Compressed::Uncompressed { object, .. } => Some(object.clone()),
                Compressed::Delta(delta) => {
                    let base = self.templates.get(&delta.base_object_id)?;
                    let merged = crate::streaming::delta::apply_delta(base, delta);
                    SpatialObject::from_properties(merged).ok()
                }
            })
            .collect()
    }
}

/// Response to a single-object request
#[derive(Clone, Debug, Serialize)]
pub struct ObjectResponse {
    pub object_id: String,
    pub accessible: bool,
    pub from_cache: bool,
    pub object: Option<SpatialObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ObjectResponse {
    fn found(object: SpatialObject, from_cache: bool) -> Self {
        Self {
            object_id: object.id.clone(),
            accessible: true,
            from_cache,
            object: Some(object),
            error: None,
        }
    }

    fn missing(object_id: String, error: Option<String>) -> Self {
        Self {
            object_id,
            accessible: false,
            from_cache: false,
            object: None,
            error,
        }
    }
}

/// Result of a maintenance pass
#[derive(Clone, Debug, Default, Serialize)]
pub struct OptimizationReport {
    pub nearby_evicted: usize,
    pub objects_unloaded: usize,
    pub expired_purged: usize,
    pub templates_removed: usize,
    pub actions: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StreamingStats {
    pub viewport_requests: u64,
    pub bundles_built: u64,
    pub bundle_cache_hits: u64,
    pub stale_bundles: u64,
    pub spatial_failures: u64,
    pub objects_streamed: u64,
    pub objects_compressed: u64,
}

#[derive(Default)]
struct Counters {
    viewport_requests: AtomicU64,
    bundles_built: AtomicU64,
    bundle_cache_hits: AtomicU64,
    stale_bundles: AtomicU64,
    spatial_failures: AtomicU64,
    objects_streamed: AtomicU64,
    objects_compressed: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Viewport, role and level of the most recent full bundle
#[derive(Clone, Debug)]
struct BundleAnchor {
    viewport: ViewportBounds,
    role: UserRole,
    lod: LodLevel,
    cache_key: String,
}

fn object_key(id: &str) -> String {
    format!("object:{id}")
}

/// Streaming orchestrator over a spatial index `S`
pub struct StreamingEngine<S> {
    config: StreamingConfig,
    spatial: Arc<S>,
    loader: ObjectLoader<S>,
    cache: SmartCache<CachedPayload>,
    compressor: Mutex<DifferentialCompressor>,
    disclosure: ProgressiveDisclosure,
    viewports: Mutex<ViewportManager>,
    /// Positions of objects currently held in the cache
    tracked: Mutex<HashMap<String, DVec3>>,
    anchor: Mutex<Option<BundleAnchor>>,
    generation: AtomicU64,
    counters: Counters,
}

impl<S: SpatialQuery> StreamingEngine<S> {
    /// Build an engine over a spatial index.
    ///
    /// # Arguments
    /// * `config` - Streaming configuration, validated before use
    /// * `spatial` - Index the loader and viewport queries read from
    ///
    /// # Returns
    /// The engine, or the first configuration error
    pub fn new(config: StreamingConfig, spatial: Arc<S>) -> Result<Self> {
        config.validate()?;
        let loader = ObjectLoader::new(spatial.clone(), &config.loader)?;
        let cache = SmartCache::new(config.cache.clone())?;

        log::info!(
            "Streaming engine ready (policy {}, {} concurrent loads)",
            config.cache.policy,
            config.loader.max_concurrent
        );

        Ok(Self {
            compressor: Mutex::new(DifferentialCompressor::new(config.compression.clone())),
            disclosure: ProgressiveDisclosure::new(config.lod.clone()),
            viewports: Mutex::new(ViewportManager::new(config.viewport.clone())),
            tracked: Mutex::new(HashMap::new()),
            anchor: Mutex::new(None),
            generation: AtomicU64::new(0),
            counters: Counters::default(),
            loader,
            cache,
            spatial,
            config,
        })
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn current_viewport(&self) -> Option<ViewportBounds> {
        self.viewports.lock().current().copied()
    }

    fn ttl(secs: Option<u64>) -> Option<Duration> {
        secs.map(Duration::from_secs)
    }

    /// Produce the bundle for a new viewport.
    ///
    /// A viewport close enough to the one behind the last bundle (same role
    /// and level, similarity at or above `viewport.similarity_threshold`)
    /// is answered from that bundle without touching the spatial index.
    ///
    /// # Arguments
    /// * `viewport` - Region the client is looking at
    /// * `role` - Consumer role, which caps the bundle size
    ///
    /// # Returns
    /// The bundle for the viewport. Failures are reported through its
    /// `partial` and `fits_budget` flags rather than as errors.
    pub async fn set_viewport(&self, viewport: ViewportBounds, role: UserRole) -> StreamBundle {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        bump(&self.counters.viewport_requests);

        let area = viewport.area();
        if area <= 0.0 || !area.is_finite() {
            log::debug!("Ignoring degenerate viewport {:?}", viewport);
            return StreamBundle::empty(viewport, role);
        }

        let requested = self.disclosure.viewport_lod(area);
        let (bounds, cache_key, similar_key) = {
            let mut viewports = self.viewports.lock();
            viewports.record(viewport);
            let bounds = viewports.query_bounds(&viewport, self.config.viewport.query_mode);
            let key = format!("{}:{}", viewports.cache_key(&viewport, requested), role);
            let similar_key = self
                .anchor
                .lock()
                .as_ref()
                .filter(|a| a.role == role && a.lod == requested && a.cache_key != key)
                .filter(|a| viewports.is_similar(&a.viewport, &viewport, self.config.viewport.similarity_threshold))
                .map(|a| a.cache_key.clone());
            (bounds, key, similar_key)
        };

        if let Some(CachedPayload::Bundle(cached)) = self.cache.get(&cache_key, Some(CacheTier::Active)) {
            self.set_anchor(viewport, role, requested, &cache_key);
            return self.replay(&cached, viewport);
        }
        if let Some(key) = similar_key {
            if let Some(CachedPayload::Bundle(cached)) = self.cache.get(&key, Some(CacheTier::Active)) {
                log::debug!("Viewport within similarity threshold, reusing {}", key);
                return self.replay(&cached, viewport);
            }
        }

        let (candidates, partial) = match self.spatial.query_range(&bounds).await {
            Ok(objects) => (objects, false),
            Err(e) => {
                log::warn!("Spatial query for {} failed: {}", cache_key, e);
                bump(&self.counters.spatial_failures);
                (Vec::new(), true)
            }
        };

        let estimate = self.disclosure.select_level(&candidates, requested, role.budget());
        let visible = self.disclosure.filter_for_level(&candidates, estimate.level);
        self.retain_objects(&visible);

        let (objects, templates) = {
            let mut compressor = self.compressor.lock();
            let objects: Vec<Compressed> = visible.iter().map(|o| compressor.compress(o)).collect();
            let templates: BTreeMap<String, PropertyMap> = objects
                .iter()
                .filter_map(Compressed::template_id)
                .filter_map(|id| compressor.template(id).map(|t| (id.to_string(), t.base.clone())))
                .collect();
            (objects, templates)
        };

        let compressed_count = objects.iter().filter(|c| c.is_compressed()).count();
        self.counters
            .objects_compressed
            .fetch_add(compressed_count as u64, Ordering::Relaxed);

        let budget_bytes = match (self.disclosure.level_budget(estimate.level), role.budget()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let mut budget = BundleBudget::new(budget_bytes);
        budget.add(estimate_size(&objects));
        budget.add(estimate_size(&templates));

        let stale = self.generation.load(Ordering::SeqCst) != generation;
        if stale {
            bump(&self.counters.stale_bundles);
            log::debug!("Bundle {} finished after a newer viewport", cache_key);
        }

        let bundle = StreamBundle {
            cache_key: cache_key.clone(),
            viewport,
            role,
            requested_lod: requested,
            lod: estimate.level,
            compressed_count,
            estimated_bytes: estimate.estimated_bytes,
            total_bytes: budget.used(),
            budget_bytes,
            utilization: budget.pressure(),
            fits_budget: !budget.is_over(),
            from_cache: false,
            partial,
            stale,
            objects,
            templates,
        };

        // Partial results are not worth replaying
        if !partial {
            let payload = CachedPayload::Bundle(Arc::new(bundle.clone()));
            if self.cache.put(cache_key.clone(), payload, CacheTier::Active, Self::ttl(self.config.bundle_ttl_secs)) {
                self.set_anchor(viewport, role, requested, &cache_key);
            } else {
                log::debug!("Bundle of {} bytes not cached", bundle.total_bytes);
            }
        }

        bump(&self.counters.bundles_built);
        log::debug!(
            "Viewport bundle: {} objects at LOD {} ({} bytes, {} compressed)",
            bundle.object_count(),
            bundle.lod.index(),
            bundle.total_bytes,
            bundle.compressed_count
        );
        bundle
    }

    /// Serve a cached bundle for `viewport`
    fn replay(&self, cached: &StreamBundle, viewport: ViewportBounds) -> StreamBundle {
        bump(&self.counters.bundle_cache_hits);
        let mut bundle = cached.clone();
        bundle.viewport = viewport;
        bundle.from_cache = true;
        bundle.stale = false;
        bundle
    }

    fn set_anchor(&self, viewport: ViewportBounds, role: UserRole, lod: LodLevel, cache_key: &str) {
        *self.anchor.lock() = Some(BundleAnchor {
            viewport,
            role,
            lod,
            cache_key: cache_key.to_string(),
        });
    }

    /// Cache objects that are not already held, pinning life-safety ones
    fn retain_objects(&self, objects: &[&SpatialObject]) {
        let ttl = Self::ttl(self.config.object_ttl_secs);
        let mut tracked = self.tracked.lock();
        for object in objects {
            let key = object_key(&object.id);
            if !self.cache.contains(&key) {
                let tier = if object.system_priority == 1 {
                    CacheTier::Critical
                } else {
                    CacheTier::Nearby
                };
                if !self.cache.put(key, CachedPayload::Object(Arc::new((*object).clone())), tier, ttl) {
                    continue;
                }
            }
            tracked.insert(object.id.clone(), object.position());
        }
    }

    /// Fetch one object for drill-in.
    ///
    /// # Arguments
    /// * `id` - Object identifier
    ///
    /// # Returns
    /// The object response; `accessible` is false when it could not be served
    pub async fn stream_object(&self, id: &str) -> ObjectResponse {
        match self.stream_objects(&[id]).await.pop() {
            Some(response) => response,
            None => ObjectResponse::missing(id.to_string(), None),
        }
    }

    /// Fetch several objects, going to the index only for cache misses.
    ///
    /// # Arguments
    /// * `ids` - Object identifiers, earlier ids fetched first
    ///
    /// # Returns
    /// One response per id, in the order of `ids`
    pub async fn stream_objects(&self, ids: &[&str]) -> Vec<ObjectResponse> {
        let mut responses: Vec<Option<ObjectResponse>> = Vec::with_capacity(ids.len());
        let mut misses: Vec<(usize, LoadRequest)> = Vec::new();

        for (i, id) in ids.iter().enumerate() {
            match self.cache.get(&object_key(id), None) {
                Some(CachedPayload::Object(object)) => {
                    responses.push(Some(ObjectResponse::found((*object).clone(), true)));
                }
                _ => {
                    responses.push(None);
                    misses.push((i, LoadRequest::new(*id, (ids.len() - i) as f32)));
                }
            }
        }

        if !misses.is_empty() {
            let (slots, requests): (Vec<usize>, Vec<LoadRequest>) = misses.into_iter().unzip();
            let results = self.loader.load(requests).await;

            let mut loaded = Vec::new();
            for (slot, result) in slots.into_iter().zip(results) {
                responses[slot] = Some(match result {
                    LoadResult::Loaded(object) => {
                        loaded.push(object.clone());
                        ObjectResponse::found(object, false)
                    }
                    LoadResult::NotFound(id) => ObjectResponse::missing(id, None),
                    LoadResult::Error(id, error) => ObjectResponse::missing(id, Some(error)),
                });
            }
            let refs: Vec<&SpatialObject> = loaded.iter().collect();
            self.retain_objects(&refs);
        }

        let responses: Vec<ObjectResponse> = responses
            .into_iter()
            .zip(ids)
            .map(|(r, id)| r.unwrap_or_else(|| ObjectResponse::missing(id.to_string(), None)))
            .collect();
        let served = responses.iter().filter(|r| r.accessible).count();
        self.counters
            .objects_streamed
            .fetch_add(served as u64, Ordering::Relaxed);
        responses
    }

    /// Rebuild an object from one of this engine's deltas
    pub fn reconstruct(&self, delta: &ObjectDelta) -> Decompressed {
        self.compressor.lock().decompress(delta)
    }

    /// Maintenance pass: drop nearby entries, unload objects outside the
    /// current viewport, purge expired entries and prune templates.
    ///
    /// # Returns
    /// Counts of what was dropped and the list of actions taken
    pub fn optimize_bundle(&self) -> OptimizationReport {
        let mut report = OptimizationReport::default();

        match self.cache.evict_tier(CacheTier::Nearby) {
            Ok(n) => report.nearby_evicted = n,
            Err(e) => log::warn!("Nearby eviction failed: {}", e),
        }
        if report.nearby_evicted > 0 {
            report.actions.push(format!("evicted {} nearby entries", report.nearby_evicted));
        }

        let bounds = {
            let viewports = self.viewports.lock();
            viewports
                .current()
                .map(|v| viewports.query_bounds(v, QueryMode::Buffered))
        };
        {
            let mut tracked = self.tracked.lock();
            let mut compressor = self.compressor.lock();
            let outside: Vec<String> = tracked
                .iter()
                .filter(|(_, pos)| bounds.is_none_or(|b| !b.contains_point(**pos)))
                .map(|(id, _)| id.clone())
                .collect();
            for id in outside {
                let key = object_key(&id);
                if self.cache.tier_of(&key) == Some(CacheTier::Critical) {
                    continue;
                }
                self.cache.remove(&key);
                compressor.forget_object(&id);
                tracked.remove(&id);
                report.objects_unloaded += 1;
            }
        }
        if report.objects_unloaded > 0 {
            report
                .actions
                .push(format!("unloaded {} objects outside the viewport", report.objects_unloaded));
        }

        report.expired_purged = self.cache.purge_expired();
        if report.expired_purged > 0 {
            report.actions.push(format!("purged {} expired entries", report.expired_purged));
        }

        let pruned = self.compressor.lock().optimize_templates();
        report.templates_removed = pruned.removed.len();
        if report.templates_removed > 0 {
            report
                .actions
                .push(format!("removed {} weak templates", report.templates_removed));
        }

        log::info!("Optimization pass: {:?}", report.actions);
        report
    }

    pub fn cache_status(&self) -> CacheStatus {
        self.cache.status()
    }

    pub fn stats(&self) -> StreamingStats {
        let c = &self.counters;
        StreamingStats {
            viewport_requests: c.viewport_requests.load(Ordering::Relaxed),
            bundles_built: c.bundles_built.load(Ordering::Relaxed),
            bundle_cache_hits: c.bundle_cache_hits.load(Ordering::Relaxed),
            stale_bundles: c.stale_bundles.load(Ordering::Relaxed),
            spatial_failures: c.spatial_failures.load(Ordering::Relaxed),
            objects_streamed: c.objects_streamed.load(Ordering::Relaxed),
            objects_compressed: c.objects_compressed.load(Ordering::Relaxed),
        }
    }
}
