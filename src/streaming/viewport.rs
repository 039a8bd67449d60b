//! Viewport tracking, query bounds and motion prediction

use std::collections::VecDeque;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::types::DVec3;
use crate::math::Aabb;
use crate::streaming::lod::LodLevel;

/// Region of interest for one consumer.
///
/// `extents` are full width (x), height (y) and depth (z).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViewportBounds {
    pub center: DVec3,
    pub extents: DVec3,
    pub zoom_level: i32,
    pub rotation: f64,
}

impl ViewportBounds {
    pub fn new(center: DVec3, extents: DVec3, zoom_level: i32) -> Self {
        Self {
            center,
            extents,
            zoom_level,
            rotation: 0.0,
        }
    }

    /// Plan area (width * height)
    pub fn area(&self) -> f64 {
        self.extents.x.max(0.0) * self.extents.y.max(0.0)
    }

    pub fn volume(&self) -> f64 {
        self.area() * self.extents.z.max(0.0)
    }

    pub fn to_aabb(&self) -> Aabb {
        Aabb::from_center_half_extent(self.center, self.extents.max(DVec3::ZERO) * 0.5)
    }
}

/// How far beyond the visible region to query
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    Exact,
    #[default]
    Buffered,
    Predictive,
}

/// Configuration for viewport handling
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewportConfig {
    /// Viewports kept for motion prediction
    pub history_size: usize,
    /// Scale applied to the visible box in buffered and predictive modes
    pub buffer_factor: f64,
    /// Lookahead for predictive queries (seconds)
    pub prediction_horizon_secs: f64,
    /// Grid size used when rounding viewports into cache keys
    pub key_resolution: f64,
    /// Zoom steps ignored by similarity checks
    pub zoom_tolerance: u32,
    /// Similarity at or above which a viewport reuses the previous bundle
    pub similarity_threshold: f64,
    pub query_mode: QueryMode,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            history_size: 10,
            buffer_factor: 1.5,
            prediction_horizon_secs: 2.0,
            key_resolution: 0.1,
            zoom_tolerance: 0,
            similarity_threshold: 0.95,
            query_mode: QueryMode::Buffered,
        }
    }
}

/// Sample of a viewport and the time it was set.
#[derive(Clone, Copy, Debug)]
struct ViewportSample {
    viewport: ViewportBounds,
    time: f64,
}

/// Estimated viewport motion
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Movement {
    /// Unit direction, or zero when stationary
    pub direction: DVec3,
    /// Units per second
    pub speed: f64,
}

impl Movement {
    pub fn velocity(&self) -> DVec3 {
        self.direction * self.speed
    }
}

/// Tracks recent viewports and turns them into spatial queries.
pub struct ViewportManager {
    config: ViewportConfig,
    /// Oldest first
    history: VecDeque<ViewportSample>,
    started: Instant,
}

impl ViewportManager {
    pub fn new(config: ViewportConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_size),
            config,
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &ViewportConfig {
        &self.config
    }

    /// Record a viewport at the current time
    pub fn record(&mut self, viewport: ViewportBounds) {
        let now = self.started.elapsed().as_secs_f64();
        self.record_at(viewport, now);
    }

    /// Record a viewport at `time` seconds on the manager's clock
    pub fn record_at(&mut self, viewport: ViewportBounds, time: f64) {
        self.history.push_back(ViewportSample { viewport, time });
        while self.history.len() > self.config.history_size.max(1) {
            self.history.pop_front();
        }
    }

    /// Most recently recorded viewport
    pub fn current(&self) -> Option<&ViewportBounds> {
        self.history.back().map(|s| &s.viewport)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Motion between the last two samples.
    ///
    /// Zero with fewer than two samples or no elapsed time.
    pub fn movement(&self) -> Movement {
        let n = self.history.len();
        if n < 2 {
            return Movement::default();
        }
        let (prev, last) = (&self.history[n - 2], &self.history[n - 1]);
        let elapsed = last.time - prev.time;
        if elapsed <= 0.0 {
            return Movement::default();
        }

        let displacement = last.viewport.center - prev.viewport.center;
        let distance = displacement.length();
        if distance == 0.0 {
            return Movement::default();
        }
        Movement {
            direction: displacement / distance,
            speed: distance / elapsed,
        }
    }

    /// Region to hand to the spatial index for `viewport`
    pub fn query_bounds(&self, viewport: &ViewportBounds, mode: QueryMode) -> Aabb {
        let exact = viewport.to_aabb();
        match mode {
            QueryMode::Exact => exact,
            QueryMode::Buffered => exact.scaled(self.config.buffer_factor),
            QueryMode::Predictive => {
                let buffered = exact.scaled(self.config.buffer_factor);
                let offset = self.movement().velocity() * self.config.prediction_horizon_secs;
                buffered.merged(&buffered.translated(offset))
            }
        }
    }

    /// Cache key for a viewport at a given level.
    ///
    /// Center and extents are snapped to `key_resolution` so small jitter
    /// maps to the same key.
    pub fn cache_key(&self, viewport: &ViewportBounds, lod: LodLevel) -> String {
        let resolution = if self.config.key_resolution > 0.0 {
            self.config.key_resolution
        } else {
            0.1
        };
        let snap = |v: DVec3| -> [i64; 3] {
            [
                (v.x / resolution).round() as i64,
                (v.y / resolution).round() as i64,
                (v.z / resolution).round() as i64,
            ]
        };

        let mut hasher = DefaultHasher::new();
        snap(viewport.center).hash(&mut hasher);
        snap(viewport.extents).hash(&mut hasher);
        viewport.zoom_level.hash(&mut hasher);
        format!("viewport_{:016x}_lod{}", hasher.finish(), lod.index())
    }

    /// Similarity in [0, 1] from center distance, size and zoom
    pub fn similarity(&self, a: &ViewportBounds, b: &ViewportBounds) -> f64 {
        let scale = (a.extents.truncate().length()).max(b.extents.truncate().length()) * 0.5;
        let distance = (a.center - b.center).length();
        let center = if scale > 0.0 {
            1.0 - (distance / scale).min(1.0)
        } else if distance == 0.0 {
            1.0
        } else {
            0.0
        };

        let (area_a, area_b) = (a.area(), b.area());
        let larger = area_a.max(area_b);
        let size = if larger > 0.0 {
            1.0 - (area_a - area_b).abs() / larger
        } else {
            1.0
        };

        let zoom_steps = a.zoom_level.abs_diff(b.zoom_level).saturating_sub(self.config.zoom_tolerance);
        let zoom = 1.0 / (1.0 + zoom_steps as f64);

        0.5 * center + 0.3 * size + 0.2 * zoom
    }

    /// True if the two viewports are close enough to skip a reload
    pub fn is_similar(&self, a: &ViewportBounds, b: &ViewportBounds, threshold: f64) -> bool {
        self.similarity(a, b) >= threshold
    }
}

impl Default for ViewportManager {
    fn default() -> Self {
        Self::new(ViewportConfig::default())
    }
}
