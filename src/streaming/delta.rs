//! Template/delta compression for near-duplicate objects
//!
//! Objects of the same `(type, system_type)` that score above the similarity
//! threshold share a [`CompressionTemplate`] holding their common properties.
//! Each member is then stored as an [`ObjectDelta`] carrying only the
//! properties that diverge from the template base.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::PropertyMap;
use crate::object::SpatialObject;
use crate::streaming::binary::{BinaryConfig, BinaryOptimizer};

/// Properties always kept in a template base
const ESSENTIAL_KEYS: [&str; 3] = ["type", "system_type", "precision"];

/// Geometry keys kept in the base when members are geometrically close
const GEOMETRY_KEYS: [&str; 2] = ["dimensions", "shape_type"];

/// Metadata fields compared by string similarity
const METADATA_FIELDS: [&str; 4] = ["manufacturer", "model_number", "material", "specification"];

/// Keys scored by a dedicated component, or identity, and so left out of
/// the remainder comparison
const SCORED_KEYS: [&str; 8] = [
    "id",
    "position",
    "type",
    "system_type",
    "dimensions",
    "shape_type",
    "metadata",
    "precision",
];

/// Geometry similarity at which dimensions stay in the shared base
const GEOMETRY_KEEP_THRESHOLD: f64 = 0.95;

/// Weights of the similarity components
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub object_type: f64,
    pub system_type: f64,
    pub geometry: f64,
    pub metadata: f64,
    pub precision: f64,
    pub remainder: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            object_type: 0.30,
            system_type: 0.20,
            geometry: 0.20,
            metadata: 0.15,
            precision: 0.10,
            remainder: 0.05,
        }
    }
}

impl SimilarityWeights {
    pub fn total(&self) -> f64 {
        self.object_type + self.system_type + self.geometry + self.metadata + self.precision + self.remainder
    }
}

/// Configuration for the differential compressor
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Minimum similarity for an object to join or form a template
    pub similarity_threshold: f64,
    /// Templates kept before the least used one is evicted
    pub max_templates: usize,
    /// Uncompressed candidates remembered per `(type, system_type)` pool
    pub max_pending_candidates: usize,
    pub weights: SimilarityWeights,
    /// Encoder used for size accounting
    pub binary: BinaryConfig,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.9,
            max_templates: 100,
            max_pending_candidates: 256,
            weights: SimilarityWeights::default(),
            binary: BinaryConfig::default(),
        }
    }
}

/// Shared base for a group of similar objects
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompressionTemplate {
    pub id: String,
    pub object_type: String,
    pub system_type: String,
    pub base: PropertyMap,
    pub members: BTreeSet<String>,
    /// Lowest similarity observed when a member joined
    pub similarity: f64,
    pub usage_count: u64,
    #[serde(skip)]
    last_used: u64,
}

/// Per-object difference from a template base
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ObjectDelta {
    /// Id of the template this delta applies to
    pub base_object_id: String,
    pub target_object_id: String,
    pub differences: PropertyMap,
    pub compression_ratio: f64,
    /// Base keys the object does not have
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

/// Why an object was returned verbatim
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UncompressedReason {
    MissingId,
    NoSimilarObjects,
}

/// Outcome of [`DifferentialCompressor::compress`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Compressed {
    Delta(ObjectDelta),
    Uncompressed {
        object: SpatialObject,
        reason: UncompressedReason,
    },
}

impl Compressed {
    pub fn is_compressed(&self) -> bool {
        matches!(self, Compressed::Delta(_))
    }

    pub fn object_id(&self) -> &str {
        match self {
            Compressed::Delta(delta) => &delta.target_object_id,
            Compressed::Uncompressed { object, .. } => &object.id,
        }
    }

    pub fn template_id(&self) -> Option<&str> {
        match self {
            Compressed::Delta(delta) => Some(&delta.base_object_id),
            Compressed::Uncompressed { .. } => None,
        }
    }
}

/// Outcome of [`DifferentialCompressor::decompress`]
#[derive(Clone, Debug, PartialEq)]
pub enum Decompressed {
    Object(SpatialObject),
    /// The template is gone or the merge did not form a valid object
    Unresolved { delta: ObjectDelta, error: String },
}

/// Result of a template maintenance pass
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TemplateOptimization {
    pub removed: Vec<String>,
    pub remaining: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CompressionStats {
    pub objects_compressed: u64,
    pub objects_uncompressed: u64,
    pub templates_created: u64,
    pub templates_evicted: u64,
    pub decompression_misses: u64,
    /// Running mean of delta compression ratios
    pub average_ratio: f64,
}

type PoolKey = (String, String);

/// Template-based compressor.
///
/// Not internally synchronized; the engine wraps it in a mutex.
pub struct DifferentialCompressor {
    config: CompressionConfig,
    optimizer: BinaryOptimizer,
    templates: HashMap<String, CompressionTemplate>,
    mappings: HashMap<String, String>,
    deltas: HashMap<String, ObjectDelta>,
    pending: HashMap<PoolKey, VecDeque<(String, PropertyMap)>>,
    template_counter: u64,
    tick: u64,
    stats: CompressionStats,
}

impl DifferentialCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        let optimizer = BinaryOptimizer::new(config.binary.clone());
        Self {
            config,
            optimizer,
            templates: HashMap::new(),
            mappings: HashMap::new(),
            deltas: HashMap::new(),
            pending: HashMap::new(),
            template_counter: 0,
            tick: 0,
            stats: CompressionStats::default(),
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    pub fn template(&self, id: &str) -> Option<&CompressionTemplate> {
        self.templates.get(id)
    }

    pub fn template_count(&self) -> usize {
        self.templates.len()
    }

    pub fn templates(&self) -> impl Iterator<Item = &CompressionTemplate> {
        self.templates.values()
    }

    /// Stored delta for a compressed object
    pub fn delta_for(&self, object_id: &str) -> Option<&ObjectDelta> {
        self.deltas.get(object_id)
    }

    pub fn template_for(&self, object_id: &str) -> Option<&CompressionTemplate> {
        self.mappings.get(object_id).and_then(|t| self.templates.get(t))
    }

    /// Weighted similarity of two property maps, clamped to [0, 1]
    pub fn similarity(&self, a: &PropertyMap, b: &PropertyMap) -> f64 {
        let w = &self.config.weights;
        let score = w.object_type * exact_match(a, b, "type")
            + w.system_type * exact_match(a, b, "system_type")
            + w.geometry * geometry_similarity(a, b)
            + w.metadata * metadata_similarity(a, b)
            + w.precision * precision_similarity(a, b)
            + w.remainder * remainder_similarity(a, b);
        score.clamp(0.0, 1.0)
    }

    /// Compress an object against existing templates or pending candidates.
    ///
    /// # Arguments
    /// * `object` - Object to compress
    ///
    /// # Returns
    /// A delta against a template, or the object unchanged when nothing
    /// similar has been seen yet
    pub fn compress(&mut self, object: &SpatialObject) -> Compressed {
        if object.id.is_empty() {
            self.stats.objects_uncompressed += 1;
            return Compressed::Uncompressed {
                object: object.clone(),
                reason: UncompressedReason::MissingId,
            };
        }

        self.tick += 1;
        let properties = object.to_properties();

        // Existing mapping
        if let Some(template_id) = self.mappings.get(&object.id).cloned() {
            if self.templates.contains_key(&template_id) {
                return Compressed::Delta(self.attach(&template_id, &object.id, &properties, None));
            }
            self.mappings.remove(&object.id);
        }

        // Best matching template of the same kind
        let threshold = self.config.similarity_threshold;
        let best = self
            .templates
            .values()
            .filter(|t| t.object_type == object.object_type && t.system_type == object.system_type)
            .map(|t| (t.id.clone(), self.similarity(&t.base, &properties)))
            .filter(|(_, score)| *score >= threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(&a.0)));

        if let Some((template_id, score)) = best {
            log::debug!("{} joins template {} ({:.3})", object.id, template_id, score);
            return Compressed::Delta(self.attach(&template_id, &object.id, &properties, Some(score)));
        }

        // Pending candidates
        let key = (object.object_type.clone(), object.system_type.clone());
        let pool = self.pending.remove(&key).unwrap_or_default();
        let (similar, rest): (Vec<_>, Vec<_>) = pool
            .into_iter()
            .filter(|(id, _)| id != &object.id)
            .partition(|(_, props)| self.similarity(props, &properties) >= threshold);
        let mut rest: VecDeque<_> = rest.into();

        if similar.is_empty() {
            rest.push_back((object.id.clone(), properties));
            while rest.len() > self.config.max_pending_candidates {
                rest.pop_front();
            }
            self.pending.insert(key, rest);
            self.stats.objects_uncompressed += 1;
            return Compressed::Uncompressed {
                object: object.clone(),
                reason: UncompressedReason::NoSimilarObjects,
            };
        }

        if !rest.is_empty() {
            self.pending.insert(key, rest);
        }

        let template_id = self.create_template(object, &properties, similar);
        let delta = self
            .deltas
            .get(&object.id)
            .cloned()
            .unwrap_or_else(|| self.attach(&template_id, &object.id, &properties, None));
        self.enforce_template_cap(&template_id);
        Compressed::Delta(delta)
    }

    /// Rebuild the object a delta describes.
    ///
    /// # Arguments
    /// * `delta` - Delta produced by `compress`
    ///
    /// # Returns
    /// The rebuilt object, or `Decompressed::Unresolved` when the template is gone
    pub fn decompress(&mut self, delta: &ObjectDelta) -> Decompressed {
        let Some(template) = self.templates.get(&delta.base_object_id) else {
            log::error!(
                "Template {} for {} no longer exists",
                delta.base_object_id,
                delta.target_object_id
            );
            self.stats.decompression_misses += 1;
            return Decompressed::Unresolved {
                delta: delta.clone(),
                error: format!("template {} not found", delta.base_object_id),
            };
        };

        let merged = apply_delta(&template.base, delta);
        match SpatialObject::from_properties(merged) {
            Ok(object) => Decompressed::Object(object),
            Err(e) => {
                log::warn!("Delta for {} did not rebuild: {}", delta.target_object_id, e);
                self.stats.decompression_misses += 1;
                Decompressed::Unresolved {
                    delta: delta.clone(),
                    error: e.to_string(),
                }
            }
        }
    }

    /// Drop templates that lost their members or their similarity
    pub fn optimize_templates(&mut self) -> TemplateOptimization {
        let floor = self.config.similarity_threshold - 0.1;
        let mut doomed: Vec<String> = self
            .templates
            .values()
            .filter(|t| t.members.len() < 2 || t.similarity < floor)
            .map(|t| t.id.clone())
            .collect();
        doomed.sort();

        for id in &doomed {
            self.drop_template(id);
        }
        if !doomed.is_empty() {
            log::info!("Template pass removed {} template(s)", doomed.len());
        }

        TemplateOptimization {
            removed: doomed,
            remaining: self.templates.len(),
        }
    }

    /// Forget an object entirely; its template goes too if fewer than two
    /// members remain
    pub fn forget_object(&mut self, object_id: &str) -> bool {
        let mut found = self.deltas.remove(object_id).is_some();

        for pool in self.pending.values_mut() {
            let before = pool.len();
            pool.retain(|(id, _)| id != object_id);
            found |= pool.len() != before;
        }
        self.pending.retain(|_, pool| !pool.is_empty());

        if let Some(template_id) = self.mappings.remove(object_id) {
            found = true;
            let orphaned = match self.templates.get_mut(&template_id) {
                Some(template) => {
                    template.members.remove(object_id);
                    template.members.len() < 2
                }
                None => false,
            };
            if orphaned {
                self.drop_template(&template_id);
            }
        }
        found
    }

    fn create_template(
        &mut self,
        object: &SpatialObject,
        properties: &PropertyMap,
        candidates: Vec<(String, PropertyMap)>,
    ) -> String {
        let mut group: Vec<(String, PropertyMap)> = Vec::with_capacity(candidates.len() + 1);
        group.push((object.id.clone(), properties.clone()));
        group.extend(candidates);

        let base = self.common_properties(&group);
        let similarity = group[1..]
            .iter()
            .map(|(_, props)| self.similarity(props, properties))
            .fold(1.0, f64::min);

        self.template_counter += 1;
        let id = format!("{}_template_{:04}", object.object_type, self.template_counter);
        log::debug!("Created template {} from {} objects", id, group.len());

        self.templates.insert(
            id.clone(),
            CompressionTemplate {
                id: id.clone(),
                object_type: object.object_type.clone(),
                system_type: object.system_type.clone(),
                base,
                members: BTreeSet::new(),
                similarity,
                usage_count: 0,
                last_used: self.tick,
            },
        );
        self.stats.templates_created += 1;

        for (member_id, member_props) in &group {
            self.attach(&id, member_id, member_props, None);
        }
        id
    }

    /// Properties shared by every group member.
    ///
    /// Essential keys always come from the first member; geometry keys do
    /// too while the group is geometrically close.
    fn common_properties(&self, group: &[(String, PropertyMap)]) -> PropertyMap {
        let Some((_, first)) = group.first() else {
            return PropertyMap::new();
        };
        let close_geometry = group[1..]
            .iter()
            .all(|(_, props)| geometry_similarity(first, props) >= GEOMETRY_KEEP_THRESHOLD);

        first
            .iter()
            .filter(|(key, value)| {
                let key = key.as_str();
                key != "id"
                    && (ESSENTIAL_KEYS.contains(&key)
                        || (close_geometry && GEOMETRY_KEYS.contains(&key))
                        || group[1..].iter().all(|(_, props)| props.get(key) == Some(*value)))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Record `object_id` as a member of `template_id` and store its delta
    fn attach(
        &mut self,
        template_id: &str,
        object_id: &str,
        properties: &PropertyMap,
        score: Option<f64>,
    ) -> ObjectDelta {
        let tick = self.tick;
        let Some(template) = self.templates.get_mut(template_id) else {
            // Callers only pass resident templates
            return ObjectDelta {
                base_object_id: template_id.to_string(),
                target_object_id: object_id.to_string(),
                differences: properties.clone(),
                compression_ratio: 1.0,
                removed: Vec::new(),
            };
        };

        template.members.insert(object_id.to_string());
        template.usage_count += 1;
        template.last_used = tick;
        if let Some(score) = score {
            template.similarity = template.similarity.min(score);
        }

        let (differences, removed) = diff_properties(&template.base, properties);
        let members = template.members.len().max(1);
        let base_size = self.optimizer.encoded_size(&template.base);
        let original_size = self.optimizer.encoded_size(properties).max(1);
        let delta_size = self.optimizer.encoded_size(&differences);
        let compression_ratio = (delta_size as f64 + base_size as f64 / members as f64) / original_size as f64;

        let delta = ObjectDelta {
            base_object_id: template_id.to_string(),
            target_object_id: object_id.to_string(),
            differences,
            compression_ratio,
            removed,
        };

        self.mappings.insert(object_id.to_string(), template_id.to_string());
        self.deltas.insert(object_id.to_string(), delta.clone());

        self.stats.objects_compressed += 1;
        let n = self.stats.objects_compressed as f64;
        self.stats.average_ratio += (compression_ratio - self.stats.average_ratio) / n;
        delta
    }

    /// Evict least used templates until under the cap, sparing `keep`
    fn enforce_template_cap(&mut self, keep: &str) {
        while self.templates.len() > self.config.max_templates {
            let victim = self
                .templates
                .values()
                .filter(|t| t.id != keep)
                .min_by(|a, b| {
                    a.usage_count
                        .cmp(&b.usage_count)
                        .then(a.last_used.cmp(&b.last_used))
                })
                .map(|t| t.id.clone());
            match victim {
                Some(id) => {
                    log::debug!("Evicting template {}", id);
                    self.drop_template(&id);
                    self.stats.templates_evicted += 1;
                }
                None => break,
            }
        }
    }

    fn drop_template(&mut self, template_id: &str) {
        if let Some(template) = self.templates.remove(template_id) {
            for member in &template.members {
                if self.mappings.get(member).is_some_and(|t| t == template_id) {
                    self.mappings.remove(member);
                    self.deltas.remove(member);
                }
            }
        }
    }
}

impl Default for DifferentialCompressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default())
    }
}

/// Keys of `properties` that differ from `base`, plus base keys it lacks
fn diff_properties(base: &PropertyMap, properties: &PropertyMap) -> (PropertyMap, Vec<String>) {
    let differences: PropertyMap = properties
        .iter()
        .filter(|(k, v)| base.get(k.as_str()) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let removed = base
        .keys()
        .filter(|k| !properties.contains_key(k.as_str()))
        .cloned()
        .collect();
    (differences, removed)
}

/// `base` with `removed` keys dropped and `differences` laid over it
pub fn apply_delta(base: &PropertyMap, delta: &ObjectDelta) -> PropertyMap {
    let mut merged = base.clone();
    for key in &delta.removed {
        merged.remove(key);
    }
    for (key, value) in &delta.differences {
        merged.insert(key.clone(), value.clone());
    }
    merged
}

fn exact_match(a: &PropertyMap, b: &PropertyMap, key: &str) -> f64 {
    if a.get(key) == b.get(key) { 1.0 } else { 0.0 }
}

fn dimension(props: &PropertyMap, axis: &str) -> Option<f64> {
    props.get("dimensions")?.get(axis)?.as_f64()
}

fn geometry_similarity(a: &PropertyMap, b: &PropertyMap) -> f64 {
    let diffs: Vec<f64> = ["length", "width", "height"]
        .iter()
        .filter_map(|axis| {
            let (x, y) = (dimension(a, axis)?, dimension(b, axis)?);
            let scale = x.abs().max(y.abs());
            Some(if scale > 0.0 { (x - y).abs() / scale } else { 0.0 })
        })
        .collect();

    let dims = if diffs.is_empty() {
        if a.contains_key("dimensions") == b.contains_key("dimensions") { 1.0 } else { 0.0 }
    } else {
        1.0 - diffs.iter().sum::<f64>() / diffs.len() as f64
    };
    let shape = if a.get("shape_type") == b.get("shape_type") { 1.0 } else { 0.7 };

    (dims * 0.7 + shape * 0.3).clamp(0.0, 1.0)
}

fn string_similarity(a: &str, b: &str) -> f64 {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    if a == b {
        return 1.0;
    }
    similar::TextDiff::from_chars(a.as_str(), b.as_str()).ratio() as f64
}

fn metadata_similarity(a: &PropertyMap, b: &PropertyMap) -> f64 {
    let field = |props: &PropertyMap, name: &str| -> Option<String> {
        props
            .get("metadata")?
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let scores: Vec<f64> = METADATA_FIELDS
        .iter()
        .filter_map(|name| match (field(a, name), field(b, name)) {
            (None, None) => None,
            (Some(x), Some(y)) => Some(string_similarity(&x, &y)),
            _ => Some(0.0),
        })
        .collect();

    if scores.is_empty() {
        1.0
    } else {
        scores.iter().sum::<f64>() / scores.len() as f64
    }
}

fn precision_similarity(a: &PropertyMap, b: &PropertyMap) -> f64 {
    if a.get("precision") == b.get("precision") { 1.0 } else { 0.8 }
}

fn remainder_similarity(a: &PropertyMap, b: &PropertyMap) -> f64 {
    let keys: BTreeSet<&str> = a
        .keys()
        .chain(b.keys())
        .map(String::as_str)
        .filter(|k| !SCORED_KEYS.contains(k))
        .collect();
    if keys.is_empty() {
        return 1.0;
    }
    let equal = keys.iter().filter(|k| a.get(**k) == b.get(**k)).count();
    equal as f64 / keys.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Metadata;
    use proptest::prelude::*;
    use serde_json::json;

    fn outlet(id: &str, x: f64) -> SpatialObject {
        SpatialObject::new(id, "electrical_outlet", "electrical", 3)
            .with_position(x, 2.0, 0.3)
            .with_dimensions(0.1, 0.05, 0.1)
            .with_precision("standard")
            .with_metadata(Metadata {
                manufacturer: Some("Leviton".into()),
                model_number: Some("5320-W".into()),
                ..Default::default()
            })
    }

    fn roundtrip(compressor: &mut DifferentialCompressor, object: &SpatialObject) {
        let delta = compressor.delta_for(&object.id).cloned().unwrap();
        match compressor.decompress(&delta) {
            Decompressed::Object(back) => assert_eq!(&back, object),
            Decompressed::Unresolved { error, .. } => panic!("unresolved: {}", error),
        }
    }

    #[test]
    fn test_weights_sum_to_one() {
        assert!((SimilarityWeights::default().total() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_identical_objects_score_one() {
        let c = DifferentialCompressor::default();
        let a = outlet("a", 1.0).to_properties();
        let b = outlet("b", 9.0).to_properties();
        assert!((c.similarity(&a, &b) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_type_mismatch_drops_score() {
        let c = DifferentialCompressor::default();
        let a = outlet("a", 1.0).to_properties();
        let mut switch = outlet("b", 1.0);
        switch.object_type = "light_switch".into();
        let score = c.similarity(&a, &switch.to_properties());
        assert!((score - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_metadata_similarity_is_case_insensitive() {
        let a = outlet("a", 1.0).to_properties();
        let mut other = outlet("b", 1.0);
        other.metadata.manufacturer = Some("LEVITON".into());
        assert_eq!(metadata_similarity(&a, &other.to_properties()), 1.0);

        other.metadata.manufacturer = None;
        // manufacturer 0.0, model_number 1.0
        assert!((metadata_similarity(&a, &other.to_properties()) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_geometry_similarity_tolerates_small_changes() {
        let a = outlet("a", 1.0).to_properties();
        let b = outlet("b", 1.0).with_dimensions(0.1, 0.05, 0.11).to_properties();
        let score = geometry_similarity(&a, &b);
        assert!(score > 0.95 && score < 1.0);

        let c = outlet("c", 1.0).with_shape("cylinder").to_properties();
        assert!((geometry_similarity(&a, &c) - 0.91).abs() < 1e-9);
    }

    #[test]
    fn test_two_outlets_form_template() {
        let mut c = DifferentialCompressor::default();
        let first = outlet("outlet-1", 1.0);
        let second = outlet("outlet-2", 4.0);

        let r1 = c.compress(&first);
        assert_eq!(
            r1,
            Compressed::Uncompressed {
                object: first.clone(),
                reason: UncompressedReason::NoSimilarObjects
            }
        );

        let r2 = c.compress(&second);
        assert!(r2.is_compressed());
        assert_eq!(c.template_count(), 1);

        let template = c.template_for("outlet-1").unwrap();
        assert_eq!(template.id, "electrical_outlet_template_0001");
        let members: Vec<&str> = template.members.iter().map(String::as_str).collect();
        assert_eq!(members, vec!["outlet-1", "outlet-2"]);

        for id in ["outlet-1", "outlet-2"] {
            let delta = c.delta_for(id).unwrap();
            let keys: BTreeSet<&str> = delta.differences.keys().map(String::as_str).collect();
            assert_eq!(keys, BTreeSet::from(["id", "position"]));
            assert!(delta.removed.is_empty());
        }

        roundtrip(&mut c, &first);
        roundtrip(&mut c, &second);
    }

    #[test]
    fn test_third_object_joins_existing_template() {
        let mut c = DifferentialCompressor::default();
        c.compress(&outlet("o1", 1.0));
        c.compress(&outlet("o2", 2.0));
        let third = outlet("o3", 3.0);
        let result = c.compress(&third);

        assert_eq!(result.template_id(), Some("electrical_outlet_template_0001"));
        assert_eq!(c.template_count(), 1);
        assert_eq!(c.template_for("o3").unwrap().members.len(), 3);
        roundtrip(&mut c, &third);
    }

    #[test]
    fn test_mapped_object_reuses_template() {
        let mut c = DifferentialCompressor::default();
        c.compress(&outlet("o1", 1.0));
        c.compress(&outlet("o2", 2.0));

        let moved = outlet("o1", 7.5);
        let result = c.compress(&moved);
        assert_eq!(result.template_id(), Some("electrical_outlet_template_0001"));
        roundtrip(&mut c, &moved);
    }

    #[test]
    fn test_dissimilar_kinds_never_share() {
        let mut c = DifferentialCompressor::default();
        c.compress(&outlet("o1", 1.0));
        let duct = SpatialObject::new("d1", "duct", "hvac", 3);
        let result = c.compress(&duct);
        assert!(!result.is_compressed());
        assert_eq!(c.template_count(), 0);
    }

    #[test]
    fn test_missing_id_is_uncompressed() {
        let mut c = DifferentialCompressor::default();
        let result = c.compress(&outlet("", 1.0));
        assert!(matches!(
            result,
            Compressed::Uncompressed { reason: UncompressedReason::MissingId, .. }
        ));
    }

    #[test]
    fn test_base_keys_missing_from_object_are_recorded() {
        let mut c = DifferentialCompressor::default();
        c.compress(&outlet("o1", 1.0).with_extension("voltage", json!(120)));
        c.compress(&outlet("o2", 2.0).with_extension("voltage", json!(120)));

        // Joins by similarity but lacks voltage
        let bare = outlet("o3", 3.0);
        c.compress(&bare);
        let delta = c.delta_for("o3").unwrap();
        assert_eq!(delta.removed, vec!["voltage".to_string()]);
        roundtrip(&mut c, &bare);
    }

    #[test]
    fn test_decompress_without_template_is_unresolved() {
        let mut c = DifferentialCompressor::default();
        c.compress(&outlet("o1", 1.0));
        c.compress(&outlet("o2", 2.0));
        let delta = c.delta_for("o1").cloned().unwrap();

        c.forget_object("o2");
        assert_eq!(c.template_count(), 0);

        match c.decompress(&delta) {
            Decompressed::Unresolved { delta: back, error } => {
                assert_eq!(back, delta);
                assert!(error.contains("not found"));
            }
            other => panic!("expected unresolved, got {:?}", other),
        }
        assert_eq!(c.stats().decompression_misses, 1);
    }

    #[test]
    fn test_template_cap_evicts_least_used() {
        let mut c = DifferentialCompressor::new(CompressionConfig {
            max_templates: 1,
            ..Default::default()
        });
        c.compress(&outlet("o1", 1.0));
        c.compress(&outlet("o2", 2.0));
        c.compress(&outlet("o3", 3.0));

        let duct = |id: &str| SpatialObject::new(id, "duct", "hvac", 3);
        c.compress(&duct("d1"));
        c.compress(&duct("d2"));

        assert_eq!(c.template_count(), 1);
        assert!(c.template_for("o1").is_none());
        assert!(c.delta_for("o1").is_none());
        assert!(c.template_for("d1").is_some());
        assert_eq!(c.stats().templates_evicted, 1);

        // Evicted members compress again from scratch
        assert!(!c.compress(&outlet("o1", 1.0)).is_compressed());
    }

    #[test]
    fn test_optimize_templates_drops_weak_templates() {
        let mut c = DifferentialCompressor::default();
        c.compress(&outlet("o1", 1.0));
        c.compress(&outlet("o2", 2.0));
        let id = c.template_for("o1").unwrap().id.clone();

        let report = c.optimize_templates();
        assert!(report.removed.is_empty());
        assert_eq!(report.remaining, 1);

        c.templates.get_mut(&id).unwrap().similarity = 0.5;
        let report = c.optimize_templates();
        assert_eq!(report.removed, vec![id]);
        assert!(c.delta_for("o1").is_none());
    }

    #[test]
    fn test_compression_ratio_is_reported() {
        let mut c = DifferentialCompressor::default();
        let notes = json!("x".repeat(300));
        c.compress(&outlet("o1", 1.0).with_extension("notes", notes.clone()));
        c.compress(&outlet("o2", 2.0).with_extension("notes", notes));
        let delta = c.delta_for("o2").unwrap();
        assert!(delta.compression_ratio > 0.0 && delta.compression_ratio < 1.0);
        assert!(c.stats().average_ratio > 0.0);
    }

    #[test]
    fn test_delta_wire_form() {
        let mut c = DifferentialCompressor::default();
        c.compress(&outlet("o1", 1.0));
        let Compressed::Delta(delta) = c.compress(&outlet("o2", 2.0)) else {
            panic!("expected delta");
        };
        let wire = serde_json::to_value(&delta).unwrap();
        assert_eq!(wire["base_object_id"], json!("electrical_outlet_template_0001"));
        assert_eq!(wire["target_object_id"], json!("o2"));
        assert_eq!(wire["differences"]["position"], json!([2.0, 2.0, 0.3]));
        assert!(wire.get("removed").is_none());
    }

    proptest! {
        #[test]
        fn prop_decompress_restores_object(
            positions in prop::collection::vec(prop::array::uniform3(-500.0f64..500.0), 1..12),
            heights in prop::collection::vec(0.05f64..0.2, 12),
        ) {
            let mut c = DifferentialCompressor::default();
            let objects: Vec<SpatialObject> = positions
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    outlet(&format!("o{i}"), p[0])
                        .with_position(p[0], p[1], p[2])
                        .with_dimensions(0.1, 0.05, heights[i])
                })
                .collect();

            for object in &objects {
                c.compress(object);
            }
            for object in &objects {
                if let Some(delta) = c.delta_for(&object.id).cloned() {
                    prop_assert_eq!(c.decompress(&delta), Decompressed::Object(object.clone()));
                }
            }
        }
    }
}
