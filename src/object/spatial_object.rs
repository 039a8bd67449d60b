//! Spatial object model

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{DVec3, PropertyMap};
use crate::math::Aabb;

/// Object dimensions in meters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub length: f64,
    pub width: f64,
    pub height: f64,
}

impl Dimensions {
    pub fn new(length: f64, width: f64, height: f64) -> Self {
        Self { length, width, height }
    }

    pub fn volume(&self) -> f64 {
        self.length.max(0.0) * self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Placement and extent of an object.
///
/// Flattened into the object's property map, so `position`, `dimensions`
/// and `shape_type` are top-level properties for delta compression.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub position: [f64; 3],
    pub dimensions: Dimensions,
    pub shape_type: String,
}

/// Descriptive metadata. Unrecognized keys are kept in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub material: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specification: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Metadata {
    pub fn is_empty(&self) -> bool {
        self.manufacturer.is_none()
            && self.model_number.is_none()
            && self.material.is_none()
            && self.specification.is_none()
            && self.extra.is_empty()
    }
}

/// A building object as returned by the spatial index.
///
/// `system_priority` runs from 1 (life-safety critical) to 5 (cosmetic).
/// System-specific fields that have no typed slot land in `extensions`
/// and survive a round trip through [`SpatialObject::to_properties`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialObject {
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: String,
    pub system_type: String,
    pub system_priority: u8,
    #[serde(flatten)]
    pub geometry: Geometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl SpatialObject {
    /// Create an object with unit dimensions at the origin
    pub fn new(
        id: impl Into<String>,
        object_type: impl Into<String>,
        system_type: impl Into<String>,
        system_priority: u8,
    ) -> Self {
        Self {
            id: id.into(),
            object_type: object_type.into(),
            system_type: system_type.into(),
            system_priority: system_priority.clamp(1, 5),
            geometry: Geometry {
                position: [0.0; 3],
                dimensions: Dimensions::new(1.0, 1.0, 1.0),
                shape_type: "box".to_string(),
            },
            ..Default::default()
        }
    }

    pub fn with_position(mut self, x: f64, y: f64, z: f64) -> Self {
        self.geometry.position = [x, y, z];
        self
    }

    pub fn with_dimensions(mut self, length: f64, width: f64, height: f64) -> Self {
        self.geometry.dimensions = Dimensions::new(length, width, height);
        self
    }

    pub fn with_shape(mut self, shape_type: impl Into<String>) -> Self {
        self.geometry.shape_type = shape_type.into();
        self
    }

    pub fn with_precision(mut self, precision: impl Into<String>) -> Self {
        self.precision = Some(precision.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Object position as a vector
    pub fn position(&self) -> DVec3 {
        DVec3::from_array(self.geometry.position)
    }

    /// Bounding box centered on the object's position
    pub fn bounds(&self) -> Aabb {
        let d = self.geometry.dimensions;
        Aabb::from_center_half_extent(
            self.position(),
            DVec3::new(d.length, d.width, d.height).max(DVec3::ZERO) * 0.5,
        )
    }

    pub fn volume(&self) -> f64 {
        self.geometry.dimensions.volume()
    }

    /// Canonical property map used for similarity and delta computation
    pub fn to_properties(&self) -> PropertyMap {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => PropertyMap::new(),
        }
    }

    /// Rebuild an object from its property map
    pub fn from_properties(properties: PropertyMap) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(properties))
    }

    /// Best-effort serialized size in bytes (compact JSON length).
    ///
    /// This approximates transfer size; it is not a memory measurement.
    pub fn estimated_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outlet() -> SpatialObject {
        SpatialObject::new("outlet-1", "electrical_outlet", "electrical", 3)
            .with_position(1.0, 2.0, 0.3)
            .with_dimensions(0.1, 0.05, 0.1)
            .with_precision("standard")
            .with_metadata(Metadata {
                manufacturer: Some("Leviton".into()),
                model_number: Some("5320-W".into()),
                ..Default::default()
            })
    }

    #[test]
    fn test_properties_are_flat() {
        let props = outlet().to_properties();
        assert_eq!(props["type"], json!("electrical_outlet"));
        assert_eq!(props["position"], json!([1.0, 2.0, 0.3]));
        assert!(props.contains_key("dimensions"));
        assert!(props.contains_key("shape_type"));
        assert!(!props.contains_key("geometry"));
    }

    #[test]
    fn test_property_roundtrip() {
        let obj = outlet().with_extension("voltage", json!(120));
        let back = SpatialObject::from_properties(obj.to_properties()).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn test_metadata_extra_roundtrip() {
        let mut meta = Metadata::default();
        meta.extra.insert("finish".into(), json!("white"));
        let obj = outlet().with_metadata(meta);
        let back = SpatialObject::from_properties(obj.to_properties()).unwrap();
        assert_eq!(back.metadata.extra["finish"], json!("white"));
    }

    #[test]
    fn test_priority_clamped() {
        assert_eq!(SpatialObject::new("a", "wall", "structural", 0).system_priority, 1);
        assert_eq!(SpatialObject::new("a", "wall", "structural", 9).system_priority, 5);
    }

    #[test]
    fn test_bounds_and_volume() {
        let obj = SpatialObject::new("w", "wall", "structural", 1)
            .with_position(5.0, 5.0, 1.5)
            .with_dimensions(4.0, 0.2, 3.0);
        assert!((obj.volume() - 2.4).abs() < 1e-9);
        assert!(obj.bounds().contains_point(DVec3::new(6.9, 5.0, 1.5)));
        assert!(!obj.bounds().contains_point(DVec3::new(7.1, 5.0, 1.5)));
    }

    #[test]
    fn test_estimated_size_grows_with_content() {
        let small = SpatialObject::new("a", "wall", "structural", 1);
        let big = small.clone().with_extension("notes", json!("x".repeat(500)));
        assert!(big.estimated_size() > small.estimated_size() + 400);
    }
}
