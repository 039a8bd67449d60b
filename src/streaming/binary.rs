//! Typed binary encoding for coordinate and property arrays
//!
//! Numeric arrays are quantized to a decimal precision and stored in the
//! narrowest integer width that holds the scaled range. Buffers larger than
//! a threshold are LZ4-compressed when that actually shrinks them.
//!
//! Typed slices are reinterpreted with `bytemuck`, so buffers use the
//! host's native byte order (little-endian on every supported target).

use std::borrow::Cow;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::types::PropertyMap;

/// Highest supported decimal precision for coordinate quantization
pub const MAX_PRECISION: u8 = 9;

/// Geometry fields holding arrays of points
pub const COORDINATE_FIELDS: [&str; 5] = ["vertices", "edges", "faces", "points", "path"];

/// Fields holding flat numeric dimension arrays
pub const DIMENSION_ARRAY_FIELDS: [&str; 5] = ["length", "width", "height", "radius", "diameter"];

/// Metadata fields holding string arrays
pub const STRING_ARRAY_FIELDS: [&str; 4] = ["materials", "finishes", "manufacturers", "model_numbers"];

/// Metadata flags packed into a single bit field
pub const BOOLEAN_FLAG_FIELDS: [&str; 3] = ["is_energized", "is_accessible", "requires_maintenance"];

/// Numeric reading arrays packed for electrical objects
pub const ELECTRICAL_FIELDS: [&str; 4] = ["voltage", "amperage", "wattage", "phases"];

/// Numeric reading arrays packed for mechanical and HVAC objects
pub const MECHANICAL_FIELDS: [&str; 4] = ["pressure", "temperature", "flow_rate", "cfm"];

/// Numeric reading arrays packed for plumbing objects
pub const PLUMBING_FIELDS: [&str; 3] = ["pipe_diameter", "flow_rate", "pressure_rating"];

/// System-specific numeric fields for a `system_type`
pub fn system_fields(system_type: &str) -> &'static [&'static str] {
    match system_type {
        "electrical" => &ELECTRICAL_FIELDS,
        "mechanical" | "hvac" => &MECHANICAL_FIELDS,
        "plumbing" => &PLUMBING_FIELDS,
        _ => &[],
    }
}

const BOOLEAN_FLAGS_KEY: &str = "boolean_flags_binary";
const BINARY_SUFFIX: &str = "_binary";

/// Element type stored in a buffer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    Float32,
    Int64,
    Int32,
    Int16,
    Int8,
    Uint32,
    Uint16,
    Uint8,
}

impl ElementType {
    /// Width of one element in bytes
    pub fn width(self) -> usize {
        match self {
            ElementType::Int64 => 8,
            ElementType::Float32 | ElementType::Int32 | ElementType::Uint32 => 4,
            ElementType::Int16 | ElementType::Uint16 => 2,
            ElementType::Int8 | ElementType::Uint8 => 1,
        }
    }
}

/// How the element bytes are to be interpreted
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Plain typed values
    Raw,
    /// Integers holding `value * 10^precision`
    Scaled,
    /// One bit per boolean, eight per byte, LSB first
    BitPacked,
    /// `u32` index-byte length, narrow indices, then a JSON string table
    StringTable,
    /// Opaque JSON bytes for heterogeneous arrays
    Json,
}

/// Byte-level compression applied on top of the typed encoding
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Lz4,
}

/// Encoded array with enough metadata to decode it again.
///
/// Serializes to the JSON wire form with `data` as base64.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BinaryBuffer {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub element_type: ElementType,
    pub shape: Vec<usize>,
    pub compression: Compression,
    pub original_size: usize,
    pub compressed_size: usize,
    pub encoding: Encoding,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u8>,
}

impl BinaryBuffer {
    /// Empty buffer; returned for empty or malformed input
    pub fn empty(element_type: ElementType, shape: Vec<usize>) -> Self {
        Self {
            data: Vec::new(),
            element_type,
            shape,
            compression: Compression::None,
            original_size: 0,
            compressed_size: 0,
            encoding: Encoding::Raw,
            precision: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of logical elements described by `shape`
    pub fn element_count(&self) -> usize {
        if self.shape.is_empty() {
            0
        } else {
            self.shape.iter().product()
        }
    }

    /// compressed_size / original_size (1.0 when nothing was stored)
    pub fn compression_ratio(&self) -> f64 {
        if self.original_size == 0 {
            1.0
        } else {
            self.compressed_size as f64 / self.original_size as f64
        }
    }

    /// Decompressed element bytes, or `None` if the payload is corrupt
    fn payload(&self) -> Option<Cow<'_, [u8]>> {
        match self.compression {
            Compression::None => Some(Cow::Borrowed(&self.data)),
            Compression::Lz4 => match lz4_flex::decompress_size_prepended(&self.data) {
                Ok(bytes) => Some(Cow::Owned(bytes)),
                Err(e) => {
                    log::warn!("LZ4 decompression failed: {}", e);
                    None
                }
            },
        }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Configuration for the binary optimizer
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BinaryConfig {
    /// Decimal places kept when no precision is given
    pub default_precision: u8,
    /// Buffers at or below this many bytes are never compressed
    pub compression_threshold: usize,
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            default_precision: 2,
            compression_threshold: 100,
        }
    }
}

/// Running counters for object-level optimization
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OptimizerStats {
    pub objects_optimized: u64,
    pub fields_encoded: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl OptimizerStats {
    /// Aggregate optimized/original size ratio
    pub fn compression_ratio(&self) -> f64 {
        if self.bytes_before == 0 {
            1.0
        } else {
            self.bytes_after as f64 / self.bytes_before as f64
        }
    }
}

/// Encodes arrays into [`BinaryBuffer`]s and property maps into their
/// binary-optimized form.
#[derive(Clone, Debug, Default)]
pub struct BinaryOptimizer {
    config: BinaryConfig,
    stats: OptimizerStats,
}

impl BinaryOptimizer {
    pub fn new(config: BinaryConfig) -> Self {
        Self {
            config,
            stats: OptimizerStats::default(),
        }
    }

    pub fn config(&self) -> &BinaryConfig {
        &self.config
    }

    pub fn stats(&self) -> &OptimizerStats {
        &self.stats
    }

    // --- Coordinates ---

    /// Encode rows of coordinates at `precision` decimals.
    ///
    /// All rows must have the same non-zero length; anything else yields an
    /// empty buffer.
    ///
    /// # Arguments
    /// * `points` - Coordinate rows
    /// * `precision` - Decimal places kept, defaulting to the configured precision
    ///
    /// # Returns
    /// A scaled-integer buffer, or f32 when the scaled range overflows i32
    pub fn encode_coordinates<P: AsRef<[f64]>>(&self, points: &[P], precision: Option<u8>) -> BinaryBuffer {
        let precision = precision
            .unwrap_or(self.config.default_precision)
            .min(MAX_PRECISION);
        let cols = points.first().map(|p| p.as_ref().len()).unwrap_or(0);

        if cols == 0 || points.iter().any(|p| p.as_ref().len() != cols) {
            return BinaryBuffer::empty(ElementType::Float32, vec![0, 0]);
        }

        let flat: Vec<f64> = points.iter().flat_map(|p| p.as_ref().iter().copied()).collect();
        if flat.iter().any(|v| !v.is_finite()) {
            log::warn!("Refusing to encode non-finite coordinates");
            return BinaryBuffer::empty(ElementType::Float32, vec![0, 0]);
        }

        let scale = 10f64.powi(precision as i32);
        let scaled: Vec<f64> = flat.iter().map(|v| (v * scale).round()).collect();
        let min = scaled.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let (raw, element_type, encoding) = if min >= i16::MIN as f64 && max <= i16::MAX as f64 {
            let values: Vec<i16> = scaled.iter().map(|&s| s as i16).collect();
            (to_bytes(&values), ElementType::Int16, Encoding::Scaled)
        } else if min >= i32::MIN as f64 && max <= i32::MAX as f64 {
            let values: Vec<i32> = scaled.iter().map(|&s| s as i32).collect();
            (to_bytes(&values), ElementType::Int32, Encoding::Scaled)
        } else {
            // Out of scaled-integer range: keep quantized values as f32
            let values: Vec<f32> = scaled.iter().map(|&s| (s / scale) as f32).collect();
            (to_bytes(&values), ElementType::Float32, Encoding::Raw)
        };

        let mut buffer = self.finish(raw, element_type, encoding, vec![points.len(), cols], true);
        buffer.precision = Some(precision);
        buffer
    }

    /// Decode a coordinate buffer back into rows.
    ///
    /// # Arguments
    /// * `buffer` - Buffer from `encode_coordinates`
    ///
    /// # Returns
    /// The rows, or an empty vector for a malformed buffer
    pub fn decode_coordinates(&self, buffer: &BinaryBuffer) -> Vec<Vec<f64>> {
        let (rows, cols) = match buffer.shape.as_slice() {
            [rows, cols] if *rows > 0 && *cols > 0 => (*rows, *cols),
            _ => return Vec::new(),
        };
        let Some(bytes) = buffer.payload() else {
            return Vec::new();
        };

        let precision = buffer.precision.unwrap_or(self.config.default_precision);
        let scale = 10f64.powi(precision as i32);

        let flat: Option<Vec<f64>> = match (buffer.encoding, buffer.element_type) {
            (Encoding::Scaled, ElementType::Int16) => {
                from_bytes::<i16>(&bytes).map(|v| v.into_iter().map(|q| q as f64 / scale).collect())
            }
            (Encoding::Scaled, ElementType::Int32) => {
                from_bytes::<i32>(&bytes).map(|v| v.into_iter().map(|q| q as f64 / scale).collect())
            }
            (Encoding::Raw, ElementType::Float32) => {
                from_bytes::<f32>(&bytes).map(|v| v.into_iter().map(f64::from).collect())
            }
            _ => None,
        };

        match flat {
            Some(flat) if flat.len() == rows * cols => {
                flat.chunks(cols).map(|row| row.to_vec()).collect()
            }
            _ => {
                log::warn!("Malformed coordinate buffer ({:?}, shape {:?})", buffer.element_type, buffer.shape);
                Vec::new()
            }
        }
    }

    // --- Property arrays ---

    /// Encode a homogeneous property array with the cheapest fitting layout.
    ///
    /// # Arguments
    /// * `values` - Array of booleans, numbers or strings; anything else is kept as JSON
    ///
    /// # Returns
    /// The encoded buffer; LZ4 is applied above the compression threshold
    pub fn encode_property_array(&self, values: &[Value]) -> BinaryBuffer {
        if values.is_empty() {
            return BinaryBuffer::empty(ElementType::Uint8, vec![0]);
        }

        if values.iter().all(Value::is_boolean) {
            self.encode_booleans(values)
        } else if let Some(ints) = values.iter().map(Value::as_i64).collect::<Option<Vec<i64>>>() {
            self.encode_integers(&ints)
        } else if let Some(floats) = values.iter().map(Value::as_f64).collect::<Option<Vec<f64>>>() {
            let floats: Vec<f32> = floats.into_iter().map(|f| f as f32).collect();
            self.finish(to_bytes(&floats), ElementType::Float32, Encoding::Raw, vec![values.len()], true)
        } else if let Some(strings) = values.iter().map(Value::as_str).collect::<Option<Vec<&str>>>() {
            self.encode_strings(&strings)
        } else {
            let bytes = serde_json::to_vec(values).unwrap_or_default();
            self.finish(bytes, ElementType::Uint8, Encoding::Json, vec![values.len()], false)
        }
    }

    /// Decode a property buffer.
    ///
    /// # Arguments
    /// * `buffer` - Buffer from `encode_property_array`
    ///
    /// # Returns
    /// The values, or an empty array for a malformed buffer
    pub fn decode_property_array(&self, buffer: &BinaryBuffer) -> Vec<Value> {
        let count = buffer.element_count();
        if count == 0 {
            return Vec::new();
        }
        let Some(bytes) = buffer.payload() else {
            return Vec::new();
        };

        let decoded = match buffer.encoding {
            Encoding::BitPacked => decode_booleans(&bytes, count),
            Encoding::StringTable => decode_strings(&bytes, buffer.element_type),
            Encoding::Json => serde_json::from_slice::<Vec<Value>>(&bytes).ok(),
            Encoding::Raw => decode_numbers(&bytes, buffer.element_type),
            Encoding::Scaled => None,
        };

        match decoded {
            Some(values) if values.len() == count => values,
            _ => {
                log::warn!("Malformed property buffer ({:?}, shape {:?})", buffer.encoding, buffer.shape);
                Vec::new()
            }
        }
    }

    fn encode_booleans(&self, values: &[Value]) -> BinaryBuffer {
        let mut packed = vec![0u8; values.len().div_ceil(8)];
        for (i, value) in values.iter().enumerate() {
            if value.as_bool() == Some(true) {
                packed[i / 8] |= 1 << (i % 8);
            }
        }
        let mut buffer = self.finish(packed, ElementType::Uint8, Encoding::BitPacked, vec![values.len()], false);
        buffer.original_size = values.len();
        buffer
    }

    fn encode_integers(&self, values: &[i64]) -> BinaryBuffer {
        let min = values.iter().copied().min().unwrap_or(0);
        let max = values.iter().copied().max().unwrap_or(0);
        let fits = |lo: i64, hi: i64| min >= lo && max <= hi;

        let (raw, element_type) = if fits(0, u8::MAX as i64) {
            (to_bytes(&narrow::<u8>(values)), ElementType::Uint8)
        } else if fits(i8::MIN as i64, i8::MAX as i64) {
            (to_bytes(&narrow::<i8>(values)), ElementType::Int8)
        } else if fits(0, u16::MAX as i64) {
            (to_bytes(&narrow::<u16>(values)), ElementType::Uint16)
        } else if fits(i16::MIN as i64, i16::MAX as i64) {
            (to_bytes(&narrow::<i16>(values)), ElementType::Int16)
        } else if fits(0, u32::MAX as i64) {
            (to_bytes(&narrow::<u32>(values)), ElementType::Uint32)
        } else if fits(i32::MIN as i64, i32::MAX as i64) {
            (to_bytes(&narrow::<i32>(values)), ElementType::Int32)
        } else {
            (to_bytes(values), ElementType::Int64)
        };

        self.finish(raw, element_type, Encoding::Raw, vec![values.len()], true)
    }

    fn encode_strings(&self, values: &[&str]) -> BinaryBuffer {
        // Table keeps first-seen order so encoding is deterministic
        let mut table: Vec<&str> = Vec::new();
        let mut indices: Vec<u32> = Vec::with_capacity(values.len());
        for value in values {
            let index = match table.iter().position(|s| s == value) {
                Some(i) => i,
                None => {
                    table.push(value);
                    table.len() - 1
                }
            };
            indices.push(index as u32);
        }

        let (index_bytes, element_type) = if table.len() <= u8::MAX as usize + 1 {
            let narrow: Vec<u8> = indices.iter().map(|&i| i as u8).collect();
            (to_bytes(&narrow), ElementType::Uint8)
        } else if table.len() <= u16::MAX as usize + 1 {
            let narrow: Vec<u16> = indices.iter().map(|&i| i as u16).collect();
            (to_bytes(&narrow), ElementType::Uint16)
        } else {
            (to_bytes(&indices), ElementType::Uint32)
        };

        let table_bytes = serde_json::to_vec(&table).unwrap_or_default();
        let mut combined = Vec::with_capacity(4 + index_bytes.len() + table_bytes.len());
        combined.extend_from_slice(&(index_bytes.len() as u32).to_le_bytes());
        combined.extend_from_slice(&index_bytes);
        combined.extend_from_slice(&table_bytes);

        self.finish(combined, element_type, Encoding::StringTable, vec![values.len()], true)
    }

    /// Wrap raw bytes, compressing when it pays off
    fn finish(
        &self,
        raw: Vec<u8>,
        element_type: ElementType,
        encoding: Encoding,
        shape: Vec<usize>,
        compressible: bool,
    ) -> BinaryBuffer {
        let original_size = raw.len();
        let (data, compression) = if compressible && raw.len() > self.config.compression_threshold {
            let compressed = lz4_flex::compress_prepend_size(&raw);
            if compressed.len() < raw.len() {
                (compressed, Compression::Lz4)
            } else {
                (raw, Compression::None)
            }
        } else {
            (raw, Compression::None)
        };

        BinaryBuffer {
            compressed_size: data.len(),
            data,
            element_type,
            shape,
            compression,
            original_size,
            encoding,
            precision: None,
        }
    }

    // --- Object-level optimization ---

    /// Replace encodable arrays in a property map with `*_binary` buffers.
    ///
    /// Geometry, dimension and string arrays are encoded for every object.
    /// Numeric readings listed by [`system_fields`] for the map's
    /// `system_type` are packed too. A field is only replaced when its
    /// encoded JSON form is smaller than the original value. `metadata` is
    /// optimized recursively.
    ///
    /// # Arguments
    /// * `properties` - Canonical property map of one object
    ///
    /// # Returns
    /// The optimized map; [`restore_properties`](Self::restore_properties)
    /// reverses it.
    pub fn optimize_properties(&mut self, properties: &PropertyMap) -> PropertyMap {
        let before = json_len(properties);
        let system = system_fields(properties.get("system_type").and_then(Value::as_str).unwrap_or_default());
        let mut optimized = self.optimize_map(properties, system);

        if let Some(Value::Object(metadata)) = properties.get("metadata") {
            optimized.insert("metadata".to_string(), Value::Object(self.optimize_map(metadata, system)));
        }

        self.stats.objects_optimized += 1;
        self.stats.bytes_before += before as u64;
        self.stats.bytes_after += json_len(&optimized) as u64;
        optimized
    }

    /// Inverse of [`optimize_properties`](Self::optimize_properties)
    pub fn restore_properties(&self, properties: &PropertyMap) -> PropertyMap {
        let mut restored = self.restore_map(properties);
        if let Some(Value::Object(metadata)) = properties.get("metadata") {
            restored.insert("metadata".to_string(), Value::Object(self.restore_map(metadata)));
        }
        restored
    }

    /// Serialized size of the optimized form without touching the counters
    pub fn encoded_size(&self, properties: &PropertyMap) -> usize {
        let mut scratch = self.clone();
        json_len(&scratch.optimize_properties(properties))
    }

    fn optimize_map(&mut self, map: &PropertyMap, system: &[&str]) -> PropertyMap {
        let mut out = map.clone();

        for (key, value) in map {
            let Value::Array(items) = value else { continue };

            let buffer = if COORDINATE_FIELDS.contains(&key.as_str()) {
                coordinate_rows(items).map(|rows| self.encode_coordinates(&rows, None))
            } else if (DIMENSION_ARRAY_FIELDS.contains(&key.as_str()) || system.contains(&key.as_str()))
                && items.iter().all(Value::is_number)
            {
                Some(self.encode_property_array(items))
            } else if STRING_ARRAY_FIELDS.contains(&key.as_str()) && items.iter().all(Value::is_string) {
                Some(self.encode_property_array(items))
            } else {
                None
            };

            if let Some(buffer) = buffer.filter(|b| !b.is_empty()) {
                if let Ok(encoded) = serde_json::to_value(&buffer) {
                    if json_value_len(&encoded) < json_value_len(value) {
                        out.remove(key);
                        out.insert(format!("{key}{BINARY_SUFFIX}"), encoded);
                        self.stats.fields_encoded += 1;
                    }
                }
            }
        }

        let flags: Vec<(&str, Value)> = BOOLEAN_FLAG_FIELDS
            .iter()
            .filter_map(|&k| map.get(k).filter(|v| v.is_boolean()).map(|v| (k, v.clone())))
            .collect();
        if !flags.is_empty() {
            let values: Vec<Value> = flags.iter().map(|(_, v)| v.clone()).collect();
            let keys: Vec<&str> = flags.iter().map(|(k, _)| *k).collect();
            let buffer = self.encode_property_array(&values);
            if let Ok(data) = serde_json::to_value(&buffer) {
                for key in &keys {
                    out.remove(*key);
                }
                out.insert(BOOLEAN_FLAGS_KEY.to_string(), json!({ "data": data, "keys": keys }));
                self.stats.fields_encoded += 1;
            }
        }

        out
    }

    fn restore_map(&self, map: &PropertyMap) -> PropertyMap {
        let mut out = map.clone();

        for (key, value) in map {
            if key == BOOLEAN_FLAGS_KEY {
                let keys: Vec<String> = value
                    .get("keys")
                    .and_then(|k| serde_json::from_value(k.clone()).ok())
                    .unwrap_or_default();
                let flags = value
                    .get("data")
                    .and_then(|d| serde_json::from_value::<BinaryBuffer>(d.clone()).ok())
                    .map(|b| self.decode_property_array(&b))
                    .unwrap_or_default();
                out.remove(key);
                for (name, flag) in keys.into_iter().zip(flags) {
                    out.insert(name, flag);
                }
                continue;
            }

            let Some(field) = key.strip_suffix(BINARY_SUFFIX) else { continue };
            let Ok(buffer) = serde_json::from_value::<BinaryBuffer>(value.clone()) else {
                continue;
            };

            let restored = if buffer.shape.len() == 2 {
                Value::Array(
                    self.decode_coordinates(&buffer)
                        .into_iter()
                        .map(|row| Value::Array(row.into_iter().map(|v| json!(v)).collect()))
                        .collect(),
                )
            } else {
                Value::Array(self.decode_property_array(&buffer))
            };
            out.remove(key);
            out.insert(field.to_string(), restored);
        }

        out
    }
}

fn to_bytes<T: Pod>(values: &[T]) -> Vec<u8> {
    bytemuck::cast_slice(values).to_vec()
}

fn from_bytes<T: Pod>(bytes: &[u8]) -> Option<Vec<T>> {
    if bytes.len() % std::mem::size_of::<T>() != 0 {
        return None;
    }
    Some(bytemuck::pod_collect_to_vec(bytes))
}

fn narrow<T: TryFrom<i64> + Default>(values: &[i64]) -> Vec<T> {
    values.iter().map(|&v| T::try_from(v).unwrap_or_default()).collect()
}

fn decode_booleans(bytes: &[u8], count: usize) -> Option<Vec<Value>> {
    if bytes.len() < count.div_ceil(8) {
        return None;
    }
    Some((0..count).map(|i| Value::Bool((bytes[i / 8] >> (i % 8)) & 1 == 1)).collect())
}

fn decode_numbers(bytes: &[u8], element_type: ElementType) -> Option<Vec<Value>> {
    Some(match element_type {
        ElementType::Float32 => from_bytes::<f32>(bytes)?.into_iter().map(|v| json!(v as f64)).collect(),
        ElementType::Int64 => from_bytes::<i64>(bytes)?.into_iter().map(|v| json!(v)).collect(),
        ElementType::Int32 => from_bytes::<i32>(bytes)?.into_iter().map(|v| json!(v)).collect(),
        ElementType::Int16 => from_bytes::<i16>(bytes)?.into_iter().map(|v| json!(v)).collect(),
        ElementType::Int8 => from_bytes::<i8>(bytes)?.into_iter().map(|v| json!(v)).collect(),
        ElementType::Uint32 => from_bytes::<u32>(bytes)?.into_iter().map(|v| json!(v)).collect(),
        ElementType::Uint16 => from_bytes::<u16>(bytes)?.into_iter().map(|v| json!(v)).collect(),
        ElementType::Uint8 => bytes.iter().map(|&v| json!(v)).collect(),
    })
}

fn decode_strings(bytes: &[u8], element_type: ElementType) -> Option<Vec<Value>> {
    let header: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
    let index_len = u32::from_le_bytes(header) as usize;
    let index_bytes = bytes.get(4..4 + index_len)?;
    let table: Vec<String> = serde_json::from_slice(bytes.get(4 + index_len..)?).ok()?;

    let indices: Vec<usize> = match element_type {
        ElementType::Uint8 => index_bytes.iter().map(|&i| i as usize).collect(),
        ElementType::Uint16 => from_bytes::<u16>(index_bytes)?.into_iter().map(|i| i as usize).collect(),
        ElementType::Uint32 => from_bytes::<u32>(index_bytes)?.into_iter().map(|i| i as usize).collect(),
        _ => return None,
    };

    indices
        .into_iter()
        .map(|i| table.get(i).map(|s| Value::String(s.clone())))
        .collect()
}

/// Interpret a JSON array as equal-length numeric rows of at least 2 values
fn coordinate_rows(items: &[Value]) -> Option<Vec<Vec<f64>>> {
    let rows: Vec<Vec<f64>> = items
        .iter()
        .map(|row| {
            row.as_array()?
                .iter()
                .map(Value::as_f64)
                .collect::<Option<Vec<f64>>>()
        })
        .collect::<Option<_>>()?;
    let cols = rows.first()?.len();
    (cols >= 2 && rows.iter().all(|r| r.len() == cols)).then_some(rows)
}

fn json_len(map: &PropertyMap) -> usize {
    serde_json::to_vec(map).map(|v| v.len()).unwrap_or(0)
}

fn json_value_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use proptest::prelude::*;

    fn optimizer() -> BinaryOptimizer {
        BinaryOptimizer::new(BinaryConfig::default())
    }

    #[test]
    fn test_coordinates_pick_int16_for_small_range() {
        let opt = optimizer();
        let points = [[0.0, 0.0, 12.0], [18.0, 1.0, 2.0]];
        let buffer = opt.encode_coordinates(&points, Some(2));

        // 1800 is the largest scaled value, well inside i16
        assert_eq!(buffer.element_type, ElementType::Int16);
        assert_eq!(buffer.encoding, Encoding::Scaled);
        assert_eq!(buffer.shape, vec![2, 3]);
        assert_eq!(buffer.original_size, 6 * 2);

        let decoded = opt.decode_coordinates(&buffer);
        assert_eq!(decoded.len(), 2);
        for (row, original) in decoded.iter().zip(points.iter()) {
            for (d, o) in row.iter().zip(original.iter()) {
                assert!((d - o).abs() <= 0.01, "{} vs {}", d, o);
            }
        }
    }

    #[test]
    fn test_coordinates_widen_to_int32() {
        let opt = optimizer();
        let buffer = opt.encode_coordinates(&[[1000.0, -2000.5]], Some(2));
        assert_eq!(buffer.element_type, ElementType::Int32);
        assert_eq!(opt.decode_coordinates(&buffer), vec![vec![1000.0, -2000.5]]);
    }

    #[test]
    fn test_coordinates_fall_back_to_float32() {
        let opt = optimizer();
        let buffer = opt.encode_coordinates(&[[1.0e9, 2.0]], Some(4));
        assert_eq!(buffer.element_type, ElementType::Float32);
        let decoded = opt.decode_coordinates(&buffer);
        assert!((decoded[0][1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_precision_travels_with_buffer() {
        let opt = optimizer();
        let buffer = opt.encode_coordinates(&[[1.234, 5.678]], Some(3));
        assert_eq!(buffer.precision, Some(3));

        // A decoder with a different default still honours the buffer
        let other = BinaryOptimizer::new(BinaryConfig { default_precision: 0, ..Default::default() });
        assert_eq!(other.decode_coordinates(&buffer), vec![vec![1.234, 5.678]]);
    }

    #[test]
    fn test_empty_and_ragged_coordinates() {
        let opt = optimizer();
        let empty: [[f64; 3]; 0] = [];
        assert!(opt.encode_coordinates(&empty, None).is_empty());

        let ragged = vec![vec![1.0, 2.0, 3.0], vec![1.0, 2.0]];
        let buffer = opt.encode_coordinates(&ragged, None);
        assert!(buffer.is_empty());
        assert!(opt.decode_coordinates(&buffer).is_empty());

        assert!(opt.encode_coordinates(&[[f64::NAN, 1.0]], None).is_empty());
    }

    #[test]
    fn test_large_coordinate_arrays_are_compressed() {
        let opt = optimizer();
        let points: Vec<[f64; 3]> = (0..200).map(|i| [(i % 4) as f64, 0.0, 3.0]).collect();
        let buffer = opt.encode_coordinates(&points, Some(2));
        assert_eq!(buffer.compression, Compression::Lz4);
        assert!(buffer.compressed_size < buffer.original_size);
        assert_eq!(opt.decode_coordinates(&buffer).len(), 200);
    }

    #[test]
    fn test_small_buffers_skip_compression() {
        let opt = optimizer();
        let buffer = opt.encode_coordinates(&[[0.0, 0.0, 0.0]; 4], Some(2));
        assert_eq!(buffer.compression, Compression::None);
    }

    #[test]
    fn test_boolean_bit_packing() {
        let opt = optimizer();
        let values: Vec<Value> = [true, false, true, true, false, false, false, false, true]
            .iter()
            .map(|&b| json!(b))
            .collect();
        let buffer = opt.encode_property_array(&values);
        assert_eq!(buffer.encoding, Encoding::BitPacked);
        assert_eq!(buffer.data.len(), 2);
        assert_eq!(buffer.data[0], 0b0000_1101);
        assert_eq!(opt.decode_property_array(&buffer), values);
    }

    #[test]
    fn test_integer_width_selection() {
        let opt = optimizer();
        let cases = [
            (vec![0, 200], ElementType::Uint8),
            (vec![-5, 100], ElementType::Int8),
            (vec![0, 60000], ElementType::Uint16),
            (vec![-300, 300], ElementType::Int16),
            (vec![0, 70000], ElementType::Uint32),
            (vec![-70000, 5], ElementType::Int32),
            (vec![-1, 1 << 40], ElementType::Int64),
        ];
        for (ints, expected) in cases {
            let values: Vec<Value> = ints.iter().map(|&i: &i64| json!(i)).collect();
            let buffer = opt.encode_property_array(&values);
            assert_eq!(buffer.element_type, expected, "range {:?}", ints);
            assert_eq!(opt.decode_property_array(&buffer), values);
        }
    }

    #[test]
    fn test_mixed_numbers_use_float32() {
        let opt = optimizer();
        let values = vec![json!(1), json!(2.5), json!(-0.25)];
        let buffer = opt.encode_property_array(&values);
        assert_eq!(buffer.element_type, ElementType::Float32);
        let decoded = opt.decode_property_array(&buffer);
        assert_eq!(decoded, vec![json!(1.0), json!(2.5), json!(-0.25)]);
    }

    #[test]
    fn test_string_table_dedupes() {
        let opt = optimizer();
        let values: Vec<Value> = ["copper", "pvc", "copper", "copper", "steel"]
            .iter()
            .map(|s| json!(s))
            .collect();
        let buffer = opt.encode_property_array(&values);
        assert_eq!(buffer.encoding, Encoding::StringTable);
        assert_eq!(buffer.element_type, ElementType::Uint8);
        assert_eq!(opt.decode_property_array(&buffer), values);
    }

    #[test]
    fn test_string_table_widens_indices() {
        let opt = optimizer();
        let values: Vec<Value> = (0..300).map(|i| json!(format!("s{i}"))).collect();
        let buffer = opt.encode_property_array(&values);
        assert_eq!(buffer.element_type, ElementType::Uint16);
        assert_eq!(opt.decode_property_array(&buffer), values);
    }

    #[test]
    fn test_heterogeneous_falls_back_to_json() {
        let opt = optimizer();
        let values = vec![json!(1), json!("two"), json!({"three": 3})];
        let buffer = opt.encode_property_array(&values);
        assert_eq!(buffer.encoding, Encoding::Json);
        assert_eq!(opt.decode_property_array(&buffer), values);
    }

    #[test]
    fn test_empty_property_array() {
        let opt = optimizer();
        let buffer = opt.encode_property_array(&[]);
        assert!(buffer.is_empty());
        assert!(opt.decode_property_array(&buffer).is_empty());
    }

    #[test]
    fn test_corrupt_payload_decodes_empty() {
        let opt = optimizer();
        let points: Vec<[f64; 3]> = (0..200).map(|_| [1.0, 1.0, 1.0]).collect();
        let mut buffer = opt.encode_coordinates(&points, Some(2));
        assert_eq!(buffer.compression, Compression::Lz4);
        buffer.data.truncate(6);
        assert!(opt.decode_coordinates(&buffer).is_empty());
    }

    #[test]
    fn test_wire_form() {
        let opt = optimizer();
        let points: Vec<[f64; 3]> = (0..100).map(|_| [1.0, 2.0, 3.0]).collect();
        let buffer = opt.encode_coordinates(&points, Some(2));
        let wire = serde_json::to_value(&buffer).unwrap();

        assert_eq!(wire["data"], json!(base64::engine::general_purpose::STANDARD.encode(&buffer.data)));
        assert_eq!(wire["element_type"], json!("int16"));
        assert_eq!(wire["shape"], json!([100, 3]));
        assert_eq!(wire["compression"], json!("lz4"));
        assert_eq!(wire["original_size"], json!(600));

        let back: BinaryBuffer = serde_json::from_value(wire).unwrap();
        assert_eq!(back, buffer);
    }

    #[test]
    fn test_optimize_and_restore_properties() {
        let mut opt = optimizer();
        let vertices: Vec<Value> = (0..64).map(|i| json!([i as f64 * 0.5, 1.25, 3.0])).collect();
        let mut props = PropertyMap::new();
        props.insert("id".into(), json!("duct-7"));
        props.insert("vertices".into(), Value::Array(vertices.clone()));
        let materials = vec!["steel"; 60];
        props.insert(
            "metadata".into(),
            json!({
                "materials": materials,
                "is_energized": true,
                "is_accessible": false,
            }),
        );

        let optimized = opt.optimize_properties(&props);
        assert!(optimized.contains_key("vertices_binary"));
        assert!(!optimized.contains_key("vertices"));
        let meta = optimized["metadata"].as_object().unwrap();
        assert!(meta.contains_key("materials_binary"));
        assert!(meta.contains_key("boolean_flags_binary"));
        assert!(!meta.contains_key("is_energized"));

        assert!(opt.stats().bytes_after < opt.stats().bytes_before);
        assert_eq!(opt.stats().objects_optimized, 1);

        let restored = opt.restore_properties(&optimized);
        assert_eq!(restored["vertices"], Value::Array(vertices));
        assert_eq!(restored["id"], json!("duct-7"));
        let meta = restored["metadata"].as_object().unwrap();
        assert_eq!(meta["is_energized"], json!(true));
        assert_eq!(meta["is_accessible"], json!(false));
        assert_eq!(meta["materials"].as_array().unwrap().len(), 60);
    }

    fn system_props(system_type: &str, readings: &[(&str, Vec<Value>)]) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert("id".into(), json!(format!("{system_type}-1")));
        props.insert("system_type".into(), json!(system_type));
        for (field, values) in readings {
            props.insert(field.to_string(), Value::Array(values.clone()));
        }
        props
    }

    /// Optimize, check every reading was packed, restore and compare
    fn assert_system_roundtrip(system_type: &str, readings: &[(&str, Vec<Value>)]) {
        let mut opt = optimizer();
        let props = system_props(system_type, readings);
        let optimized = opt.optimize_properties(&props);

        for (field, _) in readings {
            assert!(optimized.contains_key(&format!("{field}_binary")), "{field} not packed");
            assert!(!optimized.contains_key(*field));
        }
        assert_eq!(opt.restore_properties(&optimized), props);
    }

    #[test]
    fn test_electrical_readings_roundtrip() {
        let cycle = |values: &[i64]| -> Vec<Value> { (0..200).map(|i| json!(values[i % values.len()])).collect() };
        assert_system_roundtrip(
            "electrical",
            &[
                ("voltage", cycle(&[120, 208, 240])),
                ("amperage", cycle(&[15, 20, 30, 50])),
                ("wattage", cycle(&[1800, 2400, 3600])),
                ("phases", cycle(&[1, 3])),
            ],
        );
    }

    #[test]
    fn test_mechanical_readings_roundtrip() {
        let ramp = |base: f64, step: f64| -> Vec<Value> { (0..200).map(|i| json!(base + (i % 8) as f64 * step)).collect() };
        assert_system_roundtrip(
            "mechanical",
            &[
                ("pressure", ramp(101.5, 0.25)),
                ("temperature", ramp(18.5, 0.5)),
                ("flow_rate", ramp(2.0, 0.125)),
                ("cfm", (0..200).map(|i| json!(400 + (i % 5) * 50)).collect()),
            ],
        );
    }

    #[test]
    fn test_plumbing_readings_roundtrip() {
        let sizes = [0.5, 0.75, 1.0, 1.5, 2.0];
        assert_system_roundtrip(
            "plumbing",
            &[
                ("pipe_diameter", (0..200).map(|i| json!(sizes[i % sizes.len()])).collect()),
                ("flow_rate", (0..200).map(|i| json!(5 + i % 10)).collect()),
                ("pressure_rating", (0..200).map(|i| json!(if i % 2 == 0 { 150 } else { 300 })).collect()),
            ],
        );
    }

    #[test]
    fn test_readings_of_other_systems_stay_plain() {
        let mut opt = optimizer();
        let voltages: Vec<Value> = (0..200).map(|_| json!(120)).collect();
        let props = system_props("structural", &[("voltage", voltages)]);
        let optimized = opt.optimize_properties(&props);
        assert!(optimized.contains_key("voltage"));
        assert!(!optimized.contains_key("voltage_binary"));
        assert_eq!(system_fields("hvac"), &MECHANICAL_FIELDS);
    }

    #[test]
    fn test_encoded_size_leaves_stats_alone() {
        let opt = optimizer();
        let mut props = PropertyMap::new();
        props.insert("points".into(), json!(vec![[1.0, 2.0]; 50]));
        let size = opt.encoded_size(&props);
        assert!(size > 0);
        assert!(size < json_len(&props));
        assert_eq!(opt.stats().objects_optimized, 0);
    }

    proptest! {
        #[test]
        fn prop_coordinate_roundtrip(
            points in prop::collection::vec(prop::array::uniform3(-10_000.0f64..10_000.0), 1..64),
            precision in 0u8..=4,
        ) {
            let opt = optimizer();
            let buffer = opt.encode_coordinates(&points, Some(precision));
            let decoded = opt.decode_coordinates(&buffer);
            let tolerance = 10f64.powi(-(precision as i32));

            prop_assert_eq!(decoded.len(), points.len());
            for (row, original) in decoded.iter().zip(points.iter()) {
                for (d, o) in row.iter().zip(original.iter()) {
                    prop_assert!((d - o).abs() <= tolerance, "{} vs {} at p={}", d, o, precision);
                }
            }
        }

        #[test]
        fn prop_integer_roundtrip_is_exact(ints in prop::collection::vec(any::<i32>(), 1..128)) {
            let opt = optimizer();
            let values: Vec<Value> = ints.iter().map(|&i| json!(i)).collect();
            let buffer = opt.encode_property_array(&values);
            prop_assert_eq!(opt.decode_property_array(&buffer), values);
        }

        #[test]
        fn prop_string_roundtrip_is_exact(strings in prop::collection::vec("[a-z]{0,6}", 1..64)) {
            let opt = optimizer();
            let values: Vec<Value> = strings.iter().map(|s| json!(s)).collect();
            let buffer = opt.encode_property_array(&values);
            prop_assert_eq!(opt.decode_property_array(&buffer), values);
        }
    }
}
