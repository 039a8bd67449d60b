//! Aggregate streaming configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::Error;
use crate::core::types::Result;
use crate::streaming::budget::UserRole;
use crate::streaming::cache::CacheConfig;
use crate::streaming::delta::CompressionConfig;
use crate::streaming::loader::LoaderConfig;
use crate::streaming::lod::LodConfig;
use crate::streaming::viewport::ViewportConfig;

/// Everything needed to build a [`StreamingEngine`](crate::streaming::StreamingEngine).
///
/// Missing sections in a config file fall back to their defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub compression: CompressionConfig,
    pub lod: LodConfig,
    pub viewport: ViewportConfig,
    pub cache: CacheConfig,
    pub loader: LoaderConfig,
    /// Role assumed by callers that do not name one
    pub default_role: UserRole,
    /// TTL for cached viewport bundles
    pub bundle_ttl_secs: Option<u64>,
    /// TTL for cached single objects
    pub object_ttl_secs: Option<u64>,
}

impl StreamingConfig {
    /// Save to file as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file and validate
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.lod.validate()?;
        self.loader.validate()?;

        let c = &self.compression;
        if !(c.similarity_threshold > 0.0 && c.similarity_threshold <= 1.0) {
            return Err(Error::Config(format!(
                "similarity threshold must be in (0, 1], got {}",
                c.similarity_threshold
            )));
        }
        if c.max_templates == 0 {
            return Err(Error::Config("max_templates must be positive".into()));
        }
        if c.weights.total() <= 0.0 {
            return Err(Error::Config("similarity weights must not all be zero".into()));
        }

        let v = &self.viewport;
        if v.history_size == 0
            || v.buffer_factor < 1.0
            || v.key_resolution <= 0.0
            || v.prediction_horizon_secs < 0.0
            || !(v.similarity_threshold > 0.0 && v.similarity_threshold <= 1.0)
        {
            return Err(Error::Config(format!("invalid viewport settings {:?}", v)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::cache::EvictionPolicy;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = StreamingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.loader.max_concurrent, 6);
        assert_eq!(config.viewport.history_size, 10);
        assert_eq!(config.compression.similarity_threshold, 0.9);
        assert_eq!(config.cache.global_threshold, 0.8);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("streaming.json");

        let mut config = StreamingConfig::default();
        config.cache.policy = EvictionPolicy::Lfu;
        config.default_role = UserRole::Superintendent;
        config.save(&path).unwrap();

        let loaded = StreamingConfig::load(&path).unwrap();
        assert_eq!(loaded.cache.policy, EvictionPolicy::Lfu);
        assert_eq!(loaded.default_role, UserRole::Superintendent);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "cache": { "policy": "size_aware", "capacity_bytes": 4096 } }"#).unwrap();

        let config = StreamingConfig::load(&path).unwrap();
        assert_eq!(config.cache.policy, EvictionPolicy::SizeAware);
        assert_eq!(config.cache.capacity_bytes, 4096);
        assert_eq!(config.cache.global_threshold, 0.8);
        assert_eq!(config.loader.max_concurrent, 6);
    }

    #[test]
    fn test_unknown_policy_fails_to_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"{ "cache": { "policy": "random" } }"#).unwrap();
        assert!(matches!(StreamingConfig::load(&path), Err(Error::Json(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = StreamingConfig::default();
        config.cache.capacity_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = StreamingConfig::default();
        config.viewport.buffer_factor = 0.5;
        assert!(config.validate().is_err());

        let mut config = StreamingConfig::default();
        config.viewport.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = StreamingConfig::default();
        config.loader.max_concurrent = 0;
        assert!(config.validate().is_err());

        let mut config = StreamingConfig::default();
        config.compression.similarity_threshold = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            StreamingConfig::load(&dir.path().join("nope.json")),
            Err(Error::Io(_))
        ));
    }
}
