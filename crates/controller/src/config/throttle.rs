//! Admission throttle limits.
//!
//! Two key-to-integer maps loaded from a YAML file: `load_limits` caps the
//! number of concurrently RUNNING steps per load tag, `fail_limits` caps the
//! number of FAILED steps per fail tag before admission stops for that tag.
//! Each map must define a "total" key; it doubles as the fallback limit for
//! tags without an explicit entry.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Throttle limits for admission control.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Per-tag limits on concurrently RUNNING steps.
    #[serde(default)]
    pub load_limits: HashMap<String, i64>,

    /// Per-tag limits on FAILED steps before admission stops.
    #[serde(default)]
    pub fail_limits: HashMap<String, i64>,
}

fn default_limits(total: i64) -> HashMap<String, i64> {
    let mut m = HashMap::new();
    m.insert("total".to_string(), total);
    m
}

impl ThrottleConfig {
    /// Load throttle limits from a YAML file and validate them.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: ThrottleConfig =
            serde_yaml::from_str(&text).map_err(|e| AppError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that both maps carry the required "total" key and no negative limits.
    pub fn validate(&self) -> AppResult<()> {
        for (label, map) in [("load_limits", &self.load_limits), ("fail_limits", &self.fail_limits)]
        {
            if !map.contains_key("total") {
                return Err(AppError::Config(format!(
                    "{} must define a 'total' key",
                    label
                )));
            }
            if let Some((tag, limit)) = map.iter().find(|(_, v)| **v < 0) {
                return Err(AppError::Config(format!(
                    "{} entry '{}' is negative: {}",
                    label, tag, limit
                )));
            }
        }
        Ok(())
    }

    /// Limit on RUNNING steps for a load tag, falling back to "total".
    pub fn load_limit(&self, tag: &str) -> i64 {
        match self.load_limits.get(tag) {
            Some(limit) => *limit,
            None => self.load_limits["total"],
        }
    }

    /// Limit on FAILED steps for a fail tag, falling back to "total".
    pub fn fail_limit(&self, tag: &str) -> i64 {
        match self.fail_limits.get(tag) {
            Some(limit) => *limit,
            None => self.fail_limits["total"],
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            load_limits: default_limits(4),
            fail_limits: default_limits(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_total() {
        let config = ThrottleConfig::default();
        assert_eq!(config.load_limit("total"), 4);
        assert_eq!(config.fail_limit("total"), 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fallback_to_total() {
        let config = ThrottleConfig::default();
        assert_eq!(config.load_limit("gpu"), 4);
        assert_eq!(config.fail_limit("gpu"), 2);
    }

    #[test]
    fn test_explicit_tag_limit() {
        let mut config = ThrottleConfig::default();
        config.load_limits.insert("gpu".to_string(), 1);
        assert_eq!(config.load_limit("gpu"), 1);
        assert_eq!(config.load_limit("cpu"), 4);
    }

    #[test]
    fn test_missing_total_rejected() {
        let config: ThrottleConfig =
            serde_yaml::from_str("load_limits:\n  gpu: 2\nfail_limits:\n  total: 1\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("load_limits"));
    }

    #[test]
    fn test_negative_limit_rejected() {
        let config: ThrottleConfig =
            serde_yaml::from_str("load_limits:\n  total: -1\nfail_limits:\n  total: 1\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("throttle.yaml");
        std::fs::write(&path, "load_limits:\n  total: 8\n  gpu: 2\nfail_limits:\n  total: 3\n")
            .unwrap();

        let config = ThrottleConfig::from_file(&path).unwrap();
        assert_eq!(config.load_limit("gpu"), 2);
        assert_eq!(config.load_limit("io"), 8);
        assert_eq!(config.fail_limit("total"), 3);
    }
}
