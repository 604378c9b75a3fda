//! Runtime configuration
//!
//! Loaded from JSON; every field is optional and falls back to the defaults
//! below.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::coap_types::ContentFormat;
use crate::error::{Error, Result};

/// Tunables for the data model and block-wise transfers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Capacity of the object registry
    pub max_objects: usize,
    /// Preferred block size for block-wise transfers
    pub block_size: u16,
    /// Whether BERT blocks (multiples of 1024 bytes) are accepted
    pub bert_enabled: bool,
    /// Content-Format used for reads when the request has no Accept option
    pub default_read_format: u16,
    /// Initial capacity of option containers built from the configuration
    pub max_options_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_objects: 16,
            block_size: 1024,
            bert_enabled: false,
            default_read_format: ContentFormat::SenmlCbor.as_u16(),
            max_options_size: 128,
        }
    }
}

impl Config {
    /// Parse a configuration from the given path
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Parse a configuration from a JSON string
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_objects == 0 {
            return Err(Error::Logic("max-objects must be non-zero"));
        }
        if !self.block_size.is_power_of_two() || !(16..=1024).contains(&self.block_size) {
            return Err(Error::Logic("block-size must be a power of two in 16..=1024"));
        }
        if self.max_options_size == 0 {
            return Err(Error::Logic("max-options-size must be non-zero"));
        }
        if ContentFormat::from_u16(self.default_read_format).is_none() {
            return Err(Error::Logic("default-read-format is not a known content format"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = Config::from_json_str(r#"{"block-size": 256, "bert-enabled": true}"#).unwrap();
        assert_eq!(config.block_size, 256);
        assert!(config.bert_enabled);
        assert_eq!(config.max_objects, 16);
    }

    #[test]
    fn test_invalid_block_size_rejected() {
        assert!(Config::from_json_str(r#"{"block-size": 100}"#).is_err());
        assert!(Config::from_json_str(r#"{"block-size": 2048}"#).is_err());
    }

    #[test]
    fn test_zero_capacities_rejected() {
        assert!(matches!(
            Config::from_json_str(r#"{"max-options-size": 0}"#),
            Err(Error::Logic(_))
        ));
        assert!(matches!(
            Config::from_json_str(r#"{"max-objects": 0}"#),
            Err(Error::Logic(_))
        ));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(matches!(
            Config::from_json_str(r#"{"blocksize": 64}"#),
            Err(Error::Json(_))
        ));
    }
}
