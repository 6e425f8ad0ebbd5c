//! Replay configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pmcheck_cache::Granularity;
use pmcheck_error::{PmcheckError, Result};
use serde::{Deserialize, Deserializer, Serialize};

/// Default virtual base address of the traced PM mapping.
pub const DEFAULT_IMAGE_BASE: u64 = 0x100_0000_0000;
/// Default backing image size (8 MiB).
pub const DEFAULT_IMAGE_SIZE: u64 = 8 * 1024 * 1024;
/// Default replay image file name.
pub const DEFAULT_IMAGE_NAME: &str = "pm-image";
/// Default validator wall-clock bound.
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;
/// Transactions with more stores than this skip candidate generation.
pub const DEFAULT_MAX_TX_STORES: usize = 90_000;
/// Default post-mortem core dump directory.
pub const DEFAULT_CORE_DUMP_DIR: &str = "/tmp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    #[serde(deserialize_with = "hex_or_number")]
    pub image_base: u64,
    #[serde(deserialize_with = "hex_or_number")]
    pub image_size: u64,
    pub image_name: String,
    pub output_dir: PathBuf,
    pub validator_program: PathBuf,
    pub layout: String,
    pub op_file: PathBuf,
    pub full_oracle_file: PathBuf,
    pub timeout_secs: u64,
    pub keep_images: bool,
    pub max_tx_stores: usize,
    pub max_candidates: Option<usize>,
    pub granularity: Granularity,
    pub core_dump_dir: PathBuf,
    pub workers: usize,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            image_base: DEFAULT_IMAGE_BASE,
            image_size: DEFAULT_IMAGE_SIZE,
            image_name: DEFAULT_IMAGE_NAME.to_owned(),
            output_dir: PathBuf::from("."),
            validator_program: PathBuf::new(),
            layout: String::new(),
            op_file: PathBuf::new(),
            full_oracle_file: PathBuf::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            keep_images: false,
            max_tx_stores: DEFAULT_MAX_TX_STORES,
            max_candidates: None,
            granularity: Granularity::Cacheline,
            core_dump_dir: PathBuf::from(DEFAULT_CORE_DUMP_DIR),
            workers: 1,
        }
    }
}

impl ReplayConfig {
    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|e| PmcheckError::config(e.to_string()))
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| PmcheckError::serialization(e.to_string()))
    }

    /// Check that everything a validating run needs is present.
    pub fn validate(&self) -> Result<()> {
        if self.validator_program.as_os_str().is_empty() {
            return Err(PmcheckError::config("validator_program is required"));
        }
        if self.op_file.as_os_str().is_empty() {
            return Err(PmcheckError::config("op_file is required"));
        }
        if self.full_oracle_file.as_os_str().is_empty() {
            return Err(PmcheckError::config("full_oracle_file is required"));
        }
        if self.image_size == 0 {
            return Err(PmcheckError::config("image_size must be positive"));
        }
        if self.image_name.is_empty() || self.image_name.contains('/') {
            return Err(PmcheckError::config(format!(
                "image_name '{}' must be a plain file name",
                self.image_name
            )));
        }
        if self.workers == 0 {
            return Err(PmcheckError::config("workers must be at least 1"));
        }
        self.granularity.validate()
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Path of the replay image.
    #[must_use]
    pub fn image_path(&self) -> PathBuf {
        self.output_dir.join(&self.image_name)
    }

    /// Copy of this configuration rooted at `dir`, for one worker.
    #[must_use]
    pub fn with_output_dir(&self, dir: PathBuf) -> Self {
        Self {
            output_dir: dir,
            ..self.clone()
        }
    }
}

fn hex_or_number<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => {
            let t = s.trim();
            let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => t.parse::<u64>(),
            };
            parsed.map_err(|e| serde::de::Error::custom(format!("bad number '{s}': {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ReplayConfig::default();
        assert_eq!(config.timeout_secs, 10);
        assert_eq!(config.granularity, Granularity::Cacheline);
        assert!(!config.keep_images);
        assert_eq!(config.image_path(), PathBuf::from("./pm-image"));
    }

    #[test]
    fn json_accepts_hex_strings_and_partial_input() {
        let config = ReplayConfig::from_json(
            r#"{
                "image_base": "0x7f0000000000",
                "image_size": 4096,
                "validator_program": "/bin/true",
                "granularity": {"bucket": {"bytes": 128}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.image_base, 0x7f00_0000_0000);
        assert_eq!(config.image_size, 4096);
        assert_eq!(config.granularity, Granularity::Bucket { bytes: 128 });
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn round_trips_through_json() {
        let config = ReplayConfig {
            keep_images: true,
            max_candidates: Some(500),
            ..ReplayConfig::default()
        };
        let back = ReplayConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn validate_requires_external_inputs() {
        let mut config = ReplayConfig::default();
        assert!(matches!(
            config.validate(),
            Err(PmcheckError::InvalidConfig { .. })
        ));
        config.validator_program = PathBuf::from("/bin/true");
        config.op_file = PathBuf::from("ops");
        config.full_oracle_file = PathBuf::from("oracle");
        config.validate().unwrap();
        config.workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_json_is_a_config_error() {
        let err = ReplayConfig::from_json("{\"image_base\": \"0xzz\"}").unwrap_err();
        assert!(matches!(err, PmcheckError::InvalidConfig { .. }));
    }
}
