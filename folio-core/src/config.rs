use crate::core::derivation::DerivationPolicy;
use crate::core::grouping::{DEFAULT_PHASH_THRESHOLD, DEFAULT_PROFILE_THRESHOLD};
use crate::core::hash::CONTENT_HASH_CANVAS;
use crate::core::profile::DEFAULT_PROFILE_BINS;
use crate::core::queue::DEFAULT_JOB_LIMIT;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Runtime settings. Every section defaults independently, so a partial file
/// only overrides what it names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolioConfig {
    pub derivation: DerivationConfig,
    pub grouping: GroupingConfig,
    pub ingest: IngestConfig,
    pub worker: WorkerConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DerivationConfig {
    #[serde(flatten)]
    pub policy: DerivationPolicy,
    pub hash_canvas_dimension: u32,
}

impl Default for DerivationConfig {
    fn default() -> Self {
        Self {
            policy: DerivationPolicy::default(),
            hash_canvas_dimension: CONTENT_HASH_CANVAS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    pub phash_threshold: f64,
    pub profile_threshold: f64,
    pub profile_bins: usize,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            phash_threshold: DEFAULT_PHASH_THRESHOLD,
            profile_threshold: DEFAULT_PROFILE_THRESHOLD,
            profile_bins: DEFAULT_PROFILE_BINS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub job_limit: usize,
    pub provisional_dhash: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            job_limit: DEFAULT_JOB_LIMIT,
            provisional_dhash: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub threads: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Disk,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl FolioConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        let config: FolioConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        log::debug!("Loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Defaults when `path` is `None`.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), serialized)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let policy = &self.derivation.policy;

        for (field, value) in [
            ("grouping.phash_threshold", self.grouping.phash_threshold),
            ("grouping.profile_threshold", self.grouping.profile_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} is outside [0, 1]", value),
                });
            }
        }

        for (field, value) in [
            ("derivation.max_working_dimension", policy.max_working_dimension),
            ("derivation.canonical_size", policy.canonical_size),
            ("derivation.thumbnail_size", policy.thumbnail_size),
            ("derivation.hash_canvas_dimension", self.derivation.hash_canvas_dimension),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        for (field, value) in [
            ("derivation.working_quality", policy.working_quality),
            ("derivation.thumbnail_quality", policy.thumbnail_quality),
        ] {
            if value == 0 || value > 100 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: format!("{} is outside 1..=100", value),
                });
            }
        }

        if self.ingest.job_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "ingest.job_limit",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.grouping.profile_bins == 0 {
            return Err(ConfigError::Invalid {
                field: "grouping.profile_bins",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.cache.backend == CacheBackend::Disk && self.cache.path.is_none() {
            return Err(ConfigError::Invalid {
                field: "cache.path",
                reason: "disk cache requires a path".to_string(),
            });
        }

        Ok(())
    }
}
