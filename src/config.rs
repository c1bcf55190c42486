use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const ENV_PREFIX: &str = "PUZZLECRAFT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub default_backend: String,
    pub log_level: String,
    pub pipeline: PipelineConfig,
    pub quality: QualityConfig,
    pub storage: StorageConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            default_backend: "local_cartoon".to_string(),
            log_level: "info".to_string(),
            pipeline: PipelineConfig::default(),
            quality: QualityConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

/// How regeneration attempts pick the seed they hand to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedPolicy {
    Reuse,
    Vary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_extra_attempts: u32,
    pub seed_policy: SeedPolicy,
    pub base_seed: Option<u64>,
    pub worker_concurrency: usize,
    pub backend_concurrency: usize,
    pub stage_timeout_secs: u64,
    pub min_input_px: u32,
    pub max_working_px: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_extra_attempts: 2,
            seed_policy: SeedPolicy::Reuse,
            base_seed: None,
            worker_concurrency: 4,
            backend_concurrency: 4,
            stage_timeout_secs: 120,
            min_input_px: 256,
            max_working_px: 1024,
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

/// Composite-score weighting. Swappable without a rebuild: the weights
/// follow the product's visual style.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    pub threshold: f64,
    pub weights: IndexMap<String, f64>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        let weights = [
            ("face_similarity", 0.15),
            ("color_vibrancy", 0.25),
            ("face_detection_confidence", 0.10),
            ("resolution", 0.10),
            ("edge_cleanliness", 0.20),
            ("color_diversity", 0.20),
        ]
        .into_iter()
        .map(|(name, weight)| (name.to_string(), weight))
        .collect();

        Self {
            threshold: 70.0,
            weights,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub jobs_dir: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    /// Append-only JSONL consent log. Without one every order needs
    /// `skip_consent`.
    pub consent_log: Option<PathBuf>,
}

impl Configuration {
    /// Layers defaults, an optional TOML file and `PUZZLECRAFT__*` environment
    /// variables, in that order.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Configuration::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let configuration: Configuration = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        configuration.validate()?;
        Ok(configuration)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.worker_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.worker_concurrency must be at least 1".to_string(),
            ));
        }
        if self.pipeline.backend_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.backend_concurrency must be at least 1".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.quality.threshold) {
            return Err(ConfigError::Invalid(format!(
                "quality.threshold must be within 0..=100, got {}",
                self.quality.threshold
            )));
        }
        if let Some((name, weight)) = self
            .quality
            .weights
            .iter()
            .find(|(_, weight)| !weight.is_finite() || **weight < 0.0)
        {
            return Err(ConfigError::Invalid(format!(
                "quality weight '{}' must be a non-negative number, got {}",
                name, weight
            )));
        }
        // A journal that outlives the process must point at artifacts that do too.
        if self.storage.jobs_dir.is_some() && self.storage.artifacts_dir.is_none() {
            return Err(ConfigError::Invalid(
                "storage.jobs_dir requires storage.artifacts_dir".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_weights_sum_to_one() {
        let config = QualityConfig::default();
        let total: f64 = config.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(config.threshold, 70.0);
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let configuration = Configuration::load(None).unwrap();
        assert_eq!(configuration.pipeline.max_extra_attempts, 2);
        assert_eq!(configuration.pipeline.seed_policy, SeedPolicy::Reuse);
        assert_eq!(configuration.default_backend, "local_cartoon");
    }

    #[test]
    fn test_load_overrides_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[pipeline]
max_extra_attempts = 5
seed_policy = "vary"

[quality]
threshold = 55.0
"#
        )
        .unwrap();

        let configuration = Configuration::load(Some(file.path())).unwrap();
        assert_eq!(configuration.pipeline.max_extra_attempts, 5);
        assert_eq!(configuration.pipeline.seed_policy, SeedPolicy::Vary);
        assert_eq!(configuration.quality.threshold, 55.0);
        assert_eq!(configuration.pipeline.worker_concurrency, 4);
    }

    #[test]
    fn test_validate_rejects_negative_weight() {
        let mut configuration = Configuration::default();
        configuration
            .quality
            .weights
            .insert("color_vibrancy".to_string(), -1.0);
        assert!(matches!(
            configuration.validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut configuration = Configuration::default();
        configuration.pipeline.worker_concurrency = 0;
        assert!(configuration.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_journal_without_artifact_dir() {
        let mut configuration = Configuration::default();
        configuration.storage.jobs_dir = Some(PathBuf::from("/var/lib/puzzlecraft/jobs"));
        assert!(matches!(
            configuration.validate(),
            Err(ConfigError::Invalid(message)) if message.contains("artifacts_dir")
        ));

        configuration.storage.artifacts_dir = Some(PathBuf::from("/var/lib/puzzlecraft/artifacts"));
        assert!(configuration.validate().is_ok());
    }
}
