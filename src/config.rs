use config::{Config as ConfigTree, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const ENVIRONMENT_PREFIX: &str = "SUBSCRIPTIONS";
const CONFIG_SEPARATOR: &str = "__";

#[derive(Debug, Deserialize, Clone)]
pub struct EngineSettings {
    #[serde(
        default = "default_dedup_capacity",
        deserialize_with = "validate_capacity"
    )]
    pub dedup_capacity: usize,
    #[serde(
        default = "default_buffer_size",
        deserialize_with = "validate_capacity"
    )]
    pub subscription_buffer: usize,
    #[serde(
        default = "default_buffer_size",
        deserialize_with = "validate_capacity"
    )]
    pub global_buffer: usize,
    #[serde(with = "humantime_serde", default = "default_group_delay")]
    pub group_delay: Duration,
    #[serde(default)]
    pub validation: ValidationSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ValidationSettings {
    #[serde(default = "default_min_samples")]
    pub min_samples: u64,
    #[serde(
        default = "default_max_trust_reduction",
        deserialize_with = "validate_trust_reduction"
    )]
    pub max_trust_reduction: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dedup_capacity: default_dedup_capacity(),
            subscription_buffer: default_buffer_size(),
            global_buffer: default_buffer_size(),
            group_delay: default_group_delay(),
            validation: ValidationSettings::default(),
        }
    }
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            min_samples: default_min_samples(),
            max_trust_reduction: default_max_trust_reduction(),
        }
    }
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_buffer_size() -> usize {
    1024
}

fn default_group_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_min_samples() -> u64 {
    10
}

fn default_max_trust_reduction() -> f64 {
    0.9
}

fn validate_capacity<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let size = usize::deserialize(deserializer)?;
    if size == 0 {
        return Err(D::Error::custom("capacity must be greater than 0"));
    }
    Ok(size)
}

fn validate_trust_reduction<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let reduction = f64::deserialize(deserializer)?;
    if !(0.0..1.0).contains(&reduction) {
        return Err(D::Error::custom(
            "max_trust_reduction must be in the range [0, 1)",
        ));
    }
    Ok(reduction)
}

#[derive(Debug, Clone)]
pub struct Config {
    config: ConfigTree,
}

impl Config {
    pub fn new<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let environment =
            std::env::var(format!("{ENVIRONMENT_PREFIX}{CONFIG_SEPARATOR}ENVIRONMENT"))
                .unwrap_or_else(|_| "development".into());

        let config_dir = config_dir.as_ref();
        let default_config = config_dir.join("settings.yml");
        let env_config = config_dir.join(format!("settings.{}.yml", environment));
        let local_config = config_dir.join("settings.local.yml");

        let config = ConfigTree::builder()
            .add_source(File::from(default_config))
            .add_source(File::from(env_config).required(false))
            .add_source(File::from(local_config).required(false))
            .add_source(
                Environment::with_prefix(ENVIRONMENT_PREFIX)
                    .separator(CONFIG_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?;

        Ok(Config { config })
    }

    pub fn get_settings(&self) -> Result<EngineSettings, ConfigError> {
        let settings: EngineSettings = self.config.get("engine")?;
        tracing::debug!(
            "Engine config: dedup_capacity={}, subscription_buffer={}, global_buffer={}, group_delay={:?}, min_samples={}, max_trust_reduction={}",
            settings.dedup_capacity,
            settings.subscription_buffer,
            settings.global_buffer,
            settings.group_delay,
            settings.validation.min_samples,
            settings.validation.max_trust_reduction,
        );
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_settings(contents: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("settings.yml"), contents).unwrap();
        dir
    }

    #[test]
    fn test_defaults_apply_to_missing_fields() {
        let dir = write_settings("engine:\n  dedup_capacity: 500\n");
        let settings = Config::new(dir.path()).unwrap().get_settings().unwrap();

        assert_eq!(settings.dedup_capacity, 500);
        assert_eq!(settings.subscription_buffer, 1024);
        assert_eq!(settings.group_delay, Duration::from_millis(100));
        assert_eq!(settings.validation.min_samples, 10);
        assert_eq!(settings.validation.max_trust_reduction, 0.9);
    }

    #[test]
    fn test_parses_humantime_delay_and_validation_section() {
        let dir = write_settings(
            "engine:\n  group_delay: 250ms\n  validation:\n    min_samples: 50\n    max_trust_reduction: 0.5\n",
        );
        let settings = Config::new(dir.path()).unwrap().get_settings().unwrap();

        assert_eq!(settings.group_delay, Duration::from_millis(250));
        assert_eq!(settings.validation.min_samples, 50);
        assert_eq!(settings.validation.max_trust_reduction, 0.5);
    }

    #[test]
    fn test_local_file_overrides_defaults() {
        let dir = write_settings("engine:\n  global_buffer: 64\n");
        fs::write(
            dir.path().join("settings.local.yml"),
            "engine:\n  global_buffer: 128\n",
        )
        .unwrap();
        let settings = Config::new(dir.path()).unwrap().get_settings().unwrap();

        assert_eq!(settings.global_buffer, 128);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let dir = write_settings("engine:\n  subscription_buffer: 0\n");
        let result = Config::new(dir.path()).unwrap().get_settings();

        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_full_trust_reduction() {
        let dir = write_settings("engine:\n  validation:\n    max_trust_reduction: 1.0\n");
        let result = Config::new(dir.path()).unwrap().get_settings();

        assert!(result.is_err());
    }
}
