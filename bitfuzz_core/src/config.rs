use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Target application path is empty")]
    MissingApplication,
    #[error("timeout-ms must be greater than zero")]
    ZeroTimeout,
    #[error("max-bits-to-flip must be greater than zero")]
    ZeroMaxBits,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    #[serde(default)]
    pub application: PathBuf,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            application: PathBuf::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl TargetSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    2000
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    /// Zero means run until killed.
    #[serde(default)]
    pub max_executions: u64,
    #[serde(default = "default_max_bits_to_flip")]
    pub max_bits_to_flip: u32,
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

pub fn default_max_bits_to_flip() -> u32 {
    256
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_executions: 0,
            max_bits_to_flip: default_max_bits_to_flip(),
            rng_seed: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CorpusConfig {
    #[serde(default)]
    pub seed_paths: Vec<PathBuf>,
    #[serde(default = "default_working_file_stem")]
    pub working_file_stem: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
}

pub fn default_working_file_stem() -> String {
    "test_input".to_string()
}

pub fn default_working_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for CorpusConfig {
    fn default() -> Self {
        Self {
            seed_paths: Vec::new(),
            working_file_stem: default_working_file_stem(),
            working_dir: default_working_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RecorderConfig {
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default)]
    pub crash_dir: Option<PathBuf>,
}

pub fn default_log_path() -> PathBuf {
    PathBuf::from("fuzzer.log")
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
            crash_dir: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct BitfuzzConfig {
    #[serde(default)]
    pub target: TargetSettings,
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub corpus: CorpusConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
}

impl BitfuzzConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: BitfuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Checks the limits the fuzz loop relies on. Seed paths are not checked here;
    /// an unusable seed surfaces as a corpus error when it is first selected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.application.as_os_str().is_empty() {
            return Err(ConfigError::MissingApplication);
        }
        if self.target.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.fuzzer.max_bits_to_flip == 0 {
            return Err(ConfigError::ZeroMaxBits);
        }
        Ok(())
    }
}
