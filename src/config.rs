//! Configuration for the engine.
//!
//! Defines importer, test runner and serving settings. Every field has a
//! default so an empty document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Spec import settings
    #[serde(default)]
    pub importer: ImporterSettings,

    /// Test runner settings
    #[serde(default)]
    pub runner: RunnerSettings,

    /// Serving settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.importer
            .validate()
            .map_err(|e| anyhow::anyhow!("importer: {}", e))?;
        self.runner
            .validate()
            .map_err(|e| anyhow::anyhow!("runner: {}", e))?;
        Ok(())
    }
}

/// Structural encoding of a specification document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentFormat::Json => write!(f, "json"),
            DocumentFormat::Yaml => write!(f, "yaml"),
        }
    }
}

/// Importer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImporterSettings {
    /// Leading non-blank lines inspected when sniffing the format
    #[serde(default = "default_sniff_lines")]
    pub sniff_lines: usize,

    /// Format assumed when sniffing finds no clue
    #[serde(default = "default_format")]
    pub default_format: DocumentFormat,

    /// Content type used when neither message nor document declares one
    #[serde(default = "default_content_type")]
    pub default_content_type: String,

    /// Maximum number of chained references followed
    #[serde(default = "default_max_reference_depth")]
    pub max_reference_depth: usize,
}

impl Default for ImporterSettings {
    fn default() -> Self {
        Self {
            sniff_lines: default_sniff_lines(),
            default_format: default_format(),
            default_content_type: default_content_type(),
            max_reference_depth: default_max_reference_depth(),
        }
    }
}

impl ImporterSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sniff_lines == 0 {
            anyhow::bail!("sniff_lines must be greater than 0");
        }
        if !(1..=64).contains(&self.max_reference_depth) {
            anyhow::bail!(
                "max_reference_depth must be within 1..=64, got {}",
                self.max_reference_depth
            );
        }
        Ok(())
    }
}

fn default_sniff_lines() -> usize {
    20
}

fn default_format() -> DocumentFormat {
    DocumentFormat::Yaml
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_max_reference_depth() -> usize {
    16
}

/// Test runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSettings {
    /// Connect timeout for outbound calls (ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Overall read timeout for outbound calls (ms)
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Transport-level retries per request
    #[serde(default)]
    pub retries: u32,

    /// Delay between retries (ms)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Run operations of one test concurrently
    #[serde(default = "default_true")]
    pub parallel_operations: bool,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            retries: 0,
            retry_delay_ms: default_retry_delay_ms(),
            parallel_operations: true,
        }
    }
}

impl RunnerSettings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout_ms == 0 {
            anyhow::bail!("connect_timeout_ms must be greater than 0");
        }
        if self.read_timeout_ms == 0 {
            anyhow::bail!("read_timeout_ms must be greater than 0");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    30_000
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

/// Serving settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Log all dispatched requests
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log requests no exchange answered
    #[serde(default = "default_true")]
    pub log_unmatched: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            log_matches: true,
            log_unmatched: true,
        }
    }
}
