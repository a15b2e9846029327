// Runner configuration
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Size of the worker pool
    pub workers: usize,
    /// Deadline for discovery calls into the host
    pub call_timeout_ms: u64,
    /// Deadline for instantiate, lifecycle hooks and test methods
    pub method_timeout_ms: u64,
    /// Optional deadline for a whole run
    pub job_timeout_ms: Option<u64>,
    /// How long terminal jobs stay pollable
    pub result_ttl_secs: u64,
    /// Ancestor a class must extend to be a test class
    pub test_case_class: String,
    /// Name prefix of test methods
    pub test_method_prefix: String,
    /// Qualifiers used when a caller passes none
    pub default_qualifiers: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            call_timeout_ms: 30_000,
            method_timeout_ms: 30_000,
            job_timeout_ms: None,
            result_ttl_secs: 86_400,
            test_case_class: "%UnitTest.TestCase".to_string(),
            test_method_prefix: "Test".to_string(),
            default_qualifiers: "/recursive".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Load configuration from a JSON file
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Runner config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let config: RunnerConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `config_path`, or fall back to defaults when the file is absent
    pub fn load_or_default(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            Self::load(config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.call_timeout_ms == 0 || self.method_timeout_ms == 0 {
            bail!("host call timeouts must be greater than zero");
        }
        if self.job_timeout_ms == Some(0) {
            bail!("job_timeout_ms must be greater than zero when set");
        }
        if self.test_case_class.trim().is_empty() {
            bail!("test_case_class cannot be empty");
        }
        if self.test_method_prefix.trim().is_empty() {
            bail!("test_method_prefix cannot be empty");
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn method_timeout(&self) -> Duration {
        Duration::from_millis(self.method_timeout_ms)
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}
