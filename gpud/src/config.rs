//! Configuration module for GPUd
//!
//! Handles loading and validating configuration from YAML files and environment variables.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Remediation escalation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// How far back reboot and failure events are considered
    #[serde(with = "humantime_serde", default = "default_lookback")]
    pub lookback: Duration,

    /// Reboot/failure sequences before escalating to hardware inspection
    #[serde(default = "default_sequence_threshold")]
    pub sequence_threshold: i32,

    /// How long a suggested repair action stays live
    #[serde(with = "humantime_serde", default = "default_suggestion_ttl")]
    pub suggestion_ttl: Duration,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            lookback: default_lookback(),
            sequence_threshold: default_sequence_threshold(),
            suggestion_ttl: default_suggestion_ttl(),
        }
    }
}

/// Built-in OS component configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for OsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// A health check program run as its own component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandCheckConfig {
    /// Component name, must be unique
    pub name: String,

    /// Program to execute; a zero exit status means healthy
    #[serde(default = "default_check_command")]
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Overrides the global check interval
    #[serde(with = "humantime_serde", default)]
    pub interval: Option<Duration>,

    /// Deadline of a single run
    #[serde(with = "humantime_serde", default = "default_check_timeout")]
    pub timeout: Duration,

    /// Consecutive failures before the component reports unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether metrics are enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port to expose metrics on
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Machine identifier, falls back to the hostname
    #[serde(default)]
    pub machine_id: Option<String>,

    /// Default interval between periodic checks
    #[serde(with = "humantime_serde", default = "default_check_interval")]
    pub check_interval: Duration,

    /// Run the first check as soon as a component starts
    #[serde(default = "default_true")]
    pub run_check_on_start: bool,

    /// Interval of the node status summary
    #[serde(with = "humantime_serde", default = "default_status_interval")]
    pub status_interval: Duration,

    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Events older than this are purged
    #[serde(with = "humantime_serde", default = "default_event_retention")]
    pub event_retention: Duration,

    #[serde(default)]
    pub os: OsConfig,

    /// Health check programs
    #[serde(default = "default_checks")]
    pub checks: Vec<CommandCheckConfig>,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            machine_id: None,
            check_interval: default_check_interval(),
            run_check_on_start: true,
            status_interval: default_status_interval(),
            escalation: EscalationConfig::default(),
            event_retention: default_event_retention(),
            os: OsConfig::default(),
            checks: default_checks(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("Failed to parse YAML configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.check_interval.is_zero() {
            anyhow::bail!("check_interval must be > 0");
        }
        if self.status_interval.is_zero() {
            anyhow::bail!("status_interval must be > 0");
        }
        if self.escalation.suggestion_ttl.is_zero() {
            anyhow::bail!("escalation.suggestion_ttl must be > 0");
        }
        if self.event_retention < self.escalation.lookback {
            anyhow::bail!("event_retention must be >= escalation.lookback");
        }

        let mut names = std::collections::HashSet::new();
        for check in &self.checks {
            if check.name.is_empty() {
                anyhow::bail!("check name must not be empty");
            }
            if self.os.enabled && check.name == gpud_core::eventstore::OS_BUCKET {
                anyhow::bail!("check name {:?} is reserved", check.name);
            }
            if !names.insert(check.name.as_str()) {
                anyhow::bail!("duplicate check name {:?}", check.name);
            }
            if check.command.is_empty() {
                anyhow::bail!("check {:?}: command must not be empty", check.name);
            }
            if check.timeout.is_zero() {
                anyhow::bail!("check {:?}: timeout must be > 0", check.name);
            }
            if check.interval.is_some_and(|i| i.is_zero()) {
                anyhow::bail!("check {:?}: interval must be > 0", check.name);
            }
            if check.failure_threshold == 0 {
                anyhow::bail!("check {:?}: failure_threshold must be > 0", check.name);
            }
        }

        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port must be > 0 when metrics are enabled");
        }
        Ok(())
    }

    /// Fill machine_id from the environment or hostname if not set
    pub fn with_machine_id_from_env(mut self) -> Self {
        if self.machine_id.is_none() {
            self.machine_id = std::env::var("GPUD_MACHINE_ID")
                .ok()
                .or_else(|| std::env::var("HOSTNAME").ok())
                .filter(|id| !id.is_empty());
        }
        self
    }
}

// Default value functions
fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_status_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_lookback() -> Duration {
    Duration::from_secs(3 * 24 * 3600) // 3 days
}

fn default_sequence_threshold() -> i32 {
    2
}

fn default_suggestion_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_event_retention() -> Duration {
    Duration::from_secs(7 * 24 * 3600) // 7 days
}

fn default_check_command() -> String {
    "/usr/local/bin/gpu-check".to_string()
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_checks() -> Vec<CommandCheckConfig> {
    vec![CommandCheckConfig {
        name: "gpu-check".to_string(),
        command: default_check_command(),
        args: Vec::new(),
        interval: None,
        timeout: default_check_timeout(),
        failure_threshold: default_failure_threshold(),
    }]
}

fn default_metrics_port() -> u16 {
    9100
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.check_interval, Duration::from_secs(60));
        assert_eq!(config.escalation.lookback, Duration::from_secs(259_200));
        assert_eq!(config.escalation.sequence_threshold, 2);
        assert_eq!(config.checks.len(), 1);
        assert_eq!(config.checks[0].command, "/usr/local/bin/gpu-check");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
machine_id: node-a
check_interval: 30s
run_check_on_start: false
status_interval: 1m

escalation:
  lookback: 2days
  sequence_threshold: 3
  suggestion_ttl: 30m

event_retention: 5days

os:
  enabled: false

checks:
  - name: nvlink
    command: /opt/checks/nvlink.sh
    args: ["--quick"]
    interval: 5m
    timeout: 10s
    failure_threshold: 5
  - name: ib

metrics:
  enabled: true
  port: 9200
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.machine_id.as_deref(), Some("node-a"));
        assert_eq!(config.check_interval, Duration::from_secs(30));
        assert!(!config.run_check_on_start);
        assert_eq!(config.escalation.lookback, Duration::from_secs(172_800));
        assert_eq!(config.escalation.sequence_threshold, 3);
        assert_eq!(config.escalation.suggestion_ttl, Duration::from_secs(1800));
        assert!(!config.os.enabled);

        assert_eq!(config.checks.len(), 2);
        assert_eq!(config.checks[0].args, vec!["--quick"]);
        assert_eq!(config.checks[0].interval, Some(Duration::from_secs(300)));
        assert_eq!(config.checks[0].failure_threshold, 5);
        assert_eq!(config.checks[1].command, "/usr/local/bin/gpu-check");
        assert_eq!(config.checks[1].interval, None);
        assert_eq!(config.checks[1].timeout, Duration::from_secs(30));

        assert_eq!(config.metrics.port, 9200);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_checks() {
        let yaml = r#"
checks:
  - name: gpu
  - name: gpu
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_reserved_name() {
        let yaml = r#"
checks:
  - name: os
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_short_retention() {
        let mut config = Config::default();
        config.event_retention = Duration::from_secs(3600);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = Config::default();
        config.checks[0].failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "check_interval: 2m\nchecks: []").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.check_interval, Duration::from_secs(120));
        assert!(config.checks.is_empty());
    }

    #[test]
    fn test_from_missing_file() {
        let err = Config::from_file("/nonexistent/gpud.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
