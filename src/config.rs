//! Configuration loading and management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding run and gate state
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Workflow id used when none is given on the command line
    #[serde(default = "default_workflow_id")]
    pub workflow_id: String,

    /// Identity recorded on approvals when none is given
    #[serde(default = "default_approver")]
    pub approver: String,

    /// Settings for the `exec` stage
    #[serde(default)]
    pub exec: ExecConfig,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".lobster")
}

fn default_workflow_id() -> String {
    "default".to_string()
}

fn default_approver() -> String {
    std::env::var("USER").unwrap_or_else(|_| "user".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            workflow_id: default_workflow_id(),
            approver: default_approver(),
            exec: ExecConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path.map(PathBuf::from).or_else(|| {
            // Try .lobster/config.toml in current directory
            let local = PathBuf::from(".lobster/config.toml");
            if local.exists() {
                return Some(local);
            }

            // Try ~/.lobster/config.toml
            dirs::home_dir().map(|h| h.join(".lobster/config.toml"))
        });

        match config_path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(&p)?;
                Self::parse(&content)
            }
            Some(p) if path.is_some() => Err(Error::Config(format!(
                "Config file not found: {}",
                p.display()
            ))),
            _ => Ok(Config::default()),
        }
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        // Fail early on a bad timeout rather than at the first exec stage
        config.exec.timeout()?;
        Ok(config)
    }

    /// State directory with `~` and environment variables expanded
    pub fn state_dir(&self) -> Result<PathBuf> {
        let raw = self.state_dir.to_string_lossy();
        let expanded = shellexpand::full(&raw)
            .map_err(|e| Error::Config(format!("Cannot expand state_dir: {}", e)))?;
        Ok(PathBuf::from(expanded.as_ref()))
    }
}

/// `exec` stage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Default timeout for spawned commands, e.g. "30s" (none = wait forever)
    #[serde(default)]
    pub timeout: Option<String>,

    /// Shell used by `exec --shell`
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            shell: default_shell(),
        }
    }
}

impl ExecConfig {
    /// Parsed default timeout
    pub fn timeout(&self) -> Result<Option<Duration>> {
        self.timeout
            .as_deref()
            .map(parse_duration)
            .transpose()
    }
}

/// Parse a humantime duration such as "500ms" or "2m 30s"
pub fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s)
        .map_err(|e| Error::Config(format!("Invalid duration '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config = Config::parse(
            r#"
state_dir = "/tmp/lobster-state"
workflow_id = "release"
approver = "ops"

[exec]
timeout = "1m 30s"
shell = "bash"
"#,
        )
        .unwrap();

        assert_eq!(config.workflow_id, "release");
        assert_eq!(config.approver, "ops");
        assert_eq!(config.exec.shell, "bash");
        assert_eq!(config.exec.timeout().unwrap(), Some(Duration::from_secs(90)));
        assert_eq!(
            config.state_dir().unwrap(),
            PathBuf::from("/tmp/lobster-state")
        );
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.workflow_id, "default");
        assert_eq!(config.state_dir, PathBuf::from(".lobster"));
        assert_eq!(config.exec.shell, "sh");
        assert_eq!(config.exec.timeout().unwrap(), None);
    }

    #[test]
    fn test_bad_timeout_rejected() {
        let err = Config::parse("[exec]\ntimeout = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Config::load(Some(&missing)).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "workflow_id = \"nightly\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.workflow_id, "nightly");
    }
}
