//! Engine configuration stored under `<atlas_home>/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AtlasConfig {
    /// Root directory for workspace metadata and worktrees.
    /// Defaults to `~/.atlas` resolved by the caller; tests inject a temp dir.
    pub home: PathBuf,

    /// Emit a terminal bell when a task enters an attention state.
    pub bell_enabled: bool,

    /// Truncate captured subprocess output beyond this many bytes.
    pub output_limit_bytes: usize,

    pub ai: AiConfig,
    pub ci: CiConfig,
    pub git: GitConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AiConfig {
    /// AI CLI program to invoke (e.g. `claude`).
    pub command: String,
    /// Default model passed to the CLI. Empty means CLI default.
    pub model: String,
    /// Per-invocation wall-clock ceiling in seconds.
    pub timeout_secs: u64,
    /// Spec-driven development CLI invoked by `sdd` steps.
    pub sdd_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CiConfig {
    /// Polling interval in seconds.
    pub interval_secs: u64,
    /// Total watch ceiling in seconds.
    pub timeout_secs: u64,
    /// Check-name patterns that must pass. Supports trailing-`*` globs.
    /// Empty means all reported checks.
    pub required_checks: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitConfig {
    /// Branch prefix used when a template does not set its own.
    pub branch_prefix: String,
    /// Footer trailers appended to every commit message.
    pub commit_trailers: Vec<String>,
    /// Generic ceiling for network git/gh calls in seconds.
    pub network_timeout_secs: u64,
}

/// Commands for the validation pipeline, grouped by stage.
///
/// Each stage is a command list run sequentially within the stage; the
/// lint/test/pre_commit stages run as a parallel group after format.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidationConfig {
    pub format_commands: Vec<String>,
    pub lint_commands: Vec<String>,
    pub test_commands: Vec<String>,
    pub pre_commit_commands: Vec<String>,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            home: PathBuf::from(".atlas"),
            bell_enabled: true,
            output_limit_bytes: 100_000,
            ai: AiConfig::default(),
            ci: CiConfig::default(),
            git: GitConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            model: String::new(),
            timeout_secs: 30 * 60,
            sdd_command: "speckit".to_string(),
        }
    }
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            interval_secs: 120,
            timeout_secs: 30 * 60,
            required_checks: Vec::new(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            branch_prefix: "atlas".to_string(),
            commit_trailers: Vec::new(),
            network_timeout_secs: 30,
        }
    }
}

impl AtlasConfig {
    pub fn validate(&self) -> Result<()> {
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.ai.command.trim().is_empty() {
            return Err(anyhow!("ai.command must not be empty"));
        }
        if self.ai.timeout_secs == 0 {
            return Err(anyhow!("ai.timeout_secs must be > 0"));
        }
        if self.git.network_timeout_secs == 0 {
            return Err(anyhow!("git.network_timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai.timeout_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.git.network_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AtlasConfig::default()` with `home` set
/// to the file's parent directory.
pub fn load_config(path: &Path) -> Result<AtlasConfig> {
    if !path.exists() {
        let mut cfg = AtlasConfig::default();
        if let Some(parent) = path.parent() {
            cfg.home = parent.to_path_buf();
        }
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AtlasConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AtlasConfig) -> Result<()> {
    cfg.validate()?;
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default_with_home() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("config.toml")).expect("load");
        assert_eq!(cfg.home, temp.path());
        assert!(cfg.bell_enabled);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = AtlasConfig::default();
        cfg.ci.required_checks = vec!["CI*".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn validate_rejects_empty_ai_command() {
        let cfg = AtlasConfig {
            ai: AiConfig {
                command: "  ".to_string(),
                ..AiConfig::default()
            },
            ..AtlasConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
