// svnbackup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::backup::BackupMode;
use crate::logging::LogFormat;

pub const DEFAULT_BACKUP_DIR: &str = "./backups";
pub const ENV_BACKUP_ROOT: &str = "SVNBACKUP_ROOT";
pub const ENV_CONFIG_PATH: &str = "SVNBACKUP_CONFIG";

// Struct for deserializing the optional JSON config file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawJsonConfig {
    pub backup_root: Option<PathBuf>,
    pub svnadmin: Option<PathBuf>,
    pub svnlook: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
}

impl RawJsonConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })
    }
}

/// Values gathered from the command line and the environment before the
/// config file is consulted.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    pub repository: PathBuf,
    pub mode: Option<BackupMode>,
    pub verbosity: u8,
    pub cli_backup_root: Option<PathBuf>,
    pub cli_config_path: Option<PathBuf>,
    pub env_backup_root: Option<String>,
    pub env_config_path: Option<String>,
}

impl ConfigSources {
    pub fn with_env(mut self) -> Self {
        self.env_backup_root = std::env::var(ENV_BACKUP_ROOT).ok();
        self.env_config_path = std::env::var(ENV_CONFIG_PATH).ok();
        self
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub repository: PathBuf,
    pub backup_root: PathBuf,
    pub mode: BackupMode,
    pub verbosity: u8,
    pub svnadmin: Option<PathBuf>,
    pub svnlook: Option<PathBuf>,
    pub log_format: LogFormat,
}

/// Resolves the effective configuration. Backup root precedence is
/// command line, then environment, then config file, then `./backups`.
pub fn load_backup_config(sources: ConfigSources) -> Result<BackupConfig> {
    let mode = sources.mode.context("no backup mode selected")?;

    let config_path = sources
        .cli_config_path
        .clone()
        .or_else(|| non_empty(sources.env_config_path.as_deref()).map(PathBuf::from));
    let raw = match &config_path {
        Some(path) => RawJsonConfig::load_from_json(path)?,
        None => RawJsonConfig::default(),
    };

    let backup_root = sources
        .cli_backup_root
        .clone()
        .or_else(|| non_empty(sources.env_backup_root.as_deref()).map(PathBuf::from))
        .or_else(|| raw.backup_root.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BACKUP_DIR));
    if backup_root.as_os_str().is_empty() {
        anyhow::bail!("backup root cannot be empty");
    }

    validate_repository_path(&sources.repository)?;

    Ok(BackupConfig {
        repository: sources.repository,
        backup_root,
        mode,
        verbosity: sources.verbosity,
        svnadmin: raw.svnadmin,
        svnlook: raw.svnlook,
        log_format: raw.log_format.unwrap_or_default(),
    })
}

fn validate_repository_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("repository path is required");
    }
    let metadata = fs::metadata(path)
        .with_context(|| format!("repository path {} is not accessible", path.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("repository path {} is not a directory", path.display());
    }
    Ok(())
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sources(repo: &Path) -> ConfigSources {
        ConfigSources {
            repository: repo.to_path_buf(),
            mode: Some(BackupMode::Full),
            ..ConfigSources::default()
        }
    }

    #[test]
    fn test_default_backup_root() -> anyhow::Result<()> {
        let repo = tempdir()?;
        let config = load_backup_config(sources(repo.path()))?;
        assert_eq!(config.backup_root, PathBuf::from(DEFAULT_BACKUP_DIR));
        assert_eq!(config.log_format, LogFormat::Human);
        assert!(config.svnadmin.is_none());
        Ok(())
    }

    #[test]
    fn test_backup_root_precedence() -> anyhow::Result<()> {
        let repo = tempdir()?;
        let dir = tempdir()?;
        let config_path = dir.path().join("svnbackup.json");
        fs::write(
            &config_path,
            r#"{"backup_root": "/from/file", "svnadmin": "/opt/svn/bin/svnadmin", "log_format": "json"}"#,
        )?;

        let mut src = sources(repo.path());
        src.cli_config_path = Some(config_path.clone());
        let config = load_backup_config(src.clone())?;
        assert_eq!(config.backup_root, PathBuf::from("/from/file"));
        assert_eq!(config.svnadmin, Some(PathBuf::from("/opt/svn/bin/svnadmin")));
        assert_eq!(config.log_format, LogFormat::Json);

        src.env_backup_root = Some("/from/env".into());
        let config = load_backup_config(src.clone())?;
        assert_eq!(config.backup_root, PathBuf::from("/from/env"));

        src.cli_backup_root = Some(PathBuf::from("/from/cli"));
        let config = load_backup_config(src)?;
        assert_eq!(config.backup_root, PathBuf::from("/from/cli"));
        Ok(())
    }

    #[test]
    fn test_config_path_from_env() -> anyhow::Result<()> {
        let repo = tempdir()?;
        let dir = tempdir()?;
        let config_path = dir.path().join("svnbackup.json");
        fs::write(&config_path, r#"{"svnlook": "/usr/local/bin/svnlook"}"#)?;

        let mut src = sources(repo.path());
        src.env_config_path = Some(config_path.display().to_string());
        let config = load_backup_config(src)?;
        assert_eq!(config.svnlook, Some(PathBuf::from("/usr/local/bin/svnlook")));
        Ok(())
    }

    #[test]
    fn test_unknown_config_key_rejected() -> anyhow::Result<()> {
        let repo = tempdir()?;
        let dir = tempdir()?;
        let config_path = dir.path().join("svnbackup.json");
        fs::write(&config_path, r#"{"retention_days": 7}"#)?;

        let mut src = sources(repo.path());
        src.cli_config_path = Some(config_path);
        assert!(load_backup_config(src).is_err());
        Ok(())
    }

    #[test]
    fn test_repository_must_be_directory() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = dir.path().join("not-a-repo");
        fs::write(&file, b"plain file")?;

        assert!(load_backup_config(sources(&file)).is_err());
        assert!(load_backup_config(sources(&dir.path().join("missing"))).is_err());
        Ok(())
    }

    #[test]
    fn test_mode_required() -> anyhow::Result<()> {
        let repo = tempdir()?;
        let mut src = sources(repo.path());
        src.mode = None;
        assert!(load_backup_config(src).is_err());
        Ok(())
    }
}
