//! Repository inspection through `svnadmin` and `svnlook`.
//!
//! Inspection is read-only: it checks the on-disk layout, runs an integrity
//! self-check, then asks for the identity, date and youngest revision.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::BackupConfig;
use crate::errors::{BackupError, RepositoryQuery, Result};
use crate::utils::{diagnostic_text, find_executable, svn_date_now};

/// Resolved locations of the external Subversion tools.
#[derive(Debug, Clone)]
pub struct SvnTools {
    pub svnadmin: PathBuf,
    pub svnlook: PathBuf,
}

impl SvnTools {
    pub fn locate(config: &BackupConfig) -> Result<Self> {
        Ok(Self {
            svnadmin: find_executable("svnadmin", config.svnadmin.as_deref())?,
            svnlook: find_executable("svnlook", config.svnlook.as_deref())?,
        })
    }
}

/// Identity and revision state of a repository, derived fresh each run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryState {
    pub path: PathBuf,
    pub identity: String,
    /// Wall clock at inspection, in `svnlook date` representation.
    pub current_timestamp: String,
    /// Date of the youngest revision as reported by `svnlook date`.
    pub repository_date: String,
    pub head_revision: u64,
}

pub async fn inspect(tools: &SvnTools, path: &Path) -> Result<RepositoryState> {
    check_layout(path)?;
    verify(tools, path).await?;

    let current_timestamp = svn_date_now();
    let identity = parse_identity(&query(tools, path, RepositoryQuery::Uuid).await?)?;
    let repository_date = query(tools, path, RepositoryQuery::Date).await?;
    let head_revision = parse_revision(&query(tools, path, RepositoryQuery::Youngest).await?)?;

    info!(
        repository = %path.display(),
        identity = %identity,
        head_revision,
        "repository inspected"
    );

    Ok(RepositoryState {
        path: path.to_path_buf(),
        identity,
        current_timestamp,
        repository_date,
        head_revision,
    })
}

fn check_layout(path: &Path) -> Result<()> {
    if !path.join("format").is_file() || !path.join("db").is_dir() {
        return Err(BackupError::DataFormat(format!(
            "{} is not a subversion repository",
            path.display()
        )));
    }
    Ok(())
}

async fn verify(tools: &SvnTools, path: &Path) -> Result<()> {
    debug!(repository = %path.display(), "verifying repository");
    let output = Command::new(&tools.svnadmin)
        .arg("verify")
        .arg(path)
        .arg("--quiet")
        .output()
        .await
        .map_err(|e| BackupError::io(format!("failed to run {}", tools.svnadmin.display()), e))?;

    if !output.status.success() {
        let mut diagnostic = diagnostic_text(&output.stderr);
        if diagnostic.is_empty() {
            diagnostic = format!("svnadmin verify exited with {}", output.status);
        }
        return Err(BackupError::DataFormat(format!(
            "repository {} failed verification: {diagnostic}",
            path.display()
        )));
    }
    Ok(())
}

async fn query(tools: &SvnTools, path: &Path, what: RepositoryQuery) -> Result<String> {
    let failed = |diagnostic: String| BackupError::RepositoryQuery {
        query: what,
        diagnostic,
    };

    let output = Command::new(&tools.svnlook)
        .arg(what.as_str())
        .arg(path)
        .output()
        .await
        .map_err(|e| BackupError::io(format!("failed to run {}", tools.svnlook.display()), e))?;

    if !output.status.success() {
        let diagnostic = diagnostic_text(&output.stderr);
        return Err(failed(if diagnostic.is_empty() {
            format!("svnlook {what} exited with {}", output.status)
        } else {
            diagnostic
        }));
    }

    let answer = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if answer.is_empty() {
        return Err(failed(format!("svnlook {what} returned nothing")));
    }
    Ok(answer)
}

/// Identities become file names, so only canonical UUIDs are accepted.
fn parse_identity(raw: &str) -> Result<String> {
    Uuid::parse_str(raw)
        .map(|uuid| uuid.hyphenated().to_string())
        .map_err(|e| BackupError::RepositoryQuery {
            query: RepositoryQuery::Uuid,
            diagnostic: format!("{raw:?} is not a repository uuid: {e}"),
        })
}

fn parse_revision(raw: &str) -> Result<u64> {
    raw.parse::<u64>().map_err(|e| BackupError::RepositoryQuery {
        query: RepositoryQuery::Youngest,
        diagnostic: format!("{raw:?} is not a revision number: {e}"),
    })
}
