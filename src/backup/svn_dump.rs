// svnbackup/src/backup/svn_dump.rs
use std::fmt;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;

use tokio::process::Command;
use tokio_util::io::SyncIoBridge;
use tracing::{info, warn};

use super::archive;
use crate::control::{ControlRecord, RecordedDump};
use crate::errors::{BackupError, Result};
use crate::repository::{RepositoryState, SvnTools};
use crate::utils::diagnostic_text;

pub const FULL_DIR: &str = "full";
pub const DIFF_DIR: &str = "diff";

/// Inclusive span of revisions covered by a dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevisionRange {
    pub start: u64,
    pub end: u64,
}

impl RevisionRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for RevisionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

impl FromStr for RevisionRange {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || BackupError::DataFormat(format!("invalid revision range {s:?}"));
        let (start, end) = s.trim().split_once(':').ok_or_else(bad)?;
        let start = start.parse::<u64>().map_err(|_| bad())?;
        let end = end.parse::<u64>().map_err(|_| bad())?;
        if start > end {
            return Err(bad());
        }
        Ok(Self { start, end })
    }
}

/// What to dump: the whole history, or what follows a previous record.
#[derive(Debug, Clone, Copy)]
pub enum DumpRequest<'a> {
    Full,
    Differential(&'a ControlRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Full,
    Differential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpPlan {
    pub kind: DumpKind,
    pub range: RevisionRange,
    pub artifact: PathBuf,
}

impl DumpPlan {
    /// Uncompressed sibling name; its presence also blocks a new dump.
    pub fn uncompressed(&self) -> PathBuf {
        self.artifact.with_extension("")
    }

    /// Collects the export tool's stderr while the dump runs.
    pub fn sentinel(&self) -> PathBuf {
        self.artifact.with_extension("err")
    }
}

/// Works out the revision range and artifact path for a dump, refusing to
/// reuse an artifact name that already exists.
pub fn plan_dump(
    request: DumpRequest<'_>,
    state: &RepositoryState,
    backup_root: &Path,
) -> Result<DumpPlan> {
    let head = state.head_revision;
    let (kind, range, artifact) = match request {
        DumpRequest::Full => (
            DumpKind::Full,
            RevisionRange::new(0, head),
            backup_root
                .join(FULL_DIR)
                .join(format!("{}.{head}.dump.gz", state.identity)),
        ),
        DumpRequest::Differential(control) => {
            if control.identity != state.identity {
                return Err(BackupError::Internal(format!(
                    "control record belongs to repository {}, not {}",
                    control.identity, state.identity
                )));
            }
            let start = control.next_revision()?;
            if start > head {
                return Err(BackupError::AlreadySaved {
                    saved: control.last_saved_revision.unwrap_or(head),
                    head,
                });
            }
            (
                DumpKind::Differential,
                RevisionRange::new(start, head),
                backup_root
                    .join(DIFF_DIR)
                    .join(format!("{}.{start}-{head}.dump.gz", state.identity)),
            )
        }
    };

    let plan = DumpPlan {
        kind,
        range,
        artifact,
    };
    for candidate in [plan.uncompressed(), plan.artifact.clone()] {
        if candidate.exists() {
            return Err(BackupError::ArtifactExists(candidate));
        }
    }
    Ok(plan)
}

/// Runs `svnadmin dump` for the planned range, compressing its output into
/// the artifact and then integrity-testing the result.
pub async fn produce_dump(
    tools: &SvnTools,
    repository: &Path,
    plan: &DumpPlan,
) -> Result<RecordedDump> {
    if let Some(dir) = plan.artifact.parent() {
        fs::create_dir_all(dir).map_err(|e| {
            BackupError::io(format!("Failed to create dump directory {}", dir.display()), e)
        })?;
    }

    let sentinel_path = plan.sentinel();
    let sentinel = File::create(&sentinel_path).map_err(|e| {
        BackupError::io(format!("Failed to create {}", sentinel_path.display()), e)
    })?;

    let mut command = Command::new(&tools.svnadmin);
    command
        .arg("dump")
        .arg(repository)
        .arg("--quiet")
        .arg("-r")
        .arg(plan.range.to_string());
    if plan.kind == DumpKind::Differential {
        command.arg("--incremental").arg("--deltas");
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::from(sentinel))
        .kill_on_drop(true);

    info!(
        artifact = %plan.artifact.display(),
        range = %plan.range,
        "dumping revisions"
    );
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            remove_sentinel(&sentinel_path);
            return Err(BackupError::io(
                format!("Failed to execute {}", tools.svnadmin.display()),
                e,
            ));
        }
    };
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BackupError::Internal("svnadmin dump stdout was not captured".into()))?;

    let reader = SyncIoBridge::new(stdout);
    let artifact = plan.artifact.clone();
    let compressed = tokio::task::spawn_blocking(move || archive::compress_stream(reader, &artifact))
        .await
        .unwrap_or_else(|e| Err(BackupError::Internal(format!("compression task failed: {e}"))));

    let status = child
        .wait()
        .await
        .map_err(|e| BackupError::io("Failed to wait for svnadmin dump", e));
    let diagnostic = take_sentinel(&sentinel_path);

    // Someone else's artifact appeared after planning; leave it be.
    if let Err(BackupError::ArtifactExists(existing)) = &compressed {
        return Err(BackupError::ArtifactExists(existing.clone()));
    }

    match dump_outcome(compressed, status, diagnostic) {
        Ok(bytes) => info!(artifact = %plan.artifact.display(), bytes, "dump written"),
        Err(err) => {
            discard_partial(&plan.artifact);
            return Err(err);
        }
    }

    let path = plan.artifact.clone();
    tokio::task::spawn_blocking(move || archive::verify_gzip(&path))
        .await
        .map_err(|e| BackupError::Internal(format!("integrity test task failed: {e}")))??;

    Ok(RecordedDump {
        artifact: plan.artifact.clone(),
        range: plan.range,
    })
}

/// Decides whether a finished export produced a usable artifact.
///
/// Anything the tool wrote to stderr fails the dump, as does a failed
/// compression, a failed wait or a non-zero exit.
fn dump_outcome(
    compressed: Result<u64>,
    status: Result<ExitStatus>,
    diagnostic: Result<String>,
) -> Result<u64> {
    let diagnostic = diagnostic?;
    if !diagnostic.is_empty() {
        return Err(BackupError::ToolFailed {
            tool: "svnadmin dump".to_string(),
            diagnostic,
        });
    }
    let bytes = compressed?;
    let status = status?;
    if !status.success() {
        return Err(BackupError::ToolFailed {
            tool: "svnadmin dump".to_string(),
            diagnostic: format!("exited with {status}"),
        });
    }
    Ok(bytes)
}

/// Reads and removes the stderr sentinel, returning what the tool reported.
fn take_sentinel(path: &Path) -> Result<String> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            remove_sentinel(path);
            return Err(BackupError::io(format!("Failed to read {}", path.display()), e));
        }
    };
    remove_sentinel(path);
    Ok(diagnostic_text(&bytes))
}

fn remove_sentinel(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != ErrorKind::NotFound {
            warn!(sentinel = %path.display(), error = %e, "failed to remove dump sentinel");
        }
    }
}

fn discard_partial(artifact: &Path) {
    match fs::remove_file(artifact) {
        Ok(()) => warn!(artifact = %artifact.display(), "removed partial dump"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(artifact = %artifact.display(), error = %e, "failed to remove partial dump"),
    }
}
