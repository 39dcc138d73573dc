use std::path::PathBuf;

use tracing::{debug, info, warn};

use super::BackupMode;
use super::svn_dump::{self, DumpRequest};
use crate::config::BackupConfig;
use crate::control::{ControlRecord, ControlStore, RecordedDump};
use crate::errors::{BackupError, Result};
use crate::lock::{LockManager, ProcessProbe};
use crate::repository::{self, RepositoryState, SvnTools};

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub identity: String,
    pub head_revision: u64,
    pub dump: Option<RecordedDump>,
    pub control_file: PathBuf,
}

/// Runs one backup of `config.repository` in `config.mode`.
///
/// The lock is taken only after inspection succeeds and is always released
/// once taken. When both the locked work and the release fail, the work's
/// error is returned and the release failure is only logged.
pub async fn perform_backup<P: ProcessProbe>(
    config: &BackupConfig,
    tools: &SvnTools,
    locks: &LockManager<P>,
) -> Result<BackupReport> {
    let state = repository::inspect(tools, &config.repository).await?;
    let guard = locks.acquire(&state.identity)?;
    debug!(lock = %guard.path().display(), pid = locks.pid(), mode = config.mode.as_str(), "running locked");

    let outcome = run_locked(config, tools, &state).await;
    let released = guard.release();

    match (outcome, released) {
        (Ok(report), Ok(())) => Ok(report),
        (Ok(_), Err(release_err)) => Err(release_err),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            warn!(error = %release_err, "lock release failed after backup error");
            Err(err)
        }
    }
}

async fn run_locked(
    config: &BackupConfig,
    tools: &SvnTools,
    state: &RepositoryState,
) -> Result<BackupReport> {
    let store = ControlStore::new(&config.backup_root);

    let dump = match config.mode {
        BackupMode::Full => {
            ensure_not_behind(&store, state)?;
            let plan = svn_dump::plan_dump(DumpRequest::Full, state, &config.backup_root)?;
            Some(svn_dump::produce_dump(tools, &state.path, &plan).await?)
        }
        BackupMode::Diff => {
            let control = store.read(&state.identity)?;
            let plan =
                svn_dump::plan_dump(DumpRequest::Differential(&control), state, &config.backup_root)?;
            Some(svn_dump::produce_dump(tools, &state.path, &plan).await?)
        }
        BackupMode::BuildControlOnly => {
            ensure_not_behind(&store, state)?;
            None
        }
    };

    let record = ControlRecord {
        identity: state.identity.clone(),
        last_saved_revision: Some(state.head_revision),
        repository_path: state.path.display().to_string(),
        creation_timestamp: state.current_timestamp.clone(),
        snapshot_timestamp: state.repository_date.clone(),
        last_dump: dump.clone(),
    };
    store.write(&record)?;

    info!(
        identity = %state.identity,
        mode = config.mode.as_str(),
        last_saved_revision = state.head_revision,
        "backup recorded"
    );
    Ok(BackupReport {
        identity: state.identity.clone(),
        head_revision: state.head_revision,
        dump,
        control_file: store.control_path(&state.identity),
    })
}

/// A new record must never lower the saved revision of the lineage.
fn ensure_not_behind(store: &ControlStore, state: &RepositoryState) -> Result<()> {
    let previous = match store.read(&state.identity) {
        Ok(previous) => previous,
        Err(err) => {
            debug!(error = %err, "no usable previous control record");
            return Ok(());
        }
    };
    match previous.last_saved_revision {
        Some(saved) if previous.identity == state.identity && saved > state.head_revision => {
            Err(BackupError::Internal(format!(
                "repository head {} is behind saved revision {saved}",
                state.head_revision
            )))
        }
        _ => Ok(()),
    }
}
