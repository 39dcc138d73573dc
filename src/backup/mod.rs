mod logic;
pub(crate) mod archive;
pub(crate) mod svn_dump;

pub use logic::{BackupReport, perform_backup};
pub use svn_dump::RevisionRange;

use crate::config::BackupConfig;
use crate::errors::Result;
use crate::lock::LockManager;
use crate::repository::SvnTools;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Full,
    Diff,
    BuildControlOnly,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Full => "full",
            BackupMode::Diff => "diff",
            BackupMode::BuildControlOnly => "build-control-only",
        }
    }
}

/// Public entry point for the backup process.
/// Resolves the Subversion tools and runs one backup under the repository lock.
pub async fn run_backup_flow(config: &BackupConfig) -> Result<BackupReport> {
    let tools = SvnTools::locate(config)?;
    let locks = LockManager::new(&config.backup_root);
    perform_backup(config, &tools, &locks).await
}
