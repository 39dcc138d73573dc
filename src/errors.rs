use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub const EX_OK: u8 = 0;
pub const EX_USAGE: u8 = 64;
pub const EX_DATAERR: u8 = 65;
pub const EX_SOFTWARE: u8 = 70;
pub const EX_CANTCREAT: u8 = 73;
pub const EX_IOERR: u8 = 74;
pub const EX_TEMPFAIL: u8 = 75;

/// The individual questions asked of a repository during inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryQuery {
    Uuid,
    Date,
    Youngest,
}

impl RepositoryQuery {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryQuery::Uuid => "uuid",
            RepositoryQuery::Date => "date",
            RepositoryQuery::Youngest => "youngest",
        }
    }
}

impl fmt::Display for RepositoryQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("usage error: {0}")]
    Usage(String),

    #[error("invalid data: {0}")]
    DataFormat(String),

    #[error("cannot get repository {query}: {diagnostic}")]
    RepositoryQuery {
        query: RepositoryQuery,
        diagnostic: String,
    },

    #[error("lock {} is held by running process {pid} ({command})", .path.display())]
    LockHeld {
        path: PathBuf,
        pid: i32,
        command: String,
    },

    #[error("lock {} was taken by process {pid} while acquiring it", .path.display())]
    LockLost { path: PathBuf, pid: i32 },

    #[error("lock {} is owned by process {owner}, not by {pid}", .path.display())]
    LockOwnershipMismatch { path: PathBuf, owner: String, pid: i32 },

    #[error("dump artifact already exists: {}", .0.display())]
    ArtifactExists(PathBuf),

    #[error("nothing to do: revision {saved} already saved, repository head is {head}")]
    AlreadySaved { saved: u64, head: u64 },

    #[error("{tool} failed: {diagnostic}")]
    ToolFailed { tool: String, diagnostic: String },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("internal error: {0}")]
    Internal(String),
}

impl BackupError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        BackupError::Io {
            context: context.into(),
            source,
        }
    }

    /// sysexits-style process exit status for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Usage(_) => EX_USAGE,
            BackupError::DataFormat(_) | BackupError::RepositoryQuery { .. } => EX_DATAERR,
            BackupError::LockHeld { .. }
            | BackupError::LockLost { .. }
            | BackupError::LockOwnershipMismatch { .. } => EX_TEMPFAIL,
            BackupError::ArtifactExists(_) | BackupError::AlreadySaved { .. } => EX_CANTCREAT,
            BackupError::ToolFailed { .. } | BackupError::Io { .. } => EX_IOERR,
            BackupError::Internal(_) => EX_SOFTWARE,
        }
    }

    /// Another run holds or contested the lock; trying again later may succeed.
    pub fn is_retryable(&self) -> bool {
        self.exit_code() == EX_TEMPFAIL
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_sysexits() {
        assert_eq!(BackupError::Usage("x".into()).exit_code(), 64);
        assert_eq!(BackupError::DataFormat("x".into()).exit_code(), 65);
        assert_eq!(
            BackupError::RepositoryQuery {
                query: RepositoryQuery::Youngest,
                diagnostic: "x".into()
            }
            .exit_code(),
            65
        );
        assert_eq!(BackupError::Internal("x".into()).exit_code(), 70);
        assert_eq!(BackupError::ArtifactExists(PathBuf::from("a")).exit_code(), 73);
        assert_eq!(BackupError::AlreadySaved { saved: 3, head: 3 }.exit_code(), 73);
        assert_eq!(
            BackupError::io("write", std::io::Error::other("boom")).exit_code(),
            74
        );
        assert_eq!(
            BackupError::LockOwnershipMismatch {
                path: PathBuf::from("a.pid"),
                owner: "1".into(),
                pid: 2
            }
            .exit_code(),
            75
        );
    }

    #[test]
    fn only_lock_contention_is_retryable() {
        let held = BackupError::LockHeld {
            path: PathBuf::from("a.pid"),
            pid: 10,
            command: "svnbackup diff".into(),
        };
        assert!(held.is_retryable());
        assert!(!BackupError::Internal("x".into()).is_retryable());
        assert!(!BackupError::AlreadySaved { saved: 1, head: 1 }.is_retryable());
    }

    #[test]
    fn query_failures_name_the_query() {
        let err = BackupError::RepositoryQuery {
            query: RepositoryQuery::Uuid,
            diagnostic: "svnlook: E000002".into(),
        };
        assert_eq!(err.to_string(), "cannot get repository uuid: svnlook: E000002");
    }
}
