//! Per-repository pid lock files.
//!
//! A lock lives at `<backup_root>/<identity>.pid` and holds the owner's pid on
//! a single line. Locks left behind by dead processes are cleared on the next
//! acquire; live owners make acquisition fail with a retryable error.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::errors::{BackupError, Result};

pub const LOCK_EXTENSION: &str = "pid";

/// Answers questions about other processes on this host.
pub trait ProcessProbe {
    fn is_alive(&self, pid: i32) -> bool;
    fn command_line(&self, pid: i32) -> Option<String>;
}

/// Probes the running system with `kill(pid, 0)` and `/proc`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        // Signal 0 only checks existence and permission.
        if unsafe { libc::kill(pid, 0) } == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn command_line(&self, pid: i32) -> Option<String> {
        let raw = fs::read(Path::new("/proc").join(pid.to_string()).join("cmdline")).ok()?;
        let args: Vec<String> = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        if args.is_empty() {
            None
        } else {
            Some(args.join(" "))
        }
    }
}

#[derive(Debug)]
pub struct LockManager<P = SystemProbe> {
    root: PathBuf,
    pid: i32,
    probe: P,
}

impl LockManager<SystemProbe> {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_probe(root, std::process::id() as i32, SystemProbe)
    }
}

impl<P: ProcessProbe> LockManager<P> {
    pub fn with_probe(root: impl Into<PathBuf>, pid: i32, probe: P) -> Self {
        Self {
            root: root.into(),
            pid,
            probe,
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn lock_path(&self, identity: &str) -> PathBuf {
        self.root.join(format!("{identity}.{LOCK_EXTENSION}"))
    }

    /// Takes the lock for `identity`, clearing it first if its owner is dead.
    pub fn acquire(&self, identity: &str) -> Result<LockGuard<'_, P>> {
        fs::create_dir_all(&self.root).map_err(|e| {
            BackupError::io(
                format!("failed to create backup directory {}", self.root.display()),
                e,
            )
        })?;

        let path = self.lock_path(identity);
        match read_owner(&path) {
            Ok(Some(owner)) => self.clear_stale(&path, owner)?,
            Ok(None) => {}
            Err(e) => {
                return Err(BackupError::io(
                    format!("failed to read lock {}", path.display()),
                    e,
                ));
            }
        }

        self.write_lock(&path)?;
        info!(lock = %path.display(), pid = self.pid, "lock acquired");
        Ok(LockGuard {
            manager: self,
            identity: identity.to_string(),
            released: false,
        })
    }

    /// Removes the lock for `identity` if, and only if, this process owns it.
    pub fn release(&self, identity: &str) -> Result<()> {
        let path = self.lock_path(identity);
        let owner = read_owner(&path)
            .map_err(|e| BackupError::io(format!("failed to read lock {}", path.display()), e))?;

        match owner {
            Some(LockOwner::Pid(pid)) if pid == self.pid => {}
            other => {
                let owner = match other {
                    Some(LockOwner::Pid(pid)) => pid.to_string(),
                    Some(LockOwner::Unreadable(raw)) => format!("{raw:?}"),
                    None => "nobody".to_string(),
                };
                return Err(BackupError::LockOwnershipMismatch {
                    path,
                    owner,
                    pid: self.pid,
                });
            }
        }

        fs::remove_file(&path).map_err(|e| {
            BackupError::Internal(format!("failed to remove lock {}: {e}", path.display()))
        })?;
        info!(lock = %path.display(), pid = self.pid, "lock released");
        Ok(())
    }

    /// Deletes a lock whose owner is gone, but only while the file still
    /// names that owner. A lock written by a competitor between the re-read
    /// and the removal is still deleted, leaving a narrow window where two
    /// runs can both believe they hold it.
    fn clear_stale(&self, path: &Path, owner: LockOwner) -> Result<()> {
        match &owner {
            LockOwner::Pid(pid) if self.probe.is_alive(*pid) => {
                let command = self
                    .probe
                    .command_line(*pid)
                    .unwrap_or_else(|| "unknown command".to_string());
                return Err(BackupError::LockHeld {
                    path: path.to_path_buf(),
                    pid: *pid,
                    command,
                });
            }
            LockOwner::Pid(pid) => {
                warn!(lock = %path.display(), pid, "removing stale lock of dead process");
            }
            LockOwner::Unreadable(raw) => {
                warn!(lock = %path.display(), content = %raw, "removing unreadable lock");
            }
        }

        match read_owner(path) {
            Ok(Some(current)) if current == owner => {}
            Ok(None) => return Ok(()),
            _ => return Err(self.lost_race(path)),
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BackupError::Internal(format!(
                "failed to remove stale lock {}: {e}",
                path.display()
            ))),
        }
    }

    fn write_lock(&self, path: &Path) -> Result<()> {
        let created = OpenOptions::new().write(true).create_new(true).open(path);
        let mut file = match created {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(self.lost_race(path));
            }
            Err(e) => {
                return Err(BackupError::io(
                    format!("failed to create lock {}", path.display()),
                    e,
                ));
            }
        };
        writeln!(file, "{}", self.pid)
            .and_then(|_| file.sync_all())
            .map_err(|e| BackupError::io(format!("failed to write lock {}", path.display()), e))?;
        drop(file);

        // Re-read: a concurrent writer that slipped in wins.
        match read_owner(path) {
            Ok(Some(LockOwner::Pid(pid))) if pid == self.pid => Ok(()),
            _ => Err(self.lost_race(path)),
        }
    }

    fn lost_race(&self, path: &Path) -> BackupError {
        let pid = match read_owner(path) {
            Ok(Some(LockOwner::Pid(pid))) => pid,
            _ => 0,
        };
        debug!(lock = %path.display(), pid, "lost lock race");
        BackupError::LockLost {
            path: path.to_path_buf(),
            pid,
        }
    }
}

/// Held lock. Dropping it without [`LockGuard::release`] still releases it,
/// logging any failure since there is nobody left to report it to.
#[derive(Debug)]
pub struct LockGuard<'a, P: ProcessProbe = SystemProbe> {
    manager: &'a LockManager<P>,
    identity: String,
    released: bool,
}

impl<P: ProcessProbe> LockGuard<'_, P> {
    pub fn path(&self) -> PathBuf {
        self.manager.lock_path(&self.identity)
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.identity)
    }
}

impl<P: ProcessProbe> Drop for LockGuard<'_, P> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.manager.release(&self.identity) {
            warn!(identity = %self.identity, error = %err, "failed to release lock on drop");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LockOwner {
    Pid(i32),
    Unreadable(String),
}

fn read_owner(path: &Path) -> std::io::Result<Option<LockOwner>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let line = content.lines().next().unwrap_or("").trim();
    Ok(Some(match line.parse::<i32>() {
        Ok(pid) => LockOwner::Pid(pid),
        Err(_) => LockOwner::Unreadable(line.to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::tempdir;

    const IDENTITY: &str = "5b3c6a6e-2f43-4b1c-9b0e-6d2a4c1f8e01";
    const ME: i32 = 4242;

    #[derive(Debug, Default)]
    struct FakeProbe {
        alive: HashSet<i32>,
    }

    impl FakeProbe {
        fn alive(pids: &[i32]) -> Self {
            Self {
                alive: pids.iter().copied().collect(),
            }
        }
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: i32) -> bool {
            self.alive.contains(&pid)
        }

        fn command_line(&self, pid: i32) -> Option<String> {
            self.alive
                .contains(&pid)
                .then(|| format!("svnbackup diff /srv/svn/repo-{pid}"))
        }
    }

    fn lock_content(manager: &LockManager<FakeProbe>) -> String {
        fs::read_to_string(manager.lock_path(IDENTITY)).expect("lock file")
    }

    #[test]
    fn acquire_creates_nested_root_and_writes_pid() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let root = dir.path().join("a").join("b");
        let manager = LockManager::with_probe(&root, ME, FakeProbe::default());

        let guard = manager.acquire(IDENTITY)?;
        assert_eq!(guard.path(), root.join(format!("{IDENTITY}.pid")));
        assert_eq!(lock_content(&manager), format!("{ME}\n"));

        guard.release()?;
        assert!(!manager.lock_path(IDENTITY).exists());
        Ok(())
    }

    #[test]
    fn live_owner_blocks_acquire_without_touching_lock() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manager = LockManager::with_probe(dir.path(), ME, FakeProbe::alive(&[777]));
        fs::write(manager.lock_path(IDENTITY), "777\n")?;

        let err = manager.acquire(IDENTITY).expect_err("lock is held");
        match &err {
            BackupError::LockHeld { pid, command, .. } => {
                assert_eq!(*pid, 777);
                assert!(command.contains("svnbackup diff"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
        assert_eq!(lock_content(&manager), "777\n");
        Ok(())
    }

    #[test]
    fn dead_owner_lock_is_replaced() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manager = LockManager::with_probe(dir.path(), ME, FakeProbe::default());
        fs::write(manager.lock_path(IDENTITY), "31337\n")?;

        let guard = manager.acquire(IDENTITY)?;
        assert_eq!(lock_content(&manager), format!("{ME}\n"));
        guard.release()?;
        Ok(())
    }

    #[test]
    fn garbage_lock_is_treated_as_stale() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manager = LockManager::with_probe(dir.path(), ME, FakeProbe::default());
        fs::write(manager.lock_path(IDENTITY), "not a pid")?;

        let guard = manager.acquire(IDENTITY)?;
        assert_eq!(lock_content(&manager), format!("{ME}\n"));
        drop(guard);
        assert!(!manager.lock_path(IDENTITY).exists());
        Ok(())
    }

    #[test]
    fn release_refuses_foreign_lock() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manager = LockManager::with_probe(dir.path(), ME, FakeProbe::default());
        fs::write(manager.lock_path(IDENTITY), "555\n")?;

        let err = manager.release(IDENTITY).expect_err("not ours");
        assert!(matches!(
            err,
            BackupError::LockOwnershipMismatch { pid: ME, .. }
        ));
        assert!(err.is_retryable());
        assert_eq!(lock_content(&manager), "555\n");
        Ok(())
    }

    #[test]
    fn release_without_lock_is_mismatch() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manager = LockManager::with_probe(dir.path(), ME, FakeProbe::default());
        let err = manager.release(IDENTITY).expect_err("no lock");
        assert!(matches!(err, BackupError::LockOwnershipMismatch { .. }));
        Ok(())
    }

    #[test]
    fn lock_taken_over_mid_run_is_left_alone() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manager = LockManager::with_probe(dir.path(), ME, FakeProbe::default());
        let guard = manager.acquire(IDENTITY)?;

        fs::write(manager.lock_path(IDENTITY), "9999\n")?;
        let err = guard.release().expect_err("taken over");
        assert!(matches!(err, BackupError::LockOwnershipMismatch { .. }));
        assert_eq!(lock_content(&manager), "9999\n");
        Ok(())
    }

    #[test]
    fn locks_are_per_identity() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manager = LockManager::with_probe(dir.path(), ME, FakeProbe::default());
        let first = manager.acquire(IDENTITY)?;
        let second = manager.acquire("0f0e0d0c-0b0a-4909-8807-060504030201")?;
        first.release()?;
        second.release()?;
        Ok(())
    }

    /// Reports every pid as dead, and replaces the lock with a competitor's
    /// pid the moment it is asked, as a concurrent run clearing the same
    /// stale lock would.
    #[derive(Debug)]
    struct OvertakingProbe {
        lock: PathBuf,
        competitor: i32,
    }

    impl ProcessProbe for OvertakingProbe {
        fn is_alive(&self, _pid: i32) -> bool {
            fs::write(&self.lock, format!("{}\n", self.competitor)).expect("overtake lock");
            false
        }

        fn command_line(&self, _pid: i32) -> Option<String> {
            None
        }
    }

    #[test]
    fn stale_lock_replaced_by_competitor_is_not_deleted() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let lock = dir.path().join(format!("{IDENTITY}.pid"));
        fs::write(&lock, "31337\n")?;
        let probe = OvertakingProbe {
            lock: lock.clone(),
            competitor: 8080,
        };
        let manager = LockManager::with_probe(dir.path(), ME, probe);

        let err = manager.acquire(IDENTITY).expect_err("competitor won");
        assert!(matches!(err, BackupError::LockLost { pid: 8080, .. }));
        assert_eq!(err.exit_code(), crate::errors::EX_TEMPFAIL);
        assert_eq!(fs::read_to_string(&lock)?, "8080\n");
        Ok(())
    }

    #[test]
    fn lock_created_first_by_competitor_is_lost() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let manager = LockManager::with_probe(dir.path(), ME, FakeProbe::default());
        let path = manager.lock_path(IDENTITY);
        fs::write(&path, "8080\n")?;

        let err = manager.write_lock(&path).expect_err("create_new refuses");
        assert!(matches!(err, BackupError::LockLost { pid: 8080, .. }));
        assert!(err.is_retryable());
        assert_eq!(lock_content(&manager), "8080\n");
        Ok(())
    }

    #[test]
    fn system_probe_sees_current_process() {
        let probe = SystemProbe;
        assert!(probe.is_alive(std::process::id() as i32));
        assert!(!probe.is_alive(0));
        assert!(!probe.is_alive(-5));
    }
}
