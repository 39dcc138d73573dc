//! Per-repository control files recording backup progress.
//!
//! `<backup_root>/<identity>.cf` is a log with the newest record on top:
//!
//! ```text
//! [<identity>:<revision>]
//! repodir='<path>'
//! sysdate='<timestamp>'
//! repodate='<timestamp>'
//! svndumpfile='<artifact>'
//! revision=<start>:<end>
//! ```
//!
//! The last two lines only appear when the run produced a dump. Writes
//! prepend a new record and replace the file with an atomic rename.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::backup::RevisionRange;
use crate::errors::{BackupError, Result};

pub const CONTROL_EXTENSION: &str = "cf";

/// The newest header is expected near the top; past this the file is corrupt.
pub const HEADER_SCAN_LINES: usize = 15;

static HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[([^:\]\s]+):(\d*)\]$").expect("valid header regex"));
static FIELD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([a-z]+)=(.*)$").expect("valid field regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDump {
    pub artifact: PathBuf,
    pub range: RevisionRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub identity: String,
    /// Highest revision already captured; `None` means no dump exists yet.
    pub last_saved_revision: Option<u64>,
    pub repository_path: String,
    pub creation_timestamp: String,
    pub snapshot_timestamp: String,
    pub last_dump: Option<RecordedDump>,
}

impl ControlRecord {
    /// First revision a differential dump continuing this record must start at.
    pub fn next_revision(&self) -> Result<u64> {
        match self.last_saved_revision {
            None => Ok(0),
            Some(rev) => rev.checked_add(1).ok_or_else(|| {
                BackupError::DataFormat(format!(
                    "saved revision {rev} of repository {} has no successor",
                    self.identity
                ))
            }),
        }
    }

    pub fn render(&self) -> String {
        let revision = self
            .last_saved_revision
            .map(|rev| rev.to_string())
            .unwrap_or_default();
        let mut block = format!("[{}:{}]\n", self.identity, revision);
        block.push_str(&format!("repodir={}\n", quote(&self.repository_path)));
        block.push_str(&format!("sysdate={}\n", quote(&self.creation_timestamp)));
        block.push_str(&format!("repodate={}\n", quote(&self.snapshot_timestamp)));
        if let Some(dump) = &self.last_dump {
            block.push_str(&format!(
                "svndumpfile={}\n",
                quote(&dump.artifact.display().to_string())
            ));
            block.push_str(&format!("revision={}\n", dump.range));
        }
        block
    }
}

/// Parses the newest record of a control file.
pub fn parse_control(content: &str) -> Result<ControlRecord> {
    let mut lines = content.lines().enumerate();

    let (identity, last_saved_revision) = loop {
        let Some((index, line)) = lines.next() else {
            return Err(BackupError::DataFormat(
                "control file has no record header".to_string(),
            ));
        };
        if index >= HEADER_SCAN_LINES {
            return Err(BackupError::DataFormat(format!(
                "no record header in the first {HEADER_SCAN_LINES} lines of control file"
            )));
        }
        if let Some(caps) = HEADER_RE.captures(line.trim_end()) {
            let revision = match &caps[2] {
                "" => None,
                digits => Some(digits.parse::<u64>().map_err(|e| {
                    BackupError::DataFormat(format!("bad revision in header {line:?}: {e}"))
                })?),
            };
            break (caps[1].to_string(), revision);
        }
    };

    let mut record = ControlRecord {
        identity,
        last_saved_revision,
        repository_path: String::new(),
        creation_timestamp: String::new(),
        snapshot_timestamp: String::new(),
        last_dump: None,
    };
    let mut artifact = None;
    let mut range = None;

    for (_, line) in lines {
        let line = line.trim_end();
        if line.is_empty() || HEADER_RE.is_match(line) {
            break;
        }
        let Some(caps) = FIELD_RE.captures(line) else {
            continue;
        };
        let value = &caps[2];
        match &caps[1] {
            "repodir" => record.repository_path = unquote(value),
            "sysdate" => record.creation_timestamp = unquote(value),
            "repodate" => record.snapshot_timestamp = unquote(value),
            "svndumpfile" => artifact = Some(PathBuf::from(unquote(value))),
            "revision" => range = Some(value.parse::<RevisionRange>()?),
            _ => {}
        }
    }

    if let (Some(artifact), Some(range)) = (artifact, range) {
        record.last_dump = Some(RecordedDump { artifact, range });
    }
    Ok(record)
}

#[derive(Debug, Clone)]
pub struct ControlStore {
    root: PathBuf,
}

impl ControlStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn control_path(&self, identity: &str) -> PathBuf {
        self.root.join(format!("{identity}.{CONTROL_EXTENSION}"))
    }

    pub fn read(&self, identity: &str) -> Result<ControlRecord> {
        let path = self.control_path(identity);
        let content = fs::read_to_string(&path).map_err(|e| {
            BackupError::DataFormat(format!("cannot read control file {}: {e}", path.display()))
        })?;
        let record = parse_control(&content).map_err(|e| match e {
            BackupError::DataFormat(msg) => {
                BackupError::DataFormat(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?;
        debug!(
            control = %path.display(),
            identity = %record.identity,
            last_saved_revision = ?record.last_saved_revision,
            "control record read"
        );
        Ok(record)
    }

    /// Prepends `record` to the control file of its identity.
    pub fn write(&self, record: &ControlRecord) -> Result<()> {
        self.stage(record)?.commit()
    }

    /// Writes the new file content next to the target without replacing it.
    pub fn stage(&self, record: &ControlRecord) -> Result<StagedWrite> {
        let target = self.control_path(&record.identity);
        let existing = match fs::read_to_string(&target) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(BackupError::io(
                    format!("failed to read control file {}", target.display()),
                    e,
                ));
            }
        };

        let mut temp = NamedTempFile::new_in(&self.root).map_err(|e| {
            BackupError::io(
                format!("failed to create temp file in {}", self.root.display()),
                e,
            )
        })?;
        let content = record.render() + &existing;
        if let Err(e) = temp
            .write_all(content.as_bytes())
            .and_then(|_| temp.as_file().sync_all())
        {
            return Err(BackupError::io(
                format!("failed to write {}", temp.path().display()),
                e,
            ));
        }

        Ok(StagedWrite { temp, target })
    }
}

/// New control file content waiting to be renamed over the target. Dropping
/// it uncommitted removes the temp file and leaves the target untouched.
#[derive(Debug)]
pub struct StagedWrite {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedWrite {
    pub fn commit(self) -> Result<()> {
        let target = self.target;
        self.temp.persist(&target).map_err(|e| {
            BackupError::io(
                format!("failed to replace control file {}", target.display()),
                e.error,
            )
        })?;
        info!(control = %target.display(), "control record written");
        Ok(())
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn unquote(value: &str) -> String {
    value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .map(|v| v.replace(r"'\''", "'"))
        .unwrap_or_else(|| value.to_string())
}
