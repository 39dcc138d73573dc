use chrono::{DateTime, Local, TimeZone};
use std::path::{Path, PathBuf};
use which::which;

use crate::errors::{BackupError, Result};

/// Same shape `svnlook date` prints, so control records read consistently.
pub const SVN_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z (%a, %d %b %Y)";

/// Resolves a tool, preferring an explicitly configured path over `PATH`.
pub fn find_executable(name: &str, configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(BackupError::io(
            format!("configured {name} not found at {}", path.display()),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        ));
    }
    which(name).map_err(|e| {
        BackupError::io(
            format!("{name} executable not found in PATH. Please ensure Subversion tools are installed"),
            std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
        )
    })
}

pub fn svn_date<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format(SVN_DATE_FORMAT).to_string()
}

pub fn svn_date_now() -> String {
    svn_date(&Local::now())
}

/// Lossy, trimmed text of a tool's stderr for error messages.
pub fn diagnostic_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    #[test]
    fn formats_like_svnlook_date() -> anyhow::Result<()> {
        let offset = FixedOffset::east_opt(3600).expect("valid offset");
        let at = offset
            .with_ymd_and_hms(2024, 1, 15, 9, 30, 5)
            .single()
            .expect("valid date");
        assert_eq!(svn_date(&at), "2024-01-15 09:30:05 +0100 (Mon, 15 Jan 2024)");
        Ok(())
    }

    #[test]
    fn configured_tool_must_exist() {
        let err = find_executable("svnadmin", Some(Path::new("/nonexistent/svnadmin")))
            .expect_err("missing tool");
        assert_eq!(err.exit_code(), crate::errors::EX_IOERR);
    }

    #[test]
    fn diagnostic_text_is_trimmed() {
        assert_eq!(diagnostic_text(b"  svnadmin: E160004\n"), "svnadmin: E160004");
    }
}
