// svnbackup/src/backup/archive.rs
use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read};
use std::path::Path;
use tracing::debug;

use crate::errors::{BackupError, Result};

/// Streams `reader` through gzip into a new file at `dest`.
///
/// `dest` must not exist yet; an existing file is reported as
/// [`BackupError::ArtifactExists`] and left untouched.
///
/// # Returns
/// Number of uncompressed bytes read from `reader`.
pub fn compress_stream<R: Read>(mut reader: R, dest: &Path) -> Result<u64> {
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .map_err(|e| {
            if e.kind() == ErrorKind::AlreadyExists {
                BackupError::ArtifactExists(dest.to_path_buf())
            } else {
                BackupError::io(format!("Failed to create archive file: {}", dest.display()), e)
            }
        })?;

    let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let copied = io::copy(&mut reader, &mut encoder).map_err(|e| {
        BackupError::io(format!("Failed to compress stream into {}", dest.display()), e)
    })?;

    let writer = encoder.finish().map_err(|e| {
        BackupError::io(format!("Failed to finish Gzip encoding for archive: {}", dest.display()), e)
    })?;
    let file = writer.into_inner().map_err(|e| {
        BackupError::io(format!("Failed to flush archive: {}", dest.display()), e.into_error())
    })?;
    file.sync_all()
        .map_err(|e| BackupError::io(format!("Failed to sync archive: {}", dest.display()), e))?;

    debug!(archive = %dest.display(), bytes = copied, "stream compressed");
    Ok(copied)
}

/// Decodes the whole archive to check it is a complete, valid gzip stream.
///
/// # Returns
/// Number of uncompressed bytes in the archive.
pub fn verify_gzip(path: &Path) -> Result<u64> {
    let file = File::open(path)
        .map_err(|e| BackupError::io(format!("Failed to open archive file: {}", path.display()), e))?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(file));
    let bytes = io::copy(&mut decoder, &mut io::sink()).map_err(|e| {
        BackupError::io(format!("Integrity test failed for archive {}", path.display()), e)
    })?;
    debug!(archive = %path.display(), bytes, "archive verified");
    Ok(bytes)
}
