//! Whole-file copies taken before the schema is touched.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use rusqlite::Connection;

use super::path::unused_backup_path;
use super::port::SchemaPort;
use crate::error::{Error, Result};

/// Copies the store at `store_path` into `dir`, naming the copy after
/// `version` and `at`.
///
/// The write-ahead log is folded into the main file first, and the copy is
/// flushed to disk before this returns, so the copy is complete on its own.
/// When another connection holds part of the log back, nothing is copied.
pub fn create(
    conn: &Connection,
    store_path: &Path,
    dir: &Path,
    version: u32,
    at: DateTime<Local>,
) -> Result<PathBuf> {
    let target = unused_backup_path(dir, store_path, version, at)?;

    let checkpoint = conn.checkpoint()?;
    if !checkpoint.is_complete() {
        return Err(Error::Backup {
            path: target,
            source: io::Error::other(format!(
                "another connection is still reading the write-ahead log \
                 ({} of {} frames moved into the store)",
                checkpoint.checkpointed, checkpoint.log_frames
            )),
        });
    }

    copy_synced(store_path, &target).map_err(|source| Error::Backup {
        path: target.clone(),
        source,
    })?;

    tracing::info!(
        "Backed up schema version {} store to {}",
        version,
        target.display()
    );
    Ok(target)
}

fn copy_synced(from: &Path, to: &Path) -> io::Result<()> {
    fs::copy(from, to)?;
    File::open(to)?.sync_all()
}
