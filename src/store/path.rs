use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::{Error, Result};

/// File name for a backup of `store_path` taken at `version`:
/// `<stem>-v<version>-<YYYYMMDD-HHMM>[.<ext>]`.
pub fn backup_file_name(store_path: &Path, version: u32, at: DateTime<Local>) -> Result<String> {
    let stem = store_path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "store path {} has no usable file name",
                store_path.display()
            ))
        })?;

    let mut name = format!("{stem}-v{version}-{}", at.format("%Y%m%d-%H%M"));
    if let Some(ext) = store_path.extension().and_then(|e| e.to_str()) {
        name.push('.');
        name.push_str(ext);
    }
    Ok(name)
}

/// A backup path inside `dir` that does not exist yet.
///
/// Two backups of the same version within one minute get a `-2`, `-3`, ...
/// suffix rather than overwriting each other.
pub fn unused_backup_path(
    dir: &Path,
    store_path: &Path,
    version: u32,
    at: DateTime<Local>,
) -> Result<PathBuf> {
    let name = backup_file_name(store_path, version, at)?;
    let first = dir.join(&name);
    if !first.exists() {
        return Ok(first);
    }

    let (base, ext) = match name.rsplit_once('.') {
        Some((base, ext)) if store_path.extension().is_some() => (base, Some(ext)),
        _ => (name.as_str(), None),
    };
    (2..u32::MAX)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{base}-{n}.{ext}")),
            None => dir.join(format!("{base}-{n}")),
        })
        .find(|candidate| !candidate.exists())
        .ok_or_else(|| Error::Config(format!("no free backup name in {}", dir.display())))
}
