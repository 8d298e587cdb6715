use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

const STORE_LAYOUT_VERSION: u32 = 1;
const STORE_VERSION_PREFIX: &str = "v";
const STORE_TOMBSTONE_PREFIX: &str = "tombstone-";
const STORE_FILE_EXTENSION: &str = "cache";

pub fn store_version_dir(root: &Path) -> PathBuf {
    root.join(format!("{STORE_VERSION_PREFIX}{STORE_LAYOUT_VERSION}"))
}

fn parse_store_version(name: &str) -> Option<u32> {
    let version = name.strip_prefix(STORE_VERSION_PREFIX)?;
    if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    version.parse().ok()
}

fn tombstone_name(name: &str) -> String {
    format!("{STORE_TOMBSTONE_PREFIX}{name}-{}", uuid::Uuid::new_v4())
}

/// Prepares the on-disk location of a block store and returns the path of
/// its backing file.
///
/// Cached bodies never survive a restart: a backing file left by a previous
/// run is removed, and directories from older layout versions are retired.
/// Failing to create the directory or to remove the stale file is fatal.
pub fn prepare_store_file(root: &Path, name: &str) -> Result<PathBuf> {
    fs::create_dir_all(root)
        .with_context(|| format!("failed to create cache root {}", root.display()))?;
    let active_dir = store_version_dir(root);
    fs::create_dir_all(&active_dir)
        .with_context(|| format!("failed to create cache dir {}", active_dir.display()))?;

    retire_old_versions(root)?;

    let path = active_dir.join(format!("{name}.{STORE_FILE_EXTENSION}"));
    match fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "removed stale cache store file"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to remove stale cache store file {}", path.display())
            });
        }
    }
    Ok(path)
}

fn retire_old_versions(root: &Path) -> Result<()> {
    let active_name = format!("{STORE_VERSION_PREFIX}{STORE_LAYOUT_VERSION}");
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    let mut cleanup = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name == active_name {
            continue;
        }
        if name.starts_with(STORE_TOMBSTONE_PREFIX) {
            cleanup.push(entry.path());
            continue;
        }
        if parse_store_version(&name).is_some() {
            let tombstone = root.join(tombstone_name(&name));
            if let Err(err) = fs::rename(entry.path(), &tombstone) {
                warn!(
                    error = %err,
                    path = %entry.path().display(),
                    "failed to tombstone old cache dir"
                );
                continue;
            }
            cleanup.push(tombstone);
        }
    }

    for dir in cleanup {
        match fs::remove_dir_all(&dir) {
            Ok(()) => debug!(path = %dir.display(), "removed old cache dir"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                error = %err,
                path = %dir.display(),
                "failed to remove old cache dir"
            ),
        }
    }
    Ok(())
}
