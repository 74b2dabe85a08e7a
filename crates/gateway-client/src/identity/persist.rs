//! Owner-only JSON persistence for identity state files.
//!
//! Writes go to a uniquely named temp file in the same directory and are then
//! renamed over the target, so readers never see a half-written record.
//! Read-modify-write sequences hold an exclusive advisory lock on a sibling
//! `<file>.lock`; plain reads take a shared lock on the same file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Returns the lock file path guarding `path`.
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Creates `dir` (and parents) restricted to the owner on Unix.
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)
    }

    #[cfg(not(unix))]
    {
        fs::create_dir_all(dir)
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path(path))
}

/// Runs `operation` while holding an exclusive lock for `path`.
///
/// The lock is released when the lock file handle drops. Code running inside
/// must use [`read_json_unlocked`], since a shared lock taken on a second
/// handle in the same process would wait on this one.
pub fn with_exclusive_lock<T>(path: &Path, operation: impl FnOnce() -> T) -> io::Result<T> {
    let lock_file = open_lock_file(path)?;
    FileExt::lock_exclusive(&lock_file)?;
    let result = operation();
    drop(lock_file);
    Ok(result)
}

/// Reads and parses a JSON file without locking.
///
/// Returns `None` if the file is missing, unreadable, or not valid JSON for `T`.
pub fn read_json_unlocked<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read state file");
            return None;
        }
    };

    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unparseable state file");
            None
        }
    }
}

/// Reads and parses a JSON file under a shared lock.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }
    match open_lock_file(path) {
        Ok(lock_file) => {
            if let Err(e) = FileExt::lock_shared(&lock_file) {
                tracing::debug!(path = %path.display(), error = %e, "reading state file without lock");
            }
            let value = read_json_unlocked(path);
            drop(lock_file);
            value
        }
        Err(_) => read_json_unlocked(path),
    }
}

/// Writes `value` as pretty JSON, atomically, readable only by the owner.
pub fn write_json_private<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "state path has no parent"))?;
    ensure_private_dir(parent)?;

    let mut contents = serde_json::to_string_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    contents.push('\n');

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state.json");
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let write_result = (|| {
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&temp_path)?;
        file.write_all(contents.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if write_result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    write_result?;

    // Tighten permissions on files that predate this writer.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}
