//! On-disk store of extracted game-server build versions.
//!
//! Each child directory of the build root is one version, holding the
//! extracted contents of an uploaded archive. Deletion is the only dangerous
//! operation: versions referenced by a live child are never purged. Uploads
//! may freely overwrite an existing version.

use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// File name fragment that disqualifies a candidate executable.
const CRASH_HANDLER_MARKER: &str = "UnityCrashHandler";

/// Permissions applied to a discovered server executable (owner rwx,
/// group/other rx).
const EXECUTABLE_MODE: u32 = 0o755;

/// Errors from build-store operations.
#[derive(Debug, thiserror::Error)]
pub enum BuildStoreError {
    /// Archive could not be opened or extracted.
    #[error("failed to extract archive: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Filesystem failure under the build root.
    #[error("build store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking extraction task was cancelled or panicked.
    #[error("extraction task failed: {0}")]
    TaskFailed(String),
}

/// Directory of extracted build versions.
#[derive(Debug, Clone)]
pub struct BuildStore {
    root: PathBuf,
}

impl BuildStore {
    /// Creates a store rooted at `root`. The directory is created lazily by
    /// the operations that need it.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The build root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Extracts the zip archive at `archive` into `<root>/<version>/`,
    /// overwriting files already present. Returns the canonical executable
    /// discovered post-extract, after marking it executable.
    ///
    /// A failed extraction may leave a partial version tree behind; that is
    /// safe because version names are unique and `purge` can reclaim it.
    ///
    /// # Errors
    ///
    /// Returns an error when the archive is unreadable or the version tree
    /// cannot be written.
    pub async fn ingest(
        &self,
        version: &str,
        archive: &Path,
    ) -> Result<Option<PathBuf>, BuildStoreError> {
        let dest = self.root.join(version);
        let archive = archive.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || -> Result<PathBuf, BuildStoreError> {
            fs::create_dir_all(&dest)?;
            let file = fs::File::open(&archive)?;
            let mut zip = zip::ZipArchive::new(file)?;
            zip.extract(&dest)?;
            Ok(dest)
        })
        .await
        .map_err(|e| BuildStoreError::TaskFailed(e.to_string()))??;

        let executable = find_executable_in(&extracted);
        match &executable {
            Some(path) => {
                fs::set_permissions(path, fs::Permissions::from_mode(EXECUTABLE_MODE))?;
                info!(version, executable = %path.display(), "build ingested");
            },
            None => {
                warn!(version, "build ingested but no server executable found");
            },
        }
        Ok(executable)
    }

    /// Locates the canonical executable of `version`: the first regular file
    /// in a depth-first walk (OS listing order) whose name does not contain
    /// `UnityCrashHandler` and ends with `.exe` or `.x86_64`.
    #[must_use]
    pub fn find_executable(&self, version: &str) -> Option<PathBuf> {
        find_executable_in(&self.root.join(version))
    }

    /// Lists the version directory names currently in the store.
    ///
    /// # Errors
    ///
    /// Returns an error when the build root cannot be read.
    pub fn list(&self) -> std::io::Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                versions.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(versions)
    }

    /// Removes every version directory whose name is not in `in_use` and
    /// returns the removed names. Callers must snapshot `in_use` from the
    /// live children before calling, so a version running at snapshot time
    /// is never deleted.
    ///
    /// # Errors
    ///
    /// Returns an error when the build root cannot be read. A failure to
    /// remove one version does not abort the sweep.
    pub fn purge(&self, in_use: &HashSet<String>) -> std::io::Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut removed = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if in_use.contains(&name) {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    info!(version = %name, "purged build");
                    removed.push(name);
                },
                Err(e) => warn!(version = %name, "failed to purge build: {e}"),
            }
        }
        Ok(removed)
    }
}

/// Returns `true` when `name` looks like the game-server binary.
fn is_server_executable(name: &str) -> bool {
    !name.contains(CRASH_HANDLER_MARKER) && (name.ends_with(".exe") || name.ends_with(".x86_64"))
}

/// Depth-first pre-order walk for the first matching regular file.
fn find_executable_in(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_file() {
            if is_server_executable(&entry.file_name().to_string_lossy()) {
                return Some(entry.path());
            }
        } else if file_type.is_dir() {
            if let Some(found) = find_executable_in(&entry.path()) {
                return Some(found);
            }
        }
    }
    None
}
