//! Live sandbox filesystem scanning and change detection.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for walking a sandbox root.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Follow symbolic links while walking.
    pub follow_links: bool,
    /// Directory/file names skipped entirely (exact name match).
    pub exclude_names: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            exclude_names: Vec::new(),
        }
    }
}

/// One regular file discovered during a scan.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub relative_path: PathBuf,
    pub size: u64,
    /// mtime, seconds since the epoch.
    pub mtime: i64,
    /// Unix mode bits when available.
    pub mode: Option<u32>,
}

impl ScannedFile {
    /// Build from a walk entry. Directories are handled by the caller;
    /// broken symlinks and symlinked directories are skipped.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            // Broken symlink
            Err(_) if entry.path_is_symlink() => return Ok(None),
            Err(e) => return Err(e),
        };
        if metadata.is_dir() {
            // Symlink to a directory
            return Ok(None);
        }

        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();

        let mtime = metadata
            .modified()?
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };
        #[cfg(not(unix))]
        let mode = None;

        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
            mtime,
            mode,
        }))
    }
}

/// Walk a sandbox root and collect all regular files.
pub fn scan_directory(root: &Path, options: &ScanOptions) -> std::io::Result<Vec<ScannedFile>> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .into_iter()
        .filter_entry(|e| !is_excluded(e, root, &options.exclude_names));

    for entry in walker {
        let entry = entry.map_err(io_error)?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Some(file) = ScannedFile::from_entry(&entry, root)? {
            files.push(file);
        }
    }

    Ok(files)
}

/// Files whose mtime is strictly newer than `cutoff`.
///
/// This is the modification-time heuristic: clock skew or a
/// touch-without-modify can produce false negatives or positives, and a file
/// rewritten within the cutoff second is missed. Content is deliberately not
/// hashed.
pub fn changed_since(
    root: &Path,
    options: &ScanOptions,
    cutoff: DateTime<Utc>,
) -> std::io::Result<Vec<ScannedFile>> {
    let cutoff_secs = cutoff.timestamp();
    let files = scan_directory(root, options)?;
    Ok(files.into_iter().filter(|f| f.mtime > cutoff_secs).collect())
}

fn is_excluded(entry: &DirEntry, root: &Path, exclude_names: &[String]) -> bool {
    if entry.path() == root {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    exclude_names.iter().any(|pattern| name == *pattern)
}

fn io_error(e: walkdir::Error) -> std::io::Error {
    e.into_io_error()
        .unwrap_or_else(|| std::io::Error::other("directory walk failed"))
}
