//! File-list archive codec.
//!
//! Incremental backups store only the files that changed since their parent.
//! The payload is a bincode-encoded entry list, zstd-compressed on disk. The
//! directory-backed snapshot adapter and the migration packager reuse the
//! same codec for whole-tree payloads; full snapshot blobs produced by other
//! adapters stay opaque to the engine.
//!
//! Entries are sorted by path and carry only content and mode, so encoding
//! the same tree twice yields identical bytes. That determinism is what lets
//! a re-capture of an unchanged restored sandbox validate against the
//! original checksum.

use crate::error::{BackupError, Result};
use crate::scan::{ScanOptions, ScannedFile};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const DELTA_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct DeltaArchive {
    pub version: u32,
    pub entries: Vec<DeltaEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeltaEntry {
    /// Path relative to the sandbox root, `/`-separated.
    pub relative_path: String,
    /// Unix mode bits, when the source filesystem had them.
    pub mode: Option<u32>,
    pub contents: Vec<u8>,
}

impl DeltaArchive {
    pub fn new() -> Self {
        Self {
            version: DELTA_FORMAT_VERSION,
            entries: Vec::new(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.contents.len() as u64).sum()
    }
}

impl Default for DeltaArchive {
    fn default() -> Self {
        Self::new()
    }
}

/// Raw (uncompressed) encoding, used where compression is layered separately.
pub fn encode(archive: &DeltaArchive) -> Result<Vec<u8>> {
    Ok(bincode::serialize(archive)?)
}

pub fn decode(data: &[u8]) -> Result<DeltaArchive> {
    let archive: DeltaArchive = bincode::deserialize(data)?;
    if archive.version != DELTA_FORMAT_VERSION {
        return Err(BackupError::Validation(format!(
            "unsupported delta archive version {}",
            archive.version
        )));
    }
    Ok(archive)
}

/// Encode and zstd-compress, the on-disk form for delta payloads.
pub fn pack(archive: &DeltaArchive, level: i32) -> Result<Vec<u8>> {
    let raw = encode(archive)?;
    Ok(zstd::encode_all(&raw[..], level)?)
}

pub fn unpack(data: &[u8]) -> Result<DeltaArchive> {
    let raw = zstd::decode_all(data)?;
    decode(&raw)
}

/// Read a set of scanned files into sorted archive entries.
pub fn read_entries(files: &[ScannedFile]) -> Result<Vec<DeltaEntry>> {
    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let contents = std::fs::read(&file.path)?;
        entries.push(DeltaEntry {
            relative_path: file.relative_path.to_string_lossy().to_string(),
            mode: file.mode,
            contents,
        });
    }
    entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(entries)
}

/// Walk a directory tree into an archive.
pub fn collect_directory(root: &Path, options: &ScanOptions) -> Result<DeltaArchive> {
    let files = crate::scan::scan_directory(root, options)?;
    let mut archive = DeltaArchive::new();
    archive.entries = read_entries(&files)?;
    Ok(archive)
}

/// Write every entry under `root` with overwrite semantics, creating parent
/// directories as needed and restoring Unix modes where recorded. Files
/// absent from the archive are left untouched. Returns the file count.
pub fn apply_to_directory(archive: &DeltaArchive, root: &Path) -> Result<usize> {
    for entry in &archive.entries {
        let relative = Path::new(&entry.relative_path);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(BackupError::Validation(format!(
                "archive entry escapes the sandbox root: {}",
                entry.relative_path
            )));
        }

        let dest = root.join(relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, &entry.contents)?;

        #[cfg(unix)]
        if let Some(mode) = entry.mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dest, std::fs::Permissions::from_mode(mode))?;
        }
    }
    Ok(archive.entries.len())
}
