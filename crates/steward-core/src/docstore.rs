//! Durable filesystem state machine for command documents.
//!
//! Every command lives as one JSON file named by its document id, in exactly
//! one of four folders under the instance's state directory:
//!
//! ```text
//! <data_root>/state/<instance_id>/document/
//!   pending/<document_id>      accepted, not yet executing
//!   current/<document_id>      executing (or suspended across a reboot)
//!   completed/<document_id>    terminal
//!   corrupt/<document_id>      terminal, unparseable
//! ```
//!
//! Writes follow the temp-file + fsync + rename protocol so a crash at any
//! point leaves either the old complete file or the new complete file, never
//! a partial one. Folder transitions are single renames. Recovery is a read
//! of the canonical folder set; no ad-hoc locks.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::contracts::DocumentState;

/// Size cap for a document state file read back from disk.
///
/// Generous for JSON command state while still refusing to load a corrupted
/// or runaway file into memory.
pub const MAX_STATE_FILE_SIZE: u64 = 8 * 1024 * 1024;

/// Folders a document state file can rest in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Folder {
    /// Accepted, waiting for dispatch.
    Pending,
    /// Executing, or suspended until after a reboot.
    Current,
    /// Terminal: finished.
    Completed,
    /// Terminal: unparseable state quarantined during recovery.
    Corrupt,
}

impl Folder {
    /// Directory name of the folder.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Current => "current",
            Self::Completed => "completed",
            Self::Corrupt => "corrupt",
        }
    }
}

/// Errors from document store operations.
#[derive(Debug, thiserror::Error)]
pub enum DocumentStoreError {
    /// State file exceeds [`MAX_STATE_FILE_SIZE`].
    #[error("state file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge {
        /// Actual size in bytes.
        size: u64,
        /// Allowed maximum in bytes.
        max: u64,
    },

    /// JSON serialization failed.
    #[error("state serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),

    /// JSON deserialization failed.
    #[error("state deserialization failed: {0}")]
    Deserialize(#[source] serde_json::Error),

    /// An I/O error occurred during the operation.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl DocumentStoreError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Crash-tolerant store of [`DocumentState`] files.
///
/// Cheap to clone; holds only the data root path.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    data_root: PathBuf,
}

impl DocumentStore {
    /// Creates a store rooted at `data_root`.
    #[must_use]
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        Self {
            data_root: data_root.into(),
        }
    }

    /// Directory holding `folder` for `instance_id`.
    #[must_use]
    pub fn folder_path(&self, instance_id: &str, folder: Folder) -> PathBuf {
        self.data_root
            .join("state")
            .join(instance_id)
            .join("document")
            .join(folder.dir_name())
    }

    fn document_path(&self, document_id: &str, instance_id: &str, folder: Folder) -> PathBuf {
        self.folder_path(instance_id, folder).join(document_id)
    }

    /// Persists `state` into `folder`, atomically replacing any previous
    /// file for the same document id.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError`] when serialization or any filesystem
    /// step fails; a failed persist never leaves a partial file behind.
    pub fn persist(&self, state: &DocumentState, folder: Folder) -> Result<(), DocumentStoreError> {
        let path = self.document_path(
            &state.document_info.document_id,
            &state.document_info.instance_id,
            folder,
        );
        let json = serde_json::to_string_pretty(state).map_err(DocumentStoreError::Serialize)?;
        atomic_write(&path, json.as_bytes())?;
        debug!(
            document_id = %state.document_info.document_id,
            folder = folder.dir_name(),
            "persisted document state"
        );
        Ok(())
    }

    /// Reads a document state back from `folder`.
    ///
    /// Absent or unparseable files yield the empty default state rather than
    /// an error; readers must tolerate transient absence during folder
    /// moves, and recovery quarantines corrupt files separately.
    #[must_use]
    pub fn get(&self, document_id: &str, instance_id: &str, folder: Folder) -> DocumentState {
        let path = self.document_path(document_id, instance_id, folder);
        match read_state(&path) {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    document_id,
                    folder = folder.dir_name(),
                    error = %err,
                    "could not read document state, returning empty state"
                );
                DocumentState::default()
            },
        }
    }

    /// Moves a document state file between folders with a single rename.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError`] when the rename fails; the source file
    /// is left in place.
    pub fn move_document(
        &self,
        document_id: &str,
        instance_id: &str,
        from: Folder,
        to: Folder,
    ) -> Result<(), DocumentStoreError> {
        let src = self.document_path(document_id, instance_id, from);
        let dst = self.document_path(document_id, instance_id, to);
        ensure_dir(dst.parent().unwrap_or(Path::new(".")))?;
        fs::rename(&src, &dst).map_err(|e| {
            DocumentStoreError::io(
                format!("move {document_id} {} -> {}", from.dir_name(), to.dir_name()),
                e,
            )
        })?;
        debug!(
            document_id,
            from = from.dir_name(),
            to = to.dir_name(),
            "moved document state"
        );
        Ok(())
    }

    /// Removes a document state file from `folder`.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentStoreError`] when the unlink fails.
    pub fn remove(
        &self,
        document_id: &str,
        instance_id: &str,
        folder: Folder,
    ) -> Result<(), DocumentStoreError> {
        let path = self.document_path(document_id, instance_id, folder);
        fs::remove_file(&path)
            .map_err(|e| DocumentStoreError::io(format!("remove {document_id}"), e))
    }

    /// Lists the document ids resting in `folder`, for crash recovery.
    ///
    /// A missing folder is an empty folder.
    #[must_use]
    pub fn enumerate(&self, instance_id: &str, folder: Folder) -> Vec<String> {
        let dir = self.folder_path(instance_id, folder);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut ids: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        ids.sort();
        ids
    }

    /// Quarantines an unparseable state file into the corrupt folder.
    ///
    /// Best effort: a quarantine failure is logged and swallowed so that
    /// recovery can keep walking the folder.
    pub fn quarantine(&self, document_id: &str, instance_id: &str, from: Folder) {
        if let Err(err) = self.move_document(document_id, instance_id, from, Folder::Corrupt) {
            warn!(document_id, error = %err, "failed to quarantine corrupt document state");
        }
    }
}

fn read_state(path: &Path) -> Result<DocumentState, DocumentStoreError> {
    let file = File::open(path).map_err(|e| DocumentStoreError::io("open state file", e))?;
    let size = file
        .metadata()
        .map_err(|e| DocumentStoreError::io("stat state file", e))?
        .len();
    if size > MAX_STATE_FILE_SIZE {
        return Err(DocumentStoreError::FileTooLarge {
            size,
            max: MAX_STATE_FILE_SIZE,
        });
    }

    let mut buf = Vec::new();
    file.take(MAX_STATE_FILE_SIZE)
        .read_to_end(&mut buf)
        .map_err(|e| DocumentStoreError::io("read state file", e))?;
    serde_json::from_slice(&buf).map_err(DocumentStoreError::Deserialize)
}

/// Writes `data` to `path` with the temp-file + fsync + rename protocol.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), DocumentStoreError> {
    let parent = path.parent().ok_or_else(|| {
        DocumentStoreError::io(
            "resolve parent directory",
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent"),
        )
    })?;
    ensure_dir(parent)?;

    // Temp file in the same directory keeps the rename on one filesystem.
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| DocumentStoreError::io("create temp file", e))?;
    tmp.write_all(data)
        .map_err(|e| DocumentStoreError::io("write temp file", e))?;
    tmp.flush()
        .map_err(|e| DocumentStoreError::io("flush temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| DocumentStoreError::io("fsync temp file", e))?;
    tmp.persist(path)
        .map_err(|e| DocumentStoreError::io("rename temp file", e.error))?;

    // Commit the rename itself.
    let dir = File::open(parent).map_err(|e| DocumentStoreError::io("open parent for fsync", e))?;
    dir.sync_all()
        .map_err(|e| DocumentStoreError::io("fsync parent directory", e))?;
    Ok(())
}

fn ensure_dir(dir: &Path) -> Result<(), DocumentStoreError> {
    fs::create_dir_all(dir).map_err(|e| DocumentStoreError::io("create state directory", e))
}
