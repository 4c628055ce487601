//! Collaborator capabilities of the package engine.
//!
//! Three narrow traits injected at construction time: filesystem access,
//! artifact download, and script execution. Production implementations live
//! with the agent binary; tests supply fakes. Nothing here is patched at
//! runtime.

use std::io;
use std::path::{Path, PathBuf};

/// Where a downloaded artifact landed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOutput {
    /// Local path of the downloaded file; empty when nothing was written.
    pub local_file_path: PathBuf,
}

/// Error raised by an [`ArtifactDownloader`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct DownloadError(pub String);

/// Error raised by a [`PluginExecutor`].
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ExecError(pub String);

/// Outcome of one script run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptResult {
    /// Process exit code.
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Filesystem operations the engine needs.
pub trait FileSystem: Send + Sync {
    /// Whether a file or directory exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Reads a whole file.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Writes a whole file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Creates a directory and its ancestors.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn make_dirs(&self, path: &Path) -> io::Result<()>;

    /// Removes a single file.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Removes a directory tree.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn remove_all(&self, path: &Path) -> io::Result<()>;

    /// Names of the immediate subdirectories of `path`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn list_dirs(&self, path: &Path) -> io::Result<Vec<String>>;

    /// Extracts `archive` into `dest`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn uncompress(&self, archive: &Path, dest: &Path) -> io::Result<()>;
}

/// Remote artifact retrieval.
pub trait ArtifactDownloader: Send + Sync {
    /// Downloads `url` into `dest_dir` and reports where the file landed.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the transfer fails.
    fn download(&self, url: &str, dest_dir: &Path) -> Result<DownloadOutput, DownloadError>;

    /// Resolves the latest published version of a package.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the repository cannot answer.
    fn latest_version(
        &self,
        repository_url: &str,
        name: &str,
        platform: &str,
        architecture: &str,
    ) -> Result<String, DownloadError>;
}

/// Install/uninstall script execution.
pub trait PluginExecutor: Send + Sync {
    /// Runs `command` in `working_dir` and reports its exit code and
    /// captured output.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError`] when the process cannot be spawned at all; a
    /// process that ran and failed is a [`ScriptResult`] with a non-zero
    /// exit code.
    fn run_script(&self, working_dir: &Path, command: &str) -> Result<ScriptResult, ExecError>;
}
