//! Package configuration engine.
//!
//! Coordinates mutually-exclusive install, upgrade, and uninstall actions
//! for named software packages on the host. One action per package at a
//! time, enforced by a process-wide lock. An on-disk installing marker
//! brackets every install so an interrupted action is visible after a crash
//! or reboot, and any phase may request a reboot, which suspends the
//! remaining phases until the host comes back.
//!
//! Package layout under the configured package root:
//!
//! ```text
//! <package_root>/<Name>/<Version>/{manifest.json, archive files...}
//! <package_root>/<Name>/installing      marker; contents = version in flight
//! ```

mod deps;
mod lock;
mod manifest;

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use steward_core::config::AgentConfig;
use steward_core::contracts::{DocumentStatus, REBOOT_EXIT_CODE};
use tracing::{debug, info, warn};

pub use deps::{
    ArtifactDownloader, DownloadError, DownloadOutput, ExecError, FileSystem, PluginExecutor,
    ScriptResult,
};
pub use lock::{PackageLockGuard, PackageLockSet};
pub use manifest::{parse_manifest, ManifestFile, PackageManifest};

/// Errors from the package engine. Every failure is translated into plugin
/// output with exit code 1 before it reaches the console.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    /// Alternative package sources are not supported.
    #[error("invalid input: source parameter is not supported")]
    SourceNotSupported,

    /// The package name is empty.
    #[error("invalid input: empty name field")]
    EmptyName,

    /// The package name violates the naming rules.
    #[error("invalid input: invalid name {0}")]
    InvalidName(String),

    /// The version is not `major.minor.patch`.
    #[error("invalid input: invalid version {0}")]
    InvalidVersion(String),

    /// Another action already holds the package.
    #[error("Package \"{name}\" is already in the process of action \"{action}\"")]
    AlreadyLocked {
        /// Package name.
        name: String,
        /// Action currently in progress.
        action: String,
    },

    /// The artifact could not be retrieved.
    #[error("failed to download installation package reliably: {underlying}")]
    DownloadFailed {
        /// Message of the underlying transfer failure.
        underlying: String,
    },

    /// A downloaded file does not match its manifest checksum.
    #[error("checksum mismatch for {file}: expected {expected}, computed {computed}")]
    ChecksumMismatch {
        /// Offending file name.
        file: String,
        /// Checksum the manifest promised.
        expected: String,
        /// Checksum of the downloaded bytes.
        computed: String,
    },

    /// The manifest is unreadable or names a different package.
    #[error("invalid package manifest: {0}")]
    InvalidManifest(String),

    /// The repository could not resolve the latest version.
    #[error("unable to determine latest version of package {name}: {underlying}")]
    VersionResolution {
        /// Package name.
        name: String,
        /// Message of the underlying failure.
        underlying: String,
    },

    /// Uninstall was requested for a package that is not installed.
    #[error("package {0} is not installed")]
    NotInstalled(String),

    /// The requested action is neither Install nor Uninstall.
    #[error("unsupported action {0}")]
    UnsupportedAction(String),

    /// A lifecycle script ran and failed.
    #[error("package script failed with exit code {code}")]
    ScriptFailed {
        /// Exit code of the failing script.
        code: i64,
    },

    /// A lifecycle script could not be started.
    #[error("script execution failed: {0}")]
    Exec(#[from] ExecError),

    /// A filesystem operation failed.
    #[error("filesystem operation failed during {context}: {source}")]
    Io {
        /// Operation that failed.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl PackageError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Input of one package configuration request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ConfigurePackageInput {
    /// Package name.
    pub name: String,
    /// Target version; empty resolves to latest for install and to the
    /// installed version for uninstall.
    pub version: String,
    /// `Install` or `Uninstall`.
    pub action: String,
    /// Alternative source; must be empty.
    pub source: String,
}

/// Plugin output accumulated while a package action runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigurePackageOutput {
    /// Final status of the action.
    pub status: DocumentStatus,
    /// 0 on success, 1 on failure.
    pub exit_code: i64,
    /// Informational lines.
    pub stdout: String,
    /// Error lines.
    pub stderr: String,
}

impl ConfigurePackageOutput {
    /// Marks the action successful, optionally with a pending reboot.
    pub fn mark_as_succeeded(&mut self, reboot: bool) {
        self.exit_code = 0;
        self.status = if reboot {
            DocumentStatus::SuccessAndReboot
        } else {
            DocumentStatus::Success
        };
    }

    /// Marks the action failed and records the error.
    pub fn mark_as_failed(&mut self, err: impl std::fmt::Display) {
        self.exit_code = 1;
        self.status = DocumentStatus::Failed;
        self.append_error(err.to_string());
    }

    /// Appends one informational line.
    pub fn append_info(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        debug!("{message}");
        self.stdout.push_str(message);
        self.stdout.push('\n');
    }

    /// Appends one error line.
    pub fn append_error(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        warn!("{message}");
        self.stderr.push_str(message);
        self.stderr.push('\n');
    }
}

static NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9._-]*$").expect("package name regex should compile")
});

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("version regex should compile"));

/// Validates a configuration request.
///
/// # Errors
///
/// Returns the first violated rule: non-empty source, empty name, malformed
/// name, malformed version.
pub fn validate_input(input: &ConfigurePackageInput) -> Result<(), PackageError> {
    if !input.source.is_empty() {
        return Err(PackageError::SourceNotSupported);
    }
    if input.name.is_empty() {
        return Err(PackageError::EmptyName);
    }
    if !NAME_RE.is_match(&input.name)
        || input.name.ends_with('.')
        || input.name.ends_with('-')
        || input.name.contains("..")
    {
        return Err(PackageError::InvalidName(input.name.clone()));
    }
    if !input.version.is_empty() && !VERSION_RE.is_match(&input.version) {
        return Err(PackageError::InvalidVersion(input.version.clone()));
    }
    Ok(())
}

/// Whether a phase finished or suspended the action pending a reboot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseStatus {
    Completed,
    Reboot,
}

/// Mutually-exclusive per-package install/upgrade/uninstall state machine.
pub struct PackageEngine<F: FileSystem, D: ArtifactDownloader, E: PluginExecutor> {
    config: AgentConfig,
    fs: F,
    downloader: D,
    executor: E,
    locks: PackageLockSet,
    #[cfg(test)]
    resolve_gate: Option<Box<dyn Fn() + Send + Sync>>,
}

impl<F: FileSystem, D: ArtifactDownloader, E: PluginExecutor> PackageEngine<F, D, E> {
    /// Builds an engine over its three collaborator capabilities.
    pub fn new(config: AgentConfig, fs: F, downloader: D, executor: E) -> Self {
        Self {
            config,
            fs,
            downloader,
            executor,
            locks: PackageLockSet::new(),
            #[cfg(test)]
            resolve_gate: None,
        }
    }

    /// Installs a hook that runs at version resolution, letting tests
    /// orchestrate interleavings deterministically.
    #[cfg(test)]
    pub(crate) fn set_resolve_gate(&mut self, gate: impl Fn() + Send + Sync + 'static) {
        self.resolve_gate = Some(Box::new(gate));
    }

    /// Runs one configuration request to completion and reports the plugin
    /// output. Never panics and never leaves the package lock held.
    pub fn execute(&self, input: &ConfigurePackageInput) -> ConfigurePackageOutput {
        let mut output = ConfigurePackageOutput::default();
        if let Err(err) = validate_input(input) {
            output.mark_as_failed(err);
            return output;
        }

        match input.action.as_str() {
            "Install" => self.run_install_action(input, &mut output),
            "Uninstall" => self.run_uninstall_action(input, &mut output),
            other => output.mark_as_failed(PackageError::UnsupportedAction(other.to_string())),
        }
        output
    }

    fn run_install_action(&self, input: &ConfigurePackageInput, output: &mut ConfigurePackageOutput) {
        let name = &input.name;
        let _guard = match self.locks.lock(name, "Install") {
            Ok(guard) => guard,
            Err(err) => {
                output.mark_as_failed(err);
                return;
            },
        };

        let version = match self.resolve_version(name, &input.version) {
            Ok(version) => version,
            Err(err) => {
                output.mark_as_failed(err);
                return;
            },
        };

        if let Some(in_flight) = self.installing_version(name) {
            info!(package = %name, version = %in_flight, "resuming interrupted install");
            output.append_info(format!(
                "Install of {name} {in_flight} was interrupted, resuming"
            ));
        }

        let installed = self.installed_version(name);
        if installed.as_deref() == Some(version.as_str()) {
            output.append_info(format!("{name} {version} is already installed"));
            output.mark_as_succeeded(false);
            return;
        }

        if let Err(err) = self.set_mark(name, &version) {
            output.mark_as_failed(err);
            return;
        }

        // Upgrade retires the old version around the new one: its pre phase
        // runs before the install, its post phase after.
        if let Some(old) = &installed {
            output.append_info(format!("Upgrading {name} from {old} to {version}"));
            match self.run_uninstall_package_pre(name, old, output) {
                Ok(PhaseStatus::Reboot) => {
                    output.mark_as_succeeded(true);
                    return;
                },
                Ok(PhaseStatus::Completed) => {},
                Err(err) => {
                    output.mark_as_failed(err);
                    return;
                },
            }
        }

        match self.run_install_package(name, &version, output) {
            Ok(PhaseStatus::Reboot) => {
                output.mark_as_succeeded(true);
                return;
            },
            Ok(PhaseStatus::Completed) => {},
            Err(err) => {
                output.mark_as_failed(err);
                return;
            },
        }

        if let Some(old) = &installed {
            match self.run_uninstall_package_post(name, old, output) {
                Ok(PhaseStatus::Reboot) => {
                    output.mark_as_succeeded(true);
                    return;
                },
                Ok(PhaseStatus::Completed) => {},
                Err(err) => {
                    output.mark_as_failed(err);
                    return;
                },
            }
        }

        if let Err(err) = self.clear_mark(name) {
            output.mark_as_failed(err);
            return;
        }
        output.append_info(format!("Successfully installed {name} {version}"));
        output.mark_as_succeeded(false);
    }

    fn run_uninstall_action(
        &self,
        input: &ConfigurePackageInput,
        output: &mut ConfigurePackageOutput,
    ) {
        let name = &input.name;
        let _guard = match self.locks.lock(name, "Uninstall") {
            Ok(guard) => guard,
            Err(err) => {
                output.mark_as_failed(err);
                return;
            },
        };

        let version = if input.version.is_empty() {
            match self.installed_version(name) {
                Some(version) => version,
                None => {
                    output.mark_as_failed(PackageError::NotInstalled(name.clone()));
                    return;
                },
            }
        } else {
            input.version.clone()
        };

        match self.run_uninstall_package_pre(name, &version, output) {
            Ok(PhaseStatus::Reboot) => {
                // Post runs after the host comes back.
                output.mark_as_succeeded(true);
                return;
            },
            Ok(PhaseStatus::Completed) => {},
            Err(err) => {
                output.mark_as_failed(err);
                return;
            },
        }

        match self.run_uninstall_package_post(name, &version, output) {
            Ok(PhaseStatus::Reboot) => {
                output.mark_as_succeeded(true);
                return;
            },
            Ok(PhaseStatus::Completed) => {},
            Err(err) => {
                output.mark_as_failed(err);
                return;
            },
        }

        output.append_info(format!("Successfully uninstalled {name} {version}"));
        output.mark_as_succeeded(false);
    }

    fn resolve_version(&self, name: &str, requested: &str) -> Result<String, PackageError> {
        #[cfg(test)]
        if let Some(gate) = &self.resolve_gate {
            gate();
        }

        if !requested.is_empty() {
            return Ok(requested.to_string());
        }
        self.downloader
            .latest_version(
                &self.config.package_repository_url,
                name,
                &self.config.package_platform,
                &self.config.package_architecture,
            )
            .map_err(|err| PackageError::VersionResolution {
                name: name.to_string(),
                underlying: err.to_string(),
            })
    }

    /// Version currently installed, judged from the package directory
    /// layout: the highest version directory that carries a manifest.
    fn installed_version(&self, name: &str) -> Option<String> {
        let package_dir = self.package_dir(name);
        let entries = self.fs.list_dirs(&package_dir).ok()?;
        let mut versions: Vec<String> = entries
            .into_iter()
            .filter(|v| VERSION_RE.is_match(v))
            .filter(|v| self.fs.exists(&package_dir.join(v).join("manifest.json")))
            .collect();
        versions.sort_by(|a, b| compare_versions(a, b));
        versions.pop()
    }

    /// Version named by the installing marker, if one survives.
    pub fn installing_version(&self, name: &str) -> Option<String> {
        let marker = self.marker_path(name);
        if !self.fs.exists(&marker) {
            return None;
        }
        match self.fs.read_file(&marker) {
            Ok(bytes) => {
                let version = String::from_utf8_lossy(&bytes).trim().to_string();
                (!version.is_empty()).then_some(version)
            },
            Err(err) => {
                warn!(package = %name, error = %err, "could not read installing marker");
                None
            },
        }
    }

    fn set_mark(&self, name: &str, version: &str) -> Result<(), PackageError> {
        self.fs
            .make_dirs(&self.package_dir(name))
            .map_err(|e| PackageError::io("create package directory", e))?;
        self.fs
            .write_file(&self.marker_path(name), version.as_bytes())
            .map_err(|e| PackageError::io("write installing marker", e))
    }

    fn clear_mark(&self, name: &str) -> Result<(), PackageError> {
        let marker = self.marker_path(name);
        if !self.fs.exists(&marker) {
            return Ok(());
        }
        self.fs
            .remove_file(&marker)
            .map_err(|e| PackageError::io("remove installing marker", e))
    }

    fn run_install_package(
        &self,
        name: &str,
        version: &str,
        output: &mut ConfigurePackageOutput,
    ) -> Result<PhaseStatus, PackageError> {
        let version_dir = self.version_dir(name, version);
        let manifest = self.ensure_package(name, version, &version_dir, output)?;

        if let Some(command) = &manifest.install {
            debug!(package = %name, version = %version, "running install script");
            let result = self.executor.run_script(&version_dir, command)?;
            return apply_script_result(&result, output);
        }
        Ok(PhaseStatus::Completed)
    }

    fn run_uninstall_package_pre(
        &self,
        name: &str,
        version: &str,
        output: &mut ConfigurePackageOutput,
    ) -> Result<PhaseStatus, PackageError> {
        let version_dir = self.version_dir(name, version);
        let manifest_path = version_dir.join("manifest.json");
        if !self.fs.exists(&manifest_path) {
            // Nothing on disk to run; post still cleans the directory up.
            return Ok(PhaseStatus::Completed);
        }

        let bytes = self
            .fs
            .read_file(&manifest_path)
            .map_err(|e| PackageError::io("read manifest", e))?;
        let manifest = parse_manifest(&bytes)?;

        if let Some(command) = &manifest.uninstall {
            debug!(package = %name, version = %version, "running uninstall script");
            let result = self.executor.run_script(&version_dir, command)?;
            return apply_script_result(&result, output);
        }
        Ok(PhaseStatus::Completed)
    }

    fn run_uninstall_package_post(
        &self,
        name: &str,
        version: &str,
        output: &mut ConfigurePackageOutput,
    ) -> Result<PhaseStatus, PackageError> {
        let version_dir = self.version_dir(name, version);
        if self.fs.exists(&version_dir) {
            self.fs
                .remove_all(&version_dir)
                .map_err(|e| PackageError::io("remove package version directory", e))?;
        }
        output.append_info(format!("Removed {name} {version}"));
        Ok(PhaseStatus::Completed)
    }

    /// Makes the package bytes available locally: manifest first, then every
    /// file it names, checksum-verified, archives extracted in place.
    fn ensure_package(
        &self,
        name: &str,
        version: &str,
        version_dir: &Path,
        output: &mut ConfigurePackageOutput,
    ) -> Result<PackageManifest, PackageError> {
        let manifest_path = version_dir.join("manifest.json");

        let manifest = if self.fs.exists(&manifest_path) {
            let bytes = self
                .fs
                .read_file(&manifest_path)
                .map_err(|e| PackageError::io("read manifest", e))?;
            parse_manifest(&bytes)?
        } else {
            self.fs
                .make_dirs(version_dir)
                .map_err(|e| PackageError::io("create version directory", e))?;
            let local = self.download_package(&self.manifest_url(name, version), version_dir)?;
            let bytes = self
                .fs
                .read_file(&local)
                .map_err(|e| PackageError::io("read downloaded manifest", e))?;
            let manifest = parse_manifest(&bytes)?;
            if local != manifest_path {
                self.fs
                    .write_file(&manifest_path, &bytes)
                    .map_err(|e| PackageError::io("store manifest", e))?;
            }
            manifest
        };
        manifest.ensure_matches(name, version)?;

        for file in &manifest.files {
            let target = version_dir.join(&file.name);
            if self.fs.exists(&target) {
                continue;
            }
            let local = self.download_package(&file.download_url, version_dir)?;
            let bytes = self
                .fs
                .read_file(&local)
                .map_err(|e| PackageError::io("read downloaded file", e))?;
            verify_checksum(&file.name, &file.checksum, &bytes)?;
            if local != target {
                self.fs
                    .write_file(&target, &bytes)
                    .map_err(|e| PackageError::io("store package file", e))?;
            }
            if file.name.ends_with(".zip") {
                self.fs
                    .uncompress(&target, version_dir)
                    .map_err(|e| PackageError::io("extract package archive", e))?;
            }
            output.append_info(format!("Downloaded {}", file.name));
        }

        Ok(manifest)
    }

    /// Downloads one artifact, normalizing every failure mode into the
    /// download-failed error with the underlying cause preserved.
    fn download_package(&self, url: &str, dest_dir: &Path) -> Result<PathBuf, PackageError> {
        match self.downloader.download(url, dest_dir) {
            Ok(out) if !out.local_file_path.as_os_str().is_empty() => Ok(out.local_file_path),
            Ok(_) => Err(PackageError::DownloadFailed {
                underlying: format!("no local file produced for {url}"),
            }),
            Err(err) => Err(PackageError::DownloadFailed {
                underlying: err.to_string(),
            }),
        }
    }

    fn manifest_url(&self, name: &str, version: &str) -> String {
        format!(
            "{}/{name}/{}/{}/{version}/manifest.json",
            self.config.package_repository_url,
            self.config.package_platform,
            self.config.package_architecture,
        )
    }

    fn package_dir(&self, name: &str) -> PathBuf {
        self.config.package_root.join(name)
    }

    fn version_dir(&self, name: &str, version: &str) -> PathBuf {
        self.package_dir(name).join(version)
    }

    fn marker_path(&self, name: &str) -> PathBuf {
        self.package_dir(name).join("installing")
    }
}

/// Folds a script result into the accumulated output and classifies its
/// exit code: zero completes the phase, the reboot code suspends the
/// action, anything else fails it.
fn apply_script_result(
    result: &ScriptResult,
    output: &mut ConfigurePackageOutput,
) -> Result<PhaseStatus, PackageError> {
    if !result.stdout.is_empty() {
        output.append_info(&result.stdout);
    }
    if !result.stderr.is_empty() {
        output.append_error(&result.stderr);
    }
    match result.exit_code {
        0 => Ok(PhaseStatus::Completed),
        REBOOT_EXIT_CODE => Ok(PhaseStatus::Reboot),
        code => Err(PackageError::ScriptFailed { code }),
    }
}

fn verify_checksum(file: &str, expected: &str, bytes: &[u8]) -> Result<(), PackageError> {
    if expected.is_empty() {
        return Ok(());
    }
    let digest = Sha256::digest(bytes);
    let computed: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    if computed.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(PackageError::ChecksumMismatch {
            file: file.to_string(),
            expected: expected.to_string(),
            computed,
        })
    }
}

fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };
    parse(a).cmp(&parse(b))
}
