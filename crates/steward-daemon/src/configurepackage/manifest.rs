//! Package manifest parsing.
//!
//! A package is a manifest plus the archive files it names. The manifest
//! carries the lifecycle commands and a checksum for every file so that
//! downloads can be verified before anything runs.

use serde::{Deserialize, Serialize};

use super::PackageError;

/// One file of a package, with its integrity checksum and origin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ManifestFile {
    /// File name relative to the package version directory.
    pub name: String,
    /// Lowercase hex SHA-256 of the file contents; empty skips verification.
    pub checksum: String,
    /// Where to fetch the file from.
    #[serde(rename = "DownloadURL")]
    pub download_url: String,
}

/// Parsed `manifest.json` of one package version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct PackageManifest {
    /// Package name.
    pub name: String,
    /// Package version, `major.minor.patch`.
    pub version: String,
    /// Platform this build targets.
    pub platform: String,
    /// Architecture this build targets.
    pub architecture: String,
    /// Files making up the package.
    pub files: Vec<ManifestFile>,
    /// Install command, run in the version directory.
    pub install: Option<String>,
    /// Uninstall command, run in the version directory.
    pub uninstall: Option<String>,
    /// Validation command, run after install.
    pub validate: Option<String>,
}

impl PackageManifest {
    /// Checks that the manifest belongs to the expected package version.
    ///
    /// Manifests may omit the identity fields; only a present-but-different
    /// value is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`PackageError::InvalidManifest`] on a mismatch.
    pub fn ensure_matches(&self, name: &str, version: &str) -> Result<(), PackageError> {
        if !self.name.is_empty() && self.name != name {
            return Err(PackageError::InvalidManifest(format!(
                "manifest is for package {}, expected {name}",
                self.name
            )));
        }
        if !self.version.is_empty() && self.version != version {
            return Err(PackageError::InvalidManifest(format!(
                "manifest is for version {}, expected {version}",
                self.version
            )));
        }
        Ok(())
    }
}

/// Parses manifest bytes.
///
/// # Errors
///
/// Returns [`PackageError::InvalidManifest`] when the bytes are not a valid
/// manifest document.
pub fn parse_manifest(bytes: &[u8]) -> Result<PackageManifest, PackageError> {
    serde_json::from_slice(bytes).map_err(|err| PackageError::InvalidManifest(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_manifest() {
        let json = r#"{
            "Name": "PVDriver",
            "Version": "1.0.0",
            "Platform": "windows",
            "Architecture": "amd64",
            "Files": [
                {
                    "Name": "PVDriver.zip",
                    "Checksum": "ab12",
                    "DownloadURL": "https://repo.example/PVDriver/1.0.0/PVDriver.zip"
                }
            ],
            "Install": "./install.ps1",
            "Uninstall": "./uninstall.ps1"
        }"#;

        let manifest = parse_manifest(json.as_bytes()).unwrap();
        assert_eq!(manifest.name, "PVDriver");
        assert_eq!(manifest.version, "1.0.0");
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].download_url.as_str().split('/').next_back(), Some("PVDriver.zip"));
        assert_eq!(manifest.install.as_deref(), Some("./install.ps1"));
        assert!(manifest.validate.is_none());
    }

    #[test]
    fn garbage_is_an_invalid_manifest() {
        let err = parse_manifest(b"not a manifest").unwrap_err();
        assert!(err.to_string().contains("invalid package manifest"));
    }

    #[test]
    fn identity_mismatch_is_rejected() {
        let manifest = PackageManifest {
            name: "PVDriver".to_string(),
            version: "1.0.0".to_string(),
            ..PackageManifest::default()
        };

        assert!(manifest.ensure_matches("PVDriver", "1.0.0").is_ok());
        assert!(manifest.ensure_matches("Other", "1.0.0").is_err());
        assert!(manifest.ensure_matches("PVDriver", "2.0.0").is_err());
    }

    #[test]
    fn identity_fields_may_be_omitted() {
        let manifest = PackageManifest::default();
        assert!(manifest.ensure_matches("Anything", "9.9.9").is_ok());
    }
}
