//! Structural validation of installer packages.

use std::path::Path;

use peer_upgrade_core::PackageInfo;

use crate::error::{Error, Result};

/// Decides whether the bytes at `path` form a usable installer and what it is.
///
/// `declared` is the metadata the sender advertised, or the record kept next
/// to an installer already in storage. Implementations that can parse the
/// package format return what they read from the package itself.
pub trait InstallerValidator: Send + Sync {
    fn validate(&self, path: &Path, declared: Option<&PackageInfo>) -> Result<PackageInfo>;
}

/// Trusts declared metadata once it is complete and its size matches what is
/// on disk. For installers that are not APKs, or senders already trusted.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclaredMetadataValidator;

impl InstallerValidator for DeclaredMetadataValidator {
    fn validate(&self, path: &Path, declared: Option<&PackageInfo>) -> Result<PackageInfo> {
        let declared = declared
            .ok_or_else(|| Error::InvalidInstaller("no package metadata".to_string()))?;
        let len = std::fs::metadata(path)?.len();
        if len == 0 {
            return Err(Error::InvalidInstaller("empty package".to_string()));
        }
        if len != declared.size {
            return Err(Error::InvalidInstaller(format!(
                "package is {} bytes, declared {}",
                len, declared.size
            )));
        }
        if declared.platform.is_empty() || declared.arch.is_empty() {
            return Err(Error::InvalidInstaller(
                "missing platform or architecture".to_string(),
            ));
        }
        Ok(declared.clone())
    }
}
