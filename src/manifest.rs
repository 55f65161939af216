//! Read-only access to the package manifest (`composer.json`) and the lock file
//! (`composer.lock`).

use std::path::Path;

use anyhow::{Context, Result};
use fn_error_context::context;
use log::debug;
use serde::Deserialize;

use crate::error::VerifyError;

pub const PACKAGE_MANIFEST: &str = "composer.json";
pub const LOCK_FILE: &str = "composer.lock";

/// The declared `<namespace>/<name>` of a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManifest {
    name: String,
    namespace_len: usize,
}

#[derive(Deserialize)]
struct ManifestDocument {
    name: Option<String>,
}

impl PackageManifest {
    /// Parse a full package name.  Both halves must be non-empty.
    pub fn from_name(name: &str) -> Option<Self> {
        let (namespace, rest) = name.split_once('/')?;
        if namespace.is_empty() || rest.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            namespace_len: namespace.len(),
        })
    }

    /// Read `<dir>/composer.json`.
    ///
    /// Returns `None` if the file is missing, not JSON, or has no usable `name`.  Callers map
    /// that to their own failure (a signing error, or a `no_username` outcome).
    pub fn load(dir: &Path) -> Option<Self> {
        let text = std::fs::read_to_string(dir.join(PACKAGE_MANIFEST)).ok()?;
        let document: ManifestDocument = match serde_json::from_str(&text) {
            Ok(document) => document,
            Err(err) => {
                debug!("ignoring unparsable {}: {err}", dir.join(PACKAGE_MANIFEST).display());
                return None;
            }
        };
        Self::from_name(&document.name?)
    }

    /// The namespace, used as the signer identity.
    pub fn identity(&self) -> &str {
        &self.name[..self.namespace_len]
    }

    /// The full `<namespace>/<name>`.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One installed dependency.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LockedPackage {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// The installed dependency set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct LockFile {
    #[serde(default)]
    pub packages: Vec<LockedPackage>,
}

impl LockFile {
    #[context("Loading {LOCK_FILE} from {}", root.display())]
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(LOCK_FILE);
        if !path.is_file() {
            return Err(VerifyError::MissingLockFile(path).into());
        }
        let text = std::fs::read_to_string(&path)?;
        serde_json::from_str(&text).context("Parsing JSON")
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{tempdir, write_files};

    #[test]
    fn test_package_identity() {
        let dir = tempdir();
        write_files(dir.path(), &[(PACKAGE_MANIFEST, r#"{"name": "alice/widgets"}"#)]);
        let manifest = PackageManifest::load(dir.path()).unwrap();
        assert_eq!(manifest.identity(), "alice");
        assert_eq!(manifest.name(), "alice/widgets");
    }

    #[test]
    fn test_nested_name() {
        let manifest = PackageManifest::from_name("alice/widgets/extra").unwrap();
        assert_eq!(manifest.identity(), "alice");
    }

    #[test]
    fn test_unusable_manifests() {
        let dir = tempdir();
        assert_eq!(PackageManifest::load(dir.path()), None);

        for bad in ["not json", "{}", r#"{"name": "nonamespace"}"#, r#"{"name": "/x"}"#] {
            write_files(dir.path(), &[(PACKAGE_MANIFEST, bad)]);
            assert_eq!(PackageManifest::load(dir.path()), None, "{bad}");
        }
    }

    #[test]
    fn test_lock_file() {
        let dir = tempdir();
        write_files(
            dir.path(),
            &[(
                LOCK_FILE,
                r#"{"packages": [
                    {"name": "alice/widgets", "version": "1.0", "dist": {}},
                    {"name": "bob/gadgets", "version": "2.3.1"}
                ]}"#,
            )],
        );
        let lock = LockFile::load(dir.path()).unwrap();
        assert_eq!(
            lock.packages,
            vec![
                LockedPackage {
                    name: "alice/widgets".into(),
                    version: "1.0".into()
                },
                LockedPackage {
                    name: "bob/gadgets".into(),
                    version: "2.3.1".into()
                },
            ]
        );
    }

    #[test]
    fn test_missing_lock_file() {
        let dir = tempdir();
        let err = LockFile::load(dir.path()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<VerifyError>(),
            Some(VerifyError::MissingLockFile(_))
        ));
    }
}
