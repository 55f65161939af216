//! The per-package signature manifest (`signatures.json`).
//!
//! The manifest records the signer's base certificate, the root chain of every release, and the
//! leaf inventory of the *latest* release only.  Earlier releases keep their roots and
//! signatures, so the chain back to the first release can always be checked, but their per-file
//! digests are overwritten by each new release.
//!
//! ```json
//! {
//!     "readme": "...",
//!     "crt": "-----BEGIN CERTIFICATE-----...",
//!     "latest": "1.1",
//!     "releases": {
//!         "1.0": { "timestamp": 1700000000, "merkle_root": "...", "prev_merkle_root": "", "signature": "..." },
//!         "1.1": { "timestamp": 1700000100, "merkle_root": "...", "prev_merkle_root": "...", "signature": "..." }
//!     },
//!     "inventory": { "a.txt": "...", "b.txt": "..." }
//! }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fn_error_context::context;
use indexmap::IndexMap;
use log::{debug, info};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{error::SignError, merkle::FileInventory, util::write_atomic};

/// File name of the signature manifest in a package root.
pub const MANIFEST_FILE: &str = "signatures.json";

const README: &str = "This file contains the digital signatures of every release of this package. \
It is generated automatically and must not be modified by hand.";

/// One signed release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Version string; the key of the release in the manifest.
    #[serde(skip)]
    pub version: String,
    /// Unix time at which the release was signed.
    pub timestamp: i64,
    pub merkle_root: String,
    /// Root of the previous release, or empty for the first release.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub prev_merkle_root: String,
    /// Hex-encoded RSA/SHA-384 signature over `merkle_root`.
    pub signature: String,
}

impl Release {
    pub fn prev_root(&self) -> Option<&str> {
        (!self.prev_merkle_root.is_empty()).then_some(self.prev_merkle_root.as_str())
    }
}

#[derive(Deserialize)]
struct Document {
    #[serde(default, deserialize_with = "null_as_empty")]
    crt: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    latest: String,
    #[serde(default, deserialize_with = "map_or_empty_list")]
    releases: IndexMap<String, Release>,
    #[serde(default, deserialize_with = "map_or_empty_list")]
    inventory: FileInventory,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accept a JSON object, or an empty list standing in for an empty object.
fn map_or_empty_list<'de, D, M>(deserializer: D) -> Result<M, D::Error>
where
    D: Deserializer<'de>,
    M: Deserialize<'de> + Default,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MapOrList<M> {
        Map(M),
        List(Vec<serde::de::IgnoredAny>),
    }

    match Option::<MapOrList<M>>::deserialize(deserializer)? {
        Some(MapOrList::Map(map)) => Ok(map),
        Some(MapOrList::List(list)) if list.is_empty() => Ok(M::default()),
        Some(MapOrList::List(_)) => Err(serde::de::Error::custom(
            "expected an object, found a non-empty list",
        )),
        None => Ok(M::default()),
    }
}

/// The release history of one package, backed by `<dir>/signatures.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureStore {
    path: PathBuf,
    /// PEM text of the signer's base certificate.
    pub certificate: String,
    /// Version of the most recently signed release, or empty if nothing was signed yet.
    pub latest_version: String,
    /// Every release in the order it was signed.
    pub releases: IndexMap<String, Release>,
    /// Leaf digests of the latest release.
    pub inventory: FileInventory,
}

impl SignatureStore {
    /// Load the manifest in `dir`.
    ///
    /// Returns `None` if `dir` has no manifest: the package does not take part in signing.
    #[context("Loading signature manifest from {}", dir.display())]
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }

        let text = std::fs::read_to_string(&path)?;
        let document: Document = serde_json::from_str(&text).context("Parsing JSON")?;
        let releases = document
            .releases
            .into_iter()
            .map(|(version, mut release)| {
                release.version.clone_from(&version);
                (version, release)
            })
            .collect();

        Ok(Some(Self {
            path,
            certificate: document.crt,
            latest_version: document.latest,
            releases,
            inventory: document.inventory,
        }))
    }

    /// Create an empty manifest in `dir`, embedding the signer's base certificate.
    #[context("Initializing signature manifest in {}", dir.display())]
    pub fn initialize(dir: &Path, certificate: &str) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        if path.exists() {
            return Err(SignError::AlreadyInitialized(dir.to_path_buf()).into());
        }

        let store = Self {
            path,
            certificate: certificate.to_string(),
            latest_version: String::new(),
            releases: IndexMap::new(),
            inventory: FileInventory::new(),
        };
        store.persist()?;
        info!("initialized {}", store.path.display());
        Ok(store)
    }

    /// Location of the manifest file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The latest release, if `latest_version` names a recorded release.
    pub fn latest(&self) -> Option<&Release> {
        if self.latest_version.is_empty() {
            return None;
        }
        self.releases.get(&self.latest_version)
    }

    /// Root of the latest release; the chaining input for the next release.
    pub fn latest_root(&self) -> Option<&str> {
        self.latest().map(|release| release.merkle_root.as_str())
    }

    /// Record a new release and make it the latest.
    ///
    /// The inventory is replaced wholesale.  Call [`Self::persist`] afterwards.
    pub fn append(&mut self, release: Release, inventory: FileInventory) {
        debug!(
            "appending release {} with root {}",
            release.version, release.merkle_root
        );
        self.latest_version.clone_from(&release.version);
        self.releases.insert(release.version.clone(), release);
        self.inventory = inventory;
    }

    /// Atomically rewrite the whole manifest.
    #[context("Writing {}", self.path.display())]
    pub fn persist(&self) -> Result<()> {
        let document = DocumentRef {
            readme: README,
            crt: &self.certificate,
            latest: &self.latest_version,
            releases: &self.releases,
            inventory: &self.inventory,
        };

        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        document.serialize(&mut serializer)?;
        out.push(b'\n');

        write_atomic(&self.path, &out)?;
        debug!("wrote {}", self.path.display());
        Ok(())
    }
}

#[derive(Serialize)]
struct DocumentRef<'a> {
    readme: &'a str,
    crt: &'a str,
    latest: &'a str,
    releases: &'a IndexMap<String, Release>,
    inventory: &'a FileInventory,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::test::{tempdir, write_files};

    fn release(version: &str, root: &str, prev: &str) -> Release {
        Release {
            version: version.to_string(),
            timestamp: 1_700_000_000,
            merkle_root: root.to_string(),
            prev_merkle_root: prev.to_string(),
            signature: "00ff".to_string(),
        }
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir();
        assert!(SignatureStore::load(dir.path()).unwrap().is_none());
    }

    #[test]
    fn test_initialize_then_load() {
        let dir = tempdir();
        let store = SignatureStore::initialize(dir.path(), "CERT").unwrap();
        assert_eq!(store.latest(), None);

        let loaded = SignatureStore::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded, store);
        assert_eq!(loaded.certificate, "CERT");

        let err = SignatureStore::initialize(dir.path(), "CERT").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SignError>(),
            Some(SignError::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn test_append_persist_roundtrip() {
        let dir = tempdir();
        let mut store = SignatureStore::initialize(dir.path(), "CERT").unwrap();

        store.append(
            release("1.0", "r1", ""),
            FileInventory::from([("a.txt".into(), "1".into())]),
        );
        store.append(
            release("1.1", "r2", "r1"),
            FileInventory::from([("b.txt".into(), "2".into())]),
        );
        store.persist().unwrap();

        let loaded = SignatureStore::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.latest_version, "1.1");
        assert_eq!(loaded.latest_root(), Some("r2"));
        assert_eq!(loaded.releases.keys().collect::<Vec<_>>(), vec!["1.0", "1.1"]);
        assert_eq!(loaded.releases["1.0"].version, "1.0");
        assert_eq!(loaded.releases["1.0"].prev_root(), None);
        assert_eq!(loaded.releases["1.1"].prev_root(), Some("r1"));
        // only the latest inventory survives
        assert_eq!(
            loaded.inventory,
            FileInventory::from([("b.txt".into(), "2".into())])
        );
    }

    #[test]
    fn test_document_layout() {
        let dir = tempdir();
        let mut store = SignatureStore::initialize(dir.path(), "CERT").unwrap();
        store.append(release("1.0", "r1", ""), FileInventory::new());
        store.persist().unwrap();

        let text = std::fs::read_to_string(store.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["crt"], "CERT");
        assert_eq!(value["latest"], "1.0");
        assert_eq!(value["releases"]["1.0"]["merkle_root"], "r1");
        assert_eq!(value["releases"]["1.0"]["prev_merkle_root"], "");
        assert!(value["releases"]["1.0"].get("version").is_none());
        assert!(value["readme"].is_string());
        assert!(text.contains("\n    \"crt\""), "four-space indent: {text}");
    }

    #[test]
    fn test_tolerates_sparse_documents() {
        let dir = tempdir();
        write_files(
            dir.path(),
            &[(
                MANIFEST_FILE,
                r#"{"crt": "CERT", "latest": "", "releases": [], "inventory": []}"#,
            )],
        );
        let store = SignatureStore::load(dir.path()).unwrap().unwrap();
        assert!(store.releases.is_empty());
        assert!(store.inventory.is_empty());

        write_files(dir.path(), &[(MANIFEST_FILE, r#"{"crt": "CERT"}"#)]);
        let store = SignatureStore::load(dir.path()).unwrap().unwrap();
        assert_eq!(store.latest_version, "");
        assert_eq!(store.latest_root(), None);
    }

    #[test]
    fn test_latest_pointing_nowhere() {
        let dir = tempdir();
        write_files(
            dir.path(),
            &[(MANIFEST_FILE, r#"{"crt": "CERT", "latest": "9.9", "releases": {}}"#)],
        );
        let store = SignatureStore::load(dir.path()).unwrap().unwrap();
        assert_eq!(store.latest(), None);
    }

    #[test]
    fn test_rejects_garbage() {
        let dir = tempdir();
        write_files(dir.path(), &[(MANIFEST_FILE, "not json")]);
        assert!(SignatureStore::load(dir.path()).is_err());
    }
}
