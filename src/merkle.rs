//! Merkle fingerprints over a package's files.
//!
//! Every file contributes a leaf: the hex SHA-1 of its content.  Leaves are ordered by path,
//! combined pairwise with SHA-256 over the concatenated hex text of the two children (the last
//! node of an odd-length level is paired with itself), and the process repeats until a single
//! digest remains.  If the previous release's root is known, the published root is
//! `sha256(prev_root ‖ root)`, which links every release to its predecessor.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use log::{debug, trace};
use thiserror::Error;

use crate::{
    store::MANIFEST_FILE,
    util::{sha1_hex, sha256_concat},
    vcs::Vcs,
};

/// Relative file path to hex leaf digest.  Sorted by path, which fixes the leaf order.
pub type FileInventory = BTreeMap<String, String>;

/// Building a Merkle tree failed.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MerkleError {
    #[error("no eligible files to build a Merkle tree from")]
    NoEligibleFiles,
}

/// Where leaf content is read from.
#[derive(Clone, Copy)]
pub enum SourceMode<'a> {
    /// Content as recorded by version control.  Used when signing.
    Tracked(&'a dyn Vcs),
    /// Bytes currently on disk.  Used when verifying.
    WorkingTree,
}

/// The result of hashing a file set: the (possibly chained) root and the leaf inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    root: String,
    prev_root: Option<String>,
    files: FileInventory,
}

impl MerkleTree {
    /// The published root.  Already chained to [`Self::prev_root`] when one was given.
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn prev_root(&self) -> Option<&str> {
        self.prev_root.as_deref()
    }

    pub fn files(&self) -> &FileInventory {
        &self.files
    }

    pub fn into_files(self) -> FileInventory {
        self.files
    }
}

/// Compute the leaf digest of each eligible file.
///
/// The signature manifest itself and paths that are not regular files under `root` are skipped,
/// as are files for which version control has no content in [`SourceMode::Tracked`].
pub fn hash_files(
    files: &[impl AsRef<str>],
    root: &Path,
    mode: SourceMode<'_>,
) -> Result<FileInventory> {
    let mut inventory = FileInventory::new();

    for file in files {
        let file = file.as_ref();
        if file == MANIFEST_FILE || !root.join(file).is_file() {
            trace!("skipping {file}");
            continue;
        }

        let digest = match mode {
            SourceMode::Tracked(vcs) => match vcs.tracked_content(root, file)? {
                Some(content) => sha1_hex(&content),
                None => continue,
            },
            SourceMode::WorkingTree => {
                let content = std::fs::read(root.join(file))
                    .with_context(|| format!("Reading {}", root.join(file).display()))?;
                sha1_hex(&content)
            }
        };
        inventory.insert(file.to_string(), digest);
    }

    Ok(inventory)
}

/// Combine leaves into the unchained root.
pub fn compute_root<'a>(leaves: impl IntoIterator<Item = &'a str>) -> Result<String, MerkleError> {
    let mut level = leaves.into_iter().map(str::to_string).collect::<Vec<_>>();
    if level.is_empty() {
        return Err(MerkleError::NoEligibleFiles);
    }

    loop {
        let parents = level
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                sha256_concat(left, right)
            })
            .collect::<Vec<_>>();

        if let [root] = parents.as_slice() {
            return Ok(root.clone());
        }
        level = parents;
    }
}

/// Link `root` to the root of the previous release.
pub fn chain(prev_root: &str, root: &str) -> String {
    sha256_concat(prev_root, root)
}

/// Hash `files` under `root` and produce the release fingerprint.
///
/// Fails with [`MerkleError::NoEligibleFiles`] if none of the files is eligible.
pub fn build(
    files: &[impl AsRef<str>],
    root: &Path,
    prev_root: Option<&str>,
    mode: SourceMode<'_>,
) -> Result<MerkleTree> {
    let files = hash_files(files, root, mode)?;
    let unchained = compute_root(files.values().map(String::as_str))?;

    let merkle_root = match prev_root {
        Some(prev) => chain(prev, &unchained),
        None => unchained,
    };
    debug!(
        "built merkle root {merkle_root} over {} files under {}",
        files.len(),
        root.display()
    );

    Ok(MerkleTree {
        root: merkle_root,
        prev_root: prev_root.map(str::to_string),
        files,
    })
}
