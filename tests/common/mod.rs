#![allow(dead_code)]

use std::path::{Path, PathBuf};

use anyhow::Result;
use tempfile::TempDir;

use release_signer::{
    config::Config,
    ledger::Ledger,
    sign::{SignedRelease, SigningEngine},
    test::{tempdir, write_files, write_package},
    trust::NoPrompt,
    vcs::Vcs,
};

/// Tracks every regular file in the package, reading content from disk.
pub struct WorkingTreeVcs;

impl Vcs for WorkingTreeVcs {
    fn tracked_files(&self, root: &Path) -> Result<Vec<String>> {
        fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    walk(root, &path, out)?;
                } else {
                    out.push(path.strip_prefix(root)?.to_string_lossy().into_owned());
                }
            }
            Ok(())
        }
        let mut files = Vec::new();
        walk(root, root, &mut files)?;
        Ok(files)
    }

    fn tracked_content(&self, root: &Path, path: &str) -> Result<Option<Vec<u8>>> {
        Ok(std::fs::read(root.join(path)).ok())
    }
}

/// A project directory with a lock file, and a separate trust directory for verifying it.
pub struct Project {
    pub dir: TempDir,
    pub trust: TempDir,
}

impl Project {
    pub fn new(name: &str) -> Self {
        let project = Self {
            dir: tempdir(),
            trust: tempdir(),
        };
        write_package(project.dir.path(), name, &[]);
        project.lock(&[]);
        project
    }

    /// Rewrite the lock file with the given `(name, version)` entries.
    pub fn lock(&self, packages: &[(&str, &str)]) {
        let packages = packages
            .iter()
            .map(|(name, version)| serde_json::json!({ "name": name, "version": version }))
            .collect::<Vec<_>>();
        let lock = serde_json::json!({ "packages": packages }).to_string();
        write_files(self.dir.path(), &[("composer.lock", lock.as_str())]);
    }

    /// Create `vendor/<name>` holding `files` and a manifest declaring `name`.
    pub fn vendor(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = self.dir.path().join("vendor").join(name);
        write_package(&dir, name, files);
        dir
    }

    pub fn config(&self) -> Config {
        Config::new(self.dir.path(), self.trust.path())
    }
}

/// Initialize (if needed) and sign the package in `dir` with the identity in `signer_trust`.
pub fn sign(dir: &Path, signer_trust: &Path, ledger: &dyn Ledger, version: &str) -> SignedRelease {
    let config = Config::new(dir, signer_trust);
    let engine = SigningEngine::new(&config, &WorkingTreeVcs, ledger, &NoPrompt);
    if !dir.join("signatures.json").exists() {
        engine.initialize().unwrap();
    }
    engine.sign(version, None).unwrap()
}
