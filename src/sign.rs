//! Signing new releases.
//!
//! A release is signed over the content version control has recorded, chained to the previous
//! release's root, and appended to the package's signature manifest.  Releases signed with a
//! centrally issued (`apex`) certificate are also reported to the ledger, before anything is
//! written locally.

use anyhow::{ensure, Result};
use fn_error_context::context;
use log::info;

use crate::{
    config::Config,
    crypto::{Certificate, IdentityDomain},
    error::SignError,
    ledger::{Ledger, ReleaseSubmission},
    manifest::{PackageManifest, PACKAGE_MANIFEST},
    merkle::{self, MerkleTree, SourceMode},
    store::{Release, SignatureStore},
    trust::PassphrasePrompt,
    vcs::Vcs,
};

/// Number of signature hex characters shown for operator confirmation.
const SIGNATURE_PREFIX_LEN: usize = 32;

/// The outcome of [`SigningEngine::sign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRelease {
    /// Full `<namespace>/<name>` of the package.
    pub package: String,
    pub tree: MerkleTree,
    pub release: Release,
}

impl SignedRelease {
    pub fn root(&self) -> &str {
        self.tree.root()
    }

    pub fn signature(&self) -> &str {
        &self.release.signature
    }

    /// The leading part of the signature.
    pub fn signature_prefix(&self) -> &str {
        let signature = self.signature();
        &signature[..signature.len().min(SIGNATURE_PREFIX_LEN)]
    }
}

/// Signs releases of the package at [`Config::root`].
pub struct SigningEngine<'a> {
    config: &'a Config,
    vcs: &'a dyn Vcs,
    ledger: &'a dyn Ledger,
    prompt: &'a dyn PassphrasePrompt,
}

impl<'a> SigningEngine<'a> {
    pub fn new(
        config: &'a Config,
        vcs: &'a dyn Vcs,
        ledger: &'a dyn Ledger,
        prompt: &'a dyn PassphrasePrompt,
    ) -> Self {
        Self {
            config,
            vcs,
            ledger,
            prompt,
        }
    }

    fn manifest(&self) -> Result<PackageManifest> {
        PackageManifest::load(&self.config.root)
            .ok_or_else(|| SignError::NoIdentity(self.config.root.join(PACKAGE_MANIFEST)).into())
    }

    /// The signer's certificate, parsed.
    fn certificate(&self, identity: &str) -> Result<Certificate> {
        let trust = self.config.trust_store();
        let path = trust.certificate_path(identity);
        let pem = trust
            .certificate(identity)?
            .ok_or_else(|| SignError::MissingCertificate(path.clone()))?;
        Certificate::from_pem(&pem).map_err(|_| SignError::InvalidCertificate(path).into())
    }

    /// Create an empty signature manifest embedding the signer's certificate.
    #[context("Initializing {} for signing", self.config.root.display())]
    pub fn initialize(&self) -> Result<SignatureStore> {
        let manifest = self.manifest()?;
        let certificate = self.certificate(manifest.identity())?;
        SignatureStore::initialize(&self.config.root, certificate.pem())
    }

    /// Sign the currently tracked content as `version`.
    ///
    /// `passphrase` unlocks the signing key; if it is missing or wrong, the prompt is asked.
    #[context("Signing release {version}")]
    pub fn sign(&self, version: &str, passphrase: Option<&str>) -> Result<SignedRelease> {
        let root = &self.config.root;

        let mut store =
            SignatureStore::load(root)?.ok_or_else(|| SignError::NotInitialized(root.clone()))?;

        let files = self.vcs.tracked_files(root)?;
        if files.is_empty() {
            return Err(SignError::NoTrackedFiles.into());
        }

        let manifest = self.manifest()?;
        let identity = manifest.identity();
        let certificate = self.certificate(identity)?;
        let key = self
            .config
            .trust_store()
            .unlock_key(identity, passphrase, self.prompt)?;
        ensure!(
            key.matches(&certificate),
            "private key {} does not match its certificate",
            key.alias()
        );

        let tree = merkle::build(&files, root, store.latest_root(), SourceMode::Tracked(self.vcs))?;
        let signature = key.sign_hex(tree.root().as_bytes())?;

        let release = Release {
            version: version.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
            merkle_root: tree.root().to_string(),
            prev_merkle_root: tree.prev_root().unwrap_or_default().to_string(),
            signature,
        };

        if let Some(cert_identity) = certificate
            .identity()
            .filter(|id| id.domain == IdentityDomain::Apex)
        {
            let submission = ReleaseSubmission {
                common_name: cert_identity.to_string(),
                package: manifest.name().to_string(),
                repo_alias: "packagist".to_string(),
                version: release.version.clone(),
                signature: release.signature.clone(),
                merkle_root: release.merkle_root.clone(),
                prev_merkle_root: release.prev_merkle_root.clone(),
            };
            self.ledger.submit_release(&key, &submission)?;
        }

        store.append(release.clone(), tree.files().clone());
        store.persist()?;
        info!(
            "signed {} {version} with root {}",
            manifest.name(),
            tree.root()
        );

        Ok(SignedRelease {
            package: manifest.name().to_string(),
            tree,
            release,
        })
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{
        merkle::compute_root,
        test::{
            install_identity, issued_certificate, new_key, self_signed_certificate, tempdir,
            write_files, write_package, DiskVcs, MockLedger,
        },
        trust::NoPrompt,
        util::sha1_hex,
    };

    struct Fixture {
        _project: tempfile::TempDir,
        _trust: tempfile::TempDir,
        config: Config,
    }

    fn fixture(common_name: &str) -> Fixture {
        let project = tempdir();
        let trust = tempdir();
        write_package(project.path(), "alice/widgets", &[("a.txt", "a"), ("b.txt", "b")]);

        let key = new_key();
        let cert = if common_name.ends_with("@apex") {
            issued_certificate(common_name, &key, "ca@apex", &new_key())
        } else {
            self_signed_certificate(common_name, &key)
        };
        install_identity(trust.path(), "alice", &key, &cert);

        let config = Config::new(project.path(), trust.path());
        Fixture {
            _project: project,
            _trust: trust,
            config,
        }
    }

    #[test]
    fn test_initialize_embeds_certificate() {
        let fx = fixture("alice@packagist");
        let ledger = MockLedger::default();
        let vcs = DiskVcs::default();
        let engine = SigningEngine::new(&fx.config, &vcs, &ledger, &NoPrompt);

        let store = engine.initialize().unwrap();
        let cert = fx.config.trust_store().certificate("alice").unwrap().unwrap();
        assert_eq!(store.certificate, cert);

        let err = engine.initialize().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SignError>(),
            Some(SignError::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn test_sign_requires_initialization() {
        let fx = fixture("alice@packagist");
        let ledger = MockLedger::default();
        let vcs = DiskVcs::new(["a.txt"]);
        let err = SigningEngine::new(&fx.config, &vcs, &ledger, &NoPrompt)
            .sign("1.0", None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SignError>(),
            Some(SignError::NotInitialized(_))
        ));
    }

    #[test]
    fn test_sign_requires_tracked_files() {
        let fx = fixture("alice@packagist");
        let ledger = MockLedger::default();
        let vcs = DiskVcs::default();
        let engine = SigningEngine::new(&fx.config, &vcs, &ledger, &NoPrompt);
        engine.initialize().unwrap();

        let err = engine.sign("1.0", None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SignError>(),
            Some(SignError::NoTrackedFiles)
        ));
    }

    #[test]
    fn test_sign_requires_identity() {
        let fx = fixture("alice@packagist");
        let ledger = MockLedger::default();
        let vcs = DiskVcs::new(["a.txt"]);
        let engine = SigningEngine::new(&fx.config, &vcs, &ledger, &NoPrompt);
        engine.initialize().unwrap();

        write_files(&fx.config.root, &[(PACKAGE_MANIFEST, "{}")]);
        let err = engine.sign("1.0", None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SignError>(),
            Some(SignError::NoIdentity(_))
        ));
    }

    #[test]
    fn test_sign_requires_certificate_and_key() {
        let fx = fixture("alice@packagist");
        let ledger = MockLedger::default();
        let vcs = DiskVcs::new(["a.txt"]);
        let engine = SigningEngine::new(&fx.config, &vcs, &ledger, &NoPrompt);
        engine.initialize().unwrap();

        std::fs::remove_file(fx.config.trust_dir.join("keys/alice.pem")).unwrap();
        let err = engine.sign("1.0", None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SignError>(),
            Some(SignError::MissingKey(_))
        ));

        write_files(&fx.config.trust_dir, &[("certs/alice.crt", "garbage")]);
        let err = engine.sign("1.0", None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SignError>(),
            Some(SignError::InvalidCertificate(_))
        ));

        std::fs::remove_file(fx.config.trust_dir.join("certs/alice.crt")).unwrap();
        let err = engine.sign("1.0", None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SignError>(),
            Some(SignError::MissingCertificate(_))
        ));
    }

    #[test]
    fn test_sign_rejects_foreign_key() {
        let fx = fixture("alice@packagist");
        let ledger = MockLedger::default();
        let vcs = DiskVcs::new(["a.txt"]);
        let engine = SigningEngine::new(&fx.config, &vcs, &ledger, &NoPrompt);
        engine.initialize().unwrap();

        let key_pem = String::from_utf8(new_key().private_key_to_pem_pkcs8().unwrap()).unwrap();
        write_files(&fx.config.trust_dir, &[("keys/alice.pem", key_pem.as_str())]);
        let err = engine.sign("1.0", None).unwrap_err();
        assert!(format!("{err:#}").contains("does not match"), "{err:#}");
    }

    #[test]
    fn test_sign_and_chain() {
        let fx = fixture("alice@packagist");
        let ledger = MockLedger::default();
        let vcs = DiskVcs::new(["a.txt", "b.txt", "composer.json"]);
        let engine = SigningEngine::new(&fx.config, &vcs, &ledger, &NoPrompt);
        engine.initialize().unwrap();

        let first = engine.sign("1.0", None).unwrap();
        assert_eq!(first.release.prev_root(), None);
        assert_eq!(first.signature_prefix().len(), 32);
        assert!(first.signature().starts_with(first.signature_prefix()));

        let second = engine.sign("1.1", None).unwrap();
        assert_eq!(second.release.prev_merkle_root, first.root());

        let store = SignatureStore::load(&fx.config.root).unwrap().unwrap();
        assert_eq!(store.latest_version, "1.1");
        assert_eq!(store.releases["1.0"].merkle_root, first.root());
        assert_eq!(store.releases["1.1"].merkle_root, second.root());
        assert_eq!(store.inventory.len(), 3);

        // self-issued certificates never talk to the ledger
        assert!(ledger.submissions.borrow().is_empty());
    }

    #[test]
    fn test_sign_uses_tracked_content() {
        let fx = fixture("alice@packagist");
        let ledger = MockLedger::default();
        let vcs = DiskVcs::new(["a.txt", "b.txt"]).with_content("a.txt", "committed");
        let engine = SigningEngine::new(&fx.config, &vcs, &ledger, &NoPrompt);
        engine.initialize().unwrap();

        let signed = engine.sign("1.0", None).unwrap();
        let leaves = [sha1_hex(b"committed"), sha1_hex(b"b")];
        assert_eq!(
            signed.root(),
            compute_root(leaves.iter().map(String::as_str)).unwrap()
        );
    }

    #[test]
    fn test_apex_release_is_submitted() {
        let fx = fixture("alice@apex");
        let ledger = MockLedger::default();
        let vcs = DiskVcs::new(["a.txt", "b.txt"]);
        let engine = SigningEngine::new(&fx.config, &vcs, &ledger, &NoPrompt);
        engine.initialize().unwrap();

        let signed = engine.sign("2.0", None).unwrap();
        let submissions = ledger.submissions.borrow();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].common_name, "alice@apex");
        assert_eq!(submissions[0].package, "alice/widgets");
        assert_eq!(submissions[0].version, "2.0");
        assert_eq!(submissions[0].merkle_root, signed.root());
        assert_eq!(submissions[0].prev_merkle_root, "");
        assert_eq!(submissions[0].signature, signed.signature());
    }

    #[test]
    fn test_rejected_submission_leaves_store_untouched() {
        let fx = fixture("alice@apex");
        let ledger = MockLedger::default().rejecting_submissions();
        let vcs = DiskVcs::new(["a.txt", "b.txt"]);
        let engine = SigningEngine::new(&fx.config, &vcs, &ledger, &NoPrompt);
        let before = engine.initialize().unwrap();

        assert!(engine.sign("2.0", None).is_err());
        let after = SignatureStore::load(&fx.config.root).unwrap().unwrap();
        assert_eq!(after, before);
    }
}
