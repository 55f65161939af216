//! Local trust material: private keys, certificates, and the cached issuer certificate.
//!
//! ```text
//! <trust_dir>/
//! ├── config.toml            # optional, see crate::config
//! ├── keys/
//! │   ├── alice.pem          # self-issued signing key
//! │   └── bob.apex.pem       # key for a centrally issued certificate
//! └── certs/
//!     ├── alice.crt
//!     ├── bob.apex.crt
//!     ├── carol.crt          # certificate cached from a verified dependency
//!     └── ca.apex.crt        # issuer certificate, fetched from the ledger on first use
//! ```

use std::{
    fs::create_dir_all,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use fn_error_context::context;
use log::{debug, warn};

use crate::{crypto::UnlockedKey, error::SignError, util::write_atomic};

/// Name under which the issuer certificate is cached and fetched.
pub const ISSUER_NAME: &str = "ca.apex";

/// Number of times the passphrase prompt is shown before giving up.
const PROMPT_ATTEMPTS: usize = 3;

/// Source of key passphrases when none was supplied up front.
pub trait PassphrasePrompt {
    /// Ask for the passphrase of `alias`.  `None` means the user declined.
    fn passphrase(&self, alias: &str) -> Result<Option<String>>;
}

/// Never produces a passphrase.  For non-interactive use.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompt;

impl PassphrasePrompt for NoPrompt {
    fn passphrase(&self, _alias: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// The trust-material directory.
#[derive(Debug, Clone)]
pub struct TrustStore {
    dir: PathBuf,
}

impl TrustStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.dir.join("keys")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.dir.join("certs")
    }

    /// `<dir>/<identity>.<ext>`, falling back to `<dir>/<identity>.apex.<ext>`.
    fn lookup(dir: &Path, identity: &str, ext: &str) -> Option<PathBuf> {
        [
            dir.join(format!("{identity}.{ext}")),
            dir.join(format!("{identity}.apex.{ext}")),
        ]
        .into_iter()
        .find(|path| path.is_file())
    }

    /// Where a certificate for `identity` would be written by [`Self::cache_certificate`].
    pub fn certificate_path(&self, identity: &str) -> PathBuf {
        self.certs_dir().join(format!("{identity}.crt"))
    }

    /// PEM text of the local certificate for `identity`, if any.
    #[context("Reading certificate for {identity}")]
    pub fn certificate(&self, identity: &str) -> Result<Option<String>> {
        match Self::lookup(&self.certs_dir(), identity, "crt") {
            Some(path) => Ok(Some(std::fs::read_to_string(path)?)),
            None => Ok(None),
        }
    }

    /// Remember `pem` as the certificate of `identity` for future runs.
    #[context("Caching certificate for {identity}")]
    pub fn cache_certificate(&self, identity: &str, pem: &str) -> Result<()> {
        create_dir_all(self.certs_dir())?;
        write_atomic(&self.certificate_path(identity), pem.as_bytes())?;
        debug!("cached certificate for {identity}");
        Ok(())
    }

    /// PEM text of the cached issuer certificate, if any.
    #[context("Reading issuer certificate")]
    pub fn issuer_certificate(&self) -> Result<Option<String>> {
        let path = self.certs_dir().join(format!("{ISSUER_NAME}.crt"));
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(std::fs::read_to_string(path)?))
    }

    #[context("Caching issuer certificate")]
    pub fn cache_issuer(&self, pem: &str) -> Result<()> {
        create_dir_all(self.certs_dir())?;
        let path = self.certs_dir().join(format!("{ISSUER_NAME}.crt"));
        write_atomic(&path, pem.as_bytes())?;
        debug!("cached issuer certificate at {}", path.display());
        Ok(())
    }

    /// Aliases of every private key in the store, without the `.apex` suffix.
    #[context("Listing keys in {}", self.keys_dir().display())]
    pub fn list_keys(&self) -> Result<Vec<String>> {
        let dir = self.keys_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut aliases = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".pem")) else {
                continue;
            };
            let alias = stem.strip_suffix(".apex").unwrap_or(stem).to_string();
            if !aliases.contains(&alias) {
                aliases.push(alias);
            }
        }
        aliases.sort();
        Ok(aliases)
    }

    /// Load and decrypt the private key of `identity`.
    ///
    /// The key is tried unencrypted first, then with `passphrase`, then with whatever `prompt`
    /// supplies, a few times.
    pub fn unlock_key(
        &self,
        identity: &str,
        passphrase: Option<&str>,
        prompt: &dyn PassphrasePrompt,
    ) -> Result<UnlockedKey> {
        let path = Self::lookup(&self.keys_dir(), identity, "pem")
            .ok_or_else(|| SignError::MissingKey(self.keys_dir().join(format!("{identity}.pem"))))?;
        let pem = std::fs::read(&path).with_context(|| format!("Reading {}", path.display()))?;

        if let Some(key) = UnlockedKey::from_unencrypted_pem(identity, &pem) {
            return Ok(key);
        }
        if let Some(key) =
            passphrase.and_then(|pass| UnlockedKey::from_encrypted_pem(identity, &pem, pass))
        {
            return Ok(key);
        }

        for _ in 0..PROMPT_ATTEMPTS {
            let Some(pass) = prompt.passphrase(identity)? else {
                break;
            };
            if let Some(key) = UnlockedKey::from_encrypted_pem(identity, &pem, &pass) {
                return Ok(key);
            }
            warn!("invalid passphrase for {identity}");
        }

        Err(SignError::InvalidPassphrase(identity.to_string()).into())
    }
}
