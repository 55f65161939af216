//! Runtime configuration.
//!
//! Every engine receives a [`Config`] explicitly: the package root it operates on, the trust
//! material directory, and how to reach the ledger.  Nothing in the library reads the current
//! directory or the environment on its own.
//!
//! The trust directory may contain an optional `config.toml`:
//!
//! ```toml
//! [ledger]
//! url = "https://api.apexpl.io/api/"
//! timeout_secs = 30
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fn_error_context::context;
use serde::Deserialize;

use crate::trust::TrustStore;

/// File name of the optional configuration file inside the trust directory.
pub const CONFIG_FILE: &str = "config.toml";

const DEFAULT_LEDGER_URL: &str = "https://api.apexpl.io/api/";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How to reach the ledger service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Base URL; endpoint paths are appended to it.
    pub url: String,

    /// Per-request timeout.
    pub timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_LEDGER_URL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    ledger: LedgerConfig,
}

impl ConfigFile {
    fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// The package being signed, or the project whose dependencies are verified.
    pub root: PathBuf,

    /// Keys, certificates, and the cached issuer certificate.
    pub trust_dir: PathBuf,

    pub ledger: LedgerConfig,
}

impl Config {
    /// A configuration with default ledger settings.
    pub fn new(root: impl Into<PathBuf>, trust_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            trust_dir: trust_dir.into(),
            ledger: LedgerConfig::default(),
        }
    }

    /// Like [`Self::new`], but with ledger settings read from `<trust_dir>/config.toml` if it
    /// exists.
    #[context("Loading configuration from {}", trust_dir.display())]
    pub fn load(root: &Path, trust_dir: &Path) -> Result<Self> {
        let mut config = Self::new(root, trust_dir);

        let path = trust_dir.join(CONFIG_FILE);
        if path.is_file() {
            let content = std::fs::read_to_string(&path)?;
            let file = ConfigFile::from_toml(&content)
                .with_context(|| format!("Parsing {}", path.display()))?;
            config.ledger = file.ledger;
        }

        Ok(config)
    }

    /// `$XDG_CONFIG_HOME/release-signer`, or the platform equivalent.
    pub fn default_trust_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("release-signer"))
    }

    pub fn trust_store(&self) -> TrustStore {
        TrustStore::new(&self.trust_dir)
    }
}
