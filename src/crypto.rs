//! RSA/SHA-384 release signatures and X.509 certificate handling.
//!
//! A release signature is an RSA PKCS#1 v1.5 signature with SHA-384 over the ASCII text of the
//! hex Merkle root.  Certificates carry the signer identity in their subject common name, in the
//! form `<name>@<domain>`.

use std::fmt;

use anyhow::{Context, Result};
use openssl::{
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    sign::{Signer, Verifier},
    x509::X509,
};

/// Trust model of a certificate, taken from the domain part of its common name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityDomain {
    /// Self-issued; trusted by binding to the package namespace alone.
    Packagist,
    /// Issued by the central authority; requires chain verification and ledger attestation.
    Apex,
    /// Anything else.  Never trusted.
    Other(String),
}

impl IdentityDomain {
    pub fn as_str(&self) -> &str {
        match self {
            IdentityDomain::Packagist => "packagist",
            IdentityDomain::Apex => "apex",
            IdentityDomain::Other(other) => other,
        }
    }
}

/// The `<name>@<domain>` identity in a certificate's common name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateIdentity {
    pub name: String,
    pub domain: IdentityDomain,
}

fn is_identity_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl CertificateIdentity {
    /// Parse a common name.  Both parts must be non-empty and consist of `[A-Za-z0-9_-]`.
    pub fn parse(common_name: &str) -> Option<Self> {
        let (name, domain) = common_name.split_once('@')?;
        if !is_identity_part(name) || !is_identity_part(domain) {
            return None;
        }
        let domain = match domain {
            "packagist" => IdentityDomain::Packagist,
            "apex" => IdentityDomain::Apex,
            other => IdentityDomain::Other(other.to_string()),
        };
        Some(Self {
            name: name.to_string(),
            domain,
        })
    }

    /// `<name>.<domain>`, the key this certificate is known by on the ledger.
    pub fn ledger_name(&self) -> String {
        format!("{}.{}", self.name, self.domain.as_str())
    }
}

impl fmt::Display for CertificateIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.domain.as_str())
    }
}

/// A parsed X.509 certificate together with its PEM text.
#[derive(Clone)]
pub struct Certificate {
    x509: X509,
    pem: String,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("common_name", &self.common_name())
            .finish_non_exhaustive()
    }
}

impl Certificate {
    pub fn from_pem(pem: &str) -> Result<Self> {
        let x509 = X509::from_pem(pem.as_bytes()).context("parsing certificate PEM")?;
        Ok(Self {
            x509,
            pem: pem.to_string(),
        })
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn common_name(&self) -> Option<String> {
        let entry = self
            .x509
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()?;
        Some(entry.data().as_utf8().ok()?.to_string())
    }

    /// The identity in the common name, or `None` if the common name is absent or malformed.
    pub fn identity(&self) -> Option<CertificateIdentity> {
        CertificateIdentity::parse(&self.common_name()?)
    }

    /// Hex SHA-384 over the DER encoding.
    pub fn fingerprint(&self) -> Result<String> {
        let digest = self
            .x509
            .digest(MessageDigest::sha384())
            .context("computing certificate fingerprint")?;
        Ok(hex::encode(&*digest))
    }

    /// Whether this certificate's signature verifies under `issuer`'s public key.
    pub fn is_issued_by(&self, issuer: &Certificate) -> bool {
        issuer
            .x509
            .public_key()
            .and_then(|key| self.x509.verify(&key))
            .unwrap_or(false)
    }

    /// Whether `signature` is a valid RSA/SHA-384 signature over `message` by this certificate's key.
    pub fn verify_signature(&self, message: &[u8], signature: &[u8]) -> bool {
        let verify = || -> Result<bool, openssl::error::ErrorStack> {
            let key = self.x509.public_key()?;
            let mut verifier = Verifier::new(MessageDigest::sha384(), &key)?;
            verifier.update(message)?;
            verifier.verify(signature)
        };
        verify().unwrap_or(false)
    }
}

/// A private key that has been decrypted.
pub struct UnlockedKey {
    alias: String,
    key: PKey<Private>,
}

impl fmt::Debug for UnlockedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnlockedKey")
            .field("alias", &self.alias)
            .field("key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl UnlockedKey {
    pub fn new(alias: impl Into<String>, key: PKey<Private>) -> Self {
        Self {
            alias: alias.into(),
            key,
        }
    }

    /// Try to read `pem` as an unencrypted key.  Never falls back to a terminal prompt.
    pub fn from_unencrypted_pem(alias: &str, pem: &[u8]) -> Option<Self> {
        PKey::private_key_from_pem_callback(pem, |_buf| Ok(0))
            .ok()
            .map(|key| Self::new(alias, key))
    }

    /// Try to read `pem` as a key encrypted with `passphrase`.
    pub fn from_encrypted_pem(alias: &str, pem: &[u8], passphrase: &str) -> Option<Self> {
        PKey::private_key_from_pem_passphrase(pem, passphrase.as_bytes())
            .ok()
            .map(|key| Self::new(alias, key))
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Whether this key is the private half of `certificate`.
    pub fn matches(&self, certificate: &Certificate) -> bool {
        certificate
            .x509
            .public_key()
            .map(|public| public.public_eq(&self.key))
            .unwrap_or(false)
    }

    /// RSA/SHA-384 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut signer =
            Signer::new(MessageDigest::sha384(), &self.key).context("creating signer")?;
        signer.update(message).context("signing")?;
        signer.sign_to_vec().context("signing")
    }

    /// [`Self::sign`], hex-encoded.
    pub fn sign_hex(&self, message: &[u8]) -> Result<String> {
        Ok(hex::encode(self.sign(message)?))
    }
}
