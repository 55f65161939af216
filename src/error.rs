//! Error types for signing and verification.
//!
//! Engine entry points return [`anyhow::Result`].  Failures that callers are expected to act on
//! are raised as one of the typed errors below, so they can be recovered with
//! [`anyhow::Error::downcast_ref`].
//!
//! - **Signing preconditions**: [`SignError`]
//! - **Verification preconditions**: [`VerifyError`]
//! - **Ledger transport**: [`LedgerError`]
//!
//! Per-package verification failures are *not* errors; they are recorded as a
//! [`VerificationOutcome`](crate::report::VerificationOutcome).

use std::path::PathBuf;

/// A signing operation could not start or complete.
#[derive(Debug, thiserror::Error)]
pub enum SignError {
    /// No signature manifest exists in the package root.
    #[error("{} has not been initialized for signing (no signatures.json)", .0.display())]
    NotInitialized(PathBuf),

    /// A signature manifest already exists in the package root.
    #[error("{} has already been initialized (signatures.json exists)", .0.display())]
    AlreadyInitialized(PathBuf),

    /// The version control system reported no tracked files.
    #[error("unable to obtain the tracked file list from version control")]
    NoTrackedFiles,

    /// The package manifest does not declare a `<namespace>/<name>` identity.
    #[error("unable to determine the package identity from {}", .0.display())]
    NoIdentity(PathBuf),

    /// No certificate exists for the signing identity.
    #[error("certificate file does not exist at {}", .0.display())]
    MissingCertificate(PathBuf),

    /// The certificate for the signing identity is not valid PEM/X.509.
    #[error("unable to read certificate file at {}", .0.display())]
    InvalidCertificate(PathBuf),

    /// No private key exists for the signing identity.
    #[error("private key file does not exist at {}", .0.display())]
    MissingKey(PathBuf),

    /// The private key could not be unlocked with any of the offered passphrases.
    #[error("invalid passphrase for private key {0}")]
    InvalidPassphrase(String),
}

/// A verification sweep could not start.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("no lock file exists at {}", .0.display())]
    MissingLockFile(PathBuf),
}

/// Talking to the ledger failed.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The request could not be sent or the response could not be read.
    #[error("ledger request to {path} failed: {source}")]
    Http {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    /// The ledger answered with a non-ok status.
    #[error("ledger rejected request to {path}: {message}")]
    Status { path: String, message: String },

    /// The ledger answered without the expected payload.
    #[error("ledger returned an empty response for {0}")]
    EmptyResponse(String),
}
