//! Tamper-evident release signing and verification for packages and their dependencies.
//!
//! Signing a release builds a Merkle root over the package's tracked files, chains it to the
//! root of the previous release, signs it, and records it in the package's `signatures.json`.
//! Verification rebuilds the root from what is installed, checks the signature, and decides
//! whether the signer's certificate is trusted for the package.

pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod manifest;
pub mod merkle;
pub mod report;
pub mod sign;
pub mod store;
pub mod trust;
pub mod vcs;
pub mod verify;

mod util;
