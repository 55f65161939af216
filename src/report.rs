//! Per-package verification outcomes and their aggregation.

use std::fmt;

use indexmap::IndexMap;
use serde::Serialize;

/// Terminal state of verifying one package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Ok,
    Skipped,
    NoVersion,
    NoUsername,
    NoCert,
    MerkleMismatch,
    InvalidSig,
    InvalidCert,
    InvalidIssuer,
    InvalidPackagistUsername,
    /// The ledger could not be reached while attesting the certificate.
    LedgerUnreachable,
}

impl VerificationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Skipped => "skipped",
            Self::NoVersion => "no_version",
            Self::NoUsername => "no_username",
            Self::NoCert => "no_cert",
            Self::MerkleMismatch => "merkle_mismatch",
            Self::InvalidSig => "invalid_sig",
            Self::InvalidCert => "invalid_cert",
            Self::InvalidIssuer => "invalid_issuer",
            Self::InvalidPackagistUsername => "invalid_packagist_username",
            Self::LedgerUnreachable => "ledger_unreachable",
        }
    }

    /// Human-readable reason for a failed outcome.  `None` for `ok` and `skipped`.
    pub fn description(&self) -> Option<&'static str> {
        Some(match self {
            Self::Ok | Self::Skipped => return None,
            Self::NoVersion => "Version number not found in signatures.json file.",
            Self::NoUsername => "Unable to determine package identity from composer.json file.",
            Self::NoCert => "Unable to retrieve certificate.",
            Self::MerkleMismatch => {
                "Merkle roots do not match.  The following file hashes do not match:"
            }
            Self::InvalidSig => "Invalid digital signature.",
            Self::InvalidCert => "Invalid x.509 certificate.",
            Self::InvalidIssuer => "Invalid certificate issuer.",
            Self::InvalidPackagistUsername => {
                "Package identity is not assigned to certificate owner."
            }
            Self::LedgerUnreachable => "Unable to reach the ledger to attest the certificate.",
        })
    }

    pub fn is_ok(&self) -> bool {
        *self == Self::Ok
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Ok | Self::Skipped)
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageResult {
    pub name: String,
    /// The version that was checked, or `latest` for the root package.
    pub version: String,
    pub outcome: VerificationOutcome,
    /// Number of files in the stored inventory.
    pub num_files: usize,
    /// Whether the stored inventory belongs to the checked version.  It is only kept for the
    /// latest release, so for older versions only the root chain is meaningful.
    pub inventory_current: bool,
}

/// Accumulated results of a verification sweep.
///
/// Packages are kept in the order they were checked.  Recording the same name again replaces
/// the earlier entry, its totals, and its file mismatches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    packages: IndexMap<String, PackageResult>,
    file_mismatches: IndexMap<String, Vec<String>>,
}

impl VerificationReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result for a package.  File mismatches are added afterwards.
    pub fn record(&mut self, result: PackageResult) {
        self.file_mismatches.shift_remove(&result.name);
        self.packages.insert(result.name.clone(), result);
    }

    pub fn add_file_mismatch(&mut self, package: &str, file: impl Into<String>) {
        self.file_mismatches
            .entry(package.to_string())
            .or_default()
            .push(file.into());
    }

    pub fn packages(&self) -> impl Iterator<Item = &PackageResult> {
        self.packages.values()
    }

    pub fn get(&self, package: &str) -> Option<&PackageResult> {
        self.packages.get(package)
    }

    pub fn outcome(&self, package: &str) -> Option<VerificationOutcome> {
        self.get(package).map(|result| result.outcome)
    }

    /// Files whose content no longer matches what was signed.
    pub fn file_mismatches(&self, package: &str) -> &[String] {
        self.file_mismatches
            .get(package)
            .map_or(&[], Vec::as_slice)
    }

    fn count(&self, pred: impl Fn(&VerificationOutcome) -> bool) -> usize {
        self.packages
            .values()
            .filter(|result| pred(&result.outcome))
            .count()
    }

    pub fn total_ok(&self) -> usize {
        self.count(VerificationOutcome::is_ok)
    }

    pub fn total_skipped(&self) -> usize {
        self.count(|outcome| *outcome == VerificationOutcome::Skipped)
    }

    pub fn total_failed(&self) -> usize {
        self.count(VerificationOutcome::is_failure)
    }
}
