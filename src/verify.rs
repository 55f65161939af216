//! Verifying installed packages against their signed releases.
//!
//! A sweep checks the project root (if it signs its own releases) and then every package in the
//! lock file that is installed under `vendor/`.  Each package independently ends in one
//! [`VerificationOutcome`]; no per-package failure stops the sweep.
//!
//! Per package:
//!
//! 1. no `signatures.json`: `skipped`
//! 2. requested version not recorded: `no_version`
//! 3. no identity in `composer.json`: `no_username`
//! 4. no certificate, locally or embedded in the manifest: `no_cert`
//! 5. root rebuilt from the files on disk differs: `merkle_mismatch`
//! 6. certificate unreadable: `invalid_cert`
//! 7. signature does not verify: `invalid_sig`
//! 8. otherwise, the certificate trust check decides
//!
//! Trust depends on the certificate's identity domain.  Self-issued `packagist` certificates are
//! trusted when their name equals the package identity.  Centrally issued `apex` certificates
//! must be signed by the issuer certificate and attested by the ledger.  Attestations are
//! remembered for the rest of the sweep, so a signer shared by many dependencies is only checked
//! once.

use std::{
    collections::{HashMap, HashSet},
    path::{Component, Path, PathBuf},
};

use anyhow::Result;
use fn_error_context::context;
use log::{debug, info, warn};

use crate::{
    config::Config,
    crypto::{Certificate, IdentityDomain},
    ledger::{AttestationRequest, Ledger},
    manifest::{LockFile, PackageManifest},
    merkle::{self, FileInventory, SourceMode},
    report::{PackageResult, VerificationOutcome, VerificationReport},
    store::{SignatureStore, MANIFEST_FILE},
    trust::{TrustStore, ISSUER_NAME},
};

/// Version requested for the project root: whatever was signed last.
pub const LATEST: &str = "latest";

const VENDOR_DIR: &str = "vendor";

/// `<root>/vendor/<name>`, or `None` if `name` would escape the vendor directory.
fn vendor_dir(root: &Path, name: &str) -> Option<PathBuf> {
    let relative = Path::new(name);
    if name.is_empty()
        || !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(VENDOR_DIR).join(relative))
}

/// Stored files whose recorded digest no longer occurs among the recomputed digests.
fn mismatched_files<'a>(stored: &'a FileInventory, computed: &FileInventory) -> Vec<&'a str> {
    let present = computed.values().collect::<HashSet<_>>();
    stored
        .iter()
        .filter(|(_, digest)| !present.contains(digest))
        .map(|(file, _)| file.as_str())
        .collect()
}

/// Verifies the project at [`Config::root`] and its installed dependencies.
pub struct VerificationEngine<'a> {
    config: &'a Config,
    ledger: &'a dyn Ledger,
}

impl<'a> VerificationEngine<'a> {
    pub fn new(config: &'a Config, ledger: &'a dyn Ledger) -> Self {
        Self { config, ledger }
    }

    /// Run a full sweep.
    ///
    /// Only a missing or unreadable lock file is an error.  Everything else is reported per
    /// package.
    #[context("Verifying {}", self.config.root.display())]
    pub fn verify(&self) -> Result<VerificationReport> {
        let root = &self.config.root;
        let lock = LockFile::load(root)?;
        let mut sweep = Sweep::new(self.config.trust_store(), self.ledger);

        if root.join(MANIFEST_FILE).is_file() {
            let name = PackageManifest::load(root)
                .map_or_else(|| "/".to_string(), |manifest| manifest.name().to_string());
            sweep.verify_package(&name, root, LATEST);
        }

        for package in &lock.packages {
            let Some(dir) = vendor_dir(root, &package.name) else {
                warn!("ignoring lock file entry with name {:?}", package.name);
                continue;
            };
            if !dir.is_dir() {
                debug!("{} is not installed", package.name);
                continue;
            }
            sweep.verify_package(&package.name, &dir, &package.version);
        }

        let report = sweep.report;
        info!(
            "{} verified, {} skipped, {} failures",
            report.total_ok(),
            report.total_skipped(),
            report.total_failed()
        );
        Ok(report)
    }

    /// Verify a single package directory at `version` (or [`LATEST`]).
    pub fn verify_package(&self, name: &str, dir: &Path, version: &str) -> VerificationReport {
        let mut sweep = Sweep::new(self.config.trust_store(), self.ledger);
        sweep.verify_package(name, dir, version);
        sweep.report
    }
}

/// State shared by the packages of one sweep.
struct Sweep<'a> {
    trust: TrustStore,
    ledger: &'a dyn Ledger,
    issuer: Option<Certificate>,
    /// Certificate fingerprint to the identities the ledger confirmed for it.
    attested: HashMap<String, HashSet<String>>,
    report: VerificationReport,
}

impl<'a> Sweep<'a> {
    fn new(trust: TrustStore, ledger: &'a dyn Ledger) -> Self {
        Self {
            trust,
            ledger,
            issuer: None,
            attested: HashMap::new(),
            report: VerificationReport::new(),
        }
    }

    fn verify_package(&mut self, name: &str, dir: &Path, version: &str) -> VerificationOutcome {
        let mut result = PackageResult {
            name: name.to_string(),
            version: version.to_string(),
            outcome: VerificationOutcome::Skipped,
            num_files: 0,
            inventory_current: false,
        };
        let mut mismatches = Vec::new();
        result.outcome = self.check(dir, &mut result, &mut mismatches);

        match result.outcome {
            VerificationOutcome::Ok => info!("{name} {version}: verified"),
            VerificationOutcome::Skipped => debug!("{name} {version}: skipped"),
            outcome => warn!("{name} {version}: {outcome}"),
        }
        let outcome = result.outcome;
        self.report.record(result);
        for file in mismatches {
            self.report.add_file_mismatch(name, file);
        }
        outcome
    }

    fn check(
        &mut self,
        dir: &Path,
        result: &mut PackageResult,
        mismatches: &mut Vec<String>,
    ) -> VerificationOutcome {
        let store = match SignatureStore::load(dir) {
            Ok(Some(store)) => store,
            Ok(None) => return VerificationOutcome::Skipped,
            Err(err) => {
                warn!("{}: {err:#}", result.name);
                return VerificationOutcome::NoVersion;
            }
        };

        let release = if result.version == LATEST {
            store.latest()
        } else {
            store.releases.get(&result.version)
        };
        let Some(release) = release else {
            return VerificationOutcome::NoVersion;
        };
        result.num_files = store.inventory.len();
        result.inventory_current = release.version == store.latest_version;
        if !result.inventory_current {
            warn!(
                "{} {}: recorded file digests belong to {}, only the root chain of {} can be checked",
                result.name, result.version, store.latest_version, release.version
            );
        }

        let Some(manifest) = PackageManifest::load(dir) else {
            return VerificationOutcome::NoUsername;
        };
        let identity = manifest.identity();

        let Some(cert_text) = self.certificate_text(identity, &store) else {
            return VerificationOutcome::NoCert;
        };

        let files = store.inventory.keys().collect::<Vec<_>>();
        let computed = match merkle::build(&files, dir, release.prev_root(), SourceMode::WorkingTree)
        {
            Ok(tree) => Some(tree),
            Err(err) => {
                debug!("{}: unable to rebuild merkle tree: {err:#}", result.name);
                None
            }
        };
        if computed.as_ref().map(|tree| tree.root()) != Some(release.merkle_root.as_str()) {
            let empty = FileInventory::new();
            let computed_files = computed.as_ref().map_or(&empty, |tree| tree.files());
            mismatches.extend(
                mismatched_files(&store.inventory, computed_files)
                    .into_iter()
                    .map(str::to_string),
            );
            return VerificationOutcome::MerkleMismatch;
        }

        let certificate = match Certificate::from_pem(&cert_text) {
            Ok(certificate) => certificate,
            Err(err) => {
                debug!("{}: {err:#}", result.name);
                return VerificationOutcome::InvalidCert;
            }
        };

        let signature_ok = hex::decode(&release.signature)
            .map(|signature| {
                certificate.verify_signature(release.merkle_root.as_bytes(), &signature)
            })
            .unwrap_or(false);
        if !signature_ok {
            return VerificationOutcome::InvalidSig;
        }

        self.check_trust(&certificate, identity, release.timestamp)
    }

    /// The certificate to check a package against: the local copy for `identity` if there is
    /// one, else the one embedded in the manifest, which is then kept locally.
    fn certificate_text(&self, identity: &str, store: &SignatureStore) -> Option<String> {
        match self.trust.certificate(identity) {
            Ok(Some(text)) => return Some(text),
            Ok(None) => {}
            Err(err) => warn!("{err:#}"),
        }

        if store.certificate.is_empty() {
            return None;
        }
        if let Err(err) = self.trust.cache_certificate(identity, &store.certificate) {
            warn!("{err:#}");
        }
        Some(store.certificate.clone())
    }

    fn check_trust(
        &mut self,
        certificate: &Certificate,
        identity: &str,
        timestamp: i64,
    ) -> VerificationOutcome {
        let Some(cert_identity) = certificate.identity() else {
            return VerificationOutcome::InvalidCert;
        };

        match cert_identity.domain {
            IdentityDomain::Packagist if cert_identity.name == identity => VerificationOutcome::Ok,
            IdentityDomain::Packagist | IdentityDomain::Other(_) => VerificationOutcome::InvalidCert,
            IdentityDomain::Apex => {
                let issuer = match self.issuer() {
                    Ok(issuer) => issuer,
                    Err(outcome) => return outcome,
                };
                if !certificate.is_issued_by(&issuer) {
                    return VerificationOutcome::InvalidIssuer;
                }

                let (Ok(fingerprint), Ok(issuer_fingerprint)) =
                    (certificate.fingerprint(), issuer.fingerprint())
                else {
                    return VerificationOutcome::InvalidCert;
                };
                if self
                    .attested
                    .get(&fingerprint)
                    .is_some_and(|identities| identities.contains(identity))
                {
                    debug!("{cert_identity} already attested for {identity}");
                    return VerificationOutcome::Ok;
                }

                let request = AttestationRequest {
                    identity: identity.to_string(),
                    certificate_name: cert_identity.ledger_name(),
                    fingerprint,
                    issuer_fingerprint,
                    timestamp,
                };
                let attestation = match self.ledger.verify_certificate(&request) {
                    Ok(attestation) => attestation,
                    Err(err) => {
                        warn!("unable to attest {cert_identity}: {err:#}");
                        return VerificationOutcome::LedgerUnreachable;
                    }
                };

                if attestation.failures > 0 {
                    VerificationOutcome::InvalidCert
                } else if !attestation.identity_confirmed {
                    VerificationOutcome::InvalidPackagistUsername
                } else {
                    self.attested
                        .entry(request.fingerprint)
                        .or_default()
                        .insert(request.identity);
                    VerificationOutcome::Ok
                }
            }
        }
    }

    /// The issuer certificate: from this sweep, the trust directory, or the ledger, in that
    /// order.  A certificate fetched from the ledger is cached in the trust directory.
    fn issuer(&mut self) -> Result<Certificate, VerificationOutcome> {
        if let Some(issuer) = &self.issuer {
            return Ok(issuer.clone());
        }

        let cached = match self.trust.issuer_certificate() {
            Ok(cached) => cached,
            Err(err) => {
                warn!("{err:#}");
                None
            }
        };

        let issuer = match cached {
            Some(pem) => Certificate::from_pem(&pem).map_err(|err| {
                warn!("cached issuer certificate is unreadable: {err:#}");
                VerificationOutcome::InvalidIssuer
            })?,
            None => {
                let pem = self.ledger.fetch_certificate(ISSUER_NAME).map_err(|err| {
                    warn!("unable to retrieve the issuer certificate: {err:#}");
                    VerificationOutcome::LedgerUnreachable
                })?;
                let issuer = Certificate::from_pem(&pem).map_err(|err| {
                    warn!("ledger returned an unreadable issuer certificate: {err:#}");
                    VerificationOutcome::InvalidIssuer
                })?;
                if let Err(err) = self.trust.cache_issuer(&pem) {
                    warn!("{err:#}");
                }
                info!("cached issuer certificate from the ledger");
                issuer
            }
        };

        self.issuer = Some(issuer.clone());
        Ok(issuer)
    }
}
