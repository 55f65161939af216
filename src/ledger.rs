//! The ledger: an external service that attests certificate/identity bindings and records
//! releases signed with centrally issued certificates.
//!
//! [`Ledger`] is the seam the engines talk to.  [`HttpLedger`] is the production implementation.
//! Every response is wrapped in an envelope:
//!
//! ```json
//! { "status": "ok", "message": "", "data": { ... } }
//! ```
//!
//! A `status` other than `"ok"` is reported as [`LedgerError::Status`] with the server's message.

use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use reqwest::blocking::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{config::LedgerConfig, crypto::UnlockedKey, error::LedgerError, trust::ISSUER_NAME};

/// A release being reported by its signer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseSubmission {
    /// `<name>@apex`
    pub common_name: String,
    /// Full `<namespace>/<name>` of the package.
    #[serde(rename = "pkg_serial")]
    pub package: String,
    pub repo_alias: String,
    pub version: String,
    pub signature: String,
    pub merkle_root: String,
    pub prev_merkle_root: String,
}

/// A request to attest that a certificate is current and bound to an identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttestationRequest {
    /// The package identity the certificate claims to belong to.
    pub identity: String,
    /// `<name>.apex`, the ledger name of the certificate.
    pub certificate_name: String,
    pub fingerprint: String,
    pub issuer_fingerprint: String,
    /// Unix time of the release being verified.
    pub timestamp: i64,
}

/// The ledger's verdict on an [`AttestationRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attestation {
    /// Number of fingerprint/history checks that failed.
    pub failures: u64,
    /// Whether the identity is bound to the certificate's owner.
    pub identity_confirmed: bool,
}

pub trait Ledger {
    /// PEM text of the certificate known to the ledger as `name` (for instance `ca.apex`).
    fn fetch_certificate(&self, name: &str) -> Result<String>;

    /// Record a signed release.  Authenticated with `key`.
    fn submit_release(&self, key: &UnlockedKey, submission: &ReleaseSubmission) -> Result<()>;

    fn verify_certificate(&self, request: &AttestationRequest) -> Result<Attestation>;
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    status: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct Challenge {
    challenge: String,
}

#[derive(Deserialize)]
struct CertificateResponse {
    certificate: String,
}

#[derive(Deserialize)]
struct AttestationResponse {
    #[serde(default)]
    fail: u64,
    #[serde(default)]
    packagist_check: Value,
}

#[derive(Serialize)]
struct AttestationBody<'a> {
    packagist_username: &'a str,
    release_date: String,
    fingerprints: serde_json::Map<String, Value>,
}

/// Loose truthiness: the ledger reports booleans as `true`, `1`, or `"1"`.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Unwrap the envelope of a response to `path` and decode its payload.
fn decode<T: DeserializeOwned>(path: &str, body: &str) -> Result<T> {
    if body.trim().is_empty() {
        return Err(LedgerError::EmptyResponse(path.to_string()).into());
    }
    let envelope: Envelope = serde_json::from_str(body)
        .with_context(|| format!("Parsing ledger response for {path}"))?;
    if envelope.status != "ok" {
        return Err(LedgerError::Status {
            path: path.to_string(),
            message: envelope.message,
        }
        .into());
    }
    let data = envelope
        .data
        .filter(|data| !data.is_null())
        .ok_or_else(|| LedgerError::EmptyResponse(path.to_string()))?;
    serde_json::from_value(data).with_context(|| format!("Decoding ledger response for {path}"))
}

/// `YYYY-MM-DD HH:MM:SS` in UTC.
fn release_date(timestamp: i64) -> Result<String> {
    let date = chrono::DateTime::from_timestamp(timestamp, 0)
        .with_context(|| format!("Release timestamp {timestamp} out of range"))?;
    Ok(date.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// [`Ledger`] over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpLedger {
    client: Client,
    base_url: String,
}

impl HttpLedger {
    pub fn new(config: &LedgerConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("release-signer/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Building HTTP client")?;
        let mut base_url = config.url.clone();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn send<T: DeserializeOwned>(&self, path: &str, request: RequestBuilder) -> Result<T> {
        debug!("ledger request: {path}");
        let http_err = |source| LedgerError::Http {
            path: path.to_string(),
            source,
        };
        let body = request.send().map_err(http_err)?.text().map_err(http_err)?;
        decode(path, &body)
    }

    /// Obtain a challenge for `username` and answer it with `key`.
    ///
    /// Returns the `API-Username`/`API-Signature` header values for the authenticated request.
    fn authenticate(&self, username: &str, key: &UnlockedKey) -> Result<(String, String)> {
        let path = "enduro/get_auth_challenge";
        let challenge: Challenge = self.send(
            path,
            self.client.post(self.url(path)).form(&[("username", username)]),
        )?;
        let signature = key.sign_hex(challenge.challenge.as_bytes())?;
        Ok((username.to_string(), signature))
    }
}

impl Ledger for HttpLedger {
    fn fetch_certificate(&self, name: &str) -> Result<String> {
        let path = format!("ledger/crt/{name}");
        let response: CertificateResponse = self.send(&path, self.client.get(self.url(&path)))?;
        info!("retrieved certificate {name} from the ledger");
        Ok(response.certificate)
    }

    fn submit_release(&self, key: &UnlockedKey, submission: &ReleaseSubmission) -> Result<()> {
        let username = submission
            .common_name
            .split_once('@')
            .map_or(submission.common_name.as_str(), |(name, _)| name);
        let (api_username, api_signature) = self.authenticate(username, key)?;

        let path = "ledger/releases/add";
        let _: Value = self.send(
            path,
            self.client
                .post(self.url(path))
                .header("API-Username", api_username)
                .header("API-Signature", api_signature)
                .form(submission),
        )?;
        info!(
            "published {} {} to the ledger",
            submission.package, submission.version
        );
        Ok(())
    }

    fn verify_certificate(&self, request: &AttestationRequest) -> Result<Attestation> {
        let mut fingerprints = serde_json::Map::new();
        fingerprints.insert(
            request.certificate_name.clone(),
            Value::String(request.fingerprint.clone()),
        );
        fingerprints.insert(
            ISSUER_NAME.to_string(),
            Value::String(request.issuer_fingerprint.clone()),
        );
        let body = AttestationBody {
            packagist_username: &request.identity,
            release_date: release_date(request.timestamp)?,
            fingerprints,
        };

        let path = "ledger/verify_certificate";
        let response: AttestationResponse =
            self.send(path, self.client.post(self.url(path)).json(&body))?;
        Ok(Attestation {
            failures: response.fail,
            identity_confirmed: is_truthy(&response.packagist_check),
        })
    }
}
