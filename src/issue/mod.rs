//! Obtaining certificates from the certificate authority.
//!
//! The ACME protocol and the DNS provider API are both handled by an external ACME client (see
//! [`CertbotDns01`]); this module validates inputs, bounds the call with a timeout, and turns the
//! client's outcome into a typed [`IssuanceError`].
//!
//! # Rate Limits
//!
//! Let's Encrypt enforces [rate limits] per registered domain and per account. A rate-limited
//! issuance is reported as [`IssuanceError::RateLimited`], the one failure that the lifecycle
//! answers with a self-signed fallback instead of an operator alert.
//!
//! [rate limits]: https://letsencrypt.org/docs/rate-limits

use std::{collections::BTreeSet, io, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use zeroize::Zeroizing;

use crate::{
    cert::{CertificateMaterial, MaterialOrigin},
    error::ErrorKind,
};

mod certbot;
mod credentials;

pub use self::{
    certbot::{CertbotDns01, CertbotSettings},
    credentials::{CredentialsError, DnsCredentials, TOKEN_KEY},
};

/// Default upper bound for one issuance attempt (10 minutes).
///
/// DNS propagation waits alone are typically one or two minutes.
pub const DEFAULT_ISSUANCE_TIMEOUT: Duration = Duration::from_secs(600);

/// The names one certificate should cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateOrder {
    /// Primary name, the certificate CN.
    pub domain: String,

    /// Every name, primary first, de-duplicated.
    pub names: Vec<String>,

    /// Ask for a new certificate even if the client thinks the current one is fine.
    pub force: bool,
}

impl CertificateOrder {
    pub fn new<'a>(
        domain: &str,
        san_list: impl IntoIterator<Item = &'a String>,
        force: bool,
    ) -> Self {
        let mut names = vec![domain.to_owned()];
        let mut dedup = BTreeSet::from([domain.to_owned()]);

        for name in san_list {
            if dedup.insert(name.clone()) {
                names.push(name.clone());
            }
        }

        CertificateOrder {
            domain: domain.to_owned(),
            names,
            force,
        }
    }
}

/// Raw result of invoking the external ACME client.
#[derive(Debug, Clone, Default)]
pub struct CapabilityOutput {
    pub success: bool,
    pub cert_pem: Option<String>,
    pub key_pem: Option<Zeroizing<String>>,

    /// Whatever the client printed; the only source for failure classification.
    pub diagnostic: String,
}

/// An external capability that runs an ACME order with a DNS-01 challenge.
#[async_trait]
pub trait AcmeCapability: Send + Sync {
    async fn request_certificate(
        &self,
        order: &CertificateOrder,
        credentials: &DnsCredentials,
    ) -> io::Result<CapabilityOutput>;
}

#[derive(Debug, thiserror::Error)]
pub enum IssuanceError {
    #[error("DNS credentials invalid: {source}")]
    CredentialsInvalid {
        #[source]
        source: CredentialsError,
        hint: String,
    },

    #[error("DNS provider rejected the credentials: {diagnostic}")]
    CredentialsRejected { diagnostic: String },

    #[error("certificate authority rate limit hit: {diagnostic}")]
    RateLimited { diagnostic: String },

    #[error("DNS-01 challenge failed: {diagnostic}")]
    ChallengeFailed { diagnostic: String },

    #[error("ACME client did not finish within {}s", .0.as_secs())]
    TimedOut(Duration),

    #[error("could not run ACME client: {0}")]
    Io(#[from] io::Error),

    #[error("ACME client reported success but produced unusable material: {0}")]
    InvalidMaterial(String),
}

impl IssuanceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IssuanceError::CredentialsInvalid { .. } | IssuanceError::CredentialsRejected { .. } => {
                ErrorKind::CredentialsInvalid
            }
            IssuanceError::RateLimited { .. } => ErrorKind::RateLimited,
            IssuanceError::ChallengeFailed { .. } => ErrorKind::ChallengeFailed,
            IssuanceError::TimedOut(_)
            | IssuanceError::Io(_)
            | IssuanceError::InvalidMaterial(_) => ErrorKind::IoError,
        }
    }

    /// Specific remediation, falling back to the kind's general one.
    pub fn hint(&self) -> Option<String> {
        match self {
            IssuanceError::CredentialsInvalid { hint, .. } => Some(hint.clone()),
            _ => self.kind().remediation().map(ToOwned::to_owned),
        }
    }
}

/// How a failed run of the ACME client reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticClass {
    RateLimited,
    CredentialsRejected,
    ChallengeFailed,
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "ratelimited",
    "rate limit",
    "too many certificates",
    "too many failed authorizations",
    "too many new orders",
    "too many registrations",
    "too many requests",
];

const CREDENTIAL_MARKERS: &[&str] = &[
    "invalid access token",
    "authentication error",
    "invalid request headers",
    "unable to determine zone",
    "error determining zone_id",
    "missing properties in credentials",
];

/// Classify the ACME client's diagnostic output of a failed run.
///
/// This is the only place that knows the upstream wording.
pub fn classify_diagnostic(diagnostic: &str) -> DiagnosticClass {
    let text = diagnostic.to_ascii_lowercase();

    if RATE_LIMIT_MARKERS.iter().any(|m| text.contains(m)) {
        DiagnosticClass::RateLimited
    } else if CREDENTIAL_MARKERS.iter().any(|m| text.contains(m)) {
        DiagnosticClass::CredentialsRejected
    } else {
        DiagnosticClass::ChallengeFailed
    }
}

/// Issues certificates through an [`AcmeCapability`].
#[derive(Clone)]
pub struct IssuanceClient {
    capability: Arc<dyn AcmeCapability>,
    timeout: Duration,
}

impl IssuanceClient {
    pub fn new(capability: Arc<dyn AcmeCapability>, timeout: Duration) -> Self {
        IssuanceClient {
            capability,
            timeout,
        }
    }

    /// Obtain a certificate for `domain` and every name in `san_list`.
    ///
    /// Credentials are checked before anything is invoked. Nothing is written to the deployed
    /// paths; the returned material is validated as a matching pair.
    pub async fn issue(
        &self,
        domain: &str,
        san_list: &[String],
        credentials_path: &Path,
        force: bool,
    ) -> Result<CertificateMaterial, IssuanceError> {
        let credentials = DnsCredentials::load(credentials_path).map_err(|source| {
            let hint = source.hint();
            IssuanceError::CredentialsInvalid { source, hint }
        })?;

        let order = CertificateOrder::new(domain, san_list, force);
        log::info!("Requesting certificate for {}", order.names.join(", "));

        let output = tokio::time::timeout(
            self.timeout,
            self.capability.request_certificate(&order, &credentials),
        )
        .await
        .map_err(|_| IssuanceError::TimedOut(self.timeout))??;

        log::debug!("ACME client output: {}", output.diagnostic);

        if !output.success {
            let diagnostic = summarize(&output.diagnostic);

            return Err(match classify_diagnostic(&output.diagnostic) {
                DiagnosticClass::RateLimited => IssuanceError::RateLimited { diagnostic },
                DiagnosticClass::CredentialsRejected => {
                    IssuanceError::CredentialsRejected { diagnostic }
                }
                DiagnosticClass::ChallengeFailed => IssuanceError::ChallengeFailed { diagnostic },
            });
        }

        let (Some(cert_pem), Some(key_pem)) = (output.cert_pem, output.key_pem) else {
            return Err(IssuanceError::InvalidMaterial(
                "certificate or key missing".to_owned(),
            ));
        };

        CertificateMaterial::parse(key_pem, cert_pem, MaterialOrigin::Acme)
            .map_err(|err| IssuanceError::InvalidMaterial(err.to_string()))
    }
}

/// Last few non-empty lines of the client output, for the operator.
fn summarize(diagnostic: &str) -> String {
    const MAX_LINES: usize = 5;

    let lines = diagnostic
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();

    lines[lines.len().saturating_sub(MAX_LINES)..].join(" | ")
}
