use std::fmt;

use serde::Serialize;

/// The classified failure kinds an operator sees.
///
/// Every component error maps onto one of these through its `kind()` method; the CLI prints the
/// kind and its remediation hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    NotFound,
    CertificateParseError,
    CredentialsInvalid,
    ChallengeFailed,
    RateLimited,
    DeploymentError,
    ReloadFailed,
    IoError,
}

impl ErrorKind {
    /// What an operator can do about it, if anything.
    pub fn remediation(self) -> Option<&'static str> {
        match self {
            ErrorKind::NotFound | ErrorKind::CertificateParseError => {
                Some("run `certwarden issue` to obtain a fresh certificate")
            }
            ErrorKind::CredentialsInvalid => {
                Some("check the DNS provider credentials file and the API token's zone permissions")
            }
            ErrorKind::ChallengeFailed => Some(
                "check that the DNS zone is managed by the configured provider and retry; \
                 the certbot logs under the work directory have details",
            ),
            ErrorKind::RateLimited => Some(
                "the certificate authority is rate limiting this account; a self-signed \
                 certificate is served until the next successful issuance",
            ),
            ErrorKind::DeploymentError => {
                Some("check ownership and free space of the certificate directories")
            }
            ErrorKind::ReloadFailed => {
                Some("restart the affected services manually so they pick up the new certificate")
            }
            ErrorKind::IoError => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "NotFound",
            ErrorKind::CertificateParseError => "CertificateParseError",
            ErrorKind::CredentialsInvalid => "CredentialsInvalid",
            ErrorKind::ChallengeFailed => "ChallengeFailed",
            ErrorKind::RateLimited => "RateLimited",
            ErrorKind::DeploymentError => "DeploymentError",
            ErrorKind::ReloadFailed => "ReloadFailed",
            ErrorKind::IoError => "IOError",
        };
        f.write_str(name)
    }
}
