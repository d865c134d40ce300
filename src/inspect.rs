//! Read-only inspection of the deployed certificate.

use std::{
    collections::BTreeSet,
    io,
    path::{Path, PathBuf},
};

use der::{oid::AssociatedOid as _, Decode as _};
use serde::Serialize;
use time::OffsetDateTime;
use x509_cert::ext::pkix::{name::GeneralName, SubjectAltName};

use crate::{
    cert::{days_until, fingerprint, split_chain, validity},
    error::ErrorKind,
};

/// One certificate/key pair on disk, as last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateRecord {
    /// Subject CN, or the first DNS name when the subject has none.
    pub domain: String,
    pub san_list: BTreeSet<String>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(with = "time::serde::rfc3339")]
    pub not_before: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub not_after: OffsetDateTime,
    pub fingerprint: String,
    pub issuer: String,
    /// Issuer equals subject. True for the rate-limit fallback.
    pub self_signed: bool,
    /// `floor((not_after - now) / 86400)` at inspection time.
    pub days_until_expiry: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum InspectError {
    #[error("certificate not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("certificate at {} is not usable: {detail}", path.display())]
    Parse { path: PathBuf, detail: String },

    #[error("certificate at {} is not readable: {source}", path.display())]
    Unreadable { path: PathBuf, source: io::Error },
}

impl InspectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InspectError::NotFound(_) => ErrorKind::NotFound,
            InspectError::Parse { .. } => ErrorKind::CertificateParseError,
            InspectError::Unreadable { .. } => ErrorKind::IoError,
        }
    }
}

/// Inspect the certificate at `cert_path` against the wall clock.
pub fn inspect(cert_path: &Path, key_path: &Path) -> Result<CertificateRecord, InspectError> {
    inspect_at(cert_path, key_path, OffsetDateTime::now_utc())
}

/// Inspect the leaf certificate at `cert_path` as of `now`.
///
/// `key_path` is recorded, not opened. Never writes.
pub fn inspect_at(
    cert_path: &Path,
    key_path: &Path,
    now: OffsetDateTime,
) -> Result<CertificateRecord, InspectError> {
    let pem = match std::fs::read_to_string(cert_path) {
        Ok(pem) => pem,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(InspectError::NotFound(cert_path.to_owned()))
        }
        // binary garbage in place of a PEM file
        Err(err) if err.kind() == io::ErrorKind::InvalidData => {
            return Err(parse_error(cert_path, err))
        }
        Err(source) => {
            return Err(InspectError::Unreadable {
                path: cert_path.to_owned(),
                source,
            })
        }
    };

    let chain = split_chain(&pem).map_err(|err| parse_error(cert_path, err))?;
    let leaf_der = chain
        .first()
        .ok_or_else(|| parse_error(cert_path, "no certificates in file"))?;
    let leaf =
        x509_cert::Certificate::from_der(leaf_der).map_err(|err| parse_error(cert_path, err))?;

    let (not_before, not_after) = validity(&leaf).map_err(|err| parse_error(cert_path, err))?;
    let san_list = dns_names(&leaf).map_err(|err| parse_error(cert_path, err))?;

    let tbs = &leaf.tbs_certificate;
    let subject = tbs.subject.to_string();
    let issuer = tbs.issuer.to_string();

    let domain = common_name(&subject)
        .or_else(|| san_list.iter().next().cloned())
        .unwrap_or_default();

    Ok(CertificateRecord {
        domain,
        san_list,
        cert_path: cert_path.to_owned(),
        key_path: key_path.to_owned(),
        not_before,
        not_after,
        fingerprint: fingerprint(leaf_der),
        self_signed: tbs.subject == tbs.issuer,
        issuer,
        days_until_expiry: days_until(not_after, now),
    })
}

fn parse_error(path: &Path, detail: impl ToString) -> InspectError {
    InspectError::Parse {
        path: path.to_owned(),
        detail: detail.to_string(),
    }
}

fn dns_names(cert: &x509_cert::Certificate) -> der::Result<BTreeSet<String>> {
    let mut names = BTreeSet::new();

    let Some(extensions) = &cert.tbs_certificate.extensions else {
        return Ok(names);
    };

    for ext in extensions {
        if ext.extn_id != SubjectAltName::OID {
            continue;
        }

        let san = SubjectAltName::from_der(ext.extn_value.as_bytes())?;
        for name in san.0 {
            if let GeneralName::DnsName(dns) = name {
                names.insert(dns.to_string());
            }
        }
    }

    Ok(names)
}

/// Picks `CN=...` out of an RFC 4514 rendering of a name.
fn common_name(rfc4514: &str) -> Option<String> {
    rfc4514
        .split([',', '+'])
        .map(str::trim)
        .find_map(|rdn| rdn.strip_prefix("CN="))
        .map(ToOwned::to_owned)
}
