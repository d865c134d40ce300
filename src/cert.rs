use std::{
    fmt::Write as _,
    io::{BufReader, Cursor},
};

use der::{
    time::{OffsetDateTime, PrimitiveDateTime},
    Decode as _,
};
use pkcs8::DecodePrivateKey as _;
use serde::Serialize;
use sha2::{Digest as _, Sha256};
use zeroize::Zeroizing;

const SECONDS_PER_DAY: i64 = 86_400;

/// Where a certificate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MaterialOrigin {
    /// Issued by the certificate authority through the ACME capability.
    Acme,

    /// Generated locally because the certificate authority rate limited us.
    SelfSigned,
}

/// Reasons a certificate/key pair is not usable.
#[derive(Debug, thiserror::Error)]
pub enum MaterialError {
    #[error("no certificates in chain")]
    EmptyChain,

    #[error("certificate chain is not valid PEM: {0}")]
    Pem(#[from] std::io::Error),

    #[error("leaf certificate does not decode: {0}")]
    Certificate(der::Error),

    #[error("certificate validity is not representable: {0}")]
    Validity(der::Error),

    #[error("private key is not a PKCS#8 P-256 key: {0}")]
    PrivateKey(pkcs8::Error),

    #[error("private key does not match the certificate public key")]
    KeyMismatch,
}

/// Encapsulated certificate chain and private key, not yet written anywhere.
///
/// Both the issuance path and the self-signed fallback produce one of these; only the deployment
/// manager turns it into files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub(crate) private_key_pem: Zeroizing<String>,
    pub(crate) certificate: String,
    pub(crate) not_before: OffsetDateTime,
    pub(crate) not_after: OffsetDateTime,
    pub(crate) origin: MaterialOrigin,
    pub(crate) fingerprint: String,
}

impl CertificateMaterial {
    /// Validates a PEM chain and PEM private key as a deployable pair.
    ///
    /// The first certificate of the chain is the leaf. The key must be a PKCS#8 P-256 key whose
    /// public point is the one in the leaf's SubjectPublicKeyInfo.
    pub fn parse(
        private_key_pem: Zeroizing<String>,
        certificate: String,
        origin: MaterialOrigin,
    ) -> Result<Self, MaterialError> {
        let chain = split_chain(&certificate)?;
        let leaf_der = chain.first().ok_or(MaterialError::EmptyChain)?;
        let leaf =
            x509_cert::Certificate::from_der(leaf_der).map_err(MaterialError::Certificate)?;

        let signing_key = ecdsa::SigningKey::<p256::NistP256>::from_pkcs8_pem(&private_key_pem)
            .map_err(MaterialError::PrivateKey)?;

        let point = signing_key.verifying_key().to_encoded_point(false);
        let spki = &leaf.tbs_certificate.subject_public_key_info;
        if spki.subject_public_key.raw_bytes() != point.as_bytes() {
            return Err(MaterialError::KeyMismatch);
        }

        let (not_before, not_after) = validity(&leaf)?;

        Ok(CertificateMaterial {
            private_key_pem,
            certificate,
            not_before,
            not_after,
            origin,
            fingerprint: fingerprint(leaf_der),
        })
    }

    /// The private key in PEM format.
    pub fn private_key(&self) -> &str {
        &self.private_key_pem
    }

    /// The certificate chain in PEM format.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    /// SHA-256 fingerprint of the leaf, in the same format as
    /// [`CertificateRecord::fingerprint`](crate::inspect::CertificateRecord::fingerprint).
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn origin(&self) -> MaterialOrigin {
        self.origin
    }

    /// Whole days of validity left at `now`. Negative for an expired certificate.
    pub fn valid_days_left(&self, now: OffsetDateTime) -> i64 {
        days_until(self.not_after, now)
    }
}

/// Splits a PEM bundle into DER certificates, ignoring any non-certificate sections.
pub(crate) fn split_chain(pem: &str) -> Result<Vec<Vec<u8>>, MaterialError> {
    let mut rdr = BufReader::new(Cursor::new(pem));

    rustls_pemfile::certs(&mut rdr)
        .map(|res| res.map(|cert| cert.to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(Into::into)
}

/// The validity window of a certificate as UTC timestamps.
pub(crate) fn validity(
    cert: &x509_cert::Certificate,
) -> Result<(OffsetDateTime, OffsetDateTime), MaterialError> {
    let validity = &cert.tbs_certificate.validity;
    let not_before = PrimitiveDateTime::try_from(validity.not_before.to_date_time())
        .map_err(MaterialError::Validity)?;
    let not_after = PrimitiveDateTime::try_from(validity.not_after.to_date_time())
        .map_err(MaterialError::Validity)?;

    // X.509 UTCTime and GeneralizedTime are both Zulu
    Ok((not_before.assume_utc(), not_after.assume_utc()))
}

/// Whole days between `now` and `not_after`, rounded towards negative infinity.
///
/// A certificate expiring in 23 hours has 0 days left; one that expired an hour ago has -1.
pub fn days_until(not_after: OffsetDateTime, now: OffsetDateTime) -> i64 {
    (not_after - now).whole_seconds().div_euclid(SECONDS_PER_DAY)
}

/// SHA-256 over the DER encoding, as colon separated upper-case hex.
pub fn fingerprint(der: &[u8]) -> String {
    let digest = Sha256::digest(der);

    let mut out = String::with_capacity(digest.len() * 3);
    for (i, byte) in digest.iter().enumerate() {
        if i > 0 {
            out.push(':');
        }
        let _ = write!(out, "{byte:02X}");
    }
    out
}
