//! Self-signed certificate for when the certificate authority is rate limiting us.
//!
//! Services configured for TLS refuse to start without a certificate, and an expired one breaks
//! every client. A self-signed certificate keeps them up; clients that verify the chain will
//! complain, which is why generating one is logged loudly.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use time::{Duration, OffsetDateTime};
use zeroize::Zeroizing;

use crate::cert::{CertificateMaterial, MaterialError, MaterialOrigin};

/// Validity of a fallback certificate unless configured otherwise.
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("could not generate self-signed certificate: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("generated self-signed certificate is unusable: {0}")]
    Material(#[from] MaterialError),
}

/// Generate a P-256 self-signed certificate for `domain` and `san_list`.
pub fn generate_fallback(
    domain: &str,
    san_list: &[String],
    validity_days: u32,
) -> Result<CertificateMaterial, FallbackError> {
    let mut names = vec![domain.to_owned()];
    names.extend(san_list.iter().filter(|name| *name != domain).cloned());

    let mut params = CertificateParams::new(names)?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    dn.push(DnType::OrganizationName, "certwarden fallback");
    params.distinguished_name = dn;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(60);
    params.not_after = now + Duration::days(i64::from(validity_days));

    let key_pair = KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    log::warn!(
        "Generated self-signed fallback certificate for {domain}, valid {validity_days} days; \
         clients will not trust it"
    );

    let material = CertificateMaterial::parse(
        Zeroizing::new(key_pair.serialize_pem()),
        cert.pem(),
        MaterialOrigin::SelfSigned,
    )?;

    Ok(material)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::inspect_at;

    #[test]
    fn generates_usable_pair() {
        let sans = vec!["*.irc.example.org".to_owned(), "irc.example.org".to_owned()];
        let material = generate_fallback("irc.example.org", &sans, DEFAULT_VALIDITY_DAYS).unwrap();

        assert_eq!(material.origin(), MaterialOrigin::SelfSigned);

        let now = OffsetDateTime::now_utc();
        let days = material.valid_days_left(now);
        assert!((364..=365).contains(&days), "{days}");
    }

    #[test]
    fn covers_domain_and_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("fullchain.pem");

        let sans = vec!["*.irc.example.org".to_owned()];
        let material = generate_fallback("irc.example.org", &sans, 30).unwrap();
        std::fs::write(&cert_path, material.certificate()).unwrap();

        let record = inspect_at(
            &cert_path,
            &dir.path().join("privkey.pem"),
            OffsetDateTime::now_utc(),
        )
        .unwrap();

        assert_eq!(record.domain, "irc.example.org");
        assert!(record.self_signed);
        assert!(record.san_list.contains("*.irc.example.org"));
        assert!(record.san_list.contains("irc.example.org"));
        assert_eq!(record.days_until_expiry, 29);
    }
}
