//! Audit trail of issuance attempts.
//!
//! Attempts are appended to the log, one JSON object per line, and are never read back for
//! decisions.

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::ErrorKind;

/// Log target of the audit trail, for routing with `RUST_LOG`.
pub const AUDIT_TARGET: &str = "certwarden::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttemptOutcome {
    Success,
    RateLimited,
    ChallengeFailed,
    CredentialsInvalid,
    #[serde(rename = "IOError")]
    IoError,
}

impl From<ErrorKind> for AttemptOutcome {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::RateLimited => AttemptOutcome::RateLimited,
            ErrorKind::ChallengeFailed => AttemptOutcome::ChallengeFailed,
            ErrorKind::CredentialsInvalid => AttemptOutcome::CredentialsInvalid,
            _ => AttemptOutcome::IoError,
        }
    }
}

/// One finished issuance or fallback attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenewalAttempt {
    pub domain: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub outcome: AttemptOutcome,
    pub detail: String,
}

/// An attempt in progress.
#[derive(Debug)]
#[must_use]
pub struct Attempt {
    domain: String,
    started_at: OffsetDateTime,
}

impl Attempt {
    pub fn begin(domain: &str) -> Self {
        Attempt {
            domain: domain.to_owned(),
            started_at: OffsetDateTime::now_utc(),
        }
    }

    /// Seal the attempt and write it to the audit log.
    pub fn finish(self, outcome: AttemptOutcome, detail: impl Into<String>) -> RenewalAttempt {
        let attempt = RenewalAttempt {
            domain: self.domain,
            started_at: self.started_at,
            finished_at: OffsetDateTime::now_utc(),
            outcome,
            detail: detail.into(),
        };

        match serde_json::to_string(&attempt) {
            Ok(line) => log::info!(target: AUDIT_TARGET, "{line}"),
            Err(err) => log::warn!(target: AUDIT_TARGET, "unserializable attempt record: {err}"),
        }

        attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_from_kind() {
        assert_eq!(
            AttemptOutcome::from(ErrorKind::RateLimited),
            AttemptOutcome::RateLimited
        );
        assert_eq!(
            AttemptOutcome::from(ErrorKind::DeploymentError),
            AttemptOutcome::IoError
        );
    }

    #[test]
    fn serializes_as_one_line() {
        let attempt = Attempt::begin("irc.example.org").finish(
            AttemptOutcome::IoError,
            "ACME client did not finish within 600s",
        );

        assert!(attempt.finished_at >= attempt.started_at);

        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["outcome"], "IOError");
        assert_eq!(json["domain"], "irc.example.org");
        assert!(json["started_at"].as_str().unwrap().ends_with('Z'));
        assert!(!serde_json::to_string(&attempt).unwrap().contains('\n'));
    }
}
