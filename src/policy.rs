//! Renew/issue decision policy.

use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    cert::days_until,
    inspect::{CertificateRecord, InspectError},
};

/// Default number of days before expiry at which renewal is mandatory.
pub const DEFAULT_CRITICAL_DAYS: i64 = 7;

/// Default number of days before expiry at which renewal is advised.
pub const DEFAULT_WARN_DAYS: i64 = 30;

/// Default interval between scheduled checks (12 hours).
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Scheduled checks are never more frequent than this (4 hours).
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(4 * 3600);

/// Scheduled checks are never less frequent than this (24 hours).
pub const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// What to do about the deployed certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Action {
    NoAction,

    /// Inside the warning window. Acted on only when renewal was requested by hand.
    RenewSoon,

    /// Inside the critical window, or already expired.
    RenewNow,

    /// Nothing usable is deployed.
    IssueFresh,
}

/// What started a lifecycle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Trigger {
    Timer,
    ManualRenew,
    ManualIssue,
}

impl Action {
    /// Whether this decision leads to issuance for the given trigger.
    pub fn should_act(self, trigger: Trigger) -> bool {
        match self {
            Action::NoAction => false,
            Action::RenewSoon => trigger != Trigger::Timer,
            Action::RenewNow | Action::IssueFresh => true,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::NoAction => "no action",
            Action::RenewSoon => "renew soon",
            Action::RenewNow => "renew now",
            Action::IssueFresh => "issue fresh",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ThresholdError {
    #[error("critical_days must not be negative (got {0})")]
    NegativeCritical(i64),

    #[error("critical_days ({critical}) must not exceed warn_days ({warn})")]
    CriticalAboveWarn { critical: i64, warn: i64 },
}

/// Renewal windows and scheduling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PolicyThresholds {
    pub critical_days: i64,
    pub warn_days: i64,
    #[serde(rename = "check_interval_secs", deserialize_with = "secs::deserialize")]
    pub check_interval: Duration,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            critical_days: DEFAULT_CRITICAL_DAYS,
            warn_days: DEFAULT_WARN_DAYS,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl PolicyThresholds {
    pub fn validate(&self) -> Result<(), ThresholdError> {
        if self.critical_days < 0 {
            return Err(ThresholdError::NegativeCritical(self.critical_days));
        }

        if self.critical_days > self.warn_days {
            return Err(ThresholdError::CriticalAboveWarn {
                critical: self.critical_days,
                warn: self.warn_days,
            });
        }

        Ok(())
    }

    /// The check interval clamped to between 4 and 24 hours.
    pub fn effective_check_interval(&self) -> Duration {
        let clamped = self
            .check_interval
            .clamp(MIN_CHECK_INTERVAL, MAX_CHECK_INTERVAL);

        if clamped != self.check_interval {
            log::warn!(
                "check interval of {}s is outside 4h..24h; using {}s",
                self.check_interval.as_secs(),
                clamped.as_secs()
            );
        }

        clamped
    }
}

/// Decide on an inspection result as of `now`.
///
/// A missing or unreadable certificate always needs a fresh one; there is no partial repair.
pub fn decide(
    inspection: &Result<CertificateRecord, InspectError>,
    now: OffsetDateTime,
    thresholds: &PolicyThresholds,
) -> Action {
    match inspection {
        Ok(record) => decide_days(days_until(record.not_after, now), thresholds),
        Err(_) => Action::IssueFresh,
    }
}

/// Decide on whole days until expiry.
pub fn decide_days(days_until_expiry: i64, thresholds: &PolicyThresholds) -> Action {
    if days_until_expiry <= 0 || days_until_expiry <= thresholds.critical_days {
        Action::RenewNow
    } else if days_until_expiry <= thresholds.warn_days {
        Action::RenewSoon
    } else {
        Action::NoAction
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize as _, Deserializer};

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        u64::deserialize(de).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use time::Duration as TimeDuration;

    use super::*;

    fn thresholds(critical_days: i64, warn_days: i64) -> PolicyThresholds {
        PolicyThresholds {
            critical_days,
            warn_days,
            ..Default::default()
        }
    }

    #[test]
    fn boundaries() {
        let t = thresholds(7, 30);

        assert_eq!(decide_days(-5, &t), Action::RenewNow);
        assert_eq!(decide_days(0, &t), Action::RenewNow);
        assert_eq!(decide_days(1, &t), Action::RenewNow);
        assert_eq!(decide_days(7, &t), Action::RenewNow);
        assert_eq!(decide_days(8, &t), Action::RenewSoon);
        assert_eq!(decide_days(30, &t), Action::RenewSoon);
        assert_eq!(decide_days(31, &t), Action::NoAction);
        assert_eq!(decide_days(89, &t), Action::NoAction);
    }

    #[test]
    fn critical_plus_one_outside_warn_window() {
        let t = thresholds(7, 7);
        assert_eq!(decide_days(8, &t), Action::NoAction);
    }

    #[test]
    fn zero_critical_still_renews_expired() {
        let t = thresholds(0, 30);
        assert_eq!(decide_days(0, &t), Action::RenewNow);
        assert_eq!(decide_days(-1, &t), Action::RenewNow);
        assert_eq!(decide_days(1, &t), Action::RenewSoon);
    }

    #[test]
    fn deterministic() {
        let t = PolicyThresholds::default();
        for days in -100..=400 {
            assert_eq!(decide_days(days, &t), decide_days(days, &t));
        }
    }

    #[test]
    fn inspection_errors_issue_fresh() {
        let t = PolicyThresholds::default();
        let now = OffsetDateTime::now_utc();

        let missing = Err(InspectError::NotFound(PathBuf::from("fullchain.pem")));
        assert_eq!(decide(&missing, now, &t), Action::IssueFresh);

        let corrupt = Err(InspectError::Parse {
            path: PathBuf::from("fullchain.pem"),
            detail: "truncated".to_owned(),
        });
        assert_eq!(decide(&corrupt, now, &t), Action::IssueFresh);
    }

    #[test]
    fn record_five_days_out_renews_now() {
        let now = OffsetDateTime::now_utc();
        let record = CertificateRecord {
            domain: "irc.example.org".to_owned(),
            san_list: Default::default(),
            cert_path: PathBuf::from("fullchain.pem"),
            key_path: PathBuf::from("privkey.pem"),
            not_before: now - TimeDuration::days(85),
            not_after: now + TimeDuration::days(5),
            fingerprint: String::new(),
            issuer: String::new(),
            self_signed: false,
            days_until_expiry: 5,
        };

        assert_eq!(
            decide(&Ok(record), now, &PolicyThresholds::default()),
            Action::RenewNow
        );
    }

    #[test]
    fn renew_soon_acts_only_when_manual() {
        assert!(!Action::RenewSoon.should_act(Trigger::Timer));
        assert!(Action::RenewSoon.should_act(Trigger::ManualRenew));
        assert!(Action::RenewNow.should_act(Trigger::Timer));
        assert!(Action::IssueFresh.should_act(Trigger::Timer));
        assert!(!Action::NoAction.should_act(Trigger::ManualRenew));
    }

    #[test]
    fn validation() {
        assert!(PolicyThresholds::default().validate().is_ok());
        assert_eq!(
            thresholds(-1, 30).validate(),
            Err(ThresholdError::NegativeCritical(-1))
        );
        assert_eq!(
            thresholds(31, 30).validate(),
            Err(ThresholdError::CriticalAboveWarn {
                critical: 31,
                warn: 30
            })
        );
    }

    #[test]
    fn interval_is_clamped() {
        let mut t = PolicyThresholds::default();
        assert_eq!(t.effective_check_interval(), DEFAULT_CHECK_INTERVAL);

        t.check_interval = std::time::Duration::from_secs(60);
        assert_eq!(t.effective_check_interval(), MIN_CHECK_INTERVAL);

        t.check_interval = std::time::Duration::from_secs(7 * 24 * 3600);
        assert_eq!(t.effective_check_interval(), MAX_CHECK_INTERVAL);
    }
}
