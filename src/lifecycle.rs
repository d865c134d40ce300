//! The supervisory loop tying inspection, policy, issuance, deployment and reload together.
//!
//! A cycle runs the stages strictly in order and each stage only starts when the previous one
//! committed. Cycles that write are serialized by one lock shared by the timer and the manual
//! commands. Read-only commands never take it.

use std::{fmt, future::Future, io, path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::{task::JoinSet, time::MissedTickBehavior};

use crate::{
    attempt::{Attempt, AttemptOutcome, RenewalAttempt},
    cert::CertificateMaterial,
    deploy::{DeployTarget, DeploymentError, DeploymentManager},
    error::ErrorKind,
    fallback::{generate_fallback, FallbackError},
    inspect::{inspect_at, CertificateRecord, InspectError},
    issue::{IssuanceClient, IssuanceError},
    policy::{decide, Action, PolicyThresholds, Trigger},
    reload::{ReloadCoordinator, ReloadOutcome, ReloadReport, ServiceTarget},
};

/// Where a cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Idle,
    Checking,
    Issuing,
    FallbackGenerating,
    Deploying,
    Reloading,
}

/// What one certificate covers and where it lives.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub domain: String,

    /// Extra names, wildcard included when configured.
    pub san_list: Vec<String>,

    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub credentials_path: PathBuf,
    pub thresholds: PolicyThresholds,
    pub fallback_validity_days: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    #[error(transparent)]
    Fallback(#[from] FallbackError),

    #[error(transparent)]
    Deployment(#[from] DeploymentError),
}

impl CycleError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CycleError::Issuance(err) => err.kind(),
            CycleError::Fallback(_) => ErrorKind::IoError,
            CycleError::Deployment(err) => err.kind(),
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            CycleError::Issuance(err) => err.hint(),
            _ => self.kind().remediation().map(ToOwned::to_owned),
        }
    }
}

#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing deployed: policy saw nothing to do, or the CA returned the deployed certificate.
    NoAction(Action),

    /// Inside the warning window on a timer tick; logged, left for a later tick or a manual renew.
    Deferred(i64),

    /// A CA-issued certificate is deployed.
    Renewed { valid_days: i64, reload: ReloadReport },

    /// The CA rate limited us and a self-signed certificate is deployed.
    Fallback { reload: ReloadReport },

    Failed(CycleError),
}

#[derive(Debug)]
pub struct CycleReport {
    pub action: Action,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    /// Process exit code for the `issue` and `renew` commands.
    pub fn exit_code(&self) -> u8 {
        match self.outcome {
            CycleOutcome::NoAction(_)
            | CycleOutcome::Deferred(_)
            | CycleOutcome::Renewed { .. } => 0,
            CycleOutcome::Fallback { .. } => 2,
            CycleOutcome::Failed(_) => 1,
        }
    }
}

/// Result of a side-effect free check.
#[derive(Debug)]
pub struct CheckReport {
    pub inspection: Result<CertificateRecord, InspectError>,
    pub action: Action,
}

impl CheckReport {
    /// Whole days left, when a certificate could be read.
    pub fn days_left(&self) -> Option<i64> {
        self.inspection.as_ref().ok().map(|rec| rec.days_until_expiry)
    }

    /// Process exit code for the `check` command.
    pub fn exit_code(&self) -> u8 {
        match self.action {
            Action::NoAction => 0,
            _ => 1,
        }
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inspection {
            Ok(rec) => {
                let verdict = match self.action {
                    Action::NoAction => "VALID",
                    Action::RenewSoon => "RENEW SOON",
                    Action::RenewNow if rec.days_until_expiry <= 0 => "EXPIRED",
                    Action::RenewNow | Action::IssueFresh => "RENEW NOW",
                };
                write!(
                    f,
                    "{verdict}: {} expires in {} days ({})",
                    rec.domain, rec.days_until_expiry, self.action
                )?;
                if rec.self_signed {
                    f.write_str(" [self-signed]")?;
                }
                Ok(())
            }
            Err(err) => write!(f, "MISSING: {err} ({}, {})", err.kind(), self.action),
        }
    }
}

/// Human-readable report for the `status` command.
#[derive(Debug)]
pub struct StatusReport {
    pub check: CheckReport,
    pub state: CycleState,
    pub last_attempt: Option<RenewalAttempt>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.check)?;

        if let Ok(rec) = &self.check.inspection {
            writeln!(f, "  certificate: {}", rec.cert_path.display())?;
            writeln!(f, "  key:         {}", rec.key_path.display())?;
            writeln!(
                f,
                "  names:       {}",
                rec.san_list.iter().cloned().collect::<Vec<_>>().join(", ")
            )?;
            writeln!(f, "  issuer:      {}", rec.issuer)?;
            writeln!(f, "  not before:  {}", rec.not_before)?;
            writeln!(f, "  not after:   {}", rec.not_after)?;
            writeln!(f, "  sha256:      {}", rec.fingerprint)?;
        }

        writeln!(f, "  cycle:       {:?}", self.state)?;

        if let Some(attempt) = &self.last_attempt {
            writeln!(
                f,
                "  last attempt: {:?} at {} ({})",
                attempt.outcome, attempt.finished_at, attempt.detail
            )?;
        }

        Ok(())
    }
}

/// Resets the observable state to [`CycleState::Idle`] however a cycle ends.
struct StateGuard<'a>(&'a Mutex<CycleState>);

impl<'a> StateGuard<'a> {
    fn enter(state: &'a Mutex<CycleState>) -> Self {
        let guard = StateGuard(state);
        guard.set(CycleState::Checking);
        guard
    }

    fn set(&self, next: CycleState) {
        let mut state = self.0.lock();
        log::debug!("cycle state {:?} -> {next:?}", *state);
        *state = next;
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = CycleState::Idle;
    }
}

/// Long-lived certificate lifecycle for one domain.
pub struct Lifecycle {
    settings: LifecycleSettings,
    issuer: IssuanceClient,
    deployer: DeploymentManager,
    reloader: ReloadCoordinator,
    targets: Vec<ServiceTarget>,

    write_lock: tokio::sync::Mutex<()>,
    state: Mutex<CycleState>,
    last_attempt: Mutex<Option<RenewalAttempt>>,
}

impl Lifecycle {
    pub fn new(
        settings: LifecycleSettings,
        issuer: IssuanceClient,
        deployer: DeploymentManager,
        reloader: ReloadCoordinator,
        targets: Vec<ServiceTarget>,
    ) -> Self {
        Lifecycle {
            settings,
            issuer,
            deployer,
            reloader,
            targets,
            write_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(CycleState::Idle),
            last_attempt: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn state(&self) -> CycleState {
        *self.state.lock()
    }

    pub fn last_attempt(&self) -> Option<RenewalAttempt> {
        self.last_attempt.lock().clone()
    }

    /// Inspect and decide without side effects.
    pub fn check(&self) -> CheckReport {
        self.check_at(OffsetDateTime::now_utc())
    }

    pub fn check_at(&self, now: OffsetDateTime) -> CheckReport {
        let inspection = inspect_at(&self.settings.cert_path, &self.settings.key_path, now);
        let action = decide(&inspection, now, &self.settings.thresholds);

        CheckReport { inspection, action }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            check: self.check(),
            state: self.state(),
            last_attempt: self.last_attempt(),
        }
    }

    /// Policy driven run; waits for a running cycle to finish first.
    pub async fn renew(&self) -> CycleReport {
        let _lock = self.write_lock.lock().await;
        self.cycle(Trigger::ManualRenew).await
    }

    /// Issue a new certificate regardless of policy; waits for a running cycle to finish first.
    pub async fn issue(&self) -> CycleReport {
        let _lock = self.write_lock.lock().await;
        self.cycle(Trigger::ManualIssue).await
    }

    /// Scheduled run. Returns `None` when another cycle holds the lock.
    pub async fn tick(&self) -> Option<CycleReport> {
        let Ok(_lock) = self.write_lock.try_lock() else {
            log::info!("Scheduled check skipped, a cycle is already running");
            return None;
        };

        Some(self.cycle(Trigger::Timer).await)
    }

    /// Run scheduled checks until `shutdown` resolves or a termination signal arrives.
    ///
    /// SIGUSR1 requests a manual renew. A cycle in flight at shutdown is allowed to finish.
    pub async fn run(self: Arc<Self>, shutdown: impl Future<Output = ()>) -> io::Result<()> {
        let period = self.settings.thresholds.effective_check_interval();
        log::info!(
            "Watching certificate for {} every {}s",
            self.settings.domain,
            period.as_secs()
        );

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut signals = Signals::new()?;
        let mut cycles = JoinSet::new();

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let this = Arc::clone(&self);
                    cycles.spawn(async move {
                        let _ = this.tick().await;
                    });
                }

                signal = signals.recv() => match signal {
                    Signal::Renew => {
                        log::info!("Renewal requested by signal");
                        let this = Arc::clone(&self);
                        cycles.spawn(async move {
                            let _ = this.renew().await;
                        });
                    }
                    Signal::Shutdown => break,
                },

                () = &mut shutdown => break,

                Some(res) = cycles.join_next(), if !cycles.is_empty() => {
                    if let Err(err) = res {
                        log::error!("lifecycle task failed: {err}");
                    }
                }
            }
        }

        if !cycles.is_empty() {
            log::info!("Waiting for the running cycle to finish");
        }
        while cycles.join_next().await.is_some() {}

        log::info!("Shut down");
        Ok(())
    }

    async fn cycle(&self, trigger: Trigger) -> CycleReport {
        let state = StateGuard::enter(&self.state);

        let check = self.check();
        let action = match trigger {
            Trigger::ManualIssue => Action::IssueFresh,
            _ => check.action,
        };

        if let Err(err) = &check.inspection {
            log::info!("{err}");
        }

        // the fallback is not sticky: real issuance is retried until it succeeds
        let fallback_live = matches!(&check.inspection, Ok(rec) if rec.self_signed);

        if !action.should_act(trigger) && !fallback_live {
            let outcome = match (action, check.days_left()) {
                (Action::RenewSoon, Some(days)) => {
                    log::info!(
                        "Certificate for {} expires in {days} days; renewal advised",
                        self.settings.domain
                    );
                    CycleOutcome::Deferred(days)
                }
                _ => {
                    log::debug!("Certificate for {} needs no action", self.settings.domain);
                    CycleOutcome::NoAction(action)
                }
            };

            return CycleReport { action, outcome };
        }

        if fallback_live && !action.should_act(trigger) {
            log::warn!(
                "Self-signed fallback certificate for {} is live; retrying issuance",
                self.settings.domain
            );
        } else {
            log::info!("Certificate for {}: {action}", self.settings.domain);
        }

        state.set(CycleState::Issuing);
        let attempt = Attempt::begin(&self.settings.domain);

        // whenever policy asked for a new certificate, the ACME client must not keep the old one
        let force = action.should_act(trigger);

        let issued = self
            .issuer
            .issue(
                &self.settings.domain,
                &self.settings.san_list,
                &self.settings.credentials_path,
                force,
            )
            .await;

        let already_deployed = |material: &CertificateMaterial| {
            matches!(&check.inspection, Ok(rec) if rec.fingerprint == material.fingerprint())
        };

        let material = match issued {
            Ok(material) if already_deployed(&material) => {
                self.record(attempt.finish(
                    AttemptOutcome::Success,
                    "certificate authority returned the deployed certificate",
                ));
                log::info!(
                    "Deployed certificate for {} is already the current one",
                    self.settings.domain
                );

                return CycleReport {
                    action,
                    outcome: CycleOutcome::NoAction(action),
                };
            }

            Ok(material) => {
                self.record(attempt.finish(AttemptOutcome::Success, "certificate issued"));
                material
            }

            Err(err @ IssuanceError::RateLimited { .. }) => {
                self.record(attempt.finish(AttemptOutcome::RateLimited, err.to_string()));
                log::warn!("{err}");

                // a self-signed certificate only stands in for one that is missing or expiring
                if !matches!(check.action, Action::RenewNow | Action::IssueFresh) {
                    log::warn!(
                        "Keeping the deployed {}certificate for {}",
                        if fallback_live { "self-signed " } else { "" },
                        self.settings.domain
                    );

                    return CycleReport {
                        action,
                        outcome: CycleOutcome::Failed(err.into()),
                    };
                }

                state.set(CycleState::FallbackGenerating);
                let fallback = generate_fallback(
                    &self.settings.domain,
                    &self.settings.san_list,
                    self.settings.fallback_validity_days,
                );

                let outcome = match fallback {
                    Ok(material) => match self.deploy_and_reload(&state, &material).await {
                        Ok(reload) => {
                            log::warn!("WARNING: running on self-signed fallback certificate");
                            CycleOutcome::Fallback { reload }
                        }
                        Err(err) => CycleOutcome::Failed(err),
                    },
                    Err(err) => {
                        log::error!("{err}");
                        CycleOutcome::Failed(err.into())
                    }
                };

                return CycleReport { action, outcome };
            }

            Err(err) => {
                self.record(attempt.finish(err.kind().into(), err.to_string()));
                log::error!("{err}");

                return CycleReport {
                    action,
                    outcome: CycleOutcome::Failed(err.into()),
                };
            }
        };

        let valid_days = material.valid_days_left(OffsetDateTime::now_utc());

        let outcome = match self.deploy_and_reload(&state, &material).await {
            Ok(reload) => {
                log::info!("Certificate renewed, valid {valid_days} days.");
                CycleOutcome::Renewed { valid_days, reload }
            }
            Err(err) => CycleOutcome::Failed(err),
        };

        CycleReport { action, outcome }
    }

    async fn deploy_and_reload(
        &self,
        state: &StateGuard<'_>,
        material: &CertificateMaterial,
    ) -> Result<ReloadReport, CycleError> {
        state.set(CycleState::Deploying);

        if let Err(err) = self.deployer.deploy_all(material, &self.deploy_targets()) {
            log::error!("{err}; previous certificate left in place");
            return Err(err.into());
        }

        state.set(CycleState::Reloading);
        let reload = self.reloader.reload_all(&self.targets).await;

        if reload.outcome == ReloadOutcome::DegradedSuccess {
            log::warn!("Certificate deployed but not every required service picked it up");
        }

        Ok(reload)
    }

    /// The primary pair first, then every service-specific pair.
    fn deploy_targets(&self) -> Vec<DeployTarget> {
        let primary = DeployTarget {
            cert_path: self.settings.cert_path.clone(),
            key_path: self.settings.key_path.clone(),
        };

        let services = self.targets.iter().filter_map(|target| {
            Some(DeployTarget {
                cert_path: target.cert_path.clone()?,
                key_path: target.key_path.clone()?,
            })
        });

        std::iter::once(primary).chain(services).collect()
    }

    fn record(&self, attempt: RenewalAttempt) {
        *self.last_attempt.lock() = Some(attempt);
    }
}

enum Signal {
    Renew,
    Shutdown,
}

#[cfg(unix)]
struct Signals {
    usr1: tokio::signal::unix::Signal,
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Signals {
            usr1: signal(SignalKind::user_defined1())?,
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
        })
    }

    async fn recv(&mut self) -> Signal {
        tokio::select! {
            Some(()) = self.usr1.recv() => Signal::Renew,
            Some(()) = self.term.recv() => Signal::Shutdown,
            Some(()) = self.int.recv() => Signal::Shutdown,
            else => Signal::Shutdown,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> io::Result<Self> {
        Ok(Signals)
    }

    async fn recv(&mut self) -> Signal {
        let _ = tokio::signal::ctrl_c().await;
        Signal::Shutdown
    }
}
