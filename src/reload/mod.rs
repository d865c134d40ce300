//! Making dependent services pick up freshly deployed certificates.
//!
//! Every target is attempted regardless of how the others fared. A failed reload never fails the
//! cycle: the certificate is already on disk and will be read by the next restart anyway.

use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Deserialize;

use crate::error::ErrorKind;

mod supervisor;

pub use self::supervisor::{CommandSupervisor, Supervisor, SupervisorError, SupervisorKind};

/// Default upper bound for a single restart or reload.
pub const DEFAULT_RELOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// How a service picks up a new certificate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadAction {
    #[default]
    Restart,

    /// In-process reload, e.g. SIGHUP.
    Reload,
}

/// A service consuming the certificate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServiceTarget {
    pub name: String,

    #[serde(default)]
    pub action: ReloadAction,

    /// A failed reload of a required service degrades the cycle outcome.
    #[serde(default = "default_required")]
    pub required: bool,

    /// Extra location the service reads its certificate from.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// Extra location the service reads its key from.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ReloadError {
    #[error("{service}: {source}")]
    Supervisor {
        service: String,
        #[source]
        source: SupervisorError,
    },

    #[error("{service}: no response within {}s", timeout.as_secs())]
    TimedOut { service: String, timeout: Duration },
}

impl ReloadError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ReloadFailed
    }
}

/// Outcome for one target.
#[derive(Debug)]
pub struct TargetResult {
    pub name: String,
    pub required: bool,
    pub result: Result<(), ReloadError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Every required target picked up the new certificate.
    Complete,

    /// The certificate is deployed but at least one required target did not reload.
    DegradedSuccess,
}

#[derive(Debug)]
pub struct ReloadReport {
    pub results: Vec<TargetResult>,
    pub outcome: ReloadOutcome,
}

impl ReloadReport {
    pub fn failures(&self) -> impl Iterator<Item = &TargetResult> {
        self.results.iter().filter(|res| res.result.is_err())
    }
}

/// Sequences restarts and reloads through a [`Supervisor`].
#[derive(Clone)]
pub struct ReloadCoordinator {
    supervisor: Arc<dyn Supervisor>,
    timeout: Duration,
}

impl ReloadCoordinator {
    pub fn new(supervisor: Arc<dyn Supervisor>, timeout: Duration) -> Self {
        ReloadCoordinator {
            supervisor,
            timeout,
        }
    }

    /// Reload every target in order, recording each outcome.
    pub async fn reload_all(&self, targets: &[ServiceTarget]) -> ReloadReport {
        let mut results = Vec::with_capacity(targets.len());
        let mut outcome = ReloadOutcome::Complete;

        for target in targets {
            let result = self.reload_one(target).await;

            match &result {
                Ok(()) => log::info!("Reloaded {}", target.name),
                Err(err) if target.required => {
                    log::warn!("Required service did not reload: {err}");
                    outcome = ReloadOutcome::DegradedSuccess;
                }
                Err(err) => log::info!("Optional service did not reload: {err}"),
            }

            results.push(TargetResult {
                name: target.name.clone(),
                required: target.required,
                result,
            });
        }

        ReloadReport { results, outcome }
    }

    async fn reload_one(&self, target: &ServiceTarget) -> Result<(), ReloadError> {
        let name = target.name.as_str();

        let call = async {
            match target.action {
                ReloadAction::Restart => self.supervisor.restart(name).await,
                ReloadAction::Reload => self.supervisor.reload(name).await,
            }
        };

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(ReloadError::Supervisor {
                service: name.to_owned(),
                source,
            }),
            Err(_) => Err(ReloadError::TimedOut {
                service: name.to_owned(),
                timeout: self.timeout,
            }),
        }
    }
}
