//! YAML configuration file.
//!
//! ```yaml
//! domain: irc.example.org
//! email: admin@example.org
//! san: [irc2.example.org]
//! thresholds:
//!   critical_days: 7
//!   warn_days: 30
//! supervisor:
//!   kind: compose
//!   compose_file: docker-compose.yml
//! targets:
//!   - name: unrealircd
//!     action: reload
//!   - name: thelounge
//!     required: false
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::Deserialize;

use crate::{
    deploy::{DeploySettings, DeploymentManager},
    fallback::DEFAULT_VALIDITY_DAYS,
    issue::{CertbotDns01, CertbotSettings, IssuanceClient, DEFAULT_ISSUANCE_TIMEOUT},
    lifecycle::{Lifecycle, LifecycleSettings},
    policy::{PolicyThresholds, ThresholdError},
    reload::{
        CommandSupervisor, ReloadCoordinator, ServiceTarget, SupervisorKind,
        DEFAULT_RELOAD_TIMEOUT,
    },
};

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "certwarden.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("config file {} is not readable: {source}", path.display())]
    Unreadable { path: PathBuf, source: io::Error },

    #[error("config file {} is malformed: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid thresholds: {0}")]
    Thresholds(#[from] ThresholdError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IssuanceConfig {
    /// certbot executable.
    pub certbot: PathBuf,
    pub work_dir: PathBuf,
    pub propagation_seconds: u32,
    pub timeout_secs: u64,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        IssuanceConfig {
            certbot: PathBuf::from("certbot"),
            work_dir: PathBuf::from("data/certbot"),
            propagation_seconds: 60,
            timeout_secs: DEFAULT_ISSUANCE_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    pub validity_days: u32,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        FallbackConfig {
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub domain: String,

    /// Extra subject alternative names.
    #[serde(default)]
    pub san: Vec<String>,

    /// Also request `*.<domain>`.
    #[serde(default = "default_true")]
    pub include_wildcard: bool,

    pub email: String,

    #[serde(default)]
    pub staging: bool,

    /// Defaults to `data/letsencrypt/live/<domain>/fullchain.pem`.
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// Defaults to `data/letsencrypt/live/<domain>/privkey.pem`.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    #[serde(default = "default_credentials_file")]
    pub credentials_file: PathBuf,

    #[serde(default)]
    pub thresholds: PolicyThresholds,

    #[serde(default)]
    pub issuance: IssuanceConfig,

    #[serde(default)]
    pub fallback: FallbackConfig,

    #[serde(default)]
    pub deploy: DeploySettings,

    #[serde(default)]
    pub supervisor: SupervisorKind,

    #[serde(default = "default_reload_timeout_secs")]
    pub reload_timeout_secs: u64,

    #[serde(default)]
    pub targets: Vec<ServiceTarget>,
}

fn default_true() -> bool {
    true
}

fn default_credentials_file() -> PathBuf {
    PathBuf::from("cloudflare-credentials.ini")
}

fn default_reload_timeout_secs() -> u64 {
    DEFAULT_RELOAD_TIMEOUT.as_secs()
}

impl Config {
    /// Read, resolve and validate the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_owned()))
            }
            Err(source) => {
                return Err(ConfigError::Unreadable {
                    path: path.to_owned(),
                    source,
                })
            }
        };

        let mut config = Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })?;

        config.validate()?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);

        log::debug!("Loaded configuration from {}", path.display());

        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let domain = self.domain.trim();

        if domain.is_empty() || !domain.contains('.') {
            return Err(ConfigError::Invalid(format!(
                "domain `{}` is not a fully qualified name",
                self.domain
            )));
        }

        if domain.starts_with("*.")
            || domain.contains(|c: char| c == '/' || c.is_whitespace())
        {
            return Err(ConfigError::Invalid(format!(
                "domain `{}` must be a plain host name; wildcards go in `include_wildcard`",
                self.domain
            )));
        }

        if !self.email.contains('@') {
            return Err(ConfigError::Invalid(format!(
                "email `{}` is not an email address",
                self.email
            )));
        }

        self.thresholds.validate()?;

        if self.fallback.validity_days == 0 {
            return Err(ConfigError::Invalid(
                "fallback.validity_days must be at least 1".to_owned(),
            ));
        }

        if self.issuance.timeout_secs == 0 || self.reload_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be at least 1s".to_owned()));
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return Err(ConfigError::Invalid("target with empty name".to_owned()));
            }

            if !seen.insert(target.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "target `{}` listed twice",
                    target.name
                )));
            }

            if target.cert_path.is_some() != target.key_path.is_some() {
                return Err(ConfigError::Invalid(format!(
                    "target `{}` needs both cert_path and key_path, or neither",
                    target.name
                )));
            }
        }

        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let mut cert_path = self.live_cert_path();
        resolve(base, &mut cert_path);
        self.cert_path = Some(cert_path);

        let mut key_path = self.live_key_path();
        resolve(base, &mut key_path);
        self.key_path = Some(key_path);

        resolve(base, &mut self.credentials_file);
        resolve(base, &mut self.issuance.work_dir);

        // a bare program name is looked up on PATH
        if self.issuance.certbot.components().count() > 1 {
            resolve(base, &mut self.issuance.certbot);
        }

        if let SupervisorKind::Compose { file } = &mut self.supervisor {
            resolve(base, file);
        }

        for target in &mut self.targets {
            if let Some(path) = &mut target.cert_path {
                resolve(base, path);
            }
            if let Some(path) = &mut target.key_path {
                resolve(base, path);
            }
        }
    }

    /// Primary domain excluded, wildcard included when configured, de-duplicated.
    pub fn san_list(&self) -> Vec<String> {
        let wildcard = self
            .include_wildcard
            .then(|| format!("*.{}", self.domain));

        let mut seen = HashSet::from([self.domain.as_str()]);
        let mut names = Vec::new();

        for name in self.san.iter().chain(&wildcard) {
            if seen.insert(name.as_str()) {
                names.push(name.clone());
            }
        }

        names
    }

    fn live_dir(&self) -> PathBuf {
        Path::new("data/letsencrypt/live").join(&self.domain)
    }

    fn live_cert_path(&self) -> PathBuf {
        self.cert_path
            .clone()
            .unwrap_or_else(|| self.live_dir().join("fullchain.pem"))
    }

    fn live_key_path(&self) -> PathBuf {
        self.key_path
            .clone()
            .unwrap_or_else(|| self.live_dir().join("privkey.pem"))
    }

    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            domain: self.domain.clone(),
            san_list: self.san_list(),
            cert_path: self.live_cert_path(),
            key_path: self.live_key_path(),
            credentials_path: self.credentials_file.clone(),
            thresholds: self.thresholds,
            fallback_validity_days: self.fallback.validity_days,
        }
    }

    pub fn certbot_settings(&self) -> CertbotSettings {
        CertbotSettings {
            program: self.issuance.certbot.clone(),
            work_dir: self.issuance.work_dir.clone(),
            email: self.email.clone(),
            staging: self.staging,
            propagation_seconds: self.issuance.propagation_seconds,
        }
    }

    /// Wire up the production lifecycle: certbot for issuance, the configured supervisor for
    /// reloads.
    pub fn build_lifecycle(&self) -> Lifecycle {
        let issuer = IssuanceClient::new(
            Arc::new(CertbotDns01::new(self.certbot_settings())),
            Duration::from_secs(self.issuance.timeout_secs),
        );

        let reloader = ReloadCoordinator::new(
            Arc::new(CommandSupervisor::new(self.supervisor.clone())),
            Duration::from_secs(self.reload_timeout_secs),
        );

        Lifecycle::new(
            self.lifecycle_settings(),
            issuer,
            DeploymentManager::new(self.deploy),
            reloader,
            self.targets.clone(),
        )
    }
}

fn resolve(base: &Path, path: &mut PathBuf) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::reload::ReloadAction;

    const MINIMAL: &str = "domain: irc.example.org\nemail: admin@example.org\n";

    #[test]
    fn minimal_file_gets_defaults() {
        let config = Config::from_yaml(MINIMAL).unwrap();
        config.validate().unwrap();

        assert!(config.include_wildcard);
        assert!(!config.staging);
        assert_eq!(config.thresholds, PolicyThresholds::default());
        assert_eq!(config.fallback.validity_days, 365);
        assert_eq!(config.issuance.propagation_seconds, 60);
        assert_eq!(config.issuance.timeout_secs, 600);
        assert_eq!(config.reload_timeout_secs, 60);
        assert_eq!(config.deploy, DeploySettings::default());
        assert_eq!(config.san_list(), ["*.irc.example.org"]);
    }

    #[test]
    fn full_file() {
        let yaml = r#"
domain: irc.example.org
email: admin@example.org
san: [irc2.example.org, irc.example.org]
include_wildcard: false
staging: true
thresholds:
  critical_days: 3
  warn_days: 14
  check_interval_secs: 21600
deploy:
  key_mode: 0o640
  owner: { uid: 1000, gid: 1000 }
supervisor:
  kind: systemd
targets:
  - name: unrealircd
    action: reload
    cert_path: unrealircd/conf/tls/server.cert.pem
    key_path: unrealircd/conf/tls/server.key.pem
  - name: thelounge
    required: false
"#;
        let config = Config::from_yaml(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.san_list(), ["irc2.example.org"]);
        assert_eq!(config.thresholds.critical_days, 3);
        assert_eq!(config.thresholds.check_interval, Duration::from_secs(6 * 3600));
        assert_eq!(config.deploy.key_mode, 0o640);
        assert_eq!(config.deploy.cert_mode, 0o644);
        assert_eq!(config.deploy.owner.unwrap().uid, 1000);
        assert_eq!(config.supervisor, SupervisorKind::Systemd);
        assert_eq!(config.targets[0].action, ReloadAction::Reload);
        assert!(!config.targets[1].required);
    }

    #[test]
    fn missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join(DEFAULT_CONFIG_FILE)).unwrap_err();

        assert!(matches!(err, ConfigError::NotFound(_)));
        assert!(err.to_string().starts_with("config file not found"));
    }

    #[test]
    fn relative_paths_follow_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(
            &path,
            format!(
                "{MINIMAL}targets:\n  - name: unrealircd\n    cert_path: tls/cert.pem\n    key_path: /etc/tls/key.pem\n"
            ),
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let settings = config.lifecycle_settings();

        assert_eq!(
            settings.cert_path,
            dir.path().join("data/letsencrypt/live/irc.example.org/fullchain.pem")
        );
        assert_eq!(
            settings.key_path,
            dir.path().join("data/letsencrypt/live/irc.example.org/privkey.pem")
        );
        assert_eq!(
            settings.credentials_path,
            dir.path().join("cloudflare-credentials.ini")
        );
        assert_eq!(config.issuance.certbot, PathBuf::from("certbot"));
        assert_eq!(
            config.targets[0].cert_path.as_deref(),
            Some(dir.path().join("tls/cert.pem").as_path())
        );
        assert_eq!(
            config.targets[0].key_path.as_deref(),
            Some(Path::new("/etc/tls/key.pem"))
        );
        assert_eq!(
            config.supervisor,
            SupervisorKind::Compose {
                file: dir.path().join("docker-compose.yml")
            }
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            "domain: localhost\nemail: admin@example.org\n",
            "domain: '*.example.org'\nemail: admin@example.org\n",
            "domain: irc.example.org\nemail: admin\n",
            "domain: irc.example.org\nemail: a@b.c\nthresholds: { critical_days: 40 }\n",
            "domain: irc.example.org\nemail: a@b.c\ntargets: [{ name: a }, { name: a }]\n",
            "domain: irc.example.org\nemail: a@b.c\ntargets: [{ name: a, cert_path: c.pem }]\n",
            "domain: irc.example.org\nemail: a@b.c\nfallback: { validity_days: 0 }\n",
        ];

        for yaml in cases {
            let config = Config::from_yaml(yaml).unwrap();
            assert!(config.validate().is_err(), "{yaml}");
        }
    }

    #[test]
    fn unknown_field_is_an_error() {
        assert!(Config::from_yaml(&format!("{MINIMAL}renew_days: 30\n")).is_err());
    }
}
