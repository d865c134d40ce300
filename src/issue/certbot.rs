use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::process::Command;
use zeroize::Zeroizing;

use super::{AcmeCapability, CapabilityOutput, CertificateOrder, DnsCredentials};

/// How to invoke certbot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertbotSettings {
    /// Executable, looked up on `PATH` when relative.
    pub program: PathBuf,

    /// Holds certbot's `config`, `work` and `logs` directories.
    pub work_dir: PathBuf,

    /// ACME account contact.
    pub email: String,

    /// Use the Let's Encrypt staging directory.
    ///
    /// Staging certificates are not trusted by clients but the rate limits are far more relaxed.
    pub staging: bool,

    /// Seconds to wait for the TXT record to propagate before asking the CA to validate.
    pub propagation_seconds: u32,
}

/// [`AcmeCapability`] backed by certbot and its `dns-cloudflare` plugin.
#[derive(Debug, Clone)]
pub struct CertbotDns01 {
    settings: CertbotSettings,
}

impl CertbotDns01 {
    pub fn new(settings: CertbotSettings) -> Self {
        CertbotDns01 { settings }
    }

    /// Where certbot keeps the current material for `cert_name`.
    pub fn live_dir(&self, cert_name: &str) -> PathBuf {
        self.settings
            .work_dir
            .join("config")
            .join("live")
            .join(cert_name)
    }

    /// The full certbot argument list for an order.
    pub fn args(&self, order: &CertificateOrder, credentials: &Path) -> Vec<OsString> {
        let s = &self.settings;
        let work = &s.work_dir;

        let mut args: Vec<OsString> = vec![
            "certonly".into(),
            "--non-interactive".into(),
            "--agree-tos".into(),
            "--email".into(),
            s.email.clone().into(),
            "--dns-cloudflare".into(),
            "--dns-cloudflare-credentials".into(),
            credentials.into(),
            "--dns-cloudflare-propagation-seconds".into(),
            s.propagation_seconds.to_string().into(),
            "--key-type".into(),
            "ecdsa".into(),
            "--elliptic-curve".into(),
            "secp256r1".into(),
            "--cert-name".into(),
            order.domain.clone().into(),
            "--config-dir".into(),
            work.join("config").into(),
            "--work-dir".into(),
            work.join("work").into(),
            "--logs-dir".into(),
            work.join("logs").into(),
        ];

        if s.staging {
            args.push("--staging".into());
        }

        if order.force {
            args.push("--force-renewal".into());
        } else {
            args.push("--keep-until-expiring".into());
        }

        for name in &order.names {
            args.push("-d".into());
            args.push(name.into());
        }

        args
    }
}

#[async_trait]
impl AcmeCapability for CertbotDns01 {
    async fn request_certificate(
        &self,
        order: &CertificateOrder,
        credentials: &DnsCredentials,
    ) -> io::Result<CapabilityOutput> {
        let args = self.args(order, credentials.path());
        log::debug!("Running {} {:?}", self.settings.program.display(), args);

        // dropped on timeout, which must not leave certbot running
        let output = Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        let mut diagnostic = String::from_utf8_lossy(&output.stdout).into_owned();
        diagnostic.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Ok(CapabilityOutput {
                success: false,
                diagnostic,
                ..Default::default()
            });
        }

        let live = self.live_dir(&order.domain);
        let cert_pem = tokio::fs::read_to_string(live.join("fullchain.pem")).await?;
        let key_pem = Zeroizing::new(tokio::fs::read_to_string(live.join("privkey.pem")).await?);

        Ok(CapabilityOutput {
            success: true,
            cert_pem: Some(cert_pem),
            key_pem: Some(key_pem),
            diagnostic,
        })
    }
}
