use std::{
    ffi::OsString,
    io,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

use super::ReloadAction;

/// The external process supervisor that owns the dependent services.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Stop and start `service`.
    async fn restart(&self, service: &str) -> Result<(), SupervisorError>;

    /// Ask `service` to re-read its certificate without restarting.
    async fn reload(&self, service: &str) -> Result<(), SupervisorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("could not run {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{program} exited with {status}: {stderr}")]
    Exit {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Which supervisor manages the services.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SupervisorKind {
    /// Docker Compose project; a reload sends SIGHUP to the container.
    Compose {
        #[serde(rename = "compose_file", default = "default_compose_file")]
        file: PathBuf,
    },

    /// systemd units.
    Systemd,
}

impl Default for SupervisorKind {
    fn default() -> Self {
        SupervisorKind::Compose {
            file: default_compose_file(),
        }
    }
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

/// [`Supervisor`] that shells out to `docker compose` or `systemctl`.
#[derive(Debug, Clone)]
pub struct CommandSupervisor {
    kind: SupervisorKind,
}

impl CommandSupervisor {
    pub fn new(kind: SupervisorKind) -> Self {
        CommandSupervisor { kind }
    }

    /// Program and arguments that perform `action` on `service`.
    pub fn command(&self, action: ReloadAction, service: &str) -> (&'static str, Vec<OsString>) {
        match &self.kind {
            SupervisorKind::Compose { file } => {
                let mut args = compose_base(file);
                match action {
                    ReloadAction::Restart => args.push("restart".into()),
                    ReloadAction::Reload => {
                        args.extend(["kill".into(), "-s".into(), "HUP".into()]);
                    }
                }
                args.push(service.into());
                ("docker", args)
            }

            SupervisorKind::Systemd => {
                let verb = match action {
                    ReloadAction::Restart => "restart",
                    ReloadAction::Reload => "reload",
                };
                ("systemctl", vec![verb.into(), service.into()])
            }
        }
    }

    async fn run(&self, action: ReloadAction, service: &str) -> Result<(), SupervisorError> {
        let (program, args) = self.command(action, service);
        log::debug!("Running {program} {args:?}");

        let output = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| SupervisorError::Spawn {
                program: program.to_owned(),
                source,
            })?;

        if !output.status.success() {
            return Err(SupervisorError::Exit {
                program: program.to_owned(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        Ok(())
    }
}

fn compose_base(file: &Path) -> Vec<OsString> {
    vec!["compose".into(), "-f".into(), file.into()]
}

#[async_trait]
impl Supervisor for CommandSupervisor {
    async fn restart(&self, service: &str) -> Result<(), SupervisorError> {
        self.run(ReloadAction::Restart, service).await
    }

    async fn reload(&self, service: &str) -> Result<(), SupervisorError> {
        self.run(ReloadAction::Reload, service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn compose_commands() {
        let sup = CommandSupervisor::new(SupervisorKind::Compose {
            file: PathBuf::from("/srv/irc/docker-compose.yml"),
        });

        let (program, args) = sup.command(ReloadAction::Restart, "unrealircd");
        assert_eq!(program, "docker");
        assert_eq!(
            strings(args),
            ["compose", "-f", "/srv/irc/docker-compose.yml", "restart", "unrealircd"]
        );

        let (_, args) = sup.command(ReloadAction::Reload, "unrealircd");
        assert_eq!(
            strings(args),
            ["compose", "-f", "/srv/irc/docker-compose.yml", "kill", "-s", "HUP", "unrealircd"]
        );
    }

    #[test]
    fn systemd_commands() {
        let sup = CommandSupervisor::new(SupervisorKind::Systemd);

        let (program, args) = sup.command(ReloadAction::Reload, "atheme.service");
        assert_eq!(program, "systemctl");
        assert_eq!(strings(args), ["reload", "atheme.service"]);
    }

    #[test]
    fn kind_from_yaml() {
        let kind: SupervisorKind = serde_yaml::from_str("kind: systemd").unwrap();
        assert_eq!(kind, SupervisorKind::Systemd);

        let kind: SupervisorKind =
            serde_yaml::from_str("kind: compose\ncompose_file: compose.yaml").unwrap();
        assert_eq!(
            kind,
            SupervisorKind::Compose {
                file: PathBuf::from("compose.yaml")
            }
        );
    }
}
