//! Atomic replacement of deployed certificate/key pairs.
//!
//! New material is written to exclusive temp files next to the live files, verified, and renamed
//! over them. A reader of a live path sees either the old file or the new one, never a partial
//! write. Every pair is staged and verified before the first rename. A rename that fails puts the
//! pairs already replaced back from their backups, so a failed deployment leaves every live pair
//! byte-for-byte as it was.

use std::{
    fs::{self, File},
    io::{self, Read as _, Write as _},
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

use crate::{
    cert::{CertificateMaterial, MaterialError},
    error::ErrorKind,
};

/// Smallest plausible PEM certificate; a single P-256 leaf is well over this.
pub const MIN_CERT_BYTES: u64 = 256;

/// Smallest plausible PEM private key; a PKCS#8 P-256 key is about 240 bytes.
pub const MIN_KEY_BYTES: u64 = 100;

const TMP_PREFIX: &str = ".certwarden-";
const BACKUP_SUFFIX: &str = "backup";

#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("{} is implausibly small ({len} bytes, expected at least {min})", path.display())]
    TooSmall { path: PathBuf, len: u64, min: u64 },

    #[error("staged material failed verification: {0}")]
    Invalid(#[from] MaterialError),

    #[error("could not set permissions on {}: {source}", path.display())]
    Permissions { path: PathBuf, source: io::Error },
}

impl DeploymentError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::DeploymentError
    }

    fn io(path: &Path) -> impl FnOnce(io::Error) -> Self + '_ {
        move |source| DeploymentError::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// File owner applied to deployed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FileOwner {
    pub uid: u32,
    pub gid: u32,
}

/// Modes and ownership for deployed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    pub cert_mode: u32,
    pub key_mode: u32,
    pub owner: Option<FileOwner>,
}

impl Default for DeploySettings {
    fn default() -> Self {
        DeploySettings {
            cert_mode: 0o644,
            key_mode: 0o600,
            owner: None,
        }
    }
}

/// A live certificate/key path pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeployTarget {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Sole writer of deployed certificate files.
#[derive(Debug, Clone, Default)]
pub struct DeploymentManager {
    settings: DeploySettings,
}

impl DeploymentManager {
    pub fn new(settings: DeploySettings) -> Self {
        DeploymentManager { settings }
    }

    /// Deploy `material` to every distinct pair, all or nothing.
    pub fn deploy_all(
        &self,
        material: &CertificateMaterial,
        targets: &[DeployTarget],
    ) -> Result<(), DeploymentError> {
        let mut distinct = Vec::with_capacity(targets.len());
        for target in targets {
            if !distinct.contains(&target) {
                distinct.push(target);
            }
        }

        // nothing live changes until every pair is on disk and verified
        let staged = distinct
            .into_iter()
            .map(|target| self.stage(material, target))
            .collect::<Result<Vec<_>, _>>()?;

        let mut swapped = Vec::with_capacity(staged.len());

        for pair in staged {
            match pair.swap() {
                Ok(done) => swapped.push(done),
                Err(err) => {
                    for done in swapped.iter().rev() {
                        done.roll_back();
                    }
                    return Err(err);
                }
            }
        }

        for done in &swapped {
            log::info!(
                "Deployed certificate to {} and key to {}",
                done.target.cert_path.display(),
                done.target.key_path.display()
            );
        }

        Ok(())
    }

    /// Replace the pair at `cert_path`/`key_path` with `material`.
    pub fn deploy(
        &self,
        material: &CertificateMaterial,
        cert_path: &Path,
        key_path: &Path,
    ) -> Result<(), DeploymentError> {
        let target = DeployTarget {
            cert_path: cert_path.to_owned(),
            key_path: key_path.to_owned(),
        };

        self.deploy_all(material, &[target])
    }

    /// Write, verify and prepare the temp files of one pair. They are removed on drop.
    fn stage<'a>(
        &self,
        material: &CertificateMaterial,
        target: &'a DeployTarget,
    ) -> Result<StagedPair<'a>, DeploymentError> {
        let cert = self.stage_file(
            &target.cert_path,
            material.certificate(),
            MIN_CERT_BYTES,
            self.settings.cert_mode,
        )?;
        let key = self.stage_file(
            &target.key_path,
            material.private_key(),
            MIN_KEY_BYTES,
            self.settings.key_mode,
        )?;

        // parse what actually landed on disk, not what we meant to write
        let mut cert_pem = String::new();
        read_back(&cert, &target.cert_path, &mut cert_pem)?;
        let mut key_pem = Zeroizing::new(String::new());
        read_back(&key, &target.key_path, &mut key_pem)?;
        CertificateMaterial::parse(key_pem, cert_pem, material.origin())?;

        Ok(StagedPair { target, cert, key })
    }

    fn stage_file(
        &self,
        path: &Path,
        contents: &str,
        min: u64,
        mode: u32,
    ) -> Result<NamedTempFile, DeploymentError> {
        let dir = parent_dir(path);
        fs::create_dir_all(dir).map_err(DeploymentError::io(dir))?;

        // exclusive create under a random name, never through a planted symlink
        let mut tmp = temp_file_in(dir).map_err(DeploymentError::io(dir))?;

        tmp.as_file_mut()
            .write_all(contents.as_bytes())
            .map_err(DeploymentError::io(path))?;
        tmp.as_file().sync_all().map_err(DeploymentError::io(path))?;

        let len = tmp.as_file().metadata().map_err(DeploymentError::io(path))?.len();
        if len < min {
            return Err(DeploymentError::TooSmall {
                path: path.to_owned(),
                len,
                min,
            });
        }

        self.apply_permissions(tmp.as_file(), path, mode)?;

        Ok(tmp)
    }

    #[cfg(unix)]
    fn apply_permissions(
        &self,
        file: &File,
        path: &Path,
        mode: u32,
    ) -> Result<(), DeploymentError> {
        use std::os::unix::fs::PermissionsExt as _;

        let perm_err = |source| DeploymentError::Permissions {
            path: path.to_owned(),
            source,
        };

        if let Some(owner) = self.settings.owner {
            std::os::unix::fs::fchown(file, Some(owner.uid), Some(owner.gid)).map_err(perm_err)?;
        }

        // never world-writable, whatever was configured
        let mode = mode & !0o002;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(perm_err)
    }

    #[cfg(not(unix))]
    fn apply_permissions(
        &self,
        _file: &File,
        _path: &Path,
        _mode: u32,
    ) -> Result<(), DeploymentError> {
        Ok(())
    }
}

/// A verified pair waiting to be renamed into place.
struct StagedPair<'a> {
    target: &'a DeployTarget,
    cert: NamedTempFile,
    key: NamedTempFile,
}

impl<'a> StagedPair<'a> {
    /// Back up the live pair, then rename the key and the certificate over it.
    fn swap(self) -> Result<Swapped<'a>, DeploymentError> {
        let StagedPair { target, cert, key } = self;

        let swapped = Swapped {
            target,
            cert_kept: backup(&target.cert_path)?,
            key_kept: backup(&target.key_path)?,
        };

        key.persist(&target.key_path)
            .map_err(|err| DeploymentError::Io {
                path: target.key_path.clone(),
                source: err.error,
            })?;

        if let Err(err) = cert.persist(&target.cert_path) {
            // the new key must not sit next to the old certificate
            restore(&target.key_path, swapped.key_kept);
            return Err(DeploymentError::Io {
                path: target.cert_path.clone(),
                source: err.error,
            });
        }

        Ok(swapped)
    }
}

/// A pair already replaced, with whether each live file existed before.
struct Swapped<'a> {
    target: &'a DeployTarget,
    cert_kept: bool,
    key_kept: bool,
}

impl Swapped<'_> {
    fn roll_back(&self) {
        log::warn!(
            "Rolling back {} and {}",
            self.target.cert_path.display(),
            self.target.key_path.display()
        );

        restore(&self.target.key_path, self.key_kept);
        restore(&self.target.cert_path, self.cert_kept);
    }
}

/// `dir/name.backup`
pub fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    path.with_file_name(format!("{name}.{BACKUP_SUFFIX}"))
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Temp file on the same filesystem as the live files in `dir`.
fn temp_file_in(dir: &Path) -> io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(TMP_PREFIX)
        .suffix(".tmp")
        .tempfile_in(dir)
}

fn read_back(tmp: &NamedTempFile, path: &Path, buf: &mut String) -> Result<(), DeploymentError> {
    tmp.reopen()
        .and_then(|mut file| file.read_to_string(buf))
        .map(drop)
        .map_err(DeploymentError::io(path))
}

/// Copy the live file aside before it is replaced. Returns whether there was one.
fn backup(path: &Path) -> Result<bool, DeploymentError> {
    match fs::copy(path, backup_path(path)) {
        Ok(_) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(DeploymentError::Io {
            path: path.to_owned(),
            source,
        }),
    }
}

/// Put back the backup of `path`, or remove `path` when it did not exist before.
fn restore(path: &Path, kept: bool) {
    let result = if kept {
        copy_back(path)
    } else {
        fs::remove_file(path)
    };

    if let Err(err) = result {
        log::error!(
            "Could not roll back {} after a failed deployment: {err}",
            path.display()
        );
    }
}

fn copy_back(path: &Path) -> io::Result<()> {
    let backup = backup_path(path);

    let mut tmp = temp_file_in(parent_dir(path))?;
    io::copy(&mut File::open(&backup)?, tmp.as_file_mut())?;
    tmp.as_file()
        .set_permissions(fs::metadata(&backup)?.permissions())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use time::{Duration, OffsetDateTime};

    use super::*;
    use crate::{
        cert::MaterialOrigin,
        fallback::generate_fallback,
        test::self_signed_pem,
    };

    fn material() -> CertificateMaterial {
        generate_fallback("irc.example.org", &[], 90).unwrap()
    }

    fn live_pair(dir: &Path) -> (PathBuf, PathBuf) {
        let live = dir.join("live").join("irc.example.org");
        (live.join("fullchain.pem"), live.join("privkey.pem"))
    }

    fn staged_leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(TMP_PREFIX))
            .collect()
    }

    #[test]
    fn deploys_into_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = live_pair(dir.path());
        let material = material();

        DeploymentManager::default()
            .deploy(&material, &cert_path, &key_path)
            .unwrap();

        assert_eq!(fs::read_to_string(&cert_path).unwrap(), material.certificate());
        assert_eq!(fs::read_to_string(&key_path).unwrap(), material.private_key());
        assert!(staged_leftovers(cert_path.parent().unwrap()).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn applies_modes() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = live_pair(dir.path());

        DeploymentManager::default()
            .deploy(&material(), &cert_path, &key_path)
            .unwrap();

        let cert_mode = fs::metadata(&cert_path).unwrap().permissions().mode() & 0o777;
        let key_mode = fs::metadata(&key_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(cert_mode, 0o644);
        assert_eq!(key_mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn world_writable_mode_is_masked() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = live_pair(dir.path());
        let manager = DeploymentManager::new(DeploySettings {
            cert_mode: 0o666,
            ..Default::default()
        });

        manager.deploy(&material(), &cert_path, &key_path).unwrap();

        let cert_mode = fs::metadata(&cert_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(cert_mode, 0o664);
    }

    #[test]
    fn keeps_backup_of_previous_pair() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = live_pair(dir.path());
        let manager = DeploymentManager::default();

        let old = material();
        manager.deploy(&old, &cert_path, &key_path).unwrap();

        let new = material();
        manager.deploy(&new, &cert_path, &key_path).unwrap();

        assert_eq!(fs::read_to_string(&cert_path).unwrap(), new.certificate());
        assert_eq!(
            fs::read_to_string(backup_path(&cert_path)).unwrap(),
            old.certificate()
        );
        assert_eq!(
            fs::read_to_string(backup_path(&key_path)).unwrap(),
            old.private_key()
        );
    }

    #[test]
    fn failed_verification_leaves_live_pair_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = live_pair(dir.path());
        fs::create_dir_all(cert_path.parent().unwrap()).unwrap();
        fs::write(&cert_path, "INITIAL_CERT").unwrap();
        fs::write(&key_path, "INITIAL_KEY").unwrap();

        // a key from another pair sneaks in between issuance and deployment
        let now = OffsetDateTime::now_utc();
        let a = self_signed_pem("irc.example.org", now, now + Duration::days(90));
        let b = self_signed_pem("irc.example.org", now, now + Duration::days(90));
        let good = CertificateMaterial::parse(a.key_pem, a.cert_pem, MaterialOrigin::Acme)
            .unwrap();
        let tampered = CertificateMaterial {
            private_key_pem: b.key_pem,
            ..good
        };

        let err = DeploymentManager::default()
            .deploy(&tampered, &cert_path, &key_path)
            .unwrap_err();

        assert!(matches!(err, DeploymentError::Invalid(MaterialError::KeyMismatch)));
        assert_eq!(fs::read(&cert_path).unwrap(), b"INITIAL_CERT");
        assert_eq!(fs::read(&key_path).unwrap(), b"INITIAL_KEY");
        assert!(staged_leftovers(cert_path.parent().unwrap()).is_empty());
        assert!(!backup_path(&cert_path).exists());
    }

    #[test]
    fn implausibly_small_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = live_pair(dir.path());
        fs::create_dir_all(cert_path.parent().unwrap()).unwrap();
        fs::write(&cert_path, "INITIAL_CERT").unwrap();

        let good = material();
        let truncated = CertificateMaterial {
            certificate: good.certificate()[..100].to_owned(),
            ..good
        };

        let err = DeploymentManager::default()
            .deploy(&truncated, &cert_path, &key_path)
            .unwrap_err();

        assert!(matches!(err, DeploymentError::TooSmall { min: MIN_CERT_BYTES, .. }));
        assert_eq!(err.kind(), ErrorKind::DeploymentError);
        assert_eq!(fs::read(&cert_path).unwrap(), b"INITIAL_CERT");
        assert!(!key_path.exists());
    }

    #[test]
    fn deploy_all_skips_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = live_pair(dir.path());
        let ircd = DeployTarget {
            cert_path: dir.path().join("tls").join("server.cert.pem"),
            key_path: dir.path().join("tls").join("server.key.pem"),
        };
        let live = DeployTarget {
            cert_path,
            key_path,
        };

        let material = material();
        DeploymentManager::default()
            .deploy_all(&material, &[live.clone(), ircd.clone(), live.clone()])
            .unwrap();

        assert_eq!(
            fs::read_to_string(&ircd.cert_path).unwrap(),
            material.certificate()
        );
        // deployed once, so there was nothing to back up
        assert!(!backup_path(&live.cert_path).exists());
    }

    #[test]
    fn failure_on_later_pair_restores_earlier_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = live_pair(dir.path());
        fs::create_dir_all(cert_path.parent().unwrap()).unwrap();
        fs::write(&cert_path, "INITIAL_CERT").unwrap();
        fs::write(&key_path, "INITIAL_KEY").unwrap();

        // a directory where the service certificate should be cannot be backed up or replaced
        let tls = dir.path().join("tls");
        fs::create_dir_all(tls.join("server.cert.pem")).unwrap();

        let live = DeployTarget {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        };
        let ircd = DeployTarget {
            cert_path: tls.join("server.cert.pem"),
            key_path: tls.join("server.key.pem"),
        };

        let err = DeploymentManager::default()
            .deploy_all(&material(), &[live, ircd])
            .unwrap_err();

        assert!(matches!(err, DeploymentError::Io { .. }));
        assert_eq!(fs::read(&cert_path).unwrap(), b"INITIAL_CERT");
        assert_eq!(fs::read(&key_path).unwrap(), b"INITIAL_KEY");
        assert!(!tls.join("server.key.pem").exists());
        assert!(staged_leftovers(cert_path.parent().unwrap()).is_empty());
        assert!(staged_leftovers(&tls).is_empty());
    }

    #[test]
    fn unstageable_pair_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = live_pair(dir.path());
        fs::create_dir_all(cert_path.parent().unwrap()).unwrap();
        fs::write(&cert_path, "INITIAL_CERT").unwrap();
        fs::write(&key_path, "INITIAL_KEY").unwrap();

        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();

        let live = DeployTarget {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        };
        let ircd = DeployTarget {
            cert_path: blocker.join("server.cert.pem"),
            key_path: blocker.join("server.key.pem"),
        };

        DeploymentManager::default()
            .deploy_all(&material(), &[live, ircd])
            .unwrap_err();

        assert_eq!(fs::read(&cert_path).unwrap(), b"INITIAL_CERT");
        assert_eq!(fs::read(&key_path).unwrap(), b"INITIAL_KEY");
        assert!(!backup_path(&cert_path).exists());
        assert!(staged_leftovers(cert_path.parent().unwrap()).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_next_to_live_files_is_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = live_pair(dir.path());
        let live = cert_path.parent().unwrap();
        fs::create_dir_all(live).unwrap();

        let outside = dir.path().join("outside");
        fs::write(&outside, "UNTOUCHED").unwrap();
        for name in [".privkey.pem.certwarden-tmp", ".fullchain.pem.certwarden-tmp"] {
            std::os::unix::fs::symlink(&outside, live.join(name)).unwrap();
        }

        let material = material();
        DeploymentManager::default()
            .deploy(&material, &cert_path, &key_path)
            .unwrap();

        assert_eq!(fs::read(&outside).unwrap(), b"UNTOUCHED");
        assert_eq!(fs::read_to_string(&key_path).unwrap(), material.private_key());
    }

    #[test]
    fn backup_sits_next_to_live_file() {
        let path = Path::new("/data/live/irc.example.org/fullchain.pem");
        assert_eq!(
            backup_path(path),
            Path::new("/data/live/irc.example.org/fullchain.pem.backup")
        );
    }
}
