use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use zeroize::Zeroizing;

/// Key certbot's Cloudflare plugin reads the API token from.
pub const TOKEN_KEY: &str = "dns_cloudflare_api_token";

const MIN_TOKEN_LEN: usize = 20;

/// Why the DNS provider credentials cannot be used.
#[derive(Debug, thiserror::Error)]
pub enum CredentialsError {
    #[error("credentials file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("credentials file {} is not readable: {source}", path.display())]
    Unreadable { path: PathBuf, source: io::Error },

    #[error("credentials file missing expected key `dns_cloudflare_api_token`")]
    MissingKey,

    #[error("`dns_cloudflare_api_token` is empty")]
    EmptyToken,

    #[error("`dns_cloudflare_api_token` is malformed: {0}")]
    MalformedToken(&'static str),
}

impl CredentialsError {
    /// Operator-facing next step.
    pub fn hint(&self) -> String {
        match self {
            CredentialsError::Missing(path) => format!(
                "create {} from cloudflare-credentials.ini.template",
                path.display()
            ),
            CredentialsError::Unreadable { path, .. } => {
                format!("make {} readable by the certwarden user", path.display())
            }
            CredentialsError::MissingKey | CredentialsError::EmptyToken => {
                format!("add a line `{TOKEN_KEY} = <token>` to the credentials file")
            }
            CredentialsError::MalformedToken(_) => {
                "paste the API token exactly as shown by the Cloudflare dashboard".to_owned()
            }
        }
    }
}

/// A validated DNS-01 API token and the file it came from.
///
/// The file path is what the ACME client is handed; the token itself is only checked.
#[derive(Clone)]
pub struct DnsCredentials {
    path: PathBuf,
    token: Zeroizing<String>,
}

impl fmt::Debug for DnsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsCredentials")
            .field("path", &self.path)
            .field("token", &"<redacted>")
            .finish()
    }
}

impl DnsCredentials {
    /// Read and validate a certbot-style INI credentials file.
    pub fn load(path: &Path) -> Result<Self, CredentialsError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => Zeroizing::new(contents),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(CredentialsError::Missing(path.to_owned()))
            }
            Err(source) => {
                return Err(CredentialsError::Unreadable {
                    path: path.to_owned(),
                    source,
                })
            }
        };

        warn_if_exposed(path);

        let token = Self::parse_token(&contents)?;

        Ok(DnsCredentials {
            path: path.to_owned(),
            token,
        })
    }

    /// Extract and check the token from INI text.
    pub fn parse_token(contents: &str) -> Result<Zeroizing<String>, CredentialsError> {
        let value = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
            .filter_map(|line| line.split_once('='))
            .find(|(key, _)| key.trim() == TOKEN_KEY)
            .map(|(_, value)| value.trim())
            .ok_or(CredentialsError::MissingKey)?;

        let value = value.trim_matches(|c| c == '"' || c == '\'');

        if value.is_empty() {
            return Err(CredentialsError::EmptyToken);
        }

        if value.len() < MIN_TOKEN_LEN {
            return Err(CredentialsError::MalformedToken("too short"));
        }

        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CredentialsError::MalformedToken(
                "contains characters other than letters, digits, '-' and '_'",
            ));
        }

        Ok(Zeroizing::new(value.to_owned()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

#[cfg(unix)]
fn warn_if_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt as _;

    if let Ok(meta) = std::fs::metadata(path) {
        if meta.permissions().mode() & 0o077 != 0 {
            log::warn!(
                "credentials file {} is accessible by other users; chmod 600 it",
                path.display()
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_exposed(_path: &Path) {}
