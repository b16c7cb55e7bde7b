// Configuration structures for pgtunnel
//
// The hosting process supplies configuration through environment variables
// (the deployment interface) or a TOML file. Loaded once at startup and
// treated as immutable afterwards.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_DATABASE_PORT: u16 = 5432;

/// A secret value (password or passphrase). Zeroed on drop and redacted in
/// debug output so it cannot leak through logs.
#[derive(Clone, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

/// Complete tunnel configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// SSH endpoint to tunnel through. When absent the database is reached
    /// directly and no tunnel is established.
    pub ssh: Option<SshConfig>,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub options: TunnelOptions,
}

/// SSH connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// SSH server hostname or IP
    pub host: String,
    /// SSH server port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username
    pub user: String,
    /// Path to SSH private key (for key auth)
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    /// Passphrase for an encrypted private key
    #[serde(default)]
    pub key_passphrase: Option<SecretString>,
    /// SSH password (for password auth)
    #[serde(default)]
    pub password: Option<SecretString>,
    /// Pinned server key fingerprint (`SHA256:<base64>`). Any server key is
    /// accepted when unset.
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

/// Target database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Database hostname as seen from the SSH server (or directly)
    pub host: String,
    /// Database port (default: 5432)
    #[serde(default = "default_database_port")]
    pub port: u16,
    /// Database user
    pub user: String,
    /// Database password
    pub password: SecretString,
    /// Database name
    pub name: String,
}

/// Tunnel behavior options
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelOptions {
    /// Relay read chunk size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Per-session idle timeout in seconds (unset = wait forever)
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    /// SSH connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// How long shutdown waits for live sessions to drain before aborting them
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

// Default value functions
fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_database_port() -> u16 {
    DEFAULT_DATABASE_PORT
}

fn default_chunk_size() -> usize {
    1024
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_drain_timeout() -> u64 {
    5
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            idle_timeout_secs: None,
            connect_timeout_secs: default_connect_timeout(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

impl TunnelOptions {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// The credential selected from an [`SshConfig`]. Exactly one kind must be
/// configured; anything else is a configuration error surfaced before any
/// network I/O happens.
pub enum SshCredential<'a> {
    Key {
        path: &'a Path,
        passphrase: Option<&'a str>,
    },
    Password(&'a str),
}

impl SshConfig {
    pub fn credential(&self) -> Result<SshCredential<'_>> {
        match (&self.key_path, &self.password) {
            (Some(path), None) => Ok(SshCredential::Key {
                path,
                passphrase: self.key_passphrase.as_ref().map(|p| p.expose()),
            }),
            (None, Some(password)) => Ok(SshCredential::Password(password.expose())),
            (Some(_), Some(_)) => Err(Error::Config(
                "both SSH_KEY_PATH and SSH_PASSWORD are set; configure exactly one".to_string(),
            )),
            (None, None) => Err(Error::Config(
                "no SSH credential configured; set SSH_KEY_PATH or SSH_PASSWORD".to_string(),
            )),
        }
    }
}

impl TunnelConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable lookup. The seam the
    /// environment tests go through.
    pub fn from_env_with<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let ssh = match get("SSH_HOST") {
            Some(host) => Some(SshConfig {
                host,
                port: parse_port(get("SSH_PORT"), DEFAULT_SSH_PORT, "SSH_PORT")?,
                user: require(&get, "SSH_USER")?,
                key_path: get("SSH_KEY_PATH").map(PathBuf::from),
                key_passphrase: get("SSH_KEY_PASSPHRASE").map(SecretString::from),
                password: get("SSH_PASSWORD").map(SecretString::from),
                host_key_fingerprint: get("SSH_HOST_KEY_FINGERPRINT"),
            }),
            None => None,
        };

        let database = DatabaseConfig {
            host: require(&get, "DB_HOST")?,
            port: parse_port(get("DB_PORT"), DEFAULT_DATABASE_PORT, "DB_PORT")?,
            user: require(&get, "DB_USER")?,
            password: SecretString::from(require(&get, "DB_PASSWORD")?),
            name: require(&get, "DB_NAME")?,
        };

        Ok(Self {
            ssh,
            database,
            options: TunnelOptions::default(),
        })
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;
        toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }
}

fn require<F>(get: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    get(key).ok_or_else(|| Error::Config(format!("{} is not set", key)))
}

fn parse_port(value: Option<String>, default: u16, key: &str) -> Result<u16> {
    match value {
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{} is not a valid port: {}", key, raw))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> HashMap<String, String> {
        vars.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn lookup(vars: &HashMap<String, String>) -> impl Fn(&str) -> Option<String> + '_ {
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_from_env_with_tunnel() {
        let vars = env(&[
            ("SSH_HOST", "bastion.example.com"),
            ("SSH_USER", "deploy"),
            ("SSH_KEY_PATH", "/home/deploy/.ssh/id_ed25519"),
            ("DB_HOST", "db.internal"),
            ("DB_USER", "shop"),
            ("DB_PASSWORD", "hunter2"),
            ("DB_NAME", "shopdb"),
        ]);

        let config = TunnelConfig::from_env_with(lookup(&vars)).unwrap();
        let ssh = config.ssh.expect("ssh section");
        assert_eq!(ssh.host, "bastion.example.com");
        assert_eq!(ssh.port, DEFAULT_SSH_PORT);
        assert_eq!(ssh.user, "deploy");
        assert!(matches!(ssh.credential().unwrap(), SshCredential::Key { .. }));
        assert_eq!(config.database.port, DEFAULT_DATABASE_PORT);
        assert_eq!(config.database.name, "shopdb");
    }

    #[test]
    fn test_from_env_direct_when_no_ssh_host() {
        let vars = env(&[
            ("DB_HOST", "localhost"),
            ("DB_USER", "shop"),
            ("DB_PASSWORD", "pw"),
            ("DB_NAME", "shopdb"),
        ]);

        let config = TunnelConfig::from_env_with(lookup(&vars)).unwrap();
        assert!(config.ssh.is_none());
    }

    #[test]
    fn test_from_env_missing_database_host() {
        let vars = env(&[("DB_USER", "shop"), ("DB_PASSWORD", "pw"), ("DB_NAME", "shopdb")]);

        let err = TunnelConfig::from_env_with(lookup(&vars)).unwrap_err();
        assert!(err.to_string().contains("DB_HOST"));
    }

    #[test]
    fn test_from_env_invalid_port() {
        let vars = env(&[
            ("DB_HOST", "localhost"),
            ("DB_PORT", "fivefourthreetwo"),
            ("DB_USER", "shop"),
            ("DB_PASSWORD", "pw"),
            ("DB_NAME", "shopdb"),
        ]);

        let err = TunnelConfig::from_env_with(lookup(&vars)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("DB_PORT"));
    }

    #[test]
    fn test_credential_requires_exactly_one() {
        let mut ssh = SshConfig {
            host: "bastion".to_string(),
            port: 22,
            user: "deploy".to_string(),
            key_path: None,
            key_passphrase: None,
            password: None,
            host_key_fingerprint: None,
        };

        assert!(matches!(ssh.credential(), Err(Error::Config(_))));

        ssh.password = Some(SecretString::from("secret"));
        assert!(matches!(ssh.credential(), Ok(SshCredential::Password(_))));

        ssh.key_path = Some(PathBuf::from("/home/deploy/.ssh/id_ed25519"));
        assert!(matches!(ssh.credential(), Err(Error::Config(_))));

        ssh.password = None;
        assert!(matches!(ssh.credential(), Ok(SshCredential::Key { .. })));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = SecretString::from("hunter2");
        assert_eq!(format!("{:?}", secret), "[redacted]");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_load_toml() {
        let parsed: TunnelConfig = toml::from_str(
            r#"
            [ssh]
            host = "bastion.example.com"
            user = "deploy"
            key_path = "/home/deploy/.ssh/id_ed25519"

            [database]
            host = "db.internal"
            user = "shop"
            password = "hunter2"
            name = "shopdb"

            [options]
            chunk_size = 4096
            idle_timeout_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(parsed.options.chunk_size, 4096);
        assert_eq!(
            parsed.options.idle_timeout(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(parsed.options.connect_timeout(), Duration::from_secs(15));
        let ssh = parsed.ssh.expect("ssh section");
        assert_eq!(ssh.port, 22);
    }
}
