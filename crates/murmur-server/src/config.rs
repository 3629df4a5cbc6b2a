//! Server configuration: TOML file + CLI overrides.

use murmur_core::{generate_secret, MurmurError, MurmurResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Shortest accepted access-key signing secret, in bytes.
const MIN_SECRET_BYTES: usize = 32;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub auth: AuthSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Close the connection after reporting `Unauthorized`.
    #[serde(default)]
    pub close_on_unauthorized: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            close_on_unauthorized: false,
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            redis_url: default_redis_url(),
        }
    }
}

/// `[presence]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct PresenceSection {
    #[serde(default = "default_presence_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            ttl_ms: default_presence_ttl_ms(),
        }
    }
}

/// `[limits]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
    #[serde(default = "default_max_history_page")]
    pub max_history_page: i64,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_frame_bytes: default_max_frame_bytes(),
            max_message_chars: default_max_message_chars(),
            max_history_page: default_max_history_page(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// `[auth]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded HMAC secret for access keys. Random per process if unset,
    /// which invalidates outstanding keys on restart.
    #[serde(default)]
    pub access_key_secret: Option<String>,
    #[serde(default = "default_access_key_ttl")]
    pub access_key_ttl_secs: u64,
    #[serde(default = "default_attempts_per_minute")]
    pub attempts_per_minute: usize,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            access_key_secret: None,
            access_key_ttl_secs: default_access_key_ttl(),
            attempts_per_minute: default_attempts_per_minute(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_connections() -> usize {
    1024
}
fn default_backend() -> String {
    "memory".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_presence_ttl_ms() -> u64 {
    30_000
}
fn default_max_frame_bytes() -> usize {
    murmur_core::codec::DEFAULT_MAX_FRAME_BYTES
}
fn default_max_message_chars() -> usize {
    4096
}
fn default_max_history_page() -> i64 {
    100
}
fn default_outbound_queue() -> usize {
    256
}
fn default_access_key_ttl() -> u64 {
    30 * 24 * 3600
}
fn default_attempts_per_minute() -> usize {
    10
}

/// Which store adapter to run against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis { url: String },
}

impl FromStr for StoreBackend {
    type Err = MurmurError;

    fn from_str(s: &str) -> MurmurResult<Self> {
        match s {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis {
                url: default_redis_url(),
            }),
            other => Err(MurmurError::InvalidArgument(format!(
                "unknown store backend: {other} (expected memory or redis)"
            ))),
        }
    }
}

/// Values given on the command line; each one beats the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_connections: Option<usize>,
    pub store: Option<String>,
    pub redis_url: Option<String>,
    pub presence_ttl_ms: Option<u64>,
}

/// Resolved server configuration (CLI overrides applied, secret decoded).
#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub close_on_unauthorized: bool,
    pub store: StoreBackend,
    pub presence_ttl: Duration,
    pub max_frame_bytes: usize,
    pub max_message_chars: usize,
    pub max_history_page: i64,
    pub outbound_queue: usize,
    pub access_key_secret: Vec<u8>,
    pub access_key_ttl_secs: u64,
    pub auth_attempts_per_minute: usize,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> MurmurResult<Self> {
        let mut file = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| MurmurError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        if let Some(host) = cli.host {
            file.server.host = host;
        }
        if let Some(port) = cli.port {
            file.server.port = port;
        }
        if let Some(max) = cli.max_connections {
            file.server.max_connections = max;
        }
        if let Some(backend) = cli.store {
            file.store.backend = backend;
        }
        if let Some(url) = cli.redis_url {
            file.store.redis_url = url;
        }
        if let Some(ttl) = cli.presence_ttl_ms {
            file.presence.ttl_ms = ttl;
        }

        Self::from_file(file)
    }

    /// Resolve a parsed config file.
    pub fn from_file(file: ConfigFile) -> MurmurResult<Self> {
        let store = match file.store.backend.parse::<StoreBackend>()? {
            StoreBackend::Redis { .. } => StoreBackend::Redis {
                url: file.store.redis_url,
            },
            StoreBackend::Memory => StoreBackend::Memory,
        };

        if file.presence.ttl_ms == 0 {
            return Err(MurmurError::InvalidArgument("presence.ttl_ms must be positive".into()));
        }
        if file.limits.max_history_page <= 0 || file.limits.outbound_queue == 0 {
            return Err(MurmurError::InvalidArgument(
                "limits.max_history_page and limits.outbound_queue must be positive".into(),
            ));
        }

        let access_key_secret = match file.auth.access_key_secret.as_deref() {
            Some(hex_secret) => {
                let secret = hex::decode(hex_secret.trim()).map_err(|e| {
                    MurmurError::InvalidArgument(format!("auth.access_key_secret is not hex: {e}"))
                })?;
                if secret.len() < MIN_SECRET_BYTES {
                    return Err(MurmurError::InvalidArgument(format!(
                        "auth.access_key_secret must be at least {MIN_SECRET_BYTES} bytes, got {}",
                        secret.len()
                    )));
                }
                secret
            }
            None => {
                warn!("no access_key_secret configured, access keys will not survive a restart");
                generate_secret()?
            }
        };

        Ok(Self {
            host: file.server.host,
            port: file.server.port,
            max_connections: file.server.max_connections,
            close_on_unauthorized: file.server.close_on_unauthorized,
            store,
            presence_ttl: Duration::from_millis(file.presence.ttl_ms),
            max_frame_bytes: file.limits.max_frame_bytes,
            max_message_chars: file.limits.max_message_chars,
            max_history_page: file.limits.max_history_page,
            outbound_queue: file.limits.outbound_queue,
            access_key_secret,
            access_key_ttl_secs: file.auth.access_key_ttl_secs,
            auth_attempts_per_minute: file.auth.attempts_per_minute,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let file: ConfigFile = toml::from_str("").unwrap();
        let cfg = ServerConfig::from_file(file).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.store, StoreBackend::Memory);
        assert_eq!(cfg.presence_ttl, Duration::from_secs(30));
        assert_eq!(cfg.access_key_secret.len(), 32);
        assert!(!cfg.close_on_unauthorized);
    }

    #[test]
    fn sections_are_read() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            port = 9000
            close_on_unauthorized = true

            [store]
            backend = "redis"
            redis_url = "redis://cache:6379"

            [presence]
            ttl_ms = 5000

            [limits]
            max_history_page = 20

            [auth]
            access_key_secret = "00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff00ff"
            "#,
        )
        .unwrap();
        let cfg = ServerConfig::from_file(file).unwrap();
        assert_eq!(cfg.port, 9000);
        assert!(cfg.close_on_unauthorized);
        assert_eq!(
            cfg.store,
            StoreBackend::Redis {
                url: "redis://cache:6379".into()
            }
        );
        assert_eq!(cfg.presence_ttl, Duration::from_secs(5));
        assert_eq!(cfg.max_history_page, 20);
        assert_eq!(cfg.access_key_secret, [0x00u8, 0xff].repeat(16));
    }

    #[test]
    fn cli_overrides_win() {
        let cfg = ServerConfig::load(
            None,
            CliOverrides {
                port: Some(0),
                host: Some("127.0.0.1".into()),
                store: Some("memory".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn bad_values_rejected() {
        let file: ConfigFile = toml::from_str("[store]\nbackend = \"sqlite\"").unwrap();
        assert!(ServerConfig::from_file(file).is_err());

        for secret in ["xyz", "", "00ff"] {
            let file: ConfigFile =
                toml::from_str(&format!("[auth]\naccess_key_secret = \"{secret}\"")).unwrap();
            assert!(
                matches!(ServerConfig::from_file(file), Err(MurmurError::InvalidArgument(_))),
                "secret {secret:?} accepted"
            );
        }

        let file: ConfigFile = toml::from_str("[presence]\nttl_ms = 0").unwrap();
        assert!(ServerConfig::from_file(file).is_err());
    }

    #[test]
    fn missing_file_falls_back() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/murmur/config.toml")),
            CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.max_connections, 1024);
    }
}
