//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags** — applied by `main` after loading
//! 2. **Environment variables** — `PORT`, `VIBETUNNEL_CONTROL_DIR`
//! 3. **Config file** — path via `--config <path>`, or `vibetunnel.toml` in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 4020
//! control_dir = "~/.vibetunnel/control"
//! allow_column_resize = true
//!
//! [auth]
//! enabled = true
//! local_token = "secret"
//! allow_local_bypass = false
//!
//! [logging]
//! level = "info"
//!
//! # Optional — omit entirely for a standalone node
//! [hq]
//! enabled = false                      # true = run as HQ
//! url = "https://hq.example.com"       # remote mode: register with this HQ
//! username = "hq-admin"
//! password = "secret"
//! name = "node-1"
//! allow_insecure = false               # permit http:// HQ URLs
//! ```

use std::path::Path;

use serde::Deserialize;

use crate::util::expand_tilde;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Optional federation configuration (HQ or remote role).
    pub hq: Option<HqConfig>,
}

/// HTTP server and session settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to bind (default `0.0.0.0`).
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Port to listen on (default 4020).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Root of the per-session control directory tree.
    #[serde(default = "default_control_dir")]
    pub control_dir: String,
    /// Maximum concurrent TCP connections (default 256).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// When false, resize requests that change the column count are ignored.
    #[serde(default = "default_true")]
    pub allow_column_resize: bool,
    /// Default TERM value for new sessions.
    #[serde(default = "default_term")]
    pub term: String,
    /// Default terminal rows for new sessions (default 24).
    #[serde(default = "default_terminal_rows")]
    pub default_rows: u16,
    /// Default terminal columns for new sessions (default 80).
    #[serde(default = "default_terminal_cols")]
    pub default_cols: u16,
    /// Seconds between SIGTERM and SIGKILL when killing a session.
    #[serde(default = "default_kill_grace_secs")]
    pub kill_grace_secs: u64,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Master switch; `--no-auth` sets this to false.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bearer token accepted from any origin. `None` means only the
    /// HQ-issued token (remote mode) or local bypass can authenticate.
    #[serde(default)]
    pub local_token: Option<String>,
    /// Accept unauthenticated requests from loopback addresses.
    #[serde(default)]
    pub allow_local_bypass: bool,
    /// Advertise SSH-key authentication to clients.
    #[serde(default)]
    pub enable_ssh_keys: bool,
    /// Refuse password credentials; implies `enable_ssh_keys`.
    #[serde(default)]
    pub disallow_user_password: bool,
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is unset (default `info`).
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Federation settings. `enabled` selects the HQ role; `url` selects the
/// remote role (register with that HQ on startup). The two are exclusive.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HqConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Name this node registers under; must be unique across the HQ.
    #[serde(default)]
    pub name: Option<String>,
    /// Permit `http://` HQ URLs.
    #[serde(default)]
    pub allow_insecure: bool,
    /// URL the HQ should use to reach this node. Defaults to
    /// `http://<hostname>:<port>`.
    #[serde(default)]
    pub advertise_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            control_dir: default_control_dir(),
            max_connections: default_max_connections(),
            allow_column_resize: true,
            term: default_term(),
            default_rows: default_terminal_rows(),
            default_cols: default_terminal_cols(),
            kill_grace_secs: default_kill_grace_secs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            local_token: None,
            allow_local_bypass: false,
            enable_ssh_keys: false,
            disallow_user_password: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
            hq: None,
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4020
}

fn default_control_dir() -> String {
    "~/.vibetunnel/control".to_string()
}

fn default_max_connections() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

fn default_terminal_rows() -> u16 {
    24
}

fn default_terminal_cols() -> u16 {
    80
}

fn default_kill_grace_secs() -> u64 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// Missing file (when not explicitly requested) falls back to defaults; a
    /// malformed file is a hard error surfaced to the caller.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = match path {
            Some(p) => {
                let contents = std::fs::read_to_string(p)
                    .map_err(|e| format!("failed to read config {p}: {e}"))?;
                toml::from_str(&contents).map_err(|e| format!("failed to parse config {p}: {e}"))?
            }
            None => {
                if Path::new("vibetunnel.toml").exists() {
                    let contents = std::fs::read_to_string("vibetunnel.toml")
                        .map_err(|e| format!("failed to read vibetunnel.toml: {e}"))?;
                    toml::from_str(&contents)
                        .map_err(|e| format!("failed to parse vibetunnel.toml: {e}"))?
                } else {
                    Config::default()
                }
            }
        };

        if let Ok(port) = std::env::var("PORT") {
            if let Ok(port) = port.parse() {
                config.server.port = port;
            }
        }
        if let Ok(dir) = std::env::var("VIBETUNNEL_CONTROL_DIR") {
            config.server.control_dir = dir;
        }

        Ok(config)
    }

    /// The expanded control-directory path.
    pub fn control_dir(&self) -> String {
        expand_tilde(&self.server.control_dir).into_owned()
    }

    /// The socket address string to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    /// Validate the configuration, returning all problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(ref hq) = self.hq {
            if hq.enabled && hq.url.is_some() {
                errors.push("hq.enabled and hq.url are mutually exclusive".to_string());
            }
            if let Some(ref url) = hq.url {
                if !url.starts_with("https://") && !hq.allow_insecure {
                    errors.push(format!(
                        "hq.url must be https:// (got {url}); set allow_insecure to override"
                    ));
                }
                if hq.name.is_none() {
                    errors.push("hq.name is required when registering with an HQ".to_string());
                }
                if hq.username.is_none() || hq.password.is_none() {
                    errors
                        .push("hq.username and hq.password are required for registration".to_string());
                }
            }
        }

        if self.auth.disallow_user_password && !self.auth.enable_ssh_keys {
            // --disallow-user-password implies --enable-ssh-keys; callers
            // normalize before validate, so reaching this is a bug.
            errors.push("disallow_user_password requires enable_ssh_keys".to_string());
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 4020);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert!(config.auth.enabled);
        assert!(config.server.allow_column_resize);
        assert!(config.hq.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 5000
            control_dir = "/tmp/vt"

            [auth]
            enabled = false

            [hq]
            enabled = true
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.control_dir, "/tmp/vt");
        assert!(!config.auth.enabled);
        assert!(config.hq.as_ref().unwrap().enabled);
        // unspecified fields keep defaults
        assert_eq!(config.server.default_cols, 80);
    }

    #[test]
    fn test_validate_insecure_hq_url() {
        let mut config = Config::default();
        config.hq = Some(HqConfig {
            url: Some("http://hq.local:4020".to_string()),
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            name: Some("r-0".to_string()),
            ..HqConfig::default()
        });
        assert_eq!(config.validate().len(), 1);

        config.hq.as_mut().unwrap().allow_insecure = true;
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validate_remote_requires_name() {
        let mut config = Config::default();
        config.hq = Some(HqConfig {
            url: Some("https://hq.local".to_string()),
            username: Some("u".to_string()),
            password: Some("p".to_string()),
            ..HqConfig::default()
        });
        assert!(config
            .validate()
            .iter()
            .any(|e| e.contains("name is required")));
    }
}
