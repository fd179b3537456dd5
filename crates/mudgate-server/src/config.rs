//! Broker configuration: TOML file + CLI overrides + `DEBUG` environment.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mudgate_core::{GateError, GateResult};
use serde::Deserialize;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub sounds: SoundsSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Debug surface bind address. Defaults to the listen port + 1.
    #[serde(default)]
    pub debug_listen: Option<String>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            debug_listen: None,
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[upstream]` section: the remote MUD endpoint and socket tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default = "default_mud_host")]
    pub host: String,
    #[serde(default = "default_mud_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_quit_grace")]
    pub quit_grace_ms: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            host: default_mud_host(),
            port: default_mud_port(),
            connect_timeout_secs: default_connect_timeout(),
            write_timeout_secs: default_write_timeout(),
            quit_grace_ms: default_quit_grace(),
        }
    }
}

/// `[session]` section: history, queue, and lifetime budgets.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default = "default_history_bytes")]
    pub history_max_bytes: usize,
    #[serde(default = "default_history_lines")]
    pub history_max_lines: usize,
    #[serde(default = "default_command_queue")]
    pub command_queue_max: usize,
    #[serde(default = "default_command_bytes")]
    pub command_max_bytes: usize,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_login_grace")]
    pub login_grace_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            history_max_bytes: default_history_bytes(),
            history_max_lines: default_history_lines(),
            command_queue_max: default_command_queue(),
            command_max_bytes: default_command_bytes(),
            idle_timeout_secs: default_idle_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            login_grace_secs: default_login_grace(),
        }
    }
}

/// `[limits]` section: per-transport and buffering limits.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsSection {
    #[serde(default = "default_rate_frames")]
    pub rate_max_frames: u32,
    #[serde(default = "default_rate_window")]
    pub rate_window_ms: u64,
    #[serde(default = "default_highwater")]
    pub transport_write_highwater: usize,
    #[serde(default = "default_partial_flush")]
    pub partial_flush_ms: u64,
    #[serde(default = "default_partial_prompt")]
    pub partial_prompt_bytes: usize,
    #[serde(default = "default_partial_max")]
    pub partial_buffer_max: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            rate_max_frames: default_rate_frames(),
            rate_window_ms: default_rate_window(),
            transport_write_highwater: default_highwater(),
            partial_flush_ms: default_partial_flush(),
            partial_prompt_bytes: default_partial_prompt(),
            partial_buffer_max: default_partial_max(),
        }
    }
}

/// `[sounds]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SoundsSection {
    /// Path to the sound rule document. No rules are loaded when absent.
    #[serde(default)]
    pub rules: Option<String>,
}

fn default_listen() -> String {
    "0.0.0.0:4000".to_string()
}
fn default_max_sessions() -> usize {
    50
}
fn default_mud_host() -> String {
    "localhost".to_string()
}
fn default_mud_port() -> u16 {
    4201
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_write_timeout() -> u64 {
    5
}
fn default_quit_grace() -> u64 {
    500
}
fn default_history_bytes() -> usize {
    512 * 1024
}
fn default_history_lines() -> usize {
    2000
}
fn default_command_queue() -> usize {
    10
}
fn default_command_bytes() -> usize {
    512
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_sweep_interval() -> u64 {
    60
}
fn default_login_grace() -> u64 {
    10
}
fn default_rate_frames() -> u32 {
    20
}
fn default_rate_window() -> u64 {
    1000
}
fn default_highwater() -> usize {
    256
}
fn default_partial_flush() -> u64 {
    200
}
fn default_partial_prompt() -> usize {
    4096
}
fn default_partial_max() -> usize {
    64 * 1024
}

/// CLI overrides, all optional; `Some` wins over the file value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub debug_listen: Option<String>,
    pub mud_host: Option<String>,
    pub mud_port: Option<u16>,
    pub rules: Option<String>,
    pub max_sessions: Option<usize>,
    pub write_timeout_secs: Option<u64>,
    pub quit_grace_ms: Option<u64>,
    pub history_max_lines: Option<usize>,
    pub history_max_bytes: Option<usize>,
    pub command_queue_max: Option<usize>,
    pub command_max_bytes: Option<usize>,
    pub idle_timeout_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub login_grace_secs: Option<u64>,
    pub rate_max_frames: Option<u32>,
    pub rate_window_ms: Option<u64>,
    pub transport_write_highwater: Option<usize>,
    pub partial_flush_ms: Option<u64>,
    pub partial_prompt_bytes: Option<usize>,
    pub partial_buffer_max: Option<usize>,
}

/// Resolved broker configuration (file merged with CLI, addresses parsed).
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub listen: SocketAddr,
    /// Whether the debug surface is enabled (`DEBUG=true|1|yes`).
    pub debug: bool,
    pub debug_listen: SocketAddr,
    pub max_sessions: usize,

    pub mud_host: String,
    pub mud_port: u16,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub quit_grace: Duration,

    pub history_max_bytes: usize,
    pub history_max_lines: usize,
    pub command_queue_max: usize,
    pub command_max_bytes: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub login_grace: Duration,

    pub rate_max_frames: u32,
    pub rate_window: Duration,
    pub transport_write_highwater: usize,
    pub partial_flush_interval: Duration,
    pub partial_prompt_bytes: usize,
    pub partial_buffer_max: usize,

    pub rules_path: Option<PathBuf>,
}

impl GateConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// A missing config file is not an error; defaults are used silently.
    /// An existing file that fails to read or parse is a config error.
    pub fn load(config_path: Option<&Path>, cli: Overrides) -> GateResult<Self> {
        let file = match config_path {
            Some(path) if path.exists() => {
                info!(path = %path.display(), "loading config file");
                let content = std::fs::read_to_string(path)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| GateError::Other(format!("config parse error: {e}")))?
            }
            Some(path) => {
                info!(path = %path.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
            None => ConfigFile::default(),
        };

        let listen_str = cli.listen.unwrap_or(file.server.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|e| GateError::Other(format!("invalid listen address '{listen_str}': {e}")))?;

        let debug_listen_str = cli
            .debug_listen
            .or(file.server.debug_listen)
            .unwrap_or_else(|| {
                let port = listen.port().saturating_add(1);
                format!("{}:{port}", listen.ip())
            });
        let debug_listen: SocketAddr = debug_listen_str.parse().map_err(|e| {
            GateError::Other(format!("invalid debug address '{debug_listen_str}': {e}"))
        })?;

        Ok(Self {
            listen,
            debug: debug_env_enabled(),
            debug_listen,
            max_sessions: cli.max_sessions.unwrap_or(file.server.max_sessions),

            mud_host: cli.mud_host.unwrap_or(file.upstream.host),
            mud_port: cli.mud_port.unwrap_or(file.upstream.port),
            connect_timeout: Duration::from_secs(file.upstream.connect_timeout_secs),
            write_timeout: Duration::from_secs(
                cli.write_timeout_secs
                    .unwrap_or(file.upstream.write_timeout_secs),
            ),
            quit_grace: Duration::from_millis(
                cli.quit_grace_ms.unwrap_or(file.upstream.quit_grace_ms),
            ),

            history_max_bytes: cli
                .history_max_bytes
                .unwrap_or(file.session.history_max_bytes),
            history_max_lines: cli
                .history_max_lines
                .unwrap_or(file.session.history_max_lines),
            command_queue_max: cli
                .command_queue_max
                .unwrap_or(file.session.command_queue_max),
            command_max_bytes: cli
                .command_max_bytes
                .unwrap_or(file.session.command_max_bytes),
            idle_timeout: Duration::from_secs(
                cli.idle_timeout_secs.unwrap_or(file.session.idle_timeout_secs),
            ),
            sweep_interval: Duration::from_secs(
                cli.sweep_interval_secs
                    .unwrap_or(file.session.sweep_interval_secs),
            ),
            login_grace: Duration::from_secs(
                cli.login_grace_secs.unwrap_or(file.session.login_grace_secs),
            ),

            rate_max_frames: cli.rate_max_frames.unwrap_or(file.limits.rate_max_frames),
            rate_window: Duration::from_millis(
                cli.rate_window_ms.unwrap_or(file.limits.rate_window_ms),
            ),
            transport_write_highwater: cli
                .transport_write_highwater
                .unwrap_or(file.limits.transport_write_highwater),
            partial_flush_interval: Duration::from_millis(
                cli.partial_flush_ms.unwrap_or(file.limits.partial_flush_ms),
            ),
            partial_prompt_bytes: cli
                .partial_prompt_bytes
                .unwrap_or(file.limits.partial_prompt_bytes),
            partial_buffer_max: cli
                .partial_buffer_max
                .unwrap_or(file.limits.partial_buffer_max),

            rules_path: cli.rules.or(file.sounds.rules).map(PathBuf::from),
        })
    }
}

/// `DEBUG=true|1|yes` (case-insensitive) enables the inspection endpoints.
pub(crate) fn debug_env_enabled() -> bool {
    std::env::var("DEBUG")
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = GateConfig::load(None, Overrides::default()).unwrap();
        assert_eq!(cfg.max_sessions, 50);
        assert_eq!(cfg.history_max_lines, 2000);
        assert_eq!(cfg.history_max_bytes, 512 * 1024);
        assert_eq!(cfg.command_queue_max, 10);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(600));
        assert_eq!(cfg.rate_max_frames, 20);
        assert_eq!(cfg.transport_write_highwater, 256);
        assert_eq!(cfg.debug_listen.port(), cfg.listen.port() + 1);
    }

    #[test]
    fn file_sections_parse() {
        let file: ConfigFile = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            max_sessions = 5

            [upstream]
            host = "mud.example.com"
            port = 2223

            [session]
            idle_timeout_secs = 300

            [sounds]
            rules = "rules.toml"
            "#,
        )
        .unwrap();
        assert_eq!(file.server.listen, "127.0.0.1:9000");
        assert_eq!(file.server.max_sessions, 5);
        assert_eq!(file.upstream.port, 2223);
        assert_eq!(file.session.idle_timeout_secs, 300);
        assert_eq!(file.sounds.rules.as_deref(), Some("rules.toml"));
        // Untouched sections fall back to defaults.
        assert_eq!(file.limits.rate_max_frames, 20);
    }

    #[test]
    fn cli_overrides_win() {
        let cli = Overrides {
            listen: Some("127.0.0.1:7777".into()),
            mud_host: Some("other.example".into()),
            max_sessions: Some(2),
            write_timeout_secs: Some(9),
            rate_max_frames: Some(40),
            partial_buffer_max: Some(1024),
            login_grace_secs: Some(3),
            ..Overrides::default()
        };
        let cfg = GateConfig::load(None, cli).unwrap();
        assert_eq!(cfg.listen.port(), 7777);
        assert_eq!(cfg.mud_host, "other.example");
        assert_eq!(cfg.max_sessions, 2);
        assert_eq!(cfg.write_timeout, Duration::from_secs(9));
        assert_eq!(cfg.rate_max_frames, 40);
        assert_eq!(cfg.partial_buffer_max, 1024);
        assert_eq!(cfg.login_grace, Duration::from_secs(3));
    }

    #[test]
    fn bad_listen_address_is_config_error() {
        let cli = Overrides {
            listen: Some("not-an-address".into()),
            ..Overrides::default()
        };
        assert!(GateConfig::load(None, cli).is_err());
    }
}
