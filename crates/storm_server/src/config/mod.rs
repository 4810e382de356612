#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use storm_protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use storm_util::secret::SecretString;
use tracing::{info, warn};

pub const DEFAULT_BIND: &str = "ws://127.0.0.1:18300/ws";

/// Default config path: `~/.storm/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".storm").join("config.toml"))
}

/// Load the server config from TOML and `STORM_*` env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub gateway: GatewaySettings,
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
	pub rpc: RpcSettings,
}

/// Realtime gateway settings.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
	/// Listen endpoint (`ws://host:port[/path]`).
	pub bind: String,
	pub heartbeat_interval: Duration,
	pub outbound_queue_capacity: usize,
	/// Close sockets that do not present a valid token.
	pub require_auth: bool,
	pub join_authorize_timeout: Duration,
	pub auth_timeout: Duration,
	pub max_payload_bytes: usize,
	pub debug_logs: bool,
}

impl Default for GatewaySettings {
	fn default() -> Self {
		Self {
			bind: DEFAULT_BIND.to_string(),
			heartbeat_interval: Duration::from_secs(30),
			outbound_queue_capacity: 256,
			require_auth: true,
			join_authorize_timeout: Duration::from_secs(3),
			auth_timeout: Duration::from_secs(2),
			max_payload_bytes: DEFAULT_MAX_PAYLOAD_SIZE,
			debug_logs: false,
		}
	}
}

/// Process-level endpoints.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// When set, this process answers `auth.validate` for HMAC dev tokens.
	pub hmac_secret: Option<SecretString>,
}

#[derive(Debug, Clone, Default)]
pub struct PersistenceSettings {
	/// Use the SQL store instead of the in-memory one.
	pub enabled: bool,
	/// Database URL (sqlite: or postgres:).
	pub database_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RpcSettings {
	/// Serve the conversation and message subjects from this process.
	pub enabled: bool,
}

impl Default for RpcSettings {
	fn default() -> Self {
		Self { enabled: true }
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	gateway: FileGatewaySettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	rpc: FileRpcSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileGatewaySettings {
	bind: Option<String>,
	heartbeat_interval_ms: Option<u64>,
	outbound_queue_capacity: Option<usize>,
	require_auth: Option<bool>,
	join_authorize_timeout_ms: Option<u64>,
	auth_timeout_ms: Option<u64>,
	max_payload_bytes: Option<usize>,
	debug_logs: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	hmac_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	enabled: Option<bool>,
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRpcSettings {
	enabled: Option<bool>,
}

fn non_zero_ms(ms: Option<u64>) -> Option<Duration> {
	ms.filter(|v| *v > 0).map(Duration::from_millis)
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = GatewaySettings::default();
		let gateway = GatewaySettings {
			bind: file
				.gateway
				.bind
				.filter(|s| !s.trim().is_empty())
				.unwrap_or(defaults.bind),
			heartbeat_interval: non_zero_ms(file.gateway.heartbeat_interval_ms).unwrap_or(defaults.heartbeat_interval),
			outbound_queue_capacity: file
				.gateway
				.outbound_queue_capacity
				.filter(|v| *v > 0)
				.unwrap_or(defaults.outbound_queue_capacity),
			require_auth: file.gateway.require_auth.unwrap_or(defaults.require_auth),
			join_authorize_timeout: non_zero_ms(file.gateway.join_authorize_timeout_ms)
				.unwrap_or(defaults.join_authorize_timeout),
			auth_timeout: non_zero_ms(file.gateway.auth_timeout_ms).unwrap_or(defaults.auth_timeout),
			max_payload_bytes: file
				.gateway
				.max_payload_bytes
				.filter(|v| *v > 0)
				.unwrap_or(defaults.max_payload_bytes),
			debug_logs: file.gateway.debug_logs.unwrap_or(false),
		};

		Self {
			gateway,
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			auth: AuthSettings {
				hmac_secret: file
					.auth
					.hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
			persistence: PersistenceSettings {
				enabled: file.persistence.enabled.unwrap_or(false),
				database_url: file.persistence.database_url.filter(|s| !s.trim().is_empty()),
			},
			rpc: RpcSettings {
				enabled: file.rpc.enabled.unwrap_or(true),
			},
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig, env: impl Fn(&str) -> Option<String>) {
	let string = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
	let millis = |key: &str| {
		env(key)
			.and_then(|v| v.trim().parse::<u64>().ok())
			.filter(|v| *v > 0)
	};

	if let Some(v) = string("STORM_GATEWAY_BIND") {
		cfg.gateway.bind = v;
		info!("gateway config: bind overridden by env");
	}

	if let Some(ms) = millis("STORM_HEARTBEAT_INTERVAL_MS") {
		cfg.gateway.heartbeat_interval = Duration::from_millis(ms);
		info!(ms, "gateway config: heartbeat_interval overridden by env");
	}

	if let Some(capacity) = env("STORM_OUTBOUND_QUEUE_CAPACITY")
		.and_then(|v| v.trim().parse::<usize>().ok())
		.filter(|v| *v > 0)
	{
		cfg.gateway.outbound_queue_capacity = capacity;
		info!(capacity, "gateway config: outbound_queue_capacity overridden by env");
	}

	if let Some(required) = env("STORM_REQUIRE_AUTH").as_deref().and_then(parse_env_bool) {
		cfg.gateway.require_auth = required;
		info!(required, "gateway config: require_auth overridden by env");
	}

	if let Some(ms) = millis("STORM_JOIN_AUTHORIZE_TIMEOUT_MS") {
		cfg.gateway.join_authorize_timeout = Duration::from_millis(ms);
		info!(ms, "gateway config: join_authorize_timeout overridden by env");
	}

	if let Some(ms) = millis("STORM_AUTH_TIMEOUT_MS") {
		cfg.gateway.auth_timeout = Duration::from_millis(ms);
		info!(ms, "gateway config: auth_timeout overridden by env");
	}

	if let Some(enabled) = env("STORM_DEBUG_LOGS").as_deref().and_then(parse_env_bool) {
		cfg.gateway.debug_logs = enabled;
		info!(enabled, "gateway config: debug_logs overridden by env");
	}

	if let Some(v) = string("STORM_METRICS_BIND") {
		cfg.server.metrics_bind = Some(v);
		info!("server config: metrics_bind overridden by env");
	}

	if let Some(v) = string("STORM_HEALTH_BIND") {
		cfg.server.health_bind = Some(v);
		info!("server config: health_bind overridden by env");
	}

	if let Some(v) = string("STORM_AUTH_HMAC_SECRET") {
		cfg.auth.hmac_secret = Some(SecretString::new(v));
		info!("server auth: hmac_secret overridden by env");
	}

	if let Some(enabled) = env("STORM_PERSISTENCE_ENABLED").as_deref().and_then(parse_env_bool) {
		cfg.persistence.enabled = enabled;
		info!(enabled, "persistence: enabled overridden by env");
	}

	if let Some(v) = string("STORM_PERSISTENCE_DATABASE_URL") {
		cfg.persistence.database_url = Some(v);
		info!("persistence: database_url overridden by env");
	}

	if let Some(enabled) = env("STORM_RPC_ENABLED").as_deref().and_then(parse_env_bool) {
		cfg.rpc.enabled = enabled;
		info!(enabled, "rpc: enabled overridden by env");
	}

	if cfg.gateway.require_auth && cfg.auth.hmac_secret.is_none() {
		warn!("gateway requires auth but no hmac_secret is set; an external auth.validate responder is needed");
	}
}
