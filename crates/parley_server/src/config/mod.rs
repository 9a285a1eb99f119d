#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use parley_domain::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.parley/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".parley").join("config.toml"))
}

/// Load the server config: TOML at `path` (if present), then env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub services: ServicesSettings,
}

/// Delivery-core settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// HTTP bridge bind address (host:port) for internal push and health.
	pub bridge_bind: Option<String>,
	/// Shared secret the bridge requires on push requests.
	pub push_secret: Option<SecretString>,
	/// HMAC secret for stateless access tokens.
	pub auth_hmac_secret: Option<SecretString>,

	/// Largest accepted wire frame, header included.
	pub max_frame_bytes: usize,
	/// Per-connection outbound queue depth.
	pub outbound_queue_capacity: usize,
	pub heartbeat_interval: Duration,
	pub liveness_timeout: Duration,
	pub auth_timeout: Duration,
	pub fanout_workers: usize,
	pub fanout_queue_capacity: usize,
	/// Backlog frames replayed per pass on reconnect.
	pub offline_push_limit: usize,
	pub member_cache_ttl: Duration,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			tls_cert_path: None,
			tls_key_path: None,
			metrics_bind: None,
			bridge_bind: None,
			push_secret: None,
			auth_hmac_secret: None,
			max_frame_bytes: 64 * 1024,
			outbound_queue_capacity: 256,
			heartbeat_interval: Duration::from_secs(54),
			liveness_timeout: Duration::from_secs(60),
			auth_timeout: Duration::from_secs(10),
			fanout_workers: 4,
			fanout_queue_capacity: 256,
			offline_push_limit: 20,
			member_cache_ttl: Duration::from_secs(7 * 24 * 60 * 60),
		}
	}
}

/// Endpoints and timeout for the collaborator HTTP services.
#[derive(Debug, Clone)]
pub struct ServicesSettings {
	pub message_url: Option<String>,
	pub friend_url: Option<String>,
	pub group_url: Option<String>,
	/// Shared secret sent on outgoing collaborator calls.
	pub shared_secret: Option<SecretString>,
	pub rpc_timeout: Duration,
}

impl Default for ServicesSettings {
	fn default() -> Self {
		Self {
			message_url: None,
			friend_url: None,
			group_url: None,
			shared_secret: None,
			rpc_timeout: Duration::from_secs(3),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	services: FileServicesSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	bridge_bind: Option<String>,
	push_secret: Option<String>,
	auth_hmac_secret: Option<String>,
	max_frame_bytes: Option<usize>,
	outbound_queue_capacity: Option<usize>,
	heartbeat_interval_secs: Option<u64>,
	liveness_timeout_secs: Option<u64>,
	auth_timeout_secs: Option<u64>,
	fanout_workers: Option<usize>,
	fanout_queue_capacity: Option<usize>,
	offline_push_limit: Option<usize>,
	member_cache_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServicesSettings {
	message_url: Option<String>,
	friend_url: Option<String>,
	group_url: Option<String>,
	shared_secret: Option<String>,
	rpc_timeout_secs: Option<u64>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerSettings::default();
		let service_defaults = ServicesSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				bridge_bind: file.server.bridge_bind.filter(|s| !s.trim().is_empty()),
				push_secret: file
					.server
					.push_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				auth_hmac_secret: file
					.server
					.auth_hmac_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				max_frame_bytes: file.server.max_frame_bytes.unwrap_or(defaults.max_frame_bytes),
				outbound_queue_capacity: file
					.server
					.outbound_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.outbound_queue_capacity),
				heartbeat_interval: file
					.server
					.heartbeat_interval_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.heartbeat_interval),
				liveness_timeout: file
					.server
					.liveness_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.liveness_timeout),
				auth_timeout: file
					.server
					.auth_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.auth_timeout),
				fanout_workers: file
					.server
					.fanout_workers
					.filter(|v| *v > 0)
					.unwrap_or(defaults.fanout_workers),
				fanout_queue_capacity: file
					.server
					.fanout_queue_capacity
					.filter(|v| *v > 0)
					.unwrap_or(defaults.fanout_queue_capacity),
				offline_push_limit: file
					.server
					.offline_push_limit
					.filter(|v| *v > 0)
					.unwrap_or(defaults.offline_push_limit),
				member_cache_ttl: file
					.server
					.member_cache_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.member_cache_ttl),
			},
			services: ServicesSettings {
				message_url: file.services.message_url.filter(|s| !s.trim().is_empty()),
				friend_url: file.services.friend_url.filter(|s| !s.trim().is_empty()),
				group_url: file.services.group_url.filter(|s| !s.trim().is_empty()),
				shared_secret: file
					.services
					.shared_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				rpc_timeout: file
					.services
					.rpc_timeout_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(service_defaults.rpc_timeout),
			},
		}
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

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("PARLEY_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_BRIDGE_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.bridge_bind = Some(v);
			info!("server config: bridge_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_PUSH_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.push_secret = Some(SecretString::new(v));
			info!("server config: push_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.auth_hmac_secret = Some(SecretString::new(v));
			info!("server auth: auth_hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_MESSAGE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.services.message_url = Some(v);
			info!("services config: message_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_FRIEND_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.services.friend_url = Some(v);
			info!("services config: friend_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_GROUP_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.services.group_url = Some(v);
			info!("services config: group_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_SERVICES_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.services.shared_secret = Some(SecretString::new(v));
			info!("services config: shared_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("PARLEY_RPC_TIMEOUT_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.services.rpc_timeout = Duration::from_secs(secs);
		info!(secs, "services config: rpc_timeout overridden by env");
	}

	if cfg.server.heartbeat_interval >= cfg.server.liveness_timeout {
		warn!(
			heartbeat_secs = cfg.server.heartbeat_interval.as_secs(),
			liveness_secs = cfg.server.liveness_timeout.as_secs(),
			"server config: heartbeat_interval >= liveness_timeout; idle clients will be dropped"
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_without_file() {
		let cfg = ServerConfig::from_file(FileConfig::default());
		assert_eq!(cfg.server.outbound_queue_capacity, 256);
		assert_eq!(cfg.server.heartbeat_interval, Duration::from_secs(54));
		assert_eq!(cfg.server.liveness_timeout, Duration::from_secs(60));
		assert_eq!(cfg.server.offline_push_limit, 20);
		assert_eq!(cfg.server.member_cache_ttl, Duration::from_secs(604_800));
		assert_eq!(cfg.services.rpc_timeout, Duration::from_secs(3));
	}

	#[test]
	fn file_values_override_defaults() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			auth_hmac_secret = "topsecret"
			outbound_queue_capacity = 32
			offline_push_limit = 5

			[services]
			message_url = "http://127.0.0.1:9101"
			rpc_timeout_secs = 1
			"#,
		)
		.expect("parse");

		let cfg = ServerConfig::from_file(file);
		assert!(cfg.server.auth_hmac_secret.is_some());
		assert_eq!(cfg.server.outbound_queue_capacity, 32);
		assert_eq!(cfg.server.offline_push_limit, 5);
		assert_eq!(cfg.services.message_url.as_deref(), Some("http://127.0.0.1:9101"));
		assert_eq!(cfg.services.rpc_timeout, Duration::from_secs(1));
	}

	#[test]
	fn blank_strings_are_treated_as_unset() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			auth_hmac_secret = "  "
			bridge_bind = ""
			"#,
		)
		.expect("parse");

		let cfg = ServerConfig::from_file(file);
		assert!(cfg.server.auth_hmac_secret.is_none());
		assert!(cfg.server.bridge_bind.is_none());
	}
}
