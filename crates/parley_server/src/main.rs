#![forbid(unsafe_code)]

mod config;
mod quic;
mod server;
mod services;
mod util;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::quic::{QuicListenerConfig, TlsMode};
use crate::server::bridge::{BridgeState, spawn_bridge_server};
use crate::server::connection::{ConnectionSettings, handle_connection};
use crate::server::hub::{Hub, HubConfig};
use crate::server::member_cache::MemberCache;
use crate::server::router::Router;
use crate::services::Services;
use crate::services::http::HttpBackend;
use crate::services::memory::MemoryBackend;

/// Dev-only in-memory collaborator backend enable flag.
const PARLEY_ENABLE_MEMORY_BACKEND_ENV: &str = "PARLEY_ENABLE_MEMORY_BACKEND";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: parley_server [--bind host:port]\n\
\n\
Options:\n\
\t--bind    QUIC bind address (default: 127.0.0.1:18210)\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind = "127.0.0.1:18210".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected host:port)");
					usage_and_exit();
				}
				bind = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	bind.parse::<SocketAddr>().unwrap_or_else(|e| {
		eprintln!("invalid bind address {bind:?}: {e}");
		usage_and_exit();
	})
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,parley_server=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("parley_server");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<std::net::SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn build_services(cfg: &config::ServicesSettings) -> anyhow::Result<Services> {
	let memory_enabled = cfg!(debug_assertions)
		&& std::env::var(PARLEY_ENABLE_MEMORY_BACKEND_ENV)
			.map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
			.unwrap_or(false);

	if memory_enabled {
		info!(
			env = PARLEY_ENABLE_MEMORY_BACKEND_ENV,
			"using dev-only in-memory collaborator backend (enabled by env)"
		);
		let backend = Arc::new(MemoryBackend::new());
		return Ok(Services {
			messages: backend.clone(),
			friends: backend.clone(),
			groups: backend,
			rpc_timeout: cfg.rpc_timeout,
		});
	}

	let (Some(message_url), Some(friend_url), Some(group_url)) =
		(cfg.message_url.clone(), cfg.friend_url.clone(), cfg.group_url.clone())
	else {
		return Err(anyhow::anyhow!(
			"collaborator service URLs are not configured (services.message_url / friend_url / group_url)"
		));
	};

	let backend = Arc::new(
		HttpBackend::new(
			message_url,
			friend_url,
			group_url,
			cfg.shared_secret.clone(),
			cfg.rpc_timeout + Duration::from_secs(1),
		)
		.map_err(|e| anyhow::anyhow!("build collaborator http clients: {e}"))?,
	);

	Ok(Services {
		messages: backend.clone(),
		friends: backend.clone(),
		groups: backend,
		rpc_timeout: cfg.rpc_timeout,
	})
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = crate::config::default_config_path()?;
	let server_cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	let Some(auth_hmac_secret) = server_cfg.server.auth_hmac_secret.clone() else {
		return Err(anyhow::anyhow!(
			"auth_hmac_secret is not configured (server.auth_hmac_secret or PARLEY_AUTH_HMAC_SECRET)"
		));
	};

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let services = build_services(&server_cfg.services)?;

	let member_cache = Arc::new(MemberCache::new(services.clone(), server_cfg.server.member_cache_ttl));
	member_cache.spawn_pruner();

	let hub = Hub::new(
		HubConfig {
			fanout_workers: server_cfg.server.fanout_workers,
			fanout_queue_capacity: server_cfg.server.fanout_queue_capacity,
		},
		services.clone(),
		Arc::clone(&member_cache),
	);
	let router = Router::new(Arc::clone(&hub), services.clone());

	let bridge_state = BridgeState::new(
		Arc::clone(&hub),
		Arc::clone(&member_cache),
		server_cfg.server.push_secret.clone(),
	);
	if let Some(bind) = server_cfg.server.bridge_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_bridge_server(addr, bridge_state.clone());
				info!(%addr, "bridge server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid bridge bind address (expected host:port)"),
		}
	}

	let quic_cfg = QuicListenerConfig::new(bind_addr);
	let tls_mode = if let (Some(cert), Some(key)) = (
		server_cfg.server.tls_cert_path.clone(),
		server_cfg.server.tls_key_path.clone(),
	) {
		info!(cert = %cert.display(), key = %key.display(), "loading TLS cert/key");
		TlsMode::Pem { cert, key }
	} else {
		TlsMode::SelfSigned
	};

	let (endpoint, dev_cert) = quic_cfg.bind(&tls_mode)?;
	match dev_cert {
		Some(cert_der) => info!(
			bind = %bind_addr,
			cert_der_len = cert_der.len(),
			"parley_server: QUIC endpoint ready (dev self-signed cert)"
		),
		None => info!(bind = %bind_addr, "parley_server: QUIC endpoint ready"),
	}

	bridge_state.mark_ready();

	let conn_settings = ConnectionSettings {
		max_frame_bytes: server_cfg.server.max_frame_bytes,
		outbound_queue_capacity: server_cfg.server.outbound_queue_capacity,
		heartbeat_interval: server_cfg.server.heartbeat_interval,
		liveness_timeout: server_cfg.server.liveness_timeout,
		auth_timeout: server_cfg.server.auth_timeout,
		auth_hmac_secret,
		offline_push_limit: server_cfg.server.offline_push_limit,
	};

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("parley_server_connections_total").increment(1);

		let hub = Arc::clone(&hub);
		let router = Arc::clone(&router);
		let services = services.clone();
		let conn_settings = conn_settings.clone();

		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, hub, router, services, conn_settings).await {
						warn!(conn_id, error = %e, "connection handler exited with error");
					}
				}
				Err(e) => {
					warn!(conn_id, error = %e, "failed to establish QUIC connection");
				}
			}
		});
	}

	Ok(())
}
