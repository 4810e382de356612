#![forbid(unsafe_code)]

mod bus;
mod config;
mod rpc;
mod server;
mod service;
mod store;
mod util;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use storm_domain::UserId;
use storm_util::endpoint::WsEndpoint;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bus::{Bus, LocalBus, LocalBusConfig};
use crate::config::ServerConfig;
use crate::rpc::{RpcConfig, RpcDispatcher, spawn_rpc_responders};
use crate::server::auth::{AuthClaims, AuthClient, issue_hmac_token, spawn_hmac_authority};
use crate::server::connection::{ProtocolConfig, ProtocolHandler};
use crate::server::health::{HealthState, spawn_health_server};
use crate::server::registry::{Registry, RegistryConfig};
use crate::server::relay::{RelayConfig, spawn_fanout_relay};
use crate::server::transport::{TransportConfig, WsGateway};
use crate::service::{ConversationService, MessageService};
use crate::store::{ConversationRepository, MemoryStore, MessageRepository, SqlStore};
use crate::util::time::unix_secs_now;

/// Lifetime of tokens printed by `--dev-token`.
const DEV_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: storm_server [--bind ws://host:port[/path]] [--config path] [--dev-token user-uuid]\n\
\n\
Options:\n\
\t--bind       Listen endpoint (default: {})\n\
\t             Format: ws://host:port[/path]\n\
\t--config     Config file (default: ~/.storm/config.toml)\n\
\t--dev-token  Print an HMAC dev token for the user and exit\n\
\t--help       Show this help\n\
",
		config::DEFAULT_BIND
	);
	std::process::exit(2)
}

#[derive(Debug, Default)]
struct Args {
	bind: Option<String>,
	config: Option<PathBuf>,
	dev_token_user: Option<String>,
}

fn parse_args() -> Args {
	let mut args = Args::default();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected ws://host:port)");
					usage_and_exit();
				}
				args.bind = Some(v);
			}
			"--config" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				args.config = Some(PathBuf::from(v));
			}
			"--dev-token" => {
				args.dev_token_user = Some(it.next().unwrap_or_else(|| usage_and_exit()));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	args
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,storm_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("storm_server");
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

	match bind.parse::<SocketAddr>() {
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

fn print_dev_token(cfg: &ServerConfig, user: &str) -> anyhow::Result<()> {
	let secret = cfg
		.auth
		.hmac_secret
		.as_ref()
		.ok_or_else(|| anyhow!("--dev-token needs auth.hmac_secret (or STORM_AUTH_HMAC_SECRET)"))?;
	let user = UserId::parse(user).map_err(|e| anyhow!("--dev-token: {e}"))?;

	let claims = AuthClaims {
		sub: user.to_string(),
		name: None,
		exp: unix_secs_now() + DEV_TOKEN_TTL_SECS,
	};
	println!("{}", issue_hmac_token(&claims, secret.expose())?);
	Ok(())
}

async fn open_store(cfg: &ServerConfig) -> anyhow::Result<(Arc<dyn ConversationRepository>, Arc<dyn MessageRepository>)> {
	if !cfg.persistence.enabled {
		info!("using in-memory store");
		let store = Arc::new(MemoryStore::new());
		let conversations: Arc<dyn ConversationRepository> = store.clone();
		let messages: Arc<dyn MessageRepository> = store;
		return Ok((conversations, messages));
	}

	let Some(database_url) = cfg.persistence.database_url.as_deref() else {
		return Err(anyhow!("persistence enabled but no database_url configured"));
	};
	let store = Arc::new(SqlStore::connect(database_url).await?);
	let conversations: Arc<dyn ConversationRepository> = store.clone();
	let messages: Arc<dyn MessageRepository> = store;
	Ok((conversations, messages))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let mut cfg = crate::config::load_server_config_from_path(&config_path)?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	if let Some(user) = args.dev_token_user.as_deref() {
		return print_dev_token(&cfg, user);
	}

	if let Some(bind) = args.bind {
		cfg.gateway.bind = bind;
	}
	let endpoint = WsEndpoint::parse(&cfg.gateway.bind).map_err(|e| anyhow!(e))?;
	let bind_addr = endpoint.to_socket_addr().map_err(|e| anyhow!(e))?;

	info!(
		schema = storm_protocol::version::SCHEMA_VERSION_U32,
		major = storm_protocol::version::SCHEMA_MAJOR,
		minor = storm_protocol::version::SCHEMA_MINOR,
		"storm_server starting"
	);

	init_metrics(cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = cfg.server.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone()).await?;
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let local_bus = Arc::new(LocalBus::new(LocalBusConfig {
		debug_logs: cfg.gateway.debug_logs,
		..LocalBusConfig::default()
	}));
	let bus: Arc<dyn Bus> = local_bus.clone();

	if cfg.rpc.enabled {
		let (conversation_repo, message_repo) = open_store(&cfg).await?;
		let conversations = ConversationService::new(conversation_repo);
		let messages = MessageService::new(message_repo, conversations);
		let dispatcher = RpcDispatcher::new(
			messages,
			bus.clone(),
			RpcConfig {
				max_payload_size: cfg.gateway.max_payload_bytes,
				debug_logs: cfg.gateway.debug_logs,
			},
		);
		spawn_rpc_responders(bus.clone(), dispatcher).await?;
	} else {
		warn!("rpc responders disabled; conversation and message subjects need an external service");
	}

	if let Some(secret) = cfg.auth.hmac_secret.as_ref() {
		spawn_hmac_authority(bus.clone(), secret.expose().to_string()).await?;
	}

	let registry = Registry::new(RegistryConfig {
		debug_logs: cfg.gateway.debug_logs,
	});
	spawn_fanout_relay(
		bus.clone(),
		registry.clone(),
		RelayConfig {
			debug_log_events: cfg.gateway.debug_logs,
		},
	)
	.await?;

	let handler = ProtocolHandler::new(
		registry,
		bus.clone(),
		ProtocolConfig {
			heartbeat_interval: cfg.gateway.heartbeat_interval,
			join_authorize_timeout: cfg.gateway.join_authorize_timeout,
			max_payload_size: cfg.gateway.max_payload_bytes,
			debug_logs: cfg.gateway.debug_logs,
		},
	);
	let gateway = WsGateway::new(
		handler,
		AuthClient::new(bus.clone(), cfg.gateway.auth_timeout),
		TransportConfig {
			endpoint: endpoint.clone(),
			outbound_queue_capacity: cfg.gateway.outbound_queue_capacity,
			require_auth: cfg.gateway.require_auth,
		},
	);

	let listener = TcpListener::bind(bind_addr)
		.await
		.with_context(|| format!("bind {bind_addr}"))?;
	info!(bind = %bind_addr, path = %endpoint.path, require_auth = cfg.gateway.require_auth, "gateway listening");
	health_state.mark_ready();

	let draining = health_state.clone();
	gateway
		.serve(listener, async move {
			if let Err(e) = tokio::signal::ctrl_c().await {
				warn!(error = %e, "failed to listen for ctrl-c");
				std::future::pending::<()>().await;
			}
			info!("shutdown requested; draining");
			draining.mark_draining();
		})
		.await;

	local_bus.close().await;
	info!("storm_server stopped");

	Ok(())
}
