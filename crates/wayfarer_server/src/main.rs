#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wayfarer_server::config::{ChatSettings, load_server_config};
use wayfarer_server::quic::config::{CertSource, QuicServerConfig};
use wayfarer_server::server::deps::ChatDeps;
use wayfarer_server::server::health::{HealthState, spawn_health_server};
use wayfarer_server::server::session::handle_connection;
use wayfarer_services::{
	HmacIdentityProvider, SecretString, TierEntitlementProvider, sign_token, spawn_rate_limit_sweeper,
};
use wayfarer_store::{MemStore, MemberMeta, PresenceStore, RoomDoc, RoomRegistry, UserRecord};
use wayfarer_util::endpoint::QuicEndpoint;
use wayfarer_util::time::{unix_ms_now, unix_secs_now};

/// Dev-only demo seeding flag.
const WAYFARER_ENABLE_DEMO_SEED_ENV: &str = "WAYFARER_ENABLE_DEMO_SEED";

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: wayfarer_server [--bind quic://host:port]\n\
\n\
Options:\n\
\t--bind    Bind endpoint (default: quic://127.0.0.1:18421)\n\
\t         Format: quic://host:port\n\
\t--help   Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> SocketAddr {
	let mut bind_endpoint = "quic://127.0.0.1:18421".to_string();

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--bind" | "--listen" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--bind must be non-empty (expected quic://host:port)");
					usage_and_exit();
				}
				bind_endpoint = v;
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let bind = QuicEndpoint::parse(&bind_endpoint).unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	});

	bind.to_socket_addr_if_ip_literal().unwrap_or_else(|e| {
		eprintln!("{e}");
		usage_and_exit();
	})
}

fn init_rustls_crypto_provider() {
	let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,wayfarer_server=debug".to_string());

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
				let tracer = tracer_provider.tracer("wayfarer_server");
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

/// Seed a couple of demo users and rooms so a fresh dev server is usable
/// immediately. Gated behind an env flag and debug builds.
async fn seed_demo_data(store: &Arc<MemStore>, secret: &SecretString, chat: &ChatSettings) -> anyhow::Result<()> {
	let presence = PresenceStore::new(Arc::clone(store) as Arc<dyn wayfarer_store::DocumentStore>);
	let registry = RoomRegistry::new(Arc::clone(store) as Arc<dyn wayfarer_store::DocumentStore>);
	let now = unix_ms_now();

	let users = [("ana", "Ana"), ("ben", "Ben"), ("mia", "Mia")];
	for (id, name) in users {
		let uid = wayfarer_domain::UserId::new(id)?;
		presence
			.insert_user_record(
				&uid,
				&UserRecord {
					display_name: name.to_string(),
					role: wayfarer_domain::UserRole::User,
					active: true,
					online: false,
					last_seen_unix_ms: 0,
				},
			)
			.await?;

		let token = sign_token(id, unix_secs_now() + 24 * 3600, secret.expose());
		info!(user = id, %token, "demo seed: user token");
	}

	for (room, name, room_type) in [
		("general", "General", wayfarer_domain::RoomType::Public),
		("backpackers-eu", "Backpackers EU", wayfarer_domain::RoomType::TravelPartner),
	] {
		let room_id = wayfarer_domain::RoomId::new(room)?;
		registry
			.create_room(&room_id, &RoomDoc::new(name, room_type, chat.default_max_members, now))
			.await?;
		// First seeded user administers the demo rooms.
		registry
			.add_member(
				&room_id,
				&wayfarer_domain::UserId::new("ana")?,
				MemberMeta {
					role: wayfarer_domain::RoomRole::Admin,
					joined_at_unix_ms: now,
					last_read_unix_ms: now,
				},
				true,
			)
			.await?;
	}

	info!("demo seed: users and rooms created");
	Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_rustls_crypto_provider();
	init_tracing();

	let bind_addr = parse_args();

	let config_path = wayfarer_server::config::default_config_path()?;
	let server_cfg = load_server_config()?;
	info!(path = %config_path.display(), "loaded server config (toml + env overrides)");

	init_metrics(server_cfg.server.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = server_cfg.server.health_bind.as_deref() {
		match bind.parse::<std::net::SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let cert_source = match (
		server_cfg.server.tls_cert_path.as_deref(),
		server_cfg.server.tls_key_path.as_deref(),
	) {
		(Some(cert), Some(key)) => {
			info!(cert = %cert.display(), key = %key.display(), "loading TLS cert/key");
			CertSource::Files {
				cert: cert.to_path_buf(),
				key: key.to_path_buf(),
			}
		}
		_ => CertSource::DevSelfSigned,
	};

	let (endpoint, dev_cert) = QuicServerConfig::new(bind_addr, cert_source).bind_endpoint()?;
	if let Some(cert_der) = dev_cert {
		info!(
			bind = %bind_addr,
			cert_der_len = cert_der.len(),
			"wayfarer_server: QUIC endpoint ready (dev self-signed cert)"
		);
	} else {
		info!(bind = %bind_addr, "wayfarer_server: QUIC endpoint ready");
	}

	let auth_secret = server_cfg.server.auth_hmac_secret.clone().unwrap_or_else(|| {
		warn!("no auth_hmac_secret configured; using the dev secret (never do this in production)");
		SecretString::new("wayfarer-dev-secret")
	});

	let store = MemStore::shared();

	let seed_enabled = cfg!(debug_assertions)
		&& std::env::var(WAYFARER_ENABLE_DEMO_SEED_ENV)
			.map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
			.unwrap_or(false);
	if seed_enabled {
		info!(env = WAYFARER_ENABLE_DEMO_SEED_ENV, "seeding demo users and rooms");
		seed_demo_data(&store, &auth_secret, &server_cfg.chat).await?;
	}

	let doc_store: Arc<dyn wayfarer_store::DocumentStore> = store;
	let presence = PresenceStore::new(Arc::clone(&doc_store));
	let identity = HmacIdentityProvider::new(auth_secret, presence);
	let entitlement = TierEntitlementProvider::new(Arc::clone(&doc_store));

	let deps = ChatDeps::new(doc_store, identity, entitlement, server_cfg.chat.clone());

	let _sweeper = spawn_rate_limit_sweeper(deps.limiter.clone(), server_cfg.chat.rate_limit_sweep_interval);

	health_state.mark_ready();

	let mut next_conn_id: u64 = 1;

	loop {
		let Some(connecting) = endpoint.accept().await else {
			break;
		};

		let conn_id = next_conn_id;
		next_conn_id += 1;
		metrics::counter!("wayfarer_server_connections_total").increment(1);
		health_state.record_connection();

		let deps = Arc::clone(&deps);
		tokio::spawn(async move {
			match connecting.await {
				Ok(connection) => {
					info!(conn_id, remote = %connection.remote_address(), "accepted connection");
					if let Err(e) = handle_connection(conn_id, connection, deps).await {
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
