use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use inspectgateway::cache::MemoryCacheStore;
use inspectgateway::config::{self, GatewayConfig};
use inspectgateway::dispatcher::{Dispatcher, NoopEnricher};
use inspectgateway::fleet::Fleet;
use inspectgateway::http::{self, AppState};
use inspectgateway::metrics::{GatewayMetrics, MetricsApp};
use inspectgateway::proxy_pool::ProxyPool;
use inspectgateway::queue::RequestQueue;
use inspectgateway::session::{SessionHandle, SessionId, SimulatedTransport, UpstreamTransport};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Path to the gateway config file (JSON or YAML)
	#[arg(short, long, value_name = "file")]
	file: PathBuf,

	/// Port the `/metrics` exporter listens on
	#[arg(long, default_value_t = 19000)]
	metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let cfg = GatewayConfig::load(&args.file).await?;

	let accounts = config::load_accounts(&cfg.accounts_file).await?;
	let proxy_urls = match &cfg.proxy_pool.proxy_file {
		Some(path) => config::load_proxies(path).await.unwrap_or_else(|err| {
			tracing::warn!(%err, "failed to load proxy file, falling back to a single direct group");
			Vec::new()
		}),
		None => Vec::new(),
	};

	let sessions: Arc<RwLock<HashMap<SessionId, SessionHandle>>> = Arc::new(RwLock::new(HashMap::new()));

	let pool = Arc::new(ProxyPool::new(
		proxy_urls,
		cfg.proxy_pool.max_requests_per_proxy,
		Duration::from_millis(cfg.proxy_pool.request_cooldown_ms),
		cfg.proxy_pool.retry.clone(),
		cfg.proxy_pool.strategy,
		sessions.clone(),
	));

	let transport_factory: Box<dyn Fn() -> Box<dyn UpstreamTransport> + Send + Sync> =
		Box::new(|| Box::new(SimulatedTransport::default()));

	let fleet = Fleet::start(
		accounts,
		pool.clone(),
		sessions.clone(),
		transport_factory,
		cfg.max_online_bots,
		Duration::from_secs(cfg.spare_account_delay_secs),
		Duration::from_millis(cfg.request_delay_ms),
	)
	.await;

	let mut registry = Registry::default();
	let metrics = GatewayMetrics::new(&mut registry);

	let cache = Arc::new(MemoryCacheStore::new());
	let dispatcher = Arc::new(Dispatcher::new(
		pool.clone(),
		cache.clone(),
		Arc::new(NoopEnricher),
		Duration::from_millis(cfg.request_ttl_ms),
		metrics.clone(),
	));

	let queue = RequestQueue::start(dispatcher, fleet.clone(), pool.clone(), cfg.queue.max_attempts);
	metrics.clone().spawn_sampler(fleet.clone(), pool.clone(), queue.clone());

	let bind_addr: SocketAddr = cfg.bind_addr.parse()?;
	let state = AppState::new(&cfg, fleet, pool, queue, cache);
	let app = http::router(state);

	let mut run_set = JoinSet::new();

	let listener = tokio::net::TcpListener::bind(bind_addr).await?;
	run_set.spawn(async move {
		axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await
	});

	let metrics_listener = tokio::net::TcpListener::bind(("0.0.0.0", args.metrics_port)).await?;
	let metrics_app = MetricsApp::new(Arc::new(registry));
	let metrics_router = metrics_app.router();
	run_set.spawn(async move { axum::serve(metrics_listener, metrics_router).await });

	while let Some(result) = run_set.join_next().await {
		result??;
	}
	Ok(())
}
