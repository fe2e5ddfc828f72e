//! Ambient observability: a `prometheus_client` registry populated by the
//! fleet, proxy pool, queue and dispatcher, served over `/metrics`, mirroring
//! the teacher's `App`/registry-registration pattern.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::fleet::Fleet;
use crate::proxy_pool::ProxyPool;
use crate::queue::{DispatchHandler, RequestQueue};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DispatchLabel {
	pub result: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ProxyGroupLabel {
	pub group: String,
}

/// Domain metrics for the dispatch fabric: fleet health, queue depth, proxy
/// group load, and per-dispatch outcomes.
pub struct GatewayMetrics {
	fleet_online: Gauge,
	fleet_total: Gauge,
	queue_depth: Gauge,
	queue_concurrency: Gauge,
	proxy_active_requests: Family<ProxyGroupLabel, Gauge>,
	dispatch_total: Family<DispatchLabel, Counter>,
}

impl GatewayMetrics {
	pub fn new(registry: &mut Registry) -> Arc<Self> {
		let sub = registry.sub_registry_with_prefix("inspectgateway");

		let fleet_online = Gauge::default();
		sub.register("fleet_online_sessions", "Sessions currently ready", fleet_online.clone());

		let fleet_total = Gauge::default();
		sub.register("fleet_total_sessions", "Sessions the fleet currently owns", fleet_total.clone());

		let queue_depth = Gauge::default();
		sub.register("queue_depth", "Entries waiting in the request queue", queue_depth.clone());

		let queue_concurrency = Gauge::default();
		sub.register("queue_concurrency", "Current queue concurrency ceiling", queue_concurrency.clone());

		let proxy_active_requests = Family::default();
		sub.register(
			"proxy_group_active_requests",
			"In-flight requests per proxy group",
			proxy_active_requests.clone(),
		);

		let dispatch_total = Family::default();
		sub.register("dispatch_total", "Dispatch attempts by outcome", dispatch_total.clone());

		Arc::new(Self {
			fleet_online,
			fleet_total,
			queue_depth,
			queue_concurrency,
			proxy_active_requests,
			dispatch_total,
		})
	}

	pub fn record_dispatch_success(&self) {
		self
			.dispatch_total
			.get_or_create(&DispatchLabel { result: "success".to_string() })
			.inc();
	}

	pub fn record_dispatch_error(&self, kind: &str) {
		self
			.dispatch_total
			.get_or_create(&DispatchLabel { result: kind.to_string() })
			.inc();
	}

	/// Periodically samples the fleet/queue/pool's current state into
	/// gauges; these three subsystems don't otherwise know about the metrics
	/// registry, so this keeps their core logic free of instrumentation
	/// calls.
	pub fn spawn_sampler<H: DispatchHandler + 'static>(
		self: Arc<Self>,
		fleet: Arc<Fleet>,
		pool: Arc<ProxyPool>,
		queue: Arc<RequestQueue<H>>,
	) {
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(Duration::from_secs(1));
			loop {
				tick.tick().await;
				let status = fleet.status().await;
				self.fleet_online.set(status.online as i64);
				self.fleet_total.set(status.total as i64);
				self.queue_depth.set(queue.queue_size().await as i64);
				self.queue_concurrency.set(queue.concurrency() as i64);
				for (id, active, _total, _rate) in pool.group_stats().await {
					self
						.proxy_active_requests
						.get_or_create(&ProxyGroupLabel { group: id.to_string() })
						.set(active as i64);
				}
			}
		});
	}
}

#[derive(Clone)]
pub struct MetricsApp {
	registry: Arc<Registry>,
}

impl MetricsApp {
	pub fn new(registry: Arc<Registry>) -> Self {
		Self { registry }
	}

	pub fn router(&self) -> Router {
		Router::new().route("/metrics", get(metrics_handler)).with_state(self.clone())
	}
}

async fn metrics_handler(State(app): State<MetricsApp>) -> Result<String, StatusCode> {
	let mut buffer = String::new();
	encode(&mut buffer, &app.registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
	Ok(buffer)
}
