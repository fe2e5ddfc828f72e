//! C5: the dispatcher. The drain handler C4 invokes for each `QueueEntry` —
//! selects a ready session from C2, issues the inspect, and on success
//! writes the normalized, enriched item into the cache and the Job's slot.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{instrument, warn};

use crate::cache::CacheStore;
use crate::errors::GatewayError;
use crate::metrics::GatewayMetrics;
use crate::proxy_pool::ProxyPool;
use crate::queue::{DispatchHandler, QueueEntry};

/// Rank/game-data annotation is an external collaborator (enrichment
/// tables, price-rank computation) out of scope here; this is the seam a
/// real deployment plugs its enrichment lookups into. The default is a
/// no-op, so the item passes through with only the normalization C1 already
/// did.
#[async_trait::async_trait]
pub trait Enricher: Send + Sync {
	async fn annotate(&self, item: &mut Value);
}

pub struct NoopEnricher;

#[async_trait::async_trait]
impl Enricher for NoopEnricher {
	async fn annotate(&self, _item: &mut Value) {}
}

/// Recursively drop null fields, the last step before a normalized item is
/// handed back to an HTTP caller.
fn strip_nulls(value: &mut Value) {
	match value {
		Value::Object(map) => {
			map.retain(|_, v| !v.is_null());
			for v in map.values_mut() {
				strip_nulls(v);
			}
		},
		Value::Array(items) => {
			for v in items.iter_mut() {
				strip_nulls(v);
			}
		},
		_ => {},
	}
}

pub struct Dispatcher<C: CacheStore, E: Enricher> {
	pool: Arc<ProxyPool>,
	cache: Arc<C>,
	enricher: Arc<E>,
	request_ttl: Duration,
	metrics: Arc<GatewayMetrics>,
}

impl<C: CacheStore, E: Enricher> Dispatcher<C, E> {
	pub fn new(
		pool: Arc<ProxyPool>,
		cache: Arc<C>,
		enricher: Arc<E>,
		request_ttl: Duration,
		metrics: Arc<GatewayMetrics>,
	) -> Self {
		Self { pool, cache, enricher, request_ttl, metrics }
	}
}

#[async_trait::async_trait]
impl<C: CacheStore, E: Enricher> DispatchHandler for Dispatcher<C, E> {
	#[instrument(level = "debug", skip(self, entry), fields(asset_id = %entry.link.triple.a))]
	async fn dispatch(&self, entry: &QueueEntry) -> Result<Duration, GatewayError> {
		let Some(session) = self.pool.select().await else {
			return Err(GatewayError::NoBotsAvailable);
		};

		let result = session.inspect(entry.link.triple.clone(), self.request_ttl).await;
		match result {
			Ok((item, delay)) => {
				let mut value = serde_json::to_value(&item).unwrap_or(Value::Null);
				self.enricher.annotate(&mut value).await;
				strip_nulls(&mut value);

				self.cache.insert(&entry.link.triple.a, value.clone()).await;
				if let Some(price) = &entry.link.price {
					self.cache.update_price(&entry.link.triple.a, price).await;
				}

				entry.job.resolve_slot(entry.slot, Ok(value)).await;
				self.pool.release(session.id, true).await;
				self.metrics.record_dispatch_success();
				Ok(delay)
			},
			Err(message) => {
				self.pool.release(session.id, false).await;
				warn!(session = session.id, error = %message, "inspect failed");
				if message == "ttl exceeded" {
					self.metrics.record_dispatch_error("ttl_exceeded");
					Err(GatewayError::TtlExceeded)
				} else {
					self.metrics.record_dispatch_error("generic_bad");
					Err(GatewayError::GenericBad(message))
				}
			},
		}
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;
	use std::sync::Arc;

	use tokio::sync::RwLock;

	use super::*;
	use crate::cache::MemoryCacheStore;
	use crate::config::RetryPolicyConfig;
	use crate::proxy_pool::SelectionStrategy;
	use crate::queue::{Job, JobLink};
	use crate::session::{RawItemData, RawSticker, SimulatedTransport, Triple, spawn_session};

	fn triple(a: &str) -> Triple {
		Triple { s: "0".into(), a: a.into(), d: "1".into(), m: Some("2".into()) }
	}

	fn test_metrics() -> Arc<GatewayMetrics> {
		let mut registry = prometheus_client::registry::Registry::default();
		GatewayMetrics::new(&mut registry)
	}

	#[tokio::test]
	async fn successful_dispatch_writes_cache_and_resolves_slot() {
		let sessions = Arc::new(RwLock::new(HashMap::new()));
		let pool = Arc::new(ProxyPool::new(
			vec![],
			5,
			Duration::ZERO,
			RetryPolicyConfig::default(),
			SelectionStrategy::LeastLoaded,
			sessions.clone(),
		));

		let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
		let mut transport = SimulatedTransport::default();
		transport.canned_item = RawItemData {
			paintwear: Some(0.05),
			paintseed: None,
			stickers: vec![RawSticker { sticker_id: 7 }],
			extra: Default::default(),
		};
		let handle = spawn_session(1, Box::new(transport), Duration::from_millis(5), tx);
		handle.log_in(
			crate::config::Account { username: "a".into(), password: "p".into(), shared_secret: None },
			None,
		);
		tokio::time::sleep(Duration::from_millis(10)).await;
		sessions.write().await.insert(1, handle);
		pool.distribute(&[1]).await;

		let cache = Arc::new(MemoryCacheStore::new());
		let dispatcher =
			Dispatcher::new(pool, cache.clone(), Arc::new(NoopEnricher), Duration::from_secs(1), test_metrics());

		let (job, mut receivers) = Job::new(
			"127.0.0.1".parse().unwrap(),
			false,
			vec![JobLink { triple: triple("555"), price: Some("1299".into()) }],
		);
		let entry = QueueEntry {
			job: job.clone(),
			slot: 0,
			link: job.links[0].clone(),
			client_ip: job.client_ip,
			attempts: 0,
			max_attempts: 3,
		};

		let delay = dispatcher.dispatch(&entry).await.unwrap();
		assert!(delay <= Duration::from_millis(5));

		let resolved = receivers.remove(0).await.unwrap().unwrap();
		assert_eq!(resolved["floatvalue"], 0.05);
		assert_eq!(resolved["paintseed"], 0);
		assert_eq!(resolved["stickers"][0]["stickerId"], 7);

		let cached = cache.get("555").await.unwrap();
		assert_eq!(cached["price"], "1299");
	}

	#[tokio::test]
	async fn no_ready_session_yields_no_bots_available() {
		let sessions = Arc::new(RwLock::new(HashMap::new()));
		let pool = Arc::new(ProxyPool::new(
			vec![],
			5,
			Duration::ZERO,
			RetryPolicyConfig::default(),
			SelectionStrategy::LeastLoaded,
			sessions,
		));
		let cache = Arc::new(MemoryCacheStore::new());
		let dispatcher = Dispatcher::new(pool, cache, Arc::new(NoopEnricher), Duration::from_secs(1), test_metrics());

		let (job, _receivers) = Job::new(
			"127.0.0.1".parse().unwrap(),
			false,
			vec![JobLink { triple: triple("1"), price: None }],
		);
		let entry = QueueEntry {
			job: job.clone(),
			slot: 0,
			link: job.links[0].clone(),
			client_ip: job.client_ip,
			attempts: 0,
			max_attempts: 3,
		};
		let err = dispatcher.dispatch(&entry).await.unwrap_err();
		assert!(matches!(err, GatewayError::NoBotsAvailable));
	}

	#[test]
	fn strip_nulls_removes_null_fields_recursively() {
		let mut value = serde_json::json!({"a": 1, "b": null, "nested": {"c": null, "d": 2}});
		strip_nulls(&mut value);
		assert_eq!(value, serde_json::json!({"a": 1, "nested": {"d": 2}}));
	}
}
