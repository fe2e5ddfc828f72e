//! C4: the request queue. FIFO with priority for retries, bounded per-client
//! and globally, with concurrency tracking the live ready-session count.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify, oneshot};
use tracing::warn;

use crate::errors::GatewayError;
use crate::fleet::Fleet;
use crate::proxy_pool::ProxyPool;
use crate::session::Triple;

/// A single link inside a submitted [`Job`], the unit C7 builds and C4/C5
/// move around.
#[derive(Clone, Debug)]
pub struct JobLink {
	pub triple: Triple,
	pub price: Option<String>,
}

type LinkResult = Result<Value, GatewayError>;

/// A client-submitted batch. Each slot resolves exactly once, whether from a
/// cache hit (resolved immediately by C7) or from the dispatcher after an
/// upstream round trip.
pub struct Job {
	pub client_ip: IpAddr,
	pub bulk: bool,
	pub links: Vec<JobLink>,
	slots: Vec<Mutex<Option<oneshot::Sender<LinkResult>>>>,
}

impl Job {
	pub fn new(client_ip: IpAddr, bulk: bool, links: Vec<JobLink>) -> (Arc<Job>, Vec<oneshot::Receiver<LinkResult>>) {
		let mut senders = Vec::with_capacity(links.len());
		let mut receivers = Vec::with_capacity(links.len());
		for _ in &links {
			let (tx, rx) = oneshot::channel();
			senders.push(Mutex::new(Some(tx)));
			receivers.push(rx);
		}
		(
			Arc::new(Job { client_ip, bulk, links, slots: senders }),
			receivers,
		)
	}

	/// Resolve one link slot. A job completes once every slot has resolved;
	/// resolving an already-resolved slot (which should never happen) is a
	/// silent no-op rather than a panic, since the sender is simply gone.
	pub async fn resolve_slot(&self, slot: usize, result: LinkResult) {
		if let Some(tx) = self.slots[slot].lock().await.take() {
			let _ = tx.send(result);
		}
	}
}

/// One link pulled out of a Job, queued for dispatch.
#[derive(Clone)]
pub struct QueueEntry {
	pub job: Arc<Job>,
	pub slot: usize,
	pub link: JobLink,
	pub client_ip: IpAddr,
	pub attempts: u32,
	pub max_attempts: u32,
}

/// The drain handler C5 implements; kept as a trait so the queue doesn't
/// need to know about proxy selection or the cache facade.
#[async_trait::async_trait]
pub trait DispatchHandler: Send + Sync {
	/// Returns the post-reply spacing delay on success, or the error the
	/// queue uses to decide requeue vs terminal.
	async fn dispatch(&self, entry: &QueueEntry) -> Result<Duration, GatewayError>;
}

struct QueueInner {
	entries: VecDeque<QueueEntry>,
	users: HashMap<IpAddr, usize>,
}

/// C4: FIFO for first attempts, head-inserted for retries, admission-
/// checked by C7 (not here) against `users`/queue length.
pub struct RequestQueue<H: DispatchHandler + 'static> {
	inner: Mutex<QueueInner>,
	processing: AtomicUsize,
	concurrency: AtomicUsize,
	running: AtomicBool,
	notify: Notify,
	max_attempts: u32,
	handler: Arc<H>,
	fleet: Arc<Fleet>,
	pool: Arc<ProxyPool>,
}

impl<H: DispatchHandler + 'static> RequestQueue<H> {
	fn new_inner(handler: Arc<H>, fleet: Arc<Fleet>, pool: Arc<ProxyPool>, max_attempts: u32) -> Arc<Self> {
		Arc::new(Self {
			inner: Mutex::new(QueueInner { entries: VecDeque::new(), users: HashMap::new() }),
			processing: AtomicUsize::new(0),
			concurrency: AtomicUsize::new(0),
			running: AtomicBool::new(true),
			notify: Notify::new(),
			max_attempts,
			handler,
			fleet,
			pool,
		})
	}

	pub fn start(handler: Arc<H>, fleet: Arc<Fleet>, pool: Arc<ProxyPool>, max_attempts: u32) -> Arc<Self> {
		let queue = Self::new_inner(handler, fleet, pool, max_attempts);
		tokio::spawn(queue.clone().concurrency_sizing_tick());
		tokio::spawn(queue.clone().drain_loop());
		queue
	}

	/// Test-only: skips the concurrency-sizing tick so tests can drive
	/// `concurrency` directly instead of needing a live fleet of ready
	/// sessions.
	#[cfg(test)]
	fn start_fixed_concurrency(
		handler: Arc<H>,
		fleet: Arc<Fleet>,
		pool: Arc<ProxyPool>,
		max_attempts: u32,
		concurrency: usize,
	) -> Arc<Self> {
		let queue = Self::new_inner(handler, fleet, pool, max_attempts);
		queue.concurrency.store(concurrency, Ordering::SeqCst);
		tokio::spawn(queue.clone().drain_loop());
		queue
	}

	pub async fn queue_size(&self) -> usize {
		self.inner.lock().await.entries.len()
	}

	pub async fn users_in_flight(&self, ip: IpAddr) -> usize {
		self.inner.lock().await.users.get(&ip).copied().unwrap_or(0)
	}

	pub fn concurrency(&self) -> usize {
		self.concurrency.load(Ordering::SeqCst)
	}

	/// `addJob`: push each remaining link as a `QueueEntry`, counting it
	/// against `users[ip]`, then kick the drain loop.
	pub async fn add_job(&self, job: Arc<Job>, residue: Vec<(usize, JobLink)>) {
		if residue.is_empty() {
			return;
		}
		let client_ip = job.client_ip;
		let mut inner = self.inner.lock().await;
		for (slot, link) in residue {
			inner.entries.push_back(QueueEntry {
				job: job.clone(),
				slot,
				link,
				client_ip,
				attempts: 0,
				max_attempts: self.max_attempts,
			});
			*inner.users.entry(client_ip).or_insert(0) += 1;
		}
		drop(inner);
		self.notify.notify_one();
	}

	/// Recompute the concurrency ceiling every 50ms from the live
	/// ready-session count (and the pool's aggregate capacity, if a pool
	/// exists), waking the drain loop whenever it grows.
	async fn concurrency_sizing_tick(self: Arc<Self>) {
		let mut tick = tokio::time::interval(Duration::from_millis(50));
		loop {
			tick.tick().await;
			let ready = self.fleet.ready_count().await;
			let pool_cap = self.pool.max_concurrency();
			let new_value = if pool_cap == 0 { ready } else { ready.min(pool_cap) };
			let old = self.concurrency.swap(new_value, Ordering::SeqCst);
			if new_value > old {
				self.notify.notify_one();
			}
		}
	}

	async fn drain_loop(self: Arc<Self>) {
		loop {
			loop {
				if !self.running.load(Ordering::SeqCst) {
					break;
				}
				let processing = self.processing.load(Ordering::SeqCst);
				let concurrency = self.concurrency.load(Ordering::SeqCst);
				if processing >= concurrency {
					break;
				}
				if !self.pool.can_accept_more_requests().await {
					break;
				}
				let entry = {
					let mut inner = self.inner.lock().await;
					inner.entries.pop_front()
				};
				let Some(entry) = entry else { break };
				self.processing.fetch_add(1, Ordering::SeqCst);
				tokio::spawn(self.clone().run_entry(entry));
			}
			self.notify.notified().await;
		}
	}

	async fn run_entry(self: Arc<Self>, mut entry: QueueEntry) {
		let result = self.handler.dispatch(&entry).await;
		match result {
			Ok(delay) => {
				self.decrement_users(entry.client_ip).await;
				tokio::time::sleep(delay).await;
				self.processing.fetch_sub(1, Ordering::SeqCst);
				self.notify.notify_one();
			},
			Err(GatewayError::NoBotsAvailable) => {
				self.requeue(entry).await;
				self.processing.fetch_sub(1, Ordering::SeqCst);
				self.notify.notify_one();
			},
			Err(err) => {
				entry.attempts += 1;
				if entry.attempts >= entry.max_attempts {
					warn!(
						attempts = entry.attempts,
						kind = err.kind(),
						"job link failed after exhausting attempts"
					);
					entry.job.resolve_slot(entry.slot, Err(GatewayError::TtlExceeded)).await;
					self.decrement_users(entry.client_ip).await;
				} else {
					self.requeue(entry).await;
				}
				self.processing.fetch_sub(1, Ordering::SeqCst);
				self.notify.notify_one();
			},
		}
	}

	/// Retries jump the queue: head-inserted, ahead of first-attempt FIFO
	/// entries.
	async fn requeue(&self, entry: QueueEntry) {
		self.inner.lock().await.entries.push_front(entry);
	}

	async fn decrement_users(&self, ip: IpAddr) {
		let mut inner = self.inner.lock().await;
		if let Some(count) = inner.users.get_mut(&ip) {
			*count = count.saturating_sub(1);
			if *count == 0 {
				inner.users.remove(&ip);
			}
		}
	}

	#[cfg(test)]
	pub fn stop(&self) {
		self.running.store(false, Ordering::SeqCst);
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap as StdHashMap;
	use std::sync::Mutex as StdMutex;
	use std::sync::atomic::AtomicU32;

	use super::*;
	use crate::config::RetryPolicyConfig;
	use crate::proxy_pool::SelectionStrategy;
	use crate::session::SessionHandle;
	use tokio::sync::RwLock;

	struct ScriptedHandler {
		calls: AtomicU32,
		script: StdMutex<Vec<Result<Duration, GatewayError>>>,
		seen: StdMutex<Vec<String>>,
	}

	#[async_trait::async_trait]
	impl DispatchHandler for ScriptedHandler {
		async fn dispatch(&self, entry: &QueueEntry) -> Result<Duration, GatewayError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			self.seen.lock().unwrap().push(entry.link.triple.a.clone());
			let outcome = {
				let mut script = self.script.lock().unwrap();
				if script.is_empty() { Ok(Duration::ZERO) } else { script.remove(0) }
			};
			// Mirrors the real dispatcher: the slot is resolved here, before
			// the delay is handed back to the queue.
			if outcome.is_ok() {
				entry.job.resolve_slot(entry.slot, Ok(serde_json::json!({"a": entry.link.triple.a}))).await;
			}
			outcome
		}
	}

	async fn empty_fleet() -> Arc<Fleet> {
		let pool = Arc::new(ProxyPool::new(
			vec![],
			5,
			Duration::ZERO,
			RetryPolicyConfig::default(),
			SelectionStrategy::LeastLoaded,
			Arc::new(RwLock::new(StdHashMap::<u64, SessionHandle>::new())),
		));
		Fleet::start(
			vec![],
			pool,
			Arc::new(RwLock::new(StdHashMap::new())),
			Box::new(|| Box::new(crate::session::SimulatedTransport::default())),
			0,
			Duration::from_millis(10),
			Duration::from_millis(10),
		)
		.await
	}

	fn triple(a: &str) -> Triple {
		Triple { s: "0".into(), a: a.into(), d: "1".into(), m: Some("2".into()) }
	}

	#[tokio::test]
	async fn retry_jumps_queue_ahead_of_fifo() {
		let fleet = empty_fleet().await;
		let pool = Arc::new(ProxyPool::new(
			vec![],
			5,
			Duration::ZERO,
			RetryPolicyConfig::default(),
			SelectionStrategy::LeastLoaded,
			Arc::new(RwLock::new(StdHashMap::new())),
		));
		pool.distribute(&[1]).await;
		let handler = Arc::new(ScriptedHandler {
			calls: AtomicU32::new(0),
			script: StdMutex::new(vec![Err(GatewayError::GenericBad("boom".into()))]),
			seen: StdMutex::new(vec![]),
		});
		let queue = RequestQueue::start_fixed_concurrency(handler.clone(), fleet, pool, 3, 1);

		let (job, mut receivers) = Job::new(
			"127.0.0.1".parse().unwrap(),
			true,
			vec![
				JobLink { triple: triple("x"), price: None },
				JobLink { triple: triple("y"), price: None },
			],
		);
		queue
			.add_job(
				job.clone(),
				vec![(0, job.links[0].clone()), (1, job.links[1].clone())],
			)
			.await;

		// Wait for the first (failing) attempt on "x" plus its requeue and
		// the draining of "y" before "x" gets to retry successfully.
		tokio::time::sleep(Duration::from_millis(50)).await;

		let first = receivers.remove(0).await.unwrap().unwrap();
		let second = receivers.remove(0).await.unwrap().unwrap();
		assert!(first.is_object() || first.is_null());
		assert!(second.is_object() || second.is_null());

		let seen = handler.seen.lock().unwrap().clone();
		assert_eq!(seen[0], "x");
		assert_eq!(seen[1], "x", "retry of x must run before y was ever attempted if it jumped the queue");
	}

	#[tokio::test]
	async fn no_bots_available_does_not_count_as_an_attempt() {
		let fleet = empty_fleet().await;
		let pool = Arc::new(ProxyPool::new(
			vec![],
			5,
			Duration::ZERO,
			RetryPolicyConfig::default(),
			SelectionStrategy::LeastLoaded,
			Arc::new(RwLock::new(StdHashMap::new())),
		));
		pool.distribute(&[1]).await;
		let handler = Arc::new(ScriptedHandler {
			calls: AtomicU32::new(0),
			script: StdMutex::new(vec![
				Err(GatewayError::NoBotsAvailable),
				Err(GatewayError::NoBotsAvailable),
				Ok(Duration::ZERO),
			]),
			seen: StdMutex::new(vec![]),
		});
		let queue = RequestQueue::start_fixed_concurrency(handler.clone(), fleet, pool, 1, 1);

		let (job, mut receivers) = Job::new(
			"127.0.0.1".parse().unwrap(),
			false,
			vec![JobLink { triple: triple("z"), price: None }],
		);
		queue.add_job(job.clone(), vec![(0, job.links[0].clone())]).await;
		tokio::time::sleep(Duration::from_millis(60)).await;

		let resolved = receivers.remove(0).await.unwrap();
		assert!(resolved.is_ok(), "max_attempts=1 must not be burned by NoBotsAvailable retries");
		assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
	}
}
