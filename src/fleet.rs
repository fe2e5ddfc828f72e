//! C3: the session fleet supervisor. Brings up sessions from the configured
//! account roster, reacts to their lifecycle events, maintains the target
//! online count from a pool of spare accounts, and exposes the pending-auth
//! surface for accounts that need an operator-submitted one-time code.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{info, warn};

use crate::config::Account;
use crate::proxy_pool::ProxyPool;
use crate::session::{
	FailureReason, SessionEvent, SessionHandle, SessionId, UpstreamTransport, spawn_session,
};

pub type TransportFactory = Box<dyn Fn() -> Box<dyn UpstreamTransport> + Send + Sync>;

#[derive(Clone, Debug)]
pub struct PendingAuth {
	pub session_id: SessionId,
	pub account: Account,
	pub auth_type: String,
	pub requested_at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FleetHealth {
	Optimal,
	Recovering,
	Degraded,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetStatus {
	pub online: usize,
	pub target: usize,
	pub total: usize,
	pub busy: usize,
	pub failed: usize,
	pub spares: usize,
	pub queued_spares: usize,
	pub pending_auth: usize,
	pub status: FleetHealth,
}

struct FleetInner {
	session_order: Vec<SessionId>,
	account_by_session: HashMap<SessionId, Account>,
	spare_accounts: VecDeque<Account>,
	failed_accounts: HashMap<String, (String, Instant)>,
	pending_auth: HashMap<String, PendingAuth>,
	spare_queue: VecDeque<Account>,
	spare_queue_busy: bool,
	ready_count: usize,
}

pub struct Fleet {
	inner: Mutex<FleetInner>,
	sessions: Arc<RwLock<HashMap<SessionId, SessionHandle>>>,
	pool: Arc<ProxyPool>,
	transport_factory: TransportFactory,
	max_online_bots: usize,
	spare_account_delay: Duration,
	request_delay: Duration,
	next_session_id: AtomicU64,
	events_tx: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
}

impl Fleet {
	/// Split `accounts` at `max_online_bots`, spawn the prefix immediately
	/// (in chunks of 3, 3s apart) and hold the suffix as spares, then start
	/// the event reactor and the 30s maintenance tick.
	pub async fn start(
		accounts: Vec<Account>,
		pool: Arc<ProxyPool>,
		sessions: Arc<RwLock<HashMap<SessionId, SessionHandle>>>,
		transport_factory: TransportFactory,
		max_online_bots: usize,
		spare_account_delay: Duration,
		request_delay: Duration,
	) -> Arc<Fleet> {
		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let split = max_online_bots.min(accounts.len());
		let (initial, spares) = {
			let mut accounts = accounts;
			let spares = accounts.split_off(split);
			(accounts, spares)
		};

		let fleet = Arc::new(Fleet {
			inner: Mutex::new(FleetInner {
				session_order: Vec::new(),
				account_by_session: HashMap::new(),
				spare_accounts: spares.into_iter().collect(),
				failed_accounts: HashMap::new(),
				pending_auth: HashMap::new(),
				spare_queue: VecDeque::new(),
				spare_queue_busy: false,
				ready_count: 0,
			}),
			sessions,
			pool,
			transport_factory,
			max_online_bots,
			spare_account_delay,
			request_delay,
			next_session_id: AtomicU64::new(1),
			events_tx,
		});

		tokio::spawn(Fleet::reactor(fleet.clone(), events_rx));
		tokio::spawn(Fleet::startup(fleet.clone(), initial));
		tokio::spawn(Fleet::maintenance_tick(fleet.clone()));
		fleet
	}

	async fn startup(self: Arc<Self>, initial: Vec<Account>) {
		for chunk in initial.chunks(3) {
			for account in chunk {
				self.add_bot(account.clone(), None).await;
			}
			self.redistribute().await;
			tokio::time::sleep(Duration::from_secs(3)).await;
		}
	}

	async fn redistribute(&self) {
		let ids = self.inner.lock().await.session_order.clone();
		self.pool.distribute(&ids).await;
	}

	async fn add_bot(&self, account: Account, code: Option<String>) -> SessionId {
		let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
		let transport = (self.transport_factory)();
		let handle = spawn_session(id, transport, self.request_delay, self.events_tx.clone());

		{
			let mut inner = self.inner.lock().await;
			inner.session_order.push(id);
			inner.account_by_session.insert(id, account.clone());
		}
		self.sessions.write().await.insert(id, handle.clone());
		handle.log_in(account, code);
		id
	}

	async fn reactor(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<(SessionId, SessionEvent)>) {
		while let Some((session_id, event)) = events_rx.recv().await {
			self.handle_event(session_id, event).await;
		}
	}

	async fn handle_event(self: &Arc<Self>, session_id: SessionId, event: SessionEvent) {
		match event {
			SessionEvent::Ready => {
				let mut inner = self.inner.lock().await;
				inner.ready_count += 1;
				if inner.ready_count == 1 {
					info!("fleet ready");
				}
			},
			SessionEvent::Unready => {
				let became_unready = {
					let mut inner = self.inner.lock().await;
					inner.ready_count = inner.ready_count.saturating_sub(1);
					inner.ready_count == 0
				};
				if became_unready {
					warn!("fleet unready: no sessions online");
				}
				let fleet = self.clone();
				tokio::spawn(async move {
					tokio::time::sleep(Duration::from_secs(5)).await;
					fleet.maintain().await;
				});
			},
			SessionEvent::LoginSuccess => {
				self.pool.record_login_success(session_id).await;
				let username = {
					let inner = self.inner.lock().await;
					inner.account_by_session.get(&session_id).map(|a| a.username.clone())
				};
				if let Some(username) = username {
					self.inner.lock().await.pending_auth.remove(&username);
				}
			},
			SessionEvent::LoginFailed { reason, message } => {
				self.handle_login_failed(session_id, reason, message).await;
			},
			SessionEvent::AuthFailed { message } => {
				self.handle_auth_failed(session_id, message).await;
			},
		}
	}

	async fn handle_login_failed(self: &Arc<Self>, session_id: SessionId, reason: FailureReason, message: String) {
		let outcome = self.pool.handle_login_failure(session_id, reason).await;
		let account = {
			let inner = self.inner.lock().await;
			inner.account_by_session.get(&session_id).cloned()
		};
		let Some(account) = account else { return };

		if outcome.should_retry {
			let sessions = self.sessions.clone();
			tokio::spawn(async move {
				tokio::time::sleep(outcome.retry_delay).await;
				let handle = sessions.read().await.get(&session_id).cloned();
				let Some(handle) = handle else { return };
				if outcome.new_proxy_url.is_some() || reason != FailureReason::Steamguard {
					handle.update_proxy(outcome.new_proxy_url);
				}
				handle.log_in(account, None);
			});
			return;
		}

		if reason == FailureReason::Steamguard {
			warn!(session = session_id, "steamguard retries exhausted, parking for operator code");
			self.inner.lock().await.pending_auth.insert(
				account.username.clone(),
				PendingAuth {
					session_id,
					account,
					auth_type: "steamguard".to_string(),
					requested_at: Instant::now(),
				},
			);
			return;
		}

		self.fail_account(session_id, account, &message).await;
	}

	async fn handle_auth_failed(self: &Arc<Self>, session_id: SessionId, message: String) {
		let account = {
			let inner = self.inner.lock().await;
			inner.account_by_session.get(&session_id).cloned()
		};
		if let Some(account) = account {
			self.fail_account(session_id, account, &message).await;
		}
	}

	async fn fail_account(self: &Arc<Self>, session_id: SessionId, account: Account, reason: &str) {
		warn!(account = %account.username, reason, "account permanently failed");
		self.inner
			.lock()
			.await
			.failed_accounts
			.insert(account.username.clone(), (reason.to_string(), Instant::now()));
		if let Some(handle) = self.sessions.read().await.get(&session_id) {
			handle.shutdown();
		}
		self.try_activate_spare().await;
	}

	/// Move one account from the spare pool onto the activation queue and
	/// make sure exactly one drain task is running for it.
	async fn try_activate_spare(self: &Arc<Self>) {
		let should_spawn_drain = {
			let mut inner = self.inner.lock().await;
			let Some(account) = inner.spare_accounts.pop_front() else { return };
			inner.spare_queue.push_back(account);
			if inner.spare_queue_busy {
				false
			} else {
				inner.spare_queue_busy = true;
				true
			}
		};
		if should_spawn_drain {
			tokio::spawn(self.clone().drain_spare_queue());
		}
	}

	async fn drain_spare_queue(self: Arc<Self>) {
		loop {
			tokio::time::sleep(self.spare_account_delay).await;
			let next = {
				let mut inner = self.inner.lock().await;
				match inner.spare_queue.pop_front() {
					Some(account) => {
						if inner.ready_count >= self.max_online_bots {
							inner.spare_queue.clear();
							inner.spare_queue_busy = false;
							return;
						}
						Some(account)
					},
					None => {
						inner.spare_queue_busy = false;
						None
					},
				}
			};
			let Some(account) = next else { break };
			self.add_bot(account, None).await;
			self.redistribute().await;
		}
	}

	/// `checkAndMaintainBotCount`: top up the activation queue to close the
	/// gap between the target online count and what's ready or already
	/// queued, bounded by how many spares remain.
	async fn maintain(self: &Arc<Self>) {
		let to_activate = {
			let inner = self.inner.lock().await;
			let needed = self
				.max_online_bots
				.saturating_sub(inner.ready_count)
				.saturating_sub(inner.spare_queue.len());
			needed.min(inner.spare_accounts.len())
		};
		for _ in 0..to_activate {
			self.try_activate_spare().await;
		}
	}

	async fn maintenance_tick(self: Arc<Self>) {
		let mut tick = tokio::time::interval(Duration::from_secs(30));
		loop {
			tick.tick().await;
			self.maintain().await;
		}
	}

	/// An operator-submitted one-time code for an account parked in the
	/// pending-auth surface.
	pub async fn submit_auth_code(&self, username: &str, code: String) -> bool {
		let entry = self.inner.lock().await.pending_auth.get(username).cloned();
		let Some(entry) = entry else { return false };
		let handle = self.sessions.read().await.get(&entry.session_id).cloned();
		let Some(handle) = handle else { return false };
		handle.log_in(entry.account, Some(code));
		true
	}

	pub async fn pending_auth(&self) -> Vec<PendingAuth> {
		self.inner.lock().await.pending_auth.values().cloned().collect()
	}

	pub async fn ready_count(&self) -> usize {
		self.inner.lock().await.ready_count
	}

	pub async fn status(&self) -> FleetStatus {
		let (total, failed, spares, queued_spares, pending_auth, online) = {
			let inner = self.inner.lock().await;
			(
				inner.session_order.len(),
				inner.failed_accounts.len(),
				inner.spare_accounts.len(),
				inner.spare_queue.len(),
				inner.pending_auth.len(),
				inner.ready_count,
			)
		};
		let busy = {
			let sessions = self.sessions.read().await;
			sessions.values().filter(|h| h.is_busy()).count()
		};
		let status = if self.max_online_bots == 0 || online >= self.max_online_bots {
			FleetHealth::Optimal
		} else if online > 0 {
			FleetHealth::Recovering
		} else {
			FleetHealth::Degraded
		};
		FleetStatus {
			online,
			target: self.max_online_bots,
			total,
			busy,
			failed,
			spares,
			queued_spares,
			pending_auth,
			status,
		}
	}
}
