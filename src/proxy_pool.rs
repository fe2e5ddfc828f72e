//! C2: the proxy pool scheduler. Distributes sessions across outbound proxy
//! groups, selects a ready session for an inspect request, and reassigns
//! sessions away from unhealthy proxies on login failure.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::RetryPolicyConfig;
use crate::session::{FailureReason, SessionHandle, SessionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
	#[default]
	LeastLoaded,
	RoundRobin,
}

pub type GroupId = usize;

/// One outbound proxy and the sessions currently bound to it.
#[derive(Debug, Default)]
pub struct ProxyGroup {
	pub id: GroupId,
	pub proxy_url: Option<String>,
	pub sessions: Vec<SessionId>,
	pub active_requests: u32,
	pub total_requests: u64,
	pub last_request_time: Option<Instant>,
	pub failures: u32,
	pub login_failures: u32,
	pub successful_logins: u64,
}

impl ProxyGroup {
	fn new(id: GroupId, proxy_url: Option<String>) -> Self {
		Self { id, proxy_url, ..Default::default() }
	}

	/// Ratio of successful logins to attempted logins, 0 when nothing has
	/// been attempted yet.
	pub fn success_rate(&self) -> f64 {
		let attempts = self.successful_logins + self.login_failures as u64;
		if attempts == 0 {
			0.0
		} else {
			self.successful_logins as f64 / attempts as f64
		}
	}

	fn is_unhealthy(&self) -> bool {
		self.login_failures > 5 && self.success_rate() < 0.3
	}
}

struct PoolInner {
	groups: Vec<ProxyGroup>,
	bot_to_group: HashMap<SessionId, GroupId>,
	bot_retry_count: HashMap<SessionId, u32>,
	failed_groups: HashSet<GroupId>,
	round_robin_cursor: usize,
}

/// The outbound proxy scheduler shared by C3 (assignment) and C4/C5
/// (selection on every drain step).
pub struct ProxyPool {
	inner: Mutex<PoolInner>,
	sessions: Arc<RwLock<HashMap<SessionId, SessionHandle>>>,
	max_requests_per_proxy: u32,
	request_cooldown: Duration,
	retry: RetryPolicyConfig,
	strategy: SelectionStrategy,
	group_count: usize,
}

/// What the caller should do after a login failure was recorded.
pub struct ReassignOutcome {
	pub should_retry: bool,
	pub retry_delay: Duration,
	pub new_proxy_url: Option<String>,
	pub retry_count: u32,
}

/// The reason -> delay table the pool owns, so the retry counter and the
/// delay it drives live in one place instead of being split between C2 and
/// its caller.
fn retry_delay_for(reason: FailureReason, attempt: u32, policy: &RetryPolicyConfig) -> Duration {
	match reason {
		FailureReason::Steamguard => Duration::from_secs(15),
		FailureReason::Proxy => Duration::from_secs(10),
		FailureReason::RateLimit => {
			let secs = (30u64 * 2u64.saturating_pow(attempt.saturating_sub(1))).min(120);
			Duration::from_secs(secs)
		},
		FailureReason::Auth | FailureReason::Other => Duration::from_millis(policy.retry_delay_ms),
	}
}

impl ProxyPool {
	/// Build a pool from a list of proxy URLs. An empty list still produces
	/// one "no proxy" group, so the pool always has somewhere to put
	/// sessions even when the proxy file was missing or empty.
	pub fn new(
		proxy_urls: Vec<String>,
		max_requests_per_proxy: u32,
		request_cooldown: Duration,
		retry: RetryPolicyConfig,
		strategy: SelectionStrategy,
		sessions: Arc<RwLock<HashMap<SessionId, SessionHandle>>>,
	) -> Self {
		let groups = if proxy_urls.is_empty() {
			vec![ProxyGroup::new(0, None)]
		} else {
			proxy_urls
				.into_iter()
				.enumerate()
				.map(|(id, url)| ProxyGroup::new(id, Some(url)))
				.collect()
		};
		let group_count = groups.len();
		info!(groups = group_count, "proxy pool initialized");
		Self {
			inner: Mutex::new(PoolInner {
				groups,
				bot_to_group: HashMap::new(),
				bot_retry_count: HashMap::new(),
				failed_groups: HashSet::new(),
				round_robin_cursor: 0,
			}),
			sessions,
			max_requests_per_proxy,
			request_cooldown,
			retry,
			strategy,
			group_count,
		}
	}

	/// Distribute `session_ids` across the groups as evenly as possible,
	/// `ceil(sessions / groups)` per group, reassigning the proxy only for
	/// sessions whose group actually changes.
	pub async fn distribute(&self, session_ids: &[SessionId]) {
		let mut inner = self.inner.lock().await;
		let group_count = inner.groups.len().max(1);
		let per_group = session_ids.len().div_ceil(group_count);

		for g in inner.groups.iter_mut() {
			g.sessions.clear();
		}
		inner.bot_to_group.clear();

		for (idx, &sid) in session_ids.iter().enumerate() {
			let group_idx = (idx / per_group.max(1)).min(group_count - 1);
			inner.groups[group_idx].sessions.push(sid);
			inner.bot_to_group.insert(sid, group_idx);
		}

		let sessions = self.sessions.read().await;
		for (sid, group_idx) in inner.bot_to_group.clone() {
			if let Some(handle) = sessions.get(&sid) {
				handle.update_proxy(inner.groups[group_idx].proxy_url.clone());
			}
		}
	}

	fn admits(&self, group: &ProxyGroup) -> bool {
		if group.active_requests >= self.max_requests_per_proxy {
			return false;
		}
		match group.last_request_time {
			Some(last) => last.elapsed() >= self.request_cooldown,
			None => true,
		}
	}

	/// Select and reserve a ready session, trying every candidate group in
	/// strategy order until one yields a session that actually
	/// [`try_acquire`](SessionHandle::try_acquire)s, since readiness can
	/// change between the admission check and the reservation attempt.
	pub async fn select(&self) -> Option<SessionHandle> {
		let mut inner = self.inner.lock().await;
		let sessions = self.sessions.read().await;

		let candidate_order: Vec<GroupId> = match self.strategy {
			SelectionStrategy::LeastLoaded => {
				let mut order: Vec<GroupId> = (0..inner.groups.len()).collect();
				order.sort_by(|&a, &b| {
					let load = |g: &ProxyGroup| {
						let denom = g.sessions.len().max(1) as f64;
						g.active_requests as f64 / denom
					};
					load(&inner.groups[a])
						.partial_cmp(&load(&inner.groups[b]))
						.unwrap_or(std::cmp::Ordering::Equal)
				});
				order
			},
			SelectionStrategy::RoundRobin => {
				let n = inner.groups.len();
				(0..n).map(|i| (inner.round_robin_cursor + i) % n).collect()
			},
		};

		for group_idx in candidate_order {
			if !self.admits(&inner.groups[group_idx]) {
				continue;
			}
			let group_session_ids = inner.groups[group_idx].sessions.clone();
			for sid in group_session_ids {
				let Some(handle) = sessions.get(&sid) else { continue };
				if handle.try_acquire() {
					let group = &mut inner.groups[group_idx];
					group.active_requests += 1;
					group.total_requests += 1;
					group.last_request_time = Some(Instant::now());
					if self.strategy == SelectionStrategy::RoundRobin {
						inner.round_robin_cursor = (group_idx + 1) % inner.groups.len();
					}
					return Some(handle.clone());
				}
			}
		}
		None
	}

	/// Release a session back to its group after a request completes.
	/// `success` charges (or doesn't) the group's failure counter; the
	/// session's own `busy` flag is released by C1 itself on its own
	/// schedule, not here.
	pub async fn release(&self, session_id: SessionId, success: bool) {
		let mut inner = self.inner.lock().await;
		let Some(&group_idx) = inner.bot_to_group.get(&session_id) else { return };
		let group = &mut inner.groups[group_idx];
		group.active_requests = group.active_requests.saturating_sub(1);
		if !success {
			group.failures += 1;
		}
	}

	/// Record a login failure and decide whether to retry, reassigning the
	/// session to a different group when the retry policy allows it. Owns
	/// the reason -> delay table (steamguard 15s, proxy 10s, rate limit
	/// exponential backoff capped at 120s, everything else the configured
	/// retry delay) so the per-session retry counter and the delay it
	/// drives stay in one place. `login_failures` increments for every
	/// reason, `steamguard` included; what a `steamguard` failure skips is
	/// reassignment bias toward the proxy being at fault, not the counter
	/// itself.
	pub async fn handle_login_failure(&self, session_id: SessionId, reason: FailureReason) -> ReassignOutcome {
		let mut inner = self.inner.lock().await;

		if let Some(&group_idx) = inner.bot_to_group.get(&session_id) {
			let group = &mut inner.groups[group_idx];
			group.login_failures += 1;
			if group.is_unhealthy() {
				inner.failed_groups.insert(group_idx);
			}
		}

		let retry_count = inner.bot_retry_count.entry(session_id).or_insert(0);
		*retry_count += 1;
		let attempt = *retry_count;

		if !self.retry.enabled || attempt > self.retry.max_retries {
			return ReassignOutcome {
				should_retry: false,
				retry_delay: Duration::ZERO,
				new_proxy_url: None,
				retry_count: attempt,
			};
		}

		let delay = retry_delay_for(reason, attempt, &self.retry);
		let current_group = inner.bot_to_group.get(&session_id).copied();
		let excluded = inner.failed_groups.clone();
		let exclude_failed = self.retry.exclude_failed;

		let mut candidates: Vec<GroupId> = (0..inner.groups.len())
			.filter(|&idx| Some(idx) != current_group)
			.filter(|idx| !exclude_failed || !excluded.contains(idx))
			.filter(|idx| (inner.groups[*idx].sessions.len() as u32) < self.max_requests_per_proxy)
			.collect();

		candidates.sort_by(|&a, &b| {
			let bucket = |g: &ProxyGroup| (g.success_rate() * 10.0) as i64;
			let ga = &inner.groups[a];
			let gb = &inner.groups[b];
			bucket(gb)
				.cmp(&bucket(ga))
				.then(ga.sessions.len().cmp(&gb.sessions.len()))
		});

		let new_group_idx = candidates.first().copied().or(current_group);

		if let Some(new_idx) = new_group_idx {
			if Some(new_idx) != current_group {
				if let Some(old_idx) = current_group {
					inner.groups[old_idx].sessions.retain(|&s| s != session_id);
				}
				inner.groups[new_idx].sessions.push(session_id);
				inner.bot_to_group.insert(session_id, new_idx);
				debug!(session = session_id, group = new_idx, "reassigned session to new proxy group");
			}
			let new_url = inner.groups[new_idx].proxy_url.clone();
			return ReassignOutcome {
				should_retry: true,
				retry_delay: delay,
				new_proxy_url: new_url,
				retry_count: attempt,
			};
		}

		warn!(session = session_id, "no alternate proxy group available for reassignment");
		ReassignOutcome {
			should_retry: true,
			retry_delay: delay,
			new_proxy_url: None,
			retry_count: attempt,
		}
	}

	/// Record a successful login against the session's current group.
	pub async fn record_login_success(&self, session_id: SessionId) {
		let mut inner = self.inner.lock().await;
		inner.bot_retry_count.remove(&session_id);
		if let Some(&group_idx) = inner.bot_to_group.get(&session_id) {
			inner.groups[group_idx].successful_logins += 1;
		}
	}

	pub async fn group_stats(&self) -> Vec<(GroupId, u32, u64, f64)> {
		let inner = self.inner.lock().await;
		inner
			.groups
			.iter()
			.map(|g| (g.id, g.active_requests, g.total_requests, g.success_rate()))
			.collect()
	}

	/// Aggregate capacity across every group, the ceiling C4's concurrency
	/// sizing tick uses alongside the live ready-session count.
	pub fn max_concurrency(&self) -> usize {
		self.group_count * self.max_requests_per_proxy as usize
	}

	/// Whether at least one group currently has room for a new request, per
	/// the admission predicate C4 consults before popping the queue.
	pub async fn can_accept_more_requests(&self) -> bool {
		let inner = self.inner.lock().await;
		inner.groups.iter().any(|g| self.admits(g) && !g.sessions.is_empty())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn group_with(sessions: Vec<SessionId>, active: u32) -> ProxyGroup {
		ProxyGroup { sessions, active_requests: active, ..ProxyGroup::new(0, None) }
	}

	#[test]
	fn success_rate_is_zero_with_no_attempts() {
		let g = ProxyGroup::new(0, None);
		assert_eq!(g.success_rate(), 0.0);
	}

	#[test]
	fn success_rate_computed_from_attempts() {
		let mut g = ProxyGroup::new(0, None);
		g.successful_logins = 3;
		g.login_failures = 1;
		assert_eq!(g.success_rate(), 0.75);
	}

	#[test]
	fn unhealthy_requires_both_failure_count_and_low_rate() {
		let mut g = ProxyGroup::new(0, None);
		g.login_failures = 10;
		g.successful_logins = 0;
		assert!(g.is_unhealthy());

		let mut g2 = ProxyGroup::new(1, None);
		g2.login_failures = 2;
		g2.successful_logins = 0;
		assert!(!g2.is_unhealthy());
	}

	#[test]
	fn group_with_helper_sets_fields() {
		let g = group_with(vec![1, 2], 3);
		assert_eq!(g.sessions, vec![1, 2]);
		assert_eq!(g.active_requests, 3);
	}

	#[tokio::test]
	async fn distribute_splits_sessions_evenly_across_groups() {
		let sessions = Arc::new(RwLock::new(HashMap::new()));
		let pool = ProxyPool::new(
			vec!["proxy-a".into(), "proxy-b".into()],
			5,
			Duration::ZERO,
			RetryPolicyConfig::default(),
			SelectionStrategy::LeastLoaded,
			sessions,
		);
		pool.distribute(&[1, 2, 3, 4]).await;
		let stats = pool.group_stats().await;
		assert_eq!(stats.len(), 2);
		let inner = pool.inner.lock().await;
		assert_eq!(inner.groups[0].sessions.len(), 2);
		assert_eq!(inner.groups[1].sessions.len(), 2);
	}

	#[tokio::test]
	async fn empty_proxy_list_falls_back_to_single_group() {
		let sessions = Arc::new(RwLock::new(HashMap::new()));
		let pool = ProxyPool::new(
			vec![],
			5,
			Duration::ZERO,
			RetryPolicyConfig::default(),
			SelectionStrategy::LeastLoaded,
			sessions,
		);
		let stats = pool.group_stats().await;
		assert_eq!(stats.len(), 1);
	}

	#[tokio::test]
	async fn steamguard_failure_increments_login_failures() {
		let sessions = Arc::new(RwLock::new(HashMap::new()));
		let pool = ProxyPool::new(
			vec!["proxy-a".into()],
			5,
			Duration::ZERO,
			RetryPolicyConfig::default(),
			SelectionStrategy::LeastLoaded,
			sessions,
		);
		pool.distribute(&[1]).await;
		let outcome = pool.handle_login_failure(1, FailureReason::Steamguard).await;
		assert!(outcome.should_retry);
		assert_eq!(outcome.retry_delay, Duration::from_secs(15));
		let inner = pool.inner.lock().await;
		assert_eq!(inner.groups[0].login_failures, 1);
	}

	#[tokio::test]
	async fn steamguard_failure_reassigns_to_a_different_group() {
		let sessions = Arc::new(RwLock::new(HashMap::new()));
		let pool = ProxyPool::new(
			vec!["proxy-a".into(), "proxy-b".into()],
			5,
			Duration::ZERO,
			RetryPolicyConfig::default(),
			SelectionStrategy::LeastLoaded,
			sessions,
		);
		pool.distribute(&[1]).await;
		let before = {
			let inner = pool.inner.lock().await;
			inner.bot_to_group[&1]
		};
		pool.handle_login_failure(1, FailureReason::Steamguard).await;
		let after = {
			let inner = pool.inner.lock().await;
			inner.bot_to_group[&1]
		};
		assert_ne!(before, after);
	}

	#[tokio::test]
	async fn ratelimit_delay_grows_exponentially_and_caps() {
		let sessions = Arc::new(RwLock::new(HashMap::new()));
		let mut retry = RetryPolicyConfig::default();
		retry.max_retries = 10;
		let pool = ProxyPool::new(
			vec!["proxy-a".into(), "proxy-b".into()],
			5,
			Duration::ZERO,
			retry,
			SelectionStrategy::LeastLoaded,
			sessions,
		);
		pool.distribute(&[1]).await;
		let first = pool.handle_login_failure(1, FailureReason::RateLimit).await;
		assert_eq!(first.retry_delay, Duration::from_secs(30));
		let second = pool.handle_login_failure(1, FailureReason::RateLimit).await;
		assert_eq!(second.retry_delay, Duration::from_secs(60));
		for _ in 0..5 {
			pool.handle_login_failure(1, FailureReason::RateLimit).await;
		}
		let capped = pool.handle_login_failure(1, FailureReason::RateLimit).await;
		assert_eq!(capped.retry_delay, Duration::from_secs(120));
	}

	#[tokio::test]
	async fn retry_exhausted_after_max_retries() {
		let sessions = Arc::new(RwLock::new(HashMap::new()));
		let mut retry = RetryPolicyConfig::default();
		retry.max_retries = 1;
		let pool = ProxyPool::new(
			vec!["proxy-a".into(), "proxy-b".into()],
			5,
			Duration::ZERO,
			retry,
			SelectionStrategy::LeastLoaded,
			sessions,
		);
		pool.distribute(&[1]).await;
		let first = pool.handle_login_failure(1, FailureReason::Proxy).await;
		assert!(first.should_retry);
		let second = pool.handle_login_failure(1, FailureReason::Proxy).await;
		assert!(!second.should_retry);
	}
}
