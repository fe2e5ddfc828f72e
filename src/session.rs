//! C1: UpstreamSession, one authenticated upstream client.
//!
//! The real upstream protocol (Steam / game-coordinator) is explicitly out
//! of scope, so it is modeled behind the [`UpstreamTransport`]
//! trait. Everything else here (the readiness state machine, failure
//! classification, inspect normalization, TTL/relogin timers) is real.
//!
//! Each session is a single-writer actor: a background task owns the
//! transport and the `busy`/`current_request` fields exclusively, driven by
//! [`SessionCommand`]s sent over an mpsc channel. External callers only ever
//! see the [`SessionHandle`] (cheap to clone, backed by atomics for the hot
//! `ready`/`busy` reads C2 needs for admission checks).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::config::Account;
use crate::guard_code::resolve_login_code;

pub type SessionId = u64;

/// Opaque triple (s, a, d) plus optional m identifying an item to inspect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Triple {
	pub s: String,
	pub a: String,
	pub d: String,
	pub m: Option<String>,
}

impl Triple {
	/// Owner is `s` when `s != "0"`, else `m`.
	pub fn owner(&self) -> Option<&str> {
		if self.s != "0" {
			Some(self.s.as_str())
		} else {
			self.m.as_deref()
		}
	}

	pub fn is_market_link(&self) -> bool {
		self.s == "0" && self.m.is_some()
	}
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawSticker {
	pub sticker_id: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawItemData {
	pub paintwear: Option<f64>,
	pub paintseed: Option<u32>,
	#[serde(default)]
	pub stickers: Vec<RawSticker>,
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NormalizedSticker {
	#[serde(rename = "stickerId")]
	pub sticker_id: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NormalizedItem {
	pub floatvalue: Option<f64>,
	pub paintseed: u32,
	pub stickers: Vec<NormalizedSticker>,
	#[serde(flatten)]
	pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Normalization law: paintwear -> floatvalue, missing paintseed -> 0,
/// sticker_id -> stickerId.
pub fn normalize(raw: RawItemData) -> NormalizedItem {
	NormalizedItem {
		floatvalue: raw.paintwear,
		paintseed: raw.paintseed.unwrap_or(0),
		stickers: raw
			.stickers
			.into_iter()
			.map(|s| NormalizedSticker { sticker_id: s.sticker_id })
			.collect(),
		extra: raw.extra,
	}
}

/// Failure classification driving C2/C3's retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
	Steamguard,
	RateLimit,
	Proxy,
	Auth,
	Other,
}

#[derive(Clone, Debug)]
pub struct UpstreamError {
	pub message: String,
	pub eresult: Option<i32>,
}

impl UpstreamError {
	pub fn new(message: impl Into<String>) -> Self {
		Self { message: message.into(), eresult: None }
	}

	pub fn with_eresult(message: impl Into<String>, eresult: i32) -> Self {
		Self { message: message.into(), eresult: Some(eresult) }
	}
}

/// Classify an upstream error into the retry-policy buckets C2/C3 act on.
pub fn classify_failure(err: &UpstreamError) -> FailureReason {
	if matches!(err.eresult, Some(63) | Some(65)) {
		return FailureReason::Steamguard;
	}
	if matches!(err.eresult, Some(84) | Some(87))
		|| err.message.contains("RateLimitExceeded")
		|| err.message.contains("AccountLoginDeniedThrottle")
	{
		return FailureReason::RateLimit;
	}
	if matches!(err.eresult, Some(61) | Some(66)) {
		return FailureReason::Auth;
	}
	let msg = err.message.as_str();
	if msg.contains("timed out")
		|| msg.contains("timeout")
		|| msg.contains("connection refused")
		|| msg.contains("connection reset")
		|| msg.starts_with("Proxy ")
		|| msg.contains("500 Internal Server Error")
		|| msg.contains("self-signed certificate")
	{
		return FailureReason::Proxy;
	}
	FailureReason::Other
}

/// Seam for the real (out-of-scope) upstream protocol.
#[async_trait::async_trait]
pub trait UpstreamTransport: Send + Sync {
	async fn log_in(&mut self, account: &Account, code: Option<String>) -> Result<(), UpstreamError>;
	/// Forces the game-coordinator handshake ("games played [] then [730]").
	/// `relogin` skips the ownership re-check, per C1's relogin-cycle note.
	async fn start_gc_session(&mut self, relogin: bool) -> Result<(), UpstreamError>;
	async fn inspect(&mut self, triple: &Triple) -> Result<RawItemData, UpstreamError>;
	async fn log_off(&mut self);
	/// Tears down and recreates the transport bound to `proxy_url`.
	fn update_proxy(&mut self, proxy_url: Option<String>);
}

/// Readiness state machine for a single session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
	New,
	Connecting,
	LoggedOn,
	GcConnecting,
	Ready,
	GcDisconnected,
	Disconnected,
}

#[derive(Clone, Debug)]
pub enum SessionEvent {
	Ready,
	Unready,
	LoginSuccess,
	LoginFailed { reason: FailureReason, message: String },
	AuthFailed { message: String },
}

pub struct InFlightRequest {
	pub triple: Triple,
	pub issued_at: Instant,
}

enum SessionCommand {
	LogIn {
		account: Account,
		code: Option<String>,
	},
	Inspect {
		triple: Triple,
		ttl: Duration,
		resp: oneshot::Sender<Result<(NormalizedItem, Duration), String>>,
	},
	UpdateProxy {
		url: Option<String>,
	},
	Shutdown,
}

/// Cheap, cloneable view of a session visible to C2/C3/C4/C5.
#[derive(Clone)]
pub struct SessionHandle {
	pub id: SessionId,
	ready: Arc<AtomicBool>,
	busy: Arc<AtomicBool>,
	current_request: Arc<Mutex<Option<InFlightRequest>>>,
	cmd_tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::SeqCst)
	}

	pub fn is_busy(&self) -> bool {
		self.busy.load(Ordering::SeqCst)
	}

	pub fn is_available(&self) -> bool {
		self.is_ready() && !self.is_busy()
	}

	/// Atomically claims this session for an inspect, failing if another
	/// caller beat us to it or the session isn't ready. This is what makes
	/// C2's selection race-free without requiring a global lock held across
	/// the `inspect` await.
	pub fn try_acquire(&self) -> bool {
		self.ready.load(Ordering::SeqCst)
			&& self.busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
	}

	/// Undo a `try_acquire` that was never followed through with `inspect`.
	pub fn release_reservation(&self) {
		self.busy.store(false, Ordering::SeqCst);
	}

	pub fn log_in(&self, account: Account, code: Option<String>) {
		let _ = self.cmd_tx.send(SessionCommand::LogIn { account, code });
	}

	pub fn update_proxy(&self, url: Option<String>) {
		let _ = self.cmd_tx.send(SessionCommand::UpdateProxy { url });
	}

	pub fn shutdown(&self) {
		let _ = self.cmd_tx.send(SessionCommand::Shutdown);
	}

	/// The triple currently in flight on this session, and how long it has
	/// been running, for status reporting.
	pub async fn in_flight(&self) -> Option<(Triple, Duration)> {
		self
			.current_request
			.lock()
			.await
			.as_ref()
			.map(|r| (r.triple.clone(), r.issued_at.elapsed()))
	}

	/// Callers must have successfully called [`try_acquire`](Self::try_acquire)
	/// first; this does not re-check or set `busy` itself.
	pub async fn inspect(&self, triple: Triple, ttl: Duration) -> Result<(NormalizedItem, Duration), String> {
		let (resp_tx, resp_rx) = oneshot::channel();
		if self.cmd_tx.send(SessionCommand::Inspect { triple, ttl, resp: resp_tx }).is_err() {
			self.release_reservation();
			return Err("session actor gone".to_string());
		}
		match resp_rx.await {
			Ok(result) => result,
			Err(_) => {
				self.release_reservation();
				Err("session actor dropped response".to_string())
			},
		}
	}
}

struct SessionActor {
	id: SessionId,
	state: SessionState,
	relogin: bool,
	ready: Arc<AtomicBool>,
	busy: Arc<AtomicBool>,
	current_request: Arc<Mutex<Option<InFlightRequest>>>,
	transport: Box<dyn UpstreamTransport>,
	events: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
	request_delay: Duration,
}

impl SessionActor {
	fn set_ready(&mut self, ready: bool) {
		let was_ready = self.ready.swap(ready, Ordering::SeqCst);
		if ready && !was_ready {
			let _ = self.events.send((self.id, SessionEvent::Ready));
		} else if !ready && was_ready {
			let _ = self.events.send((self.id, SessionEvent::Unready));
		}
	}

	#[instrument(level = "debug", skip(self, account, code), fields(session = self.id))]
	async fn handle_login(&mut self, account: Account, code: Option<String>) {
		self.state = SessionState::Connecting;
		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
		let resolved_code = resolve_login_code(code.as_deref(), account.auth_secret().as_ref(), now);

		if let Err(err) = self.transport.log_in(&account, resolved_code).await {
			self.fail_login(err);
			return;
		}
		self.state = SessionState::LoggedOn;
		self.state = SessionState::GcConnecting;
		if let Err(err) = self.transport.start_gc_session(self.relogin).await {
			self.fail_login(err);
			return;
		}
		self.relogin = false;
		self.state = SessionState::Ready;
		self.set_ready(true);
		let _ = self.events.send((self.id, SessionEvent::LoginSuccess));
	}

	fn fail_login(&mut self, err: UpstreamError) {
		self.state = SessionState::Disconnected;
		self.set_ready(false);
		let reason = classify_failure(&err);
		if reason == FailureReason::Auth {
			let _ = self
				.events
				.send((self.id, SessionEvent::AuthFailed { message: err.message }));
		} else {
			let _ = self.events.send((
				self.id,
				SessionEvent::LoginFailed { reason, message: err.message },
			));
		}
	}

	/// `busy` is already `true`, set by the caller's `try_acquire`; this
	/// function's job is only to clear it again at the right time.
	async fn handle_inspect(
		&mut self,
		triple: Triple,
		ttl: Duration,
		resp: oneshot::Sender<Result<(NormalizedItem, Duration), String>>,
	) {
		let issued_at = Instant::now();
		*self.current_request.lock().await = Some(InFlightRequest { triple: triple.clone(), issued_at });

		let result = tokio::time::timeout(ttl, self.transport.inspect(&triple)).await;

		match result {
			Err(_elapsed) => {
				*self.current_request.lock().await = None;
				self.busy.store(false, Ordering::SeqCst);
				let _ = resp.send(Err("ttl exceeded".to_string()));
			},
			Ok(Ok(raw)) => {
				let elapsed = issued_at.elapsed();
				let delay = self.request_delay.saturating_sub(elapsed);
				let item = normalize(raw);
				let _ = resp.send(Ok((item, delay)));
				// busy (and current_request with it) clears only once the
				// post-reply request-delay spacing has elapsed.
				let busy = self.busy.clone();
				let current_request = self.current_request.clone();
				tokio::spawn(async move {
					tokio::time::sleep(delay).await;
					*current_request.lock().await = None;
					busy.store(false, Ordering::SeqCst);
				});
			},
			Ok(Err(err)) => {
				*self.current_request.lock().await = None;
				self.busy.store(false, Ordering::SeqCst);
				let _ = resp.send(Err(err.message));
			},
		}
	}

	async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>) {
		let mut relogin_sleep = Box::pin(tokio::time::sleep(next_relogin_interval()));
		loop {
			tokio::select! {
				cmd = cmd_rx.recv() => {
					match cmd {
						Some(SessionCommand::LogIn { account, code }) => self.handle_login(account, code).await,
						Some(SessionCommand::Inspect { triple, ttl, resp }) => self.handle_inspect(triple, ttl, resp).await,
						Some(SessionCommand::UpdateProxy { url }) => {
							self.transport.update_proxy(url);
						},
						Some(SessionCommand::Shutdown) | None => {
							self.transport.log_off().await;
							self.set_ready(false);
							break;
						},
					}
				},
				_ = &mut relogin_sleep => {
					if self.state == SessionState::Ready {
						debug!(session = self.id, "scheduled relogin cycle");
						self.relogin = true;
						self.transport.log_off().await;
						self.set_ready(false);
						self.state = SessionState::GcDisconnected;
					}
					relogin_sleep.as_mut().reset(tokio::time::Instant::now() + next_relogin_interval());
				},
			}
		}
	}
}

fn next_relogin_interval() -> Duration {
	let jitter_ms = rand::rng().random_range(0..=4 * 60 * 1000u64);
	Duration::from_millis(30 * 60 * 1000 + jitter_ms)
}

pub fn spawn_session(
	id: SessionId,
	transport: Box<dyn UpstreamTransport>,
	request_delay: Duration,
	events: mpsc::UnboundedSender<(SessionId, SessionEvent)>,
) -> SessionHandle {
	let ready = Arc::new(AtomicBool::new(false));
	let busy = Arc::new(AtomicBool::new(false));
	let current_request = Arc::new(Mutex::new(None));
	let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

	let actor = SessionActor {
		id,
		state: SessionState::New,
		relogin: false,
		ready: ready.clone(),
		busy: busy.clone(),
		current_request: current_request.clone(),
		transport,
		events,
		request_delay,
	};
	tokio::spawn(actor.run(cmd_rx));

	info!(session = id, "session actor spawned");
	SessionHandle { id, ready, busy, current_request, cmd_tx }
}

/// A transport used where the real upstream protocol is out of scope: logs
/// in instantly unless seeded to fail, and returns canned item data. This is
/// the one concrete [`UpstreamTransport`] the binary ships, and it is also
/// what the test suite drives.
pub struct SimulatedTransport {
	pub fail_login_with: Option<UpstreamError>,
	pub canned_item: RawItemData,
	pub inspect_delay: Duration,
	pub proxy_url: Option<String>,
}

impl Default for SimulatedTransport {
	fn default() -> Self {
		Self {
			fail_login_with: None,
			canned_item: RawItemData::default(),
			inspect_delay: Duration::from_millis(0),
			proxy_url: None,
		}
	}
}

#[async_trait::async_trait]
impl UpstreamTransport for SimulatedTransport {
	async fn log_in(&mut self, _account: &Account, _code: Option<String>) -> Result<(), UpstreamError> {
		match &self.fail_login_with {
			Some(err) => Err(err.clone()),
			None => Ok(()),
		}
	}

	async fn start_gc_session(&mut self, _relogin: bool) -> Result<(), UpstreamError> {
		Ok(())
	}

	async fn inspect(&mut self, _triple: &Triple) -> Result<RawItemData, UpstreamError> {
		if !self.inspect_delay.is_zero() {
			tokio::time::sleep(self.inspect_delay).await;
		}
		Ok(self.canned_item.clone())
	}

	async fn log_off(&mut self) {}

	fn update_proxy(&mut self, proxy_url: Option<String>) {
		self.proxy_url = proxy_url;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn owner_prefers_s_over_m() {
		let t = Triple { s: "123".into(), a: "1".into(), d: "1".into(), m: Some("999".into()) };
		assert_eq!(t.owner(), Some("123"));
	}

	#[test]
	fn owner_falls_back_to_m_when_s_is_zero() {
		let t = Triple { s: "0".into(), a: "1".into(), d: "1".into(), m: Some("999".into()) };
		assert_eq!(t.owner(), Some("999"));
		assert!(t.is_market_link());
	}

	#[test]
	fn normalize_round_trip_law() {
		let raw = RawItemData {
			paintwear: Some(0.123),
			paintseed: None,
			stickers: vec![RawSticker { sticker_id: 5 }],
			extra: Default::default(),
		};
		let item = normalize(raw);
		assert_eq!(item.floatvalue, Some(0.123));
		assert_eq!(item.paintseed, 0);
		assert_eq!(item.stickers[0].sticker_id, 5);
	}

	#[test]
	fn classify_steamguard_is_not_auth() {
		let err = UpstreamError::with_eresult("need 2fa", 63);
		assert_eq!(classify_failure(&err), FailureReason::Steamguard);
	}

	#[test]
	fn classify_ratelimit_by_text() {
		let err = UpstreamError::new("RateLimitExceeded while logging in");
		assert_eq!(classify_failure(&err), FailureReason::RateLimit);
	}

	#[test]
	fn classify_proxy_errors() {
		let err = UpstreamError::new("Proxy connection timed out");
		assert_eq!(classify_failure(&err), FailureReason::Proxy);
	}

	#[test]
	fn classify_auth_is_terminal() {
		let err = UpstreamError::with_eresult("InvalidPassword", 61);
		assert_eq!(classify_failure(&err), FailureReason::Auth);
	}

	#[test]
	fn classify_unknown_is_other() {
		let err = UpstreamError::new("something weird");
		assert_eq!(classify_failure(&err), FailureReason::Other);
	}

	#[tokio::test]
	async fn session_becomes_ready_after_successful_login() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let transport = Box::new(SimulatedTransport::default());
		let handle = spawn_session(1, transport, Duration::from_millis(10), tx);
		handle.log_in(Account { username: "a".into(), password: "p".into(), shared_secret: None }, None);
		let (_, event) = rx.recv().await.unwrap();
		assert!(matches!(event, SessionEvent::LoginSuccess));
		tokio::time::sleep(Duration::from_millis(5)).await;
		assert!(handle.is_ready());
	}

	#[tokio::test]
	async fn session_emits_login_failed_on_proxy_error() {
		let (tx, mut rx) = mpsc::unbounded_channel();
		let mut sim = SimulatedTransport::default();
		sim.fail_login_with = Some(UpstreamError::new("connection refused"));
		let handle = spawn_session(2, Box::new(sim), Duration::from_millis(10), tx);
		handle.log_in(Account { username: "a".into(), password: "p".into(), shared_secret: None }, None);
		let (_, event) = rx.recv().await.unwrap();
		match event {
			SessionEvent::LoginFailed { reason, .. } => assert_eq!(reason, FailureReason::Proxy),
			other => panic!("unexpected event: {other:?}"),
		}
		assert!(!handle.is_ready());
	}

	#[tokio::test]
	async fn busy_clears_after_request_delay() {
		let (tx, _rx) = mpsc::unbounded_channel();
		let transport = Box::new(SimulatedTransport::default());
		let handle = spawn_session(3, transport, Duration::from_millis(30), tx);
		handle.log_in(Account { username: "a".into(), password: "p".into(), shared_secret: None }, None);
		tokio::time::sleep(Duration::from_millis(5)).await;
		assert!(handle.is_ready());

		let triple = Triple { s: "0".into(), a: "1".into(), d: "1".into(), m: Some("2".into()) };
		assert!(handle.try_acquire());
		let (item, delay) = handle.inspect(triple, Duration::from_secs(1)).await.unwrap();
		assert_eq!(item.paintseed, 0);
		assert!(handle.is_busy(), "busy should be set immediately after reply until delay elapses");
		tokio::time::sleep(delay + Duration::from_millis(20)).await;
		assert!(!handle.is_busy());
	}
}
