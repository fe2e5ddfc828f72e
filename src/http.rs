//! C7: the HTTP surface. Parses requests, assembles a Job, resolves cache
//! hits, hands the residue to C4, and exposes the admin/status endpoints.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::Query;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::cache::CacheStore;
use crate::config::{GatewayConfig, HttpConfig};
use crate::errors::GatewayError;
use crate::fleet::Fleet;
use crate::proxy_pool::ProxyPool;
use crate::queue::{DispatchHandler, Job, JobLink, RequestQueue};
use crate::session::Triple;

static INSPECT_URL_RE: Lazy<Regex> =
	Lazy::new(|| Regex::new(r"(?:S(?P<s>\d+)|M(?P<m>\d+))A(?P<a>\d+)D(?P<d>\d+)").unwrap());

/// Parse a pre-formed inspect URL (`...S<owner>A<asset>D<d>...` or the
/// `M`-prefixed market variant) into a [`Triple`].
fn parse_inspect_url(url: &str) -> Result<Triple, GatewayError> {
	let caps = INSPECT_URL_RE.captures(url).ok_or(GatewayError::InvalidInspect)?;
	let a = caps.name("a").unwrap().as_str().to_string();
	let d = caps.name("d").unwrap().as_str().to_string();
	if let Some(s) = caps.name("s") {
		Ok(Triple { s: s.as_str().to_string(), a, d, m: None })
	} else if let Some(m) = caps.name("m") {
		Ok(Triple { s: "0".to_string(), a, d, m: Some(m.as_str().to_string()) })
	} else {
		Err(GatewayError::InvalidInspect)
	}
}

/// Build a triple from discrete `s`/`a`/`d`/`m` parameters: `url` OR
/// (`a` ∧ `d` ∧ (`s` ∨ `m`)).
fn parse_discrete(a: Option<&str>, d: Option<&str>, s: Option<&str>, m: Option<&str>) -> Result<Triple, GatewayError> {
	let (Some(a), Some(d)) = (a, d) else { return Err(GatewayError::InvalidInspect) };
	let s = s.unwrap_or("0").to_string();
	if s == "0" && m.is_none() {
		return Err(GatewayError::InvalidInspect);
	}
	Ok(Triple { s, a: a.to_string(), d: d.to_string(), m: m.map(str::to_string) })
}

/// Price submission rule: a configured `price_key` must be set, the
/// submitted key must match it, the price must be all-digits, and the link
/// must be a market link (owner comes from `m`, not `s`).
fn accepted_price(cfg: &HttpConfig, submitted_key: Option<&str>, price: Option<&str>, triple: &Triple) -> Option<String> {
	let configured = cfg.price_key.as_deref()?;
	let submitted_key = submitted_key?;
	let price = price?;
	if configured != submitted_key {
		return None;
	}
	if price.is_empty() || !price.chars().all(|c| c.is_ascii_digit()) {
		return None;
	}
	if !triple.is_market_link() {
		return None;
	}
	Some(price.to_string())
}

struct RateLimiter {
	window: Duration,
	max: u32,
	buckets: StdMutex<std::collections::HashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
	fn new(window: Duration, max: u32) -> Self {
		Self { window, max, buckets: StdMutex::new(std::collections::HashMap::new()) }
	}

	/// Fixed-window counter: returns `true` when the request is within the
	/// window's budget.
	fn allow(&self, ip: IpAddr) -> bool {
		let mut buckets = self.buckets.lock().unwrap();
		let now = Instant::now();
		let entry = buckets.entry(ip).or_insert((now, 0));
		if now.duration_since(entry.0) >= self.window {
			*entry = (now, 0);
		}
		entry.1 += 1;
		entry.1 <= self.max
	}
}

struct AppStateInner<C: CacheStore + 'static, H: DispatchHandler + 'static> {
	fleet: Arc<Fleet>,
	pool: Arc<ProxyPool>,
	queue: Arc<RequestQueue<H>>,
	cache: Arc<C>,
	http: HttpConfig,
	max_simultaneous_requests: usize,
	max_queue_size: usize,
	cors_exact: Vec<String>,
	cors_regex: Vec<Regex>,
	rate_limiter: Option<RateLimiter>,
	request_counter: AtomicU32,
}

pub struct AppState<C: CacheStore + 'static, H: DispatchHandler + 'static>(Arc<AppStateInner<C, H>>);

impl<C: CacheStore + 'static, H: DispatchHandler + 'static> Clone for AppState<C, H> {
	fn clone(&self) -> Self {
		AppState(self.0.clone())
	}
}

impl<C: CacheStore + 'static, H: DispatchHandler + 'static> AppState<C, H> {
	pub fn new(cfg: &GatewayConfig, fleet: Arc<Fleet>, pool: Arc<ProxyPool>, queue: Arc<RequestQueue<H>>, cache: Arc<C>) -> Self {
		let cors_regex = cfg
			.http
			.allowed_regex_origins
			.iter()
			.filter_map(|pattern| Regex::new(pattern).ok())
			.collect();
		let rate_limiter = cfg
			.http
			.rate_limit
			.as_ref()
			.map(|rl| RateLimiter::new(Duration::from_millis(rl.window_ms), rl.max_requests));
		AppState(Arc::new(AppStateInner {
			fleet,
			pool,
			queue,
			cache,
			http: cfg.http.clone(),
			max_simultaneous_requests: cfg.queue.max_simultaneous_requests,
			max_queue_size: cfg.queue.max_queue_size,
			cors_exact: cfg.http.allowed_origins.clone(),
			cors_regex,
			rate_limiter,
			request_counter: AtomicU32::new(0),
		}))
	}

	fn origin_allowed(&self, origin: &str) -> bool {
		self.0.cors_exact.iter().any(|o| o == origin) || self.0.cors_regex.iter().any(|re| re.is_match(origin))
	}

	fn cors_enabled(&self) -> bool {
		!self.0.cors_exact.is_empty() || !self.0.cors_regex.is_empty()
	}
}

pub fn router<C: CacheStore + 'static, H: DispatchHandler + 'static>(state: AppState<C, H>) -> Router {
	Router::new()
		.route("/", get(get_inspect::<C, H>))
		.route("/bulk", post(post_bulk::<C, H>))
		.route("/stats", get(get_stats::<C, H>))
		.route("/auth", post(post_auth::<C, H>))
		.route("/pending-auth", get(get_pending_auth::<C, H>))
		.route("/status", get(get_status::<C, H>))
		.layer(middleware::from_fn_with_state(state.clone(), cors_middleware::<C, H>))
		.layer(middleware::from_fn_with_state(state.clone(), rate_limit_middleware::<C, H>))
		.with_state(state)
}

async fn cors_middleware<C: CacheStore + 'static, H: DispatchHandler + 'static>(
	State(state): State<AppState<C, H>>,
	req: axum::extract::Request,
	next: Next,
) -> Response {
	let origin = req
		.headers()
		.get(header::ORIGIN)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string);
	let mut response = next.run(req).await;
	if state.cors_enabled() {
		if let Some(origin) = origin {
			if state.origin_allowed(&origin) {
				if let Ok(value) = HeaderValue::from_str(&origin) {
					response.headers_mut().insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
					response
						.headers_mut()
						.insert(header::ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET"));
				}
			}
		}
	}
	response
}

async fn rate_limit_middleware<C: CacheStore + 'static, H: DispatchHandler + 'static>(
	State(state): State<AppState<C, H>>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	req: axum::extract::Request,
	next: Next,
) -> Response {
	if let Some(limiter) = &state.0.rate_limiter {
		if !limiter.allow(addr.ip()) {
			return GatewayError::RateLimit.into_response();
		}
	}
	next.run(req).await
}

#[derive(Debug, Deserialize)]
struct GetQuery {
	url: Option<String>,
	a: Option<String>,
	d: Option<String>,
	s: Option<String>,
	m: Option<String>,
	price: Option<String>,
	#[serde(rename = "priceKey")]
	price_key: Option<String>,
}

/// Admission is checked only when there is residue to enqueue: a fully
/// cache-resolved request is always served, even with zero ready sessions.
async fn admit<C: CacheStore + 'static, H: DispatchHandler + 'static>(
	state: &AppState<C, H>,
	ip: IpAddr,
	remaining: usize,
) -> Result<(), GatewayError> {
	if remaining == 0 {
		return Ok(());
	}
	if state.0.fleet.ready_count().await == 0 {
		return Err(GatewayError::SteamOffline);
	}
	let max_simultaneous = state.0.max_simultaneous_requests;
	if max_simultaneous > 0 {
		let in_flight = state.0.queue.users_in_flight(ip).await;
		if in_flight + remaining > max_simultaneous {
			return Err(GatewayError::MaxRequests);
		}
	}
	let max_queue = state.0.max_queue_size;
	if max_queue > 0 {
		let queue_size = state.0.queue.queue_size().await;
		if queue_size + remaining > max_queue {
			return Err(GatewayError::MaxQueueSize);
		}
	}
	Ok(())
}

/// Split a job's links into already-cached slots (resolved immediately) and
/// residue to hand to C4, annotated with the cached-or-not result.
async fn resolve_cache_hits<C: CacheStore>(cache: &C, job: &Arc<Job>) -> Vec<(usize, JobLink)> {
	let mut residue = Vec::new();
	for (idx, link) in job.links.iter().enumerate() {
		match cache.get(&link.triple.a).await {
			Some(cached) => job.resolve_slot(idx, Ok(cached)).await,
			None => residue.push((idx, link.clone())),
		}
	}
	residue
}

#[instrument(level = "debug", skip(state))]
async fn get_inspect<C: CacheStore + 'static, H: DispatchHandler + 'static>(
	State(state): State<AppState<C, H>>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	Query(q): Query<GetQuery>,
) -> Response {
	let triple = match &q.url {
		Some(url) => parse_inspect_url(url),
		None => parse_discrete(q.a.as_deref(), q.d.as_deref(), q.s.as_deref(), q.m.as_deref()),
	};
	let triple = match triple {
		Ok(t) => t,
		Err(e) => return e.into_response(),
	};

	let price = accepted_price(&state.0.http, q.price_key.as_deref(), q.price.as_deref(), &triple);
	let (job, mut receivers) = Job::new(addr.ip(), false, vec![JobLink { triple, price: price.clone() }]);
	if let Some(price) = &price {
		state.0.cache.update_price(&job.links[0].triple.a, price).await;
	}

	let residue = resolve_cache_hits(state.0.cache.as_ref(), &job).await;
	if let Err(e) = admit(&state, addr.ip(), residue.len()).await {
		return e.into_response();
	}
	if !residue.is_empty() {
		state.0.queue.add_job(job.clone(), residue).await;
	}

	match receivers.remove(0).await {
		Ok(Ok(value)) => Json(value).into_response(),
		Ok(Err(e)) => e.into_response(),
		Err(_) => GatewayError::GenericBad("response channel dropped".to_string()).into_response(),
	}
}

#[derive(Debug, Deserialize)]
struct BulkLinkEntry {
	link: String,
	price: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BulkBody {
	bulk_key: Option<String>,
	#[serde(rename = "priceKey")]
	price_key: Option<String>,
	links: Vec<BulkLinkEntry>,
}

#[derive(Debug, Serialize)]
struct BulkLinkResponse {
	#[serde(skip_serializing_if = "Option::is_none")]
	result: Option<serde_json::Value>,
	#[serde(skip_serializing_if = "Option::is_none")]
	error: Option<String>,
}

#[instrument(level = "debug", skip(state, body))]
async fn post_bulk<C: CacheStore + 'static, H: DispatchHandler + 'static>(
	State(state): State<AppState<C, H>>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	body: Result<Json<BulkBody>, axum::extract::rejection::JsonRejection>,
) -> Response {
	let Json(body) = match body {
		Ok(b) => b,
		Err(e) => return GatewayError::BadBody(e.body_text()).into_response(),
	};
	if body.links.is_empty() {
		return GatewayError::BadBody("links must not be empty".to_string()).into_response();
	}
	if let Some(configured) = &state.0.http.bulk_key {
		if body.bulk_key.as_deref() != Some(configured.as_str()) {
			return GatewayError::BadSecret.into_response();
		}
	}
	if state.0.max_simultaneous_requests > 0 && body.links.len() > state.0.max_simultaneous_requests {
		return GatewayError::MaxRequests.into_response();
	}

	let mut links = Vec::with_capacity(body.links.len());
	for entry in &body.links {
		let triple = match parse_inspect_url(&entry.link).or_else(|_| parse_link_params(&entry.link)) {
			Ok(t) => t,
			Err(e) => return e.into_response(),
		};
		// (a) open question resolved: `price` is read from the body entry,
		// not the URL query, for every link in the bulk payload.
		let price = accepted_price(&state.0.http, body.price_key.as_deref(), entry.price.as_deref(), &triple);
		links.push(JobLink { triple, price });
	}

	for link in &links {
		if let Some(price) = &link.price {
			state.0.cache.update_price(&link.triple.a, price).await;
		}
	}

	let (job, receivers) = Job::new(addr.ip(), true, links);
	let residue = resolve_cache_hits(state.0.cache.as_ref(), &job).await;
	if let Err(e) = admit(&state, addr.ip(), residue.len()).await {
		return e.into_response();
	}
	if !residue.is_empty() {
		state.0.queue.add_job(job.clone(), residue).await;
	}

	let mut results = Vec::with_capacity(receivers.len());
	for rx in receivers {
		match rx.await {
			Ok(Ok(value)) => results.push(BulkLinkResponse { result: Some(value), error: None }),
			Ok(Err(e)) => results.push(BulkLinkResponse { result: None, error: Some(e.kind().to_string()) }),
			Err(_) => results.push(BulkLinkResponse { result: None, error: Some("GenericBad".to_string()) }),
		}
	}
	Json(results).into_response()
}

/// `/bulk` links may also come as discrete-parameter query strings rather
/// than full inspect URLs; try that shape once the URL-style parse fails.
fn parse_link_params(raw: &str) -> Result<Triple, GatewayError> {
	let parsed = url::Url::parse(raw).or_else(|_| url::Url::parse(&format!("http://x/?{raw}")));
	let Ok(parsed) = parsed else { return Err(GatewayError::InvalidInspect) };
	let mut a = None;
	let mut d = None;
	let mut s = None;
	let mut m = None;
	for (k, v) in parsed.query_pairs() {
		match k.as_ref() {
			"a" => a = Some(v.to_string()),
			"d" => d = Some(v.to_string()),
			"s" => s = Some(v.to_string()),
			"m" => m = Some(v.to_string()),
			_ => {},
		}
	}
	parse_discrete(a.as_deref(), d.as_deref(), s.as_deref(), m.as_deref())
}

#[derive(Debug, Serialize)]
struct StatsResponse {
	bots_online: usize,
	bots_total: usize,
	queue_size: usize,
	queue_concurrency: usize,
	pending_auth: usize,
	#[serde(skip_serializing_if = "Option::is_none")]
	proxy_pool: Option<Vec<GroupStat>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pending_auth_details: Option<Vec<PendingAuthView>>,
}

#[derive(Debug, Serialize)]
struct GroupStat {
	id: usize,
	active_requests: u32,
	total_requests: u64,
	success_rate: f64,
}

#[derive(Debug, Serialize)]
struct PendingAuthView {
	username: String,
	auth_type: String,
	waiting_secs: u64,
}

async fn get_stats<C: CacheStore + 'static, H: DispatchHandler + 'static>(State(state): State<AppState<C, H>>) -> Response {
	let status = state.0.fleet.status().await;
	let pending = state.0.fleet.pending_auth().await;
	let proxy_pool = state
		.0
		.pool
		.group_stats()
		.await
		.into_iter()
		.map(|(id, active, total, rate)| GroupStat { id, active_requests: active, total_requests: total, success_rate: rate })
		.collect();
	let pending_auth_details = pending
		.into_iter()
		.map(|p| PendingAuthView {
			username: p.account.username.clone(),
			auth_type: p.auth_type.clone(),
			waiting_secs: p.requested_at.elapsed().as_secs(),
		})
		.collect::<Vec<_>>();

	Json(StatsResponse {
		bots_online: status.online,
		bots_total: status.total,
		queue_size: state.0.queue.queue_size().await,
		queue_concurrency: state.0.queue.concurrency(),
		pending_auth: status.pending_auth,
		proxy_pool: Some(proxy_pool),
		pending_auth_details: Some(pending_auth_details),
	})
	.into_response()
}

async fn get_status<C: CacheStore + 'static, H: DispatchHandler + 'static>(State(state): State<AppState<C, H>>) -> Response {
	Json(state.0.fleet.status().await).into_response()
}

async fn get_pending_auth<C: CacheStore + 'static, H: DispatchHandler + 'static>(State(state): State<AppState<C, H>>) -> Response {
	let views: Vec<PendingAuthView> = state
		.0
		.fleet
		.pending_auth()
		.await
		.into_iter()
		.map(|p| PendingAuthView {
			username: p.account.username.clone(),
			auth_type: p.auth_type.clone(),
			waiting_secs: p.requested_at.elapsed().as_secs(),
		})
		.collect();
	Json(views).into_response()
}

#[derive(Debug, Deserialize)]
struct AuthBody {
	username: String,
	code: String,
	auth_key: Option<String>,
}

async fn post_auth<C: CacheStore + 'static, H: DispatchHandler + 'static>(
	State(state): State<AppState<C, H>>,
	Json(body): Json<AuthBody>,
) -> Response {
	if let Some(configured) = &state.0.http.auth_key {
		if body.auth_key.as_deref() != Some(configured.as_str()) {
			return GatewayError::BadSecret.into_response();
		}
	}
	let ok = state.0.fleet.submit_auth_code(&body.username, body.code).await;
	if ok {
		info!(username = %body.username, "operator submitted login code");
		StatusCode::OK.into_response()
	} else {
		StatusCode::NOT_FOUND.into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::session::Triple;

	fn triple(s: &str, m: Option<&str>) -> Triple {
		Triple { s: s.to_string(), a: "1".into(), d: "1".into(), m: m.map(str::to_string) }
	}

	#[test]
	fn parses_market_inspect_url() {
		let url = "steam://rungame/730/1/+csgo_econ_action_preview M76561198000A123456789D987654321";
		let t = parse_inspect_url(url).unwrap();
		assert_eq!(t.m.as_deref(), Some("76561198000"));
		assert_eq!(t.a, "123456789");
		assert_eq!(t.d, "987654321");
	}

	#[test]
	fn parses_owner_inspect_url() {
		let url = "...S76561198000A123456789D987654321";
		let t = parse_inspect_url(url).unwrap();
		assert_eq!(t.s, "76561198000");
	}

	#[test]
	fn discrete_requires_a_and_d_and_owner() {
		assert!(parse_discrete(Some("1"), Some("2"), None, None).is_err());
		assert!(parse_discrete(Some("1"), Some("2"), Some("5"), None).is_ok());
		assert!(parse_discrete(Some("1"), Some("2"), None, Some("9")).is_ok());
	}

	#[test]
	fn price_requires_market_link_and_matching_key_and_digits() {
		let mut cfg = HttpConfig::default();
		cfg.price_key = Some("secret".to_string());
		let market = triple("0", Some("9"));
		let owned = triple("5", None);

		assert_eq!(accepted_price(&cfg, Some("secret"), Some("1299"), &market), Some("1299".to_string()));
		assert_eq!(accepted_price(&cfg, Some("wrong"), Some("1299"), &market), None);
		assert_eq!(accepted_price(&cfg, Some("secret"), Some("12.99"), &market), None);
		assert_eq!(accepted_price(&cfg, Some("secret"), Some("1299"), &owned), None);
	}

	#[test]
	fn rate_limiter_allows_up_to_max_then_blocks_within_window() {
		let limiter = RateLimiter::new(Duration::from_secs(60), 2);
		let ip: IpAddr = "127.0.0.1".parse().unwrap();
		assert!(limiter.allow(ip));
		assert!(limiter.allow(ip));
		assert!(!limiter.allow(ip));
	}
}
