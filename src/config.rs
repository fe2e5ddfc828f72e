//! Static configuration: the account roster, proxy file, and the tuning
//! knobs for the pool/fleet/queue. Loaded once at startup, analogous to the
//! split between CLI-level config and the static config file the teacher
//! loads in `static.rs`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::guard_code::AuthSecret;

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Account {
	pub username: String,
	pub password: String,
	#[serde(default)]
	pub shared_secret: Option<String>,
}

impl Account {
	pub fn auth_secret(&self) -> Option<AuthSecret> {
		self
			.shared_secret
			.as_deref()
			.map(AuthSecret::classify)
	}
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_true")]
	pub exclude_failed: bool,
	#[serde(default = "default_retry_delay_ms")]
	pub retry_delay_ms: u64,
}

impl Default for RetryPolicyConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			max_retries: default_max_retries(),
			exclude_failed: true,
			retry_delay_ms: default_retry_delay_ms(),
		}
	}
}

fn default_true() -> bool {
	true
}
fn default_max_retries() -> u32 {
	3
}
fn default_retry_delay_ms() -> u64 {
	5_000
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyPoolConfig {
	pub proxy_file: Option<String>,
	#[serde(default = "default_max_requests_per_proxy")]
	pub max_requests_per_proxy: u32,
	#[serde(default = "default_request_cooldown_ms")]
	pub request_cooldown_ms: u64,
	#[serde(default)]
	pub retry: RetryPolicyConfig,
	#[serde(default)]
	pub strategy: crate::proxy_pool::SelectionStrategy,
}

impl Default for ProxyPoolConfig {
	fn default() -> Self {
		Self {
			proxy_file: None,
			max_requests_per_proxy: default_max_requests_per_proxy(),
			request_cooldown_ms: default_request_cooldown_ms(),
			retry: RetryPolicyConfig::default(),
			strategy: crate::proxy_pool::SelectionStrategy::LeastLoaded,
		}
	}
}

fn default_max_requests_per_proxy() -> u32 {
	5
}
fn default_request_cooldown_ms() -> u64 {
	0
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
	#[serde(default)]
	pub max_simultaneous_requests: usize,
	#[serde(default)]
	pub max_queue_size: usize,
	#[serde(default = "default_max_attempts")]
	pub max_attempts: u32,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			max_simultaneous_requests: 0,
			max_queue_size: 0,
			max_attempts: default_max_attempts(),
		}
	}
}

fn default_max_attempts() -> u32 {
	3
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
	pub window_ms: u64,
	pub max_requests: u32,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
	#[serde(default)]
	pub bulk_key: Option<String>,
	#[serde(default)]
	pub price_key: Option<String>,
	#[serde(default)]
	pub auth_key: Option<String>,
	#[serde(default)]
	pub allowed_origins: Vec<String>,
	#[serde(default)]
	pub allowed_regex_origins: Vec<String>,
	#[serde(default)]
	pub rate_limit: Option<RateLimitConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
	pub accounts_file: String,
	#[serde(default = "default_max_online_bots")]
	pub max_online_bots: usize,
	#[serde(default = "default_bind_addr")]
	pub bind_addr: String,
	#[serde(default)]
	pub proxy_pool: ProxyPoolConfig,
	#[serde(default)]
	pub queue: QueueConfig,
	#[serde(default)]
	pub http: HttpConfig,
	/// Seconds between activations of one spare account from the queue.
	#[serde(default = "default_spare_account_delay_secs")]
	pub spare_account_delay_secs: u64,
	/// Per-request timeout enforced by the TTL timer in C1.
	#[serde(default = "default_request_ttl_ms")]
	pub request_ttl_ms: u64,
	/// Base request spacing delay honored after an inspect reply.
	#[serde(default = "default_request_delay_ms")]
	pub request_delay_ms: u64,
}

fn default_max_online_bots() -> usize {
	10
}
fn default_bind_addr() -> String {
	"0.0.0.0:3000".to_string()
}
fn default_spare_account_delay_secs() -> u64 {
	5
}
fn default_request_ttl_ms() -> u64 {
	10_000
}
fn default_request_delay_ms() -> u64 {
	1_000
}

impl GatewayConfig {
	pub fn from_str(raw: &str) -> anyhow::Result<Self> {
		if let Ok(cfg) = serde_json::from_str::<GatewayConfig>(raw) {
			return Ok(cfg);
		}
		Ok(serde_yaml::from_str(raw)?)
	}

	pub async fn load(path: &Path) -> anyhow::Result<Self> {
		let raw = tokio::fs::read_to_string(path).await?;
		Self::from_str(&raw)
	}
}

/// Load the account roster from a JSON or YAML file.
pub async fn load_accounts(path: &str) -> anyhow::Result<Vec<Account>> {
	let raw = tokio::fs::read_to_string(path).await?;
	if let Ok(accounts) = serde_json::from_str::<Vec<Account>>(&raw) {
		return Ok(accounts);
	}
	Ok(serde_yaml::from_str(&raw)?)
}

/// Load proxy URLs from a text file, one per line, blank lines skipped.
///
/// If the file is unreadable, callers fall back to a single "no proxy" group
/// per C2's loading contract; this function itself just surfaces the error.
pub async fn load_proxies(path: &str) -> anyhow::Result<Vec<String>> {
	let raw = tokio::fs::read_to_string(path).await?;
	Ok(
		raw
			.lines()
			.map(str::trim)
			.filter(|l| !l.is_empty())
			.map(str::to_string)
			.collect(),
	)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_json_accounts() {
		let raw = r#"[{"username":"a","password":"p"},{"username":"b","password":"p","shared_secret":"AAAAA"}]"#;
		let accounts: Vec<Account> = serde_json::from_str(raw).unwrap();
		assert_eq!(accounts.len(), 2);
		assert!(accounts[0].shared_secret.is_none());
		assert_eq!(accounts[1].shared_secret.as_deref(), Some("AAAAA"));
	}

	#[test]
	fn default_queue_config_has_no_caps() {
		let cfg = QueueConfig::default();
		assert_eq!(cfg.max_simultaneous_requests, 0);
		assert_eq!(cfg.max_queue_size, 0);
	}
}
