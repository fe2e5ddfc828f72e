//! C6: the cache facade. The real backing store (a relational database) is
//! out of scope; this is the seam a real deployment plugs a Postgres/SQLite
//! implementation into, with an in-memory implementation sufficient to
//! exercise the read/insert flow end to end.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::RwLock;

#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
	async fn get(&self, asset_id: &str) -> Option<Value>;
	async fn insert(&self, asset_id: &str, item: Value);
	async fn update_price(&self, asset_id: &str, price: &str);
}

/// In-memory `CacheStore`, keyed by asset id (`a`), the reply-correlation
/// key for an inspect triple.
#[derive(Default)]
pub struct MemoryCacheStore {
	entries: RwLock<HashMap<String, Value>>,
}

impl MemoryCacheStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait::async_trait]
impl CacheStore for MemoryCacheStore {
	async fn get(&self, asset_id: &str) -> Option<Value> {
		self.entries.read().await.get(asset_id).cloned()
	}

	async fn insert(&self, asset_id: &str, item: Value) {
		self.entries.write().await.insert(asset_id.to_string(), item);
	}

	async fn update_price(&self, asset_id: &str, price: &str) {
		let mut entries = self.entries.write().await;
		match entries.get_mut(asset_id) {
			Some(Value::Object(map)) => {
				map.insert("price".to_string(), Value::String(price.to_string()));
			},
			_ => {
				let mut map = serde_json::Map::new();
				map.insert("price".to_string(), Value::String(price.to_string()));
				entries.insert(asset_id.to_string(), Value::Object(map));
			},
		}
	}
}
