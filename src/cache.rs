//! Typed helpers over a generic key/value store with per-family TTLs
//! (§3, §4.6). Supports write-through (default, synchronous) and
//! write-behind (batched, best-effort) write paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::CacheConfig;
use crate::error::TickstreamError;
use crate::models::{cache_key_change_rate, cache_key_price, cache_key_status, cache_key_symbol, ChangeRate, ChangeWindow, Tick};

/// External store contract (§6). Concrete Redis/SQL backends implement
/// this outside the core; the pipeline only depends on the trait.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), TickstreamError>;
    async fn get(&self, key: &str) -> Result<Option<String>, TickstreamError>;
    async fn mset(&self, items: &[(String, String, Duration)]) -> Result<(), TickstreamError>;
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, TickstreamError>;
    async fn delete(&self, key: &str) -> Result<(), TickstreamError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), TickstreamError>;
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, TickstreamError>;
    async fn scan_by_prefix(&self, prefix: &str) -> Result<Vec<String>, TickstreamError>;
    async fn ping(&self) -> Result<(), TickstreamError>;
}

/// In-process store used by tests and as a cache-aside reference
/// implementation; production deployments provide a real `KeyValueStore`.
#[derive(Default)]
pub struct InMemoryStore {
    data: parking_lot::Mutex<HashMap<String, String>>,
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn set(&self, key: &str, value: String, _ttl: Duration) -> Result<(), TickstreamError> {
        self.data.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, TickstreamError> {
        Ok(self.data.lock().get(key).cloned())
    }

    async fn mset(&self, items: &[(String, String, Duration)]) -> Result<(), TickstreamError> {
        let mut data = self.data.lock();
        for (k, v, _ttl) in items {
            data.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, TickstreamError> {
        let data = self.data.lock();
        Ok(keys.iter().map(|k| data.get(k).cloned()).collect())
    }

    async fn delete(&self, key: &str) -> Result<(), TickstreamError> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), TickstreamError> {
        Ok(())
    }

    async fn ttl(&self, _key: &str) -> Result<Option<Duration>, TickstreamError> {
        Ok(None)
    }

    async fn scan_by_prefix(&self, prefix: &str) -> Result<Vec<String>, TickstreamError> {
        Ok(self
            .data
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<(), TickstreamError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub write_behind_dropped: AtomicU64,
}

enum WriteBehindOp {
    Set {
        key: String,
        value: String,
        ttl: Duration,
    },
}

pub struct Cache {
    store: std::sync::Arc<dyn KeyValueStore>,
    config: CacheConfig,
    stats: std::sync::Arc<CacheStats>,
    write_behind_tx: Option<mpsc::Sender<WriteBehindOp>>,
}

impl Cache {
    pub fn new(store: std::sync::Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        let stats = std::sync::Arc::new(CacheStats::default());
        let write_behind_tx = if config.enable_write_behind {
            Some(spawn_write_behind_worker(
                store.clone(),
                stats.clone(),
                config.batch_size,
                config.batch_timeout,
            ))
        } else {
            None
        };
        Self {
            store,
            config,
            stats,
            write_behind_tx,
        }
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
            self.stats.write_behind_dropped.load(Ordering::Relaxed),
        )
    }

    async fn write(&self, key: String, value: String, ttl: Duration) -> Result<(), TickstreamError> {
        if self.config.enable_write_behind {
            if let Some(tx) = &self.write_behind_tx {
                if tx
                    .try_send(WriteBehindOp::Set {
                        key: key.clone(),
                        value,
                        ttl,
                    })
                    .is_err()
                {
                    self.stats.write_behind_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(key, "write-behind queue full, dropping update");
                }
                return Ok(());
            }
        }
        self.store.set(&key, value, ttl).await
    }

    async fn read(&self, key: &str) -> Result<Option<String>, TickstreamError> {
        let value = self.store.get(key).await?;
        if value.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(value)
    }

    pub async fn set_price(&self, tick: &Tick) -> Result<(), TickstreamError> {
        let key = cache_key_price(&tick.symbol);
        let value = serde_json::to_string(tick)
            .map_err(|e| TickstreamError::Data { symbol: tick.symbol.clone(), message: e.to_string() })?;
        self.write(key, value, self.config.price_ttl).await
    }

    pub async fn get_price(&self, symbol: &str) -> Result<Option<Tick>, TickstreamError> {
        let key = cache_key_price(symbol);
        match self.read(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| TickstreamError::Data { symbol: symbol.to_string(), message: e.to_string() }),
            None => Ok(None),
        }
    }

    pub async fn set_change_rate(&self, rate: &ChangeRate) -> Result<(), TickstreamError> {
        let key = cache_key_change_rate(&rate.symbol, rate.window);
        let value = serde_json::to_string(rate)
            .map_err(|e| TickstreamError::Data { symbol: rate.symbol.clone(), message: e.to_string() })?;
        self.write(key, value, self.config.change_rate_ttl).await
    }

    pub async fn get_change_rate(
        &self,
        symbol: &str,
        window: ChangeWindow,
    ) -> Result<Option<ChangeRate>, TickstreamError> {
        let key = cache_key_change_rate(symbol, window);
        match self.read(&key).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| TickstreamError::Data { symbol: symbol.to_string(), message: e.to_string() }),
            None => Ok(None),
        }
    }

    pub async fn set_status(&self, name: &str, value: String) -> Result<(), TickstreamError> {
        let key = cache_key_status(name);
        self.write(key, value, self.config.status_ttl).await
    }

    pub async fn set_symbol_info(&self, symbol: &str, value: String) -> Result<(), TickstreamError> {
        let key = cache_key_symbol(symbol);
        self.write(key, value, self.config.symbol_ttl).await
    }

    /// Pattern ops expressible by key prefix. MUST NOT be used on the hot
    /// path per §4.6 (they force a store-side scan).
    pub async fn keys_by_type(&self, family_prefix: &str) -> Result<Vec<String>, TickstreamError> {
        self.store.scan_by_prefix(&format!("{family_prefix}:")).await
    }

    pub async fn delete_keys(&self, keys: &[String]) -> Result<(), TickstreamError> {
        for key in keys {
            self.store.delete(key).await?;
        }
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), TickstreamError> {
        self.store.ping().await
    }
}

fn spawn_write_behind_worker(
    store: std::sync::Arc<dyn KeyValueStore>,
    stats: std::sync::Arc<CacheStats>,
    batch_size: usize,
    batch_timeout: Duration,
) -> mpsc::Sender<WriteBehindOp> {
    let (tx, mut rx) = mpsc::channel::<WriteBehindOp>(1024);
    tokio::spawn(async move {
        let mut batch = Vec::with_capacity(batch_size);
        loop {
            let deadline = tokio::time::sleep(batch_timeout);
            tokio::pin!(deadline);
            tokio::select! {
                maybe_op = rx.recv() => {
                    match maybe_op {
                        Some(op) => {
                            batch.push(op);
                            if batch.len() >= batch_size {
                                flush_batch(&store, &mut batch).await;
                            }
                        }
                        None => {
                            flush_batch(&store, &mut batch).await;
                            break;
                        }
                    }
                }
                _ = &mut deadline => {
                    if !batch.is_empty() {
                        flush_batch(&store, &mut batch).await;
                    }
                }
            }
        }
        let _ = stats; // stats recorded at enqueue time (drops), not here
    });
    tx
}

async fn flush_batch(store: &std::sync::Arc<dyn KeyValueStore>, batch: &mut Vec<WriteBehindOp>) {
    let items: Vec<(String, String, Duration)> = batch
        .drain(..)
        .map(|op| match op {
            WriteBehindOp::Set { key, value, ttl } => (key, value, ttl),
        })
        .collect();
    if let Err(e) = store.mset(&items).await {
        warn!(error = %e, "write-behind batch flush failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    fn sample_tick() -> Tick {
        Tick {
            symbol: "BTCUSDT".into(),
            price: 50_000.0,
            bid: None,
            ask: None,
            volume: 1.0,
            timestamp: chrono::Utc::now(),
            source: "binance".into(),
            latency: StdDuration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn write_through_round_trip() {
        let store = Arc::new(InMemoryStore::default());
        let cache = Cache::new(store, CacheConfig::default());
        let tick = sample_tick();
        cache.set_price(&tick).await.unwrap();
        let fetched = cache.get_price("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(fetched.price, tick.price);
        let (hits, misses, _) = cache.stats();
        assert_eq!(hits, 1);
        assert_eq!(misses, 0);
    }

    #[tokio::test]
    async fn missing_key_returns_none_and_counts_miss() {
        let store = Arc::new(InMemoryStore::default());
        let cache = Cache::new(store, CacheConfig::default());
        let fetched = cache.get_price("UNKNOWN").await.unwrap();
        assert!(fetched.is_none());
        let (_, misses, _) = cache.stats();
        assert_eq!(misses, 1);
    }

    #[tokio::test]
    async fn keys_by_type_uses_prefix_scan() {
        let store = Arc::new(InMemoryStore::default());
        let cache = Cache::new(store, CacheConfig::default());
        cache.set_price(&sample_tick()).await.unwrap();
        let keys = cache.keys_by_type("price").await.unwrap();
        assert_eq!(keys, vec!["price:BTCUSDT".to_string()]);
    }
}
