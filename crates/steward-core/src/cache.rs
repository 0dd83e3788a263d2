// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Size-bounded, age-limited cache for resolved artifacts.
//!
//! Values are stored as gzip-compressed JSON. The total compressed size never
//! exceeds `max_size_bytes` after a `put`: the oldest entries are evicted
//! first. Entries older than `outdated_duration` are dropped by a sweep that
//! piggybacks on `put` once per `sweep_interval`.
//!
//! Nothing relies on a hit; a miss only costs a fresh resolution.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Default size budget (100 MB).
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 100_000_000;
/// Default entry lifetime (24 hours).
pub const DEFAULT_OUTDATED_DURATION: Duration = Duration::from_secs(24 * 3600);
/// Default time between age sweeps (1 hour).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Cache limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_size_bytes: u64,
    pub outdated_duration: Duration,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            outdated_duration: DEFAULT_OUTDATED_DURATION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Cache errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CacheError {
    #[error("failed to serialize cache value: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize cache value: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("failed to compress cache value: {0}")]
    Compress(#[source] std::io::Error),

    #[error("failed to decompress cache value: {0}")]
    Decompress(#[source] std::io::Error),
}

/// Snapshot of the cache counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: u64,
    pub max_size_bytes: u64,
    pub outdated_duration: Duration,
    pub last_sweep: DateTime<Utc>,
}

#[derive(Debug)]
struct CacheEntry {
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    current_size: u64,
    max_size_bytes: u64,
    outdated_duration: Duration,
    last_sweep: DateTime<Utc>,
}

impl CacheState {
    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.current_size -= entry.payload.len() as u64;
        }
    }

    fn evict_to_budget(&mut self) {
        while self.current_size > self.max_size_bytes {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.timestamp)
                .map(|(key, _)| key.clone());
            let Some(key) = oldest else {
                break;
            };
            debug!(key = %key, "Evicting cache entry over size budget");
            self.remove(&key);
        }
    }

    fn remove_outdated(&mut self, now: DateTime<Utc>) {
        let outdated: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                (now - entry.timestamp).to_std().unwrap_or(Duration::ZERO) > self.outdated_duration
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &outdated {
            self.remove(key);
        }
        if !outdated.is_empty() {
            debug!(removed = outdated.len(), "Removed outdated cache entries");
        }
        self.last_sweep = now;
    }
}

/// Thread-safe bounded cache; share it as `Arc<BoundedCache>`.
#[derive(Debug)]
pub struct BoundedCache {
    state: RwLock<CacheState>,
    sweep_interval: Duration,
}

impl BoundedCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            state: RwLock::new(CacheState {
                entries: HashMap::new(),
                current_size: 0,
                max_size_bytes: config.max_size_bytes,
                outdated_duration: config.outdated_duration,
                last_sweep: Utc::now(),
            }),
            sweep_interval: config.sweep_interval,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up `key`; a miss is `Ok(None)`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let payload = match self.read().entries.get(key) {
            Some(entry) => entry.payload.clone(),
            None => return Ok(None),
        };
        decode(&payload).map(Some)
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.put_at(key, value, Utc::now())
    }

    fn put_at<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        now: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let payload = encode(value)?;
        let size = payload.len() as u64;

        let mut state = self.write();
        state.remove(key);
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                payload,
                timestamp: now,
            },
        );
        state.current_size += size;
        state.evict_to_budget();

        let since_sweep = (now - state.last_sweep).to_std().unwrap_or(Duration::ZERO);
        if since_sweep >= self.sweep_interval {
            state.remove_outdated(now);
        }
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().entries.contains_key(key)
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.entries.clear();
        state.current_size = 0;
        state.last_sweep = Utc::now();
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.read();
        CacheStats {
            entries: state.entries.len(),
            size_bytes: state.current_size,
            max_size_bytes: state.max_size_bytes,
            outdated_duration: state.outdated_duration,
            last_sweep: state.last_sweep,
        }
    }

    /// Change the size budget, evicting at once if the cache is now over it.
    pub fn set_max_size_bytes(&self, max_size_bytes: u64) {
        let mut state = self.write();
        state.max_size_bytes = max_size_bytes;
        state.evict_to_budget();
    }

    /// Change the entry lifetime; applied by the next sweep.
    pub fn set_outdated_duration(&self, outdated_duration: Duration) {
        self.write().outdated_duration = outdated_duration;
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CacheError> {
    let json = serde_json::to_vec(value).map_err(CacheError::Serialize)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(CacheError::Compress)?;
    encoder.finish().map_err(CacheError::Compress)
}

fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CacheError> {
    let mut json = Vec::new();
    GzDecoder::new(payload)
        .read_to_end(&mut json)
        .map_err(CacheError::Decompress)?;
    serde_json::from_slice(&json).map_err(CacheError::Deserialize)
}

/// Hex SHA-256 of the JSON form of `request`.
pub fn cache_key<T: Serialize>(request: &T) -> Result<String, CacheError> {
    let bytes = serde_json::to_vec(request).map_err(CacheError::Serialize)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}
