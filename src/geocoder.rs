use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::cache::{normalize_postcode, GeocodeCache, GeocodeResult};
use crate::config::{AppConfig, MAX_GEOCODE_CHUNK_SIZE};
use crate::errors::AppResult;
use crate::postcodes::PostcodeService;

const BASE_BACKOFF_MS: u64 = 250;

#[derive(Debug, Clone, Copy)]
pub struct GeocoderOptions {
    pub chunk_size: usize,
    pub concurrency: usize,
    pub rate_limit_qps: u32,
    pub max_attempts: u32,
}

impl GeocoderOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            chunk_size: config.geocode_chunk_size,
            concurrency: config.geocode_concurrency,
            rate_limit_qps: config.geocode_rate_limit_qps,
            max_attempts: config.geocode_max_attempts,
        }
    }
}

impl Default for GeocoderOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GeocodeStats {
    pub requested: usize,
    pub distinct: usize,
    pub cache_hits: usize,
    pub network_calls: usize,
    pub resolved: usize,
    pub failed_chunks: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BatchResolution {
    /// Keyed by the caller's original postcode text.
    pub resolved: HashMap<String, GeocodeResult>,
    pub stats: GeocodeStats,
}

impl BatchResolution {
    pub fn get(&self, postcode: &str) -> Option<GeocodeResult> {
        self.resolved.get(postcode).copied()
    }
}

struct ChunkOutcome {
    calls: usize,
    resolved: Option<HashMap<String, GeocodeResult>>,
}

pub struct Geocoder {
    lookup: PostcodeService,
    cache: Arc<GeocodeCache>,
    rate_limiter: Option<RateLimiter>,
    options: GeocoderOptions,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl Geocoder {
    pub fn new(config: &AppConfig, cache: Arc<GeocodeCache>) -> AppResult<Self> {
        let lookup = PostcodeService::new(config)?;
        Ok(Self::with_lookup(
            lookup,
            cache,
            GeocoderOptions::from_config(config),
        ))
    }

    pub fn with_lookup(
        lookup: PostcodeService,
        cache: Arc<GeocodeCache>,
        options: GeocoderOptions,
    ) -> Self {
        let options = GeocoderOptions {
            chunk_size: options.chunk_size.clamp(1, MAX_GEOCODE_CHUNK_SIZE),
            concurrency: options.concurrency.max(1),
            max_attempts: options.max_attempts.max(1),
            ..options
        };
        let rate_limiter = (options.rate_limit_qps > 0).then(|| RateLimiter::new(options.rate_limit_qps));
        Self {
            lookup,
            cache,
            rate_limiter,
            options,
            jitter_rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    pub fn cache(&self) -> &Arc<GeocodeCache> {
        &self.cache
    }

    /// Single-postcode path used for warm-up and ad hoc lookups. Failures are
    /// logged and reported as absent.
    pub async fn resolve_one(&self, postcode: &str) -> Option<GeocodeResult> {
        let key = normalize_postcode(postcode);
        if key.is_empty() {
            return None;
        }
        if let Some(hit) = self.cache.get(&key) {
            trace!(postcode = %key, "geocode cache hit");
            return Some(hit);
        }

        if let Some(limiter) = &self.rate_limiter {
            limiter.wait().await;
        }
        match self.lookup.lookup_postcode(&key).await {
            Ok(Some(result)) => {
                self.cache.put(&key, result);
                Some(result)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(?err, postcode = %key, "single postcode lookup failed");
                None
            }
        }
    }

    pub async fn resolve_batch(
        &self,
        postcodes: &[String],
        cancel_flag: Option<&AtomicBool>,
    ) -> BatchResolution {
        let mut stats = GeocodeStats {
            requested: postcodes.len(),
            ..GeocodeStats::default()
        };

        let mut seen_originals = HashSet::new();
        let originals: Vec<(&str, String)> = postcodes
            .iter()
            .map(String::as_str)
            .filter(|text| seen_originals.insert(*text))
            .map(|text| (text, normalize_postcode(text)))
            .filter(|(_, key)| !key.is_empty())
            .collect();

        let mut by_key: HashMap<String, GeocodeResult> = HashMap::new();
        let mut pending = Vec::new();
        let mut pending_keys = HashSet::new();
        for (_, key) in &originals {
            if by_key.contains_key(key) || pending_keys.contains(key) {
                continue;
            }
            match self.cache.get(key) {
                Some(hit) => {
                    stats.cache_hits += 1;
                    by_key.insert(key.clone(), hit);
                }
                None => {
                    pending_keys.insert(key.clone());
                    pending.push(key.clone());
                }
            }
        }
        stats.distinct = by_key.len() + pending.len();

        let chunks: Vec<Vec<String>> = pending
            .chunks(self.options.chunk_size)
            .map(<[String]>::to_vec)
            .collect();
        debug!(
            distinct = stats.distinct,
            cache_hits = stats.cache_hits,
            chunks = chunks.len(),
            "resolving postcodes"
        );

        let outcomes: Vec<ChunkOutcome> = stream::iter(chunks.into_iter().enumerate())
            .map(|(index, chunk)| self.resolve_chunk(index, chunk, cancel_flag))
            .buffer_unordered(self.options.concurrency)
            .collect()
            .await;

        for outcome in outcomes {
            stats.network_calls += outcome.calls;
            match outcome.resolved {
                Some(found) => by_key.extend(found),
                None => stats.failed_chunks += 1,
            }
        }
        stats.resolved = by_key.len();

        let resolved = originals
            .into_iter()
            .filter_map(|(text, key)| by_key.get(&key).map(|result| (text.to_string(), *result)))
            .collect();
        BatchResolution { resolved, stats }
    }

    async fn resolve_chunk(
        &self,
        index: usize,
        chunk: Vec<String>,
        cancel_flag: Option<&AtomicBool>,
    ) -> ChunkOutcome {
        let mut calls = 0;
        loop {
            if let Some(limiter) = &self.rate_limiter {
                limiter.wait().await;
            }
            if is_cancelled(cancel_flag) {
                return ChunkOutcome {
                    calls,
                    resolved: None,
                };
            }

            calls += 1;
            match self.lookup.lookup_postcodes(&chunk).await {
                Ok(found) => {
                    if is_cancelled(cancel_flag) {
                        return ChunkOutcome {
                            calls,
                            resolved: None,
                        };
                    }
                    let requested: HashSet<&str> = chunk.iter().map(String::as_str).collect();
                    let found: HashMap<String, GeocodeResult> = found
                        .into_iter()
                        .filter(|(key, _)| requested.contains(key.as_str()))
                        .collect();
                    for (key, result) in &found {
                        self.cache.put(key, *result);
                    }
                    trace!(chunk = index, size = chunk.len(), matched = found.len(), "geocode chunk resolved");
                    return ChunkOutcome {
                        calls,
                        resolved: Some(found),
                    };
                }
                Err(err) if (calls as u32) < self.options.max_attempts => {
                    let delay = self.backoff_delay(calls as u32);
                    warn!(
                        ?err,
                        chunk = index,
                        attempt = calls,
                        "geocode chunk failed; retrying after {:?}",
                        delay
                    );
                    sleep(delay).await;
                }
                Err(err) => {
                    warn!(
                        ?err,
                        chunk = index,
                        size = chunk.len(),
                        "geocode chunk failed; leaving its postcodes unresolved"
                    );
                    return ChunkOutcome {
                        calls,
                        resolved: None,
                    };
                }
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = (attempt - 1).min(6);
        let base = Duration::from_millis(BASE_BACKOFF_MS * (1 << exponent));
        let jitter = {
            let mut rng = self.jitter_rng.lock();
            let jitter_ms = rng.gen_range(0..BASE_BACKOFF_MS);
            Duration::from_millis(jitter_ms)
        };
        base + jitter
    }
}

fn is_cancelled(flag: Option<&AtomicBool>) -> bool {
    flag.map(|flag| flag.load(Ordering::SeqCst)).unwrap_or(false)
}

/// Spaces request starts at least `1 / qps` apart, across concurrent chunks.
struct RateLimiter {
    min_interval: Duration,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        let interval_ms = (1000_f64 / qps.max(1) as f64).ceil() as u64;
        Self {
            min_interval: Duration::from_millis(interval_ms.max(1)),
            last_tick: AsyncMutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}
