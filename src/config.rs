use std::{env, io};

use serde::Serialize;
use tracing::debug;

const DEFAULT_GEOCODER_BASE_URL: &str = "https://api.postcodes.io";
pub const MAX_GEOCODE_CHUNK_SIZE: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lng..=self.max_lng).contains(&lng)
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_base_url: String,
    pub geocode_chunk_size: usize,
    pub geocode_concurrency: usize,
    pub geocode_rate_limit_qps: u32,
    pub geocode_max_attempts: u32,
    pub geocode_timeout_ms: u64,
    pub processing_batch_size: usize,
    pub yield_between_batches: bool,
    pub default_centroid: (f64, f64),
    pub bounds: Bounds,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub geocoder_base_url: String,
    pub geocode_chunk_size: usize,
    pub geocode_concurrency: usize,
    pub geocode_rate_limit_qps: u32,
    pub geocode_max_attempts: u32,
    pub processing_batch_size: usize,
    pub default_centroid: (f64, f64),
    pub bounds: Bounds,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            geocoder_base_url: DEFAULT_GEOCODER_BASE_URL.to_string(),
            geocode_chunk_size: MAX_GEOCODE_CHUNK_SIZE,
            geocode_concurrency: 4,
            geocode_rate_limit_qps: 10,
            geocode_max_attempts: 3,
            geocode_timeout_ms: 10_000,
            processing_batch_size: 50,
            yield_between_batches: true,
            default_centroid: (54.7023545, -3.2765753),
            bounds: Bounds {
                min_lat: 49.8,
                max_lat: 60.9,
                min_lng: -8.7,
                max_lng: 1.8,
            },
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let defaults = Self::default();
        Self {
            geocoder_base_url: env::var("GEOCODER_BASE_URL")
                .ok()
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.geocoder_base_url),
            geocode_chunk_size: parse_usize("GEOCODE_CHUNK_SIZE", defaults.geocode_chunk_size)
                .clamp(1, MAX_GEOCODE_CHUNK_SIZE),
            geocode_concurrency: parse_usize("GEOCODE_CONCURRENCY", defaults.geocode_concurrency)
                .max(1),
            geocode_rate_limit_qps: parse_u32(
                "GEOCODE_RATE_LIMIT_QPS",
                defaults.geocode_rate_limit_qps,
            ),
            geocode_max_attempts: parse_u32("GEOCODE_MAX_ATTEMPTS", defaults.geocode_max_attempts)
                .max(1),
            geocode_timeout_ms: parse_u64("GEOCODE_TIMEOUT_MS", defaults.geocode_timeout_ms),
            processing_batch_size: parse_usize(
                "PROCESSING_BATCH_SIZE",
                defaults.processing_batch_size,
            )
            .max(1),
            yield_between_batches: parse_bool(
                "YIELD_BETWEEN_BATCHES",
                defaults.yield_between_batches,
            ),
            default_centroid: (
                parse_f64("DEFAULT_CENTROID_LAT", defaults.default_centroid.0),
                parse_f64("DEFAULT_CENTROID_LNG", defaults.default_centroid.1),
            ),
            bounds: Bounds {
                min_lat: parse_f64("BOUNDS_MIN_LAT", defaults.bounds.min_lat),
                max_lat: parse_f64("BOUNDS_MAX_LAT", defaults.bounds.max_lat),
                min_lng: parse_f64("BOUNDS_MIN_LNG", defaults.bounds.min_lng),
                max_lng: parse_f64("BOUNDS_MAX_LNG", defaults.bounds.max_lng),
            },
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            geocoder_base_url: self.geocoder_base_url.clone(),
            geocode_chunk_size: self.geocode_chunk_size,
            geocode_concurrency: self.geocode_concurrency,
            geocode_rate_limit_qps: self.geocode_rate_limit_qps,
            geocode_max_attempts: self.geocode_max_attempts,
            processing_batch_size: self.processing_batch_size,
            default_centroid: self.default_centroid,
            bounds: self.bounds,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_env_overrides_into_safe_ranges() {
        env::set_var("GEOCODE_CHUNK_SIZE", "250");
        env::set_var("GEOCODE_CONCURRENCY", "0");
        env::set_var("PROCESSING_BATCH_SIZE", "0");
        env::set_var("GEOCODER_BASE_URL", "http://localhost:8000/");
        env::set_var("BOUNDS_MAX_LAT", "not-a-number");

        let config = AppConfig::from_env();
        let public = config.public_profile();

        assert_eq!(public.geocode_chunk_size, MAX_GEOCODE_CHUNK_SIZE);
        assert_eq!(public.geocode_concurrency, 1);
        assert_eq!(public.processing_batch_size, 1);
        assert_eq!(public.geocoder_base_url, "http://localhost:8000");
        assert_eq!(public.bounds.max_lat, AppConfig::default().bounds.max_lat);
    }

    #[test]
    fn default_bounds_cover_the_default_centroid() {
        let config = AppConfig::default();
        let (lat, lng) = config.default_centroid;
        assert!(config.bounds.contains(lat, lng));
        assert!(!config.bounds.contains(lng, lat));
    }
}
