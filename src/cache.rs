use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeocodeResult {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Builds a result only when both halves are present and finite.
    pub fn from_parts(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        match (latitude, longitude) {
            (Some(lat), Some(lng)) if lat.is_finite() && lng.is_finite() => {
                Some(Self::new(lat, lng))
            }
            _ => None,
        }
    }
}

/// Uppercased with all whitespace removed, e.g. `" sw1a 1aa"` -> `"SW1A1AA"`.
pub fn normalize_postcode(postcode: &str) -> String {
    postcode
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Process-wide postcode -> coordinate store. Entries are never evicted.
#[derive(Default)]
pub struct GeocodeCache {
    entries: RwLock<HashMap<String, GeocodeResult>>,
}

impl GeocodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, postcode: &str) -> Option<GeocodeResult> {
        let key = normalize_postcode(postcode);
        if key.is_empty() {
            return None;
        }
        self.entries.read().get(&key).copied()
    }

    pub fn put(&self, postcode: &str, result: GeocodeResult) {
        let key = normalize_postcode(postcode);
        if key.is_empty() {
            return;
        }
        self.entries.write().insert(key, result);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn collapses_textual_variants_onto_one_entry() {
        let cache = GeocodeCache::new();
        cache.put("sw1a 1aa", GeocodeResult::new(51.501, -0.141));

        assert_eq!(cache.get("SW1A1AA"), Some(GeocodeResult::new(51.501, -0.141)));
        assert_eq!(cache.get("  Sw1A\t1aA "), Some(GeocodeResult::new(51.501, -0.141)));
        assert_eq!(cache.len(), 1);
        assert!(cache.get("EC1A 1BB").is_none());
    }

    #[test]
    fn ignores_blank_keys() {
        let cache = GeocodeCache::new();
        cache.put("   ", GeocodeResult::new(1.0, 1.0));
        assert!(cache.is_empty());
        assert!(cache.get("").is_none());
    }

    #[test]
    fn repeated_writes_are_idempotent_across_threads() {
        let cache = Arc::new(GeocodeCache::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.put("NR12 8JX", GeocodeResult::new(52.63, 1.29)))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("nr128jx"), Some(GeocodeResult::new(52.63, 1.29)));
    }

    #[test]
    fn partial_coordinates_are_rejected() {
        assert!(GeocodeResult::from_parts(Some(51.0), None).is_none());
        assert!(GeocodeResult::from_parts(Some(f64::NAN), Some(0.0)).is_none());
        assert_eq!(
            GeocodeResult::from_parts(Some(51.0), Some(-1.0)),
            Some(GeocodeResult::new(51.0, -1.0))
        );
    }
}
