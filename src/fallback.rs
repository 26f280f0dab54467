use serde::{Deserialize, Serialize};

use crate::cache::GeocodeResult;
use crate::config::{AppConfig, Bounds};
use crate::normalizer::NormalizedLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Geocoded,
    FallbackRawCoordinates,
    FallbackDefault,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Geocoded => "geocoded",
            Provenance::FallbackRawCoordinates => "fallback-raw-coordinates",
            Provenance::FallbackDefault => "fallback-default",
        }
    }

    pub fn is_approximate(&self) -> bool {
        !matches!(self, Provenance::Geocoded)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackResolver {
    bounds: Bounds,
    default_centroid: GeocodeResult,
}

impl FallbackResolver {
    pub fn new(bounds: Bounds, default_centroid: GeocodeResult) -> Self {
        Self {
            bounds,
            default_centroid,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let (lat, lng) = config.default_centroid;
        Self::new(config.bounds, GeocodeResult::new(lat, lng))
    }

    pub fn default_centroid(&self) -> GeocodeResult {
        self.default_centroid
    }

    pub fn resolve(
        &self,
        record: &NormalizedLocation,
        geocoded: Option<GeocodeResult>,
    ) -> (GeocodeResult, Provenance) {
        if let Some(result) = geocoded {
            return (result, Provenance::Geocoded);
        }
        if let Some(result) = record.raw_coordinates.and_then(|pair| self.plausible(pair)) {
            return (result, Provenance::FallbackRawCoordinates);
        }
        (self.default_centroid, Provenance::FallbackDefault)
    }

    /// Reads an X/Y pair as (lng, lat) when X sits in the longitude band,
    /// otherwise tries the swapped order. Grid references fall outside both.
    fn plausible(&self, (x, y): (f64, f64)) -> Option<GeocodeResult> {
        if self.bounds.contains(y, x) {
            Some(GeocodeResult::new(y, x))
        } else if self.bounds.contains(x, y) {
            Some(GeocodeResult::new(x, y))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(raw_coordinates: Option<(f64, f64)>) -> NormalizedLocation {
        NormalizedLocation {
            id: "UK1".into(),
            name: "Test".into(),
            address: String::new(),
            primary_category: "Other".into(),
            categories: Vec::new(),
            facility_types: Vec::new(),
            authority: None,
            country: None,
            postcode: None,
            raw_coordinates,
        }
    }

    fn resolver() -> FallbackResolver {
        FallbackResolver::from_config(&AppConfig::default())
    }

    #[test]
    fn prefers_geocoded_result() {
        let geocoded = GeocodeResult::new(52.0, -1.0);
        let (result, provenance) =
            resolver().resolve(&location(Some((-2.0, 53.0))), Some(geocoded));
        assert_eq!(result, geocoded);
        assert_eq!(provenance, Provenance::Geocoded);
    }

    #[test]
    fn reads_raw_pair_in_either_order() {
        let (result, provenance) = resolver().resolve(&location(Some((-1.5, 53.8))), None);
        assert_eq!(result, GeocodeResult::new(53.8, -1.5));
        assert_eq!(provenance, Provenance::FallbackRawCoordinates);

        let (swapped, _) = resolver().resolve(&location(Some((53.8, -1.5))), None);
        assert_eq!(swapped, GeocodeResult::new(53.8, -1.5));
    }

    #[test]
    fn grid_references_and_missing_pairs_use_default_centroid() {
        let resolver = resolver();
        for raw in [Some((429_157.0, 433_986.0)), None] {
            let (result, provenance) = resolver.resolve(&location(raw), None);
            assert_eq!(result, GeocodeResult::new(54.7023545, -3.2765753));
            assert_eq!(provenance, Provenance::FallbackDefault);
            assert!(provenance.is_approximate());
        }
    }

    #[test]
    fn provenance_serializes_as_tag() {
        assert_eq!(
            serde_json::to_string(&Provenance::FallbackRawCoordinates).unwrap(),
            "\"fallback-raw-coordinates\""
        );
        assert_eq!(Provenance::FallbackDefault.as_str(), "fallback-default");
    }
}
