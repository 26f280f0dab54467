use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cache::{normalize_postcode, GeocodeResult};
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

#[async_trait]
pub trait PostcodeLookup: Send + Sync {
    /// `Ok(None)` means the service answered and does not know the postcode.
    async fn lookup_postcode(&self, postcode: &str) -> AppResult<Option<GeocodeResult>>;

    /// Resolves a batch of normalized postcodes. Unmatched inputs are simply
    /// absent from the returned map, which is keyed by normalized postcode.
    async fn lookup_postcodes(
        &self,
        postcodes: &[String],
    ) -> AppResult<HashMap<String, GeocodeResult>>;
}

#[derive(Clone)]
pub struct PostcodeService {
    inner: Arc<dyn PostcodeLookup>,
}

impl PostcodeService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let client = HttpPostcodeClient::new(
            &config.geocoder_base_url,
            Duration::from_millis(config.geocode_timeout_ms),
        )?;
        Ok(Self {
            inner: Arc::new(client),
        })
    }

    pub fn from_lookup(lookup: Arc<dyn PostcodeLookup>) -> Self {
        Self { inner: lookup }
    }

    pub async fn lookup_postcode(&self, postcode: &str) -> AppResult<Option<GeocodeResult>> {
        self.inner.lookup_postcode(postcode).await
    }

    pub async fn lookup_postcodes(
        &self,
        postcodes: &[String],
    ) -> AppResult<HashMap<String, GeocodeResult>> {
        self.inner.lookup_postcodes(postcodes).await
    }
}

/// Client for a postcodes.io-compatible API.
pub struct HttpPostcodeClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpPostcodeClient {
    pub fn new(base_url: &str, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("foodchain-map/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        let base_url = Url::parse(base_url.trim())
            .map_err(|err| AppError::Config(format!("invalid geocoder base URL: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "geocoder base URL cannot carry a path: {base_url}"
            )));
        }
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[derive(Serialize)]
struct BulkRequest<'a> {
    postcodes: &'a [String],
}

#[derive(Deserialize)]
struct SingleResponse {
    status: u16,
    result: Option<PostcodeBody>,
}

#[derive(Deserialize)]
struct BulkResponse {
    status: u16,
    result: Option<Vec<BulkItem>>,
}

#[derive(Deserialize)]
struct BulkItem {
    query: String,
    result: Option<PostcodeBody>,
}

#[derive(Deserialize)]
struct PostcodeBody {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl PostcodeBody {
    fn coordinates(&self) -> Option<GeocodeResult> {
        GeocodeResult::from_parts(self.latitude, self.longitude)
    }
}

#[async_trait]
impl PostcodeLookup for HttpPostcodeClient {
    async fn lookup_postcode(&self, postcode: &str) -> AppResult<Option<GeocodeResult>> {
        let key = normalize_postcode(postcode);
        if key.is_empty() {
            return Ok(None);
        }

        let response = self
            .http
            .get(self.endpoint(&["postcodes", key.as_str()]))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            trace!(postcode = %key, "postcode not found");
            return Ok(None);
        }

        let parsed: SingleResponse = response.error_for_status()?.json().await?;
        if parsed.status != 200 {
            return Ok(None);
        }
        Ok(parsed.result.and_then(|body| body.coordinates()))
    }

    async fn lookup_postcodes(
        &self,
        postcodes: &[String],
    ) -> AppResult<HashMap<String, GeocodeResult>> {
        if postcodes.is_empty() {
            return Ok(HashMap::new());
        }

        let response = self
            .http
            .post(self.endpoint(&["postcodes"]))
            .json(&BulkRequest { postcodes })
            .send()
            .await?
            .error_for_status()?;

        let parsed: BulkResponse = response.json().await?;
        if parsed.status != 200 {
            return Err(AppError::Geocoding(format!(
                "bulk lookup answered with status {}",
                parsed.status
            )));
        }
        let items = parsed
            .result
            .ok_or_else(|| AppError::Geocoding("bulk lookup response missing result".into()))?;

        Ok(items
            .into_iter()
            .filter_map(|item| {
                let coordinates = item.result.as_ref()?.coordinates()?;
                Some((normalize_postcode(&item.query), coordinates))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_endpoints_under_base_path() {
        let client =
            HttpPostcodeClient::new("http://localhost:8000/api/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.endpoint(&["postcodes", "SW1A1AA"]).as_str(),
            "http://localhost:8000/api/postcodes/SW1A1AA"
        );

        let bare = HttpPostcodeClient::new("http://localhost:8000", Duration::from_secs(1)).unwrap();
        assert_eq!(
            bare.endpoint(&["postcodes"]).as_str(),
            "http://localhost:8000/postcodes"
        );
    }

    #[test]
    fn rejects_unusable_base_url() {
        assert!(matches!(
            HttpPostcodeClient::new("not a url", Duration::from_secs(1)),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            HttpPostcodeClient::new("mailto:ops@example.com", Duration::from_secs(1)),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn bulk_items_without_both_coordinates_are_unmatched() {
        let body: BulkResponse = serde_json::from_str(
            r#"{"status":200,"result":[
                {"query":"ab1 2cd","result":{"latitude":57.1,"longitude":-2.1}},
                {"query":"ZZ9 9ZZ","result":null},
                {"query":"GY1 1AA","result":{"latitude":null,"longitude":null}}
            ]}"#,
        )
        .unwrap();
        let matched: Vec<_> = body
            .result
            .unwrap()
            .into_iter()
            .filter_map(|item| item.result.as_ref().and_then(PostcodeBody::coordinates))
            .collect();
        assert_eq!(matched, vec![GeocodeResult::new(57.1, -2.1)]);
    }
}
