//! Upstream data-builder client and response classification.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use gridharvest_shared::{HarvestError, ResourceKind, Result, UpstreamConfig, WorkItem};

/// User-Agent string for upstream requests.
const USER_AGENT: &str = concat!("GridHarvest/", env!("CARGO_PKG_VERSION"));

/// Result of one upstream request after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// 2xx with the response body.
    Success(Vec<u8>),
    /// Worth retrying: timeouts, connection resets, 429 and 5xx.
    Transient(String),
    /// Retrying cannot help: other 4xx or a request that cannot be built.
    Fatal(String),
}

/// Map an HTTP status and body to an outcome.
pub fn classify_response(status: StatusCode, body: Vec<u8>) -> FetchOutcome {
    if status.is_success() {
        FetchOutcome::Success(body)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        FetchOutcome::Transient(format!("HTTP {status}"))
    } else {
        let snippet: String = String::from_utf8_lossy(&body).chars().take(200).collect();
        FetchOutcome::Fatal(format!("HTTP {status}: {}", snippet.trim()))
    }
}

fn classify_transport_error(err: &reqwest::Error) -> FetchOutcome {
    if err.is_builder() {
        FetchOutcome::Fatal(format!("malformed request: {err}"))
    } else {
        FetchOutcome::Transient(err.to_string())
    }
}

/// Source of payloads for work items.
pub trait Upstream: Send + Sync + 'static {
    /// Issue one request for `item`. Never retries.
    fn fetch(&self, item: &WorkItem) -> impl Future<Output = FetchOutcome> + Send;
}

// ---------------------------------------------------------------------------
// HttpUpstream
// ---------------------------------------------------------------------------

/// The data-builder REST API over HTTPS.
pub struct HttpUpstream {
    client: Client,
    base_url: Url,
    api_key: String,
    api_key_header: String,
    data_version: u32,
    area: String,
    site_forest_category: String,
    species_forest_category: String,
}

impl fmt::Debug for HttpUpstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpUpstream")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"<redacted>")
            .field("data_version", &self.data_version)
            .finish_non_exhaustive()
    }
}

impl HttpUpstream {
    /// Build a client for `config`. `api_key` is sent on every request and
    /// never logged.
    pub fn new(config: &UpstreamConfig, api_key: impl Into<String>) -> Result<Self> {
        let base_url = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            HarvestError::config(format!("invalid upstream.base_url '{}': {e}", config.base_url))
        })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| HarvestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            api_key: api_key.into(),
            api_key_header: config.api_key_header.clone(),
            data_version: config.data_version,
            area: config.area.clone(),
            site_forest_category: config.site_forest_category.clone(),
            species_forest_category: config.species_forest_category.clone(),
        })
    }

    /// Full request URL for `item`, query string included.
    pub fn request_url(&self, item: &WorkItem) -> Result<Url> {
        let endpoint = match item.kind {
            ResourceKind::SiteInfo => "siteinfo",
            ResourceKind::Species { .. } => "species",
            ResourceKind::Regimes { .. } => "regimes",
        };
        let raw = format!(
            "{}/{}/data-builder/{endpoint}",
            self.base_url.as_str().trim_end_matches('/'),
            self.data_version
        );
        let mut url = Url::parse(&raw)
            .map_err(|e| HarvestError::config(format!("invalid endpoint URL '{raw}': {e}")))?;

        let version = self.data_version.to_string();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("latitude", &item.coordinate.y_str());
            q.append_pair("longitude", &item.coordinate.x_str());
            match item.kind {
                ResourceKind::SiteInfo => {
                    q.append_pair("area", &self.area);
                    q.append_pair("plotT", "CompF");
                    q.append_pair("frCat", &self.site_forest_category);
                    q.append_pair("incGrowth", "false");
                    q.append_pair("version", &version);
                }
                ResourceKind::Species { spec_id } => {
                    q.append_pair("area", &self.area);
                    q.append_pair("frCat", &self.species_forest_category);
                    q.append_pair("specId", &spec_id.to_string());
                    q.append_pair("version", &version);
                }
                ResourceKind::Regimes { spec_id } => {
                    q.append_pair("specId", &spec_id.to_string());
                    q.append_pair("frCat", &self.site_forest_category);
                }
            }
        }
        Ok(url)
    }
}

impl Upstream for HttpUpstream {
    #[instrument(skip_all, fields(item = %item))]
    async fn fetch(&self, item: &WorkItem) -> FetchOutcome {
        let url = match self.request_url(item) {
            Ok(url) => url,
            Err(e) => return FetchOutcome::Fatal(e.to_string()),
        };

        let response = match self
            .client
            .get(url)
            .header(self.api_key_header.as_str(), self.api_key.as_str())
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return classify_transport_error(&e),
        };

        let status = response.status();
        let body = match response.bytes().await {
            Ok(b) => b.to_vec(),
            Err(e) => return FetchOutcome::Transient(format!("failed to read body: {e}")),
        };

        debug!(status = status.as_u16(), bytes = body.len(), "upstream responded");
        classify_response(status, body)
    }
}
