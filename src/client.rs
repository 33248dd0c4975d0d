//! Metadata client: host resolution, request construction and `get`.

use std::env;
use std::sync::Arc;

use reqwest::header::{HeaderValue, ETAG, USER_AGENT};
use reqwest::{Method, Request};
use url::Url;

use crate::error::MetadataError;
use crate::transport::{default_http_client, Transport};

/// Environment variable overriding the metadata host (`host` or `host:port`).
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

/// Link-local address of the metadata server.
pub const METADATA_IP: &str = "169.254.169.254";

/// Path prefix shared by all metadata entries.
const METADATA_PATH: &str = "/computeMetadata/v1/";

/// Required header for metadata requests.
pub(crate) const METADATA_FLAVOR_HEADER: &str = "metadata-flavor";

/// Required header value for metadata requests.
pub(crate) const METADATA_FLAVOR_VALUE: &str = "Google";

const DEFAULT_USER_AGENT: &str = concat!("gce-metadata/", env!("CARGO_PKG_VERSION"));

/// Host named by `GCE_METADATA_HOST`, if set to a non-empty value.
pub(crate) fn env_host() -> Option<String> {
    env::var(METADATA_HOST_ENV).ok().filter(|h| !h.is_empty())
}

/// Client for the metadata server.
///
/// The transport is shared, so clones are cheap and all use the same
/// connection pool.
///
/// # Example
///
/// ```ignore
/// use gce_metadata::MetadataClient;
///
/// #[tokio::main]
/// async fn main() -> Result<(), gce_metadata::MetadataError> {
///     let client = MetadataClient::http()?;
///     let zone = client.get("instance/zone").await?;
///     println!("{zone}");
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MetadataClient {
    transport: Arc<dyn Transport>,
    host: Option<String>,
}

impl MetadataClient {
    /// Create a client that sends every request through `transport`.
    pub fn new(transport: impl Transport + 'static) -> Self {
        Self::from_shared(Arc::new(transport))
    }

    /// Create a client from an already shared transport.
    pub fn from_shared(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            host: None,
        }
    }

    /// Create a client backed by the default reqwest transport.
    pub fn http() -> Result<Self, MetadataError> {
        Ok(Self::new(default_http_client()?))
    }

    /// Use `host` instead of the link-local default.
    ///
    /// `GCE_METADATA_HOST` still takes precedence when set.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Get the transport requests are sent through.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Resolve the host for the next request.
    ///
    /// Read on every call so that the environment can redirect an existing
    /// client.
    pub fn host(&self) -> String {
        env_host()
            .or_else(|| self.host.clone())
            .unwrap_or_else(|| METADATA_IP.to_string())
    }

    /// Build the URL for `suffix`. Leading slashes are ignored.
    pub fn url(&self, suffix: &str) -> Result<Url, MetadataError> {
        let raw = format!(
            "http://{}{}{}",
            self.host(),
            METADATA_PATH,
            suffix.trim_start_matches('/')
        );
        Url::parse(&raw).map_err(|source| MetadataError::InvalidUrl { url: raw, source })
    }

    fn request(&self, suffix: &str) -> Result<Request, MetadataError> {
        let mut request = Request::new(Method::GET, self.url(suffix)?);
        let headers = request.headers_mut();
        headers.insert(
            METADATA_FLAVOR_HEADER,
            HeaderValue::from_static(METADATA_FLAVOR_VALUE),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        Ok(request)
    }

    /// Fetch the value at `suffix`, e.g. `instance/zone` or
    /// `instance/service-accounts/default/identity?audience=...`.
    ///
    /// Trailing line terminators are removed from the body.
    ///
    /// # Errors
    ///
    /// Transport failures are returned as [`MetadataError::Transport`] with
    /// the original error inside. Non-success responses become
    /// [`MetadataError::Status`] carrying the status code and body.
    pub async fn get(&self, suffix: &str) -> Result<String, MetadataError> {
        self.get_with_etag(suffix).await.map(|(value, _)| value)
    }

    /// Like [`get`](Self::get), with surrounding whitespace removed.
    pub async fn get_trimmed(&self, suffix: &str) -> Result<String, MetadataError> {
        let value = self.get(suffix).await?;
        Ok(value.trim().to_string())
    }

    /// Fetch the value at `suffix` together with its `ETag` header.
    ///
    /// The etag is empty when the server did not send one.
    pub async fn get_with_etag(&self, suffix: &str) -> Result<(String, String), MetadataError> {
        let request = self.request(suffix)?;
        tracing::debug!(url = %request.url(), "metadata request");

        let response = self
            .transport
            .round_trip(request)
            .await
            .map_err(MetadataError::Transport)?;

        let status = response.status();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .bytes()
            .await
            .map_err(|e| MetadataError::Transport(e.into()))?;

        if !status.is_success() {
            tracing::debug!(status = status.as_u16(), suffix, "metadata request failed");
            return Err(MetadataError::Status {
                code: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let mut value = String::from_utf8(body.to_vec()).map_err(|_| MetadataError::Utf8)?;
        let len = value.trim_end_matches(['\r', '\n']).len();
        value.truncate(len);
        Ok((value, etag))
    }
}

impl Default for MetadataClient {
    fn default() -> Self {
        Self::http().expect("failed to create HTTP client")
    }
}
