//! Detection of the Compute Engine environment.
//!
//! Detection is a race between independent [`Probe`]s bounded by a timeout.
//! Every failure counts as a negative signal, so the outcome is a plain
//! `bool`.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, USER_AGENT};
use reqwest::{Client, Method, Request};
use tokio::task::JoinSet;
use url::Url;

use crate::client::{env_host, METADATA_FLAVOR_HEADER, METADATA_FLAVOR_VALUE, METADATA_IP};
use crate::error::MetadataError;
use crate::transport::Transport;

/// Upper bound for a whole detection attempt.
pub const DETECTION_TIMEOUT: Duration = Duration::from_secs(2);

/// DNS name of the metadata server.
pub const METADATA_HOST_NAME: &str = "metadata.google.internal.";

/// DMI product name file read by [`ProductNameProbe`].
pub const PRODUCT_NAME_PATH: &str = "/sys/class/dmi/id/product_name";

const METADATA_ADDR: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// A single environment signal.
#[async_trait]
pub trait Probe: fmt::Debug + Send + Sync {
    /// Returns true when the signal indicates Compute Engine.
    async fn probe(&self) -> bool;
}

/// Checks that the link-local metadata server answers with
/// `Metadata-Flavor: Google`.
#[derive(Debug)]
pub struct MetadataServerProbe {
    transport: Arc<dyn Transport>,
    url: Url,
}

impl MetadataServerProbe {
    /// Probe the link-local server through `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self, MetadataError> {
        let raw = format!("http://{METADATA_IP}");
        let url = Url::parse(&raw).map_err(|source| MetadataError::InvalidUrl { url: raw, source })?;
        Ok(Self::with_url(transport, url))
    }

    /// Probe `url` instead of the link-local server.
    pub fn with_url(transport: Arc<dyn Transport>, url: Url) -> Self {
        Self { transport, url }
    }

    /// Probe through a reqwest client that gives up after
    /// [`DETECTION_TIMEOUT`].
    pub fn http() -> Result<Self, MetadataError> {
        let client = Client::builder().timeout(DETECTION_TIMEOUT).build()?;
        Self::new(Arc::new(client))
    }
}

#[async_trait]
impl Probe for MetadataServerProbe {
    async fn probe(&self) -> bool {
        let mut request = Request::new(Method::GET, self.url.clone());
        request.headers_mut().insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("gce-metadata/", env!("CARGO_PKG_VERSION"))),
        );
        match self.transport.round_trip(request).await {
            Ok(response) => response
                .headers()
                .get(METADATA_FLAVOR_HEADER)
                .is_some_and(|v| v == METADATA_FLAVOR_VALUE),
            Err(e) => {
                tracing::debug!(error = %e, "metadata server probe failed");
                false
            }
        }
    }
}

/// Resolves the metadata host name and checks it maps to the metadata IP.
///
/// The lookup runs on tokio's blocking pool through the system resolver.
/// Abandoning the probe does not stop that thread, so a runtime shut down
/// with the default settings waits for the resolver's own timeout.
#[derive(Debug, Clone)]
pub struct DnsProbe {
    host: String,
    expected: IpAddr,
}

impl DnsProbe {
    /// Probe that expects `host` to resolve to `expected`.
    pub fn new(host: impl Into<String>, expected: IpAddr) -> Self {
        Self {
            host: host.into(),
            expected,
        }
    }
}

impl Default for DnsProbe {
    fn default() -> Self {
        Self::new(METADATA_HOST_NAME, IpAddr::V4(METADATA_ADDR))
    }
}

#[async_trait]
impl Probe for DnsProbe {
    async fn probe(&self) -> bool {
        match tokio::net::lookup_host((self.host.as_str(), 80)).await {
            Ok(mut addrs) => addrs.any(|addr| addr.ip() == self.expected),
            Err(e) => {
                tracing::debug!(error = %e, host = %self.host, "dns probe failed");
                false
            }
        }
    }
}

/// Reads the DMI product name, which Compute Engine VMs report as
/// `Google` or `Google Compute Engine`.
#[derive(Debug, Clone)]
pub struct ProductNameProbe {
    path: PathBuf,
}

impl ProductNameProbe {
    /// Probe that reads the product name from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProductNameProbe {
    fn default() -> Self {
        Self::new(PRODUCT_NAME_PATH)
    }
}

#[async_trait]
impl Probe for ProductNameProbe {
    async fn probe(&self) -> bool {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(name) => matches!(name.trim(), "Google" | "Google Compute Engine"),
            Err(_) => false,
        }
    }
}

/// Combines probes into a single detection attempt.
///
/// The `GCE_METADATA_HOST` override short-circuits to `true`. Otherwise all
/// probes run concurrently. Without a positive hint the first probe to
/// finish decides; with one, every probe gets the chance to answer
/// positively. Nothing is awaited past the timeout.
#[derive(Debug, Clone)]
pub struct Detector {
    probes: Vec<Arc<dyn Probe>>,
    hint: Option<Arc<dyn Probe>>,
    timeout: Duration,
}

impl Detector {
    /// A detector with no probes; only the environment override can make it
    /// succeed.
    pub fn new() -> Self {
        Self {
            probes: Vec::new(),
            hint: None,
            timeout: DETECTION_TIMEOUT,
        }
    }

    /// The metadata server, DNS and product name checks used by
    /// [`on_gce`](crate::on_gce).
    pub fn gce() -> Self {
        let detector = Self::new()
            .with_probe(DnsProbe::default())
            .with_hint(ProductNameProbe::default());
        match MetadataServerProbe::http() {
            Ok(probe) => detector.with_probe(probe),
            Err(e) => {
                tracing::warn!(error = %e, "metadata server probe unavailable");
                detector
            }
        }
    }

    /// Add a probe to the race.
    pub fn with_probe(mut self, probe: impl Probe + 'static) -> Self {
        self.probes.push(Arc::new(probe));
        self
    }

    /// Set the local signal that decides whether to wait for every probe.
    pub fn with_hint(mut self, hint: impl Probe + 'static) -> Self {
        self.hint = Some(Arc::new(hint));
        self
    }

    /// Bound the whole attempt by `timeout` instead of [`DETECTION_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one detection attempt.
    pub async fn detect(&self) -> bool {
        if let Some(host) = env_host() {
            tracing::debug!(%host, "metadata host overridden, assuming compute engine");
            return true;
        }

        let mut probes = JoinSet::new();
        for probe in &self.probes {
            let probe = Arc::clone(probe);
            probes.spawn(async move { probe.probe().await });
        }

        let outcome = tokio::time::timeout(self.timeout, async {
            let try_harder = match &self.hint {
                Some(hint) => hint.probe().await,
                None => false,
            };
            while let Some(result) = probes.join_next().await {
                let found = result.unwrap_or(false);
                if found || !try_harder {
                    return found;
                }
            }
            false
        })
        .await
        .unwrap_or(false);

        tracing::debug!(on_gce = outcome, "environment detection finished");
        outcome
    }
}

impl Default for Detector {
    fn default() -> Self {
        Self::gce()
    }
}

/// Outcome of environment detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectionState {
    /// Detection has not run yet.
    Unknown,
    OnGce,
    NotOnGce,
}

impl DetectionState {
    /// The cached answer, if detection already ran.
    pub fn resolved(self) -> Option<bool> {
        match self {
            DetectionState::Unknown => None,
            DetectionState::OnGce => Some(true),
            DetectionState::NotOnGce => Some(false),
        }
    }
}

impl fmt::Display for DetectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionState::Unknown => write!(f, "unknown"),
            DetectionState::OnGce => write!(f, "on-gce"),
            DetectionState::NotOnGce => write!(f, "not-on-gce"),
        }
    }
}

const UNKNOWN: u8 = 0;
const ON_GCE: u8 = 1;
const NOT_ON_GCE: u8 = 2;

/// Compute-once cache for the detection result.
///
/// Readers take the atomic fast path once resolved. The first callers
/// serialize on `guard`, so only one detection runs and all of them see its
/// result.
#[derive(Debug)]
pub(crate) struct DetectionCache {
    state: AtomicU8,
    guard: tokio::sync::Mutex<()>,
}

impl DetectionCache {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNKNOWN),
            guard: tokio::sync::Mutex::const_new(()),
        }
    }

    pub(crate) fn state(&self) -> DetectionState {
        match self.state.load(Ordering::Acquire) {
            ON_GCE => DetectionState::OnGce,
            NOT_ON_GCE => DetectionState::NotOnGce,
            _ => DetectionState::Unknown,
        }
    }

    pub(crate) async fn get_or_detect<F, Fut>(&self, detect: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = bool>,
    {
        if let Some(found) = self.state().resolved() {
            return found;
        }
        let _guard = self.guard.lock().await;
        if let Some(found) = self.state().resolved() {
            return found;
        }
        let found = detect().await;
        let state = if found { ON_GCE } else { NOT_ON_GCE };
        self.state.store(state, Ordering::Release);
        found
    }

    /// Forget the cached result.
    #[cfg(test)]
    pub(crate) fn reset(&self) {
        self.state.store(UNKNOWN, Ordering::Release);
    }
}
