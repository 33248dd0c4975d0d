//! Process-wide client and detection cache.
//!
//! These wrap a shared [`MetadataClient`] for callers that do not want to
//! carry one around. Swapping the transport is meant for tests; requests
//! already in flight keep the transport they started with.

use std::sync::{Arc, LazyLock, PoisonError, RwLock};

use crate::client::MetadataClient;
use crate::detect::{DetectionCache, DetectionState, Detector};
use crate::error::MetadataError;
use crate::transport::Transport;

static CLIENT: LazyLock<RwLock<MetadataClient>> =
    LazyLock::new(|| RwLock::new(MetadataClient::default()));

static ON_GCE: DetectionCache = DetectionCache::new();

/// Snapshot of the process-wide client.
pub fn shared_client() -> MetadataClient {
    CLIENT
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Route all subsequent process-wide requests through `transport`.
pub fn set_http_client(transport: impl Transport + 'static) {
    let mut client = CLIENT.write().unwrap_or_else(PoisonError::into_inner);
    *client = MetadataClient::from_shared(Arc::new(transport));
}

/// Restore the default reqwest transport.
pub fn reset_to_default_http_client() {
    let mut client = CLIENT.write().unwrap_or_else(PoisonError::into_inner);
    *client = MetadataClient::default();
}

/// Fetch `suffix` through the process-wide client.
///
/// See [`MetadataClient::get`].
pub async fn get(suffix: &str) -> Result<String, MetadataError> {
    shared_client().get(suffix).await
}

/// Whether this process runs on Compute Engine.
///
/// Detection runs once per process with [`Detector::gce`]; later calls
/// return the cached answer. Concurrent first callers wait for that single
/// attempt.
pub async fn on_gce() -> bool {
    ON_GCE.get_or_detect(|| async { Detector::gce().detect().await }).await
}

/// Cached detection outcome, without triggering detection.
pub fn detection_state() -> DetectionState {
    ON_GCE.state()
}

#[cfg(test)]
pub(crate) fn reset_on_gce() {
    ON_GCE.reset();
}
