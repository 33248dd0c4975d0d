//! Minimal async client for the Google Compute Engine metadata server.
//!
//! # Features
//!
//! - Detect whether the process runs on Compute Engine, once per process
//! - Fetch metadata entries with the required `Metadata-Flavor` header
//! - Redirect requests with the `GCE_METADATA_HOST` environment variable
//! - Plug in any HTTP [`Transport`], e.g. to override the `User-Agent`
//!
//! # Example
//!
//! ```ignore
//! use gce_metadata::{MetadataClient, MetadataError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), MetadataError> {
//!     if !gce_metadata::on_gce().await {
//!         return Ok(());
//!     }
//!
//!     // Process-wide client
//!     let zone = gce_metadata::get("instance/zone").await?;
//!
//!     // Or an explicit one
//!     let client = MetadataClient::http()?;
//!     let project = client.project_id().await?;
//!
//!     println!("{project} {zone}");
//!     Ok(())
//! }
//! ```

mod client;
mod detect;
mod error;
mod global;
mod metadata;
mod transport;

pub use client::{MetadataClient, METADATA_HOST_ENV, METADATA_IP};
pub use detect::{
    DetectionState, Detector, DnsProbe, MetadataServerProbe, Probe, ProductNameProbe,
    DETECTION_TIMEOUT,
};
pub use error::{BoxError, MetadataError};
pub use global::{
    detection_state, get, on_gce, reset_to_default_http_client, set_http_client, shared_client,
};
pub use metadata::FAILED_SUBSCRIBE_SLEEP;
pub use transport::{default_http_client, Transport, UserAgent};
