//! Typed accessors and change subscriptions on top of [`MetadataClient`].

use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::client::MetadataClient;
use crate::error::MetadataError;

/// Delay before a failed watch request is retried.
pub const FAILED_SUBSCRIBE_SLEEP: Duration = Duration::from_secs(5);

const DEFAULT_SERVICE_ACCOUNT: &str = "default";

fn service_account(name: &str) -> &str {
    if name.is_empty() {
        DEFAULT_SERVICE_ACCOUNT
    } else {
        name
    }
}

/// Last path segment of a fully qualified zone such as
/// `projects/123/zones/us-central1-a`.
fn short_zone(zone: &str) -> &str {
    zone.rsplit_once('/').map_or(zone, |(_, z)| z)
}

/// Split a newline separated listing, dropping blank entries.
fn lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn watch_suffix(suffix: &str) -> String {
    let separator = if suffix.contains('?') { '&' } else { '?' };
    format!("{suffix}{separator}wait_for_change=true&last_etag=")
}

impl MetadataClient {
    /// Project ID of the current instance.
    pub async fn project_id(&self) -> Result<String, MetadataError> {
        self.get_trimmed("project/project-id").await
    }

    /// Numeric project ID of the current instance.
    pub async fn numeric_project_id(&self) -> Result<String, MetadataError> {
        self.get_trimmed("project/numeric-project-id").await
    }

    /// Instance ID of the current VM.
    pub async fn instance_id(&self) -> Result<String, MetadataError> {
        self.get_trimmed("instance/id").await
    }

    /// Name of the current VM.
    pub async fn instance_name(&self) -> Result<String, MetadataError> {
        self.get_trimmed("instance/name").await
    }

    /// Fully qualified hostname of the current VM.
    pub async fn hostname(&self) -> Result<String, MetadataError> {
        self.get_trimmed("instance/hostname").await
    }

    /// Internal IP of the first network interface.
    pub async fn internal_ip(&self) -> Result<String, MetadataError> {
        self.get_trimmed("instance/network-interfaces/0/ip").await
    }

    /// External IP of the first access config of the first network interface.
    pub async fn external_ip(&self) -> Result<String, MetadataError> {
        self.get_trimmed("instance/network-interfaces/0/access-configs/0/external-ip")
            .await
    }

    /// Email of a service account; an empty name means `default`.
    pub async fn email(&self, service_account_name: &str) -> Result<String, MetadataError> {
        let suffix = format!(
            "instance/service-accounts/{}/email",
            service_account(service_account_name)
        );
        self.get_trimmed(&suffix).await
    }

    /// Scopes granted to a service account; an empty name means `default`.
    pub async fn scopes(&self, service_account_name: &str) -> Result<Vec<String>, MetadataError> {
        let suffix = format!(
            "instance/service-accounts/{}/scopes",
            service_account(service_account_name)
        );
        Ok(lines(&self.get(&suffix).await?))
    }

    /// Zone of the instance, e.g. `us-central1-b`.
    pub async fn zone(&self) -> Result<String, MetadataError> {
        let zone = self.get_trimmed("instance/zone").await?;
        Ok(short_zone(&zone).to_string())
    }

    /// Network tags of the instance.
    pub async fn instance_tags(&self) -> Result<Vec<String>, MetadataError> {
        let tags = self.get("instance/tags").await?;
        serde_json::from_str(&tags).map_err(MetadataError::from)
    }

    /// Names of the custom instance attributes.
    pub async fn instance_attributes(&self) -> Result<Vec<String>, MetadataError> {
        Ok(lines(&self.get("instance/attributes/").await?))
    }

    /// Names of the custom project attributes.
    pub async fn project_attributes(&self) -> Result<Vec<String>, MetadataError> {
        Ok(lines(&self.get("project/attributes/").await?))
    }

    /// Value of a custom instance attribute.
    ///
    /// # Errors
    ///
    /// A missing attribute yields a [`MetadataError::Status`] for which
    /// [`is_not_defined`](MetadataError::is_not_defined) is true.
    pub async fn instance_attribute_value(&self, attr: &str) -> Result<String, MetadataError> {
        self.get(&format!("instance/attributes/{attr}")).await
    }

    /// Value of a custom project attribute.
    pub async fn project_attribute_value(&self, attr: &str) -> Result<String, MetadataError> {
        self.get(&format!("project/attributes/{attr}")).await
    }

    /// Fetch a custom instance attribute and deserialize it as JSON.
    ///
    /// # Errors
    ///
    /// Returns `MetadataError::Json` if deserialization fails.
    pub async fn instance_attribute_json<T: DeserializeOwned>(
        &self,
        attr: &str,
    ) -> Result<T, MetadataError> {
        let value = self.instance_attribute_value(attr).await?;
        serde_json::from_str(&value).map_err(MetadataError::from)
    }

    /// Watch `suffix` for changes.
    ///
    /// `f` is called with the current value and `true`, then once per change
    /// reported by the server. When the entry disappears `f` receives an
    /// empty value and `false`; while it stays missing the server is polled
    /// again only every [`FAILED_SUBSCRIBE_SLEEP`]. Other failures are logged
    /// and retried after the same delay. Returns the first error produced by
    /// `f` or by the initial fetch.
    pub async fn subscribe<F, E>(&self, suffix: &str, mut f: F) -> Result<(), E>
    where
        F: FnMut(&str, bool) -> Result<(), E>,
        E: From<MetadataError>,
    {
        let (value, mut last_etag) = self.get_with_etag(suffix).await?;
        f(&value, true)?;

        let watch = watch_suffix(suffix);
        loop {
            let escaped: String =
                url::form_urlencoded::byte_serialize(last_etag.as_bytes()).collect();
            let (value, etag, exists) = match self.get_with_etag(&format!("{watch}{escaped}")).await
            {
                Ok((value, etag)) => (value, etag, true),
                Err(e) if e.is_not_defined() => (String::new(), String::new(), false),
                Err(e) => {
                    tracing::warn!(error = %e, suffix, "metadata watch failed, retrying");
                    tokio::time::sleep(FAILED_SUBSCRIBE_SLEEP).await;
                    continue;
                }
            };
            last_etag = etag;
            f(&value, exists)?;
            if !exists {
                tokio::time::sleep(FAILED_SUBSCRIBE_SLEEP).await;
            }
        }
    }
}
