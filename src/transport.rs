//! Pluggable HTTP transport for metadata requests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, USER_AGENT};
use reqwest::{Client, Request, Response};

use crate::error::{BoxError, MetadataError};

/// Connect timeout of the default transport.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// TCP keepalive interval of the default transport.
pub const KEEPALIVE: Duration = Duration::from_secs(30);

/// Executes a single HTTP request.
///
/// Anything implementing this can be handed to
/// [`MetadataClient::new`](crate::MetadataClient::new) or
/// [`set_http_client`](crate::set_http_client). Errors are passed back to
/// the caller of `get` untouched.
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync {
    async fn round_trip(&self, request: Request) -> Result<Response, BoxError>;
}

#[async_trait]
impl Transport for Client {
    async fn round_trip(&self, request: Request) -> Result<Response, BoxError> {
        self.execute(request).await.map_err(BoxError::from)
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn round_trip(&self, request: Request) -> Result<Response, BoxError> {
        (**self).round_trip(request).await
    }
}

/// Build the reqwest client used when no transport is supplied.
///
/// There is no overall request timeout; only connection setup is bounded.
pub fn default_http_client() -> Result<Client, MetadataError> {
    let client = Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(KEEPALIVE)
        .build()?;
    Ok(client)
}

/// Transport decorator that overwrites the `User-Agent` header of every
/// request before delegating to the wrapped transport.
#[derive(Debug, Clone)]
pub struct UserAgent<T> {
    user_agent: HeaderValue,
    inner: T,
}

impl<T: Transport> UserAgent<T> {
    /// Wrap `inner`, sending `user_agent` on every request.
    ///
    /// # Errors
    ///
    /// Returns `MetadataError::InvalidHeader` if `user_agent` is not a valid
    /// header value.
    pub fn new(user_agent: &str, inner: T) -> Result<Self, MetadataError> {
        Ok(Self {
            user_agent: HeaderValue::from_str(user_agent)?,
            inner,
        })
    }

    /// Get the wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }
}

#[async_trait]
impl<T: Transport> Transport for UserAgent<T> {
    async fn round_trip(&self, mut request: Request) -> Result<Response, BoxError> {
        request
            .headers_mut()
            .insert(USER_AGENT, self.user_agent.clone());
        self.inner.round_trip(request).await
    }
}
