//! Error types for metadata operations.

use thiserror::Error;

/// Boxed error returned by a [`Transport`](crate::Transport).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur when talking to the metadata server.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// The transport could not complete the request. Displayed exactly as
    /// the underlying error.
    #[error(transparent)]
    Transport(BoxError),

    /// The resolved metadata URL could not be parsed.
    #[error("invalid metadata url {url:?}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// The server answered with a non-success status.
    #[error("http {code}: {body}")]
    Status { code: u16, body: String },

    /// Response was not valid UTF-8.
    #[error("invalid utf-8")]
    Utf8,

    /// JSON deserialization error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// A header value supplied by the caller is not valid.
    #[error("invalid header value")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    /// HTTP client construction failed.
    #[error("http client: {0}")]
    Client(#[from] reqwest::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MetadataError {
    /// Whether the server reported that the requested entry does not exist.
    pub fn is_not_defined(&self) -> bool {
        matches!(self, MetadataError::Status { code: 404, .. })
    }

    /// Status code of a non-success response, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            MetadataError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}
