use reqwest::{StatusCode, Url};
use thiserror::Error;
use url::ParseError;

/// Result alias for operations within the TaskRelay client crate.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Common error representation for client operations.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The provided base URL is malformed.
    #[error("invalid gateway base URL '{url}': {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: ParseError,
    },

    /// Joining a path onto the base URL failed.
    #[error("failed to join path '{path}' to base URL '{base}': {source}")]
    InvalidPath {
        base: Url,
        path: String,
        #[source]
        source: ParseError,
    },

    /// The underlying HTTP client returned an error.
    #[error("gateway request error: {0}")]
    Request(#[from] reqwest::Error),

    /// The gateway returned a non-success HTTP status.
    #[error("gateway returned {status} for {url}: {message}")]
    Http {
        status: StatusCode,
        url: Url,
        message: String,
    },

    /// Reading or writing a local file failed.
    #[error("file error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A submission was accepted but the response carried no task identifier.
    #[error("gateway response carried no task identifier")]
    MissingTaskId,
}
