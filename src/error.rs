//! Error taxonomy for the ingestion pipeline.
//!
//! Each failure mode has its own type so callers can decide locally whether
//! it aborts the operation ([`FetchError`]), is swallowed ([`LookupError`]),
//! or only affects one item ([`ParseError`]) or one batch ([`DeliveryError`]).

use thiserror::Error;

/// The measurement source or probe archive could not be reached or decoded.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Could not decode response from {url}: {reason}")]
    Decode { url: String, reason: String },

    #[error("Result stream failed: {0}")]
    Stream(String),
}

/// An enrichment lookup failed. Never fatal to probe construction.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Lookup request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Could not decode lookup response: {0}")]
    Decode(String),

    #[error("Nothing found for {0}")]
    NotFound(String),
}

/// A raw payload could not be interpreted by the normalizer.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Missing field `{0}`")]
    MissingField(&'static str),

    #[error("Invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// A whole batch could not be delivered to the indexing backend.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Timed out after {timeout_secs}s submitting to {host}")]
    Timeout { host: String, timeout_secs: u64 },

    #[error("Transport failure talking to {host}: {reason}")]
    Transport { host: String, reason: String },

    #[error("Could not encode bulk request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The persisted probe cache could not be read or written.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache encoding error: {0}")]
    Encode(#[from] bincode::Error),
}
