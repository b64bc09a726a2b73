//! Typed error taxonomy for the scanner. Each component owns a `thiserror` enum;
//! `ScanError` is the crate-wide envelope used where callers only care "did this
//! layer fail", not which layer produced the failure (e.g. the scan loop's logging).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error calling {url}: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("non-2xx status {status} from {url}: {body_prefix}")]
    Status {
        url: String,
        status: u16,
        body_prefix: String,
    },
    #[error("empty body from {url}")]
    EmptyBody { url: String },
    #[error("malformed json from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("rpc error from {url}: code={code} message={message}")]
    Rpc {
        url: String,
        code: i64,
        message: String,
    },
    #[error("deadline exceeded calling {url}")]
    Deadline { url: String },
}

impl TransportError {
    /// Classification used by the endpoint pools (§4.2) to decide retry/backoff/ban policy.
    pub fn classify(&self) -> FailureClass {
        let text = self.to_string().to_ascii_lowercase();
        if text.contains("403")
            || text.contains("forbidden")
            || text.contains("not allowed")
            || text.contains("api key")
            || text.contains("apikey")
            || text.contains("-32052")
        {
            return FailureClass::Permission;
        }
        if text.contains("429") || text.contains("too many requests") {
            return FailureClass::RateLimit;
        }
        match self {
            TransportError::Http { source, .. } => {
                if source.is_timeout() || source.is_connect() || source.is_request() {
                    FailureClass::Network
                } else {
                    FailureClass::Other
                }
            }
            TransportError::Deadline { .. } => FailureClass::Network,
            _ => FailureClass::Other,
        }
    }
}

/// The bucket an error falls into for endpoint-pool bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Network,
    RateLimit,
    Permission,
    Other,
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("all endpoints failed for chain {chain}: {last_error}")]
    AllEndpointsFailed { chain: String, last_error: String },
    #[error("no healthy or degradable endpoint available")]
    NoEndpoint,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to fetch tip: {0}")]
    Tip(String),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("unexpected payload shape: {0}")]
    Shape(String),
}

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor read failed: {0}")]
    Read(String),
    #[error("cursor write failed: {0}")]
    Write(String),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("ingest post failed: {0}")]
    Ingest(String),
    #[error(transparent)]
    Cursor(#[from] CursorError),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed address file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed config file {path}: {source}")]
    Toml {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error("no addresses loaded")]
    Empty,
}

/// Crate-wide envelope for layers that just need to log-and-continue.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Cursor(#[from] CursorError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
