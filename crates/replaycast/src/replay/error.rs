//! Error taxonomy for the frame feed.
//!
//! Nothing here is fatal to a session: the forward poller swallows failures
//! and retries on its next tick, and backfill retries each slice with backoff
//! before writing it off for the batch.

use std::error::Error;
use std::fmt;

/// Errors produced while fetching frames from the upstream feed.
#[derive(Debug)]
pub enum FetchError {
    /// Transport-level failure (connect, TLS handshake, I/O).
    Transport(Box<dyn Error + Send + Sync>),
    /// Non-success HTTP status.
    Status(u16),
    /// Response body did not match the expected wire shape.
    Decode(String),
    /// Request URL could not be built or parsed.
    Uri,
    /// TLS client configuration failed (missing root certificates).
    TlsConfig,
    /// Response body exceeded the size cap.
    BodyTooLarge,
    /// Redirect chain exceeded the cap.
    TooManyRedirects,
    /// Cancellation fired before the request completed.
    Cancelled,
}

impl FetchError {
    /// True for failures worth retrying. Cancellation is deliberate and final.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::Status(code) => write!(f, "unexpected HTTP status: {code}"),
            Self::Decode(msg) => write!(f, "malformed feed response: {msg}"),
            Self::Uri => write!(f, "invalid request URL"),
            Self::TlsConfig => write!(f, "TLS configuration error (missing root certificates)"),
            Self::BodyTooLarge => write!(f, "response body too large"),
            Self::TooManyRedirects => write!(f, "too many redirect responses"),
            Self::Cancelled => write!(f, "request cancelled"),
        }
    }
}

impl Error for FetchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Transport(e) => Some(&**e),
            _ => None,
        }
    }
}
