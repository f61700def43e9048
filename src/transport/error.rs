//! Transport failure taxonomy.
//!
//! Every phase of a round-trip fails with its own variant so callers (and
//! tests) can tell a stalled peer from a broken one. `is_timeout` is the
//! stable predicate: it holds exactly for the deadline-driven variants.

use std::io;

use thiserror::Error;

/// Errors produced by the connection and transport layers.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The dial deadline elapsed before the connection was established.
    #[error("connect timeout to {0}")]
    DialTimeout(String),

    /// Connecting failed outright (resolution, refused, TLS handshake).
    #[error("connect error to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The peer stopped accepting request bytes before the write deadline.
    #[error("write timeout")]
    WriteTimeout,

    /// Writing the request failed.
    #[error("write error: {0}")]
    Write(#[source] io::Error),

    /// The read deadline elapsed while waiting for response bytes.
    #[error("read timeout")]
    ReadTimeout,

    /// Reading the response failed.
    #[error("read error: {0}")]
    Read(#[source] io::Error),

    /// The peer sent something that is not HTTP/1.x.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// True for every deadline-driven failure. Tests and retry policy rely on
    /// this classification staying stable.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::DialTimeout(_)
                | TransportError::WriteTimeout
                | TransportError::ReadTimeout
        )
    }

    /// True when the failure happened before any response byte was parsed,
    /// which is the precondition for retrying on a stale pooled connection.
    pub(crate) fn before_response(&self) -> bool {
        !matches!(self, TransportError::Protocol(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        assert!(TransportError::DialTimeout("h:80".into()).is_timeout());
        assert!(TransportError::WriteTimeout.is_timeout());
        assert!(TransportError::ReadTimeout.is_timeout());

        assert!(!TransportError::Protocol("bad status line".into()).is_timeout());
        assert!(!TransportError::Read(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset"
        ))
        .is_timeout());
        assert!(!TransportError::Dial {
            addr: "h:80".into(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        }
        .is_timeout());
    }
}
