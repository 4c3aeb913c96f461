//! Error types for the gemwire crate.

use crate::{parser::ResponseHeader, url::Origin};
use std::{fmt, io, time::Duration};

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The phase of an exchange a timeout was guarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// TCP connect plus TLS handshake.
    Connect,
    /// Connect completion until the response header is parsed.
    Headers,
    /// Connect completion until the first byte of the body arrives.
    Body,
    /// Server side: connection accepted until the request line is parsed.
    Request,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Connect => "connect timeout",
            Self::Headers => "timeout waiting for response headers",
            Self::Body => "timeout waiting for first byte of the response",
            Self::Request => "timeout waiting for request header",
        })
    }
}

/// Errors that can occur while talking Gemini.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A timer fired before the guarded event happened.
    #[error("{phase}")]
    Timeout {
        /// Which timer fired.
        phase: TimeoutPhase,
        /// How long it was set for.
        after: Duration,
    },

    /// The request line was too long or not UTF-8.
    #[error("invalid Gemini request")]
    InvalidRequest,

    /// The response header was malformed or had an unknown status category.
    #[error("invalid Gemini response")]
    InvalidResponse,

    /// The peer went away before a complete header was read.
    #[error("connection closed before {0} header")]
    ClosedBeforeHeader(&'static str),

    /// The request URL exceeds 1024 bytes.
    #[error("request URL is too long: {0} bytes")]
    RequestTooLong(usize),

    /// A URL failed to parse.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// A URL without a host.
    #[error("URL has no host: {0}")]
    MissingHost(String),

    /// A URL with a scheme other than `gemini`.
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    /// The negotiated application protocol was refused.
    #[error("invalid or missing ALPN protocol")]
    AlpnMismatch {
        /// The protocol the peer selected, if any.
        negotiated: Option<Vec<u8>>,
    },

    /// A certificate was requested but client certificates are off.
    #[error("server request client cert, but client is configured not to send one")]
    ClientCertsDisabled {
        /// The `6x` header.
        response: ResponseHeader,
    },

    /// The confirmation callback said no.
    #[error("user rejected the use of a client certificate for {origin}")]
    ClientCertDeclined {
        /// Where the certificate would have gone.
        origin: Origin,
        /// The `6x` header.
        response: ResponseHeader,
    },

    /// The server answered `63`, `64` or `65`.
    #[error("{}", .response.meta)]
    CertificateRejected {
        /// The `6x` header.
        response: ResponseHeader,
    },

    /// The server asked for a certificate although one was just presented.
    #[error("server requested a client certificate again: {}", .response.meta)]
    CertificateRequestedAgain {
        /// The second `6x` header.
        response: ResponseHeader,
    },

    /// More redirects than `max_redirects` allows.
    #[error("too many redirects ({0})")]
    TooManyRedirects(u32),

    /// A second header on the same response.
    #[error("header already sent")]
    HeaderAlreadySent,

    /// The response was already ended, or its status does not allow a body.
    #[error("response is finished, no more body may be written")]
    ResponseFinished,

    /// A value handed to the response writer was unusable.
    #[error("invalid {what}: {reason}")]
    InvalidArgument {
        /// What was wrong (`"meta"`, `"MIME type"`).
        what: &'static str,
        /// Why.
        reason: String,
    },

    /// A host that cannot be used for SNI.
    #[error("invalid server name: {0}")]
    InvalidServerName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// A TLS failure, including a refused server certificate.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// rcgen could not build a certificate.
    #[error("failed to generate certificate: {0}")]
    CertGeneration(#[from] rcgen::Error),

    /// The known hosts file could not be read or written.
    #[error("known hosts error: {0}")]
    KnownHosts(String),

    /// The known hosts file is not valid JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A transport failure.
    #[error("IO error: {0}")]
    Io(io::Error),
}

impl Error {
    /// Whether this is a network timeout, as opposed to another failure.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Io(err) => err.kind() == io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// The response that triggered a protocol-level failure, if any.
    pub fn response(&self) -> Option<&ResponseHeader> {
        match self {
            Self::ClientCertsDisabled { response }
            | Self::ClientCertDeclined { response, .. }
            | Self::CertificateRejected { response }
            | Self::CertificateRequestedAgain { response } => Some(response),
            _ => None,
        }
    }

    pub(crate) fn invalid_argument(what: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            what,
            reason: reason.into(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        // errors raised inside our own `AsyncRead` impls travel wrapped in io::Error
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(Ok(inner)) = err.into_inner().map(|inner| inner.downcast::<Error>()) {
                return *inner;
            }
            return Self::Io(io::ErrorKind::Other.into());
        }
        Self::Io(err)
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            err if err.is_timeout() => io::Error::new(io::ErrorKind::TimedOut, err),
            err => io::Error::other(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_messages() {
        let err = Error::Timeout {
            phase: TimeoutPhase::Headers,
            after: Duration::from_millis(100),
        };
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "timeout waiting for response headers");
    }

    #[test]
    fn timeout_survives_io_round_trip() {
        let err = Error::Timeout {
            phase: TimeoutPhase::Body,
            after: Duration::from_secs(1),
        };
        let io_err = io::Error::from(err);
        assert_eq!(io_err.kind(), io::ErrorKind::TimedOut);

        let err = Error::from(io_err);
        assert!(matches!(err, Error::Timeout { phase: TimeoutPhase::Body, .. }));
    }

    #[test]
    fn plain_io_errors_stay_io() {
        let err = Error::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::ConnectionReset));
        assert!(!err.is_timeout());
    }
}
