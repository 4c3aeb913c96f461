//! The request handed to a [`Handler`](super::Handler).

use crate::error::Result;
use std::{fmt, net::SocketAddr};
use url::Url;

/// Relative request lines are resolved against this, so that handlers always
/// get a path.
const BASE_URL: &str = "gemini://localhost/";

/// A parsed Gemini request.
#[derive(Clone)]
pub struct Request {
    raw: String,
    url: Url,
    client_fingerprint: Option<String>,
    peer_addr: SocketAddr,
}

impl Request {
    pub(crate) fn new(raw: String, client_fingerprint: Option<String>, peer_addr: SocketAddr) -> Result<Self> {
        let url = Url::parse(BASE_URL)?.join(&raw)?;

        Ok(Self {
            raw,
            url,
            client_fingerprint,
            peer_addr,
        })
    }

    /// The request line as sent by the client, without CRLF.
    pub fn raw_url(&self) -> &str {
        &self.raw
    }

    /// The request URL, resolved if it was relative.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The host named in the URL.
    pub fn hostname(&self) -> Option<&str> {
        self.url.host_str()
    }

    /// The URL path.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// The query string, still percent-encoded. This is where `1x` input arrives.
    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    /// SHA-256 fingerprint (hex) of the client certificate, if one was presented.
    pub fn client_fingerprint(&self) -> Option<&str> {
        self.client_fingerprint.as_deref()
    }

    /// The client's address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("url", &self.raw)
            .field("client_fingerprint", &self.client_fingerprint)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}
