//! Origins and URL resolution.

use crate::error::{Error, Result};
use std::fmt;
use url::{Host, Url};

/// The port Gemini servers listen on unless told otherwise.
pub const DEFAULT_PORT: u16 = 1965;
/// The only scheme this crate connects to.
pub const DEFAULT_SCHEME: &str = "gemini";

/// A server, identified by host and port.
///
/// Origins key the transient certificate store and decide whether a
/// redirect stays on the same server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    /// Domain name or IP address, without IPv6 brackets.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Origin {
    /// Create an origin from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// The origin a `gemini://` URL points at.
    pub fn from_url(url: &Url) -> Result<Self> {
        if url.scheme() != DEFAULT_SCHEME {
            return Err(Error::UnsupportedScheme(url.scheme().to_string()));
        }
        let host = match url.host() {
            Some(Host::Domain(name)) => name.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(Error::MissingHost(url.to_string())),
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
        })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Turn what the caller asked for into an absolute URL.
///
/// Absolute URLs are taken as they are. Anything else (`/foo`, `foo?bar`) is
/// resolved against `gemini://{host}:{port}/`. The fragment is dropped, it
/// is never sent to the server.
pub fn resolve(url_or_path: &str, default_host: &str, default_port: u16) -> Result<Url> {
    if url_or_path.is_empty() {
        return Err(Error::invalid_argument("URL", "must not be empty"));
    }

    let mut url = match Url::parse(url_or_path) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = base_url(default_host, default_port)?;
            base.join(url_or_path)?
        }
        Err(err) => return Err(err.into()),
    };
    url.set_fragment(None);

    Ok(url)
}

/// Resolve a redirect target relative to the URL that produced it.
pub fn resolve_redirect(current: &Url, target: &str) -> Result<Url> {
    let mut url = current.join(target.trim())?;
    url.set_fragment(None);

    Ok(url)
}

fn base_url(host: &str, port: u16) -> Result<Url> {
    let origin = Origin::new(host, port);
    Ok(Url::parse(&format!("{DEFAULT_SCHEME}://{origin}/"))?)
}
