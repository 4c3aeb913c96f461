//! Request lines sent by the client.

use crate::error::{Error, Result};
use std::fmt;
use url::Url;

/// The longest URL a request may carry, in bytes.
pub const MAX_URL_LENGTH: usize = 1024;

/// A request to a given URL.
#[derive(Debug, Clone)]
pub struct Request(pub Url);

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.0)
    }
}

impl Request {
    /// Create a request, refusing URLs longer than 1024 bytes.
    pub fn new(url: Url) -> Result<Self> {
        let request = Self(url);
        if !request.is_valid_length() {
            return Err(Error::RequestTooLong(request.0.as_str().len()));
        }
        Ok(request)
    }

    /// Check if the request is valid (less than or equal to 1024 bytes).
    pub fn is_valid_length(&self) -> bool {
        self.0.as_str().len() <= MAX_URL_LENGTH
    }
}
