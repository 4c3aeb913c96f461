//! Responses as the client sees them.

use crate::{
    error::Result,
    mime::{DEFAULT_MIME_TYPE, MimeType},
    parser::{Body, ResponseHeader},
    status::Status,
};
use url::Url;

/// A response whose header has been received. The body is still streaming.
pub struct Response {
    /// The parsed status line.
    pub header: ResponseHeader,
    /// The URL that produced this response, after any redirects.
    pub url: Url,
    /// How many redirects were followed to get here.
    pub redirects: u32,
    /// The rest of the connection.
    pub body: Body,
}

impl Response {
    /// The (possibly coarsened) status.
    pub fn status(&self) -> Status {
        self.header.status
    }

    /// The status as a number.
    pub fn status_code(&self) -> u8 {
        self.header.status_code()
    }

    /// The status table's message, such as `Not Found`.
    pub fn status_message(&self) -> &'static str {
        self.header.status_message()
    }

    /// The header's `meta`, meaning depends on the status.
    pub fn meta(&self) -> &str {
        &self.header.meta
    }

    /// The MIME type of a `2x` response. An empty `meta` means
    /// `text/gemini; charset=utf-8`.
    pub fn mime_type(&self) -> Option<MimeType> {
        if !self.header.status.is_success() {
            return None;
        }
        if self.header.meta.is_empty() {
            return MimeType::parse(DEFAULT_MIME_TYPE);
        }
        MimeType::parse(&self.header.meta)
    }

    /// Read the whole body.
    pub async fn bytes(self) -> Result<Vec<u8>> {
        self.body.bytes().await
    }

    /// Read the whole body as text.
    pub async fn text(self) -> Result<String> {
        self.body.text().await
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("header", &self.header)
            .field("url", &self.url.as_str())
            .field("redirects", &self.redirects)
            .finish_non_exhaustive()
    }
}
