//! The response side of a server connection.
//!
//! A response is one header line, then a body only for `2x` statuses. The
//! writer enforces that shape: the header goes out at most once, body bytes
//! before it imply `20`, and any other status closes the response right away.

use super::ServerStream;
use crate::{
    error::{Error, Result},
    mime::MimeType,
    status::{Category, Status},
};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Longest `meta` a header may carry, in bytes.
pub const MAX_META_LENGTH: usize = 1024;

fn validate_meta(meta: &str) -> Result<()> {
    if meta.len() > MAX_META_LENGTH {
        return Err(Error::invalid_argument(
            "meta",
            format!("{} bytes, at most {MAX_META_LENGTH} allowed", meta.len()),
        ));
    }
    if meta.contains(['\r', '\n']) {
        return Err(Error::invalid_argument("meta", "must not contain CR or LF"));
    }
    Ok(())
}

/// Writes the response to a single request.
pub struct ResponseWriter<W = ServerStream> {
    inner: W,
    mime_type: Option<String>,
    header_sent: bool,
    finished: bool,
}

impl<W: AsyncWrite + Unpin + Send> ResponseWriter<W> {
    pub(crate) fn new(inner: W) -> Self {
        Self {
            inner,
            mime_type: None,
            header_sent: false,
            finished: false,
        }
    }

    /// Whether the header is out.
    pub fn header_sent(&self) -> bool {
        self.header_sent
    }

    /// Whether nothing more can be written.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The underlying stream.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Use `mime_type` as the meta of a success header, overriding whatever
    /// meta is passed to [`send_header`](Self::send_header).
    ///
    /// Ignored for every other status.
    pub fn set_mime_type(&mut self, mime_type: &str) -> Result<()> {
        if self.header_sent {
            return Err(Error::HeaderAlreadySent);
        }
        validate_meta(mime_type)?;
        if MimeType::parse(mime_type).is_none() {
            return Err(Error::invalid_argument("MIME type", mime_type));
        }
        self.mime_type = Some(mime_type.to_string());
        Ok(())
    }

    /// Send the header line. Can only be done once.
    ///
    /// Unless `status` is a success, the response is ended right after.
    pub async fn send_header(&mut self, status: Status, meta: &str) -> Result<()> {
        if self.header_sent {
            return Err(Error::HeaderAlreadySent);
        }
        if self.finished {
            return Err(Error::ResponseFinished);
        }
        validate_meta(meta)?;

        let success = status.category() == Category::Success;
        let meta = match &self.mime_type {
            Some(mime_type) if success => mime_type.as_str(),
            _ => meta,
        };
        self.inner.write_all(format!("{status} {meta}\r\n").as_bytes()).await?;
        self.inner.flush().await?;
        self.header_sent = true;
        trace!(%status, meta, "sent header");

        if !success {
            self.finish().await?;
        }
        Ok(())
    }

    /// Write a chunk of the body, sending a `20` header first if needed.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.finished {
            return Err(Error::ResponseFinished);
        }
        if !self.header_sent {
            self.send_header(Status::SUCCESS, "").await?;
        }
        self.inner.write_all(data).await?;
        Ok(())
    }

    /// [`write`](Self::write) for text.
    pub async fn write_str(&mut self, text: &str) -> Result<()> {
        self.write(text.as_bytes()).await
    }

    /// Finish the response, sending a `20` header if nothing was sent yet.
    ///
    /// Calling this on a finished response does nothing.
    pub async fn end(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if !self.header_sent {
            self.send_header(Status::SUCCESS, "").await?;
        }
        self.finish().await
    }

    async fn finish(&mut self) -> Result<()> {
        self.finished = true;
        self.inner.flush().await?;
        self.inner.shutdown().await?;
        Ok(())
    }

    /// `10`: ask the user for a line of input.
    pub async fn prompt(&mut self, prompt: &str) -> Result<()> {
        self.send_header(Status::INPUT, prompt).await
    }

    /// `11`: like [`prompt`](Self::prompt), for input that should not be echoed.
    pub async fn sensitive_prompt(&mut self, prompt: &str) -> Result<()> {
        self.send_header(Status::SENSITIVE_INPUT, prompt).await
    }

    /// `30`, or `31` if `permanent`.
    pub async fn redirect(&mut self, url: &str, permanent: bool) -> Result<()> {
        if url.trim().is_empty() {
            return Err(Error::invalid_argument("redirect URL", "must not be empty"));
        }
        let status = if permanent {
            Status::REDIRECT_PERMANENT
        } else {
            Status::REDIRECT_TEMPORARY
        };
        self.send_header(status, url).await
    }

    /// `43`
    pub async fn proxy_error(&mut self, message: &str) -> Result<()> {
        self.send_header(Status::PROXY_ERROR, message).await
    }

    /// `44`: the client should wait `seconds` before trying again.
    pub async fn slow_down(&mut self, seconds: u32) -> Result<()> {
        self.send_header(Status::SLOW_DOWN, &seconds.to_string()).await
    }

    /// `51`
    pub async fn not_found(&mut self) -> Result<()> {
        self.send_header(Status::NOT_FOUND, "").await
    }

    /// `52`
    pub async fn gone(&mut self) -> Result<()> {
        self.send_header(Status::GONE, "").await
    }

    /// `59`
    pub async fn bad_request(&mut self, message: &str) -> Result<()> {
        self.send_header(Status::BAD_REQUEST, message).await
    }

    /// `61`
    pub async fn request_transient_cert(&mut self, reason: &str) -> Result<()> {
        self.send_header(Status::TRANSIENT_CERT_REQUESTED, reason).await
    }

    /// `62`
    pub async fn request_authorized_cert(&mut self, reason: &str) -> Result<()> {
        self.send_header(Status::AUTHORISED_CERT_REQUIRED, reason).await
    }
}
