//! Incremental parsing of the single header line that starts every request
//! and response, and the body reader that follows it.
//!
//! [`LineParser`] is a sans-IO state machine: it buffers chunks until it sees
//! CRLF or hits the size ceiling, yields the header exactly once and hands
//! back whatever followed the terminator. [`read_header`] drives it over an
//! `AsyncRead`. [`Body`] then takes over the stream, replaying the leftover
//! bytes before the rest of the connection.

use crate::{
    error::{Error, Result, TimeoutPhase},
    status::Status,
};
use nom::{
    IResult, Parser,
    bytes::complete::{take_while_m_n, take_while1},
    sequence::terminated,
};
use std::{
    io,
    marker::PhantomData,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::debug;

const CRLF: &[u8] = b"\r\n";
const READ_CHUNK: usize = 1024;
const BODY_CHUNK: usize = 8 * 1024;
/// Chunks read ahead of the consumer.
const BODY_BUFFER: usize = 16;

/// A header line flavour: how big it may get and how to decode it.
pub trait HeaderLine: Sized {
    /// Ceiling on the buffered header, terminator included.
    const MAX_SIZE: usize;
    /// Used in error messages (`"request"`, `"response"`).
    const KIND: &'static str;

    /// Decode the line, without its CRLF.
    fn parse(line: &[u8]) -> Result<Self>;

    /// The error for a line that cannot be a header of this kind.
    fn invalid() -> Error;
}

/// `<URL><CR><LF>`, the URL at most 1024 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// The URL exactly as sent.
    pub url: String,
}

impl HeaderLine for RequestHeader {
    const MAX_SIZE: usize = 1024 + CRLF.len();
    const KIND: &'static str = "request";

    fn parse(line: &[u8]) -> Result<Self> {
        let url = std::str::from_utf8(line).map_err(|_| Self::invalid())?;
        Ok(Self {
            url: url.to_string(),
        })
    }

    fn invalid() -> Error {
        Error::InvalidRequest
    }
}

/// `<STATUS><whitespace><META><CR><LF>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    /// The status, coarsened if the exact code is unknown.
    pub status: Status,
    /// Trimmed. MIME type, redirect target, prompt or error detail,
    /// depending on the status.
    pub meta: String,
}

impl ResponseHeader {
    /// The (possibly coarsened) two-digit status code.
    pub fn status_code(&self) -> u8 {
        self.status.code()
    }

    /// The status table's message for the code.
    pub fn status_message(&self) -> &'static str {
        self.status.message()
    }
}

fn status_prefix(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(
        take_while_m_n(2, 2, |c: u8| c.is_ascii_digit()),
        take_while1(|c: u8| c == b' ' || c == b'\t'),
    )
    .parse(input)
}

impl HeaderLine for ResponseHeader {
    // cutoff, the protocol allows 1024 bytes of meta
    const MAX_SIZE: usize = 2048;
    const KIND: &'static str = "response";

    fn parse(line: &[u8]) -> Result<Self> {
        let (meta, digits) = status_prefix(line).map_err(|_| Self::invalid())?;
        let code = (digits[0] - b'0') * 10 + (digits[1] - b'0');
        let status = Status::from_code(code).ok_or_else(Self::invalid)?;
        let meta = String::from_utf8_lossy(meta).trim().to_string();

        Ok(Self { status, meta })
    }

    fn invalid() -> Error {
        Error::InvalidResponse
    }
}

/// Buffers input until a complete header line is available.
#[derive(Debug)]
pub struct LineParser<H> {
    peek: Vec<u8>,
    scanned: usize,
    header: PhantomData<H>,
}

/// The outcome of feeding a chunk to a [`LineParser`].
#[derive(Debug)]
pub enum Feed<H> {
    /// No terminator yet, keep feeding.
    Pending(LineParser<H>),
    /// The header, and the bytes that followed its terminator.
    Parsed {
        /// The decoded line.
        header: H,
        /// Bytes after the CRLF.
        rest: Vec<u8>,
    },
}

impl<H: HeaderLine> Default for LineParser<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: HeaderLine> LineParser<H> {
    /// An empty parser.
    pub fn new() -> Self {
        Self {
            peek: Vec::new(),
            scanned: 0,
            header: PhantomData,
        }
    }

    /// Consume a chunk.
    ///
    /// The parser is given up on success, so the header can only ever be
    /// produced once and the buffer is not looked at again.
    pub fn feed(mut self, chunk: &[u8]) -> Result<Feed<H>> {
        self.peek.extend_from_slice(chunk);

        let limit = self.peek.len().min(H::MAX_SIZE);
        // the CR may have been the last byte of the previous chunk
        let start = self.scanned.saturating_sub(1);
        let terminator = self.peek[start..limit]
            .windows(CRLF.len())
            .position(|window| window == CRLF)
            .map(|i| start + i);

        match terminator {
            Some(i) => {
                let header = H::parse(&self.peek[..i])?;
                let rest = self.peek.split_off(i + CRLF.len());
                Ok(Feed::Parsed { header, rest })
            }
            None if self.peek.len() >= H::MAX_SIZE => Err(H::invalid()),
            None => {
                self.scanned = limit;
                Ok(Feed::Pending(self))
            }
        }
    }
}

/// Read a header from `stream`.
///
/// Returns the header and whatever followed its terminator in the last
/// chunk read. The rest of the stream is left unread.
pub async fn read_header<H, S>(stream: &mut S) -> Result<(H, Vec<u8>)>
where
    H: HeaderLine,
    S: AsyncRead + Unpin,
{
    let mut parser = LineParser::<H>::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ClosedBeforeHeader(H::KIND));
        }
        parser = match parser.feed(&chunk[..n])? {
            Feed::Pending(parser) => parser,
            Feed::Parsed { header, rest } => return Ok((header, rest)),
        };
    }
}

/// Everything after the header.
///
/// The connection is read by a background task from the moment the body is
/// created, whether or not anyone reads the body. That task flips
/// [`first_byte_observed`](Self::first_byte_observed) as soon as the first
/// byte arrives, and drops the connection if the first-byte deadline passes
/// before that. Bytes wait in a bounded buffer until they are read.
pub struct Body {
    chunk: Vec<u8>,
    pos: usize,
    chunks: mpsc::Receiver<Result<Vec<u8>>>,
    first_byte: watch::Receiver<bool>,
    timed_out: Option<Duration>,
    pump: JoinHandle<()>,
}

impl Body {
    /// Start reading `stream`, serving `buffered` (the bytes that came with
    /// the header) first.
    ///
    /// With a `deadline` of `(instant, after)`, the connection is dropped and
    /// reads fail with a body timeout unless a byte arrives by `instant`.
    pub fn spawn<S>(buffered: Vec<u8>, stream: S, deadline: Option<(Instant, Duration)>) -> Self
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let seen = !buffered.is_empty();
        let (first_byte_tx, first_byte) = watch::channel(seen);
        let (tx, chunks) = mpsc::channel(BODY_BUFFER);
        let deadline = deadline.filter(|_| !seen);

        Self {
            chunk: buffered,
            pos: 0,
            chunks,
            first_byte,
            timed_out: None,
            pump: tokio::spawn(pump(stream, tx, first_byte_tx, deadline)),
        }
    }

    /// Flips to `true` once a byte of the body has been received.
    ///
    /// Watching this does not read from the body.
    pub fn first_byte_observed(&self) -> watch::Receiver<bool> {
        self.first_byte.clone()
    }

    /// Read the body to the end.
    pub async fn bytes(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Read the body to the end as (lossy) UTF-8.
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump<S>(
    mut stream: S,
    tx: mpsc::Sender<Result<Vec<u8>>>,
    first_byte: watch::Sender<bool>,
    deadline: Option<(Instant, Duration)>,
) where
    S: AsyncRead + Unpin,
{
    let expire = async {
        match deadline {
            Some((at, after)) => {
                tokio::time::sleep_until(at).await;
                after
            }
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expire);
    let mut waiting = deadline.is_some();
    let mut chunk = vec![0u8; BODY_CHUNK];

    loop {
        let read = tokio::select! {
            biased;
            read = stream.read(&mut chunk) => read,
            after = &mut expire, if waiting => {
                debug!(?after, "no body before the deadline, dropping connection");
                drop(stream);
                tx.send(Err(Error::Timeout { phase: TimeoutPhase::Body, after })).await.ok();
                return;
            }
        };

        match read {
            Ok(0) => return,
            Ok(n) => {
                waiting = false;
                first_byte.send_if_modified(|seen| !std::mem::replace(seen, true));
                if tx.send(Ok(chunk[..n].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                tx.send(Err(err.into())).await.ok();
                return;
            }
        }
    }
}

fn timeout_error(after: Duration) -> io::Error {
    Error::Timeout {
        phase: TimeoutPhase::Body,
        after,
    }
    .into()
}

impl AsyncRead for Body {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if let Some(after) = this.timed_out {
                return Poll::Ready(Err(timeout_error(after)));
            }
            if buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            if this.pos < this.chunk.len() {
                let n = buf.remaining().min(this.chunk.len() - this.pos);
                buf.put_slice(&this.chunk[this.pos..this.pos + n]);
                this.pos += n;
                return Poll::Ready(Ok(()));
            }

            match this.chunks.poll_recv(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.chunk = chunk;
                    this.pos = 0;
                }
                Poll::Ready(Some(Err(Error::Timeout { after, .. }))) => this.timed_out = Some(after),
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err.into())),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn feed_all<H: HeaderLine>(chunks: &[&[u8]]) -> Result<Option<(H, Vec<u8>)>> {
        let mut parser = LineParser::<H>::new();
        for chunk in chunks {
            parser = match parser.feed(chunk)? {
                Feed::Pending(parser) => parser,
                Feed::Parsed { header, rest } => return Ok(Some((header, rest))),
            };
        }
        Ok(None)
    }

    async fn parse_in_chunks(input: &[u8], size: usize) -> (ResponseHeader, Vec<u8>) {
        let mut mock = tokio_test::io::Builder::new();
        for piece in input.chunks(size) {
            mock.read(piece);
        }
        let mut mock = mock.build();
        let (header, rest) = read_header::<ResponseHeader, _>(&mut mock).await.unwrap();
        (header, Body::spawn(rest, mock, None).bytes().await.unwrap())
    }

    /// The header arrives on `client`, then the body takes over the stream.
    async fn body_after_header(
        server: &mut tokio::io::DuplexStream,
        mut client: tokio::io::DuplexStream,
        deadline: Option<Duration>,
    ) -> Body {
        server.write_all(b"20 text/plain\r\n").await.unwrap();
        let (_, rest) = read_header::<ResponseHeader, _>(&mut client).await.unwrap();
        let deadline = deadline.map(|after| (Instant::now() + after, after));
        Body::spawn(rest, client, deadline)
    }

    #[test]
    fn response_with_body_in_same_chunk() {
        let (header, rest) = feed_all::<ResponseHeader>(&[b"20 text/gemini\r\n# Hi"]).unwrap().unwrap();
        assert_eq!(header.status, Status::SUCCESS);
        assert_eq!(header.status_message(), "Success");
        assert_eq!(header.meta, "text/gemini");
        assert_eq!(rest, b"# Hi");
    }

    #[test]
    fn meta_is_trimmed() {
        let (header, rest) = feed_all::<ResponseHeader>(&[b"30 \t /foo  \r\n"]).unwrap().unwrap();
        assert_eq!(header.status_code(), 30);
        assert_eq!(header.meta, "/foo");
        assert!(rest.is_empty());
    }

    #[test]
    fn unknown_code_is_coarsened() {
        let (header, _) = feed_all::<ResponseHeader>(&[b"27 text/plain\r\n"]).unwrap().unwrap();
        assert_eq!(header.status_code(), 20);
    }

    #[test]
    fn invalid_response_lines() {
        for line in [&b"71 nope\r\n"[..], b"2 x\r\n", b"ab cd\r\n", b"20\r\n", b"200 x\r\n", b"\r\n"] {
            assert!(
                matches!(feed_all::<ResponseHeader>(&[line]), Err(Error::InvalidResponse)),
                "{:?}",
                String::from_utf8_lossy(line)
            );
        }
    }

    #[test]
    fn keeps_buffering_without_terminator() {
        assert!(feed_all::<ResponseHeader>(&[b"20 text/", b"gemini"]).unwrap().is_none());
    }

    #[test]
    fn terminator_split_across_chunks() {
        let (header, rest) = feed_all::<ResponseHeader>(&[b"51 gone\r", b"\nafter"]).unwrap().unwrap();
        assert_eq!(header.status, Status::NOT_FOUND);
        assert_eq!(rest, b"after");
    }

    #[test]
    fn response_ceiling() {
        let line = vec![b'a'; ResponseHeader::MAX_SIZE - 1];
        assert!(feed_all::<ResponseHeader>(&[&line]).unwrap().is_none());
        assert!(matches!(
            feed_all::<ResponseHeader>(&[&line, b"a"]),
            Err(Error::InvalidResponse)
        ));
    }

    #[test]
    fn terminator_beyond_ceiling_is_invalid() {
        let mut line = b"20 ".to_vec();
        line.resize(ResponseHeader::MAX_SIZE, b'x');
        line.extend_from_slice(b"\r\n");
        assert!(matches!(feed_all::<ResponseHeader>(&[&line]), Err(Error::InvalidResponse)));
    }

    #[test]
    fn request_line() {
        let (header, rest) = feed_all::<RequestHeader>(&[b"gemini://example.org/", b"foo?bar\r\n"])
            .unwrap()
            .unwrap();
        assert_eq!(header.url, "gemini://example.org/foo?bar");
        assert!(rest.is_empty());
    }

    #[test]
    fn request_url_limit() {
        let mut line = vec![b'a'; 1024];
        line.extend_from_slice(b"\r\n");
        assert!(feed_all::<RequestHeader>(&[&line]).unwrap().is_some());

        let mut line = vec![b'a'; 1025];
        line.extend_from_slice(b"\r\n");
        assert!(matches!(feed_all::<RequestHeader>(&[&line]), Err(Error::InvalidRequest)));
    }

    #[test]
    fn request_must_be_utf8() {
        assert!(matches!(
            feed_all::<RequestHeader>(&[b"gemini://\xff\r\n"]),
            Err(Error::InvalidRequest)
        ));
    }

    #[tokio::test]
    async fn parsing_does_not_depend_on_chunk_boundaries() {
        let input = b"20 text/gemini; lang=en\r\n# Title\r\nSome text.\r\n";
        let whole = parse_in_chunks(input, input.len()).await;

        for size in [1, 2, 3, 7, 25, 26] {
            assert_eq!(parse_in_chunks(input, size).await, whole, "chunk size {size}");
        }
        assert_eq!(whole.0.meta, "text/gemini; lang=en");
        assert_eq!(whole.1, b"# Title\r\nSome text.\r\n");
    }

    #[tokio::test]
    async fn oversized_header_fails_instead_of_hanging() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&[b'9'; READ_CHUNK])
            .read(&[b'9'; READ_CHUNK])
            .build();
        let result = read_header::<ResponseHeader, _>(&mut mock).await;
        assert!(matches!(result, Err(Error::InvalidResponse)));
    }

    #[tokio::test]
    async fn eof_before_header() {
        let mut mock = tokio_test::io::Builder::new().read(b"20 text/").build();
        let result = read_header::<ResponseHeader, _>(&mut mock).await;
        assert!(matches!(result, Err(Error::ClosedBeforeHeader("response"))));
    }

    #[tokio::test]
    async fn first_byte_signal_without_reading() {
        let (mut server, client) = tokio::io::duplex(64);
        let body = body_after_header(&mut server, client, None).await;
        let mut observed = body.first_byte_observed();
        assert!(!*observed.borrow());

        server.write_all(b"body bytes").await.unwrap();
        let seen = tokio::time::timeout(Duration::from_millis(500), observed.wait_for(|seen| *seen)).await;
        assert!(seen.is_ok_and(|seen| seen.is_ok()));

        drop(server);
        assert_eq!(body.text().await.unwrap(), "body bytes");
    }

    #[tokio::test]
    async fn leftover_counts_as_first_byte() {
        let mut mock = tokio_test::io::Builder::new().read(b"20 text/plain\r\nhi").build();
        let (_, rest) = read_header::<ResponseHeader, _>(&mut mock).await.unwrap();
        let body = Body::spawn(rest, mock, Some((Instant::now(), Duration::ZERO)));
        assert!(*body.first_byte_observed().borrow());
        assert_eq!(body.text().await.unwrap(), "hi");
    }

    #[tokio::test(start_paused = true)]
    async fn first_byte_deadline() {
        let (mut server, client) = tokio::io::duplex(64);
        let body = body_after_header(&mut server, client, Some(Duration::from_millis(100))).await;

        let err = body.bytes().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "timeout waiting for first byte of the response");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_drops_connection_of_unread_body() {
        let (mut server, client) = tokio::io::duplex(64);
        let body = body_after_header(&mut server, client, Some(Duration::from_millis(100))).await;

        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(1), server.read(&mut byte)).await;
        assert_eq!(read.unwrap().unwrap(), 0);
        assert!(!*body.first_byte_observed().borrow());
    }

    #[tokio::test]
    async fn dropping_the_body_closes_the_connection() {
        let (mut server, client) = tokio::io::duplex(64);
        let body = body_after_header(&mut server, client, None).await;
        drop(body);

        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(1), server.read(&mut byte)).await;
        assert_eq!(read.unwrap().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_void_once_data_arrived() {
        let (mut server, client) = tokio::io::duplex(64);
        let mut body = body_after_header(&mut server, client, Some(Duration::from_millis(100))).await;

        server.write_all(b"a").await.unwrap();
        let mut byte = [0u8; 1];
        body.read_exact(&mut byte).await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        server.write_all(b"b").await.unwrap();
        drop(server);
        assert_eq!(body.bytes().await.unwrap(), b"b");
    }
}
