//! One wire endpoint: dial, write request, read response, close.
//!
//! A `Connection` owns one TCP (optionally TLS) stream and its HTTP/1.x
//! framing. Each I/O phase is guarded by its own deadline and measured, so a
//! round-trip can report where its time went. The read side keeps a small
//! buffer of bytes read past the current parse point; a connection is only
//! reusable when that buffer is empty and the response body was consumed to
//! its framed end.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::MAX_HEADER_BLOCK_SIZE;

use super::error::TransportError;
use super::headers::Headers;

const READ_CHUNK: usize = 8 * 1024;
const WRITE_CHUNK: usize = 64 * 1024;

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Wall time spent in each phase of the most recent round-trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimings {
    pub connect: Duration,
    pub write: Duration,
    pub read_header: Duration,
    pub read_body: Duration,
}

/// Parsed response head plus the (possibly truncated) body.
pub(crate) struct ResponseParts {
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

/// One established connection to a peer.
pub struct Connection {
    stream: Stream,
    remote_addr: SocketAddr,
    opened_at: Instant,
    use_count: u32,
    // Bytes read past the current parse point (response pipelining guard).
    buf: Vec<u8>,
    timings: PhaseTimings,
    reusable: bool,
}

impl Connection {
    /// Establishes a TCP connection to `host:port`, trying resolved addresses
    /// in order. Sets `SO_KEEPALIVE`, `TCP_NODELAY`, and `SO_LINGER = 0` so an
    /// abort tears the socket down immediately instead of lingering in the
    /// kernel. The caller is responsible for the dial deadline.
    pub(crate) async fn dial_tcp(host: &str, port: u16) -> io::Result<Connection> {
        let mut last_err = None;
        for addr in lookup_host((host, port)).await? {
            let socket = match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4(),
                SocketAddr::V6(_) => TcpSocket::new_v6(),
            }?;
            socket.set_keepalive(true)?;
            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_linger(Some(Duration::ZERO))?;
                    let remote_addr = stream.peer_addr()?;
                    return Ok(Connection {
                        stream: Stream::Plain(stream),
                        remote_addr,
                        opened_at: Instant::now(),
                        use_count: 0,
                        buf: Vec::new(),
                        timings: PhaseTimings::default(),
                        reusable: false,
                    });
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses found for {host}:{port}"),
            )
        }))
    }

    /// Completes a TLS handshake over the established TCP stream.
    pub(crate) async fn upgrade_tls(
        self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> io::Result<Connection> {
        let Connection {
            stream,
            remote_addr,
            opened_at,
            use_count,
            buf,
            timings,
            reusable,
        } = self;
        let stream = match stream {
            Stream::Plain(tcp) => {
                let tls = connector.connect(server_name, tcp).await?;
                Stream::Tls(Box::new(tls))
            }
            already_tls @ Stream::Tls(_) => already_tls,
        };
        Ok(Connection {
            stream,
            remote_addr,
            opened_at,
            use_count,
            buf,
            timings,
            reusable,
        })
    }

    /// Issues a `CONNECT` to an HTTP proxy and waits for a 2xx, leaving the
    /// stream positioned as a raw tunnel to `target`.
    pub(crate) async fn connect_tunnel(&mut self, target: &str) -> Result<(), TransportError> {
        let head = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n");
        self.timed_write_all(head.as_bytes(), None).await?;
        self.timed_flush(None).await?;

        let parts = self.read_head(None).await?;
        if !(200..300).contains(&parts.0) {
            return Err(TransportError::Protocol(format!(
                "proxy refused CONNECT to {target}: {} {}",
                parts.0, parts.1
            )));
        }
        // A tunnel response has no body; anything already buffered belongs to
        // the tunneled protocol, which for us must be a fresh TLS handshake.
        self.timings = PhaseTimings::default();
        Ok(())
    }

    pub(crate) fn set_connect_time(&mut self, elapsed: Duration) {
        self.timings.connect = elapsed;
    }

    /// Marks the start of a round-trip on this connection. Phase timings from
    /// a previous use are cleared; the connect timing survives only the first
    /// use, since later requests did not pay for the dial.
    pub(crate) fn begin_use(&mut self) {
        if self.use_count > 0 {
            self.timings = PhaseTimings::default();
        }
        self.use_count += 1;
        self.reusable = false;
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Time since the underlying socket was established.
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    /// Number of round-trips started on this connection, including the
    /// current one.
    pub fn use_count(&self) -> u32 {
        self.use_count
    }

    pub fn timings(&self) -> PhaseTimings {
        self.timings
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable && self.buf.is_empty()
    }

    /// Tears the connection down. Dropping has the same effect; with
    /// `SO_LINGER = 0` the peer sees a reset rather than a graceful close.
    pub fn close(self) {}

    /// Serializes nothing itself: the caller supplies the request head bytes.
    /// The head and each body chunk get their own write deadline, so the
    /// deadline slides forward on progress but a stalled peer still trips it.
    pub(crate) async fn write_request(
        &mut self,
        head: &[u8],
        body: &[u8],
        write_timeout: Option<Duration>,
    ) -> Result<(), TransportError> {
        let started = Instant::now();
        self.timed_write_all(head, write_timeout).await?;
        for chunk in body.chunks(WRITE_CHUNK) {
            self.timed_write_all(chunk, write_timeout).await?;
        }
        self.timed_flush(write_timeout).await?;
        self.timings.write = started.elapsed();
        Ok(())
    }

    /// Reads and parses a response. Headers and body each run under
    /// `read_timeout`; at most `read_limit` body bytes are kept (0 means
    /// unlimited), with any excess silently truncated. `bodyless` marks
    /// responses that carry no body regardless of framing (HEAD).
    ///
    /// On return, [`is_reusable`](Self::is_reusable) reflects whether the
    /// response permits keep-alive and the body was drained to its framed end.
    pub(crate) async fn read_response(
        &mut self,
        read_timeout: Option<Duration>,
        read_limit: u64,
        bodyless: bool,
    ) -> Result<ResponseParts, TransportError> {
        let started = Instant::now();
        let (status_code, reason, http11, headers) = self.read_head(read_timeout).await?;
        self.timings.read_header = started.elapsed();

        let chunked = headers.has_token("Transfer-Encoding", "chunked");
        let content_length = headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<u64>().ok());
        let no_body = bodyless
            || status_code == 204
            || status_code == 304
            || (100..200).contains(&status_code);

        let body_started = Instant::now();
        let mut body = Vec::new();
        let complete = if no_body {
            true
        } else if chunked {
            self.read_chunked_body(&mut body, read_timeout, read_limit)
                .await?
        } else if let Some(total) = content_length {
            self.read_sized_body(&mut body, total, read_timeout, read_limit)
                .await?
        } else {
            // No framing: body runs to EOF and the connection dies with it.
            self.read_body_to_eof(&mut body, read_timeout, read_limit)
                .await?;
            false
        };
        self.timings.read_body = body_started.elapsed();

        let mut reusable = complete;
        if headers.has_token("Connection", "close") {
            reusable = false;
        }
        if !http11 && !headers.has_token("Connection", "keep-alive") {
            reusable = false;
        }
        self.reusable = reusable;

        Ok(ResponseParts {
            status_code,
            reason,
            headers,
            body,
        })
    }

    /// Reads the status line and header block.
    async fn read_head(
        &mut self,
        read_timeout: Option<Duration>,
    ) -> Result<(u16, String, bool, Headers), TransportError> {
        let head_end = loop {
            if let Some(pos) = find_head_end(&self.buf) {
                break pos;
            }
            if self.buf.len() > MAX_HEADER_BLOCK_SIZE {
                return Err(TransportError::Protocol(
                    "response head exceeds size limit".to_string(),
                ));
            }
            let n = self.timed_read(read_timeout).await?;
            if n == 0 {
                return Err(TransportError::Read(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before response head",
                )));
            }
        };

        let head: Vec<u8> = self.buf.drain(..head_end + 4).collect();
        let head = String::from_utf8_lossy(&head[..head_end]);
        let mut lines = head.split("\r\n");

        let status_line = lines.next().unwrap_or("");
        let mut pieces = status_line.splitn(3, ' ');
        let version = pieces.next().unwrap_or("");
        if !version.starts_with("HTTP/1.") {
            return Err(TransportError::Protocol(format!(
                "malformed status line: {status_line:?}"
            )));
        }
        let status_code: u16 = pieces
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                TransportError::Protocol(format!("malformed status line: {status_line:?}"))
            })?;
        let reason = pieces.next().unwrap_or("").trim().to_string();
        let http11 = version == "HTTP/1.1";

        let mut headers = Headers::new();
        let mut last_name: Option<String> = None;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // Obsolete line folding: continuation of the previous value.
                match &last_name {
                    Some(name) => {
                        let folded = format!(
                            "{} {}",
                            headers.get_all(name).last().unwrap_or(""),
                            line.trim()
                        );
                        headers = replace_last(headers, name, folded);
                    }
                    None => {
                        return Err(TransportError::Protocol(
                            "header continuation before first header".to_string(),
                        ))
                    }
                }
                continue;
            }
            let (name, value) = line.split_once(':').ok_or_else(|| {
                TransportError::Protocol(format!("malformed header line: {line:?}"))
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(TransportError::Protocol(format!(
                    "malformed header line: {line:?}"
                )));
            }
            headers.append(name, value.trim());
            last_name = Some(name.to_string());
        }

        Ok((status_code, reason, http11, headers))
    }

    /// Reads exactly `total` body bytes, storing at most `limit`. Returns
    /// whether the framed body was fully consumed; a truncated read leaves
    /// unread bytes on the wire and poisons reuse.
    async fn read_sized_body(
        &mut self,
        out: &mut Vec<u8>,
        total: u64,
        read_timeout: Option<Duration>,
        limit: u64,
    ) -> Result<bool, TransportError> {
        let mut remaining = total;
        while remaining > 0 {
            if self.buf.is_empty() {
                let n = self.timed_read(read_timeout).await?;
                if n == 0 {
                    return Err(TransportError::Read(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-body",
                    )));
                }
            }
            let take = self.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
            push_limited(out, &self.buf[..take], limit);
            self.buf.drain(..take);
            remaining -= take as u64;
            if limit > 0 && out.len() as u64 >= limit && remaining > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Decodes `Transfer-Encoding: chunked`. Chunk extensions are ignored and
    /// trailers are discarded. Returns whether the terminal chunk was reached.
    async fn read_chunked_body(
        &mut self,
        out: &mut Vec<u8>,
        read_timeout: Option<Duration>,
        limit: u64,
    ) -> Result<bool, TransportError> {
        loop {
            let size_line = self.read_line(read_timeout).await?;
            let size_str = size_line
                .split(';')
                .next()
                .unwrap_or("")
                .trim();
            let size = u64::from_str_radix(size_str, 16).map_err(|_| {
                TransportError::Protocol(format!("malformed chunk size: {size_line:?}"))
            })?;

            if size == 0 {
                // Trailer section: lines until the terminating blank line.
                loop {
                    let trailer = self.read_line(read_timeout).await?;
                    if trailer.is_empty() {
                        return Ok(true);
                    }
                }
            }

            let mut remaining = size;
            while remaining > 0 {
                if self.buf.is_empty() {
                    let n = self.timed_read(read_timeout).await?;
                    if n == 0 {
                        return Err(TransportError::Read(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "connection closed mid-chunk",
                        )));
                    }
                }
                let take = self.buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
                push_limited(out, &self.buf[..take], limit);
                self.buf.drain(..take);
                remaining -= take as u64;
                if limit > 0 && out.len() as u64 >= limit && remaining > 0 {
                    return Ok(false);
                }
            }
            // Chunk data is followed by CRLF.
            let terminator = self.read_line(read_timeout).await?;
            if !terminator.is_empty() {
                return Err(TransportError::Protocol(
                    "missing CRLF after chunk data".to_string(),
                ));
            }
            if limit > 0 && out.len() as u64 >= limit {
                return Ok(false);
            }
        }
    }

    /// Reads until EOF, storing at most `limit` bytes.
    async fn read_body_to_eof(
        &mut self,
        out: &mut Vec<u8>,
        read_timeout: Option<Duration>,
        limit: u64,
    ) -> Result<(), TransportError> {
        loop {
            if !self.buf.is_empty() {
                let drained: Vec<u8> = self.buf.drain(..).collect();
                push_limited(out, &drained, limit);
            }
            if limit > 0 && out.len() as u64 >= limit {
                return Ok(());
            }
            let n = self.timed_read(read_timeout).await?;
            if n == 0 {
                return Ok(());
            }
        }
    }

    /// Reads one CRLF-terminated line, excluding the terminator.
    async fn read_line(
        &mut self,
        read_timeout: Option<Duration>,
    ) -> Result<String, TransportError> {
        loop {
            if let Some(pos) = self.buf.windows(2).position(|w| w == b"\r\n") {
                let line: Vec<u8> = self.buf.drain(..pos + 2).collect();
                return Ok(String::from_utf8_lossy(&line[..pos]).into_owned());
            }
            if self.buf.len() > MAX_HEADER_BLOCK_SIZE {
                return Err(TransportError::Protocol("line exceeds size limit".to_string()));
            }
            let n = self.timed_read(read_timeout).await?;
            if n == 0 {
                return Err(TransportError::Read(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-line",
                )));
            }
        }
    }

    async fn timed_read(&mut self, limit: Option<Duration>) -> Result<usize, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = match limit {
            Some(d) => tokio::time::timeout(d, self.stream.read(&mut chunk))
                .await
                .map_err(|_| TransportError::ReadTimeout)?
                .map_err(TransportError::Read)?,
            None => self
                .stream
                .read(&mut chunk)
                .await
                .map_err(TransportError::Read)?,
        };
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    async fn timed_write_all(
        &mut self,
        data: &[u8],
        limit: Option<Duration>,
    ) -> Result<(), TransportError> {
        match limit {
            Some(d) => tokio::time::timeout(d, self.stream.write_all(data))
                .await
                .map_err(|_| TransportError::WriteTimeout)?
                .map_err(TransportError::Write),
            None => self
                .stream
                .write_all(data)
                .await
                .map_err(TransportError::Write),
        }
    }

    async fn timed_flush(&mut self, limit: Option<Duration>) -> Result<(), TransportError> {
        match limit {
            Some(d) => tokio::time::timeout(d, self.stream.flush())
                .await
                .map_err(|_| TransportError::WriteTimeout)?
                .map_err(TransportError::Write),
            None => self.stream.flush().await.map_err(TransportError::Write),
        }
    }
}

/// Position of the `\r\n\r\n` terminating the response head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Appends `data` to `out`, keeping `out` within `limit` bytes (0 = no limit).
fn push_limited(out: &mut Vec<u8>, data: &[u8], limit: u64) {
    if limit == 0 {
        out.extend_from_slice(data);
        return;
    }
    let room = (limit as usize).saturating_sub(out.len());
    out.extend_from_slice(&data[..data.len().min(room)]);
}

/// Rebuilds `headers` with the final value for `name` replaced by `value`.
/// Only used on the cold line-folding path.
fn replace_last(headers: Headers, name: &str, value: String) -> Headers {
    let mut entries: Vec<(String, String)> = headers
        .iter()
        .map(|(n, v)| (n.to_string(), v.to_string()))
        .collect();
    if let Some(last) = entries
        .iter_mut()
        .rev()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
    {
        last.1 = value;
    }
    let mut rebuilt = Headers::new();
    for (n, v) in entries {
        rebuilt.append(n, v);
    }
    rebuilt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"HTTP/1.1 200 OK\r\n\r\nbody"), Some(15));
        assert_eq!(find_head_end(b"HTTP/1.1 200 OK\r\n"), None);
        assert_eq!(find_head_end(b""), None);
    }

    #[test]
    fn test_push_limited() {
        let mut out = Vec::new();
        push_limited(&mut out, b"hello", 3);
        assert_eq!(out, b"hel");
        push_limited(&mut out, b"more", 3);
        assert_eq!(out, b"hel");

        let mut unlimited = Vec::new();
        push_limited(&mut unlimited, b"hello", 0);
        assert_eq!(unlimited, b"hello");
    }
}
