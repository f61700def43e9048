//! HTTP transport: connection pooling and request round-trips.
//!
//! One `Transport` is shared by every fetch task in the process. It keeps a
//! small pool of idle keep-alive connections keyed by `(scheme, host:port)`
//! and round-trips requests over a reused or freshly dialed connection. All
//! locking is confined to pool bookkeeping; no lock is ever held across I/O,
//! so concurrent `round_trip` calls only contend for microseconds.

mod conn;
mod error;
mod headers;
mod proxy;

pub use conn::{Connection, PhaseTimings};
pub use error::TransportError;
pub use headers::Headers;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use url::Url;

use crate::config::MAX_IDLE_PER_HOST;

/// An outbound HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Request {
    /// A bodyless GET for `url`.
    pub fn get(url: Url) -> Self {
        Request {
            method: "GET".to_string(),
            url,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }
}

/// Per-round-trip knobs. `None` / `0` disable the corresponding limit.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Deadline for establishing the connection (TCP, proxy tunnel, TLS)
    pub connect_timeout: Option<Duration>,
    /// Deadline for each write of request bytes
    pub write_timeout: Option<Duration>,
    /// Deadline for each read of response bytes
    pub read_timeout: Option<Duration>,
    /// Hard cap on stored response body bytes; excess is truncated silently
    pub read_limit: u64,
    /// Idle TTL when the connection is returned to the pool;
    /// `Some(Duration::ZERO)` disables pooling for this round-trip
    pub keep_alive: Option<Duration>,
}

/// Connection-level observability attached to every response.
#[derive(Debug, Clone, Copy)]
pub struct ConnStat {
    /// Peer address the response came from
    pub remote_addr: SocketAddr,
    /// Age of the connection when the round-trip finished
    pub connection_age: Duration,
    /// How many round-trips this connection has served, including this one
    pub connection_use: u32,
    /// Per-phase wall times for this round-trip
    pub timings: PhaseTimings,
}

/// A fully-read HTTP response.
#[derive(Debug)]
pub struct Response {
    pub status_code: u16,
    /// Reason phrase from the status line (may be empty)
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub stat: ConnStat,
}

type PoolKey = (String, String);

struct IdleConn {
    conn: Connection,
    expires_at: Option<Instant>,
}

impl IdleConn {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }
}

/// Shared connection pool and round-trip engine.
pub struct Transport {
    pool: Mutex<HashMap<PoolKey, Vec<IdleConn>>>,
    max_idle_per_host: usize,
    tls: TlsConnector,
}

impl Transport {
    pub fn new() -> Self {
        // Installing twice is harmless; whoever wins, a provider is in place
        // before the first handshake.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Transport {
            pool: Mutex::new(HashMap::new()),
            max_idle_per_host: MAX_IDLE_PER_HOST,
            tls: TlsConnector::from(Arc::new(tls_config)),
        }
    }

    /// Performs one request/response exchange.
    ///
    /// Reuses an unexpired idle connection for the request's origin when one
    /// exists, dialing otherwise. A request that fails on a reused connection
    /// before any response byte is parsed is retried once on a fresh
    /// connection, but only when it carries no body — the peer may have
    /// consumed part of it. Connections are pooled again only after the
    /// response body was drained to its framed end.
    pub async fn round_trip(
        &self,
        req: &Request,
        options: &RequestOptions,
    ) -> Result<Response, TransportError> {
        let scheme = req.url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(TransportError::Protocol(format!(
                "unsupported scheme {scheme:?}"
            )));
        }
        let host = req
            .url
            .host_str()
            .ok_or_else(|| TransportError::Protocol("request URL has no host".to_string()))?
            .to_string();
        let port = req
            .url
            .port_or_known_default()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        let key: PoolKey = (scheme.clone(), format!("{host}:{port}"));
        let proxy = proxy::proxy_for(&scheme, &host);

        for attempt in 0..2u8 {
            let (mut conn, reused) = match self.checkout(&key) {
                Some(conn) => {
                    trace!("reusing idle connection to {}:{}", host, port);
                    (conn, true)
                }
                None => (
                    self.open(&scheme, &host, port, proxy.as_ref(), options)
                        .await?,
                    false,
                ),
            };
            conn.begin_use();

            let absolute_form = proxy.is_some() && scheme == "http";
            let head = build_request_head(req, &host, port, absolute_form);

            let result = async {
                conn.write_request(&head, &req.body, options.write_timeout)
                    .await?;
                conn.read_response(
                    options.read_timeout,
                    options.read_limit,
                    req.method.eq_ignore_ascii_case("HEAD"),
                )
                .await
            }
            .await;

            match result {
                Ok(parts) => {
                    let stat = ConnStat {
                        remote_addr: conn.remote_addr(),
                        connection_age: conn.age(),
                        connection_use: conn.use_count(),
                        timings: conn.timings(),
                    };
                    if conn.is_reusable() {
                        self.park(key, conn, options);
                    }
                    return Ok(Response {
                        status_code: parts.status_code,
                        reason: parts.reason,
                        headers: parts.headers,
                        body: parts.body,
                        stat,
                    });
                }
                Err(err) => {
                    // The connection is dropped (closed) in every error path.
                    let retriable = reused
                        && attempt == 0
                        && req.body.is_empty()
                        && err.before_response();
                    if retriable {
                        debug!(
                            "stale pooled connection to {host}:{port} ({err}), retrying fresh"
                        );
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        unreachable!("round_trip loop exits via return")
    }

    /// Drops idle connections past their TTL. Called periodically so an idle
    /// worker does not pin sockets open.
    pub fn sweep_idle(&self) {
        let now = Instant::now();
        let mut pool = self.pool.lock().unwrap();
        pool.retain(|_, list| {
            list.retain(|idle| !idle.expired(now));
            !list.is_empty()
        });
    }

    /// Number of idle connections currently pooled.
    pub fn idle_count(&self) -> usize {
        self.pool.lock().unwrap().values().map(Vec::len).sum()
    }

    fn checkout(&self, key: &PoolKey) -> Option<Connection> {
        let mut pool = self.pool.lock().unwrap();
        let list = pool.get_mut(key)?;
        let now = Instant::now();
        let mut found = None;
        while let Some(idle) = list.pop() {
            if !idle.expired(now) {
                found = Some(idle.conn);
                break;
            }
            trace!("dropping expired idle connection to {}", key.1);
        }
        if list.is_empty() {
            pool.remove(key);
        }
        found
    }

    fn park(&self, key: PoolKey, conn: Connection, options: &RequestOptions) {
        if options.keep_alive == Some(Duration::ZERO) {
            return;
        }
        let expires_at = options.keep_alive.map(|ttl| Instant::now() + ttl);
        let mut pool = self.pool.lock().unwrap();
        let list = pool.entry(key).or_default();
        if list.len() < self.max_idle_per_host {
            list.push(IdleConn { conn, expires_at });
        }
    }

    /// Dials a new connection to the origin (possibly through a proxy),
    /// bounded as a whole by `connect_timeout`.
    async fn open(
        &self,
        scheme: &str,
        host: &str,
        port: u16,
        proxy: Option<&proxy::Proxy>,
        options: &RequestOptions,
    ) -> Result<Connection, TransportError> {
        let label = format!("{host}:{port}");
        let started = Instant::now();

        let dial = async {
            let (dial_host, dial_port) = match proxy {
                Some(p) => (p.host.as_str(), p.port),
                None => (host.trim_start_matches('[').trim_end_matches(']'), port),
            };
            let mut conn = Connection::dial_tcp(dial_host, dial_port)
                .await
                .map_err(|source| TransportError::Dial {
                    addr: label.clone(),
                    source,
                })?;

            if scheme == "https" {
                if proxy.is_some() {
                    conn.connect_tunnel(&label).await?;
                }
                let server_name = ServerName::try_from(host.to_string()).map_err(|_| {
                    TransportError::Dial {
                        addr: label.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            format!("invalid TLS server name: {host}"),
                        ),
                    }
                })?;
                conn = conn
                    .upgrade_tls(&self.tls, server_name)
                    .await
                    .map_err(|source| TransportError::Dial {
                        addr: label.clone(),
                        source,
                    })?;
            }
            Ok(conn)
        };

        let mut conn = match options.connect_timeout.filter(|d| !d.is_zero()) {
            Some(limit) => tokio::time::timeout(limit, dial)
                .await
                .map_err(|_| TransportError::DialTimeout(label.clone()))??,
            None => dial.await?,
        };
        conn.set_connect_time(started.elapsed());
        Ok(conn)
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes the request line and header block.
fn build_request_head(req: &Request, host: &str, port: u16, absolute_form: bool) -> Vec<u8> {
    let target = if absolute_form {
        req.url.as_str().to_string()
    } else {
        let mut t = req.url.path().to_string();
        if let Some(q) = req.url.query() {
            t.push('?');
            t.push_str(q);
        }
        t
    };

    let default_port = matches!((req.url.scheme(), port), ("http", 80) | ("https", 443));
    let host_value = if default_port {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };

    let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", req.method, target, host_value);
    for (name, value) in req.headers.iter() {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    if !req.body.is_empty() {
        head.push_str(&format!("Content-Length: {}\r\n", req.body.len()));
    }
    head.push_str("\r\n");
    head.into_bytes()
}
