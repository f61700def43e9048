//! Fetch policy: robots consultation, redirect following, result assembly.
//!
//! `Worker` sits on top of the transport and turns "fetch this URL" into a
//! complete, reportable outcome. Network and policy failures never escape as
//! errors — they are folded into a `FetchResult` with `success = false` so
//! the dispatcher can keep going.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::debug;
use url::Url;

use crate::config::{Config, ROBOTS_AGENT};
use crate::limits::LimitMap;
use crate::robots::verdict_from_response;
use crate::transport::{Headers, Request, RequestOptions, Transport};

/// Connection-level detail for a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchStat {
    pub remote_addr: String,
    pub connection_age: u64,
    pub connection_use: u32,
    pub connect_time: u64,
    pub write_time: u64,
    pub read_header_time: u64,
    pub read_body_time: u64,
}

/// Outcome of fetching one URL, through all redirects.
///
/// On failure `status` carries a human-readable reason and `status_code` is 0.
#[derive(Debug)]
pub struct FetchResult {
    /// Final URL (after redirects), or the URL the failure is reported against
    pub url: String,
    pub success: bool,
    /// `"200 OK"`-style status, or an error description
    pub status: String,
    pub status_code: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
    /// Body length before any `skip_body` discard
    pub length: i64,
    pub cached: bool,
    /// When this fetch started, UTC
    pub started: DateTime<Utc>,
    /// Milliseconds spent on the last hop
    pub fetch_time: u64,
    /// Milliseconds spent on the whole redirect chain
    pub total_time: u64,
    pub stat: Option<FetchStat>,
}

impl FetchResult {
    /// A failure result carrying only the reason.
    pub fn error(url: impl Into<String>, reason: impl Into<String>) -> Self {
        FetchResult {
            url: url.into(),
            success: false,
            status: reason.into(),
            status_code: 0,
            headers: Headers::new(),
            body: Vec::new(),
            length: 0,
            cached: false,
            started: Utc::now(),
            fetch_time: 0,
            total_time: 0,
            stat: None,
        }
    }
}

/// True for the redirect statuses the fetch loop follows.
pub fn is_redirect(status_code: u16) -> bool {
    matches!(status_code, 301 | 302 | 303 | 307)
}

/// Per-origin concurrency key: `host:port`.
fn host_key(url: &Url) -> String {
    format!(
        "{}:{}",
        url.host_str().unwrap_or(""),
        url.port_or_known_default().unwrap_or(0)
    )
}

fn origin_key(url: &Url) -> String {
    format!("{}://{}", url.scheme(), host_key(url))
}

/// The fetch policy engine.
pub struct Worker {
    config: Config,
    transport: Arc<Transport>,
    limits: Arc<LimitMap>,
}

impl Worker {
    pub fn new(config: Config, transport: Arc<Transport>) -> Self {
        Worker {
            config,
            transport,
            limits: Arc::new(LimitMap::new()),
        }
    }

    /// Per-host limit state, exposed for observability.
    pub fn limits(&self) -> &Arc<LimitMap> {
        &self.limits
    }

    /// Fetches `url`, obeying robots.txt and following redirects up to the
    /// configured bound, all under the configured per-URL ceiling.
    pub async fn fetch(&self, url: &Url) -> FetchResult {
        let started_wall = Utc::now();
        let started = Instant::now();
        let deadline =
            (!self.config.fetch_timeout.is_zero()).then(|| started + self.config.fetch_timeout);

        let mut result = self.fetch_chain(url, deadline).await;
        result.started = started_wall;
        result.total_time = started.elapsed().as_millis() as u64;
        result
    }

    /// The redirect-following loop. Robots is consulted once per distinct
    /// origin encountered in the chain, not once per hop.
    async fn fetch_chain(&self, url: &Url, deadline: Option<Instant>) -> FetchResult {
        let original = url.clone();
        let mut current = url.clone();
        let mut robots_cleared: HashSet<String> = HashSet::new();
        let mut hop: u32 = 0;

        loop {
            if !matches!(current.scheme(), "http" | "https") || current.host_str().is_none() {
                return FetchResult::error(
                    current.as_str(),
                    format!("Incorrect URL: {current}"),
                );
            }

            // /robots.txt itself is always allowed; that is also what stops
            // the robots fetch from consulting robots recursively.
            if !self.config.skip_robots && current.path() != "/robots.txt" {
                let origin = origin_key(&current);
                if !robots_cleared.contains(&origin) {
                    if let Err(denied) = self.ask_robots(&current, deadline).await {
                        return *denied;
                    }
                    robots_cleared.insert(origin);
                }
            }

            let result = self.download(&current, deadline).await;

            if result.success && is_redirect(result.status_code) && hop < self.config.follow_redirects
            {
                let location = result.headers.get("Location").unwrap_or("").to_string();
                if location.is_empty() {
                    return FetchResult::error(
                        original.as_str(),
                        "redirect without Location header",
                    );
                }
                match current.join(&location) {
                    Ok(next) => {
                        debug!("redirect {current} -> {next}");
                        hop += 1;
                        current = next;
                        continue;
                    }
                    Err(err) => {
                        return FetchResult::error(
                            original.as_str(),
                            format!("invalid redirect location {location:?}: {err}"),
                        );
                    }
                }
            }

            return result;
        }
    }

    /// Downloads one URL with no redirect following and no robots check,
    /// holding a per-host slot for the duration of the round-trip.
    async fn download(&self, url: &Url, deadline: Option<Instant>) -> FetchResult {
        let started = Instant::now();

        let mut req = Request::get(url.clone());
        req.headers
            .append("User-Agent", self.config.user_agent.clone());

        let options = RequestOptions {
            connect_timeout: non_zero(self.config.connect_timeout),
            write_timeout: non_zero(self.config.io_timeout),
            read_timeout: non_zero(self.config.io_timeout),
            read_limit: self.config.read_limit,
            keep_alive: Some(self.config.keep_alive),
        };

        let key = host_key(url);
        let round_trip = async {
            let _slot = self
                .limits
                .acquire(&key, self.config.domain_concurrency)
                .await;
            self.transport.round_trip(&req, &options).await
        };

        // The outer ceiling aborts the in-flight round-trip by dropping it,
        // which closes the socket (SO_LINGER=0: the peer sees a reset).
        let outcome = match deadline {
            Some(d) => {
                match tokio::time::timeout(d.saturating_duration_since(Instant::now()), round_trip)
                    .await
                {
                    Ok(outcome) => Some(outcome),
                    Err(_) => None,
                }
            }
            None => Some(round_trip.await),
        };

        let mut result = match outcome {
            None => FetchResult::error(
                url.as_str(),
                format!("Fetch timeout: {}", self.config.fetch_timeout.as_millis()),
            ),
            Some(Err(err)) => FetchResult::error(url.as_str(), err.to_string()),
            Some(Ok(resp)) => {
                let length = resp.body.len() as i64;
                // Robots bodies are exempt from skip_body: the rules are the
                // whole point of that fetch.
                let body = if self.config.skip_body && url.path() != "/robots.txt" {
                    Vec::new()
                } else {
                    resp.body
                };
                let status = if resp.reason.is_empty() {
                    resp.status_code.to_string()
                } else {
                    format!("{} {}", resp.status_code, resp.reason)
                };
                FetchResult {
                    url: url.to_string(),
                    success: true,
                    status,
                    status_code: resp.status_code,
                    headers: resp.headers,
                    body,
                    length,
                    cached: false,
                    started: Utc::now(),
                    fetch_time: 0,
                    total_time: 0,
                    stat: Some(FetchStat {
                        remote_addr: resp.stat.remote_addr.to_string(),
                        connection_age: resp.stat.connection_age.as_millis() as u64,
                        connection_use: resp.stat.connection_use,
                        connect_time: resp.stat.timings.connect.as_millis() as u64,
                        write_time: resp.stat.timings.write.as_millis() as u64,
                        read_header_time: resp.stat.timings.read_header.as_millis() as u64,
                        read_body_time: resp.stat.timings.read_body.as_millis() as u64,
                    }),
                }
            }
        };
        result.fetch_time = started.elapsed().as_millis() as u64;
        result
    }

    /// Fetches and evaluates robots.txt for `url`'s origin. `Ok(())` means
    /// the fetch may proceed; `Err` carries the result to report instead.
    async fn ask_robots(&self, url: &Url, deadline: Option<Instant>) -> Result<(), Box<FetchResult>> {
        let mut robots_url = url.clone();
        robots_url.set_path("/robots.txt");
        robots_url.set_query(None);
        robots_url.set_fragment(None);

        // Boxed: fetch_chain -> ask_robots -> fetch_chain is recursive.
        let mut fetched = Box::pin(self.fetch_chain(&robots_url, deadline)).await;

        if !fetched.success {
            fetched.status = format!("Robots download error: {}", fetched.status);
            return Err(Box::new(fetched));
        }

        match verdict_from_response(fetched.status_code, &fetched.body) {
            Ok(verdict) => {
                if verdict.allows(self.robots_agent(), url.as_str()) {
                    Ok(())
                } else {
                    Err(Box::new(FetchResult::error(url.as_str(), "Robots disallow")))
                }
            }
            Err(parse_err) => {
                fetched.success = false;
                fetched.status = format!("Robots parse error: {parse_err}");
                Err(Box::new(fetched))
            }
        }
    }

    /// Product token the robots matcher groups rules under: the User-Agent up
    /// to the first `/`.
    fn robots_agent(&self) -> &str {
        match self.config.user_agent.split('/').next() {
            Some(token) if !token.is_empty() => token,
            _ => ROBOTS_AGENT,
        }
    }
}

fn non_zero(d: std::time::Duration) -> Option<std::time::Duration> {
    (!d.is_zero()).then_some(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_status_classification() {
        for code in [301, 302, 303, 307] {
            assert!(is_redirect(code), "{code} should redirect");
        }
        for code in [200, 204, 300, 304, 308, 404, 500] {
            assert!(!is_redirect(code), "{code} should not redirect");
        }
    }

    #[test]
    fn test_host_key_includes_port() {
        let url = Url::parse("http://example.com/a").unwrap();
        assert_eq!(host_key(&url), "example.com:80");
        let url = Url::parse("https://example.com:8443/a").unwrap();
        assert_eq!(host_key(&url), "example.com:8443");
    }

    #[test]
    fn test_origin_key_distinguishes_schemes() {
        let http = Url::parse("http://example.com/").unwrap();
        let https = Url::parse("https://example.com/").unwrap();
        assert_ne!(origin_key(&http), origin_key(&https));
    }

    #[test]
    fn test_error_result_shape() {
        let result = FetchResult::error("http://h/x", "Robots disallow");
        assert!(!result.success);
        assert_eq!(result.status, "Robots disallow");
        assert_eq!(result.status_code, 0);
        assert!(result.headers.is_empty());
        assert!(result.stat.is_none());
    }

    #[tokio::test]
    async fn test_fetch_rejects_hostless_url() {
        let worker = Worker::new(Config::default(), Arc::new(Transport::new()));
        let url = Url::parse("mailto:someone@example.com").unwrap();
        let result = worker.fetch(&url).await;
        assert!(!result.success);
        assert!(result.status.starts_with("Incorrect URL:"));
        assert_eq!(result.status_code, 0);
    }
}
