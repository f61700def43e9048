//! Outbound proxy resolution from the environment.
//!
//! Honors `HTTP_PROXY`, `HTTPS_PROXY`, and `NO_PROXY` (and their lowercase
//! variants, which take precedence per long-standing convention). `NO_PROXY`
//! is a comma-separated list of host suffixes; `*` disables proxying
//! entirely.

use std::env;

use url::Url;

/// Where to dial instead of the origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Proxy {
    pub host: String,
    pub port: u16,
}

/// Resolves the proxy for a request to `host` over `scheme`, or `None` for a
/// direct connection.
pub(crate) fn proxy_for(scheme: &str, host: &str) -> Option<Proxy> {
    let raw = match scheme {
        "http" => env_first(&["http_proxy", "HTTP_PROXY"]),
        "https" => env_first(&["https_proxy", "HTTPS_PROXY"]),
        _ => None,
    }?;
    if raw.is_empty() || no_proxy_matches(host) {
        return None;
    }
    parse_proxy(&raw)
}

fn env_first(names: &[&str]) -> Option<String> {
    names.iter().find_map(|n| env::var(n).ok())
}

fn no_proxy_matches(host: &str) -> bool {
    let Some(list) = env_first(&["no_proxy", "NO_PROXY"]) else {
        return false;
    };
    for entry in list.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        if entry == "*" {
            return true;
        }
        let entry = entry.trim_start_matches('.');
        if host.eq_ignore_ascii_case(entry)
            || host
                .to_ascii_lowercase()
                .ends_with(&format!(".{}", entry.to_ascii_lowercase()))
        {
            return true;
        }
    }
    false
}

/// Accepts `http://proxy:3128`, `proxy:3128`, or a bare hostname.
fn parse_proxy(raw: &str) -> Option<Proxy> {
    let parsed = Url::parse(raw)
        .ok()
        .filter(|u| u.host_str().is_some())
        .or_else(|| Url::parse(&format!("http://{raw}")).ok())?;
    let host = parsed.host_str()?.to_string();
    let port = parsed.port().unwrap_or(3128);
    Some(Proxy { host, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proxy_forms() {
        assert_eq!(
            parse_proxy("http://proxy.internal:8080"),
            Some(Proxy {
                host: "proxy.internal".to_string(),
                port: 8080,
            })
        );
        assert_eq!(
            parse_proxy("proxy.internal:8080"),
            Some(Proxy {
                host: "proxy.internal".to_string(),
                port: 8080,
            })
        );
        assert_eq!(
            parse_proxy("proxy.internal"),
            Some(Proxy {
                host: "proxy.internal".to_string(),
                port: 3128,
            })
        );
    }

    // Environment-variable behavior is not unit-tested here: env vars are
    // process-global and the test harness runs tests concurrently.
}
