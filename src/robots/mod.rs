//! robots.txt interpretation.
//!
//! The grammar itself is delegated to the `robotstxt` crate (a port of
//! Google's reference matcher); this module owns the surrounding policy: what
//! a fetch outcome for `/robots.txt` means for the URLs behind it.

use robotstxt::DefaultMatcher;

/// What a robots.txt fetch outcome allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RobotsVerdict {
    /// No usable rules; everything is allowed.
    AllowAll,
    /// The origin is off-limits entirely.
    DisallowAll,
    /// Rules were retrieved; consult the matcher per URL.
    Rules(String),
}

/// Maps a completed `/robots.txt` response to a verdict, following the
/// reference matcher's status-code semantics: 4xx (no robots file) allows
/// everything, 5xx (can't know the rules) disallows everything, and any other
/// non-2xx outcome is treated as absence of rules.
pub fn verdict_from_response(status_code: u16, body: &[u8]) -> Result<RobotsVerdict, String> {
    match status_code {
        200..=299 => {
            let content = std::str::from_utf8(body)
                .map_err(|e| format!("robots.txt is not valid UTF-8: {e}"))?;
            Ok(RobotsVerdict::Rules(content.to_string()))
        }
        400..=499 => Ok(RobotsVerdict::AllowAll),
        500..=599 => Ok(RobotsVerdict::DisallowAll),
        _ => Ok(RobotsVerdict::AllowAll),
    }
}

impl RobotsVerdict {
    /// Whether `agent` may fetch `url` under this verdict.
    pub fn allows(&self, agent: &str, url: &str) -> bool {
        match self {
            RobotsVerdict::AllowAll => true,
            RobotsVerdict::DisallowAll => false,
            RobotsVerdict::Rules(content) => {
                let mut matcher = DefaultMatcher::default();
                matcher.one_agent_allowed_by_robots(content, agent, url)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT: &str = "CrawlWorkerBot";

    #[test]
    fn test_rules_disallow_prefix() {
        let verdict =
            verdict_from_response(200, b"User-agent: *\nDisallow: /private\n").unwrap();
        assert!(!verdict.allows(AGENT, "http://h/private/page"));
        assert!(verdict.allows(AGENT, "http://h/public"));
    }

    #[test]
    fn test_agent_specific_group_wins() {
        let body = b"User-agent: CrawlWorkerBot\nDisallow: /\n\nUser-agent: *\nAllow: /\n";
        let verdict = verdict_from_response(200, body).unwrap();
        assert!(!verdict.allows(AGENT, "http://h/anything"));
        assert!(verdict.allows("OtherBot", "http://h/anything"));
    }

    #[test]
    fn test_missing_file_allows_all() {
        let verdict = verdict_from_response(404, b"ignored").unwrap();
        assert_eq!(verdict, RobotsVerdict::AllowAll);
        assert!(verdict.allows(AGENT, "http://h/anything"));
    }

    #[test]
    fn test_server_error_disallows_all() {
        let verdict = verdict_from_response(503, b"").unwrap();
        assert_eq!(verdict, RobotsVerdict::DisallowAll);
        assert!(!verdict.allows(AGENT, "http://h/anything"));
    }

    #[test]
    fn test_empty_rules_allow_all() {
        let verdict = verdict_from_response(200, b"").unwrap();
        assert!(verdict.allows(AGENT, "http://h/anything"));
    }

    #[test]
    fn test_invalid_utf8_is_parse_error() {
        assert!(verdict_from_response(200, &[0xff, 0xfe, 0x00]).is_err());
    }
}
