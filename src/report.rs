//! Report encoding: one JSON object per processed URL.
//!
//! The report is the worker's public wire format. The body travels as base64
//! so arbitrary bytes survive JSON; empty collections are omitted to keep
//! lines short. Encoding failures almost always live in the content, so the
//! recovery path retries once with the body elided before giving up.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::error;
use serde::Serialize;

use crate::worker::FetchResult;

/// JSON record for one input line.
#[derive(Debug, Serialize)]
pub struct Report {
    /// The raw input line, for downstream correlation
    pub key: String,
    pub url: String,
    pub success: bool,
    pub status: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Vec<String>>,
    /// Base64 of the body
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content: String,
    pub length: i64,
    pub cached: bool,
    /// RFC3339 UTC timestamp of when the fetch started
    pub started: String,
    pub fetch_time: u64,
    pub total_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_age: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_use: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_header_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_body_time: Option<u64>,
}

impl Report {
    /// Builds the report for `key` from a fetch outcome.
    pub fn from_result(key: &str, result: &FetchResult) -> Self {
        let stat = result.stat.as_ref();
        Report {
            key: key.to_string(),
            url: result.url.clone(),
            success: result.success,
            status: result.status.clone(),
            status_code: result.status_code,
            headers: result.headers.to_map(),
            content: if result.body.is_empty() {
                String::new()
            } else {
                BASE64.encode(&result.body)
            },
            length: result.length,
            cached: result.cached,
            started: result.started.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            fetch_time: result.fetch_time,
            total_time: result.total_time,
            address: stat.map(|s| s.remote_addr.clone()),
            connection_age: stat.map(|s| s.connection_age),
            connection_use: stat.map(|s| s.connection_use),
            connect_time: stat.map(|s| s.connect_time),
            write_time: stat.map(|s| s.write_time),
            read_header_time: stat.map(|s| s.read_header_time),
            read_body_time: stat.map(|s| s.read_body_time),
        }
    }

    /// Replaces this report with a minimal error record that should always
    /// encode: no content, the encoder failure as the status.
    fn elide_for_recovery(&mut self, encode_err: &serde_json::Error) {
        self.content = String::new();
        self.status = encode_err.to_string();
        self.success = false;
        self.status_code = 0;
    }
}

/// Encodes one report line (no trailing newline).
///
/// On an encoding failure, retries once with the body elided and the failure
/// recorded in `status`; if even that fails, logs to stderr and returns
/// `None` — the record is dropped, which the caller must treat as final.
pub fn encode_report(key: &str, result: &FetchResult) -> Option<Vec<u8>> {
    let mut report = Report::from_result(key, result);
    match serde_json::to_vec(&report) {
        Ok(encoded) => Some(encoded),
        Err(err) => {
            error!("url {}: error encoding report: {err}", result.url);
            report.elide_for_recovery(&err);
            match serde_json::to_vec(&report) {
                Ok(encoded) => Some(encoded),
                Err(err) => {
                    error!(
                        "url {}: error encoding recovery report: {err}",
                        result.url
                    );
                    None
                }
            }
        }
    }
}
