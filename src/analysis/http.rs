use std::collections::{BTreeMap, BTreeSet};

use lazy_static::lazy_static;
use regex::Regex;

use crate::config::AnalysisConfig;
use crate::ledger::TestKeys;
use crate::model::{ControlResponse, HttpRequestResult};

lazy_static! {
    static ref TITLE_RE: Regex = Regex::new(r"(?is)<title[^>]*>(.*?)</title>")
        .unwrap_or_else(|err| unreachable!("title pattern is valid: {err}"));
}

#[derive(Debug, Clone, Default)]
pub struct HttpAnalysis {
    pub probe_succeeded: bool,
    pub probe_failure: Option<String>,
    pub control_succeeded: bool,
    pub final_is_https: bool,
    pub body_length_match: Option<bool>,
    pub headers_match: Option<bool>,
    pub status_code_match: Option<bool>,
    pub title_match: Option<bool>,
}

impl HttpAnalysis {
    fn comparisons(&self) -> [Option<bool>; 4] {
        [
            self.status_code_match,
            self.body_length_match,
            self.headers_match,
            self.title_match,
        ]
    }

    /// Both sides answered and at least one comparison diverged.
    pub fn diff(&self) -> bool {
        self.probe_succeeded
            && self.control_succeeded
            && self.comparisons().iter().any(|m| *m == Some(false))
    }

    /// Both sides answered and nothing diverged.
    pub fn matched(&self) -> bool {
        self.probe_succeeded && self.control_succeeded && !self.diff()
    }

    /// The probe's exchange failed where the control's succeeded.
    pub fn unexpected_failure(&self) -> bool {
        self.probe_failure.is_some() && self.control_succeeded
    }
}

pub fn analyze(
    tk: &TestKeys,
    control: Option<&ControlResponse>,
    config: &AnalysisConfig,
) -> HttpAnalysis {
    let mut out = HttpAnalysis::default();

    // Requests are most recent first: the head is the last redirect hop.
    let last: &HttpRequestResult = match tk.requests.first() {
        Some(r) => r,
        None => return out,
    };
    out.final_is_https = last.request.url.to_ascii_lowercase().starts_with("https://");
    out.probe_failure = last.failure.clone();
    out.probe_succeeded = last.failure.is_none() && last.response.code > 0;

    let control = match control {
        Some(control) if control.http_succeeded() => control,
        _ => return out,
    };
    out.control_succeeded = true;
    if !out.probe_succeeded {
        return out;
    }

    let expected = &control.http_request;
    out.status_code_match = Some(last.response.code == expected.status_code);
    out.body_length_match = body_length_match(
        last.response.body.len() as i64,
        last.response.body_is_truncated,
        expected.body_length,
        config.body_length_ratio,
    );
    out.headers_match = headers_match(
        &last.response.headers,
        &expected.headers,
        &config.ignored_headers,
    );
    out.title_match = match last.response.body.as_text().and_then(extract_title) {
        Some(title) if !expected.title.trim().is_empty() => {
            Some(normalize_title(&title) == normalize_title(&expected.title))
        }
        _ => None,
    };
    out
}

fn body_length_match(probe: i64, truncated: bool, control: i64, ratio: f64) -> Option<bool> {
    if probe <= 0 || control <= 0 {
        return None;
    }
    // A truncated body shorter than the control's tells us nothing.
    if truncated && probe < control {
        return None;
    }
    let (small, large) = if probe < control {
        (probe, control)
    } else {
        (control, probe)
    };
    Some(small as f64 / large as f64 >= ratio)
}

fn header_names(headers: &BTreeMap<String, String>, ignored: &[String]) -> BTreeSet<String> {
    headers
        .keys()
        .map(|k| k.to_ascii_lowercase())
        .filter(|k| !ignored.iter().any(|i| i == k))
        .collect()
}

fn headers_match(
    probe: &BTreeMap<String, String>,
    control: &BTreeMap<String, String>,
    ignored: &[String],
) -> Option<bool> {
    if probe.is_empty() || control.is_empty() {
        return None;
    }
    Some(header_names(probe, ignored) == header_names(control, ignored))
}

pub fn extract_title(body: &str) -> Option<String> {
    TITLE_RE
        .captures(body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .filter(|t| !t.trim().is_empty())
}

fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
