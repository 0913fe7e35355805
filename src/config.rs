use std::time::Duration;

use serde::Deserialize;

/// Headers that vary between vantage points for reasons unrelated to
/// censorship. They are left out of the header comparison.
pub const VOLATILE_HEADERS: &[&str] = &[
    "accept-ranges",
    "age",
    "cache-control",
    "cf-ray",
    "connection",
    "content-encoding",
    "content-language",
    "content-length",
    "content-type",
    "date",
    "etag",
    "expires",
    "keep-alive",
    "last-modified",
    "link",
    "location",
    "p3p",
    "pragma",
    "server",
    "set-cookie",
    "strict-transport-security",
    "transfer-encoding",
    "vary",
    "via",
    "x-cache",
    "x-content-type-options",
    "x-frame-options",
    "x-powered-by",
    "x-varnish",
    "x-xss-protection",
];

pub const DEFAULT_WHOAMI_DOMAIN: &str = "whoami.v4.powerdns.org";

pub const DEFAULT_UDP_RESOLVERS: &[&str] = &["8.8.8.8:53", "8.8.4.4:53", "1.1.1.1:53", "1.0.0.1:53"];

/// Top-level configuration of the web connectivity core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebConnectivityConfig {
    pub analysis: AnalysisConfig,
    pub arbiter: ArbiterConfig,
    pub whoami: WhoamiConfig,
}

/// Thresholds used by the classifier.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Bodies match when `min(len) / max(len)` is at least this ratio.
    pub body_length_ratio: f64,
    /// Lowercase header names ignored by the header comparison.
    pub ignored_headers: Vec<String>,
    pub null_null: NullNullRules,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            body_length_ratio: 0.1,
            ignored_headers: VOLATILE_HEADERS.iter().map(|h| h.to_string()).collect(),
            null_null: NullNullRules::default(),
        }
    }
}

/// Switches for the individual undetermined-avoidance rules.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NullNullRules {
    pub expected_dns_lookup_failure: bool,
    pub expected_tcp_connect_failure: bool,
    pub expected_tls_handshake_failure: bool,
    pub successful_https: bool,
    pub anomaly_without_verdict: bool,
}

impl Default for NullNullRules {
    fn default() -> Self {
        Self {
            expected_dns_lookup_failure: true,
            expected_tcp_connect_failure: true,
            expected_tls_handshake_failure: true,
            successful_https: true,
            anomaly_without_verdict: true,
        }
    }
}

/// Connection racing policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    /// How long to wait after the first ready connection for contenders
    /// that became ready at the same time.
    pub grace_window_ms: u64,
}

impl ArbiterConfig {
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self { grace_window_ms: 10 }
    }
}

/// Resolver identity probing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WhoamiConfig {
    pub domain: String,
    /// Public resolvers, `ip:port`, queried over UDP for their identity.
    pub udp_resolvers: Vec<String>,
}

impl Default for WhoamiConfig {
    fn default() -> Self {
        Self {
            domain: DEFAULT_WHOAMI_DOMAIN.to_string(),
            udp_resolvers: DEFAULT_UDP_RESOLVERS.iter().map(|r| r.to_string()).collect(),
        }
    }
}
