/// Control (test helper) request and response.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What we asked the test helper to measure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub http_request: String,
    #[serde(default)]
    pub http_request_headers: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub tcp_connect: Vec<String>,
    #[serde(default)]
    pub x_quic_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlTcpConnectResult {
    pub status: bool,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlTlsHandshakeResult {
    pub server_name: String,
    pub status: bool,
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlHttpRequestResult {
    pub body_length: i64,
    pub failure: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub status_code: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlDnsResult {
    pub failure: Option<String>,
    #[serde(default)]
    pub addrs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlIpInfo {
    pub asn: i64,
    pub flags: i64,
}

/// The test helper's view of the target, assumed unblocked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Keyed by `ip:port`.
    #[serde(default)]
    pub tcp_connect: BTreeMap<String, ControlTcpConnectResult>,
    #[serde(default)]
    pub tls_handshake: BTreeMap<String, ControlTlsHandshakeResult>,
    #[serde(default)]
    pub http_request: ControlHttpRequestResult,
    #[serde(default)]
    pub dns: ControlDnsResult,
    #[serde(default)]
    pub ip_info: BTreeMap<String, ControlIpInfo>,
}

impl ControlResponse {
    pub fn http_succeeded(&self) -> bool {
        self.http_request.failure.is_none() && self.http_request.status_code > 0
    }

    pub fn any_tcp_reachable(&self) -> bool {
        self.tcp_connect.values().any(|r| r.status)
    }
}

/// A test helper endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestHelper {
    pub address: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub front: Option<String>,
}
