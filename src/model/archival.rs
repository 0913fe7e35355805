/// Observation records produced by probe tasks.
///
/// Every record is immutable once handed to the ledger. Times are seconds
/// relative to the start of the test: `t0` is when the operation started
/// and `t` is when it completed.
use std::collections::BTreeMap;
use std::net::IpAddr;

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Bytes that serialize as a string when they are valid UTF-8 and as a
/// base64 object otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaybeBinaryValue(pub Vec<u8>);

impl MaybeBinaryValue {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }
}

impl From<&str> for MaybeBinaryValue {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<Vec<u8>> for MaybeBinaryValue {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MaybeBinaryRepr {
    Text(String),
    Binary { format: String, data: String },
}

impl Serialize for MaybeBinaryValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match std::str::from_utf8(&self.0) {
            Ok(text) => MaybeBinaryRepr::Text(text.to_string()),
            Err(_) => MaybeBinaryRepr::Binary {
                format: "base64".to_string(),
                data: general_purpose::STANDARD.encode(&self.0),
            },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MaybeBinaryValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match MaybeBinaryRepr::deserialize(deserializer)? {
            MaybeBinaryRepr::Text(text) => Ok(Self(text.into_bytes())),
            MaybeBinaryRepr::Binary { format, data } => {
                if format != "base64" {
                    return Err(serde::de::Error::custom(format!(
                        "unsupported binary format: {format}"
                    )));
                }
                general_purpose::STANDARD
                    .decode(data)
                    .map(Self)
                    .map_err(serde::de::Error::custom)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkEvent {
    pub address: Option<String>,
    pub failure: Option<String>,
    pub num_bytes: Option<i64>,
    pub operation: String,
    pub proto: Option<String>,
    pub t0: f64,
    pub t: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub transaction_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsAnswer {
    pub answer_type: String,
    pub ipv4: Option<String>,
    pub ipv6: Option<String>,
    pub hostname: Option<String>,
    pub asn: i64,
    pub as_org_name: String,
    pub ttl: Option<u32>,
}

impl DnsAnswer {
    /// Parsed address of an A or AAAA answer.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.answer_type.as_str() {
            "A" => self.ipv4.as_deref()?.parse().ok(),
            "AAAA" => self.ipv6.as_deref()?.parse().ok(),
            _ => None,
        }
    }

    pub fn from_ip(ip: IpAddr, asn: i64) -> Self {
        match ip {
            IpAddr::V4(v4) => Self {
                answer_type: "A".to_string(),
                ipv4: Some(v4.to_string()),
                asn,
                ..Default::default()
            },
            IpAddr::V6(v6) => Self {
                answer_type: "AAAA".to_string(),
                ipv6: Some(v6.to_string()),
                asn,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsLookupResult {
    #[serde(default)]
    pub answers: Vec<DnsAnswer>,
    pub engine: String,
    pub failure: Option<String>,
    pub hostname: String,
    pub query_type: String,
    pub resolver_address: String,
    pub t0: f64,
    pub t: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub transaction_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpConnectStatus {
    pub blocked: Option<bool>,
    pub failure: Option<String>,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TcpConnectResult {
    pub ip: String,
    pub port: u16,
    pub status: TcpConnectStatus,
    pub t0: f64,
    pub t: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub transaction_id: Option<i64>,
}

impl TcpConnectResult {
    /// `ip:port`, with brackets around IPv6 addresses.
    pub fn endpoint(&self) -> String {
        format_endpoint(&self.ip, self.port)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsHandshakeResult {
    pub network: String,
    pub address: String,
    pub cipher_suite: String,
    pub failure: Option<String>,
    pub negotiated_protocol: String,
    pub no_tls_verify: bool,
    #[serde(default)]
    pub peer_certificates: Vec<MaybeBinaryValue>,
    pub server_name: String,
    pub t0: f64,
    pub t: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub tls_version: String,
    pub transaction_id: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: MaybeBinaryValue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub code: i64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: MaybeBinaryValue,
    pub body_is_truncated: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestResult {
    pub network: String,
    pub address: String,
    pub alpn: String,
    pub failure: Option<String>,
    pub request: HttpRequest,
    pub response: HttpResponse,
    pub t0: f64,
    pub t: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub transaction_id: Option<i64>,
}

pub fn format_endpoint(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{ip}]:{port}")
    } else {
        format!("{ip}:{port}")
    }
}
