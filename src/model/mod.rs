pub mod archival;
pub mod control;

pub use archival::{
    DnsAnswer, DnsLookupResult, HttpRequest, HttpRequestResult, HttpResponse, MaybeBinaryValue,
    NetworkEvent, TcpConnectResult, TcpConnectStatus, TlsHandshakeResult,
};
pub use control::{
    ControlDnsResult, ControlHttpRequestResult, ControlIpInfo, ControlRequest, ControlResponse,
    ControlTcpConnectResult, ControlTlsHandshakeResult, TestHelper,
};
