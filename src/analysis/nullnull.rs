//! Fallbacks for when both blocking and accessible came out undetermined.
//!
//! Such a result tells the analyst nothing, so weaker evidence is used to
//! settle at least one of the two. Each rule that fires records a bit in
//! `x_null_null_flags`.

use crate::config::NullNullRules;
use crate::flags::{DnsFlag, NullNullFlag};
use crate::ledger::TestKeys;
use crate::model::ControlResponse;
use crate::verdict::{Accessibility, BlockingReason};

use super::dns::DnsAnalysis;
use super::http::HttpAnalysis;
use super::tcp::TcpAnalysis;
use super::Classification;

pub(super) struct Evidence<'a> {
    pub tk: &'a TestKeys,
    pub control: Option<&'a ControlResponse>,
    pub dns: &'a DnsAnalysis,
    pub tcp: &'a TcpAnalysis,
    pub http: &'a HttpAnalysis,
}

pub(super) fn avoid(c: &mut Classification, ev: &Evidence<'_>, rules: &NullNullRules) {
    if c.blocking != BlockingReason::Undetermined || c.accessible != Accessibility::Undetermined {
        return;
    }
    let has_control = ev.control.is_some();

    if rules.expected_dns_lookup_failure
        && has_control
        && ev.dns.probe_lookup_failed
        && ev.dns.control_failed
    {
        website_down(c, NullNullFlag::ExpectedDnsLookupFailure);
        return;
    }

    if rules.expected_tcp_connect_failure && has_control && ev.tcp.tcp_expected_failure {
        website_down(c, NullNullFlag::ExpectedTcpConnectFailure);
        return;
    }

    if rules.expected_tls_handshake_failure && has_control && ev.tcp.tls_expected_failure {
        website_down(c, NullNullFlag::ExpectedTlsHandshakeFailure);
        return;
    }

    // A verified TLS session cannot have been tampered with.
    let verified_tls = ev
        .tk
        .tls_handshakes
        .iter()
        .any(|h| h.failure.is_none() && !h.no_tls_verify);
    if rules.successful_https && ev.http.final_is_https && ev.http.probe_succeeded && verified_tls {
        c.null_null_flags.insert(NullNullFlag::SuccessfulHttps);
        c.blocking = BlockingReason::NotBlocked;
        c.accessible = Accessibility::Accessible;
        return;
    }

    let dns_anomaly = c.dns_flags.iter().any(|f| f != DnsFlag::ResolverIntercepted);
    if rules.anomaly_without_verdict && (dns_anomaly || !c.blocking_flags.is_empty()) {
        c.null_null_flags.insert(NullNullFlag::AnomalyWithoutVerdict);
        c.accessible = Accessibility::NotAccessible;
    }
}

fn website_down(c: &mut Classification, flag: NullNullFlag) {
    c.null_null_flags.insert(flag);
    c.blocking = BlockingReason::NotBlocked;
    c.accessible = Accessibility::NotAccessible;
}
