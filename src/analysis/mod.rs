//! Turns the frozen test keys and the control reference into a verdict.
//!
//! Everything here is a pure function of its inputs. `build.rs` rejects
//! clocks, I/O and async runtimes in this directory.

pub mod dns;
pub mod http;
mod nullnull;
pub mod tcp;

use url::Url;

use crate::config::AnalysisConfig;
use crate::flags::{BlockingFlag, BlockingFlags, DnsFlag, DnsFlags, NullNullFlags};
use crate::ledger::TestKeys;
use crate::verdict::{Accessibility, BlockingReason, DnsConsistency};

use self::nullnull::Evidence;

/// Output of the classifier, computed once per measurement.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Classification {
    pub dns_consistency: DnsConsistency,
    pub dns_flags: DnsFlags,
    pub dns_experiment_failure: Option<String>,
    pub http_experiment_failure: Option<String>,
    pub blocking_flags: BlockingFlags,
    pub null_null_flags: NullNullFlags,
    pub body_length_match: Option<bool>,
    pub headers_match: Option<bool>,
    pub status_code_match: Option<bool>,
    pub title_match: Option<bool>,
    pub blocking: BlockingReason,
    pub accessible: Accessibility,
}

pub fn classify(tk: &TestKeys, target: &Url, config: &AnalysisConfig) -> Classification {
    // A recorded control failure wins over a partially filled response.
    let control = match tk.control_failure {
        Some(_) => None,
        None => tk.control.as_ref(),
    };

    let dns = dns::analyze(tk, target, control);
    let tcp = tcp::analyze(tk, control);
    let http = http::analyze(tk, control, config);

    let mut c = Classification {
        dns_consistency: dns.consistency,
        dns_flags: dns.flags,
        dns_experiment_failure: dns.probe_failure.clone(),
        http_experiment_failure: http.probe_failure.clone(),
        body_length_match: http.body_length_match,
        headers_match: http.headers_match,
        status_code_match: http.status_code_match,
        title_match: http.title_match,
        ..Default::default()
    };

    if control.is_some() {
        c.blocking = select_reason(&dns, &tcp, &http, &mut c.blocking_flags);
    }
    c.accessible = if c.blocking == BlockingReason::NotBlocked {
        Accessibility::Accessible
    } else if c.blocking.is_blocked() {
        Accessibility::NotAccessible
    } else {
        Accessibility::Undetermined
    };

    let evidence = Evidence {
        tk,
        control,
        dns: &dns,
        tcp: &tcp,
        http: &http,
    };
    nullnull::avoid(&mut c, &evidence, &config.null_null);
    c
}

/// Records every piece of evidence and returns the highest priority one.
fn select_reason(
    dns: &dns::DnsAnalysis,
    tcp: &tcp::TcpAnalysis,
    http: &http::HttpAnalysis,
    flags: &mut BlockingFlags,
) -> BlockingReason {
    let dns_blocked = dns.independent_evidence()
        || (dns.flags.contains(DnsFlag::UnexpectedAddrs) && !http.matched());
    let evidence = [
        (tcp.tcp_blocked, BlockingFlag::TcpIp),
        (dns_blocked, BlockingFlag::Dns),
        (tcp.tls_blocked, BlockingFlag::Tls),
        (http.diff(), BlockingFlag::HttpDiff),
        (http.unexpected_failure(), BlockingFlag::HttpFailure),
    ];
    for (present, flag) in evidence {
        if present {
            flags.insert(flag);
        }
    }

    if tcp.tcp_blocked {
        BlockingReason::TcpIp
    } else if dns_blocked {
        BlockingReason::Dns
    } else if http.diff() {
        BlockingReason::HttpDiff
    } else if tcp.tls_blocked || http.unexpected_failure() {
        BlockingReason::HttpFailure
    } else if http.matched() {
        flags.insert(BlockingFlag::Success);
        BlockingReason::NotBlocked
    } else {
        BlockingReason::Undetermined
    }
}
