use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

use crate::flags::{DnsFlag, DnsFlags};
use crate::ledger::TestKeys;
use crate::model::ControlResponse;
use crate::verdict::DnsConsistency;
use crate::whoami;

pub const NXDOMAIN: &str = "dns_nxdomain_error";

#[derive(Debug, Clone, Default)]
pub struct DnsAnalysis {
    pub consistency: DnsConsistency,
    pub flags: DnsFlags,
    pub probe_addrs: BTreeSet<IpAddr>,
    /// We looked the target up and got no usable address.
    pub probe_lookup_failed: bool,
    pub probe_failure: Option<String>,
    pub control_failed: bool,
}

impl DnsAnalysis {
    /// Evidence that stands on its own, whatever TCP and HTTP say.
    pub fn independent_evidence(&self) -> bool {
        self.flags.contains(DnsFlag::Bogon)
            || self.flags.contains(DnsFlag::UnexpectedFailure)
            || self.consistency == DnsConsistency::Inconsistent
    }
}

pub fn analyze(tk: &TestKeys, target: &Url, control: Option<&ControlResponse>) -> DnsAnalysis {
    let mut out = DnsAnalysis::default();

    if whoami::interception_suspected(&tk.dns_whoami) {
        out.flags.insert(DnsFlag::ResolverIntercepted);
    }

    let domain = match target.host() {
        Some(Host::Domain(domain)) => domain,
        Some(Host::Ipv4(_)) | Some(Host::Ipv6(_)) => {
            out.consistency = DnsConsistency::Consistent;
            return out;
        }
        None => return out,
    };

    let queries: Vec<_> = tk
        .queries
        .iter()
        .filter(|q| q.hostname.eq_ignore_ascii_case(domain))
        .collect();
    let mut asns = BTreeSet::new();
    for q in &queries {
        for answer in &q.answers {
            if let Some(ip) = answer.ip() {
                out.probe_addrs.insert(ip);
                if answer.asn > 0 {
                    asns.insert(answer.asn);
                }
            }
        }
    }
    if !queries.is_empty() && out.probe_addrs.is_empty() {
        out.probe_lookup_failed = true;
        out.probe_failure = Some(
            queries
                .iter()
                .find_map(|q| q.failure.clone())
                .unwrap_or_else(|| "dns_no_answer".to_string()),
        );
    }

    let bogon = out.probe_addrs.iter().any(|ip| is_bogon(*ip));
    if bogon {
        out.flags.insert(DnsFlag::Bogon);
    }

    let control = match control {
        Some(control) => control,
        None => return out,
    };
    if queries.is_empty() {
        return out;
    }

    out.control_failed = control.dns.failure.is_some();
    let control_addrs: BTreeSet<IpAddr> = control
        .dns
        .addrs
        .iter()
        .filter_map(|a| a.parse().ok())
        .collect();

    match (out.probe_lookup_failed, out.control_failed) {
        (true, true) => {
            out.consistency = DnsConsistency::Consistent;
            return out;
        }
        (true, false) => {
            out.flags.insert(DnsFlag::UnexpectedFailure);
            out.consistency = DnsConsistency::Inconsistent;
            return out;
        }
        (false, true) => {
            // Only NXDOMAIN at the control is authoritative; a control
            // timeout says nothing about our answers.
            if control.dns.failure.as_deref() == Some(NXDOMAIN) {
                out.flags.insert(DnsFlag::UnexpectedAddrs);
                out.consistency = DnsConsistency::Inconsistent;
            }
            return out;
        }
        (false, false) => {}
    }

    let control_asns: BTreeSet<i64> = control_addrs
        .iter()
        .filter_map(|ip| control.ip_info.get(&ip.to_string()))
        .map(|info| info.asn)
        .filter(|asn| *asn > 0)
        .collect();
    if !asns.is_empty() && !control_asns.is_empty() && asns.is_disjoint(&control_asns) {
        out.flags.insert(DnsFlag::AsnMismatch);
    }

    if !out.probe_addrs.is_disjoint(&control_addrs) {
        out.consistency = DnsConsistency::Consistent;
        return out;
    }
    out.flags.insert(DnsFlag::UnexpectedAddrs);

    // Some CDNs hand out disjoint address sets to different vantage points.
    // Accept that when the probe actually reached one of its own addresses.
    let probe_reached_own = !bogon
        && tk.tcp_connect.iter().any(|c| {
            c.status.success
                && c.ip
                    .parse::<IpAddr>()
                    .map(|ip| out.probe_addrs.contains(&ip) && !control_addrs.contains(&ip))
                    .unwrap_or(false)
        });
    out.consistency = if probe_reached_own && control.any_tcp_reachable() {
        DnsConsistency::Consistent
    } else {
        DnsConsistency::Inconsistent
    };
    out
}

/// Addresses that cannot belong to a public web server.
pub fn is_bogon(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_bogon_v4(v4),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_bogon_v4(v4),
            None => is_bogon_v6(v6),
        },
    }
}

fn is_bogon_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        // 100.64.0.0/10, carrier-grade NAT
        || (a == 100 && (64..128).contains(&b))
        || a >= 240
}

fn is_bogon_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || ip.is_multicast()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
        || first == 0x2001 && ip.segments()[1] == 0x0db8
}
