/// Resolver identity probing.
///
/// Each resolver transport in use is asked for a "whoami" name whose answer
/// is the address of whoever queried the authoritative server. When a
/// public UDP resolver reports the same source as the system resolver, DNS
/// traffic meant for it is being answered by the local network instead.
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::WhoamiConfig;
use crate::error::ResolverError;
use crate::ledger::{DnsWhoamiEntry, DnsWhoamiInfo, Ledger};

/// A DNS resolver transport.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn lookup_host(&self, domain: &str) -> Result<Vec<String>, ResolverError>;

    /// Transport name, e.g. `system` or `udp`.
    fn network(&self) -> &str;

    /// Resolver address, `ip:port` for UDP resolvers.
    fn address(&self) -> &str;
}

/// The operating system's resolver (getaddrinfo).
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(4))
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup_host(&self, domain: &str) -> Result<Vec<String>, ResolverError> {
        let lookup = tokio::net::lookup_host((domain, 0));
        let addrs = tokio::time::timeout(self.timeout, lookup)
            .await
            .map_err(|_| ResolverError::Timeout)?
            .map_err(|err| ResolverError::Other(err.to_string()))?;
        let ips: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
        if ips.is_empty() {
            return Err(ResolverError::NoAnswer);
        }
        Ok(ips)
    }

    fn network(&self) -> &str {
        "system"
    }

    fn address(&self) -> &str {
        ""
    }
}

type LookupFn = dyn Fn(&str) -> Result<Vec<String>, ResolverError> + Send + Sync;

/// A resolver whose behaviour is given by a closure.
pub struct MockResolver {
    pub lookup: Box<LookupFn>,
    pub network: String,
    pub address: String,
}

impl MockResolver {
    pub fn new(
        network: &str,
        address: &str,
        lookup: impl Fn(&str) -> Result<Vec<String>, ResolverError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            lookup: Box::new(lookup),
            network: network.to_string(),
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl Resolver for MockResolver {
    async fn lookup_host(&self, domain: &str) -> Result<Vec<String>, ResolverError> {
        (self.lookup)(domain)
    }

    fn network(&self) -> &str {
        &self.network
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// Issues whoami lookups and records them in the ledger.
#[derive(Debug, Clone)]
pub struct WhoamiProbe {
    domain: String,
}

impl WhoamiProbe {
    pub fn new(config: &WhoamiConfig) -> Self {
        Self {
            domain: config.domain.clone(),
        }
    }

    /// Looks up the whoami name through every resolver concurrently. Never
    /// fails: a failed lookup is recorded as an empty result.
    pub async fn run(
        &self,
        ledger: Arc<Ledger>,
        system: Arc<dyn Resolver>,
        udp: Vec<Arc<dyn Resolver>>,
    ) {
        let mut tasks = JoinSet::new();
        {
            let this = self.clone();
            let ledger = Arc::clone(&ledger);
            tasks.spawn(async move { this.probe_system(&ledger, system.as_ref()).await });
        }
        for resolver in udp {
            let this = self.clone();
            let ledger = Arc::clone(&ledger);
            tasks.spawn(async move { this.probe_udp(&ledger, resolver.as_ref()).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "whoami task did not complete");
            }
        }
    }

    pub async fn probe_system(&self, ledger: &Ledger, resolver: &dyn Resolver) {
        let entries = self.lookup(resolver).await;
        if let Some(first) = entries.first() {
            ledger.set_client_resolver(first.address.clone());
        }
        ledger.with_dns_whoami(|info| info.system_v4 = entries);
    }

    pub async fn probe_udp(&self, ledger: &Ledger, resolver: &dyn Resolver) {
        let entries = self.lookup(resolver).await;
        let key = resolver.address().to_string();
        ledger.with_dns_whoami(|info| {
            info.udp_v4.entry(key).or_default().extend(entries);
        });
    }

    async fn lookup(&self, resolver: &dyn Resolver) -> Vec<DnsWhoamiEntry> {
        match resolver.lookup_host(&self.domain).await {
            Ok(addrs) => addrs
                .into_iter()
                .filter(|a| a.parse::<Ipv4Addr>().is_ok())
                .map(|address| DnsWhoamiEntry { address })
                .collect(),
            Err(err) => {
                debug!(
                    network = resolver.network(),
                    resolver = resolver.address(),
                    error = %err,
                    "whoami lookup failed"
                );
                Vec::new()
            }
        }
    }
}

fn addresses(entries: &[DnsWhoamiEntry]) -> BTreeSet<IpAddr> {
    entries
        .iter()
        .filter_map(|e| e.address.parse().ok())
        .collect()
}

/// True when a UDP resolver saw the same source as the system resolver.
pub fn interception_suspected(info: &DnsWhoamiInfo) -> bool {
    let system = addresses(&info.system_v4);
    if system.is_empty() {
        return false;
    }
    info.udp_v4
        .values()
        .any(|entries| !addresses(entries).is_disjoint(&system))
}
