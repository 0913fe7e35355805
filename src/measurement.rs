/// One web connectivity measurement: probe tasks fan out, write into a
/// shared ledger, and the result is classified once they have all joined.
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;

use scopeguard::ScopeGuard;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::arbiter::ConnectionArbiter;
use crate::config::WebConnectivityConfig;
use crate::error::MeasurementError;
use crate::ledger::{Ledger, TestKeys};
use crate::store::{MeasurementRecord, ResultStore};
use crate::whoami::{Resolver, WhoamiProbe};

pub struct Measurement {
    ledger: Arc<Ledger>,
    config: WebConnectivityConfig,
    tasks: JoinSet<()>,
    cancel: CancellationToken,
}

impl Measurement {
    pub fn new(input: &str, config: WebConnectivityConfig) -> Result<Self, MeasurementError> {
        let target = Url::parse(input)?;
        let ledger = Arc::new(Ledger::with_config(target, config.analysis.clone()));
        Ok(Self {
            ledger,
            config,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.ledger)
    }

    /// Cancelling aborts every probe still running. Their failure
    /// records are written before `run` finalizes.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// An arbiter for the connections of one endpoint set.
    pub fn arbiter(&self, dns_order: Vec<IpAddr>) -> Arc<ConnectionArbiter> {
        ConnectionArbiter::with_parent(
            self.ledger(),
            dns_order,
            self.config.arbiter.clone(),
            &self.cancel,
        )
    }

    /// Spawns a probe task.
    ///
    /// `on_abort` runs if the probe does not complete, whether it panicked
    /// or was aborted, so the ledger still holds a record of the attempt.
    pub fn spawn_probe<Fut, A>(&mut self, name: &'static str, probe: Fut, on_abort: A)
    where
        Fut: Future<Output = ()> + Send + 'static,
        A: FnOnce(&Ledger) + Send + 'static,
    {
        let ledger = self.ledger();
        self.tasks.spawn(async move {
            let guard = scopeguard::guard(on_abort, move |on_abort| {
                warn!(probe = name, "probe did not complete; recording failure");
                on_abort(&ledger);
            });
            probe.await;
            ScopeGuard::into_inner(guard);
            debug!(probe = name, "probe completed");
        });
    }

    /// Spawns the resolver identity lookups: the system resolver plus one
    /// UDP transport, built by `udp_transport`, per configured resolver
    /// address. An aborted lookup leaves an empty result for every resolver.
    pub fn spawn_whoami<F>(&mut self, system: Arc<dyn Resolver>, udp_transport: F)
    where
        F: Fn(&str) -> Arc<dyn Resolver>,
    {
        let addresses = self.config.whoami.udp_resolvers.clone();
        let udp: Vec<Arc<dyn Resolver>> = addresses.iter().map(|a| udp_transport(a.as_str())).collect();
        let probe = WhoamiProbe::new(&self.config.whoami);
        let ledger = self.ledger();
        self.spawn_probe(
            "whoami",
            async move { probe.run(ledger, system, udp).await },
            move |ledger| {
                ledger.with_dns_whoami(|info| {
                    for address in addresses {
                        info.udp_v4.entry(address).or_default();
                    }
                })
            },
        );
    }

    /// Waits for every probe, then freezes and classifies the ledger.
    pub async fn run(mut self) -> Result<TestKeys, MeasurementError> {
        let mut aborted = false;
        loop {
            tokio::select! {
                joined = self.tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(())) => {}
                    Some(Err(err)) if err.is_cancelled() => {
                        debug!("probe task aborted");
                    }
                    Some(Err(err)) => {
                        error!(error = %err, "probe task panicked");
                    }
                },
                _ = self.cancel.cancelled(), if !aborted => {
                    warn!(pending = self.tasks.len(), "measurement cancelled; aborting probes");
                    self.tasks.abort_all();
                    aborted = true;
                }
            }
        }
        Ok(self.ledger.finalize()?)
    }
}

/// Hands finalized test keys to the store.
///
/// Refused when a background task recorded a fundamental failure.
pub fn submit(
    tk: &TestKeys,
    store: &dyn ResultStore,
    msmt: &mut MeasurementRecord,
) -> Result<(), MeasurementError> {
    if let Some(failure) = tk.fundamental_failure() {
        error!(measurement_id = msmt.id, failure, "not submitting measurement");
        return Err(MeasurementError::FundamentalFailure(failure.to_string()));
    }
    let json = serde_json::to_string(tk)?;
    store.add_test_keys(msmt, json, Some(tk.is_anomaly()))?;
    info!(
        measurement_id = msmt.id,
        path = %msmt.file_path.display(),
        anomaly = tk.is_anomaly(),
        "measurement submitted"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolverError;
    use crate::model::{TcpConnectResult, TcpConnectStatus};
    use crate::store::MemoryStore;
    use crate::whoami::MockResolver;
    use std::path::Path;
    use std::time::Duration;

    fn failed_connect(ip: &str) -> TcpConnectResult {
        TcpConnectResult {
            ip: ip.to_string(),
            port: 443,
            status: TcpConnectStatus {
                success: false,
                failure: Some("interrupted".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "boom")
        }
    }

    impl std::error::Error for Boom {}

    #[test]
    fn rejects_invalid_input() {
        assert!(matches!(
            Measurement::new("not a url", WebConnectivityConfig::default()),
            Err(MeasurementError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn completed_probe_skips_fallback() {
        let mut m = Measurement::new("https://example.com/", WebConnectivityConfig::default()).unwrap();
        let ledger = m.ledger();
        m.spawn_probe(
            "tcp",
            async move {
                ledger.append_tcp_connect_results(vec![TcpConnectResult {
                    ip: "93.184.216.34".to_string(),
                    port: 443,
                    status: TcpConnectStatus {
                        success: true,
                        ..Default::default()
                    },
                    ..Default::default()
                }]);
            },
            |ledger| ledger.append_tcp_connect_results(vec![failed_connect("93.184.216.34")]),
        );
        let tk = m.run().await.unwrap();
        assert_eq!(tk.tcp_connect.len(), 1);
        assert!(tk.tcp_connect[0].status.success);
    }

    #[tokio::test]
    async fn panicking_probe_still_records_failure() {
        let mut m = Measurement::new("https://example.com/", WebConnectivityConfig::default()).unwrap();
        m.spawn_probe(
            "tcp",
            async { panic!("probe exploded") },
            |ledger| ledger.append_tcp_connect_results(vec![failed_connect("93.184.216.34")]),
        );
        let tk = m.run().await.unwrap();
        assert_eq!(tk.tcp_connect.len(), 1);
        assert!(!tk.tcp_connect[0].status.success);
    }

    #[tokio::test]
    async fn cancellation_records_pending_probes() {
        let mut m = Measurement::new("https://example.com/", WebConnectivityConfig::default()).unwrap();
        m.spawn_probe(
            "stuck",
            async { tokio::time::sleep(Duration::from_secs(3600)).await },
            |ledger| ledger.append_tcp_connect_results(vec![failed_connect("192.0.2.1")]),
        );
        let cancel = m.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let tk = m.run().await.unwrap();
        assert_eq!(tk.tcp_connect[0].ip, "192.0.2.1");
    }

    struct HangingResolver(String);

    #[async_trait::async_trait]
    impl Resolver for HangingResolver {
        async fn lookup_host(&self, _domain: &str) -> Result<Vec<String>, ResolverError> {
            std::future::pending().await
        }

        fn network(&self) -> &str {
            "udp"
        }

        fn address(&self) -> &str {
            &self.0
        }
    }

    fn whoami_config(resolvers: &[&str]) -> WebConnectivityConfig {
        let mut config = WebConnectivityConfig::default();
        config.whoami.udp_resolvers = resolvers.iter().map(|r| r.to_string()).collect();
        config
    }

    #[tokio::test]
    async fn whoami_probes_the_configured_resolvers() {
        let config = whoami_config(&["8.8.8.8:53", "1.1.1.1:53"]);
        let mut m = Measurement::new("https://example.com/", config).unwrap();
        let system: Arc<dyn Resolver> = Arc::new(MockResolver::new("system", "", |_| {
            Ok(vec!["192.0.2.53".to_string()])
        }));
        m.spawn_whoami(system, |address: &str| -> Arc<dyn Resolver> {
            let answer = if address == "1.1.1.1:53" {
                Ok(vec!["162.158.0.1".to_string()])
            } else {
                Err(ResolverError::NoAnswer)
            };
            Arc::new(MockResolver::new("udp", address, move |_| answer.clone()))
        });
        let tk = m.run().await.unwrap();
        assert_eq!(tk.client_resolver, "192.0.2.53");
        assert_eq!(tk.dns_whoami.udp_v4.len(), 2);
        assert!(tk.dns_whoami.udp_v4["8.8.8.8:53"].is_empty());
        assert_eq!(tk.dns_whoami.udp_v4["1.1.1.1:53"][0].address, "162.158.0.1");
    }

    #[tokio::test]
    async fn aborted_whoami_records_empty_results() {
        let config = whoami_config(&["8.8.8.8:53", "8.8.4.4:53"]);
        let mut m = Measurement::new("https://example.com/", config).unwrap();
        m.spawn_whoami(Arc::new(HangingResolver(String::new())), |address: &str| -> Arc<dyn Resolver> {
            Arc::new(HangingResolver(address.to_string()))
        });
        let cancel = m.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });
        let tk = m.run().await.unwrap();
        assert!(tk.dns_whoami.system_v4.is_empty());
        assert_eq!(tk.dns_whoami.udp_v4.len(), 2);
        assert!(tk.dns_whoami.udp_v4.values().all(Vec::is_empty));
        assert!(tk.client_resolver.is_empty());
    }

    #[tokio::test]
    async fn fundamental_failure_blocks_submission() {
        let store = MemoryStore::new();
        let result = store.create_result(Path::new("/tmp"), "websites", 1).unwrap();
        let mut msmt = store
            .create_measurement(None, "web_connectivity", &result.measurement_dir, 0, result.id, None)
            .unwrap();

        let m = Measurement::new("https://example.com/", WebConnectivityConfig::default()).unwrap();
        m.ledger().set_fundamental_failure(&Boom);
        let tk = m.run().await.unwrap();
        assert!(matches!(
            submit(&tk, &store, &mut msmt),
            Err(MeasurementError::FundamentalFailure(f)) if f == "boom"
        ));
        assert!(!store.list_measurements(result.id).unwrap()[0].is_done);
    }

    #[tokio::test]
    async fn submission_stores_json_and_anomaly() {
        let store = MemoryStore::new();
        let result = store.create_result(Path::new("/tmp"), "websites", 1).unwrap();
        let mut msmt = store
            .create_measurement(None, "web_connectivity", &result.measurement_dir, 0, result.id, None)
            .unwrap();

        let m = Measurement::new("https://example.com/", WebConnectivityConfig::default()).unwrap();
        let tk = m.run().await.unwrap();
        submit(&tk, &store, &mut msmt).unwrap();
        assert_eq!(msmt.is_anomaly, Some(false));
        let json = store.get_measurement_json(msmt.id).unwrap();
        assert_eq!(json["blocking"], serde_json::Value::Null);
        assert_eq!(json["accessible"], serde_json::Value::Null);
    }
}
