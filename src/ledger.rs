/// The shared result ledger of one web connectivity test.
///
/// Probe tasks hold an `Arc<Ledger>` and write observations as they
/// complete. Every mutation is one short critical section on a single
/// mutex. `finalize` freezes the ledger, classifies it and hands back the
/// immutable [`TestKeys`].
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use url::Url;

use crate::analysis::{self, Classification};
use crate::config::AnalysisConfig;
use crate::error::LedgerError;
use crate::flags::{BlockingFlags, DnsFlags, NullNullFlags};
use crate::model::{
    ControlRequest, ControlResponse, DnsLookupResult, HttpRequestResult, NetworkEvent,
    TcpConnectResult, TestHelper, TlsHandshakeResult,
};
use crate::stats::{LedgerStats, LedgerStatsSnapshot};
use crate::verdict::{Accessibility, BlockingReason, DnsConsistency};

/// Explains why a given ready connection was used for the HTTP request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnPriorityLogEntry {
    pub msg: String,
    pub t: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsWhoamiEntry {
    pub address: String,
}

/// Apparent source addresses seen by each resolver transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsWhoamiInfo {
    pub system_v4: Vec<DnsWhoamiEntry>,
    /// Keyed by resolver `ip:port`.
    pub udp_v4: BTreeMap<String, Vec<DnsWhoamiEntry>>,
}

/// Ancillary observations collected by DoH resolvers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestKeysDoh {
    pub network_events: Vec<NetworkEvent>,
    pub queries: Vec<DnsLookupResult>,
    pub requests: Vec<HttpRequestResult>,
    pub tcp_connect: Vec<TcpConnectResult>,
    pub tls_handshakes: Vec<TlsHandshakeResult>,
}

/// Ancillary observations collected by Do53 resolvers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestKeysDo53 {
    pub network_events: Vec<NetworkEvent>,
    pub queries: Vec<DnsLookupResult>,
}

/// Results of a web connectivity test, in their archival shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestKeys {
    pub agent: String,
    pub client_resolver: String,
    /// Legacy, always null.
    pub retries: Option<i64>,
    /// Legacy, always null.
    pub socksproxy: Option<String>,
    pub network_events: Vec<NetworkEvent>,
    #[serde(rename = "x_dns_whoami")]
    pub dns_whoami: DnsWhoamiInfo,
    #[serde(rename = "x_doh")]
    pub doh: TestKeysDoh,
    #[serde(rename = "x_do53")]
    pub do53: TestKeysDo53,
    #[serde(rename = "x_dns_duplicate_responses")]
    pub dns_duplicate_responses: Vec<DnsLookupResult>,
    pub queries: Vec<DnsLookupResult>,
    /// Most recent request first.
    pub requests: Vec<HttpRequestResult>,
    pub tcp_connect: Vec<TcpConnectResult>,
    pub tls_handshakes: Vec<TlsHandshakeResult>,
    #[serde(rename = "x_control_request")]
    pub control_request: Option<ControlRequest>,
    pub control: Option<ControlResponse>,
    #[serde(rename = "x_conn_priority_log")]
    pub conn_priority_log: Vec<ConnPriorityLogEntry>,
    pub control_failure: Option<String>,
    #[serde(rename = "x_dns_flags")]
    pub dns_flags: DnsFlags,
    pub dns_experiment_failure: Option<String>,
    pub dns_consistency: DnsConsistency,
    pub http_experiment_failure: Option<String>,
    #[serde(rename = "x_blocking_flags")]
    pub blocking_flags: BlockingFlags,
    #[serde(rename = "x_null_null_flags")]
    pub null_null_flags: NullNullFlags,
    pub body_length_match: Option<bool>,
    pub headers_match: Option<bool>,
    pub status_code_match: Option<bool>,
    pub title_match: Option<bool>,
    #[serde(default)]
    pub blocking: BlockingReason,
    #[serde(default)]
    pub accessible: Accessibility,
    #[serde(skip)]
    fundamental_failure: Option<String>,
    #[serde(skip)]
    test_helper: Option<TestHelper>,
}

impl Default for TestKeys {
    fn default() -> Self {
        Self {
            agent: "redirect".to_string(),
            client_resolver: String::new(),
            retries: None,
            socksproxy: None,
            network_events: Vec::new(),
            dns_whoami: DnsWhoamiInfo::default(),
            doh: TestKeysDoh::default(),
            do53: TestKeysDo53::default(),
            dns_duplicate_responses: Vec::new(),
            queries: Vec::new(),
            requests: Vec::new(),
            tcp_connect: Vec::new(),
            tls_handshakes: Vec::new(),
            control_request: None,
            control: None,
            conn_priority_log: Vec::new(),
            control_failure: None,
            dns_flags: DnsFlags::empty(),
            dns_experiment_failure: None,
            dns_consistency: DnsConsistency::Undetermined,
            http_experiment_failure: None,
            blocking_flags: BlockingFlags::empty(),
            null_null_flags: NullNullFlags::empty(),
            body_length_match: None,
            headers_match: None,
            status_code_match: None,
            title_match: None,
            blocking: BlockingReason::Undetermined,
            accessible: Accessibility::Undetermined,
            fundamental_failure: None,
            test_helper: None,
        }
    }
}

impl TestKeys {
    /// An unrecoverable internal error recorded by a background task. A
    /// result carrying one must not be submitted.
    pub fn fundamental_failure(&self) -> Option<&str> {
        self.fundamental_failure.as_deref()
    }

    pub fn test_helper(&self) -> Option<&TestHelper> {
        self.test_helper.as_ref()
    }

    /// Whether the measurement shows a concrete blocking category.
    pub fn is_anomaly(&self) -> bool {
        self.blocking.is_blocked()
    }

    fn apply(&mut self, c: Classification) {
        self.dns_consistency = c.dns_consistency;
        self.dns_flags = c.dns_flags;
        self.dns_experiment_failure = c.dns_experiment_failure;
        self.http_experiment_failure = c.http_experiment_failure;
        self.blocking_flags = c.blocking_flags;
        self.null_null_flags = c.null_null_flags;
        self.body_length_match = c.body_length_match;
        self.headers_match = c.headers_match;
        self.status_code_match = c.status_code_match;
        self.title_match = c.title_match;
        self.blocking = c.blocking;
        self.accessible = c.accessible;
    }
}

enum LedgerState {
    Open(TestKeys),
    Frozen,
}

pub struct Ledger {
    target: Url,
    zero: Instant,
    analysis: AnalysisConfig,
    state: Mutex<LedgerState>,
    stats: LedgerStats,
}

impl Ledger {
    pub fn new(target: Url) -> Self {
        Self::with_config(target, AnalysisConfig::default())
    }

    pub fn with_config(target: Url, analysis: AnalysisConfig) -> Self {
        Self {
            target,
            zero: Instant::now(),
            analysis,
            state: Mutex::new(LedgerState::Open(TestKeys::default())),
            stats: LedgerStats::new(),
        }
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Seconds elapsed since the ledger was created.
    pub fn elapsed(&self) -> f64 {
        self.zero.elapsed().as_secs_f64()
    }

    pub fn stats(&self) -> LedgerStatsSnapshot {
        self.stats.snapshot()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A panicking transform must not wedge every other probe task.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<R>(&self, operation: &'static str, f: impl FnOnce(&mut TestKeys) -> R) -> Option<R> {
        let mut guard = self.lock();
        match &mut *guard {
            LedgerState::Open(tk) => Some(f(tk)),
            LedgerState::Frozen => {
                drop(guard);
                self.stats.mutation_dropped();
                warn!(operation, "ledger already finalized; dropping mutation");
                None
            }
        }
    }

    fn append_with<T>(&self, operation: &'static str, v: Vec<T>, f: impl FnOnce(&mut TestKeys, Vec<T>)) {
        let count = v.len();
        if self.mutate(operation, |tk| f(tk, v)).is_some() {
            self.stats.records_appended(count);
        }
    }

    pub fn append_network_events(&self, v: Vec<NetworkEvent>) {
        self.append_with("append_network_events", v, |tk, v| {
            tk.network_events.extend(v)
        });
    }

    pub fn append_dns_late_replies(&self, v: Vec<DnsLookupResult>) {
        self.append_with("append_dns_late_replies", v, |tk, v| {
            tk.dns_duplicate_responses.extend(v)
        });
    }

    pub fn append_queries(&self, v: Vec<DnsLookupResult>) {
        self.append_with("append_queries", v, |tk, v| tk.queries.extend(v));
    }

    /// Prepends, since the most recent request must come first.
    pub fn append_requests(&self, v: Vec<HttpRequestResult>) {
        self.append_with("append_requests", v, |tk, v| {
            tk.requests.splice(0..0, v);
        });
    }

    pub fn append_tcp_connect_results(&self, v: Vec<TcpConnectResult>) {
        self.append_with("append_tcp_connect_results", v, |tk, v| {
            tk.tcp_connect.extend(v)
        });
    }

    pub fn append_tls_handshakes(&self, v: Vec<TlsHandshakeResult>) {
        self.append_with("append_tls_handshakes", v, |tk, v| {
            tk.tls_handshakes.extend(v)
        });
    }

    pub fn append_conn_priority_log_entry(&self, entry: ConnPriorityLogEntry) {
        self.append_with("append_conn_priority_log_entry", vec![entry], |tk, v| {
            tk.conn_priority_log.extend(v)
        });
    }

    pub fn set_client_resolver(&self, value: String) {
        self.mutate("set_client_resolver", |tk| tk.client_resolver = value);
    }

    pub fn set_control_request(&self, value: ControlRequest) {
        self.mutate("set_control_request", |tk| tk.control_request = Some(value));
    }

    pub fn set_control(&self, value: ControlResponse) {
        self.mutate("set_control", |tk| tk.control = Some(value));
    }

    pub fn set_control_failure(&self, err: &dyn std::error::Error) {
        let failure = err.to_string();
        self.mutate("set_control_failure", |tk| tk.control_failure = Some(failure));
    }

    /// Records the first fundamental failure. Later ones are logged and
    /// ignored.
    pub fn set_fundamental_failure(&self, err: &dyn std::error::Error) {
        let failure = err.to_string();
        let kept = self.mutate("set_fundamental_failure", |tk| {
            if tk.fundamental_failure.is_none() {
                tk.fundamental_failure = Some(failure.clone());
                true
            } else {
                false
            }
        });
        match kept {
            Some(true) => error!(failure = %failure, "fundamental failure"),
            Some(false) => warn!(failure = %failure, "ignoring additional fundamental failure"),
            None => {}
        }
    }

    pub fn fundamental_failure(&self) -> Option<String> {
        match &*self.lock() {
            LedgerState::Open(tk) => tk.fundamental_failure.clone(),
            LedgerState::Frozen => None,
        }
    }

    pub fn set_test_helper(&self, th: TestHelper) {
        self.mutate("set_test_helper", |tk| tk.test_helper = Some(th));
    }

    pub fn test_helper(&self) -> Option<TestHelper> {
        match &*self.lock() {
            LedgerState::Open(tk) => tk.test_helper.clone(),
            LedgerState::Frozen => None,
        }
    }

    /// Runs `f` on the DoH observations with the lock held.
    pub fn with_test_keys_doh(&self, f: impl FnOnce(&mut TestKeysDoh)) {
        self.mutate("with_test_keys_doh", |tk| f(&mut tk.doh));
    }

    /// Runs `f` on the Do53 observations with the lock held.
    pub fn with_test_keys_do53(&self, f: impl FnOnce(&mut TestKeysDo53)) {
        self.mutate("with_test_keys_do53", |tk| f(&mut tk.do53));
    }

    /// Runs `f` on the whoami results with the lock held.
    pub fn with_dns_whoami(&self, f: impl FnOnce(&mut DnsWhoamiInfo)) {
        self.mutate("with_dns_whoami", |tk| f(&mut tk.dns_whoami));
    }

    /// Freezes the ledger and classifies the measurement.
    ///
    /// Must be called once, after every probe task has joined. A second call
    /// fails with [`LedgerError::AlreadyFinalized`].
    pub fn finalize(&self) -> Result<TestKeys, LedgerError> {
        self.stats.finalize_called();
        let mut tk = match std::mem::replace(&mut *self.lock(), LedgerState::Frozen) {
            LedgerState::Open(tk) => tk,
            LedgerState::Frozen => {
                error!("finalize called more than once");
                return Err(LedgerError::AlreadyFinalized);
            }
        };

        // sort_by is stable: events with equal timestamps keep insertion order
        tk.network_events.sort_by(|a, b| a.t.total_cmp(&b.t));

        let classification = analysis::classify(&tk, &self.target, &self.analysis);
        tk.apply(classification);

        info!(
            target_url = %self.target,
            blocking = ?tk.blocking,
            accessible = ?tk.accessible,
            dns_flags = tk.dns_flags.bits(),
            blocking_flags = tk.blocking_flags.bits(),
            null_null_flags = tk.null_null_flags.bits(),
            "measurement finalized"
        );
        self.stats.log_summary();
        Ok(tk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::Rng;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn ledger() -> Arc<Ledger> {
        Arc::new(Ledger::new(Url::parse("https://example.com/").unwrap()))
    }

    fn event(id: i64, t: f64) -> NetworkEvent {
        NetworkEvent {
            operation: "read".to_string(),
            t,
            transaction_id: Some(id),
            ..Default::default()
        }
    }

    fn request(url: &str) -> HttpRequestResult {
        let mut r = HttpRequestResult::default();
        r.request.url = url.to_string();
        r
    }

    #[derive(Debug)]
    struct Boom(&'static str);

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl std::error::Error for Boom {}

    proptest! {
        #[test]
        fn concurrent_appends_lose_nothing(writers in 1usize..8, per_writer in 0usize..24) {
            let ledger = ledger();
            std::thread::scope(|s| {
                for w in 0..writers {
                    let ledger = Arc::clone(&ledger);
                    s.spawn(move || {
                        let batch = (0..per_writer)
                            .map(|i| event((w * 1000 + i) as i64, 0.0))
                            .collect();
                        ledger.append_network_events(batch);
                    });
                }
            });
            let tk = ledger.finalize().unwrap();
            prop_assert_eq!(tk.network_events.len(), writers * per_writer);
            let ids: HashSet<_> = tk.network_events.iter().map(|e| e.transaction_id).collect();
            prop_assert_eq!(ids.len(), writers * per_writer);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn random_batches_from_tasks_are_all_kept() {
        let ledger = ledger();
        let mut rng = rand::thread_rng();
        let mut expected = 0;
        let mut handles = Vec::new();
        for w in 0..16i64 {
            let n: usize = rng.gen_range(0..32);
            expected += n;
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                for i in 0..n as i64 {
                    let mut q = DnsLookupResult::default();
                    q.transaction_id = Some(w * 100 + i);
                    ledger.append_queries(vec![q]);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(ledger.stats().records_appended, expected as u64);
        let tk = ledger.finalize().unwrap();
        assert_eq!(tk.queries.len(), expected);
    }

    #[test]
    fn requests_are_prepended() {
        let ledger = ledger();
        ledger.append_requests(vec![request("http://a/")]);
        ledger.append_requests(vec![request("http://b/")]);
        let tk = ledger.finalize().unwrap();
        let urls: Vec<_> = tk.requests.iter().map(|r| r.request.url.as_str()).collect();
        assert_eq!(urls, vec!["http://b/", "http://a/"]);
    }

    #[test]
    fn prepended_batch_keeps_its_own_order() {
        let ledger = ledger();
        ledger.append_requests(vec![request("http://a/")]);
        ledger.append_requests(vec![request("http://c/"), request("http://b/")]);
        let tk = ledger.finalize().unwrap();
        let urls: Vec<_> = tk.requests.iter().map(|r| r.request.url.as_str()).collect();
        assert_eq!(urls, vec!["http://c/", "http://b/", "http://a/"]);
    }

    #[test]
    fn second_finalize_is_an_error() {
        let ledger = ledger();
        assert!(ledger.finalize().is_ok());
        assert_eq!(ledger.finalize().unwrap_err(), LedgerError::AlreadyFinalized);
        assert_eq!(ledger.stats().finalize_calls, 2);
    }

    #[test]
    fn finalize_sorts_events_stably() {
        let ledger = ledger();
        ledger.append_network_events(vec![event(1, 0.3), event(2, 0.1)]);
        ledger.append_network_events(vec![event(3, 0.1), event(4, 0.2), event(5, 0.1)]);
        let tk = ledger.finalize().unwrap();
        let ids: Vec<_> = tk
            .network_events
            .iter()
            .filter_map(|e| e.transaction_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 5, 4, 1]);
    }

    #[test]
    fn mutations_after_freeze_are_dropped() {
        let ledger = ledger();
        let _ = ledger.finalize().unwrap();
        ledger.append_queries(vec![DnsLookupResult::default()]);
        ledger.set_client_resolver("10.0.0.1".to_string());
        let stats = ledger.stats();
        assert_eq!(stats.mutations_dropped, 2);
        assert_eq!(stats.records_appended, 0);
    }

    #[test]
    fn first_fundamental_failure_wins() {
        let ledger = ledger();
        ledger.set_fundamental_failure(&Boom("cannot parse hardcoded URL"));
        ledger.set_fundamental_failure(&Boom("second"));
        assert_eq!(
            ledger.fundamental_failure().as_deref(),
            Some("cannot parse hardcoded URL")
        );
        let tk = ledger.finalize().unwrap();
        assert_eq!(tk.fundamental_failure(), Some("cannot parse hardcoded URL"));
    }

    #[test]
    fn nested_transforms_run_under_the_lock() {
        let ledger = ledger();
        ledger.with_dns_whoami(|info| {
            info.udp_v4
                .entry("8.8.8.8:53".to_string())
                .or_default()
                .push(DnsWhoamiEntry {
                    address: "192.0.2.1".to_string(),
                })
        });
        ledger.with_test_keys_do53(|do53| do53.queries.push(DnsLookupResult::default()));
        ledger.with_test_keys_doh(|doh| doh.requests.push(HttpRequestResult::default()));
        let tk = ledger.finalize().unwrap();
        assert_eq!(tk.dns_whoami.udp_v4["8.8.8.8:53"].len(), 1);
        assert_eq!(tk.do53.queries.len(), 1);
        assert_eq!(tk.doh.requests.len(), 1);
    }

    #[test]
    fn control_failure_is_stored_as_string() {
        let ledger = ledger();
        ledger.set_control_failure(&Boom("connection_refused"));
        let tk = ledger.finalize().unwrap();
        assert_eq!(tk.control_failure.as_deref(), Some("connection_refused"));
    }

    #[test]
    fn serialized_keys_keep_wire_names() {
        let ledger = ledger();
        ledger.set_client_resolver("192.0.2.53".to_string());
        ledger.set_test_helper(TestHelper {
            address: "https://th.example.org".to_string(),
            kind: "https".to_string(),
            front: None,
        });
        assert!(ledger.test_helper().is_some());
        let tk = ledger.finalize().unwrap();
        let json = serde_json::to_value(&tk).unwrap();
        assert_eq!(json["agent"], "redirect");
        assert_eq!(json["client_resolver"], "192.0.2.53");
        assert!(json["retries"].is_null());
        assert!(json["socksproxy"].is_null());
        assert!(json["x_dns_whoami"]["udp_v4"].is_object());
        assert!(json["x_conn_priority_log"].is_array());
        assert!(json["x_null_null_flags"].is_number());
        assert!(json.get("fundamental_failure").is_none());
        assert!(json.get("test_helper").is_none());
    }
}
