/// Picks one connection among several that became usable concurrently.
///
/// Every racing task registers a [`Contender`] before connecting and reports
/// either `ready` or `withdraw`. The decision is taken once all contenders
/// reported, or once the grace window after the first ready report expires.
/// Earliest ready wins; equal times go to the address that comes first in
/// the DNS answers. Losers are signalled through their cancellation token
/// and the choice is explained in `x_conn_priority_log`.
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ArbiterConfig;
use crate::ledger::{ConnPriorityLogEntry, Ledger};

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: usize,
    pub address: SocketAddr,
    /// Seconds since the start of the test.
    pub ready_at: f64,
}

/// Earliest ready wins, then DNS answer order, then registration order.
pub fn select_winner<'a>(candidates: &'a [Candidate], dns_order: &[IpAddr]) -> Option<&'a Candidate> {
    let rank = |c: &Candidate| dns_rank(dns_order, c.address);
    candidates.iter().min_by(|a, b| {
        a.ready_at
            .total_cmp(&b.ready_at)
            .then_with(|| rank(a).cmp(&rank(b)))
            .then_with(|| a.id.cmp(&b.id))
    })
}

/// Position in the DNS answers. Addresses not in the answers rank last.
fn dns_rank(dns_order: &[IpAddr], address: SocketAddr) -> usize {
    dns_order
        .iter()
        .position(|ip| *ip == address.ip())
        .unwrap_or(usize::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Report {
    Pending,
    Ready(f64),
    Withdrawn,
}

struct Slot {
    address: SocketAddr,
    token: CancellationToken,
    report: Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Winner(usize),
    NoWinner,
}

struct ArbiterState {
    slots: Vec<Slot>,
    decision: Option<Decision>,
}

pub struct ConnectionArbiter {
    ledger: Arc<Ledger>,
    dns_order: Vec<IpAddr>,
    config: ArbiterConfig,
    root: CancellationToken,
    state: Mutex<ArbiterState>,
    decided: watch::Sender<Option<Decision>>,
}

impl ConnectionArbiter {
    pub fn new(ledger: Arc<Ledger>, dns_order: Vec<IpAddr>, config: ArbiterConfig) -> Arc<Self> {
        Self::with_parent(ledger, dns_order, config, &CancellationToken::new())
    }

    /// Like `new`, but cancelling `parent` also cancels every contender.
    pub fn with_parent(
        ledger: Arc<Ledger>,
        dns_order: Vec<IpAddr>,
        config: ArbiterConfig,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        let (decided, _) = watch::channel(None);
        Arc::new(Self {
            ledger,
            dns_order,
            config,
            root: parent.child_token(),
            state: Mutex::new(ArbiterState {
                slots: Vec::new(),
                decision: None,
            }),
            decided,
        })
    }

    /// Parent of every contender token. Cancelling it stops the whole race.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn register(self: &Arc<Self>, address: SocketAddr) -> Contender {
        let token = self.root.child_token();
        let id = {
            let mut st = self.lock();
            st.slots.push(Slot {
                address,
                token: token.clone(),
                report: Report::Pending,
            });
            st.slots.len() - 1
        };
        Contender {
            arbiter: Arc::clone(self),
            id,
            address,
            token,
            reported: false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ArbiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, id: usize, report: Report) {
        let mut st = self.lock();
        st.slots[id].report = report;
        let decision = st.decision;
        let all_reported = st.slots.iter().all(|s| s.report != Report::Pending);
        let entries = match decision {
            Some(decision) => late_report(&st, id, report, decision),
            None if all_reported => self.decide(&mut st),
            None => Vec::new(),
        };
        drop(st);
        self.log(entries);
    }

    fn decide_now(&self) {
        let mut st = self.lock();
        if st.decision.is_some() {
            return;
        }
        let entries = self.decide(&mut st);
        drop(st);
        self.log(entries);
    }

    fn decide(&self, st: &mut ArbiterState) -> Vec<String> {
        let candidates: Vec<Candidate> = st
            .slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| match slot.report {
                Report::Ready(ready_at) => Some(Candidate {
                    id,
                    address: slot.address,
                    ready_at,
                }),
                _ => None,
            })
            .collect();

        let winner = match select_winner(&candidates, &self.dns_order) {
            Some(winner) => winner.clone(),
            None => {
                st.decision = Some(Decision::NoWinner);
                self.decided.send_replace(st.decision);
                return vec!["no connection became ready".to_string()];
            }
        };

        let mut entries = vec![format!(
            "conn {}: granted permission: ready at t={:.6}",
            winner.address, winner.ready_at
        )];
        for (id, slot) in st.slots.iter().enumerate() {
            if id == winner.id {
                continue;
            }
            match slot.report {
                Report::Ready(ready_at) => {
                    entries.push(explain_denial(&winner, slot.address, ready_at, &self.dns_order));
                }
                Report::Pending => entries.push(format!(
                    "conn {}: denied permission: picked {} while still connecting",
                    slot.address, winner.address
                )),
                Report::Withdrawn => continue,
            }
            slot.token.cancel();
        }

        info!(winner = %winner.address, contenders = st.slots.len(), "selected connection");
        st.decision = Some(Decision::Winner(winner.id));
        self.decided.send_replace(st.decision);
        entries
    }

    fn log(&self, entries: Vec<String>) {
        for msg in entries {
            let t = self.ledger.elapsed();
            self.ledger
                .append_conn_priority_log_entry(ConnPriorityLogEntry { msg, t });
        }
    }

    fn is_winner(&self, id: usize) -> bool {
        self.lock().decision == Some(Decision::Winner(id))
    }
}

fn explain_denial(winner: &Candidate, loser: SocketAddr, ready_at: f64, dns_order: &[IpAddr]) -> String {
    let delta_ms = (ready_at - winner.ready_at) * 1000.0;
    let reason = if delta_ms > 0.0 {
        format!("established earlier by {delta_ms:.3} ms")
    } else if dns_rank(dns_order, winner.address) < dns_rank(dns_order, loser) {
        "same ready time, earlier in DNS answers".to_string()
    } else {
        "same ready time, registered first".to_string()
    };
    format!(
        "conn {loser}: denied permission: picked {} over {loser}: {reason}",
        winner.address
    )
}

fn late_report(st: &ArbiterState, id: usize, report: Report, decision: Decision) -> Vec<String> {
    let slot = &st.slots[id];
    if !matches!(report, Report::Ready(_)) {
        return Vec::new();
    }
    slot.token.cancel();
    match decision {
        Decision::Winner(winner) => vec![format!(
            "conn {}: denied permission: {} already selected",
            slot.address, st.slots[winner].address
        )],
        Decision::NoWinner => vec![format!(
            "conn {}: denied permission: race already closed",
            slot.address
        )],
    }
}

/// One racing connection's handle on the arbiter.
///
/// Dropping a contender that never reported counts as a withdrawal, so a
/// cancelled task cannot stall the race.
pub struct Contender {
    arbiter: Arc<ConnectionArbiter>,
    id: usize,
    address: SocketAddr,
    token: CancellationToken,
    reported: bool,
}

impl Contender {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Cancelled when another connection was selected.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Reports that the connection became usable at `ready_at` and waits for
    /// the decision. Returns true for exactly one contender.
    pub async fn ready(&mut self, ready_at: f64) -> bool {
        if self.reported {
            return self.arbiter.is_winner(self.id);
        }
        let mut rx = self.arbiter.decided.subscribe();
        self.reported = true;
        self.arbiter.report(self.id, Report::Ready(ready_at));

        let grace = self.arbiter.config.grace_window();
        let decided = tokio::time::timeout(grace, rx.wait_for(|d| d.is_some()))
            .await
            .is_ok();
        if !decided {
            debug!(address = %self.address, "grace window expired, deciding with current candidates");
            self.arbiter.decide_now();
        }
        self.arbiter.is_winner(self.id)
    }

    /// Reports that the connection could not be established.
    pub fn withdraw(&mut self) {
        if !self.reported {
            self.reported = true;
            self.arbiter.report(self.id, Report::Withdrawn);
        }
    }
}

impl Drop for Contender {
    fn drop(&mut self) {
        self.withdraw();
    }
}
