use std::collections::BTreeSet;

use crate::ledger::TestKeys;
use crate::model::ControlResponse;

#[derive(Debug, Clone, Default)]
pub struct TcpAnalysis {
    pub tcp_attempted: bool,
    pub tcp_any_success: bool,
    /// Probe could not connect anywhere the control could.
    pub tcp_blocked: bool,
    /// Neither the probe nor the control could connect.
    pub tcp_expected_failure: bool,
    pub tls_attempted: bool,
    pub tls_any_success: bool,
    pub tls_blocked: bool,
    pub tls_expected_failure: bool,
}

pub fn analyze(tk: &TestKeys, control: Option<&ControlResponse>) -> TcpAnalysis {
    let mut out = TcpAnalysis {
        tcp_attempted: !tk.tcp_connect.is_empty(),
        tcp_any_success: tk.tcp_connect.iter().any(|c| c.status.success),
        tls_attempted: !tk.tls_handshakes.is_empty(),
        tls_any_success: tk.tls_handshakes.iter().any(|h| h.failure.is_none()),
        ..Default::default()
    };

    let control = match control {
        Some(control) => control,
        None => return out,
    };

    if out.tcp_attempted && !out.tcp_any_success {
        let failed: BTreeSet<String> = tk.tcp_connect.iter().map(|c| c.endpoint()).collect();
        let overlap: Vec<bool> = control
            .tcp_connect
            .iter()
            .filter(|(endpoint, _)| failed.contains(*endpoint))
            .map(|(_, result)| result.status)
            .collect();
        // With no endpoint in common, the control reaching the target at
        // all is enough: whatever DNS said, we could not connect anywhere.
        out.tcp_blocked = if overlap.is_empty() {
            control.any_tcp_reachable()
        } else {
            overlap.iter().any(|reachable| *reachable)
        };
        out.tcp_expected_failure = !control.tcp_connect.is_empty() && !control.any_tcp_reachable();
    }

    if out.tls_attempted && !out.tls_any_success {
        let control_tls_ok = control.tls_handshake.values().any(|h| h.status);
        out.tls_blocked = out.tcp_any_success && (control_tls_ok || control.http_succeeded());
        out.tls_expected_failure = !control.tls_handshake.is_empty() && !control_tls_ok;
    }

    out
}
