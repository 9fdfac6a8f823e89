//! Periodic status reporting to the trackers, plus fire-and-forget error
//! notification for node trouble.

use std::path::Path;
use std::time::Duration;

use common::{ApiCode, NodeErrorReport, StatusReport};
use tracing::{debug, warn};

use crate::NodeState;

pub(crate) const REPORT_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn spawn_report_task(state: NodeState, interval_secs: u64) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;
            report_status(&state).await;
        }
    });
}

/// One report round: free space to every configured tracker, no retry. A
/// missed report just ages this node towards the tracker's offline threshold.
pub(crate) async fn report_status(state: &NodeState) {
    let Some((host, port)) = split_addr(&state.advertised_addr) else {
        warn!(addr = %state.advertised_addr, "cannot parse advertised address, skipping status report");
        return;
    };

    let report = StatusReport {
        group: state.group.clone(),
        scheme: state.scheme.clone(),
        host,
        port,
        free: free_bytes(&state.storage_dir),
    };

    for tracker in state.trackers.iter() {
        let url = format!("{}/status", tracker.trim_end_matches('/'));
        let http = state.http.clone();
        let report = report.clone();
        tokio::spawn(async move {
            if let Err(err) = http
                .post(&url)
                .timeout(REPORT_TIMEOUT)
                .json(&report)
                .send()
                .await
            {
                debug!(url = %url, error = %err, "status report failed");
            }
        });
    }
}

/// Pushes a node-trouble report to every tracker for operator visibility.
pub(crate) fn notify_trackers(state: &NodeState, code: ApiCode, message: String) {
    let Some((host, port)) = split_addr(&state.advertised_addr) else {
        return;
    };

    for tracker in state.trackers.iter() {
        let url = format!("{}/err/log", tracker.trim_end_matches('/'));
        let http = state.http.clone();
        let report = NodeErrorReport {
            code,
            group: state.group.clone(),
            host: host.clone(),
            port,
            message: message.clone(),
        };
        tokio::spawn(async move {
            if let Err(err) = http
                .post(&url)
                .timeout(REPORT_TIMEOUT)
                .json(&report)
                .send()
                .await
            {
                debug!(url = %url, error = %err, "error report failed");
            }
        });
    }
}

/// Free bytes on the volume backing the storage root; 0 when the probe
/// fails, which a tracker treats as not enough space.
pub(crate) fn free_bytes(dir: &Path) -> u64 {
    fs2::available_space(dir).unwrap_or(0)
}

pub(crate) fn split_addr(addr: &str) -> Option<(String, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}
