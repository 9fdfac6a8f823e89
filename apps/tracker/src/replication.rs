//! Pushes add/delete sync commands to remote storage nodes. Every failure is
//! recorded in the durable retry log; nothing here ever propagates an error
//! back to the client whose upload triggered the push.

use std::time::Duration;

use common::{Envelope, SyncAction, SyncCommand};
use metastore::MetaStore;
use tracing::{error, warn};

use crate::cluster::{ReplicaStatus, StorageReplica};

/// Delete is cheap on the remote side and should fail fast.
pub(crate) const ADD_PUSH_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const DELETE_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct ReplicationClient {
    http: reqwest::Client,
    retry_log: MetaStore,
}

impl ReplicationClient {
    pub(crate) fn new(http: reqwest::Client, retry_log: MetaStore) -> Self {
        Self { http, retry_log }
    }

    /// Pushes one command to its destination replica. A destination that is
    /// already known bad is logged without a network attempt.
    pub(crate) async fn replicate(&self, dest: &StorageReplica, command: SyncCommand) {
        if dest.status != ReplicaStatus::Active {
            self.log_failure(&command, "destination replica is not active");
            return;
        }

        let url = format!("{}/sync", dest.base_url());
        let timeout = match command.action {
            SyncAction::Add => ADD_PUSH_TIMEOUT,
            SyncAction::Delete => DELETE_PUSH_TIMEOUT,
        };

        let response = match self
            .http
            .post(&url)
            .timeout(timeout)
            .json(&command)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                self.log_failure(&command, &err.to_string());
                return;
            }
        };

        let response = match response.error_for_status() {
            Ok(response) => response,
            Err(err) => {
                self.log_failure(&command, &err.to_string());
                return;
            }
        };

        match response.json::<Envelope>().await {
            Ok(envelope) if envelope.is_success() => {}
            Ok(envelope) => self.log_failure(
                &command,
                &format!("remote apply failed with status {}", envelope.status.as_u32()),
            ),
            Err(err) => self.log_failure(&command, &format!("unparsable sync response: {err}")),
        }
    }

    /// Commands waiting for out-of-band reconciliation. This component only
    /// ever writes the log; draining it is an operator concern.
    pub(crate) fn pending(&self) -> Vec<SyncCommand> {
        let entries = match self.retry_log.entries() {
            Ok(entries) => entries,
            Err(err) => {
                error!(error = %err, "failed to read replication retry log");
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .filter_map(|(key, value)| match serde_json::from_slice(&value) {
                Ok(command) => Some(command),
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping undecodable retry log entry");
                    None
                }
            })
            .collect()
    }

    fn log_failure(&self, command: &SyncCommand, reason: &str) {
        warn!(
            file = %command.file_name,
            dst = %command.dst,
            action = command.action.as_str(),
            reason = %reason,
            "replication push failed, recording for retry"
        );

        let payload = match serde_json::to_vec(command) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failed to encode sync command for retry log");
                return;
            }
        };
        if let Err(err) = self.retry_log.put(&command.retry_key(), &payload) {
            error!(error = %err, key = %command.retry_key(), "failed to record replication failure");
        }
    }
}
