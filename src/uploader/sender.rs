//! Uploader implementation

use super::body::{build_create_body, build_delete_body};
use super::response::interpret_create_failure;
use super::types::{PreparedBatch, UploadOutcome};
use crate::config::HostConfig;
use crate::error::Error;
use crate::state::{ModeField, StateStore};
use crate::transport::{TransportResponse, UploadTransport};
use crate::types::{DeletionMarker, JsonValue, Mode, Record};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sends prepared batches for one mode
#[derive(Clone)]
pub struct Uploader {
    mode: Mode,
    transport: Arc<dyn UploadTransport>,
    store: StateStore,
    auth_token: Option<String>,
    simulate: bool,
    suppress_deletes: bool,
    include_sensitive_info: bool,
}

impl Uploader {
    /// Create an uploader with every flag off
    pub fn new(mode: Mode, transport: Arc<dyn UploadTransport>, store: StateStore) -> Self {
        Self {
            mode,
            transport,
            store,
            auth_token: None,
            simulate: false,
            suppress_deletes: false,
            include_sensitive_info: false,
        }
    }

    /// Create an uploader with flags taken from the host configuration
    pub fn from_config(
        mode: Mode,
        config: &HostConfig,
        transport: Arc<dyn UploadTransport>,
        store: StateStore,
    ) -> Self {
        Self::new(mode, transport, store)
            .with_simulate(config.simulate)
            .with_suppress_deletes(config.suppress_deletes)
            .with_sensitive_info(config.include_sensitive_info, config.auth_token.clone())
    }

    /// Report success without touching the network
    #[must_use]
    pub fn with_simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    /// Never send deletions
    #[must_use]
    pub fn with_suppress_deletes(mut self, suppress: bool) -> Self {
        self.suppress_deletes = suppress;
        self
    }

    /// Log full requests, token included, when an attempt fails
    #[must_use]
    pub fn with_sensitive_info(mut self, include: bool, auth_token: Option<String>) -> Self {
        self.include_sensitive_info = include;
        self.auth_token = auth_token;
        self
    }

    /// Mode this uploader serves
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Whether deletions are sent at all
    pub fn deletes_allowed(&self) -> bool {
        self.mode == Mode::Live && !self.suppress_deletes
    }

    /// Serialize a batch, dropping unrepresentable items and disallowed deletions
    pub fn prepare(&self, records: Vec<Record>, deletions: Vec<DeletionMarker>) -> PreparedBatch {
        let (records, create_body) = build_create_body(records);
        let (deletions, delete_body) = if self.deletes_allowed() {
            build_delete_body(deletions)
        } else {
            if !deletions.is_empty() {
                debug!(mode = %self.mode, count = deletions.len(), "Skipping deletions");
            }
            (Vec::new(), None)
        };

        PreparedBatch {
            records,
            deletions,
            create_body,
            delete_body,
        }
    }

    /// Send the create call, then the delete call, as one attempt
    pub async fn send_batch(&self, batch: &PreparedBatch, timeout: Duration) -> UploadOutcome {
        if batch.is_empty() {
            return UploadOutcome::Success;
        }
        if self.simulate {
            info!(
                mode = %self.mode,
                records = batch.records.len(),
                deletions = batch.deletions.len(),
                "Simulating upload"
            );
            return UploadOutcome::Success;
        }

        self.send_calls(batch, timeout).await
    }

    async fn send_calls(&self, batch: &PreparedBatch, timeout: Duration) -> UploadOutcome {
        if let Some(body) = &batch.create_body {
            match self.transport.create_batch(body, timeout).await {
                Ok(response) if response.is_success() => {
                    debug!(mode = %self.mode, records = batch.records.len(), "Create batch accepted");
                }
                Ok(response) => {
                    self.log_failure("POST", body, Some(&response));
                    return interpret_create_failure(response);
                }
                Err(e) => {
                    self.log_failure("POST", body, None);
                    return UploadOutcome::Failed(e);
                }
            }
        }

        if let Some(body) = &batch.delete_body {
            match self.transport.delete_batch(body, timeout).await {
                Ok(response) if response.is_success() => {
                    debug!(mode = %self.mode, deletions = batch.deletions.len(), "Delete batch accepted");
                }
                Ok(response) => {
                    self.log_failure("DELETE", body, Some(&response));
                    return UploadOutcome::Failed(Error::http_status(response.status, response.body));
                }
                Err(e) => {
                    self.log_failure("DELETE", body, None);
                    return UploadOutcome::Failed(e);
                }
            }
        }

        UploadOutcome::Success
    }

    /// Whether an attempt was in flight when the flag was last written
    pub async fn has_pending_upload(&self) -> bool {
        self.store
            .get_bool(&ModeField::HasPendingUploads.key(self.mode))
            .await
    }

    /// Clear a flag left behind by a process that died mid-attempt.
    ///
    /// Returns whether one was found. The interrupted batch was never
    /// committed, so the next round sends it again.
    pub async fn take_interrupted(&self) -> bool {
        if !self.has_pending_upload().await {
            return false;
        }
        self.mark_pending(false).await;
        true
    }

    /// Clear the pending flag after in-flight work was dropped
    pub async fn cancel_tasks(&self) {
        if self.has_pending_upload().await {
            debug!(mode = %self.mode, "Clearing pending upload flag");
            self.mark_pending(false).await;
        }
    }

    /// Record whether an attempt is in flight.
    ///
    /// Only the owning coordinator writes the flag, so a cancelled attempt can
    /// never set it again after [`Uploader::cancel_tasks`].
    pub async fn mark_pending(&self, pending: bool) {
        let key = ModeField::HasPendingUploads.key(self.mode);
        if let Err(e) = self.store.set_bool(&key, pending).await {
            warn!(mode = %self.mode, error = %e, "Failed to persist pending upload flag");
        }
    }

    fn log_failure(&self, method: &str, body: &JsonValue, response: Option<&TransportResponse>) {
        let items = body.as_array().map_or(0, Vec::len);
        let status = response.map(|r| r.status);
        if self.include_sensitive_info {
            let token = self.auth_token.as_deref().unwrap_or("");
            warn!(
                mode = %self.mode,
                ?status,
                request = %format!("{method} -H 'Authorization: Bearer {token}' -d '{body}'"),
                response = response.map_or("", |r| r.body.as_str()),
                "Upload attempt failed"
            );
        } else {
            warn!(
                mode = %self.mode,
                ?status,
                items,
                request = %format!("{method} -H 'Authorization: Bearer <redacted>'"),
                "Upload attempt failed"
            );
        }
    }
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("mode", &self.mode)
            .field("simulate", &self.simulate)
            .field("suppress_deletes", &self.suppress_deletes)
            .finish_non_exhaustive()
    }
}
