//! Engine module
//!
//! Top-level owner of both mode coordinators.
//!
//! # Overview
//!
//! The engine module provides:
//! - `Engine` - Opens the persisted state, spawns one coordinator per mode
//!   and exposes start, stop, reset and progress queries
//! - `RetryInfo`, `ModeReport` - Snapshots for the host UI
//!
//! There is no global state: the host creates one `Engine` and passes it
//! around. Events are published on a broadcast bus obtained through
//! [`Engine::subscribe`]; connectivity is pushed in with
//! [`Engine::set_connected`].

mod types;

pub use types::{ModeReport, ResetTarget, RetryInfo};

use crate::config::HostConfig;
use crate::coordinator::{
    CoordinatorContext, CoordinatorHandle, CoordinatorStatus, StartOptions, StopReason,
    SyncCoordinator, SyncEvent,
};
use crate::error::Result;
use crate::source::DataStore;
use crate::state::{keys, ModeField, StateStore};
use crate::stats::{GlobalProgress, StatsAggregator, TypeStats};
use crate::transport::{HttpTransport, UploadTransport};
use crate::types::Mode;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the event bus
const EVENT_CAPACITY: usize = 256;

/// Sync engine owning the live and historical coordinators
pub struct Engine {
    config: Arc<HostConfig>,
    store: StateStore,
    stats: StatsAggregator,
    live: CoordinatorHandle,
    historical: CoordinatorHandle,
    events: broadcast::Sender<SyncEvent>,
    connectivity: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("record_types", &self.config.record_types)
            .field("store", &self.store.path())
            .field("connected", &*self.connectivity.borrow())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Open the engine over `store`, resetting state written by an older layout
    pub async fn open(
        config: HostConfig,
        store: StateStore,
        source: Arc<dyn DataStore>,
        transport: Arc<dyn UploadTransport>,
    ) -> Result<Self> {
        config.validate()?;
        if store.ensure_schema_version(keys::SCHEMA_VERSION).await? {
            warn!("Persisted state was written by an incompatible version and has been reset");
        }
        if let Some(account_id) = config.account_id.as_deref() {
            adopt_account(&store, account_id).await?;
        }

        let config = Arc::new(config);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (connectivity, connectivity_rx) = watch::channel(true);
        let context = CoordinatorContext {
            config: Arc::clone(&config),
            store: store.clone(),
            source,
            transport,
            events: events.clone(),
            connectivity: connectivity_rx,
        };

        let (live, live_task) = SyncCoordinator::spawn(Mode::Live, context.clone())?;
        let (historical, historical_task) = SyncCoordinator::spawn(Mode::Historical, context)?;
        info!(
            types = config.record_types.len(),
            in_memory = store.is_in_memory(),
            "Sync engine opened"
        );

        Ok(Self {
            stats: StatsAggregator::new(store.clone()),
            config,
            store,
            live,
            historical,
            events,
            connectivity,
            tasks: vec![live_task, historical_task],
        })
    }

    /// Open the engine with the HTTP transport described by `config`
    pub async fn with_http(
        config: HostConfig,
        store: StateStore,
        source: Arc<dyn DataStore>,
    ) -> Result<Self> {
        let transport = HttpTransport::from_host_config(&config)?;
        Self::open(config, store, source, Arc::new(transport)).await
    }

    /// Handle of one mode's coordinator
    pub fn coordinator(&self, mode: Mode) -> &CoordinatorHandle {
        match mode {
            Mode::Live => &self.live,
            Mode::Historical => &self.historical,
        }
    }

    /// Configuration the engine was opened with
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Persisted state
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ========================================================================
    // Run Control
    // ========================================================================

    /// Start a run in `mode`
    pub fn start(&self, mode: Mode) -> Result<()> {
        self.coordinator(mode).start(StartOptions::new())
    }

    /// Start a run that stops gracefully before `budget` runs out
    pub fn start_with_budget(&self, mode: Mode, budget: Duration) -> Result<()> {
        self.coordinator(mode)
            .start(StartOptions::new().with_budget(budget))
    }

    /// Turn `mode` off
    pub fn stop(&self, mode: Mode) -> Result<()> {
        self.coordinator(mode).stop(StopReason::TurnedOff)
    }

    /// Turn both modes off
    pub fn stop_all(&self) -> Result<()> {
        for mode in Mode::ALL {
            self.stop(mode)?;
        }
        Ok(())
    }

    /// Restart live, and historical if its last run ended early.
    ///
    /// Returns the modes that were started; none without an account id.
    pub async fn resume_if_resumable(&self, budget: Option<Duration>) -> Result<Vec<Mode>> {
        if self.account_id().await.is_none() {
            debug!("No account configured, nothing to resume");
            return Ok(Vec::new());
        }

        let mut started = vec![Mode::Live];
        if self.is_resumable(Mode::Historical).await {
            started.push(Mode::Historical);
        }
        for &mode in &started {
            let options = match budget {
                Some(budget) => StartOptions::new().with_budget(budget),
                None => StartOptions::new(),
            };
            self.coordinator(mode).start(options)?;
        }
        info!(modes = ?started, "Resumed sync");
        Ok(started)
    }

    /// Whether a start in `mode` continues the previous run
    pub async fn is_resumable(&self, mode: Mode) -> bool {
        match mode {
            Mode::Live => true,
            Mode::Historical => {
                self.store
                    .get_bool(&ModeField::IsResumable.key(Mode::Historical))
                    .await
            }
        }
    }

    /// Stop `mode` and forget its cursors, counters and fence
    pub async fn reset_mode(&self, mode: Mode) -> Result<()> {
        info!(%mode, "Resetting mode");
        self.coordinator(mode).reset_persistent_state().await
    }

    /// Reset one mode, or everything including the account scope
    pub async fn reset(&self, target: ResetTarget) -> Result<()> {
        for mode in target.modes() {
            self.reset_mode(mode).await?;
        }
        if target == ResetTarget::All {
            self.store.reset_all().await?;
        }
        Ok(())
    }

    /// Point the engine at another account.
    ///
    /// When `account_id` differs from the stored one, both modes stop and all
    /// persisted state is cleared before the new id is stored. Returns whether
    /// a switch happened.
    pub async fn switch_account(&self, account_id: &str) -> Result<bool> {
        let stored = self.store.get_text(&keys::account_id()).await;
        if stored.as_deref() == Some(account_id) {
            return Ok(false);
        }

        info!(from = ?stored, to = account_id, "Switching account");
        self.reset(ResetTarget::All).await?;
        self.store.set_text(&keys::account_id(), account_id).await?;
        Ok(true)
    }

    /// Account the stored progress belongs to, else the configured one
    pub async fn account_id(&self) -> Option<String> {
        match self.store.get_text(&keys::account_id()).await {
            Some(id) if !id.is_empty() => Some(id),
            _ => self.config.account_id.clone().filter(|id| !id.is_empty()),
        }
    }

    /// Re-check readiness of a mode's current round
    pub fn tick(&self, mode: Mode) -> Result<()> {
        self.coordinator(mode).tick()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Per-type stats for `mode`, in configured type order
    pub async fn stats_for_mode(&self, mode: Mode) -> Vec<TypeStats> {
        self.stats.mode_stats(mode, &self.config.record_types).await
    }

    /// Persisted summary for `mode`
    pub async fn progress(&self, mode: Mode) -> GlobalProgress {
        self.stats.global_progress(mode).await
    }

    /// Coordinator status for `mode`
    pub async fn status(&self, mode: Mode) -> Result<CoordinatorStatus> {
        self.coordinator(mode).status().await
    }

    /// Active and last tier for `mode`
    pub async fn retry_info(&self, mode: Mode) -> Result<RetryInfo> {
        let status = self.status(mode).await?;
        Ok(RetryInfo::from(&status))
    }

    /// Whether a batch of `mode` is in flight
    pub async fn is_uploading(&self, mode: Mode) -> Result<bool> {
        Ok(self.status(mode).await?.is_uploading)
    }

    /// Status, progress and per-type stats in one snapshot
    pub async fn report(&self, mode: Mode) -> Result<ModeReport> {
        Ok(ModeReport {
            mode,
            status: self.status(mode).await?,
            progress: self.progress(mode).await,
            types: self.stats_for_mode(mode).await,
            is_resumable: self.is_resumable(mode).await,
        })
    }

    // ========================================================================
    // Host Signals
    // ========================================================================

    /// Subscribe to run and progress events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Update the connectivity flag; coordinators waiting on it resume
    pub fn set_connected(&self, connected: bool) {
        let previous = self.connectivity.send_replace(connected);
        if previous != connected {
            info!(connected, "Connectivity changed");
        }
    }

    /// Current connectivity flag
    pub fn is_connected(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Cancel in-flight work and wait for both coordinators to exit.
    ///
    /// Unconfirmed batches are not committed, so the next run re-sends them.
    pub async fn shutdown(self) {
        for mode in Mode::ALL {
            let _ = self.coordinator(mode).shutdown();
        }
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Coordinator task ended abnormally");
            }
        }
        debug!("Sync engine shut down");
    }
}

/// Store `account_id`, clearing everything kept for a different account
async fn adopt_account(store: &StateStore, account_id: &str) -> Result<()> {
    match store.get_text(&keys::account_id()).await {
        Some(stored) if stored == account_id => Ok(()),
        Some(stored) => {
            info!(from = %stored, to = account_id, "Configured account changed, resetting state");
            store.reset_all().await?;
            store.set_text(&keys::account_id(), account_id).await
        }
        None => store.set_text(&keys::account_id(), account_id).await,
    }
}

#[cfg(test)]
mod tests;
