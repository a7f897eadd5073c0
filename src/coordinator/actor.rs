//! Coordinator actor
//!
//! One task per mode owns the readers, the uploader and the retry policy.
//! Source queries and uploads run on worker tasks and report back through
//! the actor's own event channel, so every state change happens here.

use super::retry::{RetryDecision, RetryPolicy};
use super::types::{
    CoordinatorStatus, ExecutionBudget, RunState, StartOptions, StopReason, SyncEvent, SyncFailure,
};
use crate::config::HostConfig;
use crate::error::{Error, FailureClass, Result};
use crate::reader::{CountOutcome, CountStep, ReadStep, ReaderStop, TypeReader};
use crate::source::{AccessStatus, CountQuery, DataStore, FenceWindow, IncrementalQuery, QueryResult};
use crate::state::{keys, ModeField, Scope, StateKey, StateStore};
use crate::stats::StatsAggregator;
use crate::transport::UploadTransport;
use crate::types::{DeletionMarker, Mode, Record, RecordType, TierTable, Timestamp};
use crate::uploader::{strip_rejected, PreparedBatch, UploadOutcome, Uploader};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

// ============================================================================
// Messages
// ============================================================================

/// Requests accepted by a coordinator
#[derive(Debug)]
pub(crate) enum Command {
    Start(StartOptions),
    Stop(StopReason),
    /// Re-check whether the round can proceed
    Tick,
    ResetPersistentState {
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        reply: oneshot::Sender<CoordinatorStatus>,
    },
    Shutdown,
}

/// Worker completions, tagged with the generation that spawned them
#[derive(Debug)]
enum Event {
    ReadCompleted {
        reader: usize,
        generation: u64,
        result: Result<QueryResult>,
    },
    CountCompleted {
        reader: usize,
        generation: u64,
        result: Result<CountOutcome>,
    },
    UploadCompleted {
        generation: u64,
        outcome: UploadOutcome,
    },
    RetryDue {
        generation: u64,
    },
}

enum Wake {
    Command(Option<Command>),
    Event(Event),
    Change(std::result::Result<RecordType, RecvError>),
    Connectivity(bool),
    ConnectivityClosed,
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle for sending commands to one coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    mode: Mode,
    commands: mpsc::UnboundedSender<Command>,
}

impl CoordinatorHandle {
    /// Mode of the coordinator behind this handle
    pub fn mode(&self) -> Mode {
        self.mode
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| self.closed())
    }

    fn closed(&self) -> Error {
        Error::CoordinatorClosed {
            mode: self.mode.to_string(),
        }
    }

    /// Request a run; ignored while one is already in progress
    pub fn start(&self, options: StartOptions) -> Result<()> {
        self.send(Command::Start(options))
    }

    /// Request a stop
    pub fn stop(&self, reason: StopReason) -> Result<()> {
        self.send(Command::Stop(reason))
    }

    /// Nudge an idle round forward
    pub fn tick(&self) -> Result<()> {
        self.send(Command::Tick)
    }

    /// Stop and forget everything persisted for this mode
    pub async fn reset_persistent_state(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ResetPersistentState { reply })?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Current status
    pub async fn status(&self) -> Result<CoordinatorStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| self.closed())
    }

    /// Cancel in-flight work and end the actor task
    pub fn shutdown(&self) -> Result<()> {
        self.send(Command::Shutdown)
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Shared collaborators handed to each coordinator
#[derive(Clone)]
pub struct CoordinatorContext {
    pub config: Arc<HostConfig>,
    pub store: StateStore,
    pub source: Arc<dyn DataStore>,
    pub transport: Arc<dyn UploadTransport>,
    pub events: broadcast::Sender<SyncEvent>,
    pub connectivity: watch::Receiver<bool>,
}

/// Orchestrates the readers and uploader of one mode
pub struct SyncCoordinator {
    mode: Mode,
    config: Arc<HostConfig>,
    tiers: TierTable,
    record_types: Vec<RecordType>,
    store: StateStore,
    source: Arc<dyn DataStore>,
    uploader: Uploader,
    stats: StatsAggregator,
    readers: Vec<TypeReader>,
    state: RunState,
    policy: RetryPolicy,
    budget: Option<ExecutionBudget>,
    run_started: Option<Instant>,
    generation: u64,
    tasks: Vec<JoinHandle<()>>,
    outgoing: Option<PreparedBatch>,
    awaiting_connectivity: bool,
    commands: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::UnboundedSender<Event>,
    event_rx: mpsc::UnboundedReceiver<Event>,
    changes: Option<broadcast::Receiver<RecordType>>,
    connectivity: watch::Receiver<bool>,
    connectivity_open: bool,
    sync_events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
    /// Build the coordinator for `mode` and start its task
    pub fn spawn(
        mode: Mode,
        context: CoordinatorContext,
    ) -> Result<(CoordinatorHandle, JoinHandle<()>)> {
        let tiers = context.config.tier_table()?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let record_types = context.config.record_types.clone();
        let readers = record_types
            .iter()
            .map(|rt| TypeReader::new(mode, rt.clone(), context.store.clone()))
            .collect();
        let uploader = Uploader::from_config(
            mode,
            &context.config,
            context.transport,
            context.store.clone(),
        );
        let policy = RetryPolicy::new(context.config.initial_tier_index, tiers.max_index());

        let coordinator = Self {
            mode,
            config: context.config,
            tiers,
            record_types,
            stats: StatsAggregator::new(context.store.clone()),
            store: context.store,
            source: context.source,
            uploader,
            readers,
            state: RunState::Idle,
            policy,
            budget: None,
            run_started: None,
            generation: 0,
            tasks: Vec::new(),
            outgoing: None,
            awaiting_connectivity: false,
            commands: command_rx,
            event_tx,
            event_rx,
            changes: None,
            connectivity: context.connectivity,
            connectivity_open: true,
            sync_events: context.events,
        };

        let task = tokio::spawn(coordinator.run());
        Ok((
            CoordinatorHandle {
                mode,
                commands: command_tx,
            },
            task,
        ))
    }

    async fn run(mut self) {
        let tier = self.persisted_tier().await;
        self.policy = RetryPolicy::new(tier, self.tiers.max_index());
        if self.uploader.take_interrupted().await {
            warn!(mode = %self.mode, "Previous upload was interrupted, its batch will be sent again");
        }
        debug!(mode = %self.mode, tier, "Coordinator running");

        loop {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                Some(event) = self.event_rx.recv() => Wake::Event(event),
                change = next_change(&mut self.changes) => Wake::Change(change),
                changed = self.connectivity.changed(), if self.connectivity_open => match changed {
                    Ok(()) => Wake::Connectivity(*self.connectivity.borrow_and_update()),
                    Err(_) => Wake::ConnectivityClosed,
                },
            };

            let result = match wake {
                Wake::Command(None | Some(Command::Shutdown)) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Event(event) => self.handle_event(event).await,
                Wake::Change(change) => self.handle_change(change).await,
                Wake::Connectivity(online) => self.handle_connectivity(online).await,
                Wake::ConnectivityClosed => {
                    self.connectivity_open = false;
                    Ok(())
                }
            };
            if let Err(e) = result {
                self.fail(e).await;
            }
        }

        self.cancel_tasks().await;
        debug!(mode = %self.mode, "Coordinator shut down");
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Start(options) => self.start(options).await,
            Command::Stop(reason) => self.stop(reason).await,
            Command::Tick => self.on_tick().await,
            Command::ResetPersistentState { reply } => {
                let result = self.reset_persistent_state().await;
                let _ = reply.send(result);
                Ok(())
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
                Ok(())
            }
            Command::Shutdown => Ok(()),
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<()> {
        match event {
            Event::ReadCompleted {
                reader,
                generation,
                result,
            } if generation == self.generation => self.on_read_completed(reader, result).await,
            Event::CountCompleted {
                reader,
                generation,
                result,
            } if generation == self.generation => self.on_count_completed(reader, result).await,
            Event::UploadCompleted {
                generation,
                outcome,
            } if generation == self.generation => self.on_upload_completed(outcome).await,
            Event::RetryDue { generation } if generation == self.generation => {
                self.on_retry_due().await
            }
            _ => {
                debug!(mode = %self.mode, "Dropping completion from cancelled work");
                Ok(())
            }
        }
    }

    async fn handle_change(
        &mut self,
        change: std::result::Result<RecordType, RecvError>,
    ) -> Result<()> {
        match change {
            Ok(record_type) => {
                for reader in self
                    .readers
                    .iter_mut()
                    .filter(|r| r.record_type() == &record_type)
                {
                    reader.note_change();
                }
            }
            Err(RecvError::Lagged(missed)) => {
                debug!(mode = %self.mode, missed, "Change notifications lagged");
                for reader in &mut self.readers {
                    reader.note_change();
                }
            }
            Err(RecvError::Closed) => {
                self.changes = None;
                return Ok(());
            }
        }

        if self.state == RunState::Armed {
            debug!(mode = %self.mode, "New data while armed");
            return self.start(StartOptions::new()).await;
        }
        Ok(())
    }

    async fn handle_connectivity(&mut self, online: bool) -> Result<()> {
        debug!(mode = %self.mode, online, "Connectivity changed");
        if online && self.awaiting_connectivity && self.state == RunState::RetryScheduled {
            info!(mode = %self.mode, "Connectivity restored, resuming");
            self.awaiting_connectivity = false;
            return self.start(StartOptions::retry()).await;
        }
        Ok(())
    }

    async fn fail(&mut self, error: Error) {
        let reason = match &error {
            Error::Cancelled => StopReason::Cancelled,
            other => StopReason::Failed(SyncFailure::from_error(other)),
        };
        if let Err(e) = self.stop(reason).await {
            error!(mode = %self.mode, error = %e, "Failed to stop after error");
        }
    }

    // ========================================================================
    // Start
    // ========================================================================

    async fn start(&mut self, options: StartOptions) -> Result<()> {
        if self.state.is_running() && !options.is_retry {
            debug!(mode = %self.mode, state = %self.state, "Start ignored, run in progress");
            return Ok(());
        }

        let continuing = options.is_retry || self.state == RunState::Armed;
        self.cancel_tasks().await;
        self.awaiting_connectivity = false;

        if !continuing {
            let tier = match options.tier_index {
                Some(tier) => tier,
                None => self.persisted_tier().await,
            };
            self.policy = RetryPolicy::new(tier, self.tiers.max_index())
                .with_attempts(options.attempts.unwrap_or(1));
            self.budget = options
                .budget
                .map(|allowance| ExecutionBudget::new(allowance, self.config.budget_expiry_threshold()));
            self.run_started = Some(Instant::now());
        }

        if let Err(e) = self.preflight().await {
            warn!(mode = %self.mode, error = %e, "Preflight check failed");
            if !continuing {
                self.emit(SyncEvent::RunStarted { mode: self.mode });
            }
            let failure = SyncFailure::from_error(&e).with_class(FailureClass::Configuration);
            return self.end_run(StopReason::Failed(failure)).await;
        }

        if self.mode == Mode::Historical
            && !continuing
            && !self.store.get_bool(&self.key(ModeField::IsResumable)).await
        {
            info!(mode = %self.mode, "Starting a new backfill");
            self.reset_mode_state().await?;
        }

        let fence = self.establish_fence().await?;
        let window = match self.mode {
            Mode::Live => FenceWindow::from(fence),
            Mode::Historical => FenceWindow::until(fence),
        };
        let read_limit = self.read_limit();
        for reader in &mut self.readers {
            reader.load().await?;
            reader.reset_for_next_round();
            reader.set_window(window);
            reader.set_read_limit(read_limit);
        }

        if self.mode == Mode::Historical {
            self.store
                .set_bool(&self.key(ModeField::IsResumable), true)
                .await?;
        }
        if self.mode == Mode::Live && self.changes.is_none() {
            self.changes = Some(self.source.observe_changes());
        }

        if !continuing {
            info!(
                mode = %self.mode,
                tier = self.policy.tier_index(),
                read_limit,
                budget_ms = ?self.budget.map(|b| b.remaining().as_millis()),
                "Run started"
            );
            self.emit(SyncEvent::RunStarted { mode: self.mode });
            self.emit(SyncEvent::ProgressUpdated { mode: self.mode });
        }

        let needs_counting = self.mode == Mode::Historical
            && !self
                .store
                .get_bool(&self.key(ModeField::CountingComplete))
                .await;
        if needs_counting {
            self.begin_counting()
        } else {
            self.transition(RunState::Reading)?;
            let all: Vec<usize> = (0..self.readers.len()).collect();
            self.begin_reading(&all).await
        }
    }

    async fn preflight(&self) -> Result<()> {
        let account = match self.store.get_text(&keys::account_id()).await {
            Some(id) => Some(id),
            None => self.config.account_id.clone(),
        };
        if account.as_deref().map_or(true, str::is_empty) {
            return Err(Error::missing_field("account_id"));
        }
        if self
            .config
            .upload_target_id
            .as_deref()
            .map_or(true, str::is_empty)
        {
            return Err(Error::missing_field("upload_target_id"));
        }

        match self.source.request_access(&self.record_types).await? {
            AccessStatus::Granted => Ok(()),
            AccessStatus::Denied => Err(Error::AccessDenied {
                types: self
                    .record_types
                    .iter()
                    .map(RecordType::as_str)
                    .collect::<Vec<_>>()
                    .join(", "),
            }),
        }
    }

    /// Fence for this mode, adopting the other mode's fence when one exists
    async fn establish_fence(&self) -> Result<Timestamp> {
        let own = self.key(ModeField::FenceDate);
        if let Some(fence) = self.store.get_time(&own).await {
            return Ok(fence);
        }

        let other = ModeField::FenceDate.key(self.mode.other());
        let fence = match self.store.get_time(&other).await {
            Some(shared) => shared,
            None => {
                let lookback = chrono::Duration::from_std(self.config.live_lookback())
                    .map_err(|e| Error::invalid_value("live_lookback_secs", e.to_string()))?;
                Utc::now() - lookback
            }
        };
        self.store.set_time(&own, fence).await?;
        info!(mode = %self.mode, %fence, "Established fence");
        Ok(fence)
    }

    fn read_limit(&self) -> usize {
        let batch_limit = self.tiers.get(self.policy.tier_index()).batch_limit;
        match self.budget {
            Some(_) => (batch_limit / self.readers.len().max(1)).max(1),
            None => batch_limit,
        }
    }

    // ========================================================================
    // Counting
    // ========================================================================

    fn begin_counting(&mut self) -> Result<()> {
        self.transition(RunState::Counting)?;
        info!(mode = %self.mode, types = self.readers.len(), "Counting records");
        self.emit(SyncEvent::CountingStarted { mode: self.mode });

        let page_size = self.config.count_page_size;
        for index in 0..self.readers.len() {
            let query = self.readers[index].start_counting(page_size);
            self.spawn_count(index, query);
        }
        Ok(())
    }

    async fn on_count_completed(
        &mut self,
        index: usize,
        result: Result<CountOutcome>,
    ) -> Result<()> {
        if self.state != RunState::Counting || index >= self.readers.len() {
            return Ok(());
        }
        let failure = result.as_ref().err().map(SyncFailure::from_error);

        match self.readers[index].apply_count_outcome(result) {
            Some(CountStep::Next(query)) => {
                self.spawn_count(index, query);
                Ok(())
            }
            Some(CountStep::Finished) => {
                self.readers[index].finish_counting().await?;
                if self.readers.iter().any(TypeReader::is_counting) {
                    return Ok(());
                }
                self.finish_counting().await
            }
            Some(CountStep::Failed(message)) => {
                let failure = failure.unwrap_or(SyncFailure {
                    class: FailureClass::Retryable,
                    message,
                    status: None,
                });
                self.stop(StopReason::Failed(failure)).await
            }
            None => Ok(()),
        }
    }

    async fn finish_counting(&mut self) -> Result<()> {
        self.store
            .set_bool(&self.key(ModeField::CountingComplete), true)
            .await?;
        let progress = self.stats.refresh(self.mode, &self.record_types).await?;
        info!(
            mode = %self.mode,
            total = progress.total_samples_count,
            days = progress.total_days,
            "Counting complete"
        );
        self.emit(SyncEvent::CountingFinished { mode: self.mode });
        self.emit(SyncEvent::ProgressUpdated { mode: self.mode });

        self.transition(RunState::Reading)?;
        let all: Vec<usize> = (0..self.readers.len()).collect();
        self.begin_reading(&all).await
    }

    // ========================================================================
    // Reading & Batch Assembly
    // ========================================================================

    async fn begin_reading(&mut self, indices: &[usize]) -> Result<()> {
        for &index in indices {
            if let ReadStep::Query(query) = self.readers[index].start_reading() {
                self.spawn_read(index, query);
            }
        }
        self.after_reader_stop().await
    }

    async fn on_read_completed(&mut self, index: usize, result: Result<QueryResult>) -> Result<()> {
        if self.state != RunState::Reading || index >= self.readers.len() {
            return Ok(());
        }
        let failure = result.as_ref().err().map(SyncFailure::from_error);

        match self.readers[index].apply_read_result(result) {
            Some(ReaderStop::Error(message)) => {
                let failure = failure.unwrap_or(SyncFailure {
                    class: FailureClass::Retryable,
                    message,
                    status: None,
                });
                self.stop(StopReason::Failed(failure)).await
            }
            Some(_) => self.after_reader_stop().await,
            None => Ok(()),
        }
    }

    /// Assemble a batch once every reader of the round has stopped
    async fn after_reader_stop(&mut self) -> Result<()> {
        if self.state != RunState::Reading
            || self.outgoing.is_some()
            || self.readers.iter().any(TypeReader::is_reading)
        {
            return Ok(());
        }
        self.upload_next().await
    }

    async fn upload_next(&mut self) -> Result<()> {
        let tier = self.tiers.get(self.policy.tier_index());
        loop {
            let records = self.merge_records(tier.batch_limit);
            let deletions = self.drain_deletions(tier.delete_limit);
            if records.is_empty() && deletions.is_empty() {
                return self.complete_round().await;
            }

            let batch = self.uploader.prepare(records, deletions);
            if batch.is_empty() {
                continue;
            }
            self.transition(RunState::Uploading)?;
            self.spawn_upload(batch, tier.timeout).await;
            return Ok(());
        }
    }

    /// Pop up to `limit` records across readers in upload order; ties go to the earlier reader
    fn merge_records(&mut self, limit: usize) -> Vec<Record> {
        let order = self.mode.sort_order();
        let mut merged = Vec::new();

        while merged.len() < limit {
            let mut best: Option<(usize, Timestamp)> = None;
            for (index, reader) in self.readers.iter().enumerate() {
                if let Some(time) = reader.next_record_time() {
                    if best.map_or(true, |(_, best_time)| order.precedes(time, best_time)) {
                        best = Some((index, time));
                    }
                }
            }

            let Some((index, _)) = best else {
                break;
            };
            match self.readers[index].pop_next_record() {
                Some(record) => merged.push(record),
                None => break,
            }
        }
        merged
    }

    fn drain_deletions(&mut self, limit: usize) -> Vec<DeletionMarker> {
        let mut drained = Vec::new();
        for reader in &mut self.readers {
            while drained.len() < limit {
                match reader.next_deletion() {
                    Some(deletion) => drained.push(deletion),
                    None => break,
                }
            }
        }
        drained
    }

    // ========================================================================
    // Upload Completion
    // ========================================================================

    async fn on_upload_completed(&mut self, outcome: UploadOutcome) -> Result<()> {
        if self.state != RunState::Uploading {
            return Ok(());
        }
        let Some(batch) = self.outgoing.take() else {
            return Ok(());
        };
        self.uploader.mark_pending(false).await;

        match outcome {
            UploadOutcome::Success => self.on_batch_accepted(&batch).await,
            UploadOutcome::PartialRejection { indices } => {
                let remaining = match strip_rejected(&batch.records, &indices) {
                    Ok(remaining) => remaining,
                    Err(e) => {
                        return self
                            .stop(StopReason::Failed(SyncFailure::from_error(&e)))
                            .await
                    }
                };
                warn!(
                    mode = %self.mode,
                    rejected = indices.len(),
                    remaining = remaining.len(),
                    "Remote rejected items, resending the rest"
                );

                let resend = self.uploader.prepare(remaining, batch.deletions.clone());
                if resend.is_empty() {
                    return self.upload_next().await;
                }
                let timeout = self.tiers.get(self.policy.tier_index()).timeout;
                self.spawn_upload(resend, timeout).await;
                Ok(())
            }
            UploadOutcome::Failed(Error::Cancelled) => self.stop(StopReason::Cancelled).await,
            UploadOutcome::Failed(e) => {
                self.stop(StopReason::Failed(SyncFailure::from_error(&e)))
                    .await
            }
        }
    }

    async fn on_batch_accepted(&mut self, batch: &PreparedBatch) -> Result<()> {
        for record in &batch.records {
            if let Some(reader) = self.reader_for(&record.record_type) {
                reader.note_uploaded(record);
            }
        }
        for deletion in &batch.deletions {
            if let Some(reader) = self.reader_for(&deletion.record_type) {
                reader.note_deletes_uploaded(1);
            }
        }

        debug!(
            mode = %self.mode,
            samples = batch.records.len(),
            deletes = batch.deletions.len(),
            "Batch accepted"
        );
        self.emit(SyncEvent::UploadSucceeded {
            mode: self.mode,
            samples: batch.records.len(),
            deletes: batch.deletions.len(),
        });
        self.upload_next().await
    }

    /// Every buffered item is uploaded: persist cursors and stats, then read again or finish
    async fn complete_round(&mut self) -> Result<()> {
        let uploaded = self.readers.iter().any(|r| !r.round_stats().is_empty());
        let now = Utc::now();
        for reader in &mut self.readers {
            reader.commit_round(now).await?;
        }

        if uploaded {
            self.stats.refresh(self.mode, &self.record_types).await?;
            self.policy.on_success();
            self.persist_tier().await?;
            self.emit(SyncEvent::ProgressUpdated { mode: self.mode });

            if self.budget.as_ref().is_some_and(ExecutionBudget::is_expiring) {
                info!(mode = %self.mode, "Execution budget nearly spent");
                return self.stop(StopReason::BudgetExpiring).await;
            }
        }

        let more: Vec<usize> = self
            .readers
            .iter()
            .enumerate()
            .filter(|(_, r)| r.more_to_read())
            .map(|(index, _)| index)
            .collect();
        let read_limit = self.read_limit();
        for reader in &mut self.readers {
            reader.reset_for_next_round();
            reader.set_read_limit(read_limit);
        }

        if !more.is_empty() {
            self.transition(RunState::Reading)?;
            // Reading can loop straight back here, so the future needs indirection
            return Box::pin(self.begin_reading(&more)).await;
        }

        match self.mode {
            Mode::Historical => self.stop(StopReason::UploadComplete).await,
            Mode::Live => {
                self.transition(RunState::Armed)?;
                debug!(mode = %self.mode, "Caught up, waiting for new data");
                Ok(())
            }
        }
    }

    async fn on_tick(&mut self) -> Result<()> {
        if self.state == RunState::Reading {
            return self.after_reader_stop().await;
        }
        Ok(())
    }

    async fn on_retry_due(&mut self) -> Result<()> {
        if self.state != RunState::RetryScheduled || self.awaiting_connectivity {
            return Ok(());
        }
        debug!(mode = %self.mode, "Retry due");
        self.start(StartOptions::retry()).await
    }

    // ========================================================================
    // Stop
    // ========================================================================

    /// The single exit for every failure and stop request
    async fn stop(&mut self, reason: StopReason) -> Result<()> {
        if !self.state.is_active() {
            debug!(mode = %self.mode, %reason, state = %self.state, "Stop ignored, not running");
            return Ok(());
        }
        self.end_run(reason).await
    }

    /// Single exit for a run: failures go through the retry policy, and
    /// anything it does not retry ends in [`Self::terminate`]
    async fn end_run(&mut self, reason: StopReason) -> Result<()> {
        for reader in &mut self.readers {
            reader.stop_reading();
        }
        self.cancel_tasks().await;

        let reason = match reason {
            StopReason::Failed(failure) => {
                let online = *self.connectivity.borrow();
                let failure = if !online && failure.class.is_retryable() {
                    failure.with_class(FailureClass::Connectivity)
                } else {
                    failure
                };

                match self.policy.on_failure(failure.class) {
                    RetryDecision::Retry => return self.schedule_retry(&failure, false).await,
                    RetryDecision::AwaitConnectivity => {
                        return self.schedule_retry(&failure, !online).await
                    }
                    RetryDecision::GiveUp => {
                        warn!(
                            mode = %self.mode,
                            class = ?failure.class,
                            reason = %failure.message,
                            "Giving up"
                        );
                    }
                }
                StopReason::Failed(failure)
            }
            other => other,
        };

        self.terminate(reason).await;
        Ok(())
    }

    async fn schedule_retry(&mut self, failure: &SyncFailure, await_connectivity: bool) -> Result<()> {
        self.transition(RunState::RetryScheduled)?;
        self.awaiting_connectivity = await_connectivity;
        self.persist_tier().await?;

        warn!(
            mode = %self.mode,
            tier = self.policy.tier_index(),
            attempts = self.policy.attempts_remaining(),
            await_connectivity,
            reason = %failure.message,
            "Upload attempt failed, retry scheduled"
        );
        self.emit(SyncEvent::RetryScheduled {
            mode: self.mode,
            tier_index: self.policy.tier_index(),
            attempts_remaining: self.policy.attempts_remaining(),
            reason: failure.message.clone(),
        });

        if !await_connectivity {
            let delay = self.config.retry_delay();
            let events = self.event_tx.clone();
            let generation = self.generation;
            self.track(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(Event::RetryDue { generation });
            }));
        }
        Ok(())
    }

    /// Enter `Stopped`, persisting the final flags and stats
    async fn terminate(&mut self, reason: StopReason) {
        self.changes = None;
        self.awaiting_connectivity = false;
        self.budget = None;

        if let Err(e) = self.record_stop(&reason).await {
            warn!(mode = %self.mode, error = %e, "Failed to persist final state");
        }
        if let Err(e) = self.transition(RunState::Stopped(reason.clone())) {
            warn!(mode = %self.mode, error = %e, "Failed to enter stopped state");
        }

        let duration_ms = self
            .run_started
            .take()
            .map(|started| started.elapsed().as_millis() as u64);
        let progress = self.stats.global_progress(self.mode).await;
        info!(
            mode = %self.mode,
            %reason,
            samples = progress.total_samples_upload_count,
            deletes = progress.total_deletes_upload_count,
            duration_ms = ?duration_ms,
            "Run stopped"
        );
        self.emit(SyncEvent::RunStopped {
            mode: self.mode,
            reason,
        });
    }

    async fn record_stop(&self, reason: &StopReason) -> Result<()> {
        if self.mode == Mode::Historical {
            let resumable = matches!(
                reason,
                StopReason::Failed(_) | StopReason::BudgetExpiring | StopReason::Cancelled
            );
            self.store
                .set_bool(&self.key(ModeField::IsResumable), resumable)
                .await?;

            if *reason == StopReason::UploadComplete {
                self.stats.finish_historical(&self.record_types).await?;
                self.store
                    .set_bool(&self.key(ModeField::CountingComplete), false)
                    .await?;
            }
        }
        self.stats.refresh(self.mode, &self.record_types).await?;
        self.persist_tier().await
    }

    async fn reset_persistent_state(&mut self) -> Result<()> {
        if self.state.is_active() {
            self.stop(StopReason::TurnedOff).await?;
        }
        self.cancel_tasks().await;
        self.reset_mode_state().await?;
        self.transition(RunState::Idle)?;
        self.policy = RetryPolicy::new(self.config.initial_tier_index, self.tiers.max_index());
        Ok(())
    }

    async fn reset_mode_state(&mut self) -> Result<()> {
        for reader in &mut self.readers {
            reader.reset_persistent_state().await?;
        }
        self.store.reset_scope(Scope::for_mode(self.mode)).await
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn transition(&mut self, next: RunState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(&next) {
            error!(mode = %self.mode, from = %self.state, to = %next, "Invalid run state transition");
            return Err(Error::InvalidTransition {
                from: self.state.name().to_string(),
                to: next.name().to_string(),
            });
        }
        debug!(mode = %self.mode, from = %self.state, to = %next, "Run state transition");
        self.state = next;
        Ok(())
    }

    /// Abort worker tasks and drop their pending completions
    async fn cancel_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.generation = self.generation.wrapping_add(1);
        self.outgoing = None;
        self.uploader.cancel_tasks().await;
    }

    fn track(&mut self, task: JoinHandle<()>) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn spawn_read(&mut self, index: usize, query: IncrementalQuery) {
        let source = Arc::clone(&self.source);
        let events = self.event_tx.clone();
        let generation = self.generation;
        self.track(tokio::spawn(async move {
            let result = source.query_incremental(&query).await;
            let _ = events.send(Event::ReadCompleted {
                reader: index,
                generation,
                result,
            });
        }));
    }

    fn spawn_count(&mut self, index: usize, query: CountQuery) {
        let source = Arc::clone(&self.source);
        let events = self.event_tx.clone();
        let generation = self.generation;
        self.track(tokio::spawn(async move {
            let result = count_page(source.as_ref(), &query).await;
            let _ = events.send(Event::CountCompleted {
                reader: index,
                generation,
                result,
            });
        }));
    }

    async fn spawn_upload(&mut self, batch: PreparedBatch, timeout: Duration) {
        self.uploader.mark_pending(true).await;
        let uploader = self.uploader.clone();
        let events = self.event_tx.clone();
        let generation = self.generation;
        let outgoing = batch.clone();
        self.outgoing = Some(batch);
        self.track(tokio::spawn(async move {
            let outcome = uploader.send_batch(&outgoing, timeout).await;
            let _ = events.send(Event::UploadCompleted {
                generation,
                outcome,
            });
        }));
    }

    fn reader_for(&mut self, record_type: &RecordType) -> Option<&mut TypeReader> {
        self.readers
            .iter_mut()
            .find(|r| r.record_type() == record_type)
    }

    fn key(&self, field: ModeField) -> StateKey {
        field.key(self.mode)
    }

    async fn persisted_tier(&self) -> usize {
        let stored = self.store.get_opt_int(&self.key(ModeField::TierIndex)).await;
        let tier = stored.map_or(self.config.initial_tier_index, |t| t.max(0) as usize);
        self.tiers.clamp(tier)
    }

    async fn persist_tier(&self) -> Result<()> {
        self.store
            .set_int(&self.key(ModeField::TierIndex), self.policy.tier_index() as i64)
            .await
    }

    fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            mode: self.mode,
            state: self.state.clone(),
            tier_index: self.policy.tier_index(),
            max_tier_index: self.policy.max_tier_index(),
            attempts_remaining: self.policy.attempts_remaining(),
            is_uploading: self.outgoing.is_some(),
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is not an error
        let _ = self.sync_events.send(event);
    }
}

/// First page also fetches the type's full date range
async fn count_page(source: &dyn DataStore, query: &CountQuery) -> Result<CountOutcome> {
    let range = if query.cursor.is_none() {
        source.query_full_range(&query.record_type).await?
    } else {
        None
    };
    let page = source.count_records(query).await?;
    Ok(CountOutcome { range, page })
}

async fn next_change(
    changes: &mut Option<broadcast::Receiver<RecordType>>,
) -> std::result::Result<RecordType, RecvError> {
    match changes {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
