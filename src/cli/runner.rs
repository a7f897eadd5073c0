//! CLI runner - executes commands

use crate::cli::commands::{Cli, Commands, OutputFormat};
use crate::config::HostConfig;
use crate::coordinator::SyncEvent;
use crate::engine::{Engine, ResetTarget};
use crate::error::{Error, Result};
use crate::source::MemoryDataStore;
use crate::state::StateStore;
use crate::types::Mode;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, warn};

/// CLI runner
pub struct Runner {
    cli: Cli,
}

impl Runner {
    /// Create a new runner
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run the CLI command
    pub async fn run(&self) -> Result<()> {
        let engine = self.open_engine().await?;
        let result = match &self.cli.command {
            Commands::Run {
                mode,
                budget_secs,
                wait_secs,
            } => {
                self.run_mode(&engine, (*mode).into(), *budget_secs, *wait_secs)
                    .await
            }
            Commands::Resume {
                budget_secs,
                wait_secs,
            } => self.resume(&engine, *budget_secs, *wait_secs).await,
            Commands::Status { mode } => {
                let modes = match mode {
                    Some(mode) => vec![(*mode).into()],
                    None => Mode::ALL.to_vec(),
                };
                self.status(&engine, &modes).await
            }
            Commands::Reset { mode } => self.reset(&engine, (*mode).into()).await,
        };
        engine.shutdown().await;
        result
    }

    async fn open_engine(&self) -> Result<Engine> {
        let path = self
            .cli
            .config
            .as_ref()
            .ok_or_else(|| Error::config("Configuration file not specified (use -C flag)"))?;
        let config = HostConfig::from_file(path)?;

        let store = match &self.cli.state {
            Some(path) => StateStore::from_file(path)?,
            None => StateStore::in_memory(),
        };
        let source = match &self.cli.source {
            Some(path) => MemoryDataStore::from_json_file(path)?,
            None => MemoryDataStore::new(),
        };

        Engine::with_http(config, store, Arc::new(source)).await
    }

    /// Start `mode` and stream its events
    async fn run_mode(
        &self,
        engine: &Engine,
        mode: Mode,
        budget_secs: Option<u64>,
        wait_secs: u64,
    ) -> Result<()> {
        let mut events = engine.subscribe();
        match budget_secs {
            Some(secs) => engine.start_with_budget(mode, Duration::from_secs(secs))?,
            None => engine.start(mode)?,
        }

        let pending = BTreeSet::from([mode]);
        self.follow(&mut events, pending, wait_secs).await;
        self.status(engine, &[mode]).await
    }

    async fn resume(&self, engine: &Engine, budget_secs: Option<u64>, wait_secs: u64) -> Result<()> {
        let mut events = engine.subscribe();
        let started = engine
            .resume_if_resumable(budget_secs.map(Duration::from_secs))
            .await?;
        self.emit(&json!({ "resumed": started }));

        if !started.is_empty() {
            let pending = started.iter().copied().collect();
            self.follow(&mut events, pending, wait_secs).await;
        }
        self.status(engine, &Mode::ALL).await
    }

    async fn status(&self, engine: &Engine, modes: &[Mode]) -> Result<()> {
        for &mode in modes {
            let report = engine.report(mode).await?;
            self.emit(&report);
        }
        Ok(())
    }

    async fn reset(&self, engine: &Engine, target: ResetTarget) -> Result<()> {
        engine.reset(target).await?;
        let modes = target.modes();
        self.emit(&json!({ "reset": modes, "account": target == ResetTarget::All }));
        Ok(())
    }

    /// Print events until every mode in `pending` stopped or `wait_secs` elapsed.
    ///
    /// A live run arms instead of stopping, so it usually ends on the deadline.
    async fn follow(
        &self,
        events: &mut tokio::sync::broadcast::Receiver<SyncEvent>,
        mut pending: BTreeSet<Mode>,
        wait_secs: u64,
    ) {
        let deadline = Instant::now() + Duration::from_secs(wait_secs);
        while !pending.is_empty() {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(event)) => event,
                Ok(Err(RecvError::Lagged(missed))) => {
                    warn!(missed, "Event output fell behind");
                    continue;
                }
                Ok(Err(RecvError::Closed)) => break,
                Err(_) => {
                    debug!(modes = ?pending, "Wait time elapsed");
                    break;
                }
            };

            if let SyncEvent::RunStopped { mode, .. } = &event {
                pending.remove(mode);
            }
            self.emit(&event);
        }
    }

    fn emit(&self, value: &impl Serialize) {
        let line = match self.cli.format {
            OutputFormat::Json => serde_json::to_string(value),
            OutputFormat::Pretty => serde_json::to_string_pretty(value),
        };
        match line {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "Failed to serialize output"),
        }
    }
}
