//! The sync loop: follows the upstream message feed one block at a time.
//!
//! # Start-up
//! Persisted module settings are applied to the registry, then the stored
//! `AppConfig` is compared with the running build. A missing or drifted config
//! (or an operator-forced reparse) wipes every purgeable view and restarts
//! from the genesis checkpoint. Otherwise the last committed block is rolled
//! back onto itself once, which discards anything a crashed run wrote past it.
//!
//! # Iteration
//! Each [`SyncLoop::step`] compares the local checkpoint with the upstream tip:
//!   - behind: apply the next block (via the prefetch cache) and commit it
//!   - ahead: roll back by `max_reorg_blocks`
//!   - level: report caught-up, run the caught-up hooks once, refresh mempool
//!
//! While far behind, autopilot skips the running-info query for
//! `autopilot_run` iterations. Upstream failures become [`Step::Retry`]; a
//! block that fails to apply is rolled back to the last committed block.
//! Only integrity violations escape as errors.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use blockfeed_core::config::{Network, SyncConfig};
use blockfeed_core::error::FeedError;
use blockfeed_core::handler::{MessageOutcome, ProcessorRegistry};
use blockfeed_core::model::AppConfig;
use blockfeed_core::reorg::{RollbackReport, RollbackTarget, RollbackTrigger};
use blockfeed_core::state::{SyncPhase, SyncSnapshot, SyncState};
use blockfeed_core::store::MaterializedStore;
use blockfeed_core::types::{IndexContext, ProcessedBlock};
use blockfeed_core::upstream::{RunningInfo, UpstreamClient};

use crate::block_cache::BlockCache;
use crate::mempool::MempoolRefresher;
use crate::reorg::ReorgEngine;
use crate::views::apply_module_settings;
use crate::workers::WorkerPool;

/// Message category the upstream uses to announce a chain reorganization.
const REORG_CATEGORY: &str = "reorg";

/// What one iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// A block was applied and committed.
    Advanced { block_index: u64 },
    /// The views were rolled back.
    RolledBack { target: RollbackTarget },
    /// At the tip; nothing to do until the next poll.
    Idle,
    /// Upstream unavailable or a block failed; try again after a delay.
    Retry,
}

enum Applied {
    Committed,
    Reorg(RollbackReport),
}

pub struct SyncLoop {
    config: SyncConfig,
    upstream: Arc<dyn UpstreamClient>,
    store: Arc<dyn MaterializedStore>,
    registry: ProcessorRegistry,
    reorg: ReorgEngine,
    cache: BlockCache,
    mempool: MempoolRefresher,
    workers: Option<WorkerPool>,
    state: SyncState,
    initialized: bool,
    reparse_requested: bool,
    autopilot: bool,
    autopilot_runner: u32,
    upstream_failures: u32,
    upstream_last_message_index: i64,
    app_config: Option<AppConfig>,
    caught_up_hooks_done: HashSet<String>,
    snapshot_tx: watch::Sender<SyncSnapshot>,
}

/// Bound an upstream call; an expired timeout counts as unreachable.
pub(crate) async fn timed<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, FeedError>>,
) -> Result<T, FeedError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(FeedError::UpstreamUnreachable(format!(
            "no response within {}ms",
            limit.as_millis()
        ))),
    }
}

impl SyncLoop {
    pub(crate) fn new(
        config: SyncConfig,
        upstream: Arc<dyn UpstreamClient>,
        store: Arc<dyn MaterializedStore>,
        registry: ProcessorRegistry,
        workers: Option<WorkerPool>,
        reparse: bool,
    ) -> Self {
        let genesis = config.genesis_block();
        let (snapshot_tx, _) = watch::channel(SyncSnapshot::initial(genesis));
        Self {
            reorg: ReorgEngine::new(Arc::clone(&store), &config),
            cache: BlockCache::new(),
            mempool: MempoolRefresher::new(config.mempool_max_age_blocks),
            workers,
            state: SyncState::new(genesis),
            initialized: false,
            reparse_requested: reparse,
            autopilot: false,
            autopilot_runner: 0,
            upstream_failures: 0,
            upstream_last_message_index: -1,
            app_config: None,
            caught_up_hooks_done: HashSet::new(),
            snapshot_tx,
            config,
            upstream,
            store,
            registry,
        }
    }

    /// Receive a [`SyncSnapshot`] after every iteration.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn store(&self) -> &Arc<dyn MaterializedStore> {
        &self.store
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_autopilot(&self) -> bool {
        self.autopilot
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped) or a
    /// fatal error occurs. Shutdown is only observed between iterations.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), FeedError> {
        tracing::info!(
            network = %self.config.network,
            first_block = self.config.first_block(),
            prefetch = self.config.prefetch_count,
            "sync loop starting"
        );

        let result = loop {
            if *shutdown.borrow() || shutdown.has_changed().is_err() {
                break Ok(());
            }

            let pause = match self.step().await {
                Ok(Step::Advanced { .. }) | Ok(Step::RolledBack { .. }) => None,
                Ok(Step::Idle) => Some(self.config.poll_interval()),
                Ok(Step::Retry) => Some(self.config.retry_interval()),
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "fatal sync error, stopping");
                    break Err(e);
                }
                Err(e) => {
                    tracing::error!(error = %e, "sync iteration failed");
                    Some(self.config.retry_interval())
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break Ok(());
                        }
                    }
                }
            }
        };

        if let Some(workers) = self.workers.take() {
            workers.shutdown().await;
        }
        tracing::info!(
            local_block_index = self.state.local_block_index(),
            "sync loop stopped"
        );
        result
    }

    /// Step until caught up; returns `false` if `max_steps` ran out first.
    pub async fn run_until_caught_up(&mut self, max_steps: usize) -> Result<bool, FeedError> {
        for _ in 0..max_steps {
            if self.step().await? == Step::Idle && self.state.caught_up {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// One iteration. Never sleeps.
    pub async fn step(&mut self) -> Result<Step, FeedError> {
        if !self.initialized {
            self.initialize().await?;
        }

        if self.should_query_upstream() {
            let limit = self.config.upstream_timeout();
            let info = match timed(limit, self.upstream.get_running_info()).await {
                Ok(info) => info,
                Err(e) if e.is_transient() => return Ok(self.upstream_failed(e)),
                Err(e) => return Err(e),
            };
            if self.upstream_failures > 0 {
                tracing::info!(failures = self.upstream_failures, "upstream reachable again");
                self.upstream_failures = 0;
            }
            if let Some(step) = self.apply_running_info(info).await? {
                return Ok(step);
            }
        }

        let tip = self.state.cp_latest_block_index;
        let local = self.state.local_block_index();
        let step = match local.cmp(&tip) {
            Ordering::Less => self.catch_up(local, tip).await?,
            Ordering::Greater => {
                tracing::warn!(local, upstream_tip = tip, "local checkpoint ahead of upstream");
                let report = self
                    .rollback_at_or_below(
                        tip.saturating_sub(self.config.max_reorg_blocks),
                        RollbackTrigger::AheadOfUpstream { upstream_tip: tip },
                    )
                    .await?;
                Step::RolledBack {
                    target: report.target,
                }
            }
            Ordering::Equal => self.at_tip(local).await?,
        };
        self.publish();
        Ok(step)
    }

    /// Operator-requested rollback. Does not require the loop to be running.
    pub async fn rollback(&mut self, target: RollbackTarget) -> Result<RollbackReport, FeedError> {
        self.rollback_with(target, RollbackTrigger::Manual).await
    }

    // ─── Start-up ─────────────────────────────────────────────────────────────

    async fn initialize(&mut self) -> Result<(), FeedError> {
        let settings = self.store.module_settings().await?;
        for name in apply_module_settings(&mut self.registry, &settings) {
            tracing::warn!(module = %name, "stored setting names an unknown module");
        }

        let stored = self.store.load_app_config().await?;
        let reparse_reason = if self.reparse_requested {
            Some("reparse requested".to_string())
        } else {
            match &stored {
                None => Some("no stored app config".to_string()),
                Some(cfg) => cfg.drift_from_build(self.config.network),
            }
        };

        match reparse_reason {
            Some(reason) => self.reparse(&reason).await?,
            None => {
                self.app_config = stored;
                match self.store.latest_processed_block().await? {
                    Some(latest) => {
                        tracing::info!(block_index = latest.block_index, "resuming from checkpoint");
                        self.rollback_with(
                            RollbackTarget::Block(latest.block_index),
                            RollbackTrigger::Startup,
                        )
                        .await?;
                    }
                    None => {
                        self.rollback_with(RollbackTarget::FullWipe, RollbackTrigger::Startup)
                            .await?;
                    }
                }
            }
        }

        self.reparse_requested = false;
        self.registry.run_startup(self.store.as_ref()).await?;
        self.initialized = true;
        self.publish();
        Ok(())
    }

    async fn reparse(&mut self, reason: &str) -> Result<(), FeedError> {
        tracing::warn!(
            %reason,
            network = %self.config.network,
            first_block = self.config.first_block(),
            "full reparse"
        );
        self.state.phase = SyncPhase::Resyncing;
        self.publish();

        self.rollback_with(RollbackTarget::FullWipe, RollbackTrigger::Reparse)
            .await?;
        let fresh = AppConfig::current(self.config.network);
        self.store.save_app_config(&fresh).await?;
        self.app_config = Some(fresh);
        Ok(())
    }

    // ─── Upstream ─────────────────────────────────────────────────────────────

    fn should_query_upstream(&mut self) -> bool {
        if !self.autopilot {
            return true;
        }
        if self.autopilot_runner == 0 {
            self.autopilot_runner = self.config.autopilot_run.max(1);
        }
        self.autopilot_runner -= 1;
        self.autopilot_runner == 0
    }

    fn upstream_failed(&mut self, e: FeedError) -> Step {
        self.upstream_failures = self.upstream_failures.saturating_add(1);
        self.autopilot = false;
        self.autopilot_runner = 0;
        let failures = self.upstream_failures;
        if failures == 1 || failures % self.config.heartbeat_every.max(1) == 0 {
            tracing::warn!(
                failures,
                error = %e,
                retry_in_ms = self.config.retry_interval_ms,
                "upstream unavailable"
            );
        } else {
            tracing::debug!(failures, error = %e, "upstream unavailable");
        }
        Step::Retry
    }

    /// Record what the upstream reports. Returns a step when the iteration
    /// should end here.
    async fn apply_running_info(&mut self, info: RunningInfo) -> Result<Option<Step>, FeedError> {
        let upstream_network = Network::from_flags(info.running_testnet, info.running_regtest);
        if upstream_network != self.config.network {
            return Err(FeedError::NetworkMismatch {
                configured: self.config.network.to_string(),
                upstream: upstream_network.to_string(),
            });
        }

        let drift = self
            .app_config
            .as_ref()
            .and_then(|cfg| cfg.drift_from_upstream(&info));
        if let Some(reason) = drift {
            let err = FeedError::VersionMismatch(reason);
            self.reparse(&err.to_string()).await?;
        }

        let network = self.config.network;
        let app_config = self
            .app_config
            .get_or_insert_with(|| AppConfig::current(network));
        if !app_config.has_upstream_fingerprint() {
            app_config.record_upstream(&info);
            self.store.save_app_config(app_config).await?;
            tracing::info!(
                version = %format!("{}.{}", info.version_major, info.version_minor),
                "upstream version recorded"
            );
        }

        self.upstream_last_message_index = info.last_message_index;
        self.state.cp_backend_block_index = info.bitcoin_block_count;
        self.state.cp_caught_up = info.db_caught_up;

        let Some(tip) = info.tip() else {
            tracing::debug!("upstream has not parsed any block yet");
            return Ok(Some(Step::Retry));
        };
        self.state.cp_latest_block_index = tip;
        Ok(None)
    }

    // ─── Behind the tip ───────────────────────────────────────────────────────

    async fn catch_up(&mut self, local: u64, tip: u64) -> Result<Step, FeedError> {
        let behind = tip - local;
        if !self.autopilot && behind > self.config.autopilot_threshold {
            tracing::info!(behind, run = self.config.autopilot_run, "autopilot engaged");
            self.autopilot = true;
            self.autopilot_runner = 0;
        }
        self.state.phase = SyncPhase::CatchingUp {
            autopilot: self.autopilot,
        };
        self.state.caught_up = false;

        let block_index = local + 1;
        let prefetch = self.config.prefetch_count.min(behind).max(1);
        match self.apply_block(block_index, prefetch, tip).await {
            Ok(Applied::Committed) => {
                if block_index >= tip && self.autopilot {
                    tracing::info!(block_index, "autopilot disengaged");
                    self.autopilot = false;
                    self.autopilot_runner = 0;
                }
                Ok(Step::Advanced { block_index })
            }
            Ok(Applied::Reorg(report)) => Ok(Step::RolledBack {
                target: report.target,
            }),
            Err(e) if e.is_fatal() => Err(e),
            // Nothing was written yet: the block itself could not be fetched.
            Err(e) if e.is_transient() && self.state.cur_block.is_none() => {
                Ok(self.upstream_failed(e))
            }
            Err(e) => {
                tracing::error!(block_index, error = %e, "block failed to apply, rolling back");
                self.rollback_at_or_below(local, RollbackTrigger::BlockFailure { block_index })
                    .await?;
                Ok(Step::Retry)
            }
        }
    }

    async fn apply_block(
        &mut self,
        block_index: u64,
        prefetch: u64,
        tip: u64,
    ) -> Result<Applied, FeedError> {
        let min_message_index = self.state.min_message_index();
        let fetched = timed(
            self.config.upstream_timeout(),
            self.cache
                .get(self.upstream.as_ref(), block_index, prefetch, min_message_index),
        )
        .await?;

        let block = ProcessedBlock::from(&fetched);
        let mut messages = fetched.messages;
        messages.sort_by_key(|m| m.message_index);
        self.state.cur_block = Some(block.clone());

        let ctx = IndexContext {
            block: &block,
            phase: self.state.phase,
            network: self.config.network,
            store: self.store.as_ref(),
        };

        let mut confirmed = Vec::new();
        let mut reorg = None;
        for msg in &messages {
            let last = self.state.last_message_index;
            if last >= 0 && msg.message_index != last + 1 {
                return Err(FeedError::ProtocolSequenceViolation {
                    block_index,
                    expected: last + 1,
                    actual: msg.message_index,
                });
            }
            self.state.last_message_index = msg.message_index;

            let data = msg.decode_bindings()?;
            if msg.category == REORG_CATEGORY {
                let reorg_block = data
                    .get("block_index")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| FeedError::Decode("reorg message without block_index".into()))?;
                reorg = Some((reorg_block, msg.message_index));
                break;
            }
            if let Some(tx_hash) = data.get("tx_hash").and_then(Value::as_str) {
                confirmed.push(tx_hash.to_string());
            }

            match self.registry.dispatch_message(msg, &data, &ctx).await? {
                MessageOutcome::Applied => {}
                MessageOutcome::Skipped { by } => {
                    tracing::trace!(message_index = msg.message_index, %by, "message skipped");
                }
                MessageOutcome::AbortBlock { by } => {
                    return Err(FeedError::BlockAborted {
                        block_index,
                        message_index: msg.message_index,
                        handler: by,
                    });
                }
            }
        }

        if let Some((reorg_block, message_index)) = reorg {
            tracing::warn!(block_index, reorg_block, message_index, "upstream reported a reorg");
            let local = self.state.local_block_index();
            let report = self
                .rollback_at_or_below(
                    reorg_block.saturating_sub(1).min(local),
                    RollbackTrigger::ReorgMessage { reorg_block },
                )
                .await?;
            // Messages re-emitted for the new chain follow the reorg message.
            self.state.last_message_index = message_index;
            return Ok(Applied::Reorg(report));
        }

        self.registry.dispatch_block(&ctx).await?;
        self.store.insert_processed_block(&block).await?;
        self.state.my_latest_block = Some(block);
        self.state.cur_block = None;

        if let Err(e) = self
            .mempool
            .on_block_committed(self.store.as_ref(), block_index, &confirmed)
            .await
        {
            tracing::warn!(block_index, error = %e, "mempool cleanup failed");
        }

        let interval = self.config.block_log_interval.max(1);
        if block_index % interval == 0 || block_index == tip {
            tracing::info!(
                block_index,
                upstream_tip = tip,
                messages = messages.len(),
                autopilot = self.autopilot,
                "block committed"
            );
        } else {
            tracing::debug!(block_index, messages = messages.len(), "block committed");
        }
        Ok(Applied::Committed)
    }

    // ─── At the tip ───────────────────────────────────────────────────────────

    async fn at_tip(&mut self, local: u64) -> Result<Step, FeedError> {
        self.autopilot = false;
        self.autopilot_runner = 0;
        self.state.caught_up = self.state.cp_caught_up;
        self.state.phase = if self.state.caught_up {
            SyncPhase::CaughtUp
        } else {
            SyncPhase::NearTip
        };
        if self.state.last_message_index == -1 {
            self.state.last_message_index = self.upstream_last_message_index;
        }

        if self.state.caught_up && !self.state.caught_up_started_events {
            if self.caught_up_hooks_done.is_empty() {
                tracing::info!(block_index = local, "caught up with upstream");
            }
            // A failing hook is retried on the next iteration; hooks that
            // already succeeded are not run again.
            self.registry
                .run_caught_up(self.store.as_ref(), &mut self.caught_up_hooks_done)
                .await?;
            self.state.caught_up_started_events = true;
        }

        let refreshed = self
            .mempool
            .refresh(
                self.upstream.as_ref(),
                self.store.as_ref(),
                &self.registry,
                self.config.network,
                local,
                self.config.upstream_timeout(),
            )
            .await;
        match refreshed {
            Ok(_) => {}
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => tracing::warn!(error = %e, "mempool refresh failed"),
        }
        Ok(Step::Idle)
    }

    // ─── Rollback ─────────────────────────────────────────────────────────────

    async fn rollback_with(
        &mut self,
        target: RollbackTarget,
        trigger: RollbackTrigger,
    ) -> Result<RollbackReport, FeedError> {
        let report = self
            .reorg
            .rollback(&mut self.state, &mut self.cache, &self.registry, target, trigger)
            .await?;
        self.autopilot = false;
        self.autopilot_runner = 0;
        self.publish();
        Ok(report)
    }

    async fn rollback_at_or_below(
        &mut self,
        at_or_below: u64,
        trigger: RollbackTrigger,
    ) -> Result<RollbackReport, FeedError> {
        let report = self
            .reorg
            .rollback_at_or_below(&mut self.state, &mut self.cache, &self.registry, at_or_below, trigger)
            .await?;
        self.autopilot = false;
        self.autopilot_runner = 0;
        self.publish();
        Ok(report)
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.state.snapshot());
    }
}
