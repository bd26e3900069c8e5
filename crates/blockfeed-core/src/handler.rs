//! Processor traits and the ordered processor registry.
//!
//! Independently-owned concerns (asset tracking, balances, trades, feeds)
//! subscribe to channels with a priority. Every confirmed message runs through
//! the enabled message processors in descending priority; each one answers
//! with a [`ControlSignal`] deciding whether the chain continues.

use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::FeedError;
use crate::reorg::RollbackTarget;
use crate::store::MaterializedStore;
use crate::types::{IndexContext, MempoolContext};
use crate::upstream::{MempoolTx, Message};

/// What a message processor wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    /// Fall through to the next processor.
    Continue,
    /// Stop the chain for this message; move on to the next message.
    AbortMessage,
    /// Stop the whole block; it is rolled back and retried.
    AbortBlock,
}

/// Called for each confirmed message.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(
        &self,
        msg: &Message,
        data: &Value,
        ctx: &IndexContext<'_>,
    ) -> Result<ControlSignal, FeedError>;
}

/// Called for each newly seen unconfirmed transaction.
#[async_trait]
pub trait MempoolProcessor: Send + Sync {
    async fn process(
        &self,
        tx: &MempoolTx,
        data: &Value,
        ctx: &MempoolContext<'_>,
    ) -> Result<ControlSignal, FeedError>;
}

/// Called once per block, after its messages and before it is committed.
#[async_trait]
pub trait BlockProcessor: Send + Sync {
    async fn process_block(&self, ctx: &IndexContext<'_>) -> Result<(), FeedError>;
}

/// Start-up and caught-up lifecycle hooks.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    async fn run(&self, store: &dyn MaterializedStore) -> Result<(), FeedError>;
}

/// Called on every rollback so each view can drop what it derived past the target.
#[async_trait]
pub trait RollbackProcessor: Send + Sync {
    async fn rollback(
        &self,
        target: RollbackTarget,
        store: &dyn MaterializedStore,
    ) -> Result<(), FeedError>;
}

// ─── Channel ──────────────────────────────────────────────────────────────────

/// One registered handler.
pub struct Subscription<H: ?Sized> {
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    handler: Arc<H>,
}

/// An enabled handler in dispatch order.
pub struct ActiveHandler<H: ?Sized> {
    pub name: String,
    pub handler: Arc<H>,
}

/// Handlers subscribed to one channel.
///
/// The dispatch order (enabled only, descending priority, ties by
/// registration order) is computed lazily and cached until the next change.
pub struct Channel<H: ?Sized> {
    subscriptions: Vec<Subscription<H>>,
    active: OnceLock<Vec<ActiveHandler<H>>>,
}

impl<H: ?Sized> Default for Channel<H> {
    fn default() -> Self {
        Self {
            subscriptions: Vec::new(),
            active: OnceLock::new(),
        }
    }
}

impl<H: ?Sized> Channel<H> {
    pub fn subscribe(&mut self, name: impl Into<String>, priority: i32, enabled: bool, handler: Arc<H>) {
        self.subscriptions.push(Subscription {
            name: name.into(),
            priority,
            enabled,
            handler,
        });
        self.active = OnceLock::new();
    }

    /// Toggle every subscription named `name`; returns `true` if any matched.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for sub in self.subscriptions.iter_mut().filter(|s| s.name == name) {
            sub.enabled = enabled;
            found = true;
        }
        if found {
            self.active = OnceLock::new();
        }
        found
    }

    /// Enabled handlers in dispatch order.
    pub fn active_handlers(&self) -> &[ActiveHandler<H>] {
        self.active.get_or_init(|| {
            let mut ordered: Vec<(usize, &Subscription<H>)> = self
                .subscriptions
                .iter()
                .enumerate()
                .filter(|(_, s)| s.enabled)
                .collect();
            // Stable sort keeps registration order among equal priorities.
            ordered.sort_by_key(|(_, s)| Reverse(s.priority));
            ordered
                .into_iter()
                .map(|(_, s)| ActiveHandler {
                    name: s.name.clone(),
                    handler: Arc::clone(&s.handler),
                })
                .collect()
        })
    }

    pub fn subscriptions(&self) -> &[Subscription<H>] {
        &self.subscriptions
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Result of running one message through the processor chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Every processor returned `Continue`.
    Applied,
    /// A processor stopped the chain for this message.
    Skipped { by: String },
    /// A processor abandoned the block.
    AbortBlock { by: String },
}

/// Listing entry for `listmod`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub channel: &'static str,
    pub priority: i32,
    pub enabled: bool,
}

/// Registry of message, mempool, block, lifecycle and rollback processors.
#[derive(Default)]
pub struct ProcessorRegistry {
    messages: Channel<dyn MessageProcessor>,
    mempool: Channel<dyn MempoolProcessor>,
    blocks: Channel<dyn BlockProcessor>,
    startup: Channel<dyn LifecycleHook>,
    caught_up: Channel<dyn LifecycleHook>,
    rollback: Channel<dyn RollbackProcessor>,
}

fn wrap(handler: &str, e: FeedError) -> FeedError {
    if e.is_fatal() {
        return e;
    }
    FeedError::Handler {
        handler: handler.to_string(),
        reason: e.to_string(),
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a confirmed-message processor.
    pub fn on_message(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        enabled: bool,
        handler: Arc<dyn MessageProcessor>,
    ) {
        self.messages.subscribe(name, priority, enabled, handler);
    }

    /// Register an unconfirmed-transaction processor.
    pub fn on_mempool(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        enabled: bool,
        handler: Arc<dyn MempoolProcessor>,
    ) {
        self.mempool.subscribe(name, priority, enabled, handler);
    }

    /// Register a per-block processor.
    pub fn on_block(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        enabled: bool,
        handler: Arc<dyn BlockProcessor>,
    ) {
        self.blocks.subscribe(name, priority, enabled, handler);
    }

    pub fn on_startup(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        enabled: bool,
        handler: Arc<dyn LifecycleHook>,
    ) {
        self.startup.subscribe(name, priority, enabled, handler);
    }

    pub fn on_caught_up(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        enabled: bool,
        handler: Arc<dyn LifecycleHook>,
    ) {
        self.caught_up.subscribe(name, priority, enabled, handler);
    }

    pub fn on_rollback(
        &mut self,
        name: impl Into<String>,
        priority: i32,
        enabled: bool,
        handler: Arc<dyn RollbackProcessor>,
    ) {
        self.rollback.subscribe(name, priority, enabled, handler);
    }

    /// Enable or disable a module; returns `false` if unknown.
    ///
    /// Rollback hooks are never disabled, so a disabled module's collection
    /// is still rewound with everything else.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let has_rollback_hook = self.rollback.subscriptions().iter().any(|s| s.name == name);
        // Non-short-circuiting: every channel must be updated.
        self.messages.set_enabled(name, enabled)
            | self.mempool.set_enabled(name, enabled)
            | self.blocks.set_enabled(name, enabled)
            | self.startup.set_enabled(name, enabled)
            | self.caught_up.set_enabled(name, enabled)
            | has_rollback_hook
    }

    pub fn message_handlers(&self) -> &[ActiveHandler<dyn MessageProcessor>] {
        self.messages.active_handlers()
    }

    /// Every subscription on every channel.
    pub fn modules(&self) -> Vec<ModuleInfo> {
        fn list<H: ?Sized>(channel: &'static str, ch: &Channel<H>, out: &mut Vec<ModuleInfo>) {
            out.extend(ch.subscriptions().iter().map(|s| ModuleInfo {
                name: s.name.clone(),
                channel,
                priority: s.priority,
                enabled: s.enabled,
            }));
        }
        let mut out = Vec::new();
        list("message", &self.messages, &mut out);
        list("mempool", &self.mempool, &mut out);
        list("block", &self.blocks, &mut out);
        list("startup", &self.startup, &mut out);
        list("caught_up", &self.caught_up, &mut out);
        list("rollback", &self.rollback, &mut out);
        out
    }

    /// Run one confirmed message through the processor chain.
    pub async fn dispatch_message(
        &self,
        msg: &Message,
        data: &Value,
        ctx: &IndexContext<'_>,
    ) -> Result<MessageOutcome, FeedError> {
        for active in self.messages.active_handlers() {
            let signal = active
                .handler
                .process(msg, data, ctx)
                .await
                .map_err(|e| wrap(&active.name, e))?;
            match signal {
                ControlSignal::Continue => {}
                ControlSignal::AbortMessage => {
                    return Ok(MessageOutcome::Skipped {
                        by: active.name.clone(),
                    })
                }
                ControlSignal::AbortBlock => {
                    return Ok(MessageOutcome::AbortBlock {
                        by: active.name.clone(),
                    })
                }
            }
        }
        Ok(MessageOutcome::Applied)
    }

    /// Run one unconfirmed transaction through the mempool chain.
    pub async fn dispatch_mempool(
        &self,
        tx: &MempoolTx,
        data: &Value,
        ctx: &MempoolContext<'_>,
    ) -> Result<MessageOutcome, FeedError> {
        for active in self.mempool.active_handlers() {
            let signal = active
                .handler
                .process(tx, data, ctx)
                .await
                .map_err(|e| wrap(&active.name, e))?;
            match signal {
                ControlSignal::Continue => {}
                ControlSignal::AbortMessage => {
                    return Ok(MessageOutcome::Skipped {
                        by: active.name.clone(),
                    })
                }
                ControlSignal::AbortBlock => {
                    return Ok(MessageOutcome::AbortBlock {
                        by: active.name.clone(),
                    })
                }
            }
        }
        Ok(MessageOutcome::Applied)
    }

    pub async fn dispatch_block(&self, ctx: &IndexContext<'_>) -> Result<(), FeedError> {
        for active in self.blocks.active_handlers() {
            active
                .handler
                .process_block(ctx)
                .await
                .map_err(|e| wrap(&active.name, e))?;
        }
        Ok(())
    }

    pub async fn run_startup(&self, store: &dyn MaterializedStore) -> Result<(), FeedError> {
        for active in self.startup.active_handlers() {
            tracing::debug!(hook = %active.name, "running start-up hook");
            active.handler.run(store).await.map_err(|e| wrap(&active.name, e))?;
        }
        Ok(())
    }

    /// Run the caught-up hooks not yet in `done`, adding each one that succeeds.
    /// Stops at the first failure so the remaining hooks can be retried later.
    pub async fn run_caught_up(
        &self,
        store: &dyn MaterializedStore,
        done: &mut HashSet<String>,
    ) -> Result<(), FeedError> {
        for active in self.caught_up.active_handlers() {
            if done.contains(&active.name) {
                continue;
            }
            tracing::debug!(hook = %active.name, "running caught-up hook");
            active.handler.run(store).await.map_err(|e| wrap(&active.name, e))?;
            done.insert(active.name.clone());
        }
        Ok(())
    }

    pub async fn dispatch_rollback(
        &self,
        target: RollbackTarget,
        store: &dyn MaterializedStore,
    ) -> Result<(), FeedError> {
        for active in self.rollback.active_handlers() {
            active
                .handler
                .rollback(target, store)
                .await
                .map_err(|e| wrap(&active.name, e))?;
        }
        Ok(())
    }
}
