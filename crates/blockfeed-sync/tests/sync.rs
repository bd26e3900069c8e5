//! End-to-end sync loop tests against a scripted upstream.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::watch;

use blockfeed_core::asset::ChangeType;
use blockfeed_core::config::Network;
use blockfeed_core::error::FeedError;
use blockfeed_core::handler::{ControlSignal, LifecycleHook, MessageProcessor, ProcessorRegistry};
use blockfeed_core::reorg::RollbackTarget;
use blockfeed_core::state::SyncPhase;
use blockfeed_core::store::MaterializedStore;
use blockfeed_core::types::IndexContext;
use blockfeed_core::upstream::{MempoolTx, Message};
use blockfeed_storage::InMemoryStore;
use blockfeed_sync::views::balances::apply_delta;
use blockfeed_sync::{default_registry, Step};

use common::{block_hash, credit, debit, issuance, mempool_tx, regtest_builder, MockUpstream};

fn setup() -> (Arc<MockUpstream>, Arc<InMemoryStore>) {
    (Arc::new(MockUpstream::regtest()), Arc::new(InMemoryStore::new()))
}

async fn block_indexes(store: &InMemoryStore) -> Vec<u64> {
    store
        .processed_blocks()
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.block_index)
        .collect()
}

// ─── Catching up ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn catches_up_and_builds_views() {
    let (upstream, store) = setup();
    upstream.push(10, "issuances", issuance("GOLD", "alice", 1_000, "gold"));
    upstream.push(10, "credits", credit("alice", "GOLD", 1_000, "iss-GOLD-1000"));
    upstream.push(15, "issuances", issuance("GOLD", "alice", 500, "gold"));
    upstream.push(15, "credits", credit("alice", "GOLD", 500, "iss-GOLD-500"));
    let mut lock = issuance("GOLD", "alice", 0, "gold");
    lock["locked"] = json!(true);
    upstream.push(20, "issuances", lock);
    upstream.push(30, "debits", debit("alice", "GOLD", 200_00000000, "om-1"));
    upstream.push(30, "credits", credit("bob", "GOLD", 200_00000000, "om-1"));
    upstream.push(
        30,
        "order_matches",
        json!({
            "id": "om-1",
            "tx0_hash": "t0",
            "tx1_hash": "t1",
            "tx0_address": "alice",
            "tx1_address": "bob",
            "forward_asset": "GOLD",
            "forward_quantity": 200_00000000i64,
            "backward_asset": "XCP",
            "backward_quantity": 100_00000000i64,
            "status": "completed",
        }),
    );
    upstream.extend_to(100);
    upstream.set_caught_up(false);

    let mut sync = regtest_builder(upstream.clone(), store.clone()).build().unwrap();
    let snapshots = sync.subscribe();

    // Level with the tip, but the upstream is still behind its backend.
    assert!(!sync.run_until_caught_up(300).await.unwrap());
    assert_eq!(sync.state().local_block_index(), 100);
    assert_eq!(sync.state().phase, SyncPhase::NearTip);
    assert!(!sync.state().caught_up);

    upstream.set_caught_up(true);
    assert!(sync.run_until_caught_up(3).await.unwrap());
    assert_eq!(sync.state().phase, SyncPhase::CaughtUp);
    assert_eq!(snapshots.borrow().local_block_index, 100);
    assert!(snapshots.borrow().caught_up);

    assert_eq!(block_indexes(&store).await, (1..=100).collect::<Vec<_>>());

    let gold = store.tracked_asset("GOLD").await.unwrap().unwrap();
    assert_eq!(gold.current().change_type, ChangeType::Locked);
    assert_eq!(gold.current().total_issued, 1_500);
    assert!(gold.current().locked);
    let history: Vec<u64> = gold.history().iter().map(|s| s.at_block).collect();
    assert_eq!(history, vec![10, 15]);

    let btc = store.tracked_asset("BTC").await.unwrap().unwrap();
    assert_eq!(btc.at_block(), 0);
    assert!(btc.history().is_empty());

    let alice = store.latest_balance_change("alice", "GOLD").await.unwrap().unwrap();
    assert_eq!(alice.new_balance, 1_500 - 200_00000000);
    let bob = store.latest_balance_change("bob", "GOLD").await.unwrap().unwrap();
    assert_eq!(bob.new_balance, 200_00000000);

    let trades = store.trades().await.unwrap();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].base_asset, "GOLD");
    assert_eq!(trades[0].quote_asset, "XCP");
    assert_eq!(trades[0].base_quantity, 200_00000000);
    assert_eq!(trades[0].unit_price, 0.5);

    let stats = store.transaction_stats(10).await.unwrap();
    assert_eq!(
        stats.iter().find(|s| s.category == "issuances").map(|s| s.count),
        Some(1)
    );
}

#[tokio::test]
async fn autopilot_skips_running_info_queries() {
    let (upstream, store) = setup();
    upstream.extend_to(60);

    let mut sync = regtest_builder(upstream.clone(), store.clone())
        .prefetch_count(10)
        .autopilot_threshold(10)
        .autopilot_run(5)
        .build()
        .unwrap();

    assert!(sync.run_until_caught_up(100).await.unwrap());
    assert!(!sync.is_autopilot());
    assert_eq!(block_indexes(&store).await.len(), 60);
    assert_eq!(upstream.calls("get_blocks"), 6);
    let queries = upstream.calls("get_running_info");
    assert!(queries > 1 && queries < 20, "{queries} running-info queries");
}

#[tokio::test]
async fn invalid_messages_never_reach_views() {
    let (upstream, store) = setup();
    let mut bad = issuance("FAKE", "mallory", 10, "nope");
    bad["status"] = json!("invalid: bad issuer");
    upstream.push(1, "issuances", bad);
    upstream.push(2, "issuances", issuance("REAL", "alice", 10, ""));
    upstream.extend_to(2);

    let mut sync = regtest_builder(upstream, store.clone()).build().unwrap();
    assert!(sync.run_until_caught_up(10).await.unwrap());

    assert!(store.tracked_asset("FAKE").await.unwrap().is_none());
    assert!(store.tracked_asset("REAL").await.unwrap().is_some());
}

// ─── Reorgs and rollbacks ─────────────────────────────────────────────────────

#[tokio::test]
async fn reorg_message_rolls_back_and_replays() {
    let (upstream, store) = setup();
    for block in 1..=20 {
        upstream.push(block, "credits", credit("alice", "XCP", 10, &format!("c{block}")));
    }
    upstream.extend_to(20);

    let mut sync = regtest_builder(upstream.clone(), store.clone()).build().unwrap();
    assert!(sync.run_until_caught_up(50).await.unwrap());

    // Blocks 18.. are replaced; the reorg message precedes the new chain.
    upstream.fork_from(18, 1);
    upstream.push(21, "reorg", json!({ "block_index": 18 }));
    for block in 18..=21 {
        upstream.push(block, "credits", credit("alice", "XCP", 100, &format!("r{block}")));
    }
    upstream.extend_to(21);

    assert_eq!(
        sync.step().await.unwrap(),
        Step::RolledBack {
            target: RollbackTarget::Block(17)
        }
    );
    assert_eq!(sync.state().local_block_index(), 17);

    assert!(sync.run_until_caught_up(20).await.unwrap());
    assert_eq!(block_indexes(&store).await, (1..=21).collect::<Vec<_>>());
    let replaced = store.processed_block(18).await.unwrap().unwrap();
    assert_eq!(replaced.block_hash, block_hash(18, 1));

    let changes = store.balance_changes("alice", "XCP").await.unwrap();
    assert_eq!(changes.len(), 21);
    assert_eq!(changes.last().unwrap().new_balance, 17 * 10 + 4 * 100);
}

#[tokio::test]
async fn ahead_of_upstream_rolls_back_by_margin() {
    let (upstream, store) = setup();
    upstream.extend_to(30);

    let mut sync = regtest_builder(upstream.clone(), store.clone()).build().unwrap();
    assert!(sync.run_until_caught_up(50).await.unwrap());

    upstream.set_tip(Some(25));
    assert_eq!(
        sync.step().await.unwrap(),
        Step::RolledBack {
            target: RollbackTarget::Block(15)
        }
    );

    assert!(sync.run_until_caught_up(20).await.unwrap());
    assert_eq!(sync.state().local_block_index(), 25);
    assert_eq!(block_indexes(&store).await, (1..=25).collect::<Vec<_>>());
}

#[derive(Default)]
struct Recorder(Mutex<Vec<i64>>);

#[async_trait]
impl MessageProcessor for Recorder {
    async fn process(
        &self,
        msg: &Message,
        _data: &Value,
        _ctx: &IndexContext<'_>,
    ) -> Result<ControlSignal, FeedError> {
        self.0.lock().unwrap().push(msg.message_index);
        Ok(ControlSignal::Continue)
    }
}

struct Poison;

#[async_trait]
impl MessageProcessor for Poison {
    async fn process(
        &self,
        msg: &Message,
        _data: &Value,
        _ctx: &IndexContext<'_>,
    ) -> Result<ControlSignal, FeedError> {
        Ok(if msg.category == "poison" {
            ControlSignal::AbortBlock
        } else {
            ControlSignal::Continue
        })
    }
}

#[tokio::test]
async fn aborted_block_is_never_committed() {
    let (upstream, store) = setup();
    upstream.push(1, "credits", credit("alice", "XCP", 1, "a"));
    upstream.push(2, "credits", credit("alice", "XCP", 1, "b"));
    let before = upstream.push(3, "credits", credit("alice", "XCP", 1, "c"));
    let poison = upstream.push(3, "poison", json!({}));
    let after = upstream.push(3, "credits", credit("alice", "XCP", 1, "d"));
    upstream.extend_to(3);

    let recorder = Arc::new(Recorder::default());
    let mut registry = ProcessorRegistry::new();
    registry.on_message("recorder", 10, true, recorder.clone());
    registry.on_message("poison", 50, true, Arc::new(Poison));

    let mut sync = regtest_builder(upstream, store.clone())
        .registry(registry)
        .build()
        .unwrap();

    let mut steps = Vec::new();
    for _ in 0..6 {
        steps.push(sync.step().await.unwrap());
    }
    assert_eq!(steps[0], Step::Advanced { block_index: 1 });
    assert_eq!(steps[1], Step::Advanced { block_index: 2 });
    assert!(steps[2..].iter().all(|s| *s == Step::Retry));

    assert_eq!(block_indexes(&store).await, vec![1, 2]);
    let seen = recorder.0.lock().unwrap();
    assert!(seen.contains(&before));
    assert!(!seen.contains(&poison));
    assert!(!seen.contains(&after));
}

#[tokio::test]
async fn replay_after_crash_is_idempotent() {
    let (upstream, store) = setup();
    upstream.push(10, "credits", credit("alice", "XCP", 50, "a"));
    upstream.push(11, "credits", credit("alice", "XCP", 5, "b"));
    upstream.extend_to(10);

    let mut first = regtest_builder(upstream.clone(), store.clone()).build().unwrap();
    assert!(first.run_until_caught_up(30).await.unwrap());
    drop(first);

    // A crash mid-block 11 left a write behind without committing the block.
    apply_delta(store.as_ref(), "alice", "XCP", 11, 6_600, 5).await.unwrap();
    upstream.extend_to(11);

    let mut second = regtest_builder(upstream, store.clone()).build().unwrap();
    assert!(second.run_until_caught_up(30).await.unwrap());

    let changes = store.balance_changes("alice", "XCP").await.unwrap();
    let blocks: Vec<u64> = changes.iter().map(|c| c.block_index).collect();
    assert_eq!(blocks, vec![10, 11]);
    assert_eq!(changes[1].quantity, 5);
    assert_eq!(changes[1].new_balance, 55);
}

#[tokio::test]
async fn manual_rollback() {
    let (upstream, store) = setup();
    upstream.extend_to(5);
    let mut sync = regtest_builder(upstream, store.clone()).build().unwrap();
    assert!(sync.run_until_caught_up(20).await.unwrap());

    let err = sync.rollback(RollbackTarget::Block(50)).await.unwrap_err();
    assert!(matches!(err, FeedError::InvalidRollbackTarget(50)));
    assert!(err.is_fatal());
    assert_eq!(block_indexes(&store).await.len(), 5);

    let report = sync.rollback(RollbackTarget::Block(3)).await.unwrap();
    assert_eq!(report.blocks_removed, 2);
    assert_eq!(sync.state().local_block_index(), 3);
    assert!(!sync.state().caught_up);
    assert_eq!(sync.state().last_message_index, -1);
}

// ─── Reparse ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn forced_reparse_wipes_and_reseeds() {
    let (upstream, store) = setup();
    upstream.push(2, "issuances", issuance("GOLD", "alice", 10, ""));
    upstream.push(2, "credits", credit("alice", "GOLD", 10, "iss-GOLD-10"));
    upstream.extend_to(5);

    let mut first = regtest_builder(upstream.clone(), store.clone()).build().unwrap();
    assert!(first.run_until_caught_up(20).await.unwrap());
    drop(first);
    store.set_module_enabled("trades", false).await.unwrap();

    let mut sync = regtest_builder(upstream.clone(), store.clone())
        .reparse(true)
        .build()
        .unwrap();
    upstream.fail_next(1);
    assert_eq!(sync.step().await.unwrap(), Step::Retry);
    assert_eq!(sync.state().phase, SyncPhase::Resyncing);

    assert!(store.processed_blocks().await.unwrap().is_empty());
    assert!(store.balance_changes("alice", "GOLD").await.unwrap().is_empty());
    assert!(store.trades().await.unwrap().is_empty());
    let assets = store.tracked_assets().await.unwrap();
    let names: Vec<&str> = assets.iter().map(|a| a.asset.as_str()).collect();
    assert_eq!(names, vec!["BTC", "XCP"]);
    assert!(assets.iter().all(|a| a.at_block() == 0 && a.history().is_empty()));

    let settings = store.module_settings().await.unwrap();
    assert_eq!(settings.get("trades"), Some(&false));
    let app_config = store.load_app_config().await.unwrap().unwrap();
    assert!(app_config.drift_from_build(Network::Regtest).is_none());

    assert!(sync.run_until_caught_up(20).await.unwrap());
    assert!(store.tracked_asset("GOLD").await.unwrap().is_some());
    assert!(sync
        .registry()
        .modules()
        .iter()
        .filter(|m| m.name == "trades")
        .all(|m| !m.enabled));
}

#[tokio::test]
async fn upstream_version_change_triggers_reparse() {
    let (upstream, store) = setup();
    upstream.push(2, "issuances", issuance("GOLD", "alice", 10, ""));
    upstream.extend_to(5);

    let mut sync = regtest_builder(upstream.clone(), store.clone()).build().unwrap();
    assert!(sync.run_until_caught_up(20).await.unwrap());

    upstream.set_version(10, 0);
    assert_eq!(sync.step().await.unwrap(), Step::Advanced { block_index: 1 });
    assert_eq!(block_indexes(&store).await, vec![1]);
    assert!(store.tracked_asset("GOLD").await.unwrap().is_none());

    let app_config = store.load_app_config().await.unwrap().unwrap();
    assert_eq!(app_config.upstream_version_major, Some(10));
    assert_eq!(app_config.upstream_version_minor, Some(0));

    assert!(sync.run_until_caught_up(20).await.unwrap());
    assert_eq!(block_indexes(&store).await, (1..=5).collect::<Vec<_>>());
}

// ─── Fatal errors ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn message_gap_is_fatal() {
    let (upstream, store) = setup();
    upstream.push(1, "credits", credit("alice", "XCP", 1, "a"));
    upstream.skip_message_indexes(4);
    upstream.push(2, "credits", credit("alice", "XCP", 1, "b"));
    upstream.extend_to(2);

    let mut sync = regtest_builder(upstream, store.clone()).build().unwrap();
    let (_stop, shutdown) = watch::channel(false);
    let err = sync.run(shutdown).await.unwrap_err();

    match err {
        FeedError::ProtocolSequenceViolation {
            block_index,
            expected,
            actual,
        } => assert_eq!((block_index, expected, actual), (2, 1, 5)),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(block_indexes(&store).await, vec![1]);
}

#[tokio::test]
async fn network_mismatch_is_fatal() {
    let upstream = Arc::new(MockUpstream::new(Network::Testnet));
    upstream.extend_to(1);
    let store = Arc::new(InMemoryStore::new());

    let mut sync = regtest_builder(upstream, store).build().unwrap();
    let err = sync.step().await.unwrap_err();
    assert!(matches!(err, FeedError::NetworkMismatch { .. }));
    assert!(err.is_fatal());
}

// ─── Lifecycle ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Counter(AtomicUsize);

#[async_trait]
impl LifecycleHook for Counter {
    async fn run(&self, _store: &dyn MaterializedStore) -> Result<(), FeedError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn caught_up_hooks_run_once() {
    let (upstream, store) = setup();
    upstream.extend_to(5);
    upstream.set_caught_up(false);

    let started = Arc::new(Counter::default());
    let caught_up = Arc::new(Counter::default());
    let mut registry = default_registry(None);
    registry.on_startup("started", 0, true, started.clone());
    registry.on_caught_up("caught_up", 0, true, caught_up.clone());

    let mut sync = regtest_builder(upstream.clone(), store)
        .registry(registry)
        .build()
        .unwrap();

    assert!(!sync.run_until_caught_up(10).await.unwrap());
    assert_eq!(caught_up.0.load(Ordering::SeqCst), 0);

    upstream.set_caught_up(true);
    assert!(sync.run_until_caught_up(3).await.unwrap());
    for _ in 0..3 {
        assert_eq!(sync.step().await.unwrap(), Step::Idle);
    }
    upstream.extend_to(8);
    assert!(sync.run_until_caught_up(10).await.unwrap());

    assert_eq!(started.0.load(Ordering::SeqCst), 1);
    assert_eq!(caught_up.0.load(Ordering::SeqCst), 1);
}

/// Fails on its first run, succeeds afterwards.
#[derive(Default)]
struct FailsOnce(AtomicUsize);

#[async_trait]
impl LifecycleHook for FailsOnce {
    async fn run(&self, _store: &dyn MaterializedStore) -> Result<(), FeedError> {
        if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(FeedError::Other("cache not warm yet".into()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn failed_caught_up_hook_is_retried_alone() {
    let (upstream, store) = setup();
    upstream.extend_to(3);

    let before = Arc::new(Counter::default());
    let flaky = Arc::new(FailsOnce::default());
    let after = Arc::new(Counter::default());
    let mut registry = default_registry(None);
    registry.on_caught_up("before", 20, true, before.clone());
    registry.on_caught_up("flaky", 10, true, flaky.clone());
    registry.on_caught_up("after", 0, true, after.clone());

    let mut sync = regtest_builder(upstream.clone(), store)
        .registry(registry)
        .build()
        .unwrap();

    let mut failures = 0;
    for _ in 0..10 {
        match sync.step().await {
            Ok(_) => {}
            Err(FeedError::Handler { handler, .. }) => {
                assert_eq!(handler, "flaky");
                failures += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(failures, 1);
    assert!(sync.state().caught_up_started_events);
    assert_eq!(before.0.load(Ordering::SeqCst), 1);
    assert_eq!(flaky.0.load(Ordering::SeqCst), 2);
    assert_eq!(after.0.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upstream_outage_retries_without_state_change() {
    let (upstream, store) = setup();
    upstream.extend_to(5);
    let mut sync = regtest_builder(upstream.clone(), store).build().unwrap();
    assert!(sync.run_until_caught_up(20).await.unwrap());

    upstream.extend_to(8);
    upstream.fail_next(3);
    for _ in 0..3 {
        assert_eq!(sync.step().await.unwrap(), Step::Retry);
        assert_eq!(sync.state().local_block_index(), 5);
    }
    assert_eq!(sync.step().await.unwrap(), Step::Advanced { block_index: 6 });
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let (upstream, store) = setup();
    upstream.extend_to(3);
    let mut sync = regtest_builder(upstream, store.clone()).build().unwrap();

    let (stop, shutdown) = watch::channel(false);
    let mut snapshots = sync.subscribe();
    let runner = tokio::spawn(async move { sync.run(shutdown).await });

    while !snapshots.borrow_and_update().caught_up {
        snapshots.changed().await.unwrap();
    }
    stop.send(true).unwrap();
    runner.await.unwrap().unwrap();
    assert_eq!(block_indexes(&store).await, vec![1, 2, 3]);
}

// ─── Mempool ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn mempool_follows_confirmations() {
    let (upstream, store) = setup();
    upstream.extend_to(3);
    upstream.set_mempool(vec![
        mempool_tx("m1", "sends", json!({ "asset": "XCP", "quantity": 5, "status": "valid" }), 100),
        mempool_tx("m2", "sends", json!({ "asset": "XCP", "quantity": 7, "status": "valid" }), 101),
    ]);

    let mut sync = regtest_builder(upstream.clone(), store.clone()).build().unwrap();
    assert!(sync.run_until_caught_up(10).await.unwrap());
    assert_eq!(store.mempool().await.unwrap().len(), 2);

    upstream.set_mempool(vec![]);
    upstream.push(4, "credits", credit("bob", "XCP", 5, "m1"));
    upstream.extend_to(4);
    assert!(sync.run_until_caught_up(10).await.unwrap());

    assert!(store.mempool_entry("m1").await.unwrap().is_none());
    assert!(store.mempool_entry("m2").await.unwrap().is_some());
}

#[tokio::test]
async fn undecodable_mempool_tx_is_skipped() {
    let (upstream, store) = setup();
    upstream.extend_to(3);
    upstream.set_mempool(vec![
        MempoolTx {
            tx_hash: "garbled".to_string(),
            category: "sends".to_string(),
            command: "insert".to_string(),
            bindings: Value::String("{not json".to_string()),
            timestamp: 100,
        },
        mempool_tx("m1", "sends", json!({ "asset": "XCP", "quantity": 5, "status": "valid" }), 101),
    ]);

    let mut sync = regtest_builder(upstream, store.clone()).build().unwrap();
    for _ in 0..10 {
        sync.step().await.unwrap();
    }

    assert!(store.mempool_entry("garbled").await.unwrap().is_none());
    assert!(store.mempool_entry("m1").await.unwrap().is_some());
}
