//! SQLite materialized store.
//!
//! Persists every view to a single SQLite file via `sqlx`, in WAL mode.
//! Snapshot logs, trades, mempool entries and the app config are kept as JSON
//! documents next to the indexed columns they are queried by.
//!
//! # Usage
//! ```rust,no_run
//! use blockfeed_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./blockfeed.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use blockfeed_core::asset::{AssetSnapshot, TrackedAsset};
use blockfeed_core::error::FeedError;
use blockfeed_core::model::{AppConfig, BalanceChange, MempoolEntry, Trade, TransactionStat};
use blockfeed_core::store::{Collection, MaterializedStore};
use blockfeed_core::types::ProcessedBlock;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS processed_blocks (
        block_index INTEGER PRIMARY KEY,
        block_hash  TEXT    NOT NULL,
        block_time  INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS app_config (
        id   INTEGER PRIMARY KEY CHECK (id = 1),
        doc  TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS tracked_assets (
        asset     TEXT    PRIMARY KEY,
        at_block  INTEGER NOT NULL,
        snapshots TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS balance_changes (
        address     TEXT    NOT NULL,
        asset       TEXT    NOT NULL,
        block_index INTEGER NOT NULL,
        block_time  INTEGER NOT NULL,
        quantity    INTEGER NOT NULL,
        new_balance INTEGER NOT NULL,
        PRIMARY KEY (address, asset, block_index)
    );",
    "CREATE INDEX IF NOT EXISTS idx_balance_changes_block ON balance_changes (block_index);",
    "CREATE TABLE IF NOT EXISTS trades (
        order_match_id TEXT    PRIMARY KEY,
        block_index    INTEGER NOT NULL,
        message_index  INTEGER NOT NULL,
        doc            TEXT    NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_trades_block ON trades (block_index);",
    "CREATE TABLE IF NOT EXISTS transaction_stats (
        block_index INTEGER NOT NULL,
        category    TEXT    NOT NULL,
        block_time  INTEGER NOT NULL,
        count       INTEGER NOT NULL,
        PRIMARY KEY (block_index, category)
    );",
    "CREATE TABLE IF NOT EXISTS mempool (
        tx_hash       TEXT    PRIMARY KEY,
        seen_at_block INTEGER NOT NULL,
        timestamp     INTEGER NOT NULL,
        doc           TEXT    NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS module_settings (
        name    TEXT    PRIMARY KEY,
        enabled INTEGER NOT NULL
    );",
];

/// SQLite-backed materialized store.
pub struct SqliteStore {
    pool: SqlitePool,
}

fn to_json<T: Serialize>(value: &T) -> Result<String, FeedError> {
    serde_json::to_string(value).map_err(FeedError::storage)
}

fn from_json<T: DeserializeOwned>(raw: &str) -> Result<T, FeedError> {
    serde_json::from_str(raw).map_err(FeedError::decode)
}

fn block_from_row(row: &SqliteRow) -> ProcessedBlock {
    ProcessedBlock {
        block_index: row.get::<i64, _>("block_index") as u64,
        block_hash: row.get("block_hash"),
        block_time: row.get("block_time"),
    }
}

fn asset_from_row(row: &SqliteRow) -> Result<TrackedAsset, FeedError> {
    let name: String = row.get("asset");
    let raw: String = row.get("snapshots");
    let snapshots: Vec<AssetSnapshot> = from_json(&raw)?;
    TrackedAsset::from_snapshots(name.clone(), snapshots)
        .ok_or_else(|| FeedError::Decode(format!("corrupt snapshot log for asset {name}")))
}

fn balance_from_row(row: &SqliteRow) -> BalanceChange {
    BalanceChange {
        address: row.get("address"),
        asset: row.get("asset"),
        block_index: row.get::<i64, _>("block_index") as u64,
        block_time: row.get("block_time"),
        quantity: row.get("quantity"),
        new_balance: row.get("new_balance"),
    }
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./blockfeed.db"`) or a full
    /// SQLite URL (`"sqlite:./blockfeed.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, FeedError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(FeedError::storage)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Pinned to a single long-lived connection, since every SQLite
    /// connection to `:memory:` is a separate database.
    pub async fn in_memory() -> Result<Self, FeedError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<std::time::Duration>)
            .max_lifetime(None::<std::time::Duration>)
            .connect("sqlite::memory:")
            .await
            .map_err(FeedError::storage)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), FeedError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(FeedError::storage)?;

        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(FeedError::storage)?;
        }
        Ok(())
    }

    async fn delete_after(&self, table: &str, block_index: u64) -> Result<u64, FeedError> {
        let result = sqlx::query(&format!("DELETE FROM {table} WHERE block_index > ?"))
            .bind(block_index as i64)
            .execute(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        debug!(table, block_index, removed = result.rows_affected(), "rolled back rows");
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl MaterializedStore for SqliteStore {
    // ── processed_blocks ──────────────────────────────────────────────────────

    async fn latest_processed_block(&self) -> Result<Option<ProcessedBlock>, FeedError> {
        let row = sqlx::query(
            "SELECT block_index, block_hash, block_time FROM processed_blocks
             ORDER BY block_index DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(row.as_ref().map(block_from_row))
    }

    async fn processed_block(&self, block_index: u64) -> Result<Option<ProcessedBlock>, FeedError> {
        let row = sqlx::query(
            "SELECT block_index, block_hash, block_time FROM processed_blocks
             WHERE block_index = ?",
        )
        .bind(block_index as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(row.as_ref().map(block_from_row))
    }

    async fn latest_processed_block_at_or_below(
        &self,
        at_or_below: u64,
    ) -> Result<Option<ProcessedBlock>, FeedError> {
        let row = sqlx::query(
            "SELECT block_index, block_hash, block_time FROM processed_blocks
             WHERE block_index <= ? ORDER BY block_index DESC LIMIT 1",
        )
        .bind(at_or_below.min(i64::MAX as u64) as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(row.as_ref().map(block_from_row))
    }

    async fn insert_processed_block(&self, block: &ProcessedBlock) -> Result<(), FeedError> {
        if let Some(latest) = self.latest_processed_block().await? {
            if !block.follows(&latest) {
                return Err(FeedError::Storage(format!(
                    "block {} does not follow latest processed block {}",
                    block.block_index, latest.block_index
                )));
            }
        }
        sqlx::query(
            "INSERT INTO processed_blocks (block_index, block_hash, block_time) VALUES (?, ?, ?)",
        )
        .bind(block.block_index as i64)
        .bind(&block.block_hash)
        .bind(block.block_time)
        .execute(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(())
    }

    async fn delete_processed_blocks_after(&self, block_index: u64) -> Result<u64, FeedError> {
        self.delete_after("processed_blocks", block_index).await
    }

    async fn processed_blocks(&self) -> Result<Vec<ProcessedBlock>, FeedError> {
        let rows = sqlx::query(
            "SELECT block_index, block_hash, block_time FROM processed_blocks ORDER BY block_index",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(rows.iter().map(block_from_row).collect())
    }

    // ── app_config ────────────────────────────────────────────────────────────

    async fn load_app_config(&self) -> Result<Option<AppConfig>, FeedError> {
        let row = sqlx::query("SELECT doc FROM app_config WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        row.map(|r| from_json(&r.get::<String, _>("doc"))).transpose()
    }

    async fn save_app_config(&self, config: &AppConfig) -> Result<(), FeedError> {
        sqlx::query("INSERT OR REPLACE INTO app_config (id, doc) VALUES (1, ?)")
            .bind(to_json(config)?)
            .execute(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        Ok(())
    }

    // ── tracked_assets ────────────────────────────────────────────────────────

    async fn tracked_asset(&self, asset: &str) -> Result<Option<TrackedAsset>, FeedError> {
        let row = sqlx::query("SELECT asset, snapshots FROM tracked_assets WHERE asset = ?")
            .bind(asset)
            .fetch_optional(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        row.as_ref().map(asset_from_row).transpose()
    }

    async fn save_tracked_asset(&self, asset: &TrackedAsset) -> Result<(), FeedError> {
        sqlx::query(
            "INSERT OR REPLACE INTO tracked_assets (asset, at_block, snapshots) VALUES (?, ?, ?)",
        )
        .bind(&asset.asset)
        .bind(asset.at_block() as i64)
        .bind(to_json(&asset.snapshots())?)
        .execute(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(())
    }

    async fn delete_tracked_asset(&self, asset: &str) -> Result<(), FeedError> {
        sqlx::query("DELETE FROM tracked_assets WHERE asset = ?")
            .bind(asset)
            .execute(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        Ok(())
    }

    async fn tracked_assets_changed_after(
        &self,
        block_index: u64,
    ) -> Result<Vec<TrackedAsset>, FeedError> {
        let rows = sqlx::query(
            "SELECT asset, snapshots FROM tracked_assets WHERE at_block > ? ORDER BY asset",
        )
        .bind(block_index as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        rows.iter().map(asset_from_row).collect()
    }

    async fn tracked_assets(&self) -> Result<Vec<TrackedAsset>, FeedError> {
        let rows = sqlx::query("SELECT asset, snapshots FROM tracked_assets ORDER BY asset")
            .fetch_all(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        rows.iter().map(asset_from_row).collect()
    }

    // ── balance_changes ───────────────────────────────────────────────────────

    async fn balance_change(
        &self,
        address: &str,
        asset: &str,
        block_index: u64,
    ) -> Result<Option<BalanceChange>, FeedError> {
        let row = sqlx::query(
            "SELECT * FROM balance_changes WHERE address = ? AND asset = ? AND block_index = ?",
        )
        .bind(address)
        .bind(asset)
        .bind(block_index as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(row.as_ref().map(balance_from_row))
    }

    async fn latest_balance_change(
        &self,
        address: &str,
        asset: &str,
    ) -> Result<Option<BalanceChange>, FeedError> {
        let row = sqlx::query(
            "SELECT * FROM balance_changes WHERE address = ? AND asset = ?
             ORDER BY block_index DESC LIMIT 1",
        )
        .bind(address)
        .bind(asset)
        .fetch_optional(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(row.as_ref().map(balance_from_row))
    }

    async fn save_balance_change(&self, change: &BalanceChange) -> Result<(), FeedError> {
        sqlx::query(
            "INSERT OR REPLACE INTO balance_changes
             (address, asset, block_index, block_time, quantity, new_balance)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&change.address)
        .bind(&change.asset)
        .bind(change.block_index as i64)
        .bind(change.block_time)
        .bind(change.quantity)
        .bind(change.new_balance)
        .execute(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(())
    }

    async fn balance_changes(
        &self,
        address: &str,
        asset: &str,
    ) -> Result<Vec<BalanceChange>, FeedError> {
        let rows = sqlx::query(
            "SELECT * FROM balance_changes WHERE address = ? AND asset = ? ORDER BY block_index",
        )
        .bind(address)
        .bind(asset)
        .fetch_all(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(rows.iter().map(balance_from_row).collect())
    }

    async fn delete_balance_changes_after(&self, block_index: u64) -> Result<u64, FeedError> {
        self.delete_after("balance_changes", block_index).await
    }

    // ── trades ────────────────────────────────────────────────────────────────

    async fn save_trade(&self, trade: &Trade) -> Result<(), FeedError> {
        sqlx::query(
            "INSERT OR REPLACE INTO trades (order_match_id, block_index, message_index, doc)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&trade.order_match_id)
        .bind(trade.block_index as i64)
        .bind(trade.message_index)
        .bind(to_json(trade)?)
        .execute(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(())
    }

    async fn trades(&self) -> Result<Vec<Trade>, FeedError> {
        let rows = sqlx::query("SELECT doc FROM trades ORDER BY block_index, message_index")
            .fetch_all(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        rows.iter()
            .map(|r| from_json(&r.get::<String, _>("doc")))
            .collect()
    }

    async fn delete_trades_after(&self, block_index: u64) -> Result<u64, FeedError> {
        self.delete_after("trades", block_index).await
    }

    // ── transaction_stats ─────────────────────────────────────────────────────

    async fn increment_transaction_stat(
        &self,
        block_index: u64,
        block_time: i64,
        category: &str,
    ) -> Result<(), FeedError> {
        sqlx::query(
            "INSERT INTO transaction_stats (block_index, category, block_time, count)
             VALUES (?, ?, ?, 1)
             ON CONFLICT (block_index, category) DO UPDATE SET count = count + 1",
        )
        .bind(block_index as i64)
        .bind(category)
        .bind(block_time)
        .execute(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(())
    }

    async fn transaction_stats(&self, block_index: u64) -> Result<Vec<TransactionStat>, FeedError> {
        let rows = sqlx::query(
            "SELECT block_index, category, block_time, count FROM transaction_stats
             WHERE block_index = ? ORDER BY category",
        )
        .bind(block_index as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(rows
            .iter()
            .map(|r| TransactionStat {
                block_index: r.get::<i64, _>("block_index") as u64,
                block_time: r.get("block_time"),
                category: r.get("category"),
                count: r.get::<i64, _>("count") as u64,
            })
            .collect())
    }

    async fn delete_transaction_stats_after(&self, block_index: u64) -> Result<u64, FeedError> {
        self.delete_after("transaction_stats", block_index).await
    }

    // ── mempool ───────────────────────────────────────────────────────────────

    async fn mempool_entry(&self, tx_hash: &str) -> Result<Option<MempoolEntry>, FeedError> {
        let row = sqlx::query("SELECT doc FROM mempool WHERE tx_hash = ?")
            .bind(tx_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        row.map(|r| from_json(&r.get::<String, _>("doc"))).transpose()
    }

    async fn insert_mempool_entry(&self, entry: &MempoolEntry) -> Result<bool, FeedError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO mempool (tx_hash, seen_at_block, timestamp, doc)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.tx_hash)
        .bind(entry.seen_at_block as i64)
        .bind(entry.timestamp)
        .bind(to_json(entry)?)
        .execute(&self.pool)
        .await
        .map_err(FeedError::storage)?;
        Ok(result.rows_affected() == 1)
    }

    async fn remove_mempool_entry(&self, tx_hash: &str) -> Result<bool, FeedError> {
        let result = sqlx::query("DELETE FROM mempool WHERE tx_hash = ?")
            .bind(tx_hash)
            .execute(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn prune_mempool(&self, seen_before_block: u64) -> Result<u64, FeedError> {
        let result = sqlx::query("DELETE FROM mempool WHERE seen_at_block < ?")
            .bind(seen_before_block as i64)
            .execute(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        Ok(result.rows_affected())
    }

    async fn mempool(&self) -> Result<Vec<MempoolEntry>, FeedError> {
        let rows = sqlx::query("SELECT doc FROM mempool ORDER BY timestamp, tx_hash")
            .fetch_all(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        rows.iter()
            .map(|r| from_json(&r.get::<String, _>("doc")))
            .collect()
    }

    // ── module_settings ───────────────────────────────────────────────────────

    async fn module_settings(&self) -> Result<BTreeMap<String, bool>, FeedError> {
        let rows = sqlx::query("SELECT name, enabled FROM module_settings")
            .fetch_all(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("name"), r.get::<i64, _>("enabled") != 0))
            .collect())
    }

    async fn set_module_enabled(&self, name: &str, enabled: bool) -> Result<(), FeedError> {
        sqlx::query("INSERT OR REPLACE INTO module_settings (name, enabled) VALUES (?, ?)")
            .bind(name)
            .bind(enabled as i64)
            .execute(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        Ok(())
    }

    // ── maintenance ───────────────────────────────────────────────────────────

    async fn purge(&self, collection: Collection) -> Result<(), FeedError> {
        sqlx::query(&format!("DELETE FROM {}", collection.name()))
            .execute(&self.pool)
            .await
            .map_err(FeedError::storage)?;
        debug!(%collection, "purged collection");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use blockfeed_core::asset::ChangeType;
    use blockfeed_core::config::Network;
    use chrono::Utc;

    fn block(i: u64) -> ProcessedBlock {
        ProcessedBlock {
            block_index: i,
            block_hash: format!("{i:064x}"),
            block_time: 1_400_000_000 + i as i64 * 600,
        }
    }

    fn snap(at_block: u64, change_type: ChangeType, total_issued: i64) -> AssetSnapshot {
        AssetSnapshot {
            owner: Some("1Issuer".into()),
            description: "silver".into(),
            divisible: true,
            locked: false,
            total_issued,
            at_block,
            at_block_time: 0,
            change_type,
        }
    }

    #[tokio::test]
    async fn processed_block_chain() {
        let store = SqliteStore::in_memory().await.unwrap();
        for i in 100..=104 {
            store.insert_processed_block(&block(i)).await.unwrap();
        }
        assert!(store.insert_processed_block(&block(106)).await.is_err());

        let below = store.latest_processed_block_at_or_below(102).await.unwrap();
        assert_eq!(below.unwrap().block_index, 102);
        assert!(store.latest_processed_block_at_or_below(99).await.unwrap().is_none());

        assert_eq!(store.delete_processed_blocks_after(101).await.unwrap(), 3);
        let latest = store.latest_processed_block().await.unwrap().unwrap();
        assert_eq!(latest, block(101));
    }

    #[tokio::test]
    async fn app_config_roundtrip() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.load_app_config().await.unwrap().is_none());
        let config = AppConfig::current(Network::Testnet);
        store.save_app_config(&config).await.unwrap();
        let loaded = store.load_app_config().await.unwrap().unwrap();
        assert_eq!(loaded, config);
    }

    #[tokio::test]
    async fn tracked_asset_log_persists() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut asset = TrackedAsset::new("SILVER", snap(10, ChangeType::Created, 5));
        asset.push(snap(20, ChangeType::IssuedMore, 9));
        store.save_tracked_asset(&asset).await.unwrap();

        let loaded = store.tracked_asset("SILVER").await.unwrap().unwrap();
        assert_eq!(loaded.current().total_issued, 9);
        assert_eq!(loaded.history().len(), 1);

        assert_eq!(store.tracked_assets_changed_after(15).await.unwrap().len(), 1);
        assert!(store.tracked_assets_changed_after(20).await.unwrap().is_empty());

        store.delete_tracked_asset("SILVER").await.unwrap();
        assert!(store.tracked_asset("SILVER").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stats_upsert_counts() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.increment_transaction_stat(7, 1, "sends").await.unwrap();
        store.increment_transaction_stat(7, 1, "sends").await.unwrap();
        store.increment_transaction_stat(8, 2, "orders").await.unwrap();

        let stats = store.transaction_stats(7).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].count, 2);
        assert_eq!(store.delete_transaction_stats_after(7).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mempool_and_module_settings() {
        let store = SqliteStore::in_memory().await.unwrap();
        let entry = MempoolEntry {
            tx_hash: "cd".into(),
            category: "orders".into(),
            command: "insert".into(),
            bindings: serde_json::json!({ "give_asset": "XCP" }),
            timestamp: 5,
            seen_at_block: 50,
            first_seen: Utc::now(),
        };
        assert!(store.insert_mempool_entry(&entry).await.unwrap());
        assert!(!store.insert_mempool_entry(&entry).await.unwrap());
        assert_eq!(store.mempool_entry("cd").await.unwrap().unwrap().bindings["give_asset"], "XCP");
        assert!(store.remove_mempool_entry("cd").await.unwrap());

        store.set_module_enabled("assets", false).await.unwrap();
        for c in Collection::PURGEABLE {
            store.purge(c).await.unwrap();
        }
        assert_eq!(store.module_settings().await.unwrap().get("assets"), Some(&false));
    }
}
