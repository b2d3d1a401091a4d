// Storage - SQLite persistence for signals, outcomes and context history
// In-memory truth survives any persistence failure; callers warn-and-continue.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::core::types::{ContextSnapshot, SignalOutcome, TradingSignal};

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A persisted signal row. Prices are stored as text to keep the full
/// decimal precision across the BTC-to-memecoin range.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredSignal {
    pub id: String,
    pub ts: i64,
    pub symbol: String,
    pub kind: String,
    pub direction: String,
    pub entry: String,
    pub stop: String,
    pub target: String,
    pub confidence: f64,
    pub priority: String,
    pub context: Option<String>,
    pub fingerprint: String,
    pub delivery_status: String,
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database. A failure here is fatal at boot.
    pub async fn connect(db_path: &str) -> Result<Self, StorageError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path))
            .map_err(StorageError::Sqlx)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.create_tables().await?;
        info!(path = db_path, "Database connected");
        Ok(db)
    }

    /// In-memory database for tests.
    pub async fn connect_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(StorageError::Sqlx)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let db = Self { pool };
        db.create_tables().await?;
        Ok(db)
    }

    async fn create_tables(&self) -> Result<(), StorageError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                direction TEXT NOT NULL,
                entry TEXT NOT NULL,
                stop TEXT NOT NULL,
                target TEXT NOT NULL,
                confidence REAL NOT NULL,
                priority TEXT NOT NULL,
                context TEXT,
                fingerprint TEXT NOT NULL,
                delivery_status TEXT NOT NULL DEFAULT 'pending',
                metadata_json TEXT
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS outcomes (
                signal_id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                entry_price TEXT NOT NULL,
                price_at_check TEXT,
                pct_to_target REAL NOT NULL,
                label TEXT NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS context_oi (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                ts INTEGER NOT NULL,
                oi_usd REAL NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS context_funding (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                ts INTEGER NOT NULL,
                funding_rate REAL NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS state_blob (
                key TEXT PRIMARY KEY,
                json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        for statement in [
            "CREATE INDEX IF NOT EXISTS idx_signals_symbol ON signals(symbol)",
            "CREATE INDEX IF NOT EXISTS idx_signals_ts ON signals(ts)",
            "CREATE INDEX IF NOT EXISTS idx_context_oi_symbol_ts ON context_oi(symbol, ts)",
            "CREATE INDEX IF NOT EXISTS idx_context_funding_symbol_ts ON context_funding(symbol, ts)",
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    // ========================================================================
    // Signals
    // ========================================================================

    pub async fn save_signal(&self, signal: &TradingSignal) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO signals
                (id, ts, symbol, kind, direction, entry, stop, target,
                 confidence, priority, context, fingerprint, delivery_status, metadata_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(signal.id.to_string())
        .bind(signal.ts)
        .bind(&signal.symbol)
        .bind(signal.kind.to_string())
        .bind(signal.direction.to_string())
        .bind(signal.entry.to_string())
        .bind(signal.stop.to_string())
        .bind(signal.target.to_string())
        .bind(signal.confidence)
        .bind(signal.priority.to_string())
        .bind(signal.context.map(|c| c.to_string()))
        .bind(signal.fingerprint())
        .bind(serde_json::to_string(&signal.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_delivery_status(
        &self,
        signal_id: Uuid,
        status: &str,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE signals SET delivery_status = ? WHERE id = ?")
            .bind(status)
            .bind(signal_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn recent_signals(&self, limit: i64) -> Result<Vec<StoredSignal>, StorageError> {
        let rows = sqlx::query(
            r"
            SELECT id, ts, symbol, kind, direction, entry, stop, target,
                   confidence, priority, context, fingerprint, delivery_status
            FROM signals ORDER BY ts DESC LIMIT ?
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| StoredSignal {
                id: row.get("id"),
                ts: row.get("ts"),
                symbol: row.get("symbol"),
                kind: row.get("kind"),
                direction: row.get("direction"),
                entry: row.get("entry"),
                stop: row.get("stop"),
                target: row.get("target"),
                confidence: row.get("confidence"),
                priority: row.get("priority"),
                context: row.get("context"),
                fingerprint: row.get("fingerprint"),
                delivery_status: row.get("delivery_status"),
            })
            .collect())
    }

    // ========================================================================
    // Outcomes
    // ========================================================================

    pub async fn save_outcome(&self, outcome: &SignalOutcome) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO outcomes (signal_id, ts, entry_price, price_at_check, pct_to_target, label)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (signal_id) DO NOTHING
            ",
        )
        .bind(outcome.signal_id.to_string())
        .bind(outcome.ts)
        .bind(outcome.entry_price.to_string())
        .bind(outcome.price_at_check.map(|p| p.to_string()))
        .bind(outcome.pct_to_target)
        .bind(outcome.label.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn outcome_for(&self, signal_id: Uuid) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT label FROM outcomes WHERE signal_id = ?")
            .bind(signal_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("label")))
    }

    // ========================================================================
    // Context history
    // ========================================================================

    pub async fn save_context_snapshot(
        &self,
        snapshot: &ContextSnapshot,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO context_oi (symbol, ts, oi_usd) VALUES (?, ?, ?)")
            .bind(&snapshot.symbol)
            .bind(snapshot.ts)
            .bind(snapshot.open_interest_usd)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO context_funding (symbol, ts, funding_rate) VALUES (?, ?, ?)")
            .bind(&snapshot.symbol)
            .bind(snapshot.ts)
            .bind(snapshot.funding_rate)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Drop context rows older than the retention window.
    pub async fn prune_context(
        &self,
        now_ms: i64,
        retention_days: i64,
    ) -> Result<u64, StorageError> {
        let cutoff = now_ms - retention_days * DAY_MS;
        let oi = sqlx::query("DELETE FROM context_oi WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let funding = sqlx::query("DELETE FROM context_funding WHERE ts < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(oi.rows_affected() + funding.rows_affected())
    }

    // ========================================================================
    // State blobs
    // ========================================================================

    pub async fn save_state_blob(&self, key: &str, json: &str) -> Result<(), StorageError> {
        sqlx::query(
            r"
            INSERT INTO state_blob (key, json, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET json = excluded.json, updated_at = excluded.updated_at
            ",
        )
        .bind(key)
        .bind(json)
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_state_blob(&self, key: &str) -> Result<Option<String>, StorageError> {
        let row = sqlx::query("SELECT json FROM state_blob WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        Direction, OutcomeLabel, Priority, Producer, SignalKind, Tier,
    };
    use rust_decimal_macros::dec;

    fn signal() -> TradingSignal {
        TradingSignal {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".to_string(),
            kind: SignalKind::StopHunt,
            direction: Direction::Long,
            entry: dec!(96000),
            stop: dec!(95704),
            target: dec!(96592),
            confidence: 93.0,
            tier: Tier::T1,
            priority: Priority::Urgent,
            context: None,
            sources: vec![Producer::StopHunt],
            metadata: serde_json::json!({"note": "test"}),
            ts: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn test_signal_round_trip() {
        let db = Database::connect_in_memory().await.unwrap();
        let s = signal();
        db.save_signal(&s).await.unwrap();

        let stored = db.recent_signals(10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, s.id.to_string());
        assert_eq!(stored[0].entry, "96000");
        assert_eq!(stored[0].delivery_status, "pending");
        assert_eq!(stored[0].fingerprint, s.fingerprint());

        // Saving the same signal twice is a no-op
        db.save_signal(&s).await.unwrap();
        assert_eq!(db.recent_signals(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delivery_status_update() {
        let db = Database::connect_in_memory().await.unwrap();
        let s = signal();
        db.save_signal(&s).await.unwrap();
        db.update_delivery_status(s.id, "delivery-failed").await.unwrap();

        let stored = db.recent_signals(1).await.unwrap();
        assert_eq!(stored[0].delivery_status, "delivery-failed");
    }

    #[tokio::test]
    async fn test_outcome_persisted_once() {
        let db = Database::connect_in_memory().await.unwrap();
        let s = signal();
        db.save_signal(&s).await.unwrap();

        let outcome = SignalOutcome {
            signal_id: s.id,
            ts: s.ts + 900_000,
            entry_price: s.entry,
            price_at_check: Some(dec!(96400)),
            pct_to_target: 0.68,
            label: OutcomeLabel::Win,
        };
        db.save_outcome(&outcome).await.unwrap();
        db.save_outcome(&outcome).await.unwrap();

        assert_eq!(db.outcome_for(s.id).await.unwrap(), Some("WIN".to_string()));
    }

    #[tokio::test]
    async fn test_context_prune() {
        let db = Database::connect_in_memory().await.unwrap();
        let now = 10 * DAY_MS;

        let old = ContextSnapshot {
            symbol: "BTC".to_string(),
            ts: now - 8 * DAY_MS,
            open_interest_usd: 1.0e9,
            previous_oi_usd: 1.0e9,
            oi_change_pct: 0.0,
            funding_rate: 0.0001,
            source_exchange: "aggregated".to_string(),
        };
        let fresh = ContextSnapshot {
            ts: now - DAY_MS,
            ..old.clone()
        };
        db.save_context_snapshot(&old).await.unwrap();
        db.save_context_snapshot(&fresh).await.unwrap();

        let pruned = db.prune_context(now, 7).await.unwrap();
        assert_eq!(pruned, 2); // one OI row + one funding row
    }

    #[tokio::test]
    async fn test_state_blob_upsert() {
        let db = Database::connect_in_memory().await.unwrap();
        assert!(db.load_state_blob("confidence").await.unwrap().is_none());

        db.save_state_blob("confidence", r#"{"a":1}"#).await.unwrap();
        db.save_state_blob("confidence", r#"{"a":2}"#).await.unwrap();
        assert_eq!(
            db.load_state_blob("confidence").await.unwrap(),
            Some(r#"{"a":2}"#.to_string())
        );
    }
}
