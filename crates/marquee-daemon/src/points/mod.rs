//! Points ledger.
//!
//! The single mutation entry point is [`PointsManager::create_transaction`]:
//! it adjusts the address balance and appends the ledger row inside one
//! database transaction. Overdraw protection is the `CHECK (balance >= 0)`
//! constraint, so concurrent spenders cannot take a balance negative.

use std::sync::Arc;
use std::time::Duration;

use marquee_core::db::unix_timestamp;
use marquee_core::event::Event;
use marquee_core::user::User;

use crate::storage::{Database, DatabaseError, PointsTxRow, PointsTxType};

/// Window within which collapsible transaction types merge into the most
/// recent row of the same type instead of creating a new one.
const COLLAPSE_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Errors from points operations.
#[derive(Debug, thiserror::Error)]
pub enum PointsError {
    #[error("Insufficient points balance")]
    InsufficientBalance,

    #[error("Transaction value must be a non-zero integer")]
    ZeroValue,

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Carried by `TransactionUpdated`: the post-update row plus how much the
/// value moved.
#[derive(Debug, Clone)]
pub struct TransactionUpdatedEventArgs {
    pub transaction: PointsTxRow,
    pub adjustment_value: i64,
}

/// The points ledger manager.
pub struct PointsManager {
    db: Database,
    on_transaction_created: Event<PointsTxRow>,
    on_transaction_updated: Event<TransactionUpdatedEventArgs>,
}

impl PointsManager {
    pub fn new(db: Database) -> Arc<Self> {
        Arc::new(Self {
            db,
            on_transaction_created: Event::new(),
            on_transaction_updated: Event::new(),
        })
    }

    /// Fired whenever a new ledger row is inserted.
    pub fn on_transaction_created(&self) -> &Event<PointsTxRow> {
        &self.on_transaction_created
    }

    /// Fired when an existing ledger row absorbs an adjustment.
    pub fn on_transaction_updated(&self) -> &Event<TransactionUpdatedEventArgs> {
        &self.on_transaction_updated
    }

    pub async fn balance(&self, address: &str) -> Result<i64, PointsError> {
        Ok(self.db.points_balance(address).await?)
    }

    /// Create a points transaction for the user, adjusting their balance by
    /// `value` atomically. Negative values that would overdraw fail with
    /// [`PointsError::InsufficientBalance`] and leave no trace.
    pub async fn create_transaction(
        &self,
        user: &User,
        tx_type: PointsTxType,
        value: i64,
        extra: serde_json::Map<String, serde_json::Value>,
    ) -> Result<PointsTxRow, PointsError> {
        if value == 0 {
            return Err(PointsError::ZeroValue);
        }
        let address = user.address().to_string();
        let now = unix_timestamp();

        let mut txn = self
            .db
            .pool()
            .begin()
            .await
            .map_err(DatabaseError::from)?;

        // The CHECK runs on the UPDATE and fails the whole statement, so the
        // row is first created with zero if absent, then adjusted.
        sqlx::query(
            "INSERT INTO points_balance (rewards_address, balance) VALUES (?, 0) ON CONFLICT DO NOTHING",
        )
        .bind(&address)
        .execute(&mut *txn)
        .await
        .map_err(DatabaseError::from)?;

        let update = sqlx::query(
            "UPDATE points_balance SET balance = balance + ? WHERE rewards_address = ?",
        )
        .bind(value)
        .bind(&address)
        .execute(&mut *txn)
        .await;

        if let Err(e) = update {
            if e.to_string().contains("CHECK constraint failed") {
                return Err(PointsError::InsufficientBalance);
            }
            return Err(DatabaseError::from(e).into());
        }

        if tx_type.is_collapsible() {
            let cutoff = now - COLLAPSE_WINDOW.as_secs() as i64;
            let existing = sqlx::query_as::<_, PointsTxRow>(
                r#"
                SELECT * FROM points_tx
                WHERE rewards_address = ? AND tx_type = ? AND updated_at > ?
                ORDER BY updated_at DESC LIMIT 1
                "#,
            )
            .bind(&address)
            .bind(tx_type.as_str())
            .bind(cutoff)
            .fetch_optional(&mut *txn)
            .await
            .map_err(DatabaseError::from)?;

            if let Some(row) = existing {
                sqlx::query("UPDATE points_tx SET value = value + ?, updated_at = ? WHERE id = ?")
                    .bind(value)
                    .bind(now)
                    .bind(row.id)
                    .execute(&mut *txn)
                    .await
                    .map_err(DatabaseError::from)?;
                txn.commit().await.map_err(DatabaseError::from)?;

                let updated = self.db.points_transaction(row.id).await?;
                self.on_transaction_updated
                    .notify(TransactionUpdatedEventArgs {
                        transaction: updated.clone(),
                        adjustment_value: value,
                    });
                return Ok(updated);
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO points_tx (rewards_address, tx_type, value, created_at, updated_at, extra)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&address)
        .bind(tx_type.as_str())
        .bind(value)
        .bind(now)
        .bind(now)
        .bind(serde_json::Value::Object(extra).to_string())
        .execute(&mut *txn)
        .await
        .map_err(DatabaseError::from)?;

        let id = result.last_insert_rowid();
        txn.commit().await.map_err(DatabaseError::from)?;

        let row = self.db.points_transaction(id).await?;
        self.on_transaction_created.notify(row.clone());
        Ok(row)
    }
}

/// Builds the extra map for a transaction from key/value pairs.
pub fn tx_extra<I, K, V>(fields: I) -> serde_json::Map<String, serde_json::Value>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<serde_json::Value>,
{
    fields
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(n: u8) -> User {
        User::address_only(format!("ban_{}", char::from(b'1' + n % 8).to_string().repeat(60)))
    }

    #[tokio::test]
    async fn balances_never_go_negative() {
        let db = Database::open_in_memory().await.unwrap();
        let manager = PointsManager::new(db);
        let u = user(0);

        manager
            .create_transaction(&u, PointsTxType::MediaEnqueuedReward, 10, Default::default())
            .await
            .unwrap();
        assert_eq!(manager.balance(u.address()).await.unwrap(), 10);

        let err = manager
            .create_transaction(
                &u,
                PointsTxType::MediaEnqueuedRewardReversal,
                -11,
                Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PointsError::InsufficientBalance));
        // the failed attempt left no trace
        assert_eq!(manager.balance(u.address()).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn zero_value_fails_validation() {
        let db = Database::open_in_memory().await.unwrap();
        let manager = PointsManager::new(db);

        let err = manager
            .create_transaction(&user(1), PointsTxType::ApplicationDefined, 0, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PointsError::ZeroValue));
    }

    #[tokio::test]
    async fn overdraw_from_unseen_address_fails() {
        let db = Database::open_in_memory().await.unwrap();
        let manager = PointsManager::new(db);

        let err = manager
            .create_transaction(&user(2), PointsTxType::ApplicationDefined, -1, Default::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PointsError::InsufficientBalance));
    }

    #[tokio::test]
    async fn collapsible_transactions_merge_and_fire_update() {
        let db = Database::open_in_memory().await.unwrap();
        let manager = PointsManager::new(db);
        let u = user(3);

        let mut created = manager
            .on_transaction_created()
            .subscribe(marquee_core::event::BufferingGuarantee::BufferAll);
        let mut updated = manager
            .on_transaction_updated()
            .subscribe(marquee_core::event::BufferingGuarantee::BufferAll);

        let first = manager
            .create_transaction(&u, PointsTxType::ChatActivityReward, 6, Default::default())
            .await
            .unwrap();
        let second = manager
            .create_transaction(&u, PointsTxType::ChatActivityReward, 3, Default::default())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.value, 9);
        assert_eq!(manager.balance(u.address()).await.unwrap(), 9);

        assert_eq!(created.recv().await.unwrap().id, first.id);
        let update = updated.recv().await.unwrap();
        assert_eq!(update.adjustment_value, 3);
        assert_eq!(update.transaction.value, 9);
    }

    #[tokio::test]
    async fn extra_fields_are_stored() {
        let db = Database::open_in_memory().await.unwrap();
        let manager = PointsManager::new(db);

        let row = manager
            .create_transaction(
                &user(4),
                PointsTxType::MediaEnqueuedReward,
                7,
                tx_extra([("media", "perf-1")]),
            )
            .await
            .unwrap();
        let extra: serde_json::Value = serde_json::from_str(&row.extra).unwrap();
        assert_eq!(extra["media"], "perf-1");
    }
}
