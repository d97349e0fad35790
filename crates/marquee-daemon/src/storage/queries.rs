//! Database queries for the Marquee daemon.

use marquee_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::*;

impl Database {
    // =========================================================================
    // Points queries (balance mutation lives in the points manager so it can
    // run inside one transaction with the ledger insert)
    // =========================================================================

    /// Get the points balance for an address; addresses never seen have a
    /// zero balance.
    pub async fn points_balance(&self, address: &str) -> Result<i64, DatabaseError> {
        let row = sqlx::query_as::<_, PointsBalanceRow>(
            "SELECT * FROM points_balance WHERE rewards_address = ?",
        )
        .bind(address)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map_or(0, |r| r.balance))
    }

    /// Get a points transaction by id.
    pub async fn points_transaction(&self, id: i64) -> Result<PointsTxRow, DatabaseError> {
        sqlx::query_as::<_, PointsTxRow>("SELECT * FROM points_tx WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("points transaction {id}")))
    }

    /// List transactions for an address, newest first.
    pub async fn points_transactions_for_address(
        &self,
        address: &str,
        limit: u32,
    ) -> Result<Vec<PointsTxRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, PointsTxRow>(
            "SELECT * FROM points_tx WHERE rewards_address = ? ORDER BY updated_at DESC LIMIT ?",
        )
        .bind(address)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    // =========================================================================
    // Application queries
    // =========================================================================

    pub async fn application(&self, id: &str) -> Result<ApplicationRow, DatabaseError> {
        sqlx::query_as::<_, ApplicationRow>("SELECT * FROM application WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("application {id}")))
    }

    pub async fn upsert_application(
        &self,
        id: &str,
        allow_launching: bool,
        autorun: bool,
    ) -> Result<ApplicationRow, DatabaseError> {
        let now = unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO application (id, updated_at, allow_launching, autorun)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                updated_at = excluded.updated_at,
                allow_launching = excluded.allow_launching,
                autorun = excluded.autorun
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(i64::from(allow_launching))
        .bind(i64::from(autorun))
        .execute(self.pool())
        .await?;

        self.application(id).await
    }

    pub async fn autorun_applications(&self) -> Result<Vec<ApplicationRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, ApplicationRow>(
            "SELECT * FROM application WHERE autorun = 1 AND allow_launching = 1 ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    /// Store a file at an application version.
    pub async fn put_application_file(
        &self,
        application_id: &str,
        version: i64,
        name: &str,
        file_type: &str,
        public: bool,
        content: &[u8],
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO application_file (application_id, version, name, file_type, public, content)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (application_id, version, name) DO UPDATE SET
                file_type = excluded.file_type,
                public = excluded.public,
                content = excluded.content
            "#,
        )
        .bind(application_id)
        .bind(version)
        .bind(name)
        .bind(file_type)
        .bind(i64::from(public))
        .bind(content)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Get one file of an application at a version.
    pub async fn application_file(
        &self,
        application_id: &str,
        version: i64,
        name: &str,
    ) -> Result<ApplicationFileRow, DatabaseError> {
        sqlx::query_as::<_, ApplicationFileRow>(
            "SELECT * FROM application_file WHERE application_id = ? AND version = ? AND name = ?",
        )
        .bind(application_id)
        .bind(version)
        .bind(name)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("application file {name}")))
    }

    /// All files of an application at a version.
    pub async fn application_files(
        &self,
        application_id: &str,
        version: i64,
    ) -> Result<Vec<ApplicationFileRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, ApplicationFileRow>(
            "SELECT * FROM application_file WHERE application_id = ? AND version = ? ORDER BY name",
        )
        .bind(application_id)
        .bind(version)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    // =========================================================================
    // Application key-value store
    // =========================================================================

    pub async fn kv_get(
        &self,
        application_id: &str,
        key: &str,
    ) -> Result<Option<String>, DatabaseError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT value FROM application_kv WHERE application_id = ? AND key = ?",
        )
        .bind(application_id)
        .bind(key)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(|(v,)| v))
    }

    pub async fn kv_set(
        &self,
        application_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO application_kv (application_id, key, value) VALUES (?, ?, ?)
            ON CONFLICT (application_id, key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(application_id)
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn kv_delete(&self, application_id: &str, key: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM application_kv WHERE application_id = ? AND key = ?")
            .bind(application_id)
            .bind(key)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn kv_clear(&self, application_id: &str) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM application_kv WHERE application_id = ?")
            .bind(application_id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn kv_keys(&self, application_id: &str) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM application_kv WHERE application_id = ? ORDER BY key",
        )
        .bind(application_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    // =========================================================================
    // Application documents
    // =========================================================================

    pub async fn document(
        &self,
        application_id: &str,
        id: &str,
    ) -> Result<Option<DocumentRow>, DatabaseError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT * FROM document WHERE application_id = ? AND id = ?",
        )
        .bind(application_id)
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row)
    }

    pub async fn put_document(
        &self,
        application_id: &str,
        id: &str,
        public: bool,
        format: &str,
        content: &str,
    ) -> Result<(), DatabaseError> {
        let now = unix_timestamp();
        sqlx::query(
            r#"
            INSERT INTO document (id, application_id, updated_at, public, format, content)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (id, application_id) DO UPDATE SET
                updated_at = excluded.updated_at,
                public = excluded.public,
                format = excluded.format,
                content = excluded.content
            "#,
        )
        .bind(id)
        .bind(application_id)
        .bind(now)
        .bind(i64::from(public))
        .bind(format)
        .bind(content)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn delete_document(
        &self,
        application_id: &str,
        id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("DELETE FROM document WHERE application_id = ? AND id = ?")
            .bind(application_id)
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn document_ids(&self, application_id: &str) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM document WHERE application_id = ? ORDER BY id")
                .bind(application_id)
                .fetch_all(self.pool())
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    // =========================================================================
    // Media allowlists and history
    // =========================================================================

    pub async fn is_media_allowed(
        &self,
        media_type: &str,
        media_id: &str,
    ) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM disallowed_media WHERE media_type = ? AND media_id = ?",
        )
        .bind(media_type)
        .bind(media_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.is_none())
    }

    pub async fn is_media_collection_allowed(
        &self,
        collection_type: &str,
        collection_id: &str,
    ) -> Result<bool, DatabaseError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM disallowed_media_collection WHERE collection_type = ? AND collection_id = ?",
        )
        .bind(collection_type)
        .bind(collection_id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.is_none())
    }

    pub async fn disallow_media(
        &self,
        media_type: &str,
        media_id: &str,
        disallowed_by: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO disallowed_media (media_type, media_id, disallowed_by, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (media_type, media_id) DO NOTHING
            "#,
        )
        .bind(media_type)
        .bind(media_id)
        .bind(disallowed_by)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Record the start of playback for a queue entry.
    pub async fn insert_played_media(&self, row: &PlayedMediaRow) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            INSERT INTO played_media
                (id, media_type, media_id, started_at, ended_at, media_offset, media_length,
                 requested_by, request_cost, unskippable)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&row.id)
        .bind(&row.media_type)
        .bind(&row.media_id)
        .bind(row.started_at)
        .bind(row.ended_at)
        .bind(row.media_offset)
        .bind(row.media_length)
        .bind(&row.requested_by)
        .bind(&row.request_cost)
        .bind(row.unskippable)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    pub async fn mark_played_media_ended(&self, id: &str) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE played_media SET ended_at = ? WHERE id = ? AND ended_at IS NULL")
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Whether the given media finished playing within the last
    /// `cooldown_secs` seconds.
    pub async fn media_played_recently(
        &self,
        media_type: &str,
        media_id: &str,
        cooldown_secs: u64,
    ) -> Result<bool, DatabaseError> {
        let cutoff = unix_timestamp() - cooldown_secs as i64;
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT 1 FROM played_media
            WHERE media_type = ? AND media_id = ?
              AND (ended_at IS NULL OR ended_at > ?)
            LIMIT 1
            "#,
        )
        .bind(media_type)
        .bind(media_id)
        .bind(cutoff)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn kv_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        db.kv_set("app", "k", "v").await.unwrap();
        assert_eq!(db.kv_get("app", "k").await.unwrap(), Some("v".to_string()));
        assert_eq!(db.kv_get("other", "k").await.unwrap(), None);

        db.kv_delete("app", "k").await.unwrap();
        assert_eq!(db.kv_get("app", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn application_files_are_versioned() {
        let db = Database::open_in_memory().await.unwrap();
        db.upsert_application("app", true, false).await.unwrap();
        db.put_application_file("app", 1, "main.rhai", "text/x-rhai", false, b"1")
            .await
            .unwrap();
        db.put_application_file("app", 2, "main.rhai", "text/x-rhai", false, b"2")
            .await
            .unwrap();

        let v1 = db.application_file("app", 1, "main.rhai").await.unwrap();
        let v2 = db.application_file("app", 2, "main.rhai").await.unwrap();
        assert_eq!(v1.content, b"1");
        assert_eq!(v2.content, b"2");
    }

    #[tokio::test]
    async fn disallowed_media_blocks() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(db.is_media_allowed("track", "t1").await.unwrap());
        db.disallow_media("track", "t1", "mod").await.unwrap();
        assert!(!db.is_media_allowed("track", "t1").await.unwrap());
    }

    #[tokio::test]
    async fn played_media_cooldown() {
        let db = Database::open_in_memory().await.unwrap();
        let row = PlayedMediaRow {
            id: "p1".into(),
            media_type: "track".into(),
            media_id: "t1".into(),
            started_at: unix_timestamp(),
            ended_at: None,
            media_offset: 0,
            media_length: 120,
            requested_by: String::new(),
            request_cost: "0".into(),
            unskippable: 0,
        };
        db.insert_played_media(&row).await.unwrap();
        assert!(db.media_played_recently("track", "t1", 3600).await.unwrap());
        assert!(!db.media_played_recently("track", "t2", 3600).await.unwrap());
    }
}
