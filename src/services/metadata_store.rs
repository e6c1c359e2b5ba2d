//! src/services/metadata_store.rs
//!
//! Per-container SQLite store holding one row per object and the container's
//! append-only audit log. Timestamps are stored as integer microseconds so
//! range filters and ordering compare numerically.

use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{collections::BTreeMap, path::Path, time::Duration};
use tracing::debug;
use uuid::Uuid;

use crate::{
    errors::{StorageError, StorageResult},
    models::{
        audit::{AuditLogEntry, AuditQuery},
        object::{DEFAULT_PAGE_SIZE, EnumerationQuery, MAX_PAGE_SIZE, ObjectMetadata},
    },
};

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS objects (
        id BLOB PRIMARY KEY NOT NULL,
        container_id BLOB NOT NULL,
        object_key TEXT NOT NULL UNIQUE,
        content_type TEXT NOT NULL,
        content_length INTEGER NOT NULL,
        content_hash TEXT NOT NULL,
        tags TEXT NOT NULL DEFAULT '[]',
        key_values TEXT NOT NULL DEFAULT '{}',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        accessed_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_objects_created ON objects(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_objects_hash ON objects(content_hash)",
    "CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        container_id BLOB NOT NULL,
        object_id BLOB,
        object_key TEXT,
        action TEXT NOT NULL,
        metadata TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_audit_key ON audit_log(object_key)",
];

const OBJECT_COLUMNS: &str = "id, container_id, object_key, content_type, content_length, \
     content_hash, tags, key_values, created_at, updated_at, accessed_at";

#[derive(FromRow)]
struct ObjectRow {
    id: Uuid,
    container_id: Uuid,
    object_key: String,
    content_type: String,
    content_length: i64,
    content_hash: String,
    tags: String,
    key_values: String,
    created_at: i64,
    updated_at: i64,
    accessed_at: i64,
}

impl TryFrom<ObjectRow> for ObjectMetadata {
    type Error = StorageError;

    fn try_from(row: ObjectRow) -> StorageResult<Self> {
        let tags: Vec<String> = serde_json::from_str(&row.tags)
            .map_err(|err| StorageError::Server(format!("corrupt tags column: {err}")))?;
        let key_values: BTreeMap<String, String> = serde_json::from_str(&row.key_values)
            .map_err(|err| StorageError::Server(format!("corrupt key_values column: {err}")))?;
        Ok(ObjectMetadata {
            id: row.id,
            container_id: row.container_id,
            key: row.object_key,
            content_type: row.content_type,
            content_length: row.content_length.max(0) as u64,
            content_hash: row.content_hash,
            tags,
            key_values,
            created_at: from_micros(row.created_at),
            updated_at: from_micros(row.updated_at),
            accessed_at: from_micros(row.accessed_at),
        })
    }
}

#[derive(FromRow)]
struct AuditRow {
    id: i64,
    container_id: Uuid,
    object_id: Option<Uuid>,
    object_key: Option<String>,
    action: String,
    metadata: Option<String>,
    created_at: i64,
}

impl TryFrom<AuditRow> for AuditLogEntry {
    type Error = StorageError;

    fn try_from(row: AuditRow) -> StorageResult<Self> {
        Ok(AuditLogEntry {
            id: row.id,
            container_id: row.container_id,
            object_id: row.object_id,
            object_key: row.object_key,
            action: row.action.parse().map_err(StorageError::Server)?,
            metadata: row.metadata,
            created_at: from_micros(row.created_at),
        })
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|err| StorageError::Server(err.to_string()))
}

/// Object metadata and audit log for a single container.
#[derive(Clone, Debug)]
pub struct MetadataStore {
    pool: SqlitePool,
    container_id: Uuid,
}

impl MetadataStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Schema creation is idempotent, so this is safe on every startup.
    pub async fn open(path: impl AsRef<Path>, container_id: Uuid) -> StorageResult<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }

        debug!(%container_id, path = %path.as_ref().display(), "opened metadata store");
        Ok(Self { pool, container_id })
    }

    pub fn container_id(&self) -> Uuid {
        self.container_id
    }

    /// Close all pooled connections, e.g. before removing the database file.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Connectivity check used by readiness.
    pub async fn ping(&self) -> StorageResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert or replace the record for `meta.key`.
    pub async fn put(&self, meta: &ObjectMetadata) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO objects (
                id, container_id, object_key, content_type, content_length,
                content_hash, tags, key_values, created_at, updated_at, accessed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(object_key) DO UPDATE SET
                id = excluded.id,
                content_type = excluded.content_type,
                content_length = excluded.content_length,
                content_hash = excluded.content_hash,
                tags = excluded.tags,
                key_values = excluded.key_values,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                accessed_at = excluded.accessed_at
            "#,
        )
        .bind(meta.id)
        .bind(self.container_id)
        .bind(&meta.key)
        .bind(&meta.content_type)
        .bind(meta.content_length as i64)
        .bind(&meta.content_hash)
        .bind(to_json(&meta.tags)?)
        .bind(to_json(&meta.key_values)?)
        .bind(to_micros(meta.created_at))
        .bind(to_micros(meta.updated_at))
        .bind(to_micros(meta.accessed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> StorageResult<Option<ObjectMetadata>> {
        let sql = format!("SELECT {OBJECT_COLUMNS} FROM objects WHERE object_key = ?");
        let row = sqlx::query_as::<_, ObjectRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ObjectMetadata::try_from).transpose()
    }

    /// Remove the record for `key`. Returns whether a record existed.
    pub async fn delete(&self, key: &str) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM objects WHERE object_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Move a record to a new key and identifier.
    pub async fn rename(&self, old_key: &str, new_key: &str) -> StorageResult<()> {
        let new_id = ObjectMetadata::object_id(&self.container_id, new_key);
        let result = sqlx::query(
            "UPDATE objects SET object_key = ?, id = ?, updated_at = ? WHERE object_key = ?",
        )
        .bind(new_key)
        .bind(new_id)
        .bind(to_micros(Utc::now()))
        .bind(old_key)
        .execute(&self.pool)
        .await
        .map_err(|err| match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StorageError::AlreadyExists(new_key.to_string())
            }
            _ => StorageError::Sqlx(err),
        })?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(old_key.to_string()));
        }
        Ok(())
    }

    pub async fn update_tags(&self, key: &str, tags: &[String]) -> StorageResult<()> {
        let result =
            sqlx::query("UPDATE objects SET tags = ?, updated_at = ? WHERE object_key = ?")
                .bind(to_json(&tags)?)
                .bind(to_micros(Utc::now()))
                .bind(key)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(())
    }

    pub async fn update_key_values(
        &self,
        key: &str,
        key_values: &BTreeMap<String, String>,
    ) -> StorageResult<()> {
        let result =
            sqlx::query("UPDATE objects SET key_values = ?, updated_at = ? WHERE object_key = ?")
                .bind(to_json(key_values)?)
                .bind(to_micros(Utc::now()))
                .bind(key)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(())
    }

    /// Refresh `accessed_at` without touching content fields. Returns the
    /// timestamp as stored.
    pub async fn touch_accessed(&self, key: &str) -> StorageResult<DateTime<Utc>> {
        let micros = to_micros(Utc::now());
        sqlx::query("UPDATE objects SET accessed_at = ? WHERE object_key = ?")
            .bind(micros)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(from_micros(micros))
    }

    /// Return one page of objects matching the query's filter.
    pub async fn enumerate(&self, query: &EnumerationQuery) -> StorageResult<Vec<ObjectMetadata>> {
        // SQLite reads a negative OFFSET as zero; nothing lives that far out.
        let Ok(offset) = i64::try_from(query.index_start) else {
            return Ok(Vec::new());
        };
        let filter = &query.filter;
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {OBJECT_COLUMNS} FROM objects WHERE 1 = 1"
        ));

        if let Some(prefix) = &filter.prefix {
            builder.push(" AND substr(object_key, 1, ");
            builder.push_bind(prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(prefix.clone());
        }

        let time_bounds = [
            ("created_at", "<", filter.created_before),
            ("created_at", ">", filter.created_after),
            ("updated_at", "<", filter.updated_before),
            ("updated_at", ">", filter.updated_after),
            ("accessed_at", "<", filter.accessed_before),
            ("accessed_at", ">", filter.accessed_after),
        ];
        for (column, op, bound) in time_bounds {
            if let Some(ts) = bound {
                builder.push(format!(" AND {column} {op} "));
                builder.push_bind(to_micros(ts));
            }
        }

        if let Some(hash) = &filter.content_hash {
            builder.push(" AND content_hash = ");
            builder.push_bind(hash.clone());
        }
        if let Some(content_type) = &filter.content_type {
            builder.push(" AND content_type = ");
            builder.push_bind(content_type.clone());
        }
        if let Some(min) = filter.min_size {
            builder.push(" AND content_length >= ");
            builder.push_bind(min as i64);
        }
        if let Some(max) = filter.max_size {
            builder.push(" AND content_length <= ");
            builder.push_bind(max as i64);
        }
        for tag in &filter.tags {
            builder.push(" AND EXISTS (SELECT 1 FROM json_each(objects.tags) WHERE value = ");
            builder.push_bind(tag.clone());
            builder.push(")");
        }

        builder.push(query.order_by.order_clause());
        builder.push(" LIMIT ");
        builder.push_bind(query.limit() as i64);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows: Vec<ObjectRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ObjectMetadata::try_from).collect()
    }

    pub async fn append_audit(&self, entry: &AuditLogEntry) -> StorageResult<i64> {
        let result = sqlx::query(
            "INSERT INTO audit_log (container_id, object_id, object_key, action, metadata, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(self.container_id)
        .bind(entry.object_id)
        .bind(entry.object_key.as_deref())
        .bind(entry.action.as_str())
        .bind(entry.metadata.as_deref())
        .bind(to_micros(entry.created_at))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Audit entries in insertion order.
    pub async fn query_audit(&self, query: &AuditQuery) -> StorageResult<Vec<AuditLogEntry>> {
        let Ok(offset) = i64::try_from(query.index_start) else {
            return Ok(Vec::new());
        };
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, container_id, object_id, object_key, action, metadata, created_at \
             FROM audit_log WHERE 1 = 1",
        );
        if let Some(key) = &query.object_key {
            builder.push(" AND object_key = ");
            builder.push_bind(key.clone());
        }
        if let Some(action) = query.action {
            builder.push(" AND action = ");
            builder.push_bind(action.as_str());
        }
        if let Some(since) = query.since {
            builder.push(" AND created_at >= ");
            builder.push_bind(to_micros(since));
        }
        if let Some(until) = query.until {
            builder.push(" AND created_at <= ");
            builder.push_bind(to_micros(until));
        }
        let limit = query
            .max_results
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        builder.push(" ORDER BY id ASC LIMIT ");
        builder.push_bind(limit as i64);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let rows: Vec<AuditRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(AuditLogEntry::try_from).collect()
    }

    pub async fn clear_audit(&self) -> StorageResult<u64> {
        let result = sqlx::query("DELETE FROM audit_log")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        audit::AuditAction,
        object::{EnumerationFilter, EnumerationOrder},
    };
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    async fn make_store() -> (MetadataStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(dir.path().join("metadata.db"), Uuid::new_v4())
            .await
            .unwrap();
        (store, dir)
    }

    fn meta(store: &MetadataStore, key: &str, size: u64, age_secs: i64) -> ObjectMetadata {
        let created = Utc::now() - ChronoDuration::seconds(age_secs);
        ObjectMetadata {
            id: ObjectMetadata::object_id(&store.container_id(), key),
            container_id: store.container_id(),
            key: key.to_string(),
            content_type: "text/plain".into(),
            content_length: size,
            content_hash: format!("hash-{key}"),
            tags: vec![],
            key_values: BTreeMap::new(),
            created_at: created,
            updated_at: created,
            accessed_at: created,
        }
    }

    #[tokio::test]
    async fn put_get_delete() {
        let (store, _dir) = make_store().await;
        let mut record = meta(&store, "a.txt", 5, 0);
        record.tags = vec!["red".into()];
        record.key_values.insert("author".into(), "alice".into());
        store.put(&record).await.unwrap();

        let fetched = store.get("a.txt").await.unwrap().unwrap();
        assert_eq!(fetched.content_length, 5);
        assert_eq!(fetched.tags, vec!["red".to_string()]);
        assert_eq!(fetched.key_values.get("author").map(String::as_str), Some("alice"));
        assert_eq!(fetched.created_at.timestamp_micros(), record.created_at.timestamp_micros());

        assert!(store.delete("a.txt").await.unwrap());
        assert!(!store.delete("a.txt").await.unwrap());
        assert!(store.get("a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rename_moves_key_and_id() {
        let (store, _dir) = make_store().await;
        store.put(&meta(&store, "old", 1, 0)).await.unwrap();
        store.put(&meta(&store, "taken", 1, 0)).await.unwrap();

        let err = store.rename("old", "taken").await.unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        let err = store.rename("missing", "new").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));

        store.rename("old", "new").await.unwrap();
        assert!(store.get("old").await.unwrap().is_none());
        let renamed = store.get("new").await.unwrap().unwrap();
        assert_eq!(renamed.id, ObjectMetadata::object_id(&store.container_id(), "new"));
    }

    #[tokio::test]
    async fn paging_visits_every_object_once_newest_first() {
        let (store, _dir) = make_store().await;
        for i in 0..7 {
            store
                .put(&meta(&store, &format!("obj-{i}"), i, 100 - i as i64))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut index_start = 0;
        loop {
            let page = store
                .enumerate(&EnumerationQuery::page(index_start, 3))
                .await
                .unwrap();
            if page.is_empty() {
                break;
            }
            index_start += page.len() as u64;
            seen.extend(page.into_iter().map(|m| m.key));
        }

        let expected: Vec<String> = (0..7).rev().map(|i| format!("obj-{i}")).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn filters_combine_with_and() {
        let (store, _dir) = make_store().await;
        let mut small = meta(&store, "docs/small", 10, 50);
        small.tags = vec!["a".into(), "b".into()];
        let mut large = meta(&store, "docs/large", 1000, 40);
        large.tags = vec!["a".into()];
        large.content_type = "image/png".into();
        let other = meta(&store, "misc/other", 10, 30);
        for record in [&small, &large, &other] {
            store.put(record).await.unwrap();
        }

        let query = |filter: EnumerationFilter| EnumerationQuery {
            filter,
            order_by: EnumerationOrder::KeyAscending,
            ..EnumerationQuery::default()
        };
        let keys = |page: Vec<ObjectMetadata>| page.into_iter().map(|m| m.key).collect::<Vec<_>>();

        let by_tags = store
            .enumerate(&query(EnumerationFilter {
                tags: vec!["a".into(), "b".into()],
                ..EnumerationFilter::default()
            }))
            .await
            .unwrap();
        assert_eq!(keys(by_tags), vec!["docs/small"]);

        let by_prefix_and_size = store
            .enumerate(&query(EnumerationFilter {
                prefix: Some("docs/".into()),
                min_size: Some(100),
                ..EnumerationFilter::default()
            }))
            .await
            .unwrap();
        assert_eq!(keys(by_prefix_and_size), vec!["docs/large"]);

        let by_type = store
            .enumerate(&query(EnumerationFilter {
                content_type: Some("text/plain".into()),
                created_before: Some(Utc::now() - ChronoDuration::seconds(35)),
                ..EnumerationFilter::default()
            }))
            .await
            .unwrap();
        assert_eq!(keys(by_type), vec!["docs/small"]);

        let by_hash = store
            .enumerate(&query(EnumerationFilter {
                content_hash: Some("hash-misc/other".into()),
                ..EnumerationFilter::default()
            }))
            .await
            .unwrap();
        assert_eq!(keys(by_hash), vec!["misc/other"]);
    }

    #[tokio::test]
    async fn audit_log_is_ordered_and_clearable() {
        let (store, _dir) = make_store().await;
        let object_id = Uuid::new_v4();
        for action in [AuditAction::Write, AuditAction::Read, AuditAction::Delete] {
            store
                .append_audit(
                    &AuditLogEntry::new(store.container_id(), action).for_object(object_id, "a"),
                )
                .await
                .unwrap();
        }

        let all = store.query_audit(&AuditQuery::default()).await.unwrap();
        let actions: Vec<_> = all.iter().map(|e| e.action).collect();
        assert_eq!(
            actions,
            vec![AuditAction::Write, AuditAction::Read, AuditAction::Delete]
        );

        let reads = store
            .query_audit(&AuditQuery {
                action: Some(AuditAction::Read),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(reads.len(), 1);

        assert_eq!(store.clear_audit().await.unwrap(), 3);
        assert!(store.query_audit(&AuditQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offsets_past_the_end_return_empty_pages() {
        let (store, _dir) = make_store().await;
        store.put(&meta(&store, "only", 1, 0)).await.unwrap();
        store
            .append_audit(&AuditLogEntry::new(store.container_id(), AuditAction::Write))
            .await
            .unwrap();

        for index_start in [1, i64::MAX as u64 + 1, u64::MAX] {
            let page = store
                .enumerate(&EnumerationQuery::page(index_start, 10))
                .await
                .unwrap();
            assert!(page.is_empty(), "index_start {index_start}");

            let audit = store
                .query_audit(&AuditQuery {
                    index_start,
                    ..AuditQuery::default()
                })
                .await
                .unwrap();
            assert!(audit.is_empty(), "index_start {index_start}");
        }
    }

    #[tokio::test]
    async fn touching_only_moves_accessed_at() {
        let (store, _dir) = make_store().await;
        let record = meta(&store, "a.txt", 5, 60);
        store.put(&record).await.unwrap();

        let touched = store.touch_accessed("a.txt").await.unwrap();
        let fetched = store.get("a.txt").await.unwrap().unwrap();
        assert_eq!(fetched.accessed_at, touched);
        assert!(touched > record.accessed_at);
        assert_eq!(fetched.updated_at.timestamp_micros(), record.updated_at.timestamp_micros());
        assert_eq!(fetched.content_hash, record.content_hash);
        assert_eq!(fetched.content_length, record.content_length);
    }
}
