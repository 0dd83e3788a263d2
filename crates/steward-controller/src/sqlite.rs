// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed control plane.
//!
//! Every replica connects to the same database file. Conditional writes use
//! the `version` column of each row: an update only matches the row when the
//! caller still holds the version it read, which gives the compare-and-swap
//! semantics the lock manager relies on.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use steward_core::control_plane::{ControlPlane, ControlPlaneError, WorkItemStore};
use steward_core::work_item::split_resource_name;
use steward_core::{ItemKind, LockRecord, ParentKind, ParentRecord, StoredItem, WorkItem};

use crate::config::DEFAULT_PROCESS_STALE_AFTER;
use crate::error::Error;
use crate::process::ProcessRegistry;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> ControlPlaneError {
    move |e| ControlPlaneError::backend(operation, e)
}

fn decode_error(operation: &'static str) -> impl FnOnce(String) -> ControlPlaneError {
    move |e| ControlPlaneError::backend(operation, e)
}

/// SQLite-backed control plane and work-item store.
#[derive(Clone)]
pub struct SqliteControlPlane {
    pool: SqlitePool,
    stale_after: Duration,
}

impl SqliteControlPlane {
    /// Wrap an existing pool. Migrations are not run.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            stale_after: DEFAULT_PROCESS_STALE_AFTER,
        }
    }

    /// Heartbeat age after which a process is reported dead.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Connect to `url` and run migrations.
    ///
    /// In-memory URLs get a single connection that is never recycled, since
    /// every SQLite connection to `:memory:` opens its own database.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            ensure_parent_dir(url)?;
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options.connect(url).await?;

        let control_plane = Self::new(pool);
        control_plane.migrate().await?;
        Ok(control_plane)
    }

    /// Create the database file (and parent directories) at `path`.
    ///
    /// ```ignore
    /// let control_plane = SqliteControlPlane::from_path(".data/steward.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// A private in-memory database, mainly for tests.
    pub async fn in_memory() -> Result<Self, Error> {
        Self::connect("sqlite::memory:").await
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn current_version(
        &self,
        table: &'static str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<i64>, ControlPlaneError> {
        // table is always one of our own constants
        let sql = format!(
            "SELECT version FROM {} WHERE namespace = ? AND name = ?",
            table
        );
        sqlx::query_scalar::<_, i64>(&sql)
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("read_version"))
    }
}

/// Create the directory of a file-backed `sqlite:` URL.
fn ensure_parent_dir(url: &str) -> Result<(), Error> {
    let Some(rest) = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
    else {
        return Ok(());
    };
    let file = rest.split('?').next().unwrap_or_default();
    if let Some(parent) = Path::new(file).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[derive(sqlx::FromRow)]
struct LockRow {
    namespace: String,
    name: String,
    owner: String,
    target_kind: String,
    target_name: String,
    last_update_time: DateTime<Utc>,
    version: i64,
}

impl LockRow {
    fn into_record(self) -> Result<LockRecord, ControlPlaneError> {
        Ok(LockRecord {
            target_kind: self.target_kind.parse().map_err(decode_error("decode_lock"))?,
            namespace: self.namespace,
            name: self.name,
            owner: self.owner,
            target_name: self.target_name,
            last_update_time: self.last_update_time,
            version: self.version as u64,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ParentRow {
    namespace: String,
    name: String,
    uid: String,
    kind: String,
    status: String,
    deletion_requested: bool,
    version: i64,
}

impl ParentRow {
    fn into_record(self) -> Result<ParentRecord, ControlPlaneError> {
        let kind: ParentKind = self.kind.parse().map_err(decode_error("decode_parent"))?;
        let status: WorkItem = serde_json::from_str(&self.status)
            .map_err(|e| ControlPlaneError::backend("decode_parent", e))?;
        Ok(ParentRecord {
            namespace: self.namespace,
            name: self.name,
            uid: self.uid,
            kind,
            status,
            deletion_requested: self.deletion_requested,
            version: self.version as u64,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ItemRow {
    namespace: String,
    parent: String,
    uid: String,
    item: String,
    version: i64,
}

impl ItemRow {
    fn into_stored(self) -> Result<StoredItem, ControlPlaneError> {
        let item: WorkItem = serde_json::from_str(&self.item)
            .map_err(|e| ControlPlaneError::backend("decode_item", e))?;
        Ok(StoredItem {
            namespace: self.namespace,
            parent: self.parent,
            uid: self.uid,
            item,
            version: self.version as u64,
        })
    }
}

const LOCK_COLUMNS: &str =
    "namespace, name, owner, target_kind, target_name, last_update_time, version";
const PARENT_COLUMNS: &str =
    "namespace, name, uid, kind, status, deletion_requested, version";
const ITEM_COLUMNS: &str = "namespace, parent, uid, item, version";

#[async_trait]
impl ControlPlane for SqliteControlPlane {
    async fn get_lock(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<LockRecord>, ControlPlaneError> {
        let sql = format!(
            "SELECT {} FROM lock_records WHERE namespace = ? AND name = ?",
            LOCK_COLUMNS
        );
        sqlx::query_as::<_, LockRow>(&sql)
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_lock"))?
            .map(LockRow::into_record)
            .transpose()
    }

    async fn list_lock_namespaces(&self) -> Result<Vec<String>, ControlPlaneError> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT namespace FROM lock_records ORDER BY namespace",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list_lock_namespaces"))
    }

    async fn list_locks(&self, namespace: &str) -> Result<Vec<LockRecord>, ControlPlaneError> {
        let sql = format!(
            "SELECT {} FROM lock_records WHERE namespace = ? ORDER BY name",
            LOCK_COLUMNS
        );
        sqlx::query_as::<_, LockRow>(&sql)
            .bind(namespace)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_locks"))?
            .into_iter()
            .map(LockRow::into_record)
            .collect()
    }

    async fn create_lock(&self, record: &LockRecord) -> Result<LockRecord, ControlPlaneError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO lock_records
                (namespace, name, owner, target_kind, target_name, last_update_time, version)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&record.namespace)
        .bind(&record.name)
        .bind(&record.owner)
        .bind(record.target_kind.as_str())
        .bind(&record.target_name)
        .bind(record.last_update_time)
        .execute(&self.pool)
        .await
        .map_err(db_error("create_lock"))?;

        if result.rows_affected() == 0 {
            return Err(ControlPlaneError::AlreadyExists {
                kind: "lock",
                name: record.name.clone(),
            });
        }

        let mut created = record.clone();
        created.version = 1;
        Ok(created)
    }

    async fn update_lock(
        &self,
        record: &LockRecord,
        expected_version: u64,
    ) -> Result<LockRecord, ControlPlaneError> {
        let result = sqlx::query(
            r#"
            UPDATE lock_records
            SET owner = ?, target_kind = ?, target_name = ?, last_update_time = ?,
                version = version + 1
            WHERE namespace = ? AND name = ? AND version = ?
            "#,
        )
        .bind(&record.owner)
        .bind(record.target_kind.as_str())
        .bind(&record.target_name)
        .bind(record.last_update_time)
        .bind(&record.namespace)
        .bind(&record.name)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error("update_lock"))?;

        if result.rows_affected() == 0 {
            return Err(
                match self
                    .current_version("lock_records", &record.namespace, &record.name)
                    .await?
                {
                    None => ControlPlaneError::NotFound {
                        kind: "lock",
                        name: record.name.clone(),
                    },
                    Some(_) => ControlPlaneError::Conflict {
                        kind: "lock",
                        name: record.name.clone(),
                        expected: expected_version,
                    },
                },
            );
        }

        let mut updated = record.clone();
        updated.version = expected_version + 1;
        Ok(updated)
    }

    async fn write_lock(&self, record: &LockRecord) -> Result<LockRecord, ControlPlaneError> {
        let version = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE lock_records
            SET owner = ?, target_kind = ?, target_name = ?, last_update_time = ?,
                version = version + 1
            WHERE namespace = ? AND name = ?
            RETURNING version
            "#,
        )
        .bind(&record.owner)
        .bind(record.target_kind.as_str())
        .bind(&record.target_name)
        .bind(record.last_update_time)
        .bind(&record.namespace)
        .bind(&record.name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("write_lock"))?;

        let Some(version) = version else {
            return Err(ControlPlaneError::NotFound {
                kind: "lock",
                name: record.name.clone(),
            });
        };

        let mut written = record.clone();
        written.version = version as u64;
        Ok(written)
    }

    async fn delete_lock(&self, namespace: &str, name: &str) -> Result<(), ControlPlaneError> {
        sqlx::query("DELETE FROM lock_records WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete_lock"))?;
        Ok(())
    }

    async fn process_exists(&self, process_id: &str) -> Result<bool, ControlPlaneError> {
        let last_seen = sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT last_seen FROM processes WHERE process_id = ?",
        )
        .bind(process_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("process_exists"))?;

        let Some(last_seen) = last_seen else {
            return Ok(false);
        };
        // A heartbeat from the future (clock skew) counts as fresh.
        Ok(match (Utc::now() - last_seen).to_std() {
            Ok(age) => age <= self.stale_after,
            Err(_) => true,
        })
    }

    async fn resource_uid(
        &self,
        kind: ItemKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<String>, ControlPlaneError> {
        if let Some((parent, item)) = split_resource_name(name) {
            let row = sqlx::query_as::<_, (String, String)>(
                r#"
                SELECT w.uid, p.kind
                FROM work_items w
                JOIN parents p ON p.namespace = w.namespace AND p.name = w.parent
                WHERE w.namespace = ? AND w.parent = ? AND w.name = ?
                "#,
            )
            .bind(namespace)
            .bind(parent)
            .bind(item)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("resource_uid"))?;

            let Some((uid, parent_kind)) = row else {
                return Ok(None);
            };
            let parent_kind: ParentKind =
                parent_kind.parse().map_err(decode_error("resource_uid"))?;
            return Ok((parent_kind.child_kind() == kind).then_some(uid));
        }

        let row = sqlx::query_as::<_, (String, String)>(
            "SELECT uid, kind FROM parents WHERE namespace = ? AND name = ?",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("resource_uid"))?;

        let Some((uid, parent_kind)) = row else {
            return Ok(None);
        };
        let parent_kind: ParentKind = parent_kind.parse().map_err(decode_error("resource_uid"))?;
        Ok((parent_kind.item_kind() == kind).then_some(uid))
    }
}

#[async_trait]
impl WorkItemStore for SqliteControlPlane {
    async fn create_parent(&self, parent: &ParentRecord) -> Result<ParentRecord, ControlPlaneError> {
        let status = serde_json::to_string(&parent.status)
            .map_err(|e| ControlPlaneError::backend("encode_parent", e))?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO parents
                (namespace, name, uid, kind, status, deletion_requested, version)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&parent.namespace)
        .bind(&parent.name)
        .bind(&parent.uid)
        .bind(parent.kind.to_string())
        .bind(status)
        .bind(parent.deletion_requested)
        .execute(&self.pool)
        .await
        .map_err(db_error("create_parent"))?;

        if result.rows_affected() == 0 {
            return Err(ControlPlaneError::AlreadyExists {
                kind: "parent",
                name: parent.name.clone(),
            });
        }

        let mut created = parent.clone();
        created.version = 1;
        Ok(created)
    }

    async fn get_parent(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ParentRecord>, ControlPlaneError> {
        let sql = format!(
            "SELECT {} FROM parents WHERE namespace = ? AND name = ?",
            PARENT_COLUMNS
        );
        sqlx::query_as::<_, ParentRow>(&sql)
            .bind(namespace)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_parent"))?
            .map(ParentRow::into_record)
            .transpose()
    }

    async fn list_parents(&self) -> Result<Vec<ParentRecord>, ControlPlaneError> {
        let sql = format!("SELECT {} FROM parents ORDER BY id", PARENT_COLUMNS);
        sqlx::query_as::<_, ParentRow>(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_parents"))?
            .into_iter()
            .map(ParentRow::into_record)
            .collect()
    }

    async fn update_parent(
        &self,
        parent: &ParentRecord,
        expected_version: u64,
    ) -> Result<ParentRecord, ControlPlaneError> {
        let status = serde_json::to_string(&parent.status)
            .map_err(|e| ControlPlaneError::backend("encode_parent", e))?;

        let result = sqlx::query(
            r#"
            UPDATE parents
            SET status = ?, deletion_requested = ?, version = version + 1
            WHERE namespace = ? AND name = ? AND version = ?
            "#,
        )
        .bind(status)
        .bind(parent.deletion_requested)
        .bind(&parent.namespace)
        .bind(&parent.name)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error("update_parent"))?;

        if result.rows_affected() == 0 {
            return Err(
                match self
                    .current_version("parents", &parent.namespace, &parent.name)
                    .await?
                {
                    None => ControlPlaneError::NotFound {
                        kind: "parent",
                        name: parent.name.clone(),
                    },
                    Some(_) => ControlPlaneError::Conflict {
                        kind: "parent",
                        name: parent.name.clone(),
                        expected: expected_version,
                    },
                },
            );
        }

        let mut updated = parent.clone();
        updated.version = expected_version + 1;
        Ok(updated)
    }

    async fn delete_parent(&self, namespace: &str, name: &str) -> Result<(), ControlPlaneError> {
        let mut tx = self.pool.begin().await.map_err(db_error("delete_parent"))?;

        sqlx::query("DELETE FROM work_items WHERE namespace = ? AND parent = ?")
            .bind(namespace)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(db_error("delete_parent"))?;

        sqlx::query("DELETE FROM parents WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .execute(&mut *tx)
            .await
            .map_err(db_error("delete_parent"))?;

        tx.commit().await.map_err(db_error("delete_parent"))
    }

    async fn create_item(&self, item: &StoredItem) -> Result<StoredItem, ControlPlaneError> {
        let body = serde_json::to_string(&item.item)
            .map_err(|e| ControlPlaneError::backend("encode_item", e))?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO work_items (namespace, parent, name, uid, item, version)
            VALUES (?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(&item.namespace)
        .bind(&item.parent)
        .bind(&item.item.name)
        .bind(&item.uid)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(db_error("create_item"))?;

        if result.rows_affected() == 0 {
            return Err(ControlPlaneError::AlreadyExists {
                kind: "item",
                name: item.resource_name(),
            });
        }

        let mut created = item.clone();
        created.version = 1;
        Ok(created)
    }

    async fn get_item(
        &self,
        namespace: &str,
        parent: &str,
        name: &str,
    ) -> Result<Option<StoredItem>, ControlPlaneError> {
        let sql = format!(
            "SELECT {} FROM work_items WHERE namespace = ? AND parent = ? AND name = ?",
            ITEM_COLUMNS
        );
        sqlx::query_as::<_, ItemRow>(&sql)
            .bind(namespace)
            .bind(parent)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_item"))?
            .map(ItemRow::into_stored)
            .transpose()
    }

    async fn list_items(
        &self,
        namespace: &str,
        parent: &str,
    ) -> Result<Vec<StoredItem>, ControlPlaneError> {
        let sql = format!(
            "SELECT {} FROM work_items WHERE namespace = ? AND parent = ? ORDER BY id",
            ITEM_COLUMNS
        );
        sqlx::query_as::<_, ItemRow>(&sql)
            .bind(namespace)
            .bind(parent)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_items"))?
            .into_iter()
            .map(ItemRow::into_stored)
            .collect()
    }

    async fn update_item(
        &self,
        item: &StoredItem,
        expected_version: u64,
    ) -> Result<StoredItem, ControlPlaneError> {
        let body = serde_json::to_string(&item.item)
            .map_err(|e| ControlPlaneError::backend("encode_item", e))?;

        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET item = ?, version = version + 1
            WHERE namespace = ? AND parent = ? AND name = ? AND version = ?
            "#,
        )
        .bind(body)
        .bind(&item.namespace)
        .bind(&item.parent)
        .bind(&item.item.name)
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await
        .map_err(db_error("update_item"))?;

        if result.rows_affected() == 0 {
            let exists = self
                .get_item(&item.namespace, &item.parent, &item.item.name)
                .await?
                .is_some();
            return Err(if exists {
                ControlPlaneError::Conflict {
                    kind: "item",
                    name: item.resource_name(),
                    expected: expected_version,
                }
            } else {
                ControlPlaneError::NotFound {
                    kind: "item",
                    name: item.resource_name(),
                }
            });
        }

        let mut updated = item.clone();
        updated.version = expected_version + 1;
        Ok(updated)
    }

    async fn delete_item(
        &self,
        namespace: &str,
        parent: &str,
        name: &str,
    ) -> Result<(), ControlPlaneError> {
        sqlx::query("DELETE FROM work_items WHERE namespace = ? AND parent = ? AND name = ?")
            .bind(namespace)
            .bind(parent)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_error("delete_item"))?;
        Ok(())
    }
}

#[async_trait]
impl ProcessRegistry for SqliteControlPlane {
    async fn register(&self, process_id: &str) -> Result<(), ControlPlaneError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO processes (process_id, started_at, last_seen)
            VALUES (?, ?, ?)
            ON CONFLICT (process_id) DO UPDATE SET started_at = excluded.started_at,
                                                   last_seen = excluded.last_seen
            "#,
        )
        .bind(process_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error("register_process"))?;
        Ok(())
    }

    async fn heartbeat(&self, process_id: &str) -> Result<(), ControlPlaneError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO processes (process_id, started_at, last_seen)
            VALUES (?, ?, ?)
            ON CONFLICT (process_id) DO UPDATE SET last_seen = excluded.last_seen
            "#,
        )
        .bind(process_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error("heartbeat_process"))?;
        Ok(())
    }

    async fn deregister(&self, process_id: &str) -> Result<(), ControlPlaneError> {
        sqlx::query("DELETE FROM processes WHERE process_id = ?")
            .bind(process_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("deregister_process"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward_core::TargetRef;

    async fn control_plane() -> SqliteControlPlane {
        SqliteControlPlane::in_memory()
            .await
            .expect("Failed to create in-memory control plane")
    }

    fn record(name: &str, owner: &str) -> LockRecord {
        let target = TargetRef::new(ItemKind::DeployItem, "default", "exec/a", "u1");
        LockRecord::new(name.to_string(), &target, owner, Utc::now())
    }

    #[tokio::test]
    async fn test_lock_round_trip() {
        let cp = control_plane().await;

        let created = cp.create_lock(&record("di-u1", "p1")).await.unwrap();
        assert_eq!(created.version, 1);

        let read = cp.get_lock("default", "di-u1").await.unwrap().unwrap();
        assert_eq!(read.owner, "p1");
        assert_eq!(read.target_kind, ItemKind::DeployItem);
        assert_eq!(read.target_name, "exec/a");
        assert_eq!(read.version, 1);
    }

    #[tokio::test]
    async fn test_create_conflicts_on_existing_name() {
        let cp = control_plane().await;
        cp.create_lock(&record("di-u1", "p1")).await.unwrap();

        let err = cp.create_lock(&record("di-u1", "p2")).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(
            cp.get_lock("default", "di-u1").await.unwrap().unwrap().owner,
            "p1"
        );
    }

    #[tokio::test]
    async fn test_update_requires_matching_version() {
        let cp = control_plane().await;
        let mut lock = cp.create_lock(&record("di-u1", "p1")).await.unwrap();

        lock.owner = "p2".to_string();
        let updated = cp.update_lock(&lock, 1).await.unwrap();
        assert_eq!(updated.version, 2);

        lock.owner = "p3".to_string();
        let err = cp.update_lock(&lock, 1).await.unwrap_err();
        assert!(err.is_conflict());

        let missing = record("di-u9", "p1");
        let err = cp.update_lock(&missing, 1).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_write_ignores_version() {
        let cp = control_plane().await;
        let mut lock = cp.create_lock(&record("di-u1", "p1")).await.unwrap();
        lock.owner = "p2".to_string();
        cp.update_lock(&lock, 1).await.unwrap();

        lock.owner.clear();
        let written = cp.write_lock(&lock).await.unwrap();
        assert_eq!(written.version, 3);
        assert!(!cp.get_lock("default", "di-u1").await.unwrap().unwrap().is_held());

        let err = cp.write_lock(&record("di-u9", "")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_namespaces_and_listing() {
        let cp = control_plane().await;
        cp.create_lock(&record("di-u2", "p1")).await.unwrap();
        cp.create_lock(&record("di-u1", "p1")).await.unwrap();
        let mut other = record("di-u3", "p1");
        other.namespace = "other".to_string();
        cp.create_lock(&other).await.unwrap();

        assert_eq!(
            cp.list_lock_namespaces().await.unwrap(),
            vec!["default".to_string(), "other".to_string()]
        );
        let names: Vec<String> = cp
            .list_locks("default")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["di-u1", "di-u2"]);

        cp.delete_lock("default", "di-u1").await.unwrap();
        assert!(cp.get_lock("default", "di-u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_process_liveness_follows_heartbeat() {
        let cp = control_plane()
            .await
            .with_stale_after(Duration::from_secs(60));

        assert!(!cp.process_exists("p1").await.unwrap());

        cp.register("p1").await.unwrap();
        assert!(cp.process_exists("p1").await.unwrap());

        let stale = Utc::now() - chrono::Duration::seconds(120);
        sqlx::query("UPDATE processes SET last_seen = ? WHERE process_id = ?")
            .bind(stale)
            .bind("p1")
            .execute(cp.pool())
            .await
            .unwrap();
        assert!(!cp.process_exists("p1").await.unwrap());

        cp.heartbeat("p1").await.unwrap();
        assert!(cp.process_exists("p1").await.unwrap());

        cp.deregister("p1").await.unwrap();
        assert!(!cp.process_exists("p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_ensure_parent_dir_ignores_memory_urls() {
        assert!(ensure_parent_dir("sqlite::memory:").is_ok());
        assert!(ensure_parent_dir("postgres://localhost/db").is_ok());
    }
}
