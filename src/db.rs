//! # Record Layer
//!
//! This module owns all SQL. It exposes the record-level operations the
//! rest of the crate is built on: `migrate`, `get`, `list`, `insert`,
//! `delete`, and `compact`.
//!
//! ## Architecture
//!
//! The single `rusqlite::Connection` is owned by a dedicated OS thread and
//! driven through an async channel, the "pool of 1" appropriate for a
//! single-writer backend:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Async Tasks                             │
//! │   strategy ops ── tokio::sync::mpsc ──► record requests     │
//! │   watch tasks  ──      (async send)                         │
//! └────────────────────────────┬────────────────────────────────┘
//!                              │
//!                              ▼
//!                  ┌───────────────────────┐
//!                  │  Dedicated OS Thread  │
//!                  │  ┌─────────────────┐  │
//!                  │  │   Connection    │  │
//!                  │  │   + Statements  │  │
//!                  │  └─────────────────┘  │
//!                  └───────────────────────┘
//! ```
//!
//! Every request runs inside its own transaction on that connection, so a
//! list call's data query and meta query observe one snapshot, and an
//! insert's pre-check `get` runs inside the insert transaction. Commit
//! order of inserts is id order.

use rusqlite::{params, Connection, TransactionBehavior};
use tokio::sync::{mpsc, oneshot};

use crate::error::{translate_insert_error, Error, Result};
use crate::statements::Statements;

/// Size of the request channel into the record-layer thread.
const REQUEST_CHANNEL_SIZE: usize = 64;

// =============================================================================
// Records
// =============================================================================

/// One row of the append-only log.
///
/// On insert, `id` must be zero (the database assigns it) and exactly one
/// of `created` / `previous_id` is set. On read, `created` reports whether
/// this row begins a lifetime (`previous_id` is absent).
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Record {
    pub id: i64,
    pub name: String,
    pub namespace: String,
    pub previous_id: Option<i64>,
    pub uid: String,
    pub created: bool,
    pub deleted: bool,
    pub value: String,
}

/// The `(max id, watermark)` pair observed by a list call, read in the
/// same snapshot as the rows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct TableMeta {
    /// Revision the list was served at; pinned to the requested revision
    /// for historical snapshot reads.
    pub list_id: i64,
    /// Compaction watermark for this kind.
    pub compaction_id: i64,
}

// =============================================================================
// Requests
// =============================================================================

enum DbRequest {
    Migrate {
        resp: oneshot::Sender<Result<()>>,
    },
    List {
        namespace: Option<String>,
        name: Option<String>,
        rev: i64,
        after: bool,
        cont: i64,
        limit: i64,
        resp: oneshot::Sender<Result<(TableMeta, Vec<Record>)>>,
    },
    Insert {
        rec: Record,
        resp: oneshot::Sender<Result<i64>>,
    },
    Delete {
        rec: Record,
        resp: oneshot::Sender<Result<i64>>,
    },
    Compact {
        resp: oneshot::Sender<Result<i64>>,
    },
    Shutdown,
    #[cfg(test)]
    Exec {
        sql: String,
        resp: oneshot::Sender<Result<usize>>,
    },
    #[cfg(test)]
    QueryI64 {
        sql: String,
        resp: oneshot::Sender<Result<i64>>,
    },
}

// =============================================================================
// Handle
// =============================================================================

/// Async handle to the record layer. Cheap to clone; all clones share the
/// same connection thread.
#[derive(Clone)]
pub(crate) struct Db {
    tx: mpsc::Sender<DbRequest>,
    kind: String,
}

impl Db {
    /// Takes ownership of a connection and spawns the record-layer thread
    /// for one log table.
    pub(crate) fn spawn(conn: Connection, kind: &str, table: &str) -> Result<Db> {
        let worker = Worker {
            conn,
            stmt: Statements::new(table, false),
            kind: kind.to_string(),
        };
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        std::thread::Builder::new()
            .name(format!("revstore-{table}"))
            .spawn(move || worker.run(rx))
            .map_err(|err| Error::Internal(format!("failed to spawn record thread: {err}")))?;
        Ok(Db {
            tx,
            kind: kind.to_string(),
        })
    }

    /// Object kind stored in this table, used for error construction.
    pub(crate) fn kind(&self) -> &str {
        &self.kind
    }

    /// Creates the log and compaction tables if they do not exist.
    pub(crate) async fn migrate(&self) -> Result<()> {
        self.request(|resp| DbRequest::Migrate { resp }).await
    }

    /// Returns the latest non-deleted row for `(namespace, name)`, where
    /// an empty namespace matches any. Implemented as a snapshot list of
    /// one row.
    pub(crate) async fn get(&self, namespace: &str, name: &str) -> Result<Record> {
        let namespace = (!namespace.is_empty()).then(|| namespace.to_string());
        let (_, mut records) = self
            .list(namespace, Some(name.to_string()), 0, false, 0, 1)
            .await?;
        if records.is_empty() {
            return Err(Error::not_found(&self.kind, name));
        }
        Ok(records.remove(0))
    }

    /// Lists rows and the table meta observed in the same snapshot.
    ///
    /// With `after` false this is a snapshot read: the latest revision of
    /// each `(name, namespace)` at `rev` (HEAD when 0), tombstones
    /// excluded, resuming past `cont` when paginating. With `after` true
    /// it is a tail read: every row with id above `rev`, tombstones
    /// included. A positive `limit` fetches one extra row so the caller
    /// can detect a further page.
    pub(crate) async fn list(
        &self,
        namespace: Option<String>,
        name: Option<String>,
        rev: i64,
        after: bool,
        cont: i64,
        limit: i64,
    ) -> Result<(TableMeta, Vec<Record>)> {
        self.request(|resp| DbRequest::List {
            namespace,
            name,
            rev,
            after,
            cont,
            limit,
            resp,
        })
        .await
    }

    /// Appends a revision and returns its id.
    pub(crate) async fn insert(&self, rec: Record) -> Result<i64> {
        self.request(|resp| DbRequest::Insert { rec, resp }).await
    }

    /// Appends a tombstone for `rec` and returns its id.
    pub(crate) async fn delete(&self, rec: Record) -> Result<i64> {
        self.request(|resp| DbRequest::Delete { rec, resp }).await
    }

    /// Runs one prune-and-advance compaction pass; returns rows deleted.
    pub(crate) async fn compact(&self) -> Result<i64> {
        self.request(|resp| DbRequest::Compact { resp }).await
    }

    /// Shuts the record-layer thread down. Requests already queued are
    /// still serviced; later requests fail.
    pub(crate) fn close(&self) {
        let _ = self.tx.try_send(DbRequest::Shutdown);
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> DbRequest,
    ) -> Result<T> {
        let (resp, rx) = oneshot::channel();
        self.tx
            .send(make(resp))
            .await
            .map_err(|_| Error::closed())?;
        rx.await.map_err(|_| Error::closed())?
    }

    #[cfg(test)]
    pub(crate) async fn exec(&self, sql: &str) -> Result<usize> {
        let sql = sql.to_string();
        self.request(|resp| DbRequest::Exec { sql, resp }).await
    }

    #[cfg(test)]
    pub(crate) async fn query_i64(&self, sql: &str) -> Result<i64> {
        let sql = sql.to_string();
        self.request(|resp| DbRequest::QueryI64 { sql, resp }).await
    }
}

// =============================================================================
// Worker
// =============================================================================

struct Worker {
    conn: Connection,
    stmt: Statements,
    kind: String,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::Receiver<DbRequest>) {
        while let Some(req) = rx.blocking_recv() {
            match req {
                DbRequest::Migrate { resp } => {
                    let _ = resp.send(self.migrate());
                }
                DbRequest::List {
                    namespace,
                    name,
                    rev,
                    after,
                    cont,
                    limit,
                    resp,
                } => {
                    let _ = resp.send(self.list(namespace, name, rev, after, cont, limit));
                }
                DbRequest::Insert { rec, resp } => {
                    let _ = resp.send(self.insert(rec));
                }
                DbRequest::Delete { rec, resp } => {
                    let _ = resp.send(self.delete(rec));
                }
                DbRequest::Compact { resp } => {
                    let _ = resp.send(self.compact());
                }
                DbRequest::Shutdown => break,
                #[cfg(test)]
                DbRequest::Exec { sql, resp } => {
                    let _ = resp.send(
                        self.conn
                            .execute(&sql, [])
                            .map_err(Error::Sqlite),
                    );
                }
                #[cfg(test)]
                DbRequest::QueryI64 { sql, resp } => {
                    let _ = resp.send(
                        self.conn
                            .query_row(&sql, [], |row| row.get(0))
                            .map_err(Error::Sqlite),
                    );
                }
            }
        }
    }

    fn migrate(&mut self) -> Result<()> {
        self.conn.execute_batch(self.stmt.migrate_sql())?;
        Ok(())
    }

    fn list(
        &mut self,
        namespace: Option<String>,
        name: Option<String>,
        rev: i64,
        after: bool,
        cont: i64,
        limit: i64,
    ) -> Result<(TableMeta, Vec<Record>)> {
        assert!(cont == 0 || rev > 0, "rev must be set when cont is set");
        assert!(!after || cont == 0, "cont must be zero when after is true");

        // One deferred transaction spans the data query and any fallback
        // meta query, so list id, watermark, and rows come from a single
        // snapshot.
        let tx = self.conn.transaction()?;
        let (mut meta, records) = Self::do_list(
            &tx,
            &self.stmt,
            namespace.as_deref(),
            name.as_deref(),
            rev,
            after,
            cont,
            limit,
        )?;

        if rev > 0 && !after {
            // Pin the snapshot to the revision the caller asked for.
            meta.list_id = rev;
        }

        if meta.list_id == 0 {
            // No rows were scanned, so no meta came back with them.
            meta = Self::table_meta(&tx, &self.stmt)?;
        }

        // A zero list id means the table is empty, and a zero rev means no
        // specific revision was requested; neither consults the watermark.
        // The watermark can sit above every live id after a tombstone is
        // compacted away, so this must not trip on plain HEAD reads.
        if rev != 0 && meta.list_id != 0 && meta.list_id < meta.compaction_id {
            return Err(Error::CompactionExpired {
                requested: meta.list_id,
                compacted: meta.compaction_id,
            });
        }

        tx.commit()?;
        Ok((meta, records))
    }

    #[allow(clippy::too_many_arguments)]
    fn do_list(
        conn: &Connection,
        stmt: &Statements,
        namespace: Option<&str>,
        name: Option<&str>,
        rev: i64,
        after: bool,
        cont: i64,
        limit: i64,
    ) -> Result<(TableMeta, Vec<Record>)> {
        let sql = if after {
            stmt.list_after_sql(limit)
        } else {
            stmt.list_sql(limit)
        };
        let mut prepared = conn.prepare(&sql)?;

        let mut rows = if after {
            prepared.query(params![namespace, name, rev])?
        } else {
            prepared.query(params![namespace, name, rev, cont])?
        };

        let mut meta = TableMeta::default();
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            meta.list_id = row.get(0)?;
            meta.compaction_id = row.get(1)?;
            records.push(Record {
                id: row.get(2)?,
                name: row.get(3)?,
                namespace: row.get(4)?,
                previous_id: row.get(5)?,
                uid: row.get(6)?,
                created: row.get(7)?,
                deleted: row.get(8)?,
                value: row.get(9)?,
            });
        }
        Ok((meta, records))
    }

    fn table_meta(conn: &Connection, stmt: &Statements) -> Result<TableMeta> {
        let meta = conn.query_row(stmt.table_meta_sql(), [], |row| {
            Ok(TableMeta {
                list_id: row.get(0)?,
                compaction_id: row.get(1)?,
            })
        })?;
        Ok(meta)
    }

    fn insert(&mut self, rec: Record) -> Result<i64> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = Self::do_insert(&tx, &self.stmt, &self.kind, rec)?;
        tx.commit()?;
        Ok(id)
    }

    /// Appends one row inside the caller's transaction.
    ///
    /// For updates, the current row is re-read in the same transaction and
    /// checked against the submitted previous id and uid before the insert
    /// touches the uniqueness constraints; creations go straight to the
    /// constraints.
    fn do_insert(conn: &Connection, stmt: &Statements, kind: &str, rec: Record) -> Result<i64> {
        if let Some(lock) = stmt.table_lock_sql() {
            conn.execute_batch(lock)?;
        }

        assert_eq!(rec.id, 0, "id must be zero on insert");
        assert!(
            !(rec.created && rec.previous_id.is_some()),
            "previous_id must be absent when created is set"
        );
        assert!(
            rec.created || rec.previous_id.is_some(),
            "previous_id must be set when created is not"
        );

        if !rec.created {
            match Self::get_in(conn, stmt, kind, &rec.namespace, &rec.name) {
                Err(err) if err.is_not_found() => {
                    return Err(Error::resource_version_mismatch(kind, &rec.name));
                }
                Err(err) => return Err(err),
                Ok(existing) => {
                    if Some(existing.id) != rec.previous_id {
                        return Err(Error::resource_version_mismatch(kind, &rec.name));
                    }
                    if existing.uid != rec.uid {
                        return Err(Error::UidMismatch {
                            name: rec.name.clone(),
                            stored: existing.uid,
                            submitted: rec.uid,
                        });
                    }
                    if !rec.deleted && existing.value == rec.value {
                        // Idempotent no-op update: nothing changed, keep
                        // the existing revision.
                        return Ok(existing.id);
                    }
                }
            }
        }

        let created = rec.created.then_some(1i64);
        let id = conn
            .query_row(
                stmt.insert_sql(),
                params![
                    rec.name,
                    rec.namespace,
                    rec.previous_id,
                    rec.uid,
                    created,
                    rec.deleted,
                    rec.value
                ],
                |row| row.get(0),
            )
            .map_err(|err| translate_insert_error(err, kind, &rec.name))?;
        Ok(id)
    }

    /// `get` against the caller's transaction, for the insert pre-check.
    fn get_in(
        conn: &Connection,
        stmt: &Statements,
        kind: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Record> {
        let namespace = (!namespace.is_empty()).then_some(namespace);
        let (_, mut records) = Self::do_list(conn, stmt, namespace, Some(name), 0, false, 0, 1)?;
        if records.is_empty() {
            return Err(Error::not_found(kind, name));
        }
        Ok(records.remove(0))
    }

    /// Delete is an insert of a tombstone, plus a fix-up that clears the
    /// stale creation marker so the name can be created again.
    fn delete(&mut self, mut rec: Record) -> Result<i64> {
        assert!(
            rec.previous_id.is_some(),
            "previous_id must be set on delete"
        );

        rec.created = false;
        rec.deleted = true;
        let (namespace, name) = (rec.namespace.clone(), rec.name.clone());

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = Self::do_insert(&tx, &self.stmt, &self.kind, rec)?;
        tx.execute(self.stmt.clear_created_sql(), params![namespace, name, id])?;
        tx.commit()?;
        Ok(id)
    }

    /// Prunes superseded rows in bounded batches, then advances the
    /// watermark. Each batch is its own transaction, so lock hold time
    /// stays bounded. A pass over a freshly populated table deletes
    /// nothing; the first pass moves the watermark and the next one
    /// prunes.
    fn compact(&mut self) -> Result<i64> {
        let mut deleted = 0i64;
        loop {
            let count = self.conn.execute(self.stmt.compact_sql(), [])? as i64;
            deleted += count;
            if count == 0 {
                break;
            }
        }
        self.conn.execute(self.stmt.update_compaction_sql(), [])?;
        Ok(deleted)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn created_rec(name: &str, namespace: &str, value: &str) -> Record {
        Record {
            name: name.to_string(),
            namespace: namespace.to_string(),
            created: true,
            value: value.to_string(),
            ..Record::default()
        }
    }

    fn update_rec(name: &str, namespace: &str, previous_id: i64, value: &str) -> Record {
        Record {
            name: name.to_string(),
            namespace: namespace.to_string(),
            previous_id: Some(previous_id),
            value: value.to_string(),
            ..Record::default()
        }
    }

    fn spawn_db() -> Db {
        let conn = Connection::open_in_memory().expect("open in-memory database");
        Db::spawn(conn, "TestKind", "recordstest").expect("spawn record layer")
    }

    /// Fresh table with three revisions of `default/test` (ids 1..3) and
    /// the compaction watermark at 1.
    async fn seeded_db() -> Db {
        let db = spawn_db();
        db.migrate().await.expect("migrate");

        let id = db
            .insert(created_rec("test", "default", "value1"))
            .await
            .expect("insert creation row");
        assert_eq!(id, 1);

        let id = db
            .insert(update_rec("test", "default", id, "value2"))
            .await
            .expect("insert first update");
        assert_eq!(id, 2);

        let id = db
            .insert(update_rec("test", "default", id, "value3"))
            .await
            .expect("insert second update");
        assert_eq!(id, 3);

        db.exec(
            "INSERT INTO compaction (name, id) VALUES ('recordstest', 1) \
             ON CONFLICT (name) DO UPDATE SET id = 1",
        )
        .await
        .expect("seed watermark");
        db
    }

    #[tokio::test]
    async fn test_migrate_is_idempotent() {
        let db = spawn_db();
        db.migrate().await.expect("first migrate");
        db.migrate().await.expect("second migrate");
    }

    #[tokio::test]
    async fn test_insert_and_created_reporting() {
        let db = seeded_db().await;

        // Snapshot at rev 1: just the creation row.
        let (_, records) = db.list(None, None, 1, false, 0, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].created);

        // Tail after rev 1: both update rows, neither a creation.
        let (_, records) = db.list(None, None, 1, true, 0, 0).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[0].created);
        assert!(!records[1].created);
    }

    #[tokio::test]
    async fn test_create_of_live_name_is_already_exists() {
        let db = seeded_db().await;
        let err = db
            .insert(created_rec("test", "default", "value1"))
            .await
            .expect_err("duplicate creation must fail");
        assert!(err.is_already_exists(), "got {err}");
    }

    #[tokio::test]
    async fn test_get_returns_latest_revision() {
        let db = seeded_db().await;
        let rec = db.get("default", "test").await.unwrap();
        assert_eq!(rec.name, "test");
        assert_eq!(rec.namespace, "default");
        assert_eq!(rec.id, 3);
        assert_eq!(rec.previous_id, Some(2));
        assert_eq!(rec.value, "value3");
    }

    #[tokio::test]
    async fn test_get_unknown_name_is_not_found() {
        let db = seeded_db().await;
        let err = db.get("default", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_namespace_filter_and_meta() {
        let db = seeded_db().await;

        let (meta, records) = db
            .list(Some("default".into()), None, 0, false, 0, 0)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(meta.list_id, 3);
        assert_eq!(meta.compaction_id, 1);

        // Meta still comes back when the filter matches nothing.
        let (meta, records) = db
            .list(Some("not_default".into()), None, 0, false, 0, 0)
            .await
            .unwrap();
        assert!(records.is_empty());
        assert_eq!(meta.list_id, 3);
        assert_eq!(meta.compaction_id, 1);

        let (meta, records) = db.list(None, None, 0, false, 0, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 3);
        assert_eq!(records[0].value, "value3");
        assert_eq!(meta.list_id, 3);
    }

    #[tokio::test]
    async fn test_list_at_historical_revision() {
        let db = seeded_db().await;
        let (meta, records) = db.list(None, None, 2, false, 0, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, 2);
        assert_eq!(records[0].value, "value2");
        assert_eq!(meta.list_id, 2, "list id pins to the requested revision");
        assert_eq!(meta.compaction_id, 1);
    }

    #[tokio::test]
    async fn test_list_after_is_ascending_and_keeps_meta() {
        let db = seeded_db().await;
        let (meta, records) = db
            .list(Some("default".into()), None, 1, true, 0, 0)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value, "value2");
        assert_eq!(records[1].value, "value3");
        assert_eq!(meta.list_id, 3);
        assert_eq!(meta.compaction_id, 1);
    }

    #[tokio::test]
    async fn test_list_limit_fetches_one_extra_row() {
        let db = seeded_db().await;
        db.insert(created_rec("other", "default", "v"))
            .await
            .unwrap();

        // Two matching objects, limit 1: the extra row signals more pages.
        let (_, records) = db
            .list(Some("default".into()), None, 0, false, 0, 1)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn test_compaction_expired() {
        let db = seeded_db().await;

        let (meta, _) = db.list(None, None, 0, false, 0, 0).await.unwrap();
        assert_eq!(meta.compaction_id, 1);

        db.exec("UPDATE compaction SET id = 3 WHERE name = 'recordstest'")
            .await
            .unwrap();

        // HEAD reads never consult the watermark.
        let (meta, records) = db.list(None, None, 0, false, 0, 0).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(meta.list_id, 3);
        assert_eq!(meta.compaction_id, 3);

        // A pinned revision below the watermark has been pruned away.
        let err = db.list(None, None, 2, false, 0, 0).await.unwrap_err();
        assert!(err.is_compaction_expired(), "got {err}");
    }

    #[tokio::test]
    async fn test_delete_and_recreate() {
        let db = seeded_db().await;

        let rec = db.get("default", "test").await.unwrap();
        let tombstone = Record {
            id: 0,
            previous_id: Some(rec.id),
            ..rec
        };
        let id = db.delete(tombstone).await.unwrap();
        assert_eq!(id, 4);

        // The object is gone from snapshot reads.
        let (_, records) = db
            .list(Some("default".into()), Some("test".into()), 0, false, 0, 0)
            .await
            .unwrap();
        assert!(records.is_empty());
        let err = db.get("default", "test").await.unwrap_err();
        assert!(err.is_not_found());

        // Historical snapshots still see it, and the creation row still
        // reads as created even though the fix-up cleared its marker.
        let (_, records) = db
            .list(
                Some("default".into()),
                Some("test".into()),
                id - 1,
                false,
                0,
                0,
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].created);

        let (_, records) = db
            .list(Some("default".into()), Some("test".into()), 1, false, 0, 0)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].created);

        // The tail sees the whole history including the tombstone.
        let (_, records) = db
            .list(Some("default".into()), Some("test".into()), 1, true, 0, 0)
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].value, "value2");
        assert!(!records[0].deleted);
        assert_eq!(records[1].value, "value3");
        assert!(!records[1].deleted);
        assert_eq!(records[2].value, "value3");
        assert!(records[2].deleted);

        // The name is free again; the new lifetime starts a fresh chain.
        let id = db
            .insert(created_rec("test", "default", "reborn"))
            .await
            .expect("re-create after tombstone");
        assert_eq!(id, 5);
    }

    #[tokio::test]
    async fn test_update_with_stale_previous_id_is_conflict() {
        let db = seeded_db().await;
        let err = db
            .insert(update_rec("test", "default", 1, "value"))
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "got {err}");
    }

    #[tokio::test]
    async fn test_update_of_missing_object_is_conflict() {
        let db = seeded_db().await;
        let err = db
            .insert(update_rec("missing", "default", 1, "value"))
            .await
            .unwrap_err();
        assert!(err.is_conflict(), "got {err}");
    }

    #[tokio::test]
    async fn test_update_with_wrong_uid_is_rejected() {
        let db = seeded_db().await;
        let err = db
            .insert(Record {
                uid: "uid".to_string(),
                ..update_rec("test", "default", 3, "value")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UidMismatch { .. }), "got {err}");
    }

    #[tokio::test]
    async fn test_identical_update_is_a_no_op() {
        let db = seeded_db().await;
        let id = db
            .insert(update_rec("test", "default", 3, "value3"))
            .await
            .unwrap();
        assert_eq!(id, 3, "unchanged value keeps the existing revision");

        let (_, records) = db.list(None, None, 0, true, 0, 0).await.unwrap();
        assert_eq!(records.len(), 3, "no row was appended");
    }

    #[tokio::test]
    async fn test_compaction_prunes_superseded_rows() {
        let db = seeded_db().await;

        let test2 = db.insert(created_rec("test2", "", "value1")).await.unwrap();
        let test3 = db.insert(created_rec("test3", "", "value1")).await.unwrap();
        db.insert(update_rec("test2", "", test2, "value2"))
            .await
            .unwrap();
        let test3 = db
            .insert(update_rec("test3", "", test3, "value2"))
            .await
            .unwrap();
        db.delete(Record {
            name: "test3".to_string(),
            previous_id: Some(test3),
            value: "value3".to_string(),
            ..Record::default()
        })
        .await
        .unwrap();

        let (_, records) = db.list(None, None, 1, true, 0, 0).await.unwrap();
        assert_eq!(records.len(), 7);

        // First pass: nothing below the stale watermark, but the
        // watermark advances.
        let deleted = db.compact().await.unwrap();
        assert_eq!(deleted, 0);

        // Second pass: every superseded row and the tombstone pair go.
        let deleted = db.compact().await.unwrap();
        assert_eq!(deleted, 6);

        let count = db
            .query_i64("SELECT COUNT(*) FROM recordstest")
            .await
            .unwrap();
        assert_eq!(count, 2, "only the live heads remain");

        let (_, records) = db.list(None, None, 8, false, 0, 0).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 3);
        assert_eq!(records[0].name, "test");
        assert_eq!(records[0].value, "value3");
        assert_eq!(records[1].id, 6);
        assert_eq!(records[1].name, "test2");
        assert_eq!(records[1].value, "value2");
    }

    #[tokio::test]
    async fn test_compaction_watermark_outlives_full_prune() {
        let db = spawn_db();
        db.migrate().await.unwrap();

        let id = db.insert(created_rec("gone", "", "v1")).await.unwrap();
        db.delete(Record {
            name: "gone".to_string(),
            previous_id: Some(id),
            value: "v1".to_string(),
            ..Record::default()
        })
        .await
        .unwrap();

        db.compact().await.unwrap();
        let deleted = db.compact().await.unwrap();
        assert_eq!(deleted, 2, "creation row and tombstone both pruned");

        // The watermark stays above every pruned id even though the table
        // is empty, and ids keep climbing for the next lifetime.
        let watermark = db
            .query_i64("SELECT id FROM compaction WHERE name = 'recordstest'")
            .await
            .unwrap();
        assert_eq!(watermark, 2);

        let id = db.insert(created_rec("gone", "", "v2")).await.unwrap();
        assert_eq!(id, 3, "ids are never reused");
    }

    #[tokio::test]
    async fn test_compaction_prunes_in_bounded_batches() {
        let db = spawn_db();
        db.migrate().await.unwrap();

        let mut id = db.insert(created_rec("bulk", "", "v0")).await.unwrap();
        for i in 1..=520 {
            id = db
                .insert(update_rec("bulk", "", id, &format!("v{i}")))
                .await
                .unwrap();
        }

        let deleted = db.compact().await.unwrap();
        assert_eq!(deleted, 0);

        // 520 superseded rows need two batches (500 + 20).
        let deleted = db.compact().await.unwrap();
        assert_eq!(deleted, 520);

        let count = db
            .query_i64("SELECT COUNT(*) FROM recordstest")
            .await
            .unwrap();
        assert_eq!(count, 1);

        let rec = db.get("", "bulk").await.unwrap();
        assert_eq!(rec.id, 521);
        assert_eq!(rec.value, "v520");
    }

    #[tokio::test]
    async fn test_requests_fail_after_close() {
        let db = seeded_db().await;
        db.close();
        let err = db.get("default", "test").await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
