//! # SQL Statements
//!
//! Every SQL string the record layer executes lives here, keyed by
//! operation, with the log table name substituted at construction time.
//! The templates use `placeholder` where the table name goes; the shared
//! `compaction` table keeps its literal name.
//!
//! Dialect-specific pieces are confined to this module: boolean columns are
//! small integers, and the in-transaction table lock used to serialise id
//! allocation on server backends is absent on single-writer SQLite.

// =============================================================================
// Templates
// =============================================================================

/// DDL for the per-kind log table and the shared compaction table.
///
/// - `id` is the resource version: `AUTOINCREMENT` keeps it strictly
///   monotonic and never reused, even after compaction empties the table.
/// - `previous_id UNIQUE` is the single enforcement point for optimistic
///   concurrency: any revision can be superseded at most once.
/// - `UNIQUE (name, namespace, created)` allows one creation row per live
///   name; `created` is NULL on every other row, and NULLs do not collide.
const MIGRATE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "placeholder" (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    namespace   TEXT NOT NULL,
    previous_id INTEGER UNIQUE,
    uid         TEXT NOT NULL,
    created     INTEGER,
    deleted     INTEGER NOT NULL DEFAULT 0,
    value       TEXT NOT NULL,
    UNIQUE (name, namespace, created)
);
CREATE INDEX IF NOT EXISTS placeholder_namespace_name_idx
    ON "placeholder" (namespace, name, id);
CREATE TABLE IF NOT EXISTS compaction (
    name TEXT PRIMARY KEY,
    id   INTEGER NOT NULL
);
"#;

/// Appends a new revision and returns its id.
///
/// `created` reports as `previous_id IS NULL` on the read side; the stored
/// column exists only to back the uniqueness constraint.
const INSERT_SQL: &str = r#"
INSERT INTO "placeholder" (name, namespace, previous_id, uid, created, deleted, value)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
RETURNING id
"#;

/// Snapshot list: the latest revision of each `(name, namespace)` at or
/// below the requested revision, tombstones excluded, ascending by id.
///
/// Parameters: namespace filter (NULL = all), name filter (NULL = all),
/// revision ceiling (0 = HEAD), pagination cursor (0 = first page). The
/// first two result columns are the table max id and the compaction
/// watermark, read inside the same statement so every row reports the same
/// pair.
const LIST_SQL: &str = r#"
SELECT (SELECT COALESCE(MAX(id), 0) FROM "placeholder"),
       COALESCE((SELECT id FROM compaction WHERE name = 'placeholder'), 0),
       id, name, namespace, previous_id, uid, previous_id IS NULL, deleted, value
FROM (
    SELECT id, name, namespace, previous_id, uid, deleted, value,
           ROW_NUMBER() OVER (PARTITION BY name, namespace ORDER BY id DESC) AS rn
    FROM "placeholder"
    WHERE (?1 IS NULL OR namespace = ?1)
      AND (?2 IS NULL OR name = ?2)
      AND (?3 = 0 OR id <= ?3)
)
WHERE rn = 1
  AND deleted = 0
  AND (?4 = 0 OR id > ?4)
ORDER BY id
"#;

/// Tail list: every row with id above the cursor, ascending, tombstones
/// included. Feeds the watch loop.
///
/// Parameters: namespace filter, name filter, cursor revision.
const LIST_AFTER_SQL: &str = r#"
SELECT (SELECT COALESCE(MAX(id), 0) FROM "placeholder"),
       COALESCE((SELECT id FROM compaction WHERE name = 'placeholder'), 0),
       id, name, namespace, previous_id, uid, previous_id IS NULL, deleted, value
FROM "placeholder"
WHERE (?1 IS NULL OR namespace = ?1)
  AND (?2 IS NULL OR name = ?2)
  AND id > ?3
ORDER BY id
"#;

/// The `(max id, watermark)` pair on its own, for list calls that matched
/// no rows.
const TABLE_META_SQL: &str = r#"
SELECT COALESCE((SELECT MAX(id) FROM "placeholder"), 0),
       COALESCE((SELECT id FROM compaction WHERE name = 'placeholder'), 0)
"#;

/// Clears stale creation markers below a tombstone so the name can be
/// re-created. Parameters: namespace, name, tombstone id.
const CLEAR_CREATED_SQL: &str = r#"
UPDATE "placeholder" SET created = NULL
WHERE namespace = ?1 AND name = ?2 AND id < ?3 AND created IS NOT NULL
"#;

/// One bounded prune batch. Deletes rows that have been superseded by a
/// row at or below the watermark, and tombstones the watermark has passed.
/// The 500-row bound keeps lock hold time and WAL growth small; the caller
/// repeats until a batch deletes nothing.
const COMPACT_SQL: &str = r#"
DELETE FROM "placeholder" WHERE id IN (
    SELECT prev.id
    FROM "placeholder" prev
    JOIN "placeholder" cur
      ON prev.id = cur.previous_id
      OR (prev.id = cur.id AND cur.deleted != 0)
    WHERE cur.id <= COALESCE((SELECT id FROM compaction WHERE name = 'placeholder'), 0)
    LIMIT 500
)
"#;

/// Advances the watermark to the table's max id (at least 1), after
/// pruning. `MAX(excluded.id, compaction.id)` keeps the watermark
/// monotonic when a fully pruned tombstone left it above the max id.
const UPDATE_COMPACTION_SQL: &str = r#"
INSERT INTO compaction (name, id)
VALUES ('placeholder', (SELECT COALESCE(MAX(id), 1) FROM "placeholder"))
ON CONFLICT (name) DO UPDATE SET id = MAX(excluded.id, compaction.id)
"#;

// =============================================================================
// Statements
// =============================================================================

/// The statement set for one log table.
#[derive(Debug, Clone)]
pub(crate) struct Statements {
    migrate: String,
    insert: String,
    list: String,
    list_after: String,
    table_meta: String,
    clear_created: String,
    compact: String,
    update_compaction: String,
    table_lock: Option<String>,
}

impl Statements {
    /// Builds the statement set for `table`.
    ///
    /// `lock` selects the in-transaction table lock used to serialise id
    /// allocation on backends with a real connection pool. SQLite is
    /// single-writer, so no lock statement exists and the hook resolves to
    /// `None` either way.
    ///
    /// # Panics
    ///
    /// Panics if `table` is not a plain lowercase SQL identifier; table
    /// names are substituted into SQL text and never come from users.
    pub(crate) fn new(table: &str, lock: bool) -> Self {
        assert!(
            !table.is_empty()
                && table
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'),
            "invalid table name {table:?}"
        );
        let _ = lock;
        Self {
            migrate: substitute(MIGRATE_SQL, table),
            insert: substitute(INSERT_SQL, table),
            list: substitute(LIST_SQL, table),
            list_after: substitute(LIST_AFTER_SQL, table),
            table_meta: substitute(TABLE_META_SQL, table),
            clear_created: substitute(CLEAR_CREATED_SQL, table),
            compact: substitute(COMPACT_SQL, table),
            update_compaction: substitute(UPDATE_COMPACTION_SQL, table),
            table_lock: None,
        }
    }

    pub(crate) fn migrate_sql(&self) -> &str {
        &self.migrate
    }

    pub(crate) fn insert_sql(&self) -> &str {
        &self.insert
    }

    pub(crate) fn table_meta_sql(&self) -> &str {
        &self.table_meta
    }

    pub(crate) fn clear_created_sql(&self) -> &str {
        &self.clear_created
    }

    pub(crate) fn compact_sql(&self) -> &str {
        &self.compact
    }

    pub(crate) fn update_compaction_sql(&self) -> &str {
        &self.update_compaction
    }

    pub(crate) fn table_lock_sql(&self) -> Option<&str> {
        self.table_lock.as_deref()
    }

    /// Snapshot list, fetching one row past `limit` so the caller can tell
    /// whether another page exists. `limit` of 0 fetches everything.
    pub(crate) fn list_sql(&self, limit: i64) -> String {
        with_limit(&self.list, limit)
    }

    /// Tail list with the same one-extra-row limit handling.
    pub(crate) fn list_after_sql(&self, limit: i64) -> String {
        with_limit(&self.list_after, limit)
    }
}

fn substitute(template: &str, table: &str) -> String {
    template
        .replace("'placeholder'", &format!("'{table}'"))
        .replace("\"placeholder\"", &format!("\"{table}\""))
        .replace("placeholder_", &format!("{table}_"))
        .trim()
        .to_string()
}

fn with_limit(sql: &str, limit: i64) -> String {
    if limit > 0 {
        format!("{sql} LIMIT {}", limit + 1)
    } else {
        sql.to_string()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_substitution() {
        let stmt = Statements::new("widgets", false);
        assert!(stmt.insert_sql().contains("INSERT INTO \"widgets\""));
        assert!(stmt.migrate_sql().contains("widgets_namespace_name_idx"));
        assert!(stmt
            .update_compaction_sql()
            .contains("VALUES ('widgets',"));
        assert!(!stmt.list_sql(0).contains("placeholder"));
    }

    #[test]
    fn test_compaction_table_name_is_literal() {
        let stmt = Statements::new("widgets", false);
        assert!(stmt.table_meta_sql().contains("FROM compaction"));
        assert!(stmt.compact_sql().contains("FROM compaction"));
    }

    #[test]
    fn test_limit_fetches_one_extra_row() {
        let stmt = Statements::new("widgets", false);
        assert!(stmt.list_sql(1).ends_with("LIMIT 2"));
        assert!(stmt.list_after_sql(10).ends_with("LIMIT 11"));
        assert!(!stmt.list_sql(0).contains("LIMIT"));
    }

    #[test]
    fn test_sqlite_has_no_table_lock() {
        assert!(Statements::new("widgets", false).table_lock_sql().is_none());
        assert!(Statements::new("widgets", true).table_lock_sql().is_none());
    }

    #[test]
    #[should_panic(expected = "invalid table name")]
    fn test_rejects_non_identifier_table_names() {
        Statements::new("widgets\"; DROP TABLE widgets; --", false);
    }
}
