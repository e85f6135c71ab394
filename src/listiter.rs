//! # List Iterator
//!
//! A restartable, paginating iterator over [`Db::list`]. One iterator
//! represents one snapshot: the revision of its first page is pinned and
//! every later page re-enters the record layer at that same revision with
//! the last emitted id as the cursor, so pagination and the watch re-poll
//! share a single code path.

use crate::db::{Db, Record};
use crate::error::{Error, Result};

// =============================================================================
// Cursor Parsing
// =============================================================================

/// Parses a resource version string; empty means 0 (HEAD).
pub(crate) fn parse_resource_version(rv: &str) -> Result<i64> {
    if rv.is_empty() {
        return Ok(0);
    }
    rv.parse::<i64>()
        .map_err(|err| Error::InvalidArgument(format!("invalid resource version {rv:?}: {err}")))
}

/// Parses a continue token of the form `"<snapshot-rv>:<last-id>"`.
pub(crate) fn parse_continue_token(token: &str) -> Result<(i64, i64)> {
    let parse = |part: &str| {
        part.parse::<i64>()
            .map_err(|err| Error::InvalidArgument(format!("invalid continue token {token:?}: {err}")))
    };
    match token.split_once(':') {
        Some((rev, last)) => {
            let (rev, last) = (parse(rev)?, parse(last)?);
            if rev <= 0 || last <= 0 {
                return Err(Error::InvalidArgument(format!(
                    "invalid continue token {token:?}: revision and id must be positive"
                )));
            }
            Ok((rev, last))
        }
        None => Err(Error::InvalidArgument(format!(
            "invalid continue token {token:?}: expected \"<revision>:<id>\""
        ))),
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Lazily yields records for one snapshot or tail read.
pub(crate) struct ListIter {
    db: Db,
    namespace: Option<String>,
    /// Snapshot revision of the first page; every refetch pins to it.
    rev: i64,
    limit: i64,
    batch: std::vec::IntoIter<Record>,
    /// Length of the last fetched batch, including the extra row that
    /// signals a further page.
    batch_len: usize,
    last_id: i64,
    done: bool,
}

impl ListIter {
    /// Runs the first page eagerly and returns the snapshot revision it
    /// was served at along with the iterator.
    ///
    /// `after` selects tail mode (everything past `rev`, ascending,
    /// tombstones included); snapshot mode otherwise. `cont` resumes a
    /// paginated snapshot past an id.
    pub(crate) async fn open(
        db: Db,
        namespace: Option<String>,
        rev: i64,
        cont: i64,
        limit: i64,
        after: bool,
    ) -> Result<(i64, ListIter)> {
        let (meta, records) = db
            .list(namespace.clone(), None, rev, after, cont, limit)
            .await?;
        let batch_len = records.len();
        let last_id = records.last().map_or(cont, |rec| rec.id);
        Ok((
            meta.list_id,
            ListIter {
                db,
                namespace,
                rev: meta.list_id,
                limit,
                batch: records.into_iter(),
                batch_len,
                last_id,
                done: false,
            },
        ))
    }

    /// Yields the next record, fetching the next page of the snapshot
    /// when the current batch runs out.
    pub(crate) async fn next(&mut self) -> Option<Result<Record>> {
        loop {
            if let Some(rec) = self.batch.next() {
                self.last_id = rec.id;
                return Some(Ok(rec));
            }
            if self.done {
                return None;
            }

            // Without a limit the first page held everything; with one,
            // a batch no larger than the limit means the extra row was
            // absent and the snapshot is exhausted.
            if self.limit == 0 || self.batch_len <= self.limit as usize {
                self.done = true;
                return None;
            }

            match self
                .db
                .list(
                    self.namespace.clone(),
                    None,
                    self.rev,
                    false,
                    self.last_id,
                    self.limit,
                )
                .await
            {
                Ok((_, records)) => {
                    self.batch_len = records.len();
                    self.batch = records.into_iter();
                    if self.batch_len == 0 {
                        self.done = true;
                        return None;
                    }
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
