//! # Strategy
//!
//! The object-level contract over the record layer: `create / get /
//! update / update_status / delete / list / watch / destroy`. The
//! strategy owns encoding and the rules that define what an object is;
//! the record layer underneath only sees opaque value blobs and the
//! metadata columns.
//!
//! ## Watch
//!
//! Each watch call spawns one task that drains a tail iterator, emits
//! events, and parks until something might have changed:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  drain tail iterator ──► emit Added/Modified/Deleted              │
//! │        │                                                          │
//! │        ▼ (iterator dry)                                           │
//! │  reopen tail at cursor ──► new revision? ──► drain again          │
//! │        │ no                                                       │
//! │        ▼                                                          │
//! │  park: consumer gone | bookmark tick | broadcast | 2 s fallback   │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The in-process broadcast keeps latency low for local writers; the 2 s
//! fallback poll picks up writes from other processes and any missed
//! signal. Both mechanisms are load-bearing.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval_at, Instant, Interval};

use crate::db::{Db, Record};
use crate::error::{Error, Result};
use crate::listiter::{parse_continue_token, parse_resource_version, ListIter};
use crate::types::{ListOptions, Object, ObjectList, Predicate, WatchEvent};

/// How often the background task prunes superseded revisions.
const COMPACTION_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Fallback poll interval for parked watchers. Rescues missed broadcast
/// signals and picks up writers in other processes.
const WATCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Bookmark cadence when `progress_notify` is set.
const BOOKMARK_INTERVAL: Duration = Duration::from_secs(60);

/// Capacity of each watcher's event channel.
const WATCH_CHANNEL_SIZE: usize = 64;

// =============================================================================
// Strategy
// =============================================================================

/// Object-level store for one kind. Cheap to clone; clones share the
/// record layer, broadcast, and compaction task.
#[derive(Clone)]
pub struct Strategy<T> {
    db: Db,
    broadcast: Arc<Notify>,
    shutdown: Arc<Notify>,
    destroyed: Arc<AtomicBool>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Object> Strategy<T> {
    /// Migrates the table and starts the periodic compaction task.
    pub(crate) async fn new(db: Db) -> Result<Self> {
        db.migrate().await?;
        let strategy = Strategy {
            db,
            broadcast: Arc::new(Notify::new()),
            shutdown: Arc::new(Notify::new()),
            destroyed: Arc::new(AtomicBool::new(false)),
            _marker: PhantomData,
        };
        strategy.spawn_compaction();
        Ok(strategy)
    }

    /// Stores a new object. The object must carry a uid; its generation
    /// is reset to 1 and the returned copy carries the assigned resource
    /// version.
    pub async fn create(&self, obj: &T) -> Result<T> {
        if obj.meta().uid.is_empty() {
            return Err(Error::InvalidArgument("object must have a uid".to_string()));
        }

        let mut obj = obj.clone();
        obj.meta_mut().generation = 1;
        let value = encode(&mut obj)?;

        let meta = obj.meta();
        let id = self
            .db
            .insert(Record {
                name: meta.name.clone(),
                namespace: meta.namespace.clone(),
                uid: meta.uid.clone(),
                created: true,
                value,
                ..Record::default()
            })
            .await?;

        obj.meta_mut().resource_version = id.to_string();
        self.broadcast_change();
        Ok(obj)
    }

    /// Fetches the latest revision of `(namespace, name)`.
    pub async fn get(&self, namespace: &str, name: &str) -> Result<T> {
        let rec = self.db.get(namespace, name).await?;
        decode(&rec)
    }

    /// Stores a new revision of an object, bumping its generation. The
    /// submitted resource version is the optimistic-concurrency token.
    pub async fn update(&self, obj: &T) -> Result<T> {
        let result = self.do_update(obj, true).await?;
        self.broadcast_change();
        Ok(result)
    }

    /// As [`update`](Strategy::update), but the generation is unchanged.
    pub async fn update_status(&self, obj: &T) -> Result<T> {
        let result = self.do_update(obj, false).await?;
        self.broadcast_change();
        Ok(result)
    }

    /// Requests deletion. Stamps the deletion timestamp if it is unset;
    /// the object becomes a tombstone once its finalizers are empty,
    /// otherwise the timestamped object is stored as a regular revision.
    pub async fn delete(&self, obj: &T) -> Result<T> {
        let mut obj = obj.clone();
        if obj.meta().deletion_timestamp.is_none() {
            obj.meta_mut().deletion_timestamp = Some(Utc::now());
        }
        let result = self.do_update(&obj, false).await?;
        self.broadcast_change();
        Ok(result)
    }

    async fn do_update(&self, obj: &T, update_generation: bool) -> Result<T> {
        let previous_id = parse_resource_version(&obj.meta().resource_version)?;

        let mut obj = obj.clone();
        if update_generation {
            obj.meta_mut().generation += 1;
        }
        let value = encode(&mut obj)?;

        let meta = obj.meta();
        let rec = Record {
            name: meta.name.clone(),
            namespace: meta.namespace.clone(),
            previous_id: Some(previous_id),
            uid: meta.uid.clone(),
            value,
            ..Record::default()
        };

        // Deletion happens through the update path: once the finalizers
        // have drained, the stored revision is a tombstone.
        let id = if meta.deletion_timestamp.is_some() && meta.finalizers.is_empty() {
            self.db.delete(rec).await?
        } else {
            self.db.insert(rec).await?
        };

        obj.meta_mut().resource_version = id.to_string();
        Ok(obj)
    }

    /// Lists objects at a snapshot revision, with predicate filtering and
    /// continue-token pagination.
    pub async fn list(&self, namespace: &str, opts: ListOptions<T>) -> Result<ObjectList<T>> {
        validate_options(&opts)?;

        let mut rev = parse_resource_version(&opts.resource_version)?;
        let mut cont = 0;
        if !opts.continue_token.is_empty() {
            // The token pins the snapshot; later pages ignore any
            // resource version supplied alongside it.
            let (token_rev, last_id) = parse_continue_token(&opts.continue_token)?;
            rev = token_rev;
            cont = last_id;
        }

        let (list_rev, mut iter) = ListIter::open(
            self.db.clone(),
            namespace_filter(namespace),
            rev,
            cont,
            opts.limit,
            false,
        )
        .await?;

        let mut items: Vec<T> = Vec::new();
        let mut continue_token = String::new();
        let mut last_item_id = 0i64;
        while let Some(item) = iter.next().await {
            let rec = item?;
            let obj = decode(&rec)?;
            if !matches(&opts.predicate, &obj)? {
                continue;
            }
            // The page closes on the next match past the limit, so a
            // trailing non-match never mints a token to an empty page.
            if opts.limit > 0 && items.len() >= opts.limit as usize {
                continue_token = format!("{list_rev}:{last_item_id}");
                break;
            }
            last_item_id = rec.id;
            items.push(obj);
        }

        Ok(ObjectList {
            items,
            resource_version: list_rev.to_string(),
            continue_token,
        })
    }

    /// Opens a watch. With no resource version the stream begins with a
    /// snapshot of every live object; with one it begins right after that
    /// revision. Events arrive strictly in id order. The stream ends when
    /// the [`Watcher`] is dropped or an error event is emitted.
    pub async fn watch(&self, namespace: &str, opts: ListOptions<T>) -> Result<Watcher<T>> {
        validate_options(&opts)?;
        if !opts.continue_token.is_empty() {
            return Err(Error::InvalidArgument(
                "continue is not supported in watch".to_string(),
            ));
        }
        if opts.limit != 0 {
            return Err(Error::InvalidArgument(
                "limit is not supported in watch".to_string(),
            ));
        }

        let mut rv = opts.resource_version.clone();
        if rv == "0" {
            // Revision zero means "no particular revision"; serve the
            // historical snapshot.
            rv.clear();
        }

        // With a revision the historical snapshot is skipped and the
        // stream starts in tail mode directly at that revision.
        let after = !rv.is_empty();
        let rev = parse_resource_version(&rv)?;
        let namespace = namespace_filter(namespace);
        let (list_rev, iter) =
            ListIter::open(self.db.clone(), namespace.clone(), rev, 0, 0, after).await?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        tokio::spawn(stream_watch(
            self.db.clone(),
            namespace,
            opts.predicate,
            opts.progress_notify,
            self.broadcast.clone(),
            list_rev,
            iter,
            tx,
        ));
        Ok(Watcher { rx })
    }

    /// Stops the compaction task and shuts the record layer down.
    /// Operations issued afterwards fail.
    pub fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            tracing::debug!(kind = self.db.kind(), "destroying store");
            self.shutdown.notify_one();
            self.db.close();
        }
    }

    /// Wakes every parked watcher. Best-effort: a watcher that misses the
    /// signal is rescued by its fallback poll.
    fn broadcast_change(&self) {
        self.broadcast.notify_waiters();
    }

    fn spawn_compaction(&self) {
        let db = self.db.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(
                Instant::now() + COMPACTION_INTERVAL,
                COMPACTION_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = shutdown.notified() => return,
                    _ = ticker.tick() => match db.compact().await {
                        Err(err) => {
                            tracing::error!(kind = db.kind(), error = %err, "compaction failed");
                        }
                        Ok(count) if count > 0 => {
                            tracing::info!(kind = db.kind(), records = count, "compacted");
                        }
                        Ok(_) => {}
                    },
                }
            }
        });
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn namespace_filter(namespace: &str) -> Option<String> {
    (!namespace.is_empty()).then(|| namespace.to_string())
}

fn validate_options<T>(opts: &ListOptions<T>) -> Result<()> {
    if !opts.resource_version_match.is_empty() {
        return Err(Error::InvalidArgument(
            "resource version match is not supported".to_string(),
        ));
    }
    Ok(())
}

fn matches<T>(predicate: &Option<Predicate<T>>, obj: &T) -> Result<bool> {
    match predicate {
        Some(predicate) => predicate(obj),
        None => Ok(true),
    }
}

/// Serializes an object for storage. Stored blobs never carry a real
/// resource version; it is forced to `"0"` so identical updates compare
/// equal byte for byte.
fn encode<T: Object>(obj: &mut T) -> Result<String> {
    obj.meta_mut().resource_version = "0".to_string();
    Ok(serde_json::to_string(obj)?)
}

/// Decodes a record and stamps its id as the resource version.
fn decode<T: Object>(rec: &Record) -> Result<T> {
    let mut obj: T = serde_json::from_str(&rec.value)?;
    obj.meta_mut().resource_version = rec.id.to_string();
    Ok(obj)
}

// =============================================================================
// Watch
// =============================================================================

/// Consumer handle for a watch stream. Dropping it ends the watch task.
pub struct Watcher<T> {
    rx: mpsc::Receiver<WatchEvent<T>>,
}

impl<T> Watcher<T> {
    /// Receives the next event; `None` when the stream has ended.
    pub async fn next(&mut self) -> Option<WatchEvent<T>> {
        self.rx.recv().await
    }
}

impl<T> std::fmt::Debug for Watcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher").finish()
    }
}

/// One watch task: drain, re-poll, park, repeat.
#[allow(clippy::too_many_arguments)]
async fn stream_watch<T: Object>(
    db: Db,
    namespace: Option<String>,
    predicate: Option<Predicate<T>>,
    progress_notify: bool,
    broadcast: Arc<Notify>,
    mut rv: i64,
    mut iter: ListIter,
    tx: mpsc::Sender<WatchEvent<T>>,
) {
    let mut bookmarks: Option<Interval> = progress_notify
        .then(|| interval_at(Instant::now() + BOOKMARK_INTERVAL, BOOKMARK_INTERVAL));

    loop {
        while let Some(item) = iter.next().await {
            let rec = match item {
                Ok(rec) => rec,
                Err(err) => {
                    let _ = tx.send(WatchEvent::Error(err)).await;
                    return;
                }
            };

            let mut obj: T = match serde_json::from_str(&rec.value) {
                Ok(obj) => obj,
                Err(err) => {
                    let _ = tx.send(WatchEvent::Error(Error::Encoding(err))).await;
                    return;
                }
            };
            obj.meta_mut().resource_version = rec.id.to_string();

            match matches(&predicate, &obj) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(err) => {
                    let _ = tx.send(WatchEvent::Error(err)).await;
                    return;
                }
            }

            let event = if rec.deleted {
                WatchEvent::Deleted(obj)
            } else if rec.created {
                WatchEvent::Added(obj)
            } else {
                WatchEvent::Modified(obj)
            };
            if tx.send(event).await.is_err() {
                // Consumer dropped the watcher.
                return;
            }
        }

        // The iterator ran dry; reopen the tail at the cursor. The tail
        // never emits past the revision it reports, so advancing the
        // cursor to that revision afterwards cannot skip events.
        let (new_rv, new_iter) =
            match ListIter::open(db.clone(), namespace.clone(), rv, 0, 0, true).await {
                Ok(opened) => opened,
                Err(err) => {
                    let _ = tx.send(WatchEvent::Error(err)).await;
                    return;
                }
            };
        iter = new_iter;

        if new_rv == rv {
            // Nothing new; park until a write lands, the consumer leaves,
            // a bookmark is due, or the fallback poll fires.
            tokio::select! {
                _ = tx.closed() => return,
                _ = tick_opt(&mut bookmarks) => {
                    if tx.send(WatchEvent::Bookmark).await.is_err() {
                        return;
                    }
                }
                _ = broadcast.notified() => {}
                _ = tokio::time::sleep(WATCH_POLL_INTERVAL) => {}
            }
        }

        rv = new_rv;
    }
}

/// Ticks the bookmark interval, or never completes when bookmarks are off.
async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}
