//! # Domain Types for revstore
//!
//! This module defines the object seam between the store and its callers:
//! the [`Object`] trait, the shared [`ObjectMeta`] block, list options and
//! results, and watch events.
//!
//! The store treats the encoded object as an opaque JSON blob. The only
//! fields it reads or writes are the metadata fields exposed through
//! [`Object::meta`] / [`Object::meta_mut`]: name, namespace, uid,
//! generation, resourceVersion, deletionTimestamp, and finalizers.
//! Everything else round-trips untouched.
//!
//! ## Resource Versions
//!
//! A resource version is the decimal form of a log row id: strictly
//! monotonic within a kind, assigned by the database at insert. Stored
//! blobs always carry `"0"`; the real value is stamped on the way out.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Object Seam
// =============================================================================

/// The metadata block every stored object carries.
///
/// Field names follow the Kubernetes JSON conventions so objects encoded by
/// this store interoperate with ordinary API machinery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    /// Object name, unique within a namespace for the object's lifetime.
    pub name: String,

    /// Namespace; empty for cluster-scoped objects.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Logical identity of the object. Never changes across revisions;
    /// a re-created name may carry a new uid.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uid: String,

    /// Revision of this object, the log row id as a decimal string.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub resource_version: String,

    /// Spec generation; bumped by `update`, left alone by `update_status`.
    #[serde(skip_serializing_if = "is_zero")]
    pub generation: i64,

    /// Set when deletion has been requested. The object becomes a
    /// tombstone once its finalizers have drained.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,

    /// Finalizers that must be removed before the object can be deleted.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// Labels, exposed for caller-side selector predicates.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// A storable object: serializable, cloneable, and carrying an
/// [`ObjectMeta`].
pub trait Object:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Read access to the object's metadata.
    fn meta(&self) -> &ObjectMeta;

    /// Write access to the object's metadata.
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

// =============================================================================
// List Options and Results
// =============================================================================

/// Caller predicate deciding whether an object belongs in a list or watch
/// result. Selector evaluation lives outside the store; this callback is
/// the seam.
pub type Predicate<T> = Arc<dyn Fn(&T) -> Result<bool> + Send + Sync>;

/// Options accepted by [`list`](crate::strategy::Strategy::list) and
/// [`watch`](crate::strategy::Strategy::watch).
pub struct ListOptions<T> {
    /// Revision to read at. Empty means HEAD. `"0"` on a watch means "no
    /// resource version".
    pub resource_version: String,

    /// Match semantics for `resource_version`. Unsupported; any non-empty
    /// value is rejected with [`Error::InvalidArgument`].
    pub resource_version_match: String,

    /// Maximum number of matching items per page; 0 means unlimited.
    /// Rejected on watch.
    pub limit: i64,

    /// Continue token from a previous page, `"<snapshot-rv>:<last-id>"`.
    /// Rejected on watch.
    pub continue_token: String,

    /// Filter applied to each decoded object; `None` matches everything.
    pub predicate: Option<Predicate<T>>,

    /// Emit a `Bookmark` event every minute while a watch is idle.
    pub progress_notify: bool,
}

impl<T> Default for ListOptions<T> {
    fn default() -> Self {
        Self {
            resource_version: String::new(),
            resource_version_match: String::new(),
            limit: 0,
            continue_token: String::new(),
            predicate: None,
            progress_notify: false,
        }
    }
}

impl<T> Clone for ListOptions<T> {
    fn clone(&self) -> Self {
        Self {
            resource_version: self.resource_version.clone(),
            resource_version_match: self.resource_version_match.clone(),
            limit: self.limit,
            continue_token: self.continue_token.clone(),
            predicate: self.predicate.clone(),
            progress_notify: self.progress_notify,
        }
    }
}

impl<T> fmt::Debug for ListOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListOptions")
            .field("resource_version", &self.resource_version)
            .field("resource_version_match", &self.resource_version_match)
            .field("limit", &self.limit)
            .field("continue_token", &self.continue_token)
            .field("predicate", &self.predicate.as_ref().map(|_| "<fn>"))
            .field("progress_notify", &self.progress_notify)
            .finish()
    }
}

/// One page of list results.
#[derive(Debug, Clone, Default)]
pub struct ObjectList<T> {
    /// Matching objects, ascending by resource version.
    pub items: Vec<T>,

    /// Snapshot revision this page was read at. Identical across all pages
    /// of one paginated list.
    pub resource_version: String,

    /// Token for the next page; empty when there are no more matches.
    pub continue_token: String,
}

// =============================================================================
// Watch Events
// =============================================================================

/// A single event on a watch stream.
#[derive(Debug)]
pub enum WatchEvent<T> {
    /// A creation row: the object's first revision in this lifetime.
    Added(T),

    /// An update row.
    Modified(T),

    /// A tombstone row; carries the final state of the object.
    Deleted(T),

    /// Idle progress marker, only emitted with
    /// [`progress_notify`](ListOptions::progress_notify). Carries no object.
    Bookmark,

    /// The stream failed; this is the last event before the stream closes.
    Error(Error),
}

impl<T> WatchEvent<T> {
    /// The decoded object, if this event kind carries one.
    pub fn object(&self) -> Option<&T> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                Some(obj)
            }
            WatchEvent::Bookmark | WatchEvent::Error(_) => None,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
