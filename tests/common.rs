#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use revstore::{Factory, Object, ObjectMeta, Predicate, Strategy, WatchEvent, Watcher};

/// A minimal object kind for store tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestKind {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

impl Object for TestKind {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// `testname<n>` in `testnamespace<n>` with uid `testuid<n>`, label
/// `test=<n>`, and value `testvalue<n>`.
pub fn test_object(n: usize) -> TestKind {
    TestKind {
        metadata: ObjectMeta {
            name: format!("testname{n}"),
            namespace: format!("testnamespace{n}"),
            uid: format!("testuid{n}"),
            labels: BTreeMap::from([("test".to_string(), n.to_string())]),
            ..Default::default()
        },
        value: format!("testvalue{n}"),
    }
}

/// A fresh in-memory store seeded with `test_object(1..=3)`, which land
/// at resource versions 1..=3.
pub async fn seeded_strategy() -> Strategy<TestKind> {
    let factory = Factory::open_in_memory().expect("open in-memory factory");
    let strategy = factory
        .strategy::<TestKind>("TestKind")
        .await
        .expect("build strategy");
    for n in 1..=3 {
        strategy
            .create(&test_object(n))
            .await
            .expect("create seed object");
    }
    strategy
}

/// Predicate matching objects whose `key` label equals `value`.
pub fn label_selector(key: &str, value: &str) -> Predicate<TestKind> {
    let key = key.to_string();
    let value = value.to_string();
    Arc::new(move |obj: &TestKind| Ok(obj.metadata.labels.get(&key) == Some(&value)))
}

/// Receives the next watch event, failing the test after five seconds.
pub async fn expect_event(watcher: &mut Watcher<TestKind>) -> WatchEvent<TestKind> {
    tokio::time::timeout(Duration::from_secs(5), watcher.next())
        .await
        .expect("timed out waiting for watch event")
        .expect("watch stream ended unexpectedly")
}

/// Asserts that no event arrives within `wait`.
pub async fn expect_no_event(watcher: &mut Watcher<TestKind>, wait: Duration) {
    if let Ok(event) = tokio::time::timeout(wait, watcher.next()).await {
        panic!("expected no event, got {event:?}");
    }
}
