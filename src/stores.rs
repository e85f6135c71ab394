//! # Store Façades
//!
//! Thin capability bundles over a shared [`Strategy`]. A REST registration
//! that should only ever create, or only list and watch, takes one of
//! these instead of the full strategy so the compiler enforces the
//! surface.

use std::sync::Arc;

use crate::error::Result;
use crate::strategy::{Strategy, Watcher};
use crate::types::{ListOptions, Object, ObjectList};

/// Create only.
#[derive(Clone)]
pub struct CreateOnlyStore<T> {
    strategy: Arc<Strategy<T>>,
}

impl<T: Object> CreateOnlyStore<T> {
    pub fn new(strategy: Arc<Strategy<T>>) -> Self {
        Self { strategy }
    }

    pub async fn create(&self, obj: &T) -> Result<T> {
        self.strategy.create(obj).await
    }

    pub fn destroy(&self) {
        self.strategy.destroy();
    }
}

/// Create and read back.
#[derive(Clone)]
pub struct CreateGetStore<T> {
    strategy: Arc<Strategy<T>>,
}

impl<T: Object> CreateGetStore<T> {
    pub fn new(strategy: Arc<Strategy<T>>) -> Self {
        Self { strategy }
    }

    pub async fn create(&self, obj: &T) -> Result<T> {
        self.strategy.create(obj).await
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<T> {
        self.strategy.get(namespace, name).await
    }

    pub fn destroy(&self) {
        self.strategy.destroy();
    }
}

/// Read one or many.
#[derive(Clone)]
pub struct GetListStore<T> {
    strategy: Arc<Strategy<T>>,
}

impl<T: Object> GetListStore<T> {
    pub fn new(strategy: Arc<Strategy<T>>) -> Self {
        Self { strategy }
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<T> {
        self.strategy.get(namespace, name).await
    }

    pub async fn list(&self, namespace: &str, opts: ListOptions<T>) -> Result<ObjectList<T>> {
        self.strategy.list(namespace, opts).await
    }

    pub fn destroy(&self) {
        self.strategy.destroy();
    }
}

/// List only.
#[derive(Clone)]
pub struct ListOnlyStore<T> {
    strategy: Arc<Strategy<T>>,
}

impl<T: Object> ListOnlyStore<T> {
    pub fn new(strategy: Arc<Strategy<T>>) -> Self {
        Self { strategy }
    }

    pub async fn list(&self, namespace: &str, opts: ListOptions<T>) -> Result<ObjectList<T>> {
        self.strategy.list(namespace, opts).await
    }

    pub fn destroy(&self) {
        self.strategy.destroy();
    }
}

/// List and subscribe.
#[derive(Clone)]
pub struct ListWatchStore<T> {
    strategy: Arc<Strategy<T>>,
}

impl<T: Object> ListWatchStore<T> {
    pub fn new(strategy: Arc<Strategy<T>>) -> Self {
        Self { strategy }
    }

    pub async fn list(&self, namespace: &str, opts: ListOptions<T>) -> Result<ObjectList<T>> {
        self.strategy.list(namespace, opts).await
    }

    pub async fn watch(&self, namespace: &str, opts: ListOptions<T>) -> Result<Watcher<T>> {
        self.strategy.watch(namespace, opts).await
    }

    pub fn destroy(&self) {
        self.strategy.destroy();
    }
}
