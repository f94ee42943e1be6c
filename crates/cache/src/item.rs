//! Loadable items and their load state.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};

use lowtide_core::{Error, Result};

/// Async loader closure for one item.
pub type LoadFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// What an item is, for logging and for the host's fetcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    /// Image bytes
    Image,
    /// Code module or UI component
    Module,
    /// Any other data
    Data,
}

/// Resolves URL-sourced items. Implemented by the host.
#[async_trait]
pub trait UrlFetcher<T>: Send + Sync {
    /// Fetch the item at `url`.
    async fn fetch(&self, url: &str, kind: ItemKind) -> Result<T>;
}

/// Where an item's data comes from.
pub enum ItemSource<T> {
    /// Resolved through the loader's [`UrlFetcher`]
    Url(String),
    /// Produced by a closure
    Loader(LoadFn<T>),
}

impl<T> Clone for ItemSource<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Url(url) => Self::Url(url.clone()),
            Self::Loader(f) => Self::Loader(Arc::clone(f)),
        }
    }
}

impl<T> fmt::Debug for ItemSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Url(url) => f.debug_tuple("Url").field(url).finish(),
            Self::Loader(_) => f.write_str("Loader(..)"),
        }
    }
}

/// An item registered with a [`LazyResourceLoader`](crate::LazyResourceLoader).
pub struct LoadableItem<T> {
    /// Unique id
    pub id: String,
    /// Higher loads sooner
    pub priority: i32,
    /// Item kind
    pub kind: ItemKind,
    /// Data source
    pub source: ItemSource<T>,
    /// Ids that must be loaded first
    pub dependencies: Vec<String>,
}

impl<T> LoadableItem<T> {
    /// An item fetched from `url`.
    pub fn url(id: impl Into<String>, kind: ItemKind, url: impl Into<String>) -> Self {
        Self::new(id, kind, ItemSource::Url(url.into()))
    }

    /// An item produced by `load`.
    pub fn with_loader<F, Fut>(id: impl Into<String>, kind: ItemKind, load: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::new(id, kind, ItemSource::Loader(Arc::new(move || load().boxed())))
    }

    fn new(id: impl Into<String>, kind: ItemKind, source: ItemSource<T>) -> Self {
        Self {
            id: id.into(),
            priority: 0,
            kind,
            source,
            dependencies: Vec::new(),
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Require `id` to be loaded before this item.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }
}

impl<T> Clone for LoadableItem<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            priority: self.priority,
            kind: self.kind,
            source: self.source.clone(),
            dependencies: self.dependencies.clone(),
        }
    }
}

impl<T> fmt::Debug for LoadableItem<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadableItem")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// Lifecycle of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    /// Not loaded, or evicted from the cache
    Pending,
    /// A load is running
    Loading,
    /// Data is cached
    Loaded,
    /// Every attempt failed; stays here until retried explicitly
    Error,
}

/// Snapshot of an item's state.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadState<T> {
    /// Current status
    pub status: LoadStatus,
    /// Attempts made by the latest load
    pub attempts: u32,
    /// Cached data, when loaded
    pub data: Option<T>,
    /// Last error, when failed
    pub error: Option<Error>,
}
