//! On-demand resource distribution.
//!
//! Backends resolve resources (compiled class files and the like) locally
//! first and fall back to fetching them from the frontend's classpath over
//! the network. Both sides keep a [`ResourceCache`]: the backend so many
//! threads asking for the same missing name share one request, the frontend
//! so many backends asking for the same name share one disk read.
//!
//! # Components
//!
//! - [`ResourceCache`]: blocking-get cache with one fetch per distinct name
//! - [`LocalResources`]: lookup in a list of classpath directories
//! - [`RemoteResources`]: cache-backed request/response to the frontend
//! - [`ResourceResolver`]: local-then-remote chain used by backend code

use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{watch, Mutex};

use crate::channel::FrontendProxy;
use crate::error::{JobError, Result};

/// Suffix of resources the remote resolver serves.
pub const CLASS_SUFFIX: &str = ".class";

/// A resolved lookup. `NotFound` is a definite answer, unlike a missing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEntry {
    Found(Bytes),
    NotFound,
}

impl ResourceEntry {
    pub fn into_option(self) -> Option<Bytes> {
        match self {
            ResourceEntry::Found(bytes) => Some(bytes),
            ResourceEntry::NotFound => None,
        }
    }
}

impl From<Option<Bytes>> for ResourceEntry {
    fn from(content: Option<Bytes>) -> Self {
        match content {
            Some(bytes) => ResourceEntry::Found(bytes),
            None => ResourceEntry::NotFound,
        }
    }
}

/// Name → content cache whose readers wait until an entry is present.
///
/// Entries are never evicted. The first reader of a missing name runs the
/// fetch; every concurrent reader of that name waits on the same slot.
#[derive(Debug, Default)]
pub struct ResourceCache {
    entries: Mutex<HashMap<String, watch::Sender<Option<ResourceEntry>>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// True if `name` has a resolved entry (content or not-found).
    pub async fn contains(&self, name: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(name)
            .is_some_and(|slot| slot.borrow().is_some())
    }

    /// True if a fetch for `name` is outstanding.
    pub async fn is_pending(&self, name: &str) -> bool {
        self.entries
            .lock()
            .await
            .get(name)
            .is_some_and(|slot| slot.borrow().is_none())
    }

    /// Stores the answer for `name`, waking every waiter.
    pub async fn put(&self, name: &str, entry: ResourceEntry) {
        let mut entries = self.entries.lock().await;
        match entries.get(name) {
            Some(slot) => {
                slot.send_replace(Some(entry));
            }
            None => {
                let (slot, _) = watch::channel(Some(entry));
                entries.insert(name.to_string(), slot);
            }
        }
    }

    /// Returns the entry for `name`, calling `fetch` if this is the first
    /// request for it.
    ///
    /// `fetch` may answer directly (`Some`) or return `None` when the answer
    /// will arrive later through [`put`](Self::put). If `fetch` fails the
    /// slot is dropped and every waiter sees the error as a closed channel.
    pub async fn get_with<F, Fut>(&self, name: &str, fetch: F) -> Result<ResourceEntry>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<ResourceEntry>>>,
    {
        let (mut rx, first) = {
            let mut entries = self.entries.lock().await;
            match entries.get(name) {
                Some(slot) => (slot.subscribe(), false),
                None => {
                    let (slot, rx) = watch::channel(None);
                    entries.insert(name.to_string(), slot);
                    (rx, true)
                }
            }
        };

        if first {
            match fetch().await {
                Ok(Some(entry)) => self.put(name, entry).await,
                Ok(None) => {}
                Err(e) => {
                    self.entries.lock().await.remove(name);
                    return Err(e);
                }
            }
        }

        loop {
            if let Some(entry) = rx.borrow_and_update().clone() {
                return Ok(entry);
            }
            rx.changed()
                .await
                .map_err(|_| JobError::Cancelled(format!("fetch of resource {name} abandoned")))?;
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Where a resolver can look for resource bytes.
#[async_trait]
pub trait ResourceSource: Send + Sync {
    /// `Ok(None)` means the source does not have `name`.
    async fn find(&self, name: &str) -> Result<Option<Bytes>>;
}

/// Resources read from a list of directories.
#[derive(Debug, Clone, Default)]
pub struct LocalResources {
    roots: Vec<PathBuf>,
}

impl LocalResources {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

/// Only plain relative names may be looked up under a root.
fn is_safe_name(name: &str) -> bool {
    let path = Path::new(name);
    !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

#[async_trait]
impl ResourceSource for LocalResources {
    async fn find(&self, name: &str) -> Result<Option<Bytes>> {
        if !is_safe_name(name) {
            tracing::debug!(name, "Rejected resource name");
            return Ok(None);
        }
        for root in &self.roots {
            match tokio::fs::read(root.join(name)).await {
                Ok(bytes) => return Ok(Some(Bytes::from(bytes))),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

/// Class resources fetched from the frontend.
#[derive(Debug)]
pub struct RemoteResources {
    frontend: FrontendProxy,
    cache: ResourceCache,
}

impl RemoteResources {
    pub fn new(frontend: FrontendProxy) -> Self {
        Self {
            frontend,
            cache: ResourceCache::new(),
        }
    }

    /// Blocks until the frontend answers for `name`. One request goes out
    /// per distinct name no matter how many callers wait on it.
    pub async fn get(&self, name: &str) -> Result<ResourceEntry> {
        if !name.ends_with(CLASS_SUFFIX) {
            return Err(JobError::UnsupportedResource(name.to_string()));
        }
        self.cache
            .get_with(name, || async {
                tracing::debug!(name, "Requesting resource from frontend");
                self.frontend.request_resource(name)?;
                Ok::<_, JobError>(None)
            })
            .await
    }

    /// Called by the backend receive loop on `reportResource`.
    pub async fn put(&self, name: &str, content: Option<Bytes>) {
        self.cache.put(name, content.into()).await;
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }
}

#[async_trait]
impl ResourceSource for RemoteResources {
    async fn find(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.get(name).await?.into_option())
    }
}

/// Local lookup first, then the remote source for class resources.
#[derive(Clone)]
pub struct ResourceResolver {
    local: Arc<dyn ResourceSource>,
    remote: Option<Arc<dyn ResourceSource>>,
}

impl ResourceResolver {
    pub fn new(local: Arc<dyn ResourceSource>) -> Self {
        Self {
            local,
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: Arc<dyn ResourceSource>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub async fn resolve(&self, name: &str) -> Result<Bytes> {
        if let Some(bytes) = self.local.find(name).await? {
            return Ok(bytes);
        }
        let Some(remote) = &self.remote else {
            return Err(JobError::ResourceNotFound(name.to_string()));
        };
        if !name.ends_with(CLASS_SUFFIX) {
            return Err(JobError::UnsupportedResource(name.to_string()));
        }
        remote
            .find(name)
            .await?
            .ok_or_else(|| JobError::ResourceNotFound(name.to_string()))
    }
}

impl std::fmt::Debug for ResourceResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceResolver")
            .field("remote", &self.remote.is_some())
            .finish()
    }
}
