//! Resource store abstraction for watches, triggers and credentials.
//!
//! The real backing store lives outside this process; everything in the crate
//! talks to it through [`Store`]. [`InMemoryStore`] implements the same
//! contract (optimistic concurrency on `resource_version`, change
//! notifications) and is what the binary runs with.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::types::{Credential, ObjectKey, ObjectMeta, Trigger, Watch};

const CHANGE_BUFFER: usize = 256;
const UPDATE_ATTEMPTS: usize = 5;

pub trait Resource: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;

    fn key(&self) -> ObjectKey {
        self.metadata().key()
    }
}

impl Resource for Watch {
    const KIND: &'static str = "watch";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for Trigger {
    const KIND: &'static str = "trigger";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for Credential {
    const KIND: &'static str = "credential";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// Notification delivered to [`Store::watch`] subscribers.
#[derive(Debug, Clone)]
pub enum Change<T> {
    Applied(T),
    Deleted(T),
}

#[async_trait]
pub trait Store<T: Resource>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<T>;

    async fn list(&self) -> StoreResult<Vec<T>>;

    /// Stores a new object. An empty name is generated from `generate_name`.
    async fn create(&self, obj: T) -> StoreResult<T>;

    /// Replaces an object; fails with [`StoreError::Conflict`] when the
    /// caller's `resource_version` is stale.
    async fn update(&self, obj: T) -> StoreResult<T>;

    async fn delete(&self, key: &ObjectKey) -> StoreResult<T>;

    fn watch(&self) -> broadcast::Receiver<Change<T>>;
}

/// Read-modify-write with retry on conflict.
///
/// `mutate` returns `false` when the fetched object already has the desired
/// state, in which case nothing is written.
pub async fn update_with_retry<T, F>(
    store: &dyn Store<T>,
    key: &ObjectKey,
    mut mutate: F,
) -> StoreResult<T>
where
    T: Resource,
    F: FnMut(&mut T) -> bool + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut current = store.get(key).await?;
        if !mutate(&mut current) {
            return Ok(current);
        }
        match store.update(current).await {
            Err(StoreError::Conflict { .. }) if attempt < UPDATE_ATTEMPTS => {
                debug!(kind = T::KIND, key = %key, attempt, "update conflict, retrying");
            }
            other => return other,
        }
    }
}

pub struct InMemoryStore<T: Resource> {
    objects: RwLock<BTreeMap<ObjectKey, T>>,
    version: AtomicU64,
    changes: broadcast::Sender<Change<T>>,
}

impl<T: Resource> InMemoryStore<T> {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            changes,
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn notify(&self, change: Change<T>) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    fn not_found(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: T::KIND,
            key: key.to_string(),
        }
    }
}

impl<T: Resource> Default for InMemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn generated_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..5].to_string()
}

#[async_trait]
impl<T: Resource> Store<T> for InMemoryStore<T> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<T> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))
    }

    async fn list(&self) -> StoreResult<Vec<T>> {
        Ok(self.objects.read().values().cloned().collect())
    }

    async fn create(&self, mut obj: T) -> StoreResult<T> {
        let generated = obj.metadata().name.is_empty();
        let stored = {
            let mut objects = self.objects.write();
            let key = if generated {
                // Suffixes collide; draw again until the name is free.
                loop {
                    let meta = obj.metadata_mut();
                    meta.name = format!("{}{}", meta.generate_name, generated_suffix());
                    let key = obj.key();
                    if !objects.contains_key(&key) {
                        break key;
                    }
                }
            } else {
                obj.key()
            };
            if objects.contains_key(&key) {
                return Err(StoreError::AlreadyExists {
                    kind: T::KIND,
                    key: key.to_string(),
                });
            }
            obj.metadata_mut().resource_version = self.next_version();
            objects.insert(key, obj.clone());
            obj
        };
        self.notify(Change::Applied(stored.clone()));
        Ok(stored)
    }

    async fn update(&self, mut obj: T) -> StoreResult<T> {
        let key = obj.key();
        let stored = {
            let mut objects = self.objects.write();
            let existing = objects.get(&key).ok_or_else(|| Self::not_found(&key))?;
            if existing.metadata().resource_version != obj.metadata().resource_version {
                return Err(StoreError::Conflict {
                    kind: T::KIND,
                    key: key.to_string(),
                });
            }
            obj.metadata_mut().resource_version = self.next_version();
            objects.insert(key, obj.clone());
            obj
        };
        self.notify(Change::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<T> {
        let removed = self
            .objects
            .write()
            .remove(key)
            .ok_or_else(|| Self::not_found(key))?;
        self.notify(Change::Deleted(removed.clone()));
        Ok(removed)
    }

    fn watch(&self) -> broadcast::Receiver<Change<T>> {
        self.changes.subscribe()
    }
}

/// The three resource collections the core reads and writes.
#[derive(Clone)]
pub struct ResourceStore {
    pub watches: Arc<dyn Store<Watch>>,
    pub triggers: Arc<dyn Store<Trigger>>,
    pub credentials: Arc<dyn Store<Credential>>,
}

impl ResourceStore {
    pub fn in_memory() -> Self {
        Self {
            watches: Arc::new(InMemoryStore::<Watch>::new()),
            triggers: Arc::new(InMemoryStore::<Trigger>::new()),
            credentials: Arc::new(InMemoryStore::<Credential>::new()),
        }
    }
}

/// Creates `obj`, or replaces the stored copy while keeping its version.
pub async fn apply<T: Resource>(store: &dyn Store<T>, mut obj: T) -> StoreResult<T> {
    match store.get(&obj.key()).await {
        Ok(existing) => {
            obj.metadata_mut().resource_version = existing.metadata().resource_version;
            store.update(obj).await
        }
        Err(StoreError::NotFound { .. }) => store.create(obj).await,
        Err(err) => Err(err),
    }
}
