use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_recursion::async_recursion;
use tokio::fs;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::{manifest::media_types, Descriptor, Digest, KociError, KociResult};

use super::OciLayout;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Single-flight locks for removals, keyed by digest, plus the active count
/// the garbage collector consults.
#[derive(Debug, Default)]
pub(super) struct RemovalMap {
    locks: Mutex<HashMap<Digest, Arc<AsyncMutex<()>>>>,
    active: AtomicUsize,
}

/// Holds one digest's removal lock; releases it and the active count on drop.
pub(super) struct RemovalGuard {
    map: Arc<RemovalMap>,
    digest: Digest,
    permit: Option<OwnedMutexGuard<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RemovalMap {
    pub(super) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquires the removal lock for `digest`, blocking while another caller
    /// holds it.
    pub(super) async fn acquire(self: &Arc<Self>, digest: Digest) -> RemovalGuard {
        let lock = {
            let mut locks = self.locks.lock().expect("removal map poisoned");
            locks
                .entry(digest.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        let permit = lock.lock_owned().await;
        RemovalGuard {
            map: self.clone(),
            digest,
            permit: Some(permit),
        }
    }

    /// Returns true when no removal is in progress or waiting.
    pub(super) fn is_idle(&self) -> bool {
        self.active.load(Ordering::SeqCst) == 0
    }
}

impl OciLayout {
    /// Removes the described content from the store.
    ///
    /// Blobs are simply deleted. Removing a manifest also deletes its config
    /// and any layer no other indexed manifest reaches, and is refused while
    /// another manifest still references the manifest itself. Removing an
    /// index also removes its child manifests, leaving children that other
    /// content still references in place. The index file is synced after
    /// every mutation.
    pub async fn remove(&self, descriptor: &Descriptor) -> KociResult<()> {
        let _guard = self.removals.acquire(descriptor.digest().clone()).await;
        self.remove_inner(descriptor).await
    }

    #[async_recursion]
    async fn remove_inner(&self, descriptor: &Descriptor) -> KociResult<()> {
        match descriptor.media_type().as_str() {
            media_types::INDEX => self.remove_index(descriptor).await,
            media_types::MANIFEST => self.remove_manifest(descriptor).await,
            _ => self.delete_blob_file(descriptor.digest()).await,
        }
    }

    async fn remove_index(&self, descriptor: &Descriptor) -> KociResult<()> {
        // Read the document before its blob disappears.
        let document = self.load_index(descriptor).await.ok();

        {
            let mut index = self.index.write().await;
            let remaining: Vec<Descriptor> = index
                .manifests()
                .iter()
                .filter(|entry| entry.digest() != descriptor.digest())
                .cloned()
                .collect();
            index.set_manifests(remaining);
            self.sync_index(&index).await?;
        }

        if let Some(document) = document {
            for child in document.manifests() {
                let _guard = self.removals.acquire(child.digest().clone()).await;
                match self.remove_inner(child).await {
                    Ok(()) => {}
                    Err(KociError::UnableToRemove { .. }) => {
                        tracing::debug!(
                            digest = %child.digest(),
                            "child manifest still referenced, leaving in place"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.delete_blob_file(descriptor.digest()).await
    }

    async fn remove_manifest(&self, descriptor: &Descriptor) -> KociResult<()> {
        let mut index = self.index.write().await;
        let remaining: Vec<Descriptor> = index
            .manifests()
            .iter()
            .filter(|entry| entry.digest() != descriptor.digest())
            .cloned()
            .collect();

        let still_referenced = self.expand(&remaining).await;
        if still_referenced.contains(descriptor.digest()) {
            return Err(KociError::UnableToRemove {
                descriptor: descriptor.clone(),
                reason: "still referenced by another manifest".to_string(),
            });
        }

        index.set_manifests(remaining);
        self.sync_index(&index).await?;
        drop(index);

        if let Ok(document) = self.load_manifest(descriptor).await {
            if !still_referenced.contains(document.config().digest()) {
                self.delete_blob_file(document.config().digest()).await?;
            }
            for layer in document.layers() {
                if !still_referenced.contains(layer.digest()) {
                    self.delete_blob_file(layer.digest()).await?;
                }
            }
        }

        self.delete_blob_file(descriptor.digest()).await
    }

    /// Computes the transitive closure of digests reachable from
    /// `descriptors`: indexes contribute themselves and their children's
    /// expansions, manifests contribute themselves, their config and their
    /// layers, and everything else contributes itself. Missing or unreadable
    /// files contribute no children.
    pub(crate) async fn expand(&self, descriptors: &[Descriptor]) -> HashSet<Digest> {
        let mut reachable = HashSet::new();
        for descriptor in descriptors {
            self.expand_into(descriptor, &mut reachable).await;
        }
        reachable
    }

    #[async_recursion]
    async fn expand_into(&self, descriptor: &Descriptor, reachable: &mut HashSet<Digest>) {
        if !reachable.insert(descriptor.digest().clone()) {
            return;
        }

        match descriptor.media_type().as_str() {
            media_types::INDEX => {
                if let Ok(document) = self.load_index(descriptor).await {
                    for child in document.manifests() {
                        self.expand_into(child, reachable).await;
                    }
                }
            }
            media_types::MANIFEST => {
                if let Ok(document) = self.load_manifest(descriptor).await {
                    reachable.insert(document.config().digest().clone());
                    for layer in document.layers() {
                        reachable.insert(layer.digest().clone());
                    }
                }
            }
            _ => {}
        }
    }

    pub(super) async fn delete_blob_file(&self, digest: &Digest) -> KociResult<()> {
        match fs::remove_file(self.blob_path(digest)).await {
            Ok(()) => {
                tracing::debug!(%digest, "blob deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub(super) fn removals_idle(&self) -> bool {
        self.removals.is_idle()
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        self.permit.take();
        let mut locks = self.map.locks.lock().expect("removal map poisoned");
        if let Some(lock) = locks.get(&self.digest) {
            // Last holder out drops the per-digest lock entry.
            if Arc::strong_count(lock) == 1 {
                locks.remove(&self.digest);
            }
        }
        self.map.active.fetch_sub(1, Ordering::SeqCst);
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
