// ============================================================================
// URL CACHE — ref-counted object URLs with weak consumer tracking
// ============================================================================

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use uuid::Uuid;

use super::{AssetError, AssetId};

/// Mints and revokes short-lived URLs that expose a payload to display code.
pub trait ObjectUrlProvider: Send + Sync {
    fn create_url(&self, bytes: &[u8], mime: &str) -> String;
    fn revoke_url(&self, url: &str);
}

/// In-process provider.  URLs look like `blob:tokenstudio/<uuid>` and resolve
/// to their bytes until revoked.
#[derive(Default)]
pub struct BlobUrlRegistry {
    live: Mutex<HashMap<String, (Arc<[u8]>, String)>>,
    minted: AtomicUsize,
    revoked: AtomicUsize,
}

impl BlobUrlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, (Arc<[u8]>, String)>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bytes behind a live URL.
    pub fn resolve(&self, url: &str) -> Option<Arc<[u8]>> {
        self.live().get(url).map(|(bytes, _)| Arc::clone(bytes))
    }

    pub fn mime_of(&self, url: &str) -> Option<String> {
        self.live().get(url).map(|(_, mime)| mime.clone())
    }

    pub fn is_live(&self, url: &str) -> bool {
        self.live().contains_key(url)
    }

    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    pub fn minted(&self) -> usize {
        self.minted.load(Ordering::SeqCst)
    }

    pub fn revoked(&self) -> usize {
        self.revoked.load(Ordering::SeqCst)
    }
}

impl ObjectUrlProvider for BlobUrlRegistry {
    fn create_url(&self, bytes: &[u8], mime: &str) -> String {
        let url = format!("blob:tokenstudio/{}", Uuid::new_v4());
        self.live().insert(url.clone(), (Arc::from(bytes), mime.to_string()));
        self.minted.fetch_add(1, Ordering::SeqCst);
        url
    }

    fn revoke_url(&self, url: &str) {
        if self.live().remove(url).is_some() {
            self.revoked.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UrlKind {
    Asset,
    Thumbnail,
}

/// Payload handed to the provider when a URL has to be minted.
pub struct UrlPayload {
    pub bytes: Vec<u8>,
    pub mime: String,
}

type Tracker = Weak<dyn Any + Send + Sync>;

/// Reference taken on behalf of a tracked consumer.  It stays counted until
/// released explicitly or until the consumer is gone.
struct TrackedRef {
    tracker: Tracker,
    released: bool,
}

impl TrackedRef {
    fn is_alive(&self) -> bool {
        self.tracker.strong_count() > 0
    }

    fn belongs_to(&self, consumer: *const ()) -> bool {
        Weak::as_ptr(&self.tracker) as *const () == consumer
    }
}

#[derive(Default)]
struct UrlEntry {
    object_url: Option<String>,
    thumbnail_url: Option<String>,
    untracked: usize,
    tracked: Vec<TrackedRef>,
}

impl UrlEntry {
    fn url(&self, kind: UrlKind) -> Option<&String> {
        match kind {
            UrlKind::Asset => self.object_url.as_ref(),
            UrlKind::Thumbnail => self.thumbnail_url.as_ref(),
        }
    }

    fn set_url(&mut self, kind: UrlKind, url: String) {
        match kind {
            UrlKind::Asset => self.object_url = Some(url),
            UrlKind::Thumbnail => self.thumbnail_url = Some(url),
        }
    }

    fn ref_count(&self) -> usize {
        self.untracked + self.tracked.iter().filter(|t| !t.released).count()
    }

    /// Forget consumers that are gone, together with any reference they
    /// still held.  Untracked references are never touched here.
    fn prune_trackers(&mut self) {
        self.tracked.retain(TrackedRef::is_alive);
    }

    /// Anonymous release: untracked references first, then the oldest
    /// outstanding tracked one.
    fn release_one(&mut self) {
        if self.untracked > 0 {
            self.untracked -= 1;
        } else if let Some(t) = self.tracked.iter_mut().find(|t| !t.released) {
            t.released = true;
        }
    }

    /// Release the reference held by `consumer`.  Returns `false` when that
    /// consumer holds none.
    fn release_for(&mut self, consumer: *const ()) -> bool {
        match self.tracked.iter_mut().find(|t| !t.released && t.belongs_to(consumer)) {
            Some(t) => {
                t.released = true;
                true
            }
            None => false,
        }
    }

    fn is_releasable(&self) -> bool {
        self.ref_count() == 0 && !self.tracked.iter().any(TrackedRef::is_alive)
    }

    fn revoke(self, provider: &dyn ObjectUrlProvider) {
        for url in [self.object_url, self.thumbnail_url].into_iter().flatten() {
            provider.revoke_url(&url);
        }
    }
}

/// One entry per asset id, shared by every consumer of that asset.
///
/// A URL is revoked once, when the reference count reaches zero and no
/// tracked consumer is alive.  Revoked entries are removed, so a later
/// request mints a fresh URL.
pub struct UrlCache {
    provider: Arc<dyn ObjectUrlProvider>,
    entries: Mutex<HashMap<AssetId, UrlEntry>>,
}

impl UrlCache {
    pub fn new(provider: Arc<dyn ObjectUrlProvider>) -> Self {
        Self {
            provider,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<AssetId, UrlEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the cached URL for `id` or mint one from `payload`, taking a
    /// reference either way.  With a tracker, the reference is dropped
    /// automatically once the tracker is gone and `sweep` runs.
    pub fn acquire<F>(&self, id: AssetId, kind: UrlKind, tracker: Option<Tracker>, payload: F) -> Result<String, AssetError>
    where
        F: FnOnce() -> Result<UrlPayload, AssetError>,
    {
        self.sweep();
        let mut entries = self.entries();
        let url = match entries.get(&id).and_then(|e| e.url(kind)) {
            Some(url) => url.clone(),
            None => {
                let payload = payload()?;
                let url = self.provider.create_url(&payload.bytes, &payload.mime);
                entries.entry(id).or_default().set_url(kind, url.clone());
                url
            }
        };
        let entry = entries.entry(id).or_default();
        match tracker {
            Some(tracker) => entry.tracked.push(TrackedRef { tracker, released: false }),
            None => entry.untracked += 1,
        }
        Ok(url)
    }

    /// Drop one reference.  Returns `true` when this revoked the URLs.
    pub fn release(&self, id: AssetId) -> bool {
        self.release_with(id, UrlEntry::release_one)
    }

    /// Drop the reference taken with `consumer` as tracker.  Falls back to
    /// an anonymous release when `consumer` holds no reference on `id`.
    pub fn release_tracked(&self, id: AssetId, consumer: *const ()) -> bool {
        self.release_with(id, |entry| {
            if !entry.release_for(consumer) {
                entry.release_one();
            }
        })
    }

    fn release_with(&self, id: AssetId, release: impl FnOnce(&mut UrlEntry)) -> bool {
        self.sweep();
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(&id) else {
            return false;
        };
        release(entry);
        if !entry.is_releasable() {
            return false;
        }
        if let Some(entry) = entries.remove(&id) {
            entry.revoke(self.provider.as_ref());
        }
        true
    }

    /// Revoke immediately, regardless of references.  Used when the payload
    /// behind `id` changed or was deleted.
    pub fn invalidate(&self, id: AssetId) {
        if let Some(entry) = self.entries().remove(&id) {
            log_info!("URL cache: invalidated {}", id);
            entry.revoke(self.provider.as_ref());
        }
    }

    /// Collect dead trackers and revoke entries nobody references anymore.
    /// Returns the number of entries revoked.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries();
        let mut released = Vec::new();
        for (id, entry) in entries.iter_mut() {
            if entry.tracked.is_empty() {
                continue;
            }
            entry.prune_trackers();
            if entry.is_releasable() {
                released.push(*id);
            }
        }
        for id in &released {
            if let Some(entry) = entries.remove(id) {
                entry.revoke(self.provider.as_ref());
            }
        }
        released.len()
    }

    /// Revoke everything.
    pub fn clear(&self) {
        let drained: Vec<UrlEntry> = self.entries().drain().map(|(_, e)| e).collect();
        if !drained.is_empty() {
            log_info!("URL cache: revoking {} entries", drained.len());
        }
        for entry in drained {
            entry.revoke(self.provider.as_ref());
        }
    }

    pub fn ref_count(&self, id: AssetId) -> Option<usize> {
        self.entries().get(&id).map(UrlEntry::ref_count)
    }

    pub fn is_cached(&self, id: AssetId) -> bool {
        self.entries().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

impl Drop for UrlCache {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Result<UrlPayload, AssetError> {
        Ok(UrlPayload { bytes: vec![1, 2, 3], mime: "image/png".into() })
    }

    fn setup() -> (Arc<BlobUrlRegistry>, UrlCache) {
        let registry = Arc::new(BlobUrlRegistry::new());
        let cache = UrlCache::new(registry.clone());
        (registry, cache)
    }

    #[test]
    fn registry_mints_resolvable_urls() {
        let registry = BlobUrlRegistry::new();
        let url = registry.create_url(&[9, 8], "image/jpeg");
        assert!(url.starts_with("blob:tokenstudio/"));
        assert_eq!(registry.resolve(&url).as_deref(), Some(&[9u8, 8][..]));
        assert_eq!(registry.mime_of(&url).as_deref(), Some("image/jpeg"));
        registry.revoke_url(&url);
        registry.revoke_url(&url);
        assert!(registry.resolve(&url).is_none());
        assert_eq!(registry.revoked(), 1);
    }

    #[test]
    fn n_acquires_need_n_releases() {
        let (registry, cache) = setup();
        let id = Uuid::new_v4();
        let first = cache.acquire(id, UrlKind::Asset, None, payload).expect("mint");
        for _ in 0..2 {
            let again = cache.acquire(id, UrlKind::Asset, None, || panic!("must reuse")).expect("cached");
            assert_eq!(again, first);
        }
        assert_eq!(cache.ref_count(id), Some(3));
        assert!(!cache.release(id));
        assert!(!cache.release(id));
        assert!(registry.is_live(&first));
        assert!(cache.release(id));
        assert!(!registry.is_live(&first));
        assert_eq!(registry.minted(), 1);
        assert_eq!(registry.revoked(), 1);
        assert!(!cache.release(id));
    }

    #[test]
    fn thumbnail_and_asset_share_the_entry() {
        let (registry, cache) = setup();
        let id = Uuid::new_v4();
        let a = cache.acquire(id, UrlKind::Asset, None, payload).expect("asset url");
        let t = cache.acquire(id, UrlKind::Thumbnail, None, payload).expect("thumb url");
        assert_ne!(a, t);
        assert_eq!(cache.ref_count(id), Some(2));
        cache.release(id);
        assert!(registry.is_live(&t));
        cache.release(id);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn dead_tracker_revokes_on_sweep() {
        let (registry, cache) = setup();
        let id = Uuid::new_v4();
        let consumer: Arc<String> = Arc::new("card".into());
        let weak: Tracker = Arc::downgrade(&consumer) as Weak<dyn Any + Send + Sync>;
        let url = cache.acquire(id, UrlKind::Asset, Some(weak), payload).expect("mint");
        assert_eq!(cache.sweep(), 0);
        assert!(registry.is_live(&url));
        drop(consumer);
        assert_eq!(cache.sweep(), 1);
        assert!(!registry.is_live(&url));
        assert!(!cache.is_cached(id));
    }

    #[test]
    fn live_tracker_blocks_release() {
        let (registry, cache) = setup();
        let id = Uuid::new_v4();
        let consumer = Arc::new(5u32);
        let weak: Tracker = Arc::downgrade(&consumer) as Weak<dyn Any + Send + Sync>;
        let tracked = cache.acquire(id, UrlKind::Asset, Some(weak), payload).expect("mint");
        cache.acquire(id, UrlKind::Asset, None, payload).expect("cached");
        assert!(!cache.release(id));
        assert!(registry.is_live(&tracked));
        drop(consumer);
        assert_eq!(cache.sweep(), 1);
        assert_eq!(registry.revoked(), 1);
    }

    #[test]
    fn released_tracker_does_not_consume_other_references() {
        let (registry, cache) = setup();
        let id = Uuid::new_v4();
        let card = Arc::new(1u8);
        let weak: Tracker = Arc::downgrade(&card) as Weak<dyn Any + Send + Sync>;
        cache.acquire(id, UrlKind::Asset, Some(weak), payload).expect("tracked");
        assert!(!cache.release(id));
        let url = cache.acquire(id, UrlKind::Asset, None, payload).expect("untracked");
        drop(card);
        assert_eq!(cache.sweep(), 0);
        assert!(registry.is_live(&url));
        assert_eq!(cache.ref_count(id), Some(1));
        assert!(cache.release(id));
        assert!(!registry.is_live(&url));
    }

    #[test]
    fn release_tracked_targets_its_consumer() {
        let (registry, cache) = setup();
        let id = Uuid::new_v4();
        let card = Arc::new(2u8);
        let weak: Tracker = Arc::downgrade(&card) as Weak<dyn Any + Send + Sync>;
        let url = cache.acquire(id, UrlKind::Asset, None, payload).expect("untracked");
        cache.acquire(id, UrlKind::Asset, Some(weak), payload).expect("tracked");
        assert!(!cache.release_tracked(id, Arc::as_ptr(&card) as *const ()));
        assert_eq!(cache.ref_count(id), Some(1));
        drop(card);
        assert_eq!(cache.sweep(), 0);
        assert!(registry.is_live(&url));
        assert!(cache.release(id));
    }

    #[test]
    fn invalidate_and_clear_revoke_everything() {
        let (registry, cache) = setup();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        cache.acquire(a, UrlKind::Asset, None, payload).expect("a");
        cache.acquire(b, UrlKind::Thumbnail, None, payload).expect("b");
        cache.invalidate(a);
        assert_eq!(registry.live_count(), 1);
        cache.clear();
        assert_eq!(registry.live_count(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn mint_failure_leaves_no_entry() {
        let (_, cache) = setup();
        let id = Uuid::new_v4();
        let err = cache.acquire(id, UrlKind::Asset, None, || Err(AssetError::NotFound(id)));
        assert!(err.is_err());
        assert!(!cache.is_cached(id));
    }
}
