// ============================================================================
// ASSET STORE — content-addressed records, queries, usage, object URLs
// ============================================================================

pub mod backend;
pub mod url_cache;

pub use backend::{AssetBackend, AssetIndex, DiskBackend, MemoryBackend};
pub use url_cache::{BlobUrlRegistry, ObjectUrlProvider, UrlCache, UrlKind, UrlPayload};

use std::any::Any;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::io;
use crate::settings::EngineSettings;

pub type AssetId = Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("asset {0} not found")]
    NotFound(AssetId),
    #[error("invalid asset: {0}")]
    InvalidInput(String),
    #[error("asset storage I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("asset serialization: {0}")]
    Serialization(#[from] bincode::Error),
}

impl AssetError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, AssetError::NotFound(_))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AssetType {
    Icon,
    Background,
    Texture,
    Overlay,
    StudioProject,
    Preset,
    Export,
    Other,
}

impl AssetType {
    pub fn all() -> &'static [AssetType] {
        &[
            AssetType::Icon,
            AssetType::Background,
            AssetType::Texture,
            AssetType::Overlay,
            AssetType::StudioProject,
            AssetType::Preset,
            AssetType::Export,
            AssetType::Other,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            AssetType::Icon => "icon",
            AssetType::Background => "background",
            AssetType::Texture => "texture",
            AssetType::Overlay => "overlay",
            AssetType::StudioProject => "studio-project",
            AssetType::Preset => "preset",
            AssetType::Export => "export",
            AssetType::Other => "other",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all().iter().copied().find(|t| t.name().eq_ignore_ascii_case(name))
    }
}

/// Global records have no project; everything else belongs to one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Project(String),
}

impl Scope {
    pub fn of(project_id: Option<&str>) -> Self {
        match project_id {
            Some(p) => Scope::Project(p.to_string()),
            None => Scope::Global,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    pub filename: String,
    pub mime_type: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub used_in_projects: BTreeSet<String>,
}

/// Everything about a record except its payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssetInfo {
    pub id: AssetId,
    pub asset_type: AssetType,
    pub project_id: Option<String>,
    pub metadata: AssetMetadata,
    pub content_hash: String,
    pub linked_to: BTreeSet<String>,
    pub usage: UsageStats,
}

impl AssetInfo {
    pub fn scope(&self) -> Scope {
        Scope::of(self.project_id.as_deref())
    }

    /// Nothing links to it.  Orphans are only removed on request.
    pub fn is_orphan(&self) -> bool {
        self.linked_to.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssetRecord {
    pub info: AssetInfo,
    pub data: Vec<u8>,
    pub thumbnail: Option<Vec<u8>>,
}

impl AssetRecord {
    pub fn id(&self) -> AssetId {
        self.info.id
    }
}

/// Input to `AssetStore::save`.
#[derive(Clone, Debug)]
pub struct NewAsset {
    pub id: Option<AssetId>,
    pub asset_type: AssetType,
    pub project_id: Option<String>,
    pub filename: String,
    pub data: Vec<u8>,
    pub thumbnail: Option<Vec<u8>>,
    pub content_hash: Option<String>,
    pub links: Vec<String>,
}

impl NewAsset {
    pub fn new(asset_type: AssetType, filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: None,
            asset_type,
            project_id: None,
            filename: filename.into(),
            data,
            thumbnail: None,
            content_hash: None,
            links: Vec::new(),
        }
    }

    pub fn in_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn linked_to(mut self, entity: impl Into<String>) -> Self {
        self.links.push(entity.into());
        self
    }

    /// Restore under a known id.  Skips deduplication.
    pub fn with_id(mut self, id: AssetId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: Vec<u8>) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveOptions {
    pub dedup: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self { dedup: true }
    }
}

/// Partial update.  `project_id: Some(None)` moves a record to global scope.
#[derive(Clone, Debug, Default)]
pub struct AssetUpdate {
    pub filename: Option<String>,
    pub asset_type: Option<AssetType>,
    pub project_id: Option<Option<String>>,
    pub data: Option<Vec<u8>>,
    pub thumbnail: Option<Vec<u8>>,
}

impl AssetUpdate {
    fn touches_payload(&self) -> bool {
        self.data.is_some() || self.thumbnail.is_some()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortKey {
    #[default]
    Created,
    Name,
    Size,
    Type,
    LastUsed,
    UsageCount,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Clone, Debug, Default)]
pub struct AssetFilter {
    pub asset_type: Option<AssetType>,
    pub scope: Option<Scope>,
    /// Case-insensitive substring of the filename.
    pub search: Option<String>,
    pub orphans_only: bool,
    pub sort: SortKey,
    pub order: SortOrder,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl AssetFilter {
    pub fn matches(&self, info: &AssetInfo) -> bool {
        if self.asset_type.is_some_and(|t| t != info.asset_type) {
            return false;
        }
        if self.scope.as_ref().is_some_and(|s| *s != info.scope()) {
            return false;
        }
        if self.orphans_only && !info.is_orphan() {
            return false;
        }
        match &self.search {
            Some(q) if !q.is_empty() => info.metadata.filename.to_lowercase().contains(&q.to_lowercase()),
            _ => true,
        }
    }

    fn compare(&self, a: &AssetInfo, b: &AssetInfo) -> Ordering {
        let primary = match self.sort {
            SortKey::Created => a.metadata.created_at.cmp(&b.metadata.created_at),
            SortKey::Name => a.metadata.filename.to_lowercase().cmp(&b.metadata.filename.to_lowercase()),
            SortKey::Size => a.metadata.size.cmp(&b.metadata.size),
            SortKey::Type => a.asset_type.cmp(&b.asset_type),
            SortKey::LastUsed => a.usage.last_used_at.cmp(&b.usage.last_used_at),
            SortKey::UsageCount => a.usage.usage_count.cmp(&b.usage.usage_count),
        };
        let ordered = match self.order {
            SortOrder::Ascending => primary,
            SortOrder::Descending => primary.reverse(),
        };
        ordered.then_with(|| a.id.cmp(&b.id))
    }
}

/// Which index a query walks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexPath {
    TypeAndScope,
    Type,
    Scope,
    FullScan,
}

/// Most selective index available for `filter`.
pub fn plan_query(filter: &AssetFilter) -> IndexPath {
    match (filter.asset_type.is_some(), filter.scope.is_some()) {
        (true, true) => IndexPath::TypeAndScope,
        (true, false) => IndexPath::Type,
        (false, true) => IndexPath::Scope,
        (false, false) => IndexPath::FullScan,
    }
}

/// Result of a batch operation.  Missing ids do not stop the batch.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub succeeded: Vec<AssetId>,
    pub failed: Vec<(AssetId, AssetError)>,
}

impl BulkOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    fn record(&mut self, id: AssetId, result: Result<(), AssetError>) {
        match result {
            Ok(()) => self.succeeded.push(id),
            Err(e) => self.failed.push((id, e)),
        }
    }
}

/// Lowercase hex SHA-256.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub struct AssetStore {
    backend: Box<dyn AssetBackend>,
    urls: UrlCache,
    thumbnail_edge: u32,
    dedup_default: bool,
}

impl AssetStore {
    pub fn new(backend: Box<dyn AssetBackend>, provider: Arc<dyn ObjectUrlProvider>) -> Self {
        Self {
            backend,
            urls: UrlCache::new(provider),
            thumbnail_edge: 128,
            dedup_default: true,
        }
    }

    /// Memory-backed store with its own blob registry.
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::new()), Arc::new(BlobUrlRegistry::new()))
    }

    pub fn open_dir(root: &Path) -> Result<Self, AssetError> {
        Ok(Self::new(Box::new(DiskBackend::open(root)?), Arc::new(BlobUrlRegistry::new())))
    }

    pub fn with_settings(mut self, settings: &EngineSettings) -> Self {
        self.thumbnail_edge = settings.thumbnail_edge.max(1);
        self.dedup_default = settings.dedup_assets;
        self
    }

    /// Save options derived from the configured default.
    pub fn default_options(&self) -> SaveOptions {
        SaveOptions { dedup: self.dedup_default }
    }

    pub fn urls(&self) -> &UrlCache {
        &self.urls
    }

    // ========================================================================
    // CRUD
    // ========================================================================

    /// Store `new`.  With dedup on and no explicit id, a payload already in
    /// the store resolves to the existing record, which gains `new.links`.
    pub fn save(&mut self, new: NewAsset, options: SaveOptions) -> Result<AssetId, AssetError> {
        if new.data.is_empty() {
            return Err(AssetError::InvalidInput(format!("'{}' has an empty payload", new.filename)));
        }
        let hash = new.content_hash.clone().unwrap_or_else(|| content_hash(&new.data));

        if new.id.is_none()
            && options.dedup
            && let Some(existing) = self.backend.index().find_by_hash(&hash)
        {
            let mut info = self.info(existing)?;
            let before = info.linked_to.len();
            info.linked_to.extend(new.links);
            if info.linked_to.len() != before {
                info.metadata.updated_at = Utc::now();
                self.backend.put_info(info)?;
            }
            log_info!("Asset store: '{}' deduplicated onto {}", new.filename, existing);
            return Ok(existing);
        }

        let id = new.id.unwrap_or_else(Uuid::new_v4);
        let now = Utc::now();
        let (created_at, usage) = match self.backend.index().get(id) {
            Some(prior) => (prior.metadata.created_at, prior.usage.clone()),
            None => (now, UsageStats::default()),
        };
        if self.backend.index().contains(id) {
            self.urls.invalidate(id);
        }

        let (mime_type, width, height, generated_thumb) = self.inspect_payload(&new.data);
        let info = AssetInfo {
            id,
            asset_type: new.asset_type,
            project_id: new.project_id,
            metadata: AssetMetadata {
                filename: new.filename,
                mime_type,
                width,
                height,
                size: new.data.len() as u64,
                created_at,
                updated_at: now,
            },
            content_hash: hash,
            linked_to: new.links.into_iter().collect(),
            usage,
        };
        let thumbnail = new.thumbnail.or(generated_thumb);
        self.backend.put(AssetRecord { info, data: new.data, thumbnail })?;
        log_info!("Asset store: saved {}", id);
        Ok(id)
    }

    pub fn get_by_id(&self, id: AssetId) -> Result<AssetRecord, AssetError> {
        self.backend.get(id)?.ok_or(AssetError::NotFound(id))
    }

    /// Metadata without loading payloads.
    pub fn info(&self, id: AssetId) -> Result<AssetInfo, AssetError> {
        self.backend.index().get(id).cloned().ok_or(AssetError::NotFound(id))
    }

    pub fn contains(&self, id: AssetId) -> bool {
        self.backend.index().contains(id)
    }

    pub fn update(&mut self, id: AssetId, update: AssetUpdate) -> Result<AssetInfo, AssetError> {
        if !update.touches_payload() {
            let mut info = self.info(id)?;
            apply_metadata(&mut info, &update);
            info.metadata.updated_at = Utc::now();
            self.backend.put_info(info.clone())?;
            return Ok(info);
        }

        let mut record = self.get_by_id(id)?;
        apply_metadata(&mut record.info, &update);
        if let Some(data) = update.data {
            if data.is_empty() {
                return Err(AssetError::InvalidInput(format!("update of {} has an empty payload", id)));
            }
            let (mime_type, width, height, generated_thumb) = self.inspect_payload(&data);
            record.info.content_hash = content_hash(&data);
            record.info.metadata.mime_type = mime_type;
            record.info.metadata.width = width;
            record.info.metadata.height = height;
            record.info.metadata.size = data.len() as u64;
            record.data = data;
            record.thumbnail = generated_thumb;
        }
        if let Some(thumbnail) = update.thumbnail {
            record.thumbnail = Some(thumbnail);
        }
        record.info.metadata.updated_at = Utc::now();
        self.urls.invalidate(id);
        let info = record.info.clone();
        self.backend.put(record)?;
        Ok(info)
    }

    pub fn delete(&mut self, id: AssetId) -> Result<(), AssetError> {
        if !self.backend.remove(id)? {
            return Err(AssetError::NotFound(id));
        }
        self.urls.invalidate(id);
        log_info!("Asset store: deleted {}", id);
        Ok(())
    }

    pub fn bulk_update(&mut self, ids: &[AssetId], update: &AssetUpdate) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for &id in ids {
            let result = self.update(id, update.clone()).map(|_| ());
            outcome.record(id, result);
        }
        log_bulk("update", &outcome);
        outcome
    }

    pub fn bulk_delete(&mut self, ids: &[AssetId]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for &id in ids {
            let result = self.delete(id);
            outcome.record(id, result);
        }
        log_bulk("delete", &outcome);
        outcome
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn list(&self, filter: &AssetFilter) -> Vec<AssetInfo> {
        self.list_via(plan_query(filter), filter)
    }

    /// `list` through an explicit index path.  Results do not depend on it.
    pub fn list_via(&self, path: IndexPath, filter: &AssetFilter) -> Vec<AssetInfo> {
        let mut hits: Vec<&AssetInfo> = self
            .backend
            .index()
            .candidates(path, filter)
            .into_iter()
            .filter(|info| filter.matches(info))
            .collect();
        hits.sort_by(|a, b| filter.compare(a, b));
        hits.into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    /// Matches before pagination.
    pub fn count(&self, filter: &AssetFilter) -> usize {
        self.backend
            .index()
            .candidates(plan_query(filter), filter)
            .into_iter()
            .filter(|info| filter.matches(info))
            .count()
    }

    pub fn len(&self) -> usize {
        self.backend.index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.backend.index().is_empty()
    }

    // ========================================================================
    // LINKS + USAGE
    // ========================================================================

    pub fn link_to_character(&mut self, id: AssetId, character_id: &str) -> Result<(), AssetError> {
        let mut info = self.info(id)?;
        if info.linked_to.insert(character_id.to_string()) {
            self.backend.put_info(info)?;
        }
        Ok(())
    }

    pub fn unlink_from_character(&mut self, id: AssetId, character_id: &str) -> Result<(), AssetError> {
        let mut info = self.info(id)?;
        if info.linked_to.remove(character_id) {
            self.backend.put_info(info)?;
        }
        Ok(())
    }

    pub fn record_usage(&mut self, id: AssetId, project_id: Option<&str>) -> Result<(), AssetError> {
        let mut info = self.info(id)?;
        info.usage.last_used_at = Some(Utc::now());
        info.usage.usage_count += 1;
        if let Some(p) = project_id {
            info.usage.used_in_projects.insert(p.to_string());
        }
        self.backend.put_info(info)
    }

    pub fn orphans(&self) -> Vec<AssetInfo> {
        self.list(&AssetFilter { orphans_only: true, ..AssetFilter::default() })
    }

    pub fn cleanup_orphans(&mut self) -> BulkOutcome {
        let ids: Vec<AssetId> = self.orphans().into_iter().map(|i| i.id).collect();
        log_info!("Asset store: cleaning up {} orphaned assets", ids.len());
        self.bulk_delete(&ids)
    }

    // ========================================================================
    // EXPORT
    // ========================================================================

    /// Records in `scope`, oldest first, loaded one at a time.
    pub fn export_stream(&self, scope: Scope) -> ExportStream<'_> {
        let filter = AssetFilter { scope: Some(scope), ..AssetFilter::default() };
        let ids: Vec<AssetId> = self.list(&filter).into_iter().map(|i| i.id).collect();
        ExportStream { store: self, ids: ids.into_iter() }
    }

    // ========================================================================
    // OBJECT URLS
    // ========================================================================

    pub fn get_asset_url(&self, id: AssetId) -> Result<String, AssetError> {
        self.acquire_url(id, UrlKind::Asset, None)
    }

    /// Thumbnail URL, falling back to the full payload when the record has
    /// no thumbnail.
    pub fn get_thumbnail_url(&self, id: AssetId) -> Result<String, AssetError> {
        self.acquire_url(id, UrlKind::Thumbnail, None)
    }

    /// Like `get_asset_url`, but the reference is also dropped once
    /// `tracker` is gone and the cache is swept.
    pub fn get_asset_url_tracked<T: Any + Send + Sync>(&self, id: AssetId, tracker: &Arc<T>) -> Result<String, AssetError> {
        let weak: Weak<T> = Arc::downgrade(tracker);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        self.acquire_url(id, UrlKind::Asset, Some(weak))
    }

    pub fn get_thumbnail_url_tracked<T: Any + Send + Sync>(&self, id: AssetId, tracker: &Arc<T>) -> Result<String, AssetError> {
        let weak: Weak<T> = Arc::downgrade(tracker);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        self.acquire_url(id, UrlKind::Thumbnail, Some(weak))
    }

    pub fn release_url(&self, id: AssetId) -> bool {
        self.urls.release(id)
    }

    /// Release the reference taken by a `_tracked` call with `tracker`.
    pub fn release_url_tracked<T: Any + Send + Sync>(&self, id: AssetId, tracker: &Arc<T>) -> bool {
        self.urls.release_tracked(id, Arc::as_ptr(tracker) as *const ())
    }

    pub fn sweep_urls(&self) -> usize {
        self.urls.sweep()
    }

    pub fn clear_url_cache(&self) {
        self.urls.clear();
    }

    fn acquire_url(&self, id: AssetId, kind: UrlKind, tracker: Option<Weak<dyn Any + Send + Sync>>) -> Result<String, AssetError> {
        if !self.contains(id) {
            return Err(AssetError::NotFound(id));
        }
        self.urls.acquire(id, kind, tracker, || {
            let record = self.get_by_id(id)?;
            let payload = match (kind, record.thumbnail) {
                (UrlKind::Thumbnail, Some(thumb)) => UrlPayload { mime: io::sniff_mime(&thumb).to_string(), bytes: thumb },
                _ => UrlPayload { bytes: record.data, mime: record.info.metadata.mime_type },
            };
            Ok(payload)
        })
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// MIME type, dimensions and a generated thumbnail for image payloads.
    fn inspect_payload(&self, data: &[u8]) -> (String, Option<u32>, Option<u32>, Option<Vec<u8>>) {
        let mime = io::sniff_mime(data).to_string();
        if !mime.starts_with("image/") {
            return (mime, None, None, None);
        }
        match io::decode_rgba(data) {
            Ok(image) => {
                let thumb = io::encode_png(&io::fit_within(&image, self.thumbnail_edge))
                    .inspect_err(|e| {
                        log_warn!("Asset store: thumbnail encode failed: {}", e);
                    })
                    .ok();
                (mime, Some(image.width()), Some(image.height()), thumb)
            }
            Err(e) => {
                log_warn!("Asset store: {} payload did not decode: {}", mime, e);
                (mime, None, None, None)
            }
        }
    }
}

fn apply_metadata(info: &mut AssetInfo, update: &AssetUpdate) {
    if let Some(name) = &update.filename {
        info.metadata.filename = name.clone();
    }
    if let Some(t) = update.asset_type {
        info.asset_type = t;
    }
    if let Some(project) = &update.project_id {
        info.project_id = project.clone();
    }
}

fn log_bulk(op: &str, outcome: &BulkOutcome) {
    if outcome.is_complete() {
        log_info!("Asset store: bulk {} of {} records", op, outcome.succeeded.len());
    } else {
        log_warn!(
            "Asset store: bulk {} finished with {} ok, {} failed",
            op,
            outcome.succeeded.len(),
            outcome.failed.len()
        );
    }
}

/// Lazily loads one record per `next`.  Records deleted after the stream
/// was created are skipped.
pub struct ExportStream<'a> {
    store: &'a AssetStore,
    ids: std::vec::IntoIter<AssetId>,
}

impl Iterator for ExportStream<'_> {
    type Item = Result<AssetRecord, AssetError>;

    fn next(&mut self) -> Option<Self::Item> {
        for id in self.ids.by_ref() {
            match self.store.backend.get(id) {
                Ok(Some(record)) => return Some(Ok(record)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.ids.len()))
    }
}
