// ============================================================================
// ASSET BACKENDS — secondary index, in-memory and on-disk storage
// ============================================================================

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use super::{AssetError, AssetFilter, AssetId, AssetInfo, AssetRecord, AssetType, IndexPath, Scope};

/// Record storage.  Backends keep an `AssetIndex` in sync with what they
/// hold; the store reads metadata through it and only touches payloads via
/// `get`.
pub trait AssetBackend: Send {
    /// Insert or replace a record, payloads included.
    fn put(&mut self, record: AssetRecord) -> Result<(), AssetError>;
    /// Replace metadata only.  The record must exist.
    fn put_info(&mut self, info: AssetInfo) -> Result<(), AssetError>;
    fn get(&self, id: AssetId) -> Result<Option<AssetRecord>, AssetError>;
    fn remove(&mut self, id: AssetId) -> Result<bool, AssetError>;
    fn index(&self) -> &AssetIndex;
}

/// Metadata for every record plus the lookup tables used by queries.
#[derive(Default)]
pub struct AssetIndex {
    infos: BTreeMap<AssetId, AssetInfo>,
    by_type_scope: HashMap<(AssetType, Scope), BTreeSet<AssetId>>,
    by_type: HashMap<AssetType, BTreeSet<AssetId>>,
    by_scope: HashMap<Scope, BTreeSet<AssetId>>,
    by_hash: HashMap<String, BTreeSet<AssetId>>,
}

impl AssetIndex {
    pub fn insert(&mut self, info: AssetInfo) {
        self.remove(info.id);
        let id = info.id;
        let scope = info.scope();
        self.by_type_scope.entry((info.asset_type, scope.clone())).or_default().insert(id);
        self.by_type.entry(info.asset_type).or_default().insert(id);
        self.by_scope.entry(scope).or_default().insert(id);
        self.by_hash.entry(info.content_hash.clone()).or_default().insert(id);
        self.infos.insert(id, info);
    }

    pub fn remove(&mut self, id: AssetId) -> Option<AssetInfo> {
        let info = self.infos.remove(&id)?;
        let scope = info.scope();
        detach(&mut self.by_type_scope, &(info.asset_type, scope.clone()), id);
        detach(&mut self.by_type, &info.asset_type, id);
        detach(&mut self.by_scope, &scope, id);
        detach(&mut self.by_hash, &info.content_hash, id);
        Some(info)
    }

    pub fn get(&self, id: AssetId) -> Option<&AssetInfo> {
        self.infos.get(&id)
    }

    pub fn contains(&self, id: AssetId) -> bool {
        self.infos.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Oldest record carrying `hash`.
    pub fn find_by_hash(&self, hash: &str) -> Option<AssetId> {
        self.by_hash
            .get(hash)?
            .iter()
            .filter_map(|id| self.infos.get(id))
            .min_by_key(|info| info.metadata.created_at)
            .map(|info| info.id)
    }

    /// Records reachable through `path` for `filter`.  A superset of the
    /// matches; callers still apply the full predicate.
    pub fn candidates(&self, path: IndexPath, filter: &AssetFilter) -> Vec<&AssetInfo> {
        let ids = match (path, filter.asset_type, &filter.scope) {
            (IndexPath::TypeAndScope, Some(t), Some(s)) => self.by_type_scope.get(&(t, s.clone())),
            (IndexPath::Type, Some(t), _) => self.by_type.get(&t),
            (IndexPath::Scope, _, Some(s)) => self.by_scope.get(s),
            _ => return self.infos.values().collect(),
        };
        ids.map(|set| set.iter().filter_map(|id| self.infos.get(id)).collect())
            .unwrap_or_default()
    }
}

fn detach<K: std::hash::Hash + Eq>(map: &mut HashMap<K, BTreeSet<AssetId>>, key: &K, id: AssetId) {
    if let Some(set) = map.get_mut(key) {
        set.remove(&id);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

// ============================================================================
// MEMORY BACKEND
// ============================================================================

#[derive(Default)]
pub struct MemoryBackend {
    index: AssetIndex,
    payloads: HashMap<AssetId, (Vec<u8>, Option<Vec<u8>>)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssetBackend for MemoryBackend {
    fn put(&mut self, record: AssetRecord) -> Result<(), AssetError> {
        let AssetRecord { info, data, thumbnail } = record;
        self.payloads.insert(info.id, (data, thumbnail));
        self.index.insert(info);
        Ok(())
    }

    fn put_info(&mut self, info: AssetInfo) -> Result<(), AssetError> {
        if !self.payloads.contains_key(&info.id) {
            return Err(AssetError::NotFound(info.id));
        }
        self.index.insert(info);
        Ok(())
    }

    fn get(&self, id: AssetId) -> Result<Option<AssetRecord>, AssetError> {
        let (Some(info), Some((data, thumbnail))) = (self.index.get(id), self.payloads.get(&id)) else {
            return Ok(None);
        };
        Ok(Some(AssetRecord {
            info: info.clone(),
            data: data.clone(),
            thumbnail: thumbnail.clone(),
        }))
    }

    fn remove(&mut self, id: AssetId) -> Result<bool, AssetError> {
        self.payloads.remove(&id);
        Ok(self.index.remove(id).is_some())
    }

    fn index(&self) -> &AssetIndex {
        &self.index
    }
}

// ============================================================================
// DISK BACKEND
// ============================================================================

const META_EXT: &str = "meta";
const DATA_EXT: &str = "data";
const THUMB_EXT: &str = "thumb";
const TMP_EXT: &str = "tmp";

/// One directory, three files per record: `<id>.data`, `<id>.thumb`
/// (optional) and `<id>.meta`.  The metadata file is written last; a
/// record without one does not exist.
pub struct DiskBackend {
    root: PathBuf,
    index: AssetIndex,
}

impl DiskBackend {
    /// Open (creating if needed) a store rooted at `root` and rebuild the
    /// index from its metadata files.
    pub fn open(root: &Path) -> Result<Self, AssetError> {
        fs::create_dir_all(root)?;
        let mut index = AssetIndex::default();
        let mut skipped = 0usize;
        for entry in fs::read_dir(root)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(TMP_EXT) => {
                    let _ = fs::remove_file(&path);
                }
                Some(META_EXT) => match fs::read(&path).map_err(AssetError::from).and_then(|b| {
                    bincode::deserialize::<AssetInfo>(&b).map_err(AssetError::from)
                }) {
                    Ok(info) => index.insert(info),
                    Err(e) => {
                        skipped += 1;
                        log_warn!("Asset store: skipping {}: {}", path.display(), e);
                    }
                },
                _ => {}
            }
        }
        log_info!(
            "Asset store: opened {} ({} records, {} unreadable)",
            root.display(),
            index.len(),
            skipped
        );
        Ok(Self { root: root.to_path_buf(), index })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file(&self, id: AssetId, ext: &str) -> PathBuf {
        self.root.join(format!("{}.{}", id, ext))
    }

    fn write_atomic(&self, id: AssetId, ext: &str, bytes: &[u8]) -> Result<(), AssetError> {
        let target = self.file(id, ext);
        let tmp = self.root.join(format!("{}.{}.{}", id, ext, TMP_EXT));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &target).inspect_err(|_| {
            let _ = fs::remove_file(&tmp);
        })?;
        Ok(())
    }

    fn write_meta(&self, info: &AssetInfo) -> Result<(), AssetError> {
        let bytes = bincode::serialize(info)?;
        self.write_atomic(info.id, META_EXT, &bytes)
    }
}

impl AssetBackend for DiskBackend {
    fn put(&mut self, record: AssetRecord) -> Result<(), AssetError> {
        let id = record.info.id;
        self.write_atomic(id, DATA_EXT, &record.data)?;
        match &record.thumbnail {
            Some(thumb) => self.write_atomic(id, THUMB_EXT, thumb)?,
            None => {
                let stale = self.file(id, THUMB_EXT);
                if stale.exists() {
                    fs::remove_file(stale)?;
                }
            }
        }
        self.write_meta(&record.info)?;
        self.index.insert(record.info);
        Ok(())
    }

    fn put_info(&mut self, info: AssetInfo) -> Result<(), AssetError> {
        if !self.index.contains(info.id) {
            return Err(AssetError::NotFound(info.id));
        }
        self.write_meta(&info)?;
        self.index.insert(info);
        Ok(())
    }

    fn get(&self, id: AssetId) -> Result<Option<AssetRecord>, AssetError> {
        let Some(info) = self.index.get(id) else {
            return Ok(None);
        };
        let data = fs::read(self.file(id, DATA_EXT))?;
        let thumb_path = self.file(id, THUMB_EXT);
        let thumbnail = if thumb_path.exists() { Some(fs::read(thumb_path)?) } else { None };
        Ok(Some(AssetRecord { info: info.clone(), data, thumbnail }))
    }

    fn remove(&mut self, id: AssetId) -> Result<bool, AssetError> {
        if !self.index.contains(id) {
            return Ok(false);
        }
        // Metadata goes first: once it is gone the record no longer exists.
        fs::remove_file(self.file(id, META_EXT))?;
        self.index.remove(id);
        for ext in [DATA_EXT, THUMB_EXT] {
            let path = self.file(id, ext);
            if path.exists()
                && let Err(e) = fs::remove_file(&path)
            {
                log_warn!("Asset store: could not remove {}: {}", path.display(), e);
            }
        }
        Ok(true)
    }

    fn index(&self) -> &AssetIndex {
        &self.index
    }
}
