use image::RgbaImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assets::{AssetError, AssetId, AssetStore, AssetType, NewAsset};
use crate::canvas::{BlendMode, CanvasError, CanvasState, Layer, LayerId, LayerKind, LayerUpdate, Surface, Transform};
use crate::compositor;
use crate::history::{EncodedSurface, HistoryError, HistoryManager};
use crate::ops::FilterError;
use crate::pool::{PoolError, SurfacePool};
use crate::settings::EngineSettings;

/// Label of the baseline history entry every document starts with.
pub const INITIAL_ACTION: &str = "New document";

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error(transparent)]
    Canvas(#[from] CanvasError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Asset(#[from] AssetError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Filter(#[from] FilterError),
}

impl DocumentError {
    pub fn is_not_found(&self) -> bool {
        match self {
            DocumentError::Asset(e) => e.is_not_found(),
            DocumentError::Canvas(CanvasError::LayerNotFound(_)) => true,
            _ => false,
        }
    }
}

/// A layer stored as a reusable preset asset.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerPreset {
    pub name: String,
    pub kind: LayerKind,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub transform: Transform,
    pub surface: EncodedSurface,
}

/// Single open document.
pub struct Document {
    pub id: Uuid,
    pub name: String,
    pub canvas: CanvasState,
    pub history: HistoryManager,
    pub is_dirty: bool,
}

impl Document {
    pub fn new(name: impl Into<String>, width: u32, height: u32, settings: &EngineSettings) -> Result<Self, DocumentError> {
        let mut doc = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            canvas: CanvasState::new(width, height)?,
            history: HistoryManager::from_settings(settings),
            is_dirty: false,
        };
        doc.history.push_state(INITIAL_ACTION, &doc.canvas)?;
        doc.canvas.dirty = false;
        Ok(doc)
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
        self.canvas.dirty = false;
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }

    /// Snapshot the current state under `label`.
    ///
    /// If the snapshot fails, the canvas is rolled back to the last
    /// committed entry: an edit never stays on the canvas without a history
    /// entry for it.
    pub fn commit(&mut self, pool: &mut SurfacePool, label: &str) -> Result<(), DocumentError> {
        if let Err(e) = self.history.push_state(label, &self.canvas) {
            log_err!("Document '{}': could not record '{}': {}", self.name, label, e);
            if let Err(restore) = self.history.restore_current(&mut self.canvas, pool) {
                log_err!("Document '{}': rollback failed: {}", self.name, restore);
            }
            return Err(e.into());
        }
        self.mark_dirty();
        Ok(())
    }

    /// `commit` for operations that hold no pooled surfaces.  Rollback
    /// surfaces are allocated fresh and dropped.
    fn commit_unpooled(&mut self, label: &str) -> Result<(), DocumentError> {
        self.commit(&mut SurfacePool::new(0), label)
    }

    // ========================================================================
    // LAYER OPERATIONS
    // ========================================================================

    pub fn add_layer(&mut self, layer: Layer) -> Result<LayerId, DocumentError> {
        let id = layer.id;
        self.canvas.add_layer(layer);
        self.commit_unpooled("Add layer")?;
        Ok(id)
    }

    /// New transparent canvas-sized drawing layer.
    pub fn add_blank_layer(&mut self, pool: &mut SurfacePool, name: &str) -> Result<LayerId, DocumentError> {
        let surface = pool.acquire_cleared(self.canvas.width, self.canvas.height)?;
        self.add_layer(Layer::new(name, LayerKind::Drawing, surface))
    }

    /// Image layer holding a copy of `image`, drawn at its native size.
    pub fn add_image_layer(
        &mut self,
        pool: &mut SurfacePool,
        name: &str,
        image: &RgbaImage,
        source_asset: Option<AssetId>,
    ) -> Result<LayerId, DocumentError> {
        let mut surface = pool.acquire(image.width(), image.height())?;
        surface.image_mut().copy_from_slice(image.as_raw());
        let kind = LayerKind::Image {
            source_asset,
            filename: Some(name.to_string()),
        };
        self.add_layer(Layer::new(name, kind, surface))
    }

    pub fn remove_layer(&mut self, pool: &mut SurfacePool, id: LayerId) -> Result<(), DocumentError> {
        let removed = self.canvas.remove_layer(id)?;
        pool.release(removed.into_surface());
        self.commit(pool, "Delete layer")
    }

    pub fn update_layer(&mut self, id: LayerId, update: LayerUpdate) -> Result<(), DocumentError> {
        self.canvas.update_layer(id, update)?;
        self.commit_unpooled("Layer properties")
    }

    pub fn reorder_layer(&mut self, id: LayerId, position: usize) -> Result<(), DocumentError> {
        self.canvas.reorder_layer(id, position)?;
        self.commit_unpooled("Reorder layers")
    }

    pub fn duplicate_layer(&mut self, pool: &mut SurfacePool, id: LayerId) -> Result<(), DocumentError> {
        self.canvas.duplicate_layer(id, pool)?;
        self.commit(pool, "Duplicate layer")
    }

    pub fn merge_down(&mut self, pool: &mut SurfacePool, id: LayerId) -> Result<(), DocumentError> {
        self.canvas.merge_down(id, pool)?;
        self.commit(pool, "Merge down")
    }

    pub fn flatten(&mut self, pool: &mut SurfacePool) -> Result<(), DocumentError> {
        self.canvas.flatten_all(pool)?;
        self.commit(pool, "Flatten image")
    }

    /// Run a filter over one layer.  A result of a different size replaces
    /// the layer surface; the old one goes back to the pool.
    pub fn apply_filter<F>(&mut self, pool: &mut SurfacePool, id: LayerId, label: &str, filter: F) -> Result<(), DocumentError>
    where
        F: FnOnce(&RgbaImage) -> Result<RgbaImage, FilterError>,
    {
        let layer = self.canvas.layer_mut(id).ok_or(CanvasError::LayerNotFound(id))?;
        if layer.locked {
            return Err(CanvasError::LayerLocked(id).into());
        }
        let out = filter(layer.image())?;
        if out.dimensions() == layer.image().dimensions() {
            layer.pixels_mut()?.copy_from_slice(out.as_raw());
        } else {
            let old = layer.replace_surface(Surface::from_image(out))?;
            pool.release(old);
        }
        self.canvas.dirty = true;
        self.commit(pool, label)
    }

    // ========================================================================
    // HISTORY
    // ========================================================================

    /// Returns the label of the entry now current, or `None` at the oldest.
    pub fn undo(&mut self, pool: &mut SurfacePool) -> Result<Option<String>, DocumentError> {
        let label = self.history.undo_into(&mut self.canvas, pool)?;
        if label.is_some() {
            self.mark_dirty();
        }
        Ok(label)
    }

    pub fn redo(&mut self, pool: &mut SurfacePool) -> Result<Option<String>, DocumentError> {
        let label = self.history.redo_into(&mut self.canvas, pool)?;
        if label.is_some() {
            self.mark_dirty();
        }
        Ok(label)
    }

    // ========================================================================
    // OUTPUT + LIFECYCLE
    // ========================================================================

    /// Flatten over the background colour into a pooled surface.  Release
    /// the surface when done with it.
    pub fn render(&self, pool: &mut SurfacePool) -> Result<Surface, DocumentError> {
        let mut target = pool.acquire(self.canvas.width, self.canvas.height)?;
        let layers = self.canvas.layers_in_paint_order();
        compositor::compose_over_background(&layers, self.canvas.background, target.image_mut());
        Ok(target)
    }

    /// Drop all layers and history, leaving an empty canvas of the same size.
    pub fn new_project(&mut self, pool: &mut SurfacePool) -> Result<(), DocumentError> {
        self.canvas.clear_layers(pool);
        self.history.clear();
        self.history.push_state(INITIAL_ACTION, &self.canvas)?;
        self.mark_clean();
        log_info!("Document '{}': new project", self.name);
        Ok(())
    }

    // ========================================================================
    // LAYER PRESETS
    // ========================================================================

    pub fn save_layer_preset(&self, store: &mut AssetStore, id: LayerId, name: &str) -> Result<AssetId, DocumentError> {
        let layer = self.canvas.layer(id).ok_or(CanvasError::LayerNotFound(id))?;
        let preset = LayerPreset {
            name: name.to_string(),
            kind: layer.kind.clone(),
            opacity: layer.opacity,
            blend_mode: layer.blend_mode,
            transform: layer.transform,
            surface: EncodedSurface::encode_lossless(layer.image())?,
        };
        let bytes = bincode::serialize(&preset).map_err(AssetError::from)?;
        let new = NewAsset::new(AssetType::Preset, format!("{}.preset", name), bytes).in_project(self.id.to_string());
        let options = store.default_options();
        Ok(store.save(new, options)?)
    }

    /// Add the layer stored in preset `asset` on top of the stack.
    pub fn load_layer_preset(&mut self, store: &mut AssetStore, pool: &mut SurfacePool, asset: AssetId) -> Result<LayerId, DocumentError> {
        let record = store.get_by_id(asset)?;
        if record.info.asset_type != AssetType::Preset {
            return Err(AssetError::InvalidInput(format!("{} is not a layer preset", asset)).into());
        }
        let preset: LayerPreset = bincode::deserialize(&record.data).map_err(AssetError::from)?;
        let image = preset.surface.decode()?;
        let mut surface = pool.acquire(image.width(), image.height())?;
        surface.image_mut().copy_from_slice(image.as_raw());

        let mut layer = Layer::new(preset.name, preset.kind, surface);
        layer.opacity = preset.opacity;
        layer.blend_mode = preset.blend_mode;
        layer.transform = preset.transform;
        let id = layer.id;
        self.canvas.add_layer(layer);
        self.commit(pool, "Load preset")?;
        store.record_usage(asset, Some(&self.id.to_string()))?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn doc() -> (Document, SurfacePool) {
        let doc = Document::new("Token", 4, 4, &EngineSettings::default()).expect("document");
        (doc, SurfacePool::new(8))
    }

    #[test]
    fn starts_clean_with_baseline_entry() {
        let (doc, _) = doc();
        assert!(!doc.is_dirty);
        assert_eq!(doc.display_title(), "Token");
        assert_eq!(doc.history.labels(), vec![INITIAL_ACTION]);
        assert!(!doc.history.can_undo());
    }

    #[test]
    fn operations_mark_dirty_and_commit() {
        let (mut doc, mut pool) = doc();
        let id = doc.add_blank_layer(&mut pool, "Ink").expect("add");
        assert!(doc.is_dirty);
        assert_eq!(doc.display_title(), "Token*");
        doc.update_layer(id, LayerUpdate { opacity: Some(0.5), ..LayerUpdate::default() }).expect("update");
        assert_eq!(doc.history.labels(), vec![INITIAL_ACTION, "Add layer", "Layer properties"]);
    }

    #[test]
    fn undo_redo_restores_layers() {
        let (mut doc, mut pool) = doc();
        let id = doc.add_blank_layer(&mut pool, "Ink").expect("add");
        doc.remove_layer(&mut pool, id).expect("remove");
        assert!(doc.canvas.layers.is_empty());

        assert_eq!(doc.undo(&mut pool).expect("undo").as_deref(), Some("Add layer"));
        assert_eq!(doc.canvas.layers.len(), 1);
        assert_eq!(doc.canvas.layers[0].id, id);
        assert_eq!(doc.undo(&mut pool).expect("undo").as_deref(), Some(INITIAL_ACTION));
        assert!(doc.canvas.layers.is_empty());
        assert_eq!(doc.undo(&mut pool).expect("undo"), None);
        assert_eq!(doc.redo(&mut pool).expect("redo").as_deref(), Some("Add layer"));
        assert_eq!(doc.canvas.layers.len(), 1);
    }

    #[test]
    fn filter_changes_pixels_and_size() {
        let (mut doc, mut pool) = doc();
        let img = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        let id = doc.add_image_layer(&mut pool, "Art", &img, None).expect("add");
        let before = doc.canvas.layer(id).expect("layer").version();

        doc.apply_filter(&mut pool, id, "Invert", |i| {
            Ok(crate::ops::map_pixels(i, |r, g, b, a| (255.0 - r, 255.0 - g, 255.0 - b, a)))
        })
        .expect("filter");
        let layer = doc.canvas.layer(id).expect("layer");
        assert!(layer.version() > before);
        assert_eq!(*layer.image().get_pixel(0, 0), Rgba([245, 235, 225, 255]));

        doc.apply_filter(&mut pool, id, "Pad", |i| {
            crate::ops::canvas_ops::pad(i, crate::ops::canvas_ops::Padding::uniform(1), Rgba([0, 0, 0, 0]))
        })
        .expect("pad");
        assert_eq!(doc.canvas.layer(id).expect("layer").image().dimensions(), (6, 6));
        assert_eq!(doc.history.current_label(), Some("Pad"));
    }

    // JPEG cannot encode anything wider than 65535 pixels, so an opaque
    // layer this wide cannot be snapshotted.
    const UNENCODABLE_WIDTH: u32 = 65_536;

    #[test]
    fn failed_snapshot_rolls_back_added_layer() {
        let (mut doc, mut pool) = doc();
        let wide = RgbaImage::from_pixel(UNENCODABLE_WIDTH, 1, Rgba([9, 9, 9, 255]));
        let err = doc.add_image_layer(&mut pool, "Wide", &wide, None).expect_err("snapshot fails");
        assert!(matches!(err, DocumentError::History(HistoryError::Encode(_))));
        assert!(doc.canvas.layers.is_empty());
        assert_eq!(doc.history.labels(), vec![INITIAL_ACTION]);
        assert!(!doc.is_dirty);
    }

    #[test]
    fn failed_snapshot_rolls_back_filter() {
        let (mut doc, mut pool) = doc();
        let img = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 128]));
        let id = doc.add_image_layer(&mut pool, "Art", &img, None).expect("add");

        let err = doc.apply_filter(&mut pool, id, "Stretch", |_| {
            Ok(RgbaImage::from_pixel(UNENCODABLE_WIDTH, 1, Rgba([255, 255, 255, 255])))
        });
        assert!(matches!(err, Err(DocumentError::History(_))));
        let layer = doc.canvas.layer(id).expect("layer restored");
        assert_eq!(layer.image(), &img);
        assert_eq!(doc.history.current_label(), Some("Add layer"));

        // Undo still lands on the state before the layer existed.
        assert_eq!(doc.undo(&mut pool).expect("undo").as_deref(), Some(INITIAL_ACTION));
        assert!(doc.canvas.layers.is_empty());
    }

    #[test]
    fn locked_layer_rejects_filter() {
        let (mut doc, mut pool) = doc();
        let id = doc.add_blank_layer(&mut pool, "Ink").expect("add");
        doc.update_layer(id, LayerUpdate { locked: Some(true), ..LayerUpdate::default() }).expect("lock");
        let err = doc.apply_filter(&mut pool, id, "Blur", |i| Ok(i.clone()));
        assert!(matches!(err, Err(DocumentError::Canvas(CanvasError::LayerLocked(_)))));
    }

    #[test]
    fn render_uses_background() {
        let (mut doc, mut pool) = doc();
        doc.canvas.background = Rgba([0, 0, 255, 255]);
        let mut img = RgbaImage::new(4, 4);
        img.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        doc.add_image_layer(&mut pool, "Dot", &img, None).expect("add");
        let out = doc.render(&mut pool).expect("render");
        assert_eq!(*out.image().get_pixel(0, 0), Rgba([255, 0, 0, 255]));
        assert_eq!(*out.image().get_pixel(3, 3), Rgba([0, 0, 255, 255]));
        assert!(pool.release(out));
    }

    #[test]
    fn new_project_resets() {
        let (mut doc, mut pool) = doc();
        doc.add_blank_layer(&mut pool, "A").expect("add");
        doc.add_blank_layer(&mut pool, "B").expect("add");
        doc.new_project(&mut pool).expect("reset");
        assert!(doc.canvas.layers.is_empty());
        assert!(!doc.is_dirty);
        assert_eq!(doc.history.len(), 1);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn layer_preset_round_trip() {
        let (mut doc, mut pool) = doc();
        let mut store = AssetStore::in_memory();
        let img = RgbaImage::from_fn(2, 3, |x, y| Rgba([x as u8 * 100, y as u8 * 80, 7, 128]));
        let id = doc.add_image_layer(&mut pool, "Frame", &img, None).expect("add");
        doc.update_layer(
            id,
            LayerUpdate {
                opacity: Some(0.25),
                blend_mode: Some(BlendMode::Multiply),
                ..LayerUpdate::default()
            },
        )
        .expect("update");

        let asset = doc.save_layer_preset(&mut store, id, "gold frame").expect("save preset");
        assert_eq!(store.info(asset).expect("info").asset_type, AssetType::Preset);

        let loaded = doc.load_layer_preset(&mut store, &mut pool, asset).expect("load");
        let layer = doc.canvas.layer(loaded).expect("layer");
        assert_ne!(loaded, id);
        assert_eq!(layer.name, "gold frame");
        assert_eq!(layer.opacity, 0.25);
        assert_eq!(layer.blend_mode, BlendMode::Multiply);
        assert_eq!(layer.image(), &img);
        assert_eq!(store.info(asset).expect("info").usage.usage_count, 1);
    }

    #[test]
    fn missing_preset_is_not_found() {
        let (mut doc, mut pool) = doc();
        let mut store = AssetStore::in_memory();
        let err = doc
            .load_layer_preset(&mut store, &mut pool, Uuid::new_v4())
            .expect_err("missing preset");
        assert!(err.is_not_found());
    }
}
