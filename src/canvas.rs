use image::{Rgba, RgbaImage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::compositor;
use crate::pool::SurfacePool;

/// Opaque layer identity.
pub type LayerId = Uuid;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CanvasError {
    #[error("layer {0} not found")]
    LayerNotFound(LayerId),
    #[error("layer {0} is locked")]
    LayerLocked(LayerId),
    #[error("invalid canvas dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
    #[error("layer {0} has no layer below it to merge into")]
    NothingToMerge(LayerId),
}

// ============================================================================
// SURFACE — exclusively owned RGBA8 pixel buffer
// ============================================================================

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a pixel buffer, used by the pool to detect double release.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u64);

impl SurfaceId {
    fn next() -> Self {
        SurfaceId(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// A width×height RGBA8 buffer owned by exactly one layer (or by the pool).
///
/// Cloning copies the pixels into a brand-new buffer with a fresh id, so a
/// duplicated layer never aliases its source.
#[derive(Debug)]
pub struct Surface {
    id: SurfaceId,
    image: RgbaImage,
    /// Dropped with the surface; lets the pool notice unreleased surfaces.
    lease: Arc<()>,
}

impl Clone for Surface {
    fn clone(&self) -> Self {
        Self::from_image(self.image.clone())
    }
}

impl Surface {
    /// Fresh transparent surface.
    pub fn new(width: u32, height: u32) -> Self {
        Self::from_image(RgbaImage::new(width, height))
    }

    pub fn from_image(image: RgbaImage) -> Self {
        Self::with_id(SurfaceId::next(), image)
    }

    /// Reuse an existing id (pool recycling only).
    pub(crate) fn with_id(id: SurfaceId, image: RgbaImage) -> Self {
        Self {
            id,
            image,
            lease: Arc::new(()),
        }
    }

    pub(crate) fn lease(&self) -> Weak<()> {
        Arc::downgrade(&self.lease)
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn image_mut(&mut self) -> &mut RgbaImage {
        &mut self.image
    }

    pub fn into_image(self) -> RgbaImage {
        self.image
    }

    pub(crate) fn into_parts(self) -> (SurfaceId, RgbaImage) {
        (self.id, self.image)
    }

    /// Reset every pixel to transparent black.
    pub fn clear(&mut self) {
        self.fill(Rgba([0, 0, 0, 0]));
    }

    pub fn fill(&mut self, color: Rgba<u8>) {
        for px in self.image.pixels_mut() {
            *px = color;
        }
    }

    /// True if no pixel has alpha below 255.
    pub fn is_fully_opaque(&self) -> bool {
        self.image.as_raw().chunks_exact(4).all(|p| p[3] == 255)
    }

    /// Bytes held by the backing allocation.
    pub fn memory_bytes(&self) -> usize {
        self.image.as_raw().capacity()
    }
}

// ============================================================================
// LAYER MODEL
// ============================================================================

static NEXT_LAYER_VERSION: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonic version source; a version number is never reused.
pub(crate) fn next_layer_version() -> u64 {
    NEXT_LAYER_VERSION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlendMode {
    #[default]
    Normal,
    Multiply,
    Screen,
    Overlay,
    Darken,
    Lighten,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeKind {
    Rectangle,
    Ellipse,
    Line,
}

/// Type-specific layer payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LayerKind {
    Image {
        source_asset: Option<Uuid>,
        filename: Option<String>,
    },
    Text {
        content: String,
        font_family: String,
        font_size: f32,
        color: [u8; 4],
    },
    Shape {
        shape: ShapeKind,
        fill: Option<[u8; 4]>,
        stroke: Option<[u8; 4]>,
        stroke_width: f32,
    },
    Drawing,
}

impl LayerKind {
    pub fn label(&self) -> &'static str {
        match self {
            LayerKind::Image { .. } => "image",
            LayerKind::Text { .. } => "text",
            LayerKind::Shape { .. } => "shape",
            LayerKind::Drawing => "drawing",
        }
    }
}

/// Placement of a layer surface on the canvas.  Rotation is in degrees and
/// turns about the layer's own centre.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
    pub scale_x: f32,
    pub scale_y: f32,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            rotation: 0.0,
            scale_x: 1.0,
            scale_y: 1.0,
        }
    }
}

impl Transform {
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }

    /// Pure integer translation: pixels can be copied without resampling.
    pub fn is_integer_translation(&self) -> bool {
        self.rotation.rem_euclid(360.0) == 0.0
            && self.scale_x == 1.0
            && self.scale_y == 1.0
            && self.x.fract() == 0.0
            && self.y.fract() == 0.0
    }
}

pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub kind: LayerKind,
    pub visible: bool,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    /// Paint-order key.  Renormalised to 0..n after every reorder.
    pub z_index: i32,
    pub transform: Transform,
    pub locked: bool,
    surface: Surface,
    /// Bumped on every pixel mutation; drives re-encode/re-render detection.
    version: u64,
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("z_index", &self.z_index)
            .field("size", &(self.surface.width(), self.surface.height()))
            .field("version", &self.version)
            .finish()
    }
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind, surface: Surface) -> Self {
        Self::with_id(Uuid::new_v4(), name, kind, surface)
    }

    pub(crate) fn with_id(id: LayerId, name: impl Into<String>, kind: LayerKind, surface: Surface) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            visible: true,
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            z_index: 0,
            transform: Transform::default(),
            locked: false,
            surface,
            version: next_layer_version(),
        }
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn image(&self) -> &RgbaImage {
        self.surface.image()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    /// Mutable pixel access.  Fails on a locked layer; bumps the version.
    pub fn pixels_mut(&mut self) -> Result<&mut RgbaImage, CanvasError> {
        if self.locked {
            return Err(CanvasError::LayerLocked(self.id));
        }
        self.version = next_layer_version();
        Ok(self.surface.image_mut())
    }

    /// Swap in a new surface and hand back the old one for the pool.
    pub fn replace_surface(&mut self, surface: Surface) -> Result<Surface, CanvasError> {
        if self.locked {
            return Err(CanvasError::LayerLocked(self.id));
        }
        self.version = next_layer_version();
        Ok(std::mem::replace(&mut self.surface, surface))
    }

    pub(crate) fn into_surface(self) -> Surface {
        self.surface
    }

    /// Copy of this layer with a new id and a cloned (non-aliased) surface.
    fn duplicate_with(&self, surface: Surface) -> Self {
        let mut copy = Layer::new(format!("{} copy", self.name), self.kind.clone(), surface);
        copy.visible = self.visible;
        copy.opacity = self.opacity;
        copy.blend_mode = self.blend_mode;
        copy.transform = self.transform;
        copy
    }
}

/// Property changes for `CanvasState::update_layer`.  `None` leaves the
/// property as is.
#[derive(Clone, Debug, Default)]
pub struct LayerUpdate {
    pub name: Option<String>,
    pub visible: Option<bool>,
    pub opacity: Option<f32>,
    pub blend_mode: Option<BlendMode>,
    pub transform: Option<Transform>,
    pub locked: Option<bool>,
    pub kind: Option<LayerKind>,
}

// ============================================================================
// TOOL SETTINGS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ToolKind {
    #[default]
    Select,
    Move,
    Brush,
    Eraser,
    Fill,
    Text,
    Shape,
    Eyedropper,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSettings {
    pub active_tool: ToolKind,
    pub brush_size: f32,
    pub brush_hardness: f32,
    pub brush_opacity: f32,
    pub primary_color: [u8; 4],
    pub secondary_color: [u8; 4],
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            active_tool: ToolKind::Select,
            brush_size: 10.0,
            brush_hardness: 0.8,
            brush_opacity: 1.0,
            primary_color: [0, 0, 0, 255],
            secondary_color: [255, 255, 255, 255],
        }
    }
}

// ============================================================================
// CANVAS STATE
// ============================================================================

pub struct CanvasState {
    pub width: u32,
    pub height: u32,
    pub background: Rgba<u8>,
    pub layers: Vec<Layer>,
    pub active_layer: Option<LayerId>,
    pub tool_settings: ToolSettings,
    pub dirty: bool,
}

impl CanvasState {
    pub fn new(width: u32, height: u32) -> Result<Self, CanvasError> {
        if width == 0 || height == 0 {
            return Err(CanvasError::InvalidDimensions { width, height });
        }
        Ok(Self {
            width,
            height,
            background: Rgba([255, 255, 255, 255]),
            layers: Vec::new(),
            active_layer: None,
            tool_settings: ToolSettings::default(),
            dirty: false,
        })
    }

    pub fn set_size(&mut self, width: u32, height: u32) -> Result<(), CanvasError> {
        if width == 0 || height == 0 {
            return Err(CanvasError::InvalidDimensions { width, height });
        }
        self.width = width;
        self.height = height;
        self.dirty = true;
        Ok(())
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn layer_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.id == id)
    }

    fn index_of(&self, id: LayerId) -> Result<usize, CanvasError> {
        self.layers
            .iter()
            .position(|l| l.id == id)
            .ok_or(CanvasError::LayerNotFound(id))
    }

    pub fn active_layer(&self) -> Option<&Layer> {
        self.active_layer.and_then(|id| self.layer(id))
    }

    pub fn set_active_layer(&mut self, id: Option<LayerId>) -> Result<(), CanvasError> {
        if let Some(id) = id {
            self.index_of(id)?;
        }
        self.active_layer = id;
        Ok(())
    }

    /// Layers sorted bottom to top by z-index (stable for equal keys).
    pub fn layers_in_paint_order(&self) -> Vec<&Layer> {
        let mut ordered: Vec<&Layer> = self.layers.iter().collect();
        ordered.sort_by_key(|l| l.z_index);
        ordered
    }

    fn paint_order_ids(&self) -> Vec<LayerId> {
        self.layers_in_paint_order().iter().map(|l| l.id).collect()
    }

    /// Rewrite z-indices to the dense sequence 0..n following `order`.
    fn apply_order(&mut self, order: &[LayerId]) {
        for (z, id) in order.iter().enumerate() {
            if let Some(layer) = self.layer_mut(*id) {
                layer.z_index = z as i32;
            }
        }
    }

    fn normalize_z(&mut self) {
        let order = self.paint_order_ids();
        self.apply_order(&order);
    }

    /// Add a layer on top of the stack and make it active.
    pub fn add_layer(&mut self, mut layer: Layer) -> &[Layer] {
        layer.z_index = self.layers.iter().map(|l| l.z_index + 1).max().unwrap_or(0);
        self.active_layer = Some(layer.id);
        self.layers.push(layer);
        self.dirty = true;
        &self.layers
    }

    /// Detach a layer.  The caller owns the returned layer and should hand
    /// its surface back to the pool.
    pub fn remove_layer(&mut self, id: LayerId) -> Result<Layer, CanvasError> {
        let idx = self.index_of(id)?;
        let removed = self.layers.remove(idx);
        if self.active_layer == Some(id) {
            self.active_layer = self.layers_in_paint_order().last().map(|l| l.id);
        }
        self.normalize_z();
        self.dirty = true;
        Ok(removed)
    }

    pub fn update_layer(&mut self, id: LayerId, update: LayerUpdate) -> Result<&[Layer], CanvasError> {
        let idx = self.index_of(id)?;
        let layer = &mut self.layers[idx];
        if let Some(name) = update.name {
            layer.name = name;
        }
        if let Some(visible) = update.visible {
            layer.visible = visible;
        }
        if let Some(opacity) = update.opacity {
            layer.opacity = opacity.clamp(0.0, 1.0);
        }
        if let Some(mode) = update.blend_mode {
            layer.blend_mode = mode;
        }
        if let Some(transform) = update.transform {
            layer.transform = transform;
        }
        if let Some(locked) = update.locked {
            layer.locked = locked;
        }
        if let Some(kind) = update.kind {
            layer.kind = kind;
        }
        self.dirty = true;
        Ok(&self.layers)
    }

    /// Move a layer to `position` in paint order (0 = bottom).  Positions
    /// past the top clamp to the top.
    pub fn reorder_layer(&mut self, id: LayerId, position: usize) -> Result<&[Layer], CanvasError> {
        self.index_of(id)?;
        let mut order = self.paint_order_ids();
        order.retain(|l| *l != id);
        let position = position.min(order.len());
        order.insert(position, id);
        self.apply_order(&order);
        self.dirty = true;
        Ok(&self.layers)
    }

    /// Duplicate a layer directly above its source.  The copy gets its own
    /// pooled surface and becomes active.
    pub fn duplicate_layer(&mut self, id: LayerId, pool: &mut SurfacePool) -> Result<&[Layer], CanvasError> {
        let idx = self.index_of(id)?;
        let source = &self.layers[idx];
        let mut surface = pool
            .acquire(source.surface.width(), source.surface.height())
            .map_err(|_| CanvasError::InvalidDimensions {
                width: source.surface.width(),
                height: source.surface.height(),
            })?;
        surface.image_mut().copy_from_slice(source.surface.image().as_raw());
        let copy = source.duplicate_with(surface);
        let copy_id = copy.id;

        let mut order = self.paint_order_ids();
        let above = order.iter().position(|l| *l == id).map_or(order.len(), |p| p + 1);
        order.insert(above, copy_id);
        self.layers.push(copy);
        self.apply_order(&order);
        self.active_layer = Some(copy_id);
        self.dirty = true;
        Ok(&self.layers)
    }

    /// Merge a layer into the one directly below it in paint order.  The
    /// result keeps the lower layer's id and name at full opacity and is
    /// visible.  Only what was visible is merged: a hidden layer
    /// contributes no pixels, as in `flatten_all`.
    pub fn merge_down(&mut self, id: LayerId, pool: &mut SurfacePool) -> Result<&[Layer], CanvasError> {
        self.index_of(id)?;
        let order = self.paint_order_ids();
        let pos = order.iter().position(|l| *l == id).ok_or(CanvasError::LayerNotFound(id))?;
        if pos == 0 {
            return Err(CanvasError::NothingToMerge(id));
        }
        let below_id = order[pos - 1];
        let below_idx = self.index_of(below_id)?;
        if self.layers[below_idx].locked {
            return Err(CanvasError::LayerLocked(below_id));
        }

        let mut merged = self.acquire_canvas_surface(pool)?;
        {
            let upper = &self.layers[self.index_of(id)?];
            let lower = &self.layers[below_idx];
            compositor::compose(&[lower, upper], merged.image_mut());
        }

        let upper = self.remove_layer(id)?;
        pool.release(upper.into_surface());
        let below_idx = self.index_of(below_id)?;
        let lower = &mut self.layers[below_idx];
        let old = std::mem::replace(&mut lower.surface, merged);
        lower.version = next_layer_version();
        lower.opacity = 1.0;
        lower.blend_mode = BlendMode::Normal;
        lower.transform = Transform::default();
        lower.kind = LayerKind::Drawing;
        lower.visible = true;
        pool.release(old);

        self.active_layer = Some(below_id);
        self.dirty = true;
        Ok(&self.layers)
    }

    /// Collapse every visible layer into a single canvas-sized layer.
    /// Hidden layers are discarded.
    pub fn flatten_all(&mut self, pool: &mut SurfacePool) -> Result<&[Layer], CanvasError> {
        let mut flat = self.acquire_canvas_surface(pool)?;
        {
            let ordered = self.layers_in_paint_order();
            compositor::compose(&ordered, flat.image_mut());
        }
        for layer in self.layers.drain(..) {
            pool.release(layer.into_surface());
        }
        let layer = Layer::new("Flattened", LayerKind::Drawing, flat);
        self.active_layer = Some(layer.id);
        self.layers.push(layer);
        self.dirty = true;
        Ok(&self.layers)
    }

    /// Drop every layer, returning their surfaces to the pool.
    pub fn clear_layers(&mut self, pool: &mut SurfacePool) {
        for layer in self.layers.drain(..) {
            pool.release(layer.into_surface());
        }
        self.active_layer = None;
        self.dirty = true;
    }

    fn acquire_canvas_surface(&self, pool: &mut SurfacePool) -> Result<Surface, CanvasError> {
        pool.acquire_cleared(self.width, self.height)
            .map_err(|_| CanvasError::InvalidDimensions {
                width: self.width,
                height: self.height,
            })
    }
}
