// ============================================================================
// HISTORY MANAGER — cursor-based snapshot history with encoded surfaces
// ============================================================================
//
// Every entry is a full snapshot of the editable state.  Layer surfaces are
// stored encoded: PNG when the surface has any non-opaque pixel, JPEG
// otherwise.  Unchanged layers (same id and version as an earlier snapshot or
// restore) share the earlier encoding through an `Arc`, so an opaque layer is
// never re-encoded from a previously decoded lossy copy.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::{ImageFormat, Rgba, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::canvas::{
    BlendMode, CanvasState, Layer, LayerId, LayerKind, Surface, Transform, ToolSettings, next_layer_version,
};
use crate::io;
use crate::pool::{PoolError, SurfacePool};
use crate::settings::EngineSettings;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("failed to encode layer surface: {0}")]
    Encode(#[source] image::ImageError),
    #[error("failed to decode layer surface: {0}")]
    Decode(#[source] image::ImageError),
    #[error("decoded surface is {got:?}, expected {expected:?}")]
    DimensionMismatch { expected: (u32, u32), got: (u32, u32) },
    #[error(transparent)]
    Pool(#[from] PoolError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurfaceFormat {
    Png,
    Jpeg,
}

/// A layer surface flattened to a compressed image.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncodedSurface {
    pub format: SurfaceFormat,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

impl EncodedSurface {
    /// PNG if any pixel is not fully opaque, JPEG at `jpeg_quality` otherwise.
    pub fn encode(surface: &Surface, jpeg_quality: u8) -> Result<Self, HistoryError> {
        let image = surface.image();
        if surface.is_fully_opaque() {
            Ok(Self {
                format: SurfaceFormat::Jpeg,
                width: image.width(),
                height: image.height(),
                bytes: io::encode_jpeg(image, jpeg_quality).map_err(HistoryError::Encode)?,
            })
        } else {
            Self::encode_lossless(image)
        }
    }

    pub fn encode_lossless(image: &RgbaImage) -> Result<Self, HistoryError> {
        Ok(Self {
            format: SurfaceFormat::Png,
            width: image.width(),
            height: image.height(),
            bytes: io::encode_png(image).map_err(HistoryError::Encode)?,
        })
    }

    pub fn decode(&self) -> Result<RgbaImage, HistoryError> {
        let format = match self.format {
            SurfaceFormat::Png => ImageFormat::Png,
            SurfaceFormat::Jpeg => ImageFormat::Jpeg,
        };
        let image = io::decode_rgba_as(&self.bytes, format).map_err(HistoryError::Decode)?;
        if image.dimensions() != (self.width, self.height) {
            return Err(HistoryError::DimensionMismatch {
                expected: (self.width, self.height),
                got: image.dimensions(),
            });
        }
        Ok(image)
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Layer metadata plus its encoded surface.
#[derive(Clone, Debug)]
pub struct SerializedLayer {
    pub id: LayerId,
    pub name: String,
    pub kind: LayerKind,
    pub visible: bool,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub z_index: i32,
    pub transform: Transform,
    pub locked: bool,
    pub surface: Arc<EncodedSurface>,
}

impl SerializedLayer {
    fn from_layer(layer: &Layer, surface: Arc<EncodedSurface>) -> Self {
        Self {
            id: layer.id,
            name: layer.name.clone(),
            kind: layer.kind.clone(),
            visible: layer.visible,
            opacity: layer.opacity,
            blend_mode: layer.blend_mode,
            z_index: layer.z_index,
            transform: layer.transform,
            locked: layer.locked,
            surface,
        }
    }

    /// Rebuild a live layer around an already-decoded surface.
    pub(crate) fn to_layer(&self, surface: crate::canvas::Surface) -> Layer {
        let mut layer = Layer::with_id(self.id, self.name.clone(), self.kind.clone(), surface);
        layer.visible = self.visible;
        layer.opacity = self.opacity;
        layer.blend_mode = self.blend_mode;
        layer.z_index = self.z_index;
        layer.transform = self.transform;
        layer.locked = self.locked;
        layer
    }
}

/// One snapshot of the full editable state.
#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub layers: Vec<SerializedLayer>,
    pub canvas_size: (u32, u32),
    pub background: [u8; 4],
    pub tool_settings: ToolSettings,
    pub active_layer: Option<LayerId>,
}

/// Undo/redo history with a cursor, an entry cap and a memory budget.
pub struct HistoryManager {
    entries: VecDeque<HistoryEntry>,
    /// Index of the current entry; `None` when empty.
    cursor: Option<usize>,
    max_entries: usize,
    max_memory_bytes: usize,
    jpeg_quality: u8,
    coalesce_ms: u64,
    /// Last encoding per layer, keyed by the version it was taken at.
    encode_cache: HashMap<LayerId, (u64, Arc<EncodedSurface>)>,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(50)
    }
}

impl HistoryManager {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: None,
            max_entries: max_entries.max(1),
            max_memory_bytes: 256 * 1024 * 1024,
            jpeg_quality: 92,
            coalesce_ms: 0,
            encode_cache: HashMap::new(),
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        let mut history = Self::new(settings.max_undo_steps);
        history.max_memory_bytes = settings.history_memory_mb.saturating_mul(1024 * 1024);
        history.jpeg_quality = settings.snapshot_jpeg_quality;
        history.coalesce_ms = settings.history_coalesce_ms;
        history
    }

    pub fn with_memory_limit(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    pub fn with_coalesce_window(mut self, ms: u64) -> Self {
        self.coalesce_ms = ms;
        self
    }

    /// Snapshot `canvas` as a new entry labelled `action`.
    ///
    /// Drops any redo branch, then evicts the oldest entries while over the
    /// entry cap or the memory budget.  Takes `&mut self`, so pushes are
    /// applied strictly in call order.
    pub fn push_state(&mut self, action: &str, canvas: &CanvasState) -> Result<(), HistoryError> {
        let entry = self.snapshot(action, canvas)?;

        if self.should_coalesce(action, entry.timestamp) {
            self.entries.pop_back();
        } else if let Some(c) = self.cursor {
            self.entries.truncate(c + 1);
        }
        self.entries.push_back(entry);
        self.cursor = Some(self.entries.len() - 1);
        self.prune();
        Ok(())
    }

    fn should_coalesce(&self, action: &str, now: DateTime<Utc>) -> bool {
        if self.coalesce_ms == 0 || self.can_redo() {
            return false;
        }
        match self.current() {
            Some(current) => {
                current.action == action
                    && (now - current.timestamp).num_milliseconds() < self.coalesce_ms as i64
            }
            None => false,
        }
    }

    fn snapshot(&mut self, action: &str, canvas: &CanvasState) -> Result<HistoryEntry, HistoryError> {
        let quality = self.jpeg_quality;
        let cache = &self.encode_cache;
        let encoded: Vec<Arc<EncodedSurface>> = canvas
            .layers
            .par_iter()
            .map(|layer| match cache.get(&layer.id) {
                Some((version, enc)) if *version == layer.version() => Ok(Arc::clone(enc)),
                _ => EncodedSurface::encode(layer.surface(), quality).map(Arc::new),
            })
            .collect::<Result<_, _>>()?;

        let mut cache = HashMap::with_capacity(canvas.layers.len());
        let mut layers = Vec::with_capacity(canvas.layers.len());
        for (layer, enc) in canvas.layers.iter().zip(encoded) {
            cache.insert(layer.id, (layer.version(), Arc::clone(&enc)));
            layers.push(SerializedLayer::from_layer(layer, enc));
        }
        self.encode_cache = cache;

        Ok(HistoryEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            layers,
            canvas_size: (canvas.width, canvas.height),
            background: canvas.background.0,
            tool_settings: canvas.tool_settings.clone(),
            active_layer: canvas.active_layer,
        })
    }

    fn prune(&mut self) {
        let mut evicted = 0usize;
        // Prune by count, then by memory.  The current entry is never evicted.
        while self.entries.len() > self.max_entries
            || (self.entries.len() > 1 && self.memory_usage() > self.max_memory_bytes)
        {
            if self.cursor == Some(0) {
                break;
            }
            self.entries.pop_front();
            self.cursor = self.cursor.map(|c| c.saturating_sub(1));
            evicted += 1;
        }
        if evicted > 0 {
            log_info!("History: evicted {} oldest entries", evicted);
        }
    }

    /// Step back one entry.  `None` (and no change) at the oldest entry.
    pub fn undo(&mut self) -> Option<&HistoryEntry> {
        match self.cursor {
            Some(c) if c > 0 => {
                self.cursor = Some(c - 1);
                self.entries.get(c - 1)
            }
            _ => None,
        }
    }

    /// Step forward one entry.  `None` (and no change) at the newest entry.
    pub fn redo(&mut self) -> Option<&HistoryEntry> {
        match self.cursor {
            Some(c) if c + 1 < self.entries.len() => {
                self.cursor = Some(c + 1);
                self.entries.get(c + 1)
            }
            _ => None,
        }
    }

    /// Undo and restore the resulting entry into `canvas`.  On error the
    /// cursor and the canvas are left untouched.
    pub fn undo_into(&mut self, canvas: &mut CanvasState, pool: &mut SurfacePool) -> Result<Option<String>, HistoryError> {
        match self.cursor {
            Some(c) if c > 0 => self.move_to(c - 1, canvas, pool).map(Some),
            _ => Ok(None),
        }
    }

    pub fn redo_into(&mut self, canvas: &mut CanvasState, pool: &mut SurfacePool) -> Result<Option<String>, HistoryError> {
        match self.cursor {
            Some(c) if c + 1 < self.entries.len() => self.move_to(c + 1, canvas, pool).map(Some),
            _ => Ok(None),
        }
    }

    /// Undo `steps` entries at once (clamped to the oldest entry).
    pub fn undo_to(&mut self, steps: usize, canvas: &mut CanvasState, pool: &mut SurfacePool) -> Result<Option<String>, HistoryError> {
        match self.cursor {
            Some(c) if c > 0 && steps > 0 => self.move_to(c.saturating_sub(steps), canvas, pool).map(Some),
            _ => Ok(None),
        }
    }

    /// Put the current entry back into `canvas`, discarding anything done
    /// to the canvas since it was pushed.
    pub fn restore_current(&mut self, canvas: &mut CanvasState, pool: &mut SurfacePool) -> Result<Option<String>, HistoryError> {
        match self.cursor {
            Some(c) => self.move_to(c, canvas, pool).map(Some),
            None => Ok(None),
        }
    }

    fn move_to(&mut self, index: usize, canvas: &mut CanvasState, pool: &mut SurfacePool) -> Result<String, HistoryError> {
        let Some(entry) = self.entries.get(index) else {
            return Ok(String::new());
        };
        let seeds = restore_entry(entry, canvas, pool).inspect_err(|e| {
            log_err!("History: failed to restore '{}': {}", entry.action, e);
        })?;
        let label = entry.action.clone();
        self.encode_cache = seeds;
        self.cursor = Some(index);
        Ok(label)
    }

    pub fn can_undo(&self) -> bool {
        matches!(self.cursor, Some(c) if c > 0)
    }

    pub fn can_redo(&self) -> bool {
        matches!(self.cursor, Some(c) if c + 1 < self.entries.len())
    }

    /// Cursor position, `-1` when empty.
    pub fn cursor(&self) -> isize {
        self.cursor.map_or(-1, |c| c as isize)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current(&self) -> Option<&HistoryEntry> {
        self.cursor.and_then(|c| self.entries.get(c))
    }

    pub fn current_label(&self) -> Option<&str> {
        self.current().map(|e| e.action.as_str())
    }

    /// Action labels, oldest first.
    pub fn labels(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.action.as_str()).collect()
    }

    /// Encoded bytes held by all entries, counting shared encodings once.
    pub fn memory_usage(&self) -> usize {
        let mut seen = HashSet::new();
        self.entries
            .iter()
            .flat_map(|e| e.layers.iter())
            .filter(|l| seen.insert(Arc::as_ptr(&l.surface)))
            .map(|l| l.surface.byte_len())
            .sum()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = None;
        self.encode_cache.clear();
    }
}

/// Decode every layer of `entry` first, then swap the complete state into
/// `canvas` in one step.  Returns the encode-cache seeds for the restored
/// layers.
fn restore_entry(
    entry: &HistoryEntry,
    canvas: &mut CanvasState,
    pool: &mut SurfacePool,
) -> Result<HashMap<LayerId, (u64, Arc<EncodedSurface>)>, HistoryError> {
    let decoded: Vec<RgbaImage> = entry
        .layers
        .par_iter()
        .map(|l| l.surface.decode())
        .collect::<Result<_, _>>()?;

    let mut surfaces = Vec::with_capacity(decoded.len());
    for image in &decoded {
        match pool.acquire(image.width(), image.height()) {
            Ok(mut surface) => {
                surface.image_mut().copy_from_slice(image.as_raw());
                surfaces.push(surface);
            }
            Err(e) => {
                for s in surfaces {
                    pool.release(s);
                }
                return Err(e.into());
            }
        }
    }

    let mut seeds = HashMap::with_capacity(entry.layers.len());
    let mut layers = Vec::with_capacity(entry.layers.len());
    for (serialized, surface) in entry.layers.iter().zip(surfaces) {
        let mut layer = serialized.to_layer(surface);
        let version = next_layer_version();
        layer.set_version(version);
        seeds.insert(layer.id, (version, Arc::clone(&serialized.surface)));
        layers.push(layer);
    }

    // Nothing below can fail: the swap is all-or-nothing.
    let old = std::mem::replace(&mut canvas.layers, layers);
    for layer in old {
        pool.release(layer.into_surface());
    }
    canvas.width = entry.canvas_size.0;
    canvas.height = entry.canvas_size.1;
    canvas.background = Rgba(entry.background);
    canvas.tool_settings = entry.tool_settings.clone();
    canvas.active_layer = entry
        .active_layer
        .filter(|id| canvas.layers.iter().any(|l| l.id == *id));
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::ToolKind;

    fn canvas_with_layer(c: [u8; 4]) -> (CanvasState, LayerId) {
        let mut canvas = CanvasState::new(8, 8).expect("valid size");
        let layer = Layer::new("base", LayerKind::Drawing, Surface::from_image(RgbaImage::from_pixel(8, 8, Rgba(c))));
        let id = layer.id;
        canvas.add_layer(layer);
        (canvas, id)
    }

    fn assert_cursor_invariant(h: &HistoryManager) {
        let c = h.cursor();
        assert!(c >= -1 && c < h.len() as isize);
        assert_eq!(h.can_undo(), c > 0);
        assert_eq!(h.can_redo(), c < h.len() as isize - 1);
    }

    #[test]
    fn empty_history_has_cursor_minus_one() {
        let mut h = HistoryManager::new(5);
        assert_eq!(h.cursor(), -1);
        assert!(h.undo().is_none());
        assert!(h.redo().is_none());
        assert_cursor_invariant(&h);
    }

    #[test]
    fn undo_then_push_drops_redo_branch() {
        let (canvas, _) = canvas_with_layer([1, 2, 3, 255]);
        let mut h = HistoryManager::new(10);
        for label in ["a", "b", "c"] {
            h.push_state(label, &canvas).expect("push succeeds");
            assert_cursor_invariant(&h);
        }
        assert_eq!(h.undo().map(|e| e.action.clone()), Some("b".to_string()));
        assert!(h.can_redo());
        h.push_state("d", &canvas).expect("push succeeds");
        assert!(!h.can_redo());
        assert_eq!(h.labels(), vec!["a", "b", "d"]);
        assert_cursor_invariant(&h);
    }

    #[test]
    fn unchanged_layers_share_encoding() {
        let (mut canvas, id) = canvas_with_layer([9, 9, 9, 255]);
        let mut h = HistoryManager::new(10);
        h.push_state("one", &canvas).expect("push succeeds");
        let single = h.memory_usage();
        h.push_state("two", &canvas).expect("push succeeds");
        assert_eq!(h.memory_usage(), single);

        canvas
            .layer_mut(id)
            .expect("layer exists")
            .pixels_mut()
            .expect("unlocked")
            .put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        h.push_state("three", &canvas).expect("push succeeds");
        assert!(h.memory_usage() > single);
        // The edited layer now has transparency, so it is stored losslessly.
        assert_eq!(
            h.current().map(|e| e.layers[0].surface.format),
            Some(SurfaceFormat::Png)
        );
    }

    #[test]
    fn restore_is_complete_and_atomic() {
        let (mut canvas, id) = canvas_with_layer([200, 10, 10, 128]);
        let mut pool = SurfacePool::new(8);
        let mut h = HistoryManager::new(10);
        h.push_state("initial", &canvas).expect("push succeeds");

        canvas.set_size(16, 4).expect("valid size");
        canvas.background = Rgba([0, 0, 0, 255]);
        canvas.tool_settings.active_tool = ToolKind::Brush;
        canvas.remove_layer(id).expect("layer exists");
        h.push_state("edited", &canvas).expect("push succeeds");

        let label = h.undo_into(&mut canvas, &mut pool).expect("restore succeeds");
        assert_eq!(label.as_deref(), Some("initial"));
        assert_eq!((canvas.width, canvas.height), (8, 8));
        assert_eq!(canvas.background, Rgba([255, 255, 255, 255]));
        assert_eq!(canvas.tool_settings.active_tool, ToolKind::Select);
        assert_eq!(canvas.active_layer, Some(id));
        let layer = canvas.layer(id).expect("layer restored");
        assert_eq!(*layer.image().get_pixel(3, 3), Rgba([200, 10, 10, 128]));

        let label = h.redo_into(&mut canvas, &mut pool).expect("restore succeeds");
        assert_eq!(label.as_deref(), Some("edited"));
        assert!(canvas.layers.is_empty());
        assert_eq!((canvas.width, canvas.height), (16, 4));
    }

    #[test]
    fn corrupt_entry_leaves_canvas_untouched() {
        let (canvas, _) = canvas_with_layer([1, 1, 1, 255]);
        let mut h = HistoryManager::new(10);
        h.push_state("a", &canvas).expect("push succeeds");
        h.push_state("b", &canvas).expect("push succeeds");
        if let Some(entry) = h.entries.get_mut(0) {
            entry.layers[0].surface = Arc::new(EncodedSurface {
                format: SurfaceFormat::Png,
                width: 8,
                height: 8,
                bytes: vec![1, 2, 3],
            });
        }
        let (mut live, live_id) = canvas_with_layer([5, 5, 5, 255]);
        let mut pool = SurfacePool::new(4);
        assert!(h.undo_into(&mut live, &mut pool).is_err());
        assert_eq!(h.cursor(), 1);
        assert!(live.layer(live_id).is_some());
    }

    #[test]
    fn memory_budget_evicts_oldest_but_keeps_current() {
        let mut h = HistoryManager::new(50).with_memory_limit(1);
        for i in 0..5u8 {
            let (canvas, _) = canvas_with_layer([i, 0, 0, 255]);
            h.push_state("paint", &canvas).expect("push succeeds");
            assert_cursor_invariant(&h);
        }
        assert_eq!(h.len(), 1);
        assert_eq!(h.cursor(), 0);
    }

    #[test]
    fn coalescing_replaces_same_label_entry() {
        let (canvas, _) = canvas_with_layer([1, 1, 1, 255]);
        let mut h = HistoryManager::new(10).with_coalesce_window(60_000);
        h.push_state("stroke", &canvas).expect("push succeeds");
        h.push_state("stroke", &canvas).expect("push succeeds");
        h.push_state("fill", &canvas).expect("push succeeds");
        assert_eq!(h.labels(), vec!["stroke", "fill"]);
    }

    #[test]
    fn undo_to_clamps_at_oldest() {
        let (canvas, _) = canvas_with_layer([1, 1, 1, 255]);
        let (mut live, _) = canvas_with_layer([1, 1, 1, 255]);
        let mut pool = SurfacePool::new(4);
        let mut h = HistoryManager::new(10);
        for label in ["a", "b", "c", "d"] {
            h.push_state(label, &canvas).expect("push succeeds");
        }
        let label = h.undo_to(10, &mut live, &mut pool).expect("restore succeeds");
        assert_eq!(label.as_deref(), Some("a"));
        assert_eq!(h.cursor(), 0);
        assert!(!h.can_undo());
    }

    fn noisy_opaque_canvas() -> (CanvasState, LayerId) {
        let mut state = 0x9e37_79b9u32;
        let image = RgbaImage::from_fn(16, 16, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            let b = state.to_le_bytes();
            Rgba([b[0], b[1], b[2], 255])
        });
        let mut canvas = CanvasState::new(16, 16).expect("valid size");
        let layer = Layer::new("noise", LayerKind::Drawing, Surface::from_image(image));
        let id = layer.id;
        canvas.add_layer(layer);
        (canvas, id)
    }

    #[test]
    fn repeated_undo_redo_does_not_degrade_opaque_layer() {
        let (mut canvas, id) = noisy_opaque_canvas();
        let mut pool = SurfacePool::new(4);
        let mut h = HistoryManager::new(20);
        h.push_state("base", &canvas).expect("push succeeds");
        assert_eq!(h.current().map(|e| e.layers[0].surface.format), Some(SurfaceFormat::Jpeg));
        canvas
            .layer_mut(id)
            .expect("layer exists")
            .pixels_mut()
            .expect("unlocked")
            .put_pixel(3, 3, Rgba([0, 0, 0, 255]));
        h.push_state("edit", &canvas).expect("push succeeds");

        h.undo_into(&mut canvas, &mut pool).expect("restore succeeds");
        let reference = canvas.layer(id).expect("layer exists").image().clone();
        let entry_bytes = h.current().map_or(0, |e| e.layers[0].surface.byte_len());

        for i in 0..5 {
            // The restored layer is unchanged, so its encoding is reused as is.
            h.push_state(&format!("touch {}", i), &canvas).expect("push succeeds");
            assert_eq!(h.memory_usage(), entry_bytes);
            h.undo_into(&mut canvas, &mut pool).expect("restore succeeds");
            assert_eq!(canvas.layer(id).expect("layer exists").image(), &reference);
            h.redo_into(&mut canvas, &mut pool).expect("restore succeeds");
            assert_eq!(canvas.layer(id).expect("layer exists").image(), &reference);
        }
    }

    #[test]
    fn count_cap_eviction_after_undo_keeps_cursor_valid() {
        let (canvas, _) = canvas_with_layer([4, 4, 4, 255]);
        let (mut live, _) = canvas_with_layer([4, 4, 4, 255]);
        let mut pool = SurfacePool::new(4);
        let mut h = HistoryManager::new(3);
        for label in ["a", "b", "c", "d"] {
            h.push_state(label, &canvas).expect("push succeeds");
            assert_cursor_invariant(&h);
        }
        assert_eq!(h.labels(), vec!["b", "c", "d"]);

        h.undo_into(&mut live, &mut pool).expect("restore succeeds");
        h.undo_into(&mut live, &mut pool).expect("restore succeeds");
        assert_eq!(h.cursor(), 0);
        assert_cursor_invariant(&h);

        for label in ["e", "f", "g"] {
            h.push_state(label, &canvas).expect("push succeeds");
            assert_cursor_invariant(&h);
            assert!(!h.can_redo());
        }
        assert_eq!(h.labels(), vec!["e", "f", "g"]);
        assert_eq!(h.cursor(), 2);
        assert_eq!(h.undo_into(&mut live, &mut pool).expect("restore succeeds").as_deref(), Some("f"));
        assert_eq!(h.undo_into(&mut live, &mut pool).expect("restore succeeds").as_deref(), Some("e"));
        assert_eq!(h.undo_into(&mut live, &mut pool).expect("restore succeeds"), None);
    }

    #[test]
    fn restore_current_discards_uncommitted_edits() {
        let (mut canvas, id) = canvas_with_layer([5, 5, 5, 255]);
        let mut pool = SurfacePool::new(4);
        let mut h = HistoryManager::new(5);
        assert_eq!(h.restore_current(&mut canvas, &mut pool).expect("empty history"), None);
        h.push_state("base", &canvas).expect("push succeeds");
        canvas.remove_layer(id).expect("layer exists");
        let label = h.restore_current(&mut canvas, &mut pool).expect("restore succeeds");
        assert_eq!(label.as_deref(), Some("base"));
        assert!(canvas.layer(id).is_some());
        assert_eq!(h.len(), 1);
    }
}
