//! Layered token-image engine: compositing, undo history, pixel filters,
//! segmentation masks and a deduplicating asset store.
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]

#[macro_use]
pub mod logger;
pub mod assets;
pub mod canvas;
pub mod cli;
pub mod compositor;
pub mod history;
pub mod io;
pub mod ops;
pub mod pool;
pub mod project;
pub mod settings;

pub use assets::{AssetError, AssetId, AssetStore};
pub use canvas::{BlendMode, CanvasError, CanvasState, Layer, LayerId, LayerKind, Surface};
pub use history::{HistoryError, HistoryManager};
pub use pool::SurfacePool;
pub use project::{Document, DocumentError};
pub use settings::EngineSettings;
