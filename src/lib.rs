//! Thumbnail generation and caching pipeline.
//!
//! Turns a reference to a full-resolution picture (or a group of pictures)
//! into a small rendered preview, reuses previously generated previews when
//! they are still current, persists previews to disk, and does all of the
//! work on background workers that are safe to cancel and re-target.
//!
//! The building blocks:
//! - [`loader`]: decode + rotate a source image with progress and
//!   cooperative cancellation
//! - [`cache`]: in-memory LRU of recently decoded rasters
//! - [`scaler`]: scale a raster into a bounding box and re-encode as JPEG
//! - [`policy`]: pure reuse-vs-regenerate decision over an existing preview
//! - [`slot`]: the observable cell a node's current preview lives in
//! - [`compose`]: collage previews for group nodes
//! - [`queue`]: the worker pool tying it all together

pub mod cache;
pub mod compose;
pub mod config;
pub mod error;
pub mod loader;
pub mod model;
pub mod policy;
pub mod queue;
pub mod scaler;
pub mod slot;

pub use cache::{DecodedImage, DecodedImageCache};
pub use config::{CollageSettings, RenderConfig, ScaleMode};
pub use error::LoadError;
pub use loader::{CancelToken, LoadProgress, LoadStatus, SourceLoader};
pub use model::{GroupNode, Node, NodeEvent, PictureNode};
pub use policy::{Decision, PreviewProbe, ReconcileInputs};
pub use queue::RenderQueue;
pub use slot::{Slot, SlotImage, SlotRef};
