//! Immutable configuration snapshot passed into each render operation.
//!
//! Workers never read shared mutable settings mid-render; callers hand the
//! queue a `RenderConfig` and every request sees one consistent view.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use once_cell::sync::Lazy;
use xxhash_rust::xxh3::xxh3_64;

/// Default edge length for generated previews in pixels.
pub const DEFAULT_PREVIEW_SIZE: u32 = 350;

/// Default JPEG quality for persisted previews (0-100).
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Default interval workers sleep between polls when the queue is idle.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Default cap on pending render requests.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default byte cap for the decoded-image cache.
pub const DEFAULT_DECODED_CACHE_BYTES: u64 = 192 * 1024 * 1024;

/// Default pixel-memory budget for a single decode (RGBA bytes).
pub const DEFAULT_DECODE_BUDGET_BYTES: u64 = 512 * 1024 * 1024;

/// Scaling trade-off for preview generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMode {
    /// Cheap filter, used while scrolling through large collections.
    Fast,
    /// Higher quality filter for persisted previews.
    Quality,
}

/// Geometry of the collage built for group nodes.
///
/// The grid capacity is a function of the template's content area, the tile
/// size and the margins; see [`crate::compose::CollageLayout`].
#[derive(Debug, Clone)]
pub struct CollageSettings {
    /// Background template image. When `None` a solid background of
    /// `template_size` is synthesized.
    pub template: Option<PathBuf>,
    /// Size of the synthesized background when no template is given.
    pub template_size: (u32, u32),
    /// RGB fill for the synthesized background.
    pub background: [u8; 3],
    /// Edge size of one sampled child tile.
    pub tile_size: (u32, u32),
    /// Unused strip on the left of the template.
    pub left_margin: u32,
    /// Unused strip at the top of the template (title area).
    pub top_margin: u32,
    /// Gap between tiles.
    pub gap: u32,
}

impl Default for CollageSettings {
    fn default() -> Self {
        Self {
            template: None,
            template_size: (350, 295),
            background: [80, 80, 88],
            tile_size: (100, 75),
            left_margin: 15,
            top_margin: 65,
            gap: 10,
        }
    }
}

/// Snapshot of all settings a render request needs.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Desired preview bounding box (width and height).
    pub preview_size: (u32, u32),
    /// JPEG quality used when persisting previews.
    pub jpeg_quality: u8,
    /// Whether previews are persisted to disk at all. When off, rendering
    /// happens in memory only and nothing is written back.
    pub keep_previews_on_disk: bool,
    /// When set, sources smaller than the preview box are not enlarged.
    pub dont_enlarge_small_images: bool,
    /// Filter trade-off for scaling.
    pub scale_mode: ScaleMode,
    /// Idle poll interval for queue workers.
    pub poll_interval: Duration,
    /// Number of worker threads draining the queue.
    pub workers: usize,
    /// Cap on pending render requests; enqueueing beyond it is rejected.
    pub queue_capacity: usize,
    /// Byte cap for the decoded-image cache.
    pub decoded_cache_bytes: u64,
    /// Pixel-memory budget for a single decode.
    pub decode_budget_bytes: u64,
    /// Directory where freshly assigned preview files are created.
    pub preview_dir: PathBuf,
    /// Collage geometry for group nodes.
    pub collage: CollageSettings,
}

impl RenderConfig {
    /// Build a config with defaults rooted at the platform cache directory.
    pub fn new_default() -> Result<Self> {
        Ok(Self::with_preview_dir(Self::default_preview_dir()?))
    }

    /// Build a config with defaults and an explicit preview directory.
    pub fn with_preview_dir(preview_dir: PathBuf) -> Self {
        Self {
            preview_size: (DEFAULT_PREVIEW_SIZE, DEFAULT_PREVIEW_SIZE),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            keep_previews_on_disk: true,
            dont_enlarge_small_images: true,
            scale_mode: ScaleMode::Quality,
            poll_interval: DEFAULT_POLL_INTERVAL,
            workers: 2,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            decoded_cache_bytes: DEFAULT_DECODED_CACHE_BYTES,
            decode_budget_bytes: DEFAULT_DECODE_BUDGET_BYTES,
            preview_dir,
            collage: CollageSettings::default(),
        }
    }

    /// The platform default location for preview files.
    pub fn default_preview_dir() -> Result<PathBuf> {
        static DIR: Lazy<Option<PathBuf>> = Lazy::new(|| {
            ProjectDirs::from("", "", "thumbkit").map(|d| d.cache_dir().join("previews"))
        });
        DIR.clone().context("Failed to determine project directories")
    }

    /// Generate a fresh, unique preview path inside the preview directory.
    ///
    /// Used whenever a node's preview location is unset, malformed or turned
    /// out to be unwritable. The filename hashes the source identity plus a
    /// monotonic counter so repeated reassignments never collide.
    pub fn fresh_preview_path(&self, source: &Path) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let serial = COUNTER.fetch_add(1, Ordering::Relaxed);

        let source_str = source.to_string_lossy();
        let mut data = Vec::with_capacity(source_str.len() + 8);
        data.extend_from_slice(source_str.as_bytes());
        data.extend_from_slice(&serial.to_le_bytes());

        self.preview_dir
            .join(format!("{:016x}.jpg", xxh3_64(&data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_preview_paths_are_unique() {
        let config = RenderConfig::with_preview_dir(PathBuf::from("/tmp/previews"));
        let a = config.fresh_preview_path(Path::new("/pics/one.jpg"));
        let b = config.fresh_preview_path(Path::new("/pics/one.jpg"));
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/previews"));
        assert_eq!(a.extension().unwrap(), "jpg");
    }

    #[test]
    fn test_default_collage_grid_is_nonempty() {
        let c = CollageSettings::default();
        let horizontal = (c.template_size.0 - c.left_margin) / (c.tile_size.0 + c.gap);
        let vertical = (c.template_size.1 - c.top_margin) / (c.tile_size.1 + c.gap);
        assert!(horizontal >= 1);
        assert!(vertical >= 1);
    }
}
