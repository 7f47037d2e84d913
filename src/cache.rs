//! In-memory cache of recently decoded source images.
//!
//! One instance is shared by all workers so a source requested again shortly
//! after its first decode is served from memory. Entries are evicted LRU
//! until the byte cap is respected, and the whole cache can be dropped in
//! one call when a decode runs out of memory.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, GenericImageView};
use lru::LruCache;
use parking_lot::RwLock;
use tracing::{debug, trace};

/// Estimated bytes per pixel for decoded RGBA rasters.
const BYTES_PER_PIXEL: u64 = 4;

/// Capacity (entry count) for the LRU; the byte cap is the real limit.
const LRU_CAPACITY: usize = 256;

/// A fully decoded, rotated source image.
#[derive(Debug)]
pub struct DecodedImage {
    image: DynamicImage,
    path: PathBuf,
    rotation: f64,
    load_time: Duration,
}

impl DecodedImage {
    pub fn new(image: DynamicImage, path: PathBuf, rotation: f64, load_time: Duration) -> Self {
        Self {
            image,
            path,
            rotation,
            load_time,
        }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rotation(&self) -> f64 {
        self.rotation
    }

    /// How long the decode (and rotation) took.
    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    /// Estimated resident size of the raster.
    pub fn memory_bytes(&self) -> u64 {
        u64::from(self.image.width()) * u64::from(self.image.height()) * BYTES_PER_PIXEL
    }
}

struct Inner {
    entries: LruCache<PathBuf, Arc<DecodedImage>>,
    current_bytes: u64,
}

/// Process-wide cache of decoded images, keyed by source path.
#[derive(Clone)]
pub struct DecodedImageCache {
    inner: Arc<RwLock<Inner>>,
    max_bytes: u64,
}

impl DecodedImageCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                entries: LruCache::new(NonZeroUsize::new(LRU_CAPACITY).unwrap()),
                current_bytes: 0,
            })),
            max_bytes,
        }
    }

    /// Look up a decoded image. The stored rotation must match; a cached
    /// raster rotated differently is useless to the caller.
    pub fn get(&self, path: &Path, rotation: f64) -> Option<Arc<DecodedImage>> {
        let mut inner = self.inner.write();
        match inner.entries.get(&path.to_path_buf()) {
            Some(entry) if entry.rotation() == rotation => {
                trace!(?path, "Decoded cache hit");
                Some(Arc::clone(entry))
            }
            _ => None,
        }
    }

    /// Insert a freshly decoded image, evicting LRU entries until the byte
    /// cap holds. Images larger than the whole cap are not retained.
    pub fn insert(&self, decoded: Arc<DecodedImage>) {
        let bytes = decoded.memory_bytes();
        if bytes > self.max_bytes {
            debug!(path = ?decoded.path(), bytes, "Image larger than cache cap, not caching");
            return;
        }

        let mut inner = self.inner.write();
        while inner.current_bytes + bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.current_bytes =
                        inner.current_bytes.saturating_sub(evicted.memory_bytes());
                    trace!(evicted = ?evicted.path(), "Evicted decoded image");
                }
                None => break,
            }
        }

        let key = decoded.path().to_path_buf();
        if let Some(old) = inner.entries.put(key, decoded) {
            inner.current_bytes = inner.current_bytes.saturating_sub(old.memory_bytes());
        }
        inner.current_bytes += bytes;
    }

    /// Drop one entry, e.g. when its source is known to have changed.
    pub fn remove(&self, path: &Path) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.entries.pop(&path.to_path_buf()) {
            inner.current_bytes = inner.current_bytes.saturating_sub(old.memory_bytes());
        }
    }

    /// Drop everything. Called for out-of-memory recovery.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.current_bytes = 0;
        debug!("Cleared decoded-image cache");
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn memory_usage(&self) -> u64 {
        self.inner.read().current_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn decoded(path: &str, edge: u32) -> Arc<DecodedImage> {
        Arc::new(DecodedImage::new(
            DynamicImage::ImageRgba8(RgbaImage::new(edge, edge)),
            PathBuf::from(path),
            0.0,
            Duration::ZERO,
        ))
    }

    #[test]
    fn test_insert_and_get() {
        let cache = DecodedImageCache::new(1024 * 1024);
        cache.insert(decoded("/pics/a.jpg", 10));
        assert!(cache.get(Path::new("/pics/a.jpg"), 0.0).is_some());
        assert!(cache.get(Path::new("/pics/b.jpg"), 0.0).is_none());
    }

    #[test]
    fn test_rotation_mismatch_misses() {
        let cache = DecodedImageCache::new(1024 * 1024);
        cache.insert(decoded("/pics/a.jpg", 10));
        assert!(cache.get(Path::new("/pics/a.jpg"), 90.0).is_none());
    }

    #[test]
    fn test_byte_cap_evicts_lru() {
        // each 10x10 RGBA image accounts 400 bytes; cap fits two
        let cache = DecodedImageCache::new(900);
        cache.insert(decoded("/pics/a.jpg", 10));
        cache.insert(decoded("/pics/b.jpg", 10));
        cache.insert(decoded("/pics/c.jpg", 10));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(Path::new("/pics/a.jpg"), 0.0).is_none());
        assert!(cache.get(Path::new("/pics/c.jpg"), 0.0).is_some());
        assert!(cache.memory_usage() <= 900);
    }

    #[test]
    fn test_oversized_image_not_cached() {
        let cache = DecodedImageCache::new(100);
        cache.insert(decoded("/pics/huge.jpg", 10));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear() {
        let cache = DecodedImageCache::new(1024 * 1024);
        cache.insert(decoded("/pics/a.jpg", 10));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.memory_usage(), 0);
    }
}
