//! Loading, rotating and caching of full-resolution source images.
//!
//! A `SourceLoader` decodes one image at a time. Loading is cooperative:
//! the cancel flag is checked between read chunks and again before the
//! rotate and commit steps, so a superseded load stops quickly and its
//! result is discarded. `stop_unless` is the coalescing primitive the
//! dispatcher uses when a newer request targets the same slot.

use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use image::{DynamicImage, ImageReader, Rgba, RgbaImage};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::cache::{DecodedImage, DecodedImageCache};
use crate::error::LoadError;

/// Read granularity; the cancel flag and progress listener fire per chunk.
const READ_CHUNK: usize = 64 * 1024;

/// Bytes per pixel assumed for the decode memory budget.
const BYTES_PER_PIXEL: u64 = 4;

/// Cooperative abort flag shared between the loader and its callers.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Lifecycle of a single load attempt. Exactly one terminal state
/// (`Ready` or `Error`) is reached per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Uninitialised,
    Loading,
    Rotating,
    Ready,
    Error,
}

/// Progress notifications reported while a source is read from disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadProgress {
    Started,
    /// Percentage of the file read, 0-100.
    Progress(u8),
    Completed,
}

/// Callback invoked with [`LoadProgress`] updates during a load.
pub type ProgressListener = dyn Fn(LoadProgress) + Send + Sync;

struct Inflight {
    path: PathBuf,
    token: CancelToken,
}

/// Decodes source images, applies rotation and feeds the decoded cache.
pub struct SourceLoader {
    cache: DecodedImageCache,
    budget_bytes: u64,
    inflight: Mutex<Option<Inflight>>,
    status: RwLock<LoadStatus>,
}

impl SourceLoader {
    pub fn new(cache: DecodedImageCache, budget_bytes: u64) -> Self {
        Self {
            cache,
            budget_bytes,
            inflight: Mutex::new(None),
            status: RwLock::new(LoadStatus::Uninitialised),
        }
    }

    /// Status of the most recent load attempt.
    pub fn status(&self) -> LoadStatus {
        *self.status.read()
    }

    /// Load `path`, apply `rotation` degrees, and cache the result.
    ///
    /// Served from the decoded cache when the same path and rotation were
    /// decoded recently.
    pub fn load(
        &self,
        path: &Path,
        rotation: f64,
        listener: Option<&ProgressListener>,
    ) -> Result<Arc<DecodedImage>, LoadError> {
        self.load_with_token(path, rotation, CancelToken::new(), listener)
    }

    /// Like [`load`](Self::load) with an externally owned cancel token.
    pub fn load_with_token(
        &self,
        path: &Path,
        rotation: f64,
        token: CancelToken,
        listener: Option<&ProgressListener>,
    ) -> Result<Arc<DecodedImage>, LoadError> {
        let rotation = rotation.rem_euclid(360.0);

        if let Some(cached) = self.cache.get(path, rotation) {
            *self.status.write() = LoadStatus::Ready;
            return Ok(cached);
        }

        *self.inflight.lock() = Some(Inflight {
            path: path.to_path_buf(),
            token: token.clone(),
        });

        let result = self.run_load(path, rotation, &token, listener);

        *self.inflight.lock() = None;
        match &result {
            Ok(_) => *self.status.write() = LoadStatus::Ready,
            Err(e) => {
                if e.is_cancelled() {
                    debug!(?path, "Load cancelled");
                } else {
                    warn!(?path, error = %e, "Load failed");
                }
                *self.status.write() = LoadStatus::Error;
            }
        }
        result
    }

    /// Abort the load currently in progress, if any.
    pub fn stop(&self) {
        if let Some(inflight) = self.inflight.lock().as_ref() {
            debug!(path = ?inflight.path, "Stopping load");
            inflight.token.cancel();
        }
    }

    /// Abort the current load unless it is already loading `keep`.
    /// Returns whether an abort happened.
    pub fn stop_unless(&self, keep: &Path) -> bool {
        let guard = self.inflight.lock();
        match guard.as_ref() {
            Some(inflight) if inflight.path != keep => {
                debug!(loading = ?inflight.path, ?keep, "Stopping superseded load");
                inflight.token.cancel();
                true
            }
            _ => false,
        }
    }

    fn run_load(
        &self,
        path: &Path,
        rotation: f64,
        token: &CancelToken,
        listener: Option<&ProgressListener>,
    ) -> Result<Arc<DecodedImage>, LoadError> {
        *self.status.write() = LoadStatus::Loading;
        let start = Instant::now();
        notify(listener, LoadProgress::Started);

        let bytes = read_with_progress(path, token, listener)?;
        notify(listener, LoadProgress::Completed);

        // Pre-decode dimension probe guards the memory budget; the
        // allocator itself cannot report out-of-memory recoverably.
        let (width, height) = probe_dimensions(path, &bytes)?;
        let required = u64::from(width) * u64::from(height) * BYTES_PER_PIXEL;
        if required > self.budget_bytes {
            self.cache.clear();
            return Err(LoadError::OutOfMemory {
                path: path.to_path_buf(),
                required,
                budget: self.budget_bytes,
            });
        }

        let mut img = image::load_from_memory(&bytes).map_err(|source| LoadError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        drop(bytes);

        if token.is_cancelled() {
            return Err(LoadError::Cancelled);
        }

        if rotation != 0.0 {
            *self.status.write() = LoadStatus::Rotating;
            trace!(?path, rotation, "Rotating");
            img = rotate(&img, rotation);
            if token.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
        }

        let decoded = Arc::new(DecodedImage::new(
            img,
            path.to_path_buf(),
            rotation,
            start.elapsed(),
        ));
        self.cache.insert(Arc::clone(&decoded));
        debug!(?path, elapsed = ?decoded.load_time(), "Loaded source image");
        Ok(decoded)
    }
}

fn notify(listener: Option<&ProgressListener>, progress: LoadProgress) {
    if let Some(listener) = listener {
        listener(progress);
    }
}

/// Read the whole file in chunks, reporting progress and honoring the
/// cancel token between chunks.
fn read_with_progress(
    path: &Path,
    token: &CancelToken,
    listener: Option<&ProgressListener>,
) -> Result<Vec<u8>, LoadError> {
    let io_err = |source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = std::fs::File::open(path).map_err(io_err)?;
    let total = file.metadata().map(|m| m.len()).unwrap_or(0);

    let mut bytes = Vec::with_capacity(total as usize);
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if token.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        let n = file.read(&mut chunk).map_err(io_err)?;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..n]);
        if total > 0 {
            let percent = (bytes.len() as u64 * 100 / total).min(100) as u8;
            notify(listener, LoadProgress::Progress(percent));
        }
    }
    Ok(bytes)
}

fn probe_dimensions(path: &Path, bytes: &[u8]) -> Result<(u32, u32), LoadError> {
    ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .into_dimensions()
        .map_err(|source| LoadError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

/// Rotate about the image center. Right angles use lossless transforms;
/// arbitrary angles re-sample into a canvas sized from the rotated
/// bounding box so no content is clipped. Always returns a fresh buffer.
fn rotate(img: &DynamicImage, degrees: f64) -> DynamicImage {
    debug_assert!((0.0..360.0).contains(&degrees));
    if degrees == 90.0 {
        img.rotate90()
    } else if degrees == 180.0 {
        img.rotate180()
    } else if degrees == 270.0 {
        img.rotate270()
    } else {
        rotate_arbitrary(img, degrees)
    }
}

fn rotate_arbitrary(img: &DynamicImage, degrees: f64) -> DynamicImage {
    let theta = degrees.to_radians();
    let (sin, cos) = theta.sin_cos();

    let src = img.to_rgba8();
    let (w, h) = (f64::from(src.width()), f64::from(src.height()));
    let out_w = (w * cos.abs() + h * sin.abs()).ceil().max(1.0) as u32;
    let out_h = (w * sin.abs() + h * cos.abs()).ceil().max(1.0) as u32;

    let src_cx = (w - 1.0) / 2.0;
    let src_cy = (h - 1.0) / 2.0;
    let out_cx = (f64::from(out_w) - 1.0) / 2.0;
    let out_cy = (f64::from(out_h) - 1.0) / 2.0;

    let mut out = RgbaImage::from_pixel(out_w, out_h, Rgba([0, 0, 0, 255]));
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        // map the destination pixel back through the inverse rotation
        let dx = f64::from(x) - out_cx;
        let dy = f64::from(y) - out_cy;
        let sx = src_cx + dx * cos + dy * sin;
        let sy = src_cy - dx * sin + dy * cos;
        if let Some(sample) = bilinear(&src, sx, sy) {
            *pixel = sample;
        }
    }
    DynamicImage::ImageRgba8(out)
}

fn bilinear(src: &RgbaImage, x: f64, y: f64) -> Option<Rgba<u8>> {
    let (w, h) = (src.width() as i64, src.height() as i64);
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    if x0 < -1 || y0 < -1 || x0 >= w || y0 >= h {
        return None;
    }

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let fetch = |px: i64, py: i64| -> [f64; 4] {
        if px < 0 || py < 0 || px >= w || py >= h {
            // outside pixels contribute opaque black
            [0.0, 0.0, 0.0, 255.0]
        } else {
            let p = src.get_pixel(px as u32, py as u32).0;
            [f64::from(p[0]), f64::from(p[1]), f64::from(p[2]), f64::from(p[3])]
        }
    };

    let p00 = fetch(x0, y0);
    let p10 = fetch(x0 + 1, y0);
    let p01 = fetch(x0, y0 + 1);
    let p11 = fetch(x0 + 1, y0 + 1);

    let mut result = [0u8; 4];
    for c in 0..4 {
        let top = p00[c] * (1.0 - fx) + p10[c] * fx;
        let bottom = p01[c] * (1.0 - fx) + p11[c] * fx;
        result[c] = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
    }
    Some(Rgba(result))
}
