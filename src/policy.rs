//! Decides whether an existing on-disk preview may be reused.
//!
//! `reconcile` is a pure function over probed facts so every rule is unit
//! testable without touching a filesystem. Probing the facts (does the
//! preview open, what are its dimensions) is the dispatcher's job; the
//! [`PreviewProbe::probe`] helper does that one read.

use std::path::Path;
use std::time::SystemTime;

use image::ImageReader;
use tracing::trace;

/// Acceptance window for preview dimensions: within 2% of the desired size.
const SIZE_TOLERANCE: f64 = 0.02;

/// Outcome of reconciling an existing preview against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The existing preview file is current; load it directly.
    Reuse,
    /// Render a fresh preview from the source.
    Regenerate,
}

/// Facts about an existing preview file.
#[derive(Debug, Clone, Copy)]
pub struct PreviewProbe {
    pub modified: SystemTime,
    pub dimensions: (u32, u32),
}

impl PreviewProbe {
    /// Probe a preview file on disk. Returns `None` when the file is
    /// missing, unreadable or not decodable as an image.
    pub fn probe(path: &Path) -> Option<Self> {
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
        let dimensions = ImageReader::open(path)
            .ok()?
            .with_guessed_format()
            .ok()?
            .into_dimensions()
            .ok()?;
        Some(Self {
            modified,
            dimensions,
        })
    }
}

/// Everything `reconcile` looks at, collected up front.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileInputs {
    /// Caller demands regeneration regardless of the preview state.
    pub force: bool,
    /// Whether previews are persisted to disk at all.
    pub keep_previews_on_disk: bool,
    /// The existing preview, `None` if missing or unreadable.
    pub preview: Option<PreviewProbe>,
    /// Source modification time; `None` for groups, which have no single
    /// source file and skip the staleness comparison.
    pub source_modified: Option<SystemTime>,
    /// Desired preview bounding box.
    pub desired_size: (u32, u32),
    /// Whether small sources are left at their natural size.
    pub dont_enlarge_small_images: bool,
    /// Reference clock for the future-mtime guard.
    pub now: SystemTime,
}

/// Apply the reuse rules in order.
pub fn reconcile(inputs: &ReconcileInputs) -> Decision {
    if inputs.force {
        return Decision::Regenerate;
    }
    if !inputs.keep_previews_on_disk {
        return Decision::Regenerate;
    }
    let preview = match inputs.preview {
        Some(preview) => preview,
        None => return Decision::Regenerate,
    };
    if let Some(source_modified) = inputs.source_modified {
        // A source mtime in the future would regenerate on every request;
        // such files are treated as current.
        if preview.modified < source_modified && source_modified < inputs.now {
            trace!("Preview is stale");
            return Decision::Regenerate;
        }
    }
    if !size_within_tolerance(
        preview.dimensions,
        inputs.desired_size,
        inputs.dont_enlarge_small_images,
    ) {
        trace!(dimensions = ?preview.dimensions, "Preview is the wrong size");
        return Decision::Regenerate;
    }
    Decision::Reuse
}

/// A dimension is acceptable within 2% of the desired size on width or
/// height. With the dont-enlarge policy, a preview smaller than desired on
/// both axes but larger than 1x1 is presumed to be at the source's natural
/// resolution and also passes.
pub fn size_within_tolerance(actual: (u32, u32), desired: (u32, u32), dont_enlarge: bool) -> bool {
    let (aw, ah) = (f64::from(actual.0), f64::from(actual.1));
    let (dw, dh) = (f64::from(desired.0), f64::from(desired.1));

    let width_ok = aw >= dw * (1.0 - SIZE_TOLERANCE) && aw <= dw * (1.0 + SIZE_TOLERANCE);
    let height_ok = ah >= dh * (1.0 - SIZE_TOLERANCE) && ah <= dh * (1.0 + SIZE_TOLERANCE);
    if width_ok || height_ok {
        return true;
    }

    dont_enlarge && aw < dw && ah < dh && actual.0 > 1 && actual.1 > 1
}
