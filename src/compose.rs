//! Collage previews for group nodes.
//!
//! A group's preview is a template background with up to grid-capacity
//! samples of its direct picture children drawn onto it. Children are taken
//! in order; nested groups are not recursed into.

use std::sync::Arc;

use anyhow::{Context, Result};
use image::{imageops, DynamicImage, GenericImageView, ImageReader, Rgba, RgbaImage};
use tracing::{debug, warn};

use crate::config::{CollageSettings, RenderConfig};
use crate::loader::SourceLoader;
use crate::model::{GroupNode, Node, PictureNode};
use crate::scaler;

/// Grid geometry derived from the template's content area.
#[derive(Debug, Clone, Copy)]
pub struct CollageLayout {
    horizontal: u32,
    vertical: u32,
    tile_size: (u32, u32),
    left_inset: u32,
    top_margin: u32,
    gap: u32,
}

impl CollageLayout {
    pub fn new(template_size: (u32, u32), settings: &CollageSettings) -> Self {
        let (tile_w, tile_h) = settings.tile_size;
        let horizontal = template_size
            .0
            .saturating_sub(settings.left_margin)
            .checked_div(tile_w + settings.gap)
            .unwrap_or(0);
        let vertical = template_size
            .1
            .saturating_sub(settings.top_margin)
            .checked_div(tile_h + settings.gap)
            .unwrap_or(0);
        Self {
            horizontal,
            vertical,
            tile_size: settings.tile_size,
            left_inset: settings.gap,
            top_margin: settings.top_margin,
            gap: settings.gap,
        }
    }

    /// How many tiles fit on the template.
    pub fn capacity(&self) -> usize {
        (self.horizontal * self.vertical) as usize
    }

    pub fn tile_size(&self) -> (u32, u32) {
        self.tile_size
    }

    /// Top-left corner of the grid cell for tile `index`.
    fn cell_origin(&self, index: usize) -> (u32, u32) {
        let index = index as u32;
        let col = index % self.horizontal;
        let row = index / self.horizontal;
        let x = self.left_inset + col * (self.tile_size.0 + self.gap);
        let y = self.top_margin + row * (self.tile_size.1 + self.gap);
        (x, y)
    }

    /// Placement of a scaled sample inside its cell: centered horizontally,
    /// aligned to the cell's bottom edge.
    fn placement(&self, index: usize, sample_size: (u32, u32)) -> (i64, i64) {
        let (x, y) = self.cell_origin(index);
        let dx = self.tile_size.0.saturating_sub(sample_size.0) / 2;
        let dy = self.tile_size.1.saturating_sub(sample_size.1);
        (i64::from(x + dx), i64::from(y + dy))
    }
}

/// The size a composed collage will have: the template image's dimensions,
/// or the configured size when the background is synthesized. This, not the
/// per-slot preview size, is what a persisted group preview is checked
/// against when deciding whether it can be reused.
pub fn collage_size(settings: &CollageSettings) -> (u32, u32) {
    match &settings.template {
        Some(path) => ImageReader::open(path)
            .ok()
            .and_then(|reader| reader.with_guessed_format().ok())
            .and_then(|reader| reader.into_dimensions().ok())
            .unwrap_or(settings.template_size),
        None => settings.template_size,
    }
}

/// The direct picture children that will fill the grid, in child order.
/// Nested groups are skipped, not recursed into.
pub fn sample_children(group: &GroupNode, capacity: usize) -> Vec<Arc<PictureNode>> {
    group
        .children()
        .iter()
        .filter_map(|child| match child {
            Node::Picture(pic) => Some(Arc::clone(pic)),
            Node::Group(_) => None,
        })
        .take(capacity)
        .collect()
}

/// Build the collage raster for `group`.
pub fn compose(group: &GroupNode, config: &RenderConfig, loader: &SourceLoader) -> Result<DynamicImage> {
    let mut canvas = load_template(&config.collage)?;
    let layout = CollageLayout::new((canvas.width(), canvas.height()), &config.collage);
    if layout.capacity() == 0 {
        debug!("Collage template leaves no room for tiles");
        return Ok(DynamicImage::ImageRgba8(canvas));
    }

    let samples = sample_children(group, layout.capacity());
    debug!(samples = samples.len(), capacity = layout.capacity(), "Composing group preview");

    for (index, picture) in samples.iter().enumerate() {
        let image = match sample_image(picture, loader) {
            Ok(image) => image,
            Err(e) => {
                warn!(highres = ?picture.highres(), error = %e, "Skipping unreadable collage sample");
                continue;
            }
        };
        let scaled = scaler::scale_to_fit(
            &image,
            layout.tile_size(),
            config.scale_mode,
            config.dont_enlarge_small_images,
        );
        let (x, y) = layout.placement(index, (scaled.width(), scaled.height()));
        imageops::overlay(&mut canvas, &scaled, x, y);
    }

    Ok(DynamicImage::ImageRgba8(canvas))
}

/// A sample prefers the child's existing preview file; only when that is
/// missing or unreadable is the highres source decoded.
fn sample_image(picture: &PictureNode, loader: &SourceLoader) -> Result<DynamicImage> {
    if let Some(lowres) = picture.lowres() {
        if let Ok(image) = image::open(&lowres) {
            return Ok(image);
        }
    }
    let decoded = loader
        .load(picture.highres(), picture.rotation(), None)
        .with_context(|| format!("Failed to load collage sample {:?}", picture.highres()))?;
    Ok(decoded.image().clone())
}

fn load_template(settings: &CollageSettings) -> Result<RgbaImage> {
    if let Some(path) = &settings.template {
        let img = image::open(path)
            .with_context(|| format!("Failed to load collage template {:?}", path))?;
        return Ok(img.to_rgba8());
    }
    let [r, g, b] = settings.background;
    Ok(RgbaImage::from_pixel(
        settings.template_size.0,
        settings.template_size.1,
        Rgba([r, g, b, 255]),
    ))
}
