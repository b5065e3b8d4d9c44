use ab_glyph::{point, Font, FontVec, PxScale, ScaleFont};
use image::{GrayImage, Luma};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AsciiError, Result};
use crate::ramp::GlyphGrid;
use crate::scale::AreaResizer;

/// Canvas height multiplier over `line_height * rows`.
pub const CANVAS_HEIGHT_FACTOR: f32 = 1.32;
/// Extra spacing between consecutive baselines.
pub const LINE_HEIGHT_FACTOR: f32 = 1.0;
/// Added to the canvas height; negative trims the bottom edge.
pub const CANVAS_MARGIN_TOP: f32 = -2.0;

const BACKGROUND: u8 = 255;

// Consolas first, then the usual monospace fonts shipped by each platform.
const SYSTEM_FONT_CANDIDATES: &[&str] = &[
    "C:\\Windows\\Fonts\\consola.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/TTF/DejaVuSansMono.ttf",
    "/usr/share/fonts/dejavu/DejaVuSansMono.ttf",
    "/usr/share/fonts/dejavu-sans-mono-fonts/DejaVuSansMono.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationMono-Regular.ttf",
    "/usr/share/fonts/liberation-mono/LiberationMono-Regular.ttf",
    "/usr/share/fonts/truetype/ubuntu/UbuntuMono-R.ttf",
    "/System/Library/Fonts/Menlo.ttc",
    "/System/Library/Fonts/Monaco.ttf",
];

const USER_FONT_NAMES: &[&str] = &["consola.ttf", "DejaVuSansMono.ttf", "LiberationMono-Regular.ttf"];

/// First monospace font found in the system or user font directories.
pub fn find_system_font() -> Option<PathBuf> {
    let user = dirs::font_dir().into_iter().flat_map(|d| USER_FONT_NAMES.iter().map(move |n| d.join(n)));
    SYSTEM_FONT_CANDIDATES.iter().map(PathBuf::from).chain(user).find(|p| p.is_file())
}

/// Load the font at `path`, or the first system monospace font when `None`.
pub fn load_font(path: Option<&Path>) -> Result<FontVec> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => find_system_font().ok_or_else(|| AsciiError::font("no monospace font found; pass a font path"))?,
    };
    let data = fs::read(&path).map_err(|e| AsciiError::font(format!("reading {}: {}", path.display(), e)))?;
    let font = FontVec::try_from_vec_and_index(data, 0).map_err(|e| AsciiError::font(format!("parsing {}: {}", path.display(), e)))?;
    log::info!("Rendering with font {}", path.display());
    Ok(font)
}

/// `PxScale` whose em square is `font_px` pixels, the way point sizes are
/// interpreted by toy text APIs.
fn em_scale(font: &FontVec, font_px: u32) -> PxScale {
    let height = font.height_unscaled();
    let units_per_em = font.units_per_em().unwrap_or(height);
    PxScale::from(font_px as f32 * height / units_per_em)
}

/// Canvas sizing captured on the first frame and reused for every later one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanvasLayout {
    pub width: u32,
    pub height: u32,
    pub line_height: f32,
    pub font_px: u32,
    pub rows: u32,
    pub columns: u32,
}

impl CanvasLayout {
    /// Derive canvas dimensions from a measured row width and line height.
    pub fn from_metrics(row_width: f32, line_height: f32, rows: u32, columns: u32, font_px: u32) -> Self {
        let height = CANVAS_MARGIN_TOP + line_height * rows as f32 * CANVAS_HEIGHT_FACTOR;
        Self {
            width: (row_width as u32).max(1),
            height: (height.max(1.0)) as u32,
            line_height,
            font_px,
            rows,
            columns,
        }
    }

    /// Baseline of row `row` (zero based), in canvas pixels.
    pub fn baseline(&self, row: u32) -> f32 {
        self.line_height * (row + 1) as f32 * CANVAS_HEIGHT_FACTOR * LINE_HEIGHT_FACTOR
    }

    fn describe(columns: u32, rows: u32, font_px: u32) -> String {
        format!("{}x{} glyphs at {}px", columns, rows, font_px)
    }

    fn check(&self, grid: &GlyphGrid, font_px: u32) -> Result<()> {
        if grid.columns() != self.columns || grid.row_count() != self.rows || font_px != self.font_px {
            return Err(AsciiError::CanvasMismatch {
                expected: Self::describe(self.columns, self.rows, self.font_px),
                got: Self::describe(grid.columns(), grid.row_count(), font_px),
            });
        }
        Ok(())
    }
}

/// Coverage bitmap of one glyph, positioned relative to the pen and baseline.
struct CachedGlyph {
    left: i32,
    top: i32,
    width: u32,
    height: u32,
    coverage: Vec<u8>,
}

enum CanvasState {
    Unsized,
    Sized { layout: CanvasLayout, canvas: GrayImage },
}

/// Renders glyph grids back into pixels with a monospace font.
///
/// The first grid sizes the canvas; the dimensions, font size and glyph
/// cache are then frozen, so every later grid must have the same shape.
pub struct Rasterizer {
    font: FontVec,
    state: CanvasState,
    glyphs: HashMap<char, Option<CachedGlyph>>,
    resizer: AreaResizer,
}

impl Rasterizer {
    pub fn new(font: FontVec) -> Self {
        Self { font, state: CanvasState::Unsized, glyphs: HashMap::new(), resizer: AreaResizer::new() }
    }

    /// Rasterizer using `font_path`, or a system monospace font.
    pub fn from_font_path(font_path: Option<&Path>) -> Result<Self> {
        Ok(Self::new(load_font(font_path)?))
    }

    /// Frozen layout, once the first grid has been drawn.
    pub fn layout(&self) -> Option<&CanvasLayout> {
        match &self.state {
            CanvasState::Unsized => None,
            CanvasState::Sized { layout, .. } => Some(layout),
        }
    }

    /// Measure `grid` at `font_px`: advance width of the first row, and the ink
    /// height of the whole block on a shared baseline.
    pub fn measure(&self, grid: &GlyphGrid, font_px: u32) -> CanvasLayout {
        let scale = em_scale(&self.font, font_px);
        let scaled = self.font.as_scaled(scale);

        let row_width: f32 = grid.first_row().chars().map(|c| scaled.h_advance(scaled.glyph_id(c))).sum();

        let distinct: BTreeSet<char> = grid.as_str().chars().filter(|c| *c != '\n').collect();
        let mut top = f32::MAX;
        let mut bottom = f32::MIN;
        for ch in distinct {
            let glyph = scaled.scaled_glyph(ch);
            if let Some(outlined) = self.font.outline_glyph(glyph) {
                let bounds = outlined.px_bounds();
                top = top.min(bounds.min.y);
                bottom = bottom.max(bounds.max.y);
            }
        }
        let line_height = if bottom > top { bottom - top } else { scaled.ascent() - scaled.descent() };

        CanvasLayout::from_metrics(row_width, line_height, grid.row_count(), grid.columns(), font_px)
    }

    fn cache_glyphs(&mut self, grid: &GlyphGrid, scale: PxScale) {
        for ch in grid.as_str().chars() {
            if ch == '\n' || self.glyphs.contains_key(&ch) {
                continue;
            }
            let glyph = self.font.glyph_id(ch).with_scale_and_position(scale, point(0.0, 0.0));
            let cached = self.font.outline_glyph(glyph).map(|outlined| {
                let bounds = outlined.px_bounds();
                let width = bounds.width() as u32;
                let height = bounds.height() as u32;
                let mut coverage = vec![0u8; (width * height) as usize];
                outlined.draw(|x, y, c| {
                    if x < width && y < height {
                        coverage[(y * width + x) as usize] = (c.clamp(0.0, 1.0) * 255.0).round() as u8;
                    }
                });
                CachedGlyph { left: bounds.min.x as i32, top: bounds.min.y as i32, width, height, coverage }
            });
            self.glyphs.insert(ch, cached);
        }
    }

    /// Draw `grid` on the shared canvas and return it at its own (font derived) size.
    ///
    /// # Errors
    /// `CanvasMismatch` when the canvas was sized for a different grid shape or font size.
    pub fn draw(&mut self, grid: &GlyphGrid, font_px: u32) -> Result<&GrayImage> {
        if font_px == 0 {
            return Err(AsciiError::config("font size must be non-zero"));
        }
        if let CanvasState::Sized { layout, .. } = &self.state {
            layout.check(grid, font_px)?;
        } else {
            let layout = self.measure(grid, font_px);
            log::info!("Sized canvas to {}x{} for {}x{} glyphs at {}px", layout.width, layout.height, layout.columns, layout.rows, font_px);
            let canvas = GrayImage::from_pixel(layout.width, layout.height, Luma([BACKGROUND]));
            self.state = CanvasState::Sized { layout, canvas };
        }

        let scale = em_scale(&self.font, font_px);
        self.cache_glyphs(grid, scale);

        let scaled = self.font.as_scaled(scale);
        let CanvasState::Sized { layout, canvas } = &mut self.state else {
            return Err(AsciiError::Precondition("canvas was not sized"));
        };

        for px in canvas.pixels_mut() {
            px[0] = BACKGROUND;
        }

        let (cw, ch) = (canvas.width() as i32, canvas.height() as i32);
        for (i, row) in grid.rows().enumerate() {
            let baseline = layout.baseline(i as u32).round() as i32;
            let mut pen_x = 0.0f32;
            for c in row.chars() {
                if let Some(Some(glyph)) = self.glyphs.get(&c) {
                    let ox = pen_x.round() as i32 + glyph.left;
                    let oy = baseline + glyph.top;
                    for gy in 0..glyph.height as i32 {
                        let y = oy + gy;
                        if y < 0 || y >= ch {
                            continue;
                        }
                        for gx in 0..glyph.width as i32 {
                            let x = ox + gx;
                            if x < 0 || x >= cw {
                                continue;
                            }
                            let cov = glyph.coverage[(gy as u32 * glyph.width + gx as u32) as usize];
                            let px = canvas.get_pixel_mut(x as u32, y as u32);
                            px[0] = px[0].min(BACKGROUND - cov);
                        }
                    }
                }
                pen_x += scaled.h_advance(scaled.glyph_id(c));
            }
        }

        Ok(canvas)
    }

    /// Draw `grid`, then area-resample the canvas to `size` (the source frame's dimensions).
    pub fn render(&mut self, grid: &GlyphGrid, font_px: u32, size: (u32, u32)) -> Result<GrayImage> {
        self.draw(grid, font_px)?;
        let CanvasState::Sized { canvas, .. } = &self.state else {
            return Err(AsciiError::Precondition("canvas was not sized"));
        };
        self.resizer.resize(canvas, size.0, size.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system_rasterizer() -> Option<Rasterizer> {
        let Some(path) = find_system_font() else {
            eprintln!("no system monospace font, skipping");
            return None;
        };
        Rasterizer::from_font_path(Some(&path)).ok()
    }

    #[test]
    fn layout_follows_height_formula() {
        let layout = CanvasLayout::from_metrics(812.6, 10.0, 40, 100, 32);
        assert_eq!(layout.width, 812);
        // -2 + 10 * 40 * 1.32 = 526
        assert_eq!(layout.height, 526);
        assert!((layout.baseline(0) - 13.2).abs() < 1e-4);
        assert!((layout.baseline(9) - 132.0).abs() < 1e-3);
    }

    #[test]
    fn layout_never_collapses_to_zero() {
        let layout = CanvasLayout::from_metrics(0.0, 0.5, 1, 1, 1);
        assert_eq!((layout.width, layout.height), (1, 1));
    }

    #[test]
    fn layout_rejects_different_shape() {
        let layout = CanvasLayout::from_metrics(100.0, 10.0, 2, 3, 16);
        let same = GlyphGrid::from_text("@@@\n...").unwrap();
        let taller = GlyphGrid::from_text("@@@\n...\n...").unwrap();
        assert!(layout.check(&same, 16).is_ok());
        assert!(matches!(layout.check(&taller, 16), Err(AsciiError::CanvasMismatch { .. })));
        assert!(matches!(layout.check(&same, 20), Err(AsciiError::CanvasMismatch { .. })));
    }

    #[test]
    fn missing_font_file_is_a_font_error() {
        let err = load_font(Some(Path::new("no/such/font.ttf"))).err().unwrap();
        assert!(matches!(err, AsciiError::Font(_)));
    }

    #[test]
    fn render_matches_source_size_with_ink_on_white() {
        let Some(mut raster) = system_rasterizer() else { return };
        let grid = GlyphGrid::from_text("=".repeat(20) + "\n" + &"=".repeat(20)).unwrap();
        let out = raster.render(&grid, 32, (64, 48)).unwrap();
        assert_eq!(out.dimensions(), (64, 48));
        assert!(out.pixels().any(|p| p[0] < BACKGROUND));
        assert!(out.pixels().any(|p| p[0] == BACKGROUND));

        let layout = *raster.layout().unwrap();
        assert_eq!((layout.columns, layout.rows, layout.font_px), (20, 2, 32));
    }

    #[test]
    fn blank_grid_renders_pure_background() {
        let Some(mut raster) = system_rasterizer() else { return };
        let grid = GlyphGrid::from_text("     \n     \n     ").unwrap();
        let out = raster.render(&grid, 16, (30, 20)).unwrap();
        assert!(out.pixels().all(|p| p[0] == BACKGROUND));
    }

    #[test]
    fn canvas_is_frozen_after_first_frame() {
        let Some(mut raster) = system_rasterizer() else { return };
        let first = GlyphGrid::from_text("@@@@\n....").unwrap();
        let a = raster.render(&first, 16, (40, 20)).unwrap();
        let b = raster.render(&first, 16, (40, 20)).unwrap();
        assert_eq!(a, b);

        let other = GlyphGrid::from_text("@@@@@\n.....").unwrap();
        assert!(matches!(raster.render(&other, 16, (40, 20)), Err(AsciiError::CanvasMismatch { .. })));
    }
}
