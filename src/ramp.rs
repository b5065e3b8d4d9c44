use image::GrayImage;
use std::fmt;

use crate::config::Quantization;

/// 70 characters, Paul Bourke's extended ramp, densest first.
pub const RAMP_DETAILED: &str = r#"$@B%8&WM#*oahkbdpqwmZO0QLCJUYXzcvunxrjft/\|()1{}[]?-_+~i!lI;:,"^`. "#;

/// 10 characters, high contrast, densest first.
pub const RAMP_COMPACT: &str = "@%#*+=-:. ";

/// Ramps selectable by `ramp_level`.
pub const RAMPS: [&str; 2] = [RAMP_DETAILED, RAMP_COMPACT];

/// Ordered glyphs from densest to sparsest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlyphRamp {
    chars: Vec<char>,
}

impl GlyphRamp {
    /// Ramp for `level`, wrapping around the catalog instead of failing.
    pub fn from_level(level: usize) -> Self {
        Self { chars: RAMPS[level % RAMPS.len()].chars().collect() }
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    pub fn contains(&self, ch: char) -> bool {
        self.chars.contains(&ch)
    }

    /// Ramp index for intensity `value`.
    ///
    /// `floor((value / (max_bit - min_bit) + min_bit) * len)`, clamped to the
    /// last index so that `max_bit - 1` and narrowed bounds never overrun.
    pub fn index_for(&self, value: u8, quant: Quantization) -> usize {
        let span = f64::from(quant.max_bit.saturating_sub(quant.min_bit).max(1));
        let scaled = (f64::from(value) / span + f64::from(quant.min_bit)) * self.chars.len() as f64;
        let last = self.chars.len().saturating_sub(1);
        (scaled.floor().max(0.0) as usize).min(last)
    }

    pub fn glyph_for(&self, value: u8, quant: Quantization) -> char {
        self.chars[self.index_for(value, quant)]
    }

    fn lookup_table(&self, quant: Quantization) -> [char; 256] {
        let mut lut = [' '; 256];
        for (v, slot) in lut.iter_mut().enumerate() {
            *slot = self.glyph_for(v as u8, quant);
        }
        lut
    }
}

/// Rows of glyphs joined by `\n`, one row per scan line of the scaled frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlyphGrid {
    text: String,
    columns: u32,
    rows: u32,
}

impl GlyphGrid {
    /// Build a grid from text, requiring every row to have the same width.
    pub fn from_text(text: impl Into<String>) -> Option<Self> {
        let text = text.into();
        if text.is_empty() {
            return None;
        }
        let mut rows = 0u32;
        let mut columns = None;
        for row in text.split('\n') {
            let width = row.chars().count() as u32;
            if *columns.get_or_insert(width) != width {
                return None;
            }
            rows += 1;
        }
        Some(Self { text, columns: columns.unwrap_or(0), rows })
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn into_string(self) -> String {
        self.text
    }

    pub fn rows(&self) -> impl Iterator<Item = &str> {
        self.text.split('\n')
    }

    pub fn first_row(&self) -> &str {
        self.text.split('\n').next().unwrap_or("")
    }

    pub fn row_count(&self) -> u32 {
        self.rows
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }
}

impl fmt::Display for GlyphGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Map every pixel of `frame` to a glyph of `ramp`.
pub fn map_glyphs(frame: &GrayImage, ramp: &GlyphRamp, quant: Quantization) -> GlyphGrid {
    let lut = ramp.lookup_table(quant);
    let (w, h) = frame.dimensions();
    let mut text = String::with_capacity((w as usize + 1) * h as usize);
    for (y, row) in frame.rows().enumerate() {
        if y > 0 {
            text.push('\n');
        }
        for px in row {
            text.push(lut[px[0] as usize]);
        }
    }
    GlyphGrid { text, columns: w, rows: h }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn level_wraps_around_catalog() {
        assert_eq!(GlyphRamp::from_level(0), GlyphRamp::from_level(2));
        assert_eq!(GlyphRamp::from_level(1).len(), 10);
        assert_eq!(GlyphRamp::from_level(3).chars()[0], '@');
    }

    #[test]
    fn index_never_overruns_ramp() {
        for level in 0..RAMPS.len() {
            let ramp = GlyphRamp::from_level(level);
            for quant in [Quantization::default(), Quantization { min_bit: 0, max_bit: 255 }, Quantization { min_bit: 0, max_bit: 64 }] {
                for v in 0..=255u8 {
                    assert!(ramp.index_for(v, quant) < ramp.len(), "v={v} quant={quant:?}");
                }
            }
        }
    }

    #[test]
    fn upper_bound_maps_to_sparsest_glyph() {
        let ramp = GlyphRamp::from_level(1);
        let quant = Quantization { min_bit: 0, max_bit: 255 };
        // 255 / 255 * 10 = 10 would be one past the end without the clamp
        assert_eq!(ramp.glyph_for(254, quant), ' ');
        assert_eq!(ramp.glyph_for(255, quant), ' ');
        assert_eq!(ramp.glyph_for(255, Quantization::default()), ' ');
        assert_eq!(ramp.glyph_for(0, Quantization::default()), '@');
    }

    #[test]
    fn mapping_is_monotonic() {
        let ramp = GlyphRamp::from_level(0);
        let quant = Quantization::default();
        let mut prev = 0;
        for v in 0..=255u8 {
            let idx = ramp.index_for(v, quant);
            assert!(idx >= prev, "ramp index went backwards at {v}");
            prev = idx;
        }
    }

    #[test]
    fn grid_has_one_row_per_scanline() {
        let frame = GrayImage::from_fn(7, 3, |x, _| Luma([(x * 36) as u8]));
        let ramp = GlyphRamp::from_level(1);
        let grid = map_glyphs(&frame, &ramp, Quantization::default());
        assert_eq!(grid.row_count(), 3);
        assert_eq!(grid.columns(), 7);
        assert!(!grid.as_str().ends_with('\n'));
        for row in grid.rows() {
            assert_eq!(row.chars().count(), 7);
            assert!(row.chars().all(|c| ramp.contains(c)));
        }
    }

    #[test]
    fn flat_gray_frame_uses_a_single_glyph() {
        let frame = GrayImage::from_pixel(100, 40, Luma([128]));
        let grid = map_glyphs(&frame, &GlyphRamp::from_level(1), Quantization::default());
        assert!(grid.rows().all(|row| row.chars().all(|c| c == '=')));
    }

    #[test]
    fn mapping_is_deterministic() {
        let frame = GrayImage::from_fn(31, 17, |x, y| Luma([((x * 7 + y * 13) % 256) as u8]));
        let ramp = GlyphRamp::from_level(0);
        let a = map_glyphs(&frame, &ramp, Quantization::default());
        let b = map_glyphs(&frame, &ramp, Quantization::default());
        assert_eq!(a.as_str().as_bytes(), b.as_str().as_bytes());
    }

    #[test]
    fn from_text_rejects_ragged_rows() {
        assert!(GlyphGrid::from_text("ab\ncd").is_some());
        assert!(GlyphGrid::from_text("ab\nc").is_none());
        assert!(GlyphGrid::from_text("").is_none());
        let grid = GlyphGrid::from_text("@@@\n...").unwrap();
        assert_eq!((grid.columns(), grid.row_count()), (3, 2));
        assert_eq!(grid.first_row(), "@@@");
    }
}
