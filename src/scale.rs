use anyhow::Context;
use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, PixelType, ResizeAlg, ResizeOptions, Resizer as FirResizer};
use image::GrayImage;

use crate::config::ScaleTarget;
use crate::error::Result;

/// Width-to-height stretch applied before fitting, the reciprocal of a glyph's 0.4 aspect.
pub const FONT_STRETCH: f64 = 5.0 / 2.0;

// Absorbs float error so `n * (t / n)` truncates to `t`, not `t - 1`.
const TRUNC_EPSILON: f64 = 1e-9;

/// Area-averaging resizer for single-channel frames.
///
/// Keeps one `fast_image_resize` instance alive so a video run does not
/// rebuild convolution state for every frame.
pub struct AreaResizer {
    inner: FirResizer,
    options: ResizeOptions,
}

impl AreaResizer {
    pub fn new() -> Self {
        Self {
            inner: FirResizer::new(),
            options: ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Box)),
        }
    }

    /// Resize `src` to `width` x `height`, each output pixel averaging the source area it covers.
    pub fn resize(&mut self, src: &GrayImage, width: u32, height: u32) -> Result<GrayImage> {
        let width = width.max(1);
        let height = height.max(1);
        if src.dimensions() == (width, height) {
            return Ok(src.clone());
        }

        let src_image = Image::from_vec_u8(src.width(), src.height(), src.as_raw().clone(), PixelType::U8).context("invalid source dimensions")?;
        let mut dst_image = Image::new(width, height, PixelType::U8);
        self.inner.resize(&src_image, &mut dst_image, Some(&self.options)).context("area resize failed")?;

        let out = GrayImage::from_raw(width, height, dst_image.into_vec()).context("resized buffer has unexpected length")?;
        Ok(out)
    }
}

impl Default for AreaResizer {
    fn default() -> Self {
        Self::new()
    }
}

fn scaled(len: u32, ratio: f64) -> u32 {
    ((f64::from(len) * ratio + TRUNC_EPSILON).floor() as u32).max(1)
}

/// Dimensions after the horizontal pre-stretch and before fitting.
pub fn stretched_dimensions(width: u32, height: u32) -> (u32, u32) {
    (scaled(width, FONT_STRETCH), height.max(1))
}

/// Final grid dimensions for a `width` x `height` frame fitted to `target`.
pub fn grid_dimensions(width: u32, height: u32, target: ScaleTarget) -> (u32, u32) {
    let (sw, sh) = stretched_dimensions(width, height);
    let ratio = fit_ratio(sw, sh, target);
    (scaled(sw, ratio), scaled(sh, ratio))
}

fn fit_ratio(width: u32, height: u32, target: ScaleTarget) -> f64 {
    let rx = f64::from(target.horizontal) / f64::from(width.max(1));
    let ry = f64::from(target.vertical) / f64::from(height.max(1));
    rx.min(ry)
}

/// Rescale `frame` so one glyph per pixel fills `target` without distorting the picture.
///
/// The frame is stretched by [`FONT_STRETCH`] horizontally, then scaled
/// uniformly by `min(horizontal / w, vertical / h)`.
pub fn scale_to_grid(resizer: &mut AreaResizer, frame: &GrayImage, target: ScaleTarget) -> Result<GrayImage> {
    target.validate()?;
    let (sw, sh) = stretched_dimensions(frame.width(), frame.height());
    let stretched = resizer.resize(frame, sw, sh)?;

    let ratio = fit_ratio(sw, sh, target);
    resizer.resize(&stretched, scaled(sw, ratio), scaled(sh, ratio))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn flat_square_fits_width() {
        let frame = GrayImage::from_pixel(256, 256, Luma([128]));
        let mut resizer = AreaResizer::new();
        let out = scale_to_grid(&mut resizer, &frame, ScaleTarget::new(100, 100)).unwrap();
        assert_eq!(out.dimensions(), (100, 40));
        assert!(out.pixels().all(|p| (i32::from(p[0]) - 128).abs() <= 1));
    }

    #[test]
    fn binding_axis_lands_on_target() {
        let cases = [(1920, 1080, 200, 200), (640, 480, 100, 100), (300, 2000, 120, 60), (333, 777, 97, 41), (7, 5, 50, 50), (1, 1, 3, 3)];
        for (w, h, th, tv) in cases {
            let target = ScaleTarget::new(th, tv);
            let (rw, rh) = grid_dimensions(w, h, target);
            assert!(rw <= th && rh <= tv, "{w}x{h} -> {rw}x{rh} exceeds {th}x{tv}");
            assert!(rw == th || rh == tv, "{w}x{h} -> {rw}x{rh} misses both {th} and {tv}");
            let fit = (f64::from(rw) / f64::from(th)).max(f64::from(rh) / f64::from(tv));
            assert!((fit - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn scale_matches_grid_dimensions() {
        let frame = GrayImage::from_fn(333, 777, |x, y| Luma([((x + y) % 256) as u8]));
        let target = ScaleTarget::new(97, 41);
        let mut resizer = AreaResizer::new();
        let out = scale_to_grid(&mut resizer, &frame, target).unwrap();
        assert_eq!(out.dimensions(), grid_dimensions(333, 777, target));
    }

    #[test]
    fn area_average_blends_stripes() {
        let frame = GrayImage::from_fn(4, 4, |x, _| Luma([if x % 2 == 0 { 0 } else { 200 }]));
        let mut resizer = AreaResizer::new();
        let out = resizer.resize(&frame, 2, 2).unwrap();
        for p in out.pixels() {
            assert!((i32::from(p[0]) - 100).abs() <= 1, "got {}", p[0]);
        }
    }

    #[test]
    fn zero_target_is_rejected() {
        let frame = GrayImage::new(10, 10);
        let mut resizer = AreaResizer::new();
        assert!(scale_to_grid(&mut resizer, &frame, ScaleTarget::new(0, 10)).is_err());
    }
}
