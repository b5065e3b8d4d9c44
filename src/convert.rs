use image::{DynamicImage, GrayImage};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::config::{ConversionOptions, FfmpegConfig, ScaleTarget};
use crate::error::{AsciiError, Result};
use crate::paths;
use crate::progress::{EtaTracker, Progress};
use crate::ramp::{map_glyphs, GlyphGrid, GlyphRamp};
use crate::raster::Rasterizer;
use crate::scale::{scale_to_grid, AreaResizer};
use crate::source::{self, FrameSource, VideoSource};
use crate::writer::{mux_audio, EncoderFactory, FfmpegFactory, FlushStats, VideoWriter};

/// The scale → map → rasterize stages, sharing one resizer, ramp and
/// rasterizer for the whole session.
pub struct FramePipeline {
    options: ConversionOptions,
    ramp: GlyphRamp,
    resizer: AreaResizer,
    rasterizer: Option<Rasterizer>,
}

impl FramePipeline {
    pub fn new(options: ConversionOptions) -> Result<Self> {
        options.validate()?;
        let ramp = GlyphRamp::from_level(options.ramp_level);
        Ok(Self { options, ramp, resizer: AreaResizer::new(), rasterizer: None })
    }

    /// Use `rasterizer` instead of loading the configured font on first render.
    pub fn with_rasterizer(mut self, rasterizer: Rasterizer) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn options(&self) -> &ConversionOptions {
        &self.options
    }

    pub fn ramp(&self) -> &GlyphRamp {
        &self.ramp
    }

    pub fn set_target(&mut self, target: ScaleTarget) -> Result<()> {
        target.validate()?;
        self.options.target = target;
        Ok(())
    }

    pub fn scale(&mut self, frame: &GrayImage) -> Result<GrayImage> {
        scale_to_grid(&mut self.resizer, frame, self.options.target)
    }

    pub fn map(&self, frame: &GrayImage) -> GlyphGrid {
        map_glyphs(frame, &self.ramp, self.options.quantization)
    }

    /// Render `grid` and resample it to `size`.
    pub fn rasterize(&mut self, grid: &GlyphGrid, size: (u32, u32)) -> Result<GrayImage> {
        let font_px = self.options.font_size();
        if self.rasterizer.is_none() {
            self.rasterizer = Some(Rasterizer::from_font_path(self.options.font_path.as_deref())?);
        }
        match self.rasterizer.as_mut() {
            Some(r) => r.render(grid, font_px, size),
            None => Err(AsciiError::Precondition("no rasterizer")),
        }
    }

    /// Run every stage on `frame`, returning the text and the rendered image at `frame`'s size.
    pub fn render_frame(&mut self, frame: &GrayImage) -> Result<(GlyphGrid, GrayImage)> {
        let scaled = self.scale(frame)?;
        let grid = self.map(&scaled);
        let image = self.rasterize(&grid, frame.dimensions())?;
        Ok((grid, image))
    }
}

/// Stage-by-stage conversion of a single image.
///
/// Each stage needs the previous one's output and returns
/// [`AsciiError::Precondition`] otherwise, leaving the session unchanged.
///
/// # Example
///
/// ```no_run
/// use img2ascii::{ConversionOptions, ImageConverter};
/// use std::path::Path;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut converter = ImageConverter::new(ConversionOptions::default())?;
/// converter.set_image(Path::new("rick.png"))?;
/// converter.set_target(200, 200)?;
/// converter.scale()?;
/// converter.create_text()?;
/// converter.create_image()?;
/// converter.write_text(None)?;
/// converter.write_image(None, None)?;
/// # Ok(())
/// # }
/// ```
pub struct ImageConverter {
    pipeline: FramePipeline,
    source_path: Option<PathBuf>,
    frame: Option<GrayImage>,
    scaled: Option<GrayImage>,
    grid: Option<GlyphGrid>,
    rendered: Option<GrayImage>,
}

impl ImageConverter {
    pub fn new(options: ConversionOptions) -> Result<Self> {
        Ok(Self::from_pipeline(FramePipeline::new(options)?))
    }

    pub fn from_pipeline(pipeline: FramePipeline) -> Self {
        Self { pipeline, source_path: None, frame: None, scaled: None, grid: None, rendered: None }
    }

    pub fn pipeline(&self) -> &FramePipeline {
        &self.pipeline
    }

    fn reset_from_frame(&mut self, frame: GrayImage) {
        self.frame = Some(frame);
        self.scaled = None;
        self.grid = None;
        self.rendered = None;
    }

    /// Load `path` as the source, converting it to grayscale.
    pub fn set_image(&mut self, path: &Path) -> Result<()> {
        let frame = source::load_gray_image(path).inspect_err(|e| log::warn!("Could not load {}: {}", path.display(), e))?;
        log::info!("Loaded {} ({}x{})", path.display(), frame.width(), frame.height());
        self.source_path = Some(path.to_path_buf());
        self.reset_from_frame(frame);
        Ok(())
    }

    /// Use an in-memory image as the source; color images are converted to grayscale.
    pub fn set_frame(&mut self, image: DynamicImage) {
        if !matches!(image, DynamicImage::ImageLuma8(_)) {
            log::warn!("Image is not grayscale, converting");
        }
        self.reset_from_frame(source::to_grayscale(image));
    }

    /// Change the grid target. Scaled, text and rendered results are discarded.
    pub fn set_target(&mut self, horizontal: u32, vertical: u32) -> Result<()> {
        self.pipeline.set_target(ScaleTarget::new(horizontal, vertical))?;
        self.scaled = None;
        self.grid = None;
        self.rendered = None;
        Ok(())
    }

    pub fn frame(&self) -> Option<&GrayImage> {
        self.frame.as_ref()
    }

    pub fn text(&self) -> Option<&GlyphGrid> {
        self.grid.as_ref()
    }

    pub fn rendered(&self) -> Option<&GrayImage> {
        self.rendered.as_ref()
    }

    /// Fit the source frame to the character grid.
    pub fn scale(&mut self) -> Result<&GrayImage> {
        let Some(frame) = self.frame.as_ref() else {
            log::warn!("No image has been set yet");
            return Err(AsciiError::Precondition("no image has been set"));
        };
        let scaled = self.pipeline.scale(frame)?;
        log::info!("Scaled to {}x{} glyphs", scaled.width(), scaled.height());
        Ok(self.scaled.insert(scaled))
    }

    /// Map the scaled frame (or the source frame if it was never scaled) to glyphs.
    pub fn create_text(&mut self) -> Result<&GlyphGrid> {
        let Some(frame) = self.scaled.as_ref().or(self.frame.as_ref()) else {
            log::warn!("No image has been set yet");
            return Err(AsciiError::Precondition("no image has been set"));
        };
        let grid = self.pipeline.map(frame);
        Ok(self.grid.insert(grid))
    }

    /// Render the glyph grid back to an image the size of the source frame.
    pub fn create_image(&mut self) -> Result<&GrayImage> {
        let (Some(grid), Some(frame)) = (self.grid.as_ref(), self.frame.as_ref()) else {
            log::warn!("Nothing to render, create text first");
            return Err(AsciiError::Precondition("no text has been created"));
        };
        let size = frame.dimensions();
        let rendered = self.pipeline.rasterize(grid, size)?;
        Ok(self.rendered.insert(rendered))
    }

    /// Write the glyph grid to `path` (coerced to `.txt`) or `<source>_ascii.txt`.
    pub fn write_text(&self, path: Option<&Path>) -> Result<PathBuf> {
        let Some(grid) = self.grid.as_ref() else {
            log::warn!("Nothing to write, create text first");
            return Err(AsciiError::Precondition("no text has been created"));
        };
        let out = match (path, self.source_path.as_deref()) {
            (Some(p), _) => paths::coerce_txt_extension(p),
            (None, Some(src)) => paths::default_text_path(src),
            (None, None) => return Err(AsciiError::Precondition("no output path and no source path")),
        };
        log::info!("Writing text file {}", out.display());
        fs::write(&out, grid.as_str()).map_err(|source| AsciiError::Write { path: out.clone(), source })?;
        log::info!("Finished writing {}", out.display());
        Ok(out)
    }

    /// Write the rendered image to `path` or `<source>_ascii.<ext>`, with
    /// `extension` overriding the format.
    pub fn write_image(&self, path: Option<&Path>, extension: Option<&str>) -> Result<PathBuf> {
        let Some(rendered) = self.rendered.as_ref() else {
            log::warn!("Nothing to write, create image first");
            return Err(AsciiError::Precondition("no image has been created"));
        };
        let out = match (path, self.source_path.as_deref()) {
            (Some(p), _) => paths::media_output_path(p, Some(p), extension),
            (None, Some(src)) => paths::media_output_path(src, None, extension),
            (None, None) => return Err(AsciiError::Precondition("no output path and no source path")),
        };
        log::info!("Writing image file {}", out.display());
        rendered.save(&out).map_err(|e| match e {
            image::ImageError::IoError(source) => AsciiError::Write { path: out.clone(), source },
            other => AsciiError::Image(other),
        })?;
        log::info!("Finished writing {}", out.display());
        Ok(out)
    }
}

/// Paths written by [`convert_image`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageOutputs {
    pub text: PathBuf,
    pub image: PathBuf,
}

/// Run the whole per-image pipeline and write both outputs.
pub fn convert_image(input: &Path, text_out: Option<&Path>, image_out: Option<&Path>, extension: Option<&str>, options: &ConversionOptions) -> Result<ImageOutputs> {
    let mut converter = ImageConverter::new(options.clone())?;
    converter.set_image(input)?;
    converter.scale()?;
    converter.create_text()?;
    converter.create_image()?;
    let text = converter.write_text(text_out)?;
    let image = converter.write_image(image_out, extension)?;
    Ok(ImageOutputs { text, image })
}

/// Drives a frame source through the pipeline into a [`VideoWriter`].
pub struct VideoConverter {
    pipeline: FramePipeline,
}

impl VideoConverter {
    pub fn new(options: ConversionOptions) -> Result<Self> {
        Ok(Self { pipeline: FramePipeline::new(options)? })
    }

    pub fn from_pipeline(pipeline: FramePipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &FramePipeline {
        &self.pipeline
    }

    /// Render every frame of `source` into `writer`, then flush the remainder and close it.
    ///
    /// `progress` receives one update per frame with a remaining-time
    /// estimate from the last five frame times.
    pub fn create_video<S, F, P>(&mut self, source: &mut S, writer: &mut VideoWriter<F>, mut progress: P) -> Result<FlushStats>
    where
        S: FrameSource,
        F: EncoderFactory,
        P: FnMut(&Progress),
    {
        let total = source.frame_count();
        let mut eta = EtaTracker::new();
        let mut completed = 0u64;

        log::info!("Converting frames to ASCII and writing them to {}", writer.path().display());
        while let Some(frame) = source.next_frame()? {
            let started = Instant::now();
            let (_, rendered) = self.pipeline.render_frame(&frame)?;
            writer.push(rendered)?;
            eta.record(started.elapsed());

            completed += 1;
            let remaining = (total > 0).then(|| eta.remaining(total.saturating_sub(completed))).flatten();
            progress(&Progress::converting_frames(completed, total, remaining));
        }

        let stats = writer.finish()?;
        log::info!(
            "Video created: {} frames written, {} dropped, {} periodic flushes",
            stats.frames_written,
            stats.dropped_frames,
            stats.periodic_flushes
        );
        Ok(stats)
    }
}

/// Result of [`convert_video_file`].
#[derive(Debug, Clone)]
pub struct VideoReport {
    pub output: PathBuf,
    pub stats: FlushStats,
    pub audio_merged: bool,
}

/// Where a video run encodes and whether it needs the audio pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodePlan {
    /// Path the caller ends up with
    pub final_path: PathBuf,
    /// Path the encoder writes to
    pub encode_path: PathBuf,
    pub needs_mux: bool,
}

impl EncodePlan {
    /// GIFs encode straight to the final path. Anything else encodes to the
    /// `.noaudio` temp path beside it and is muxed afterwards.
    pub fn for_input(input: &Path, output: Option<&Path>) -> Self {
        let final_path = output.map(Path::to_path_buf).unwrap_or_else(|| paths::default_media_path(input));
        if source::is_gif(input) {
            return Self { encode_path: final_path.clone(), final_path, needs_mux: false };
        }
        Self { encode_path: paths::temp_video_path(&final_path), final_path, needs_mux: true }
    }

    /// Writer bound to the encode path.
    pub fn writer<F: EncoderFactory>(&self, factory: F, fps: f64, options: &ConversionOptions) -> VideoWriter<F> {
        VideoWriter::new(factory, &self.encode_path, fps, options.batch_size, options.on_frame_error)
    }

    /// Mux the source audio into the final path and remove the temp file.
    /// Returns whether audio was merged. The temp file is kept if the mux fails.
    pub fn finalize(&self, ffmpeg: &FfmpegConfig, input: &Path) -> Result<bool> {
        if !self.needs_mux {
            return Ok(false);
        }
        log::info!("Adding audio from {} to {}", input.display(), self.final_path.display());
        mux_audio(ffmpeg, &self.encode_path, input, &self.final_path)
            .inspect_err(|e| log::warn!("Audio mux failed, leaving {}: {}", self.encode_path.display(), e))?;
        fs::remove_file(&self.encode_path).map_err(|source| AsciiError::Write { path: self.encode_path.clone(), source })?;
        log::info!("Finished adding audio to {}", self.final_path.display());
        Ok(true)
    }
}

/// Convert a video or GIF file, re-attaching the source audio for non-GIF output.
///
/// See [`EncodePlan`] for where frames are written.
pub fn convert_video_file<P: FnMut(&Progress)>(input: &Path, output: Option<&Path>, options: &ConversionOptions, mut progress: P) -> Result<VideoReport> {
    let mut frames = VideoSource::open(input, &options.ffmpeg)?;
    let plan = EncodePlan::for_input(input, output);
    if !plan.needs_mux {
        log::info!("Input is a GIF, writing frames directly without audio");
    }

    let factory = FfmpegFactory { ffmpeg: options.ffmpeg.clone(), preset: options.x264_preset() };
    let mut writer = plan.writer(factory, frames.fps(), options);
    let mut converter = VideoConverter::new(options.clone())?;
    let stats = converter.create_video(&mut frames, &mut writer, &mut progress)?;
    let total = stats.frames_written as u64;

    if plan.needs_mux {
        progress(&Progress::merging_audio(total));
    }
    let audio_merged = plan.finalize(&options.ffmpeg, input)?;

    progress(&Progress::complete(total));
    Ok(VideoReport { output: plan.final_path, stats, audio_merged })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FrameErrorPolicy;
    use crate::raster::find_system_font;
    use crate::writer::testing::RecordingFactory;
    use image::{Luma, Rgb, RgbImage};

    struct VecSource {
        frames: std::vec::IntoIter<GrayImage>,
        count: u64,
    }

    impl VecSource {
        fn flat(count: usize, w: u32, h: u32) -> Self {
            let frames: Vec<GrayImage> = (0..count).map(|i| GrayImage::from_pixel(w, h, Luma([(i % 256) as u8]))).collect();
            Self { count: frames.len() as u64, frames: frames.into_iter() }
        }
    }

    impl FrameSource for VecSource {
        fn next_frame(&mut self) -> Result<Option<GrayImage>> {
            Ok(self.frames.next())
        }

        fn fps(&self) -> f64 {
            24.0
        }

        fn frame_count(&self) -> u64 {
            self.count
        }
    }

    fn font_pipeline(options: ConversionOptions) -> Option<FramePipeline> {
        let Some(font) = find_system_font() else {
            eprintln!("no system monospace font, skipping");
            return None;
        };
        Some(FramePipeline::new(options.with_font_path(font)).unwrap())
    }

    #[test]
    fn stages_refuse_to_run_out_of_order() {
        let mut c = ImageConverter::new(ConversionOptions::default()).unwrap();
        assert!(matches!(c.scale(), Err(AsciiError::Precondition(_))));
        assert!(matches!(c.create_text(), Err(AsciiError::Precondition(_))));
        assert!(matches!(c.create_image(), Err(AsciiError::Precondition(_))));
        assert!(matches!(c.write_text(None), Err(AsciiError::Precondition(_))));
        assert!(matches!(c.write_image(None, None), Err(AsciiError::Precondition(_))));
        assert!(c.text().is_none());
    }

    #[test]
    fn missing_source_leaves_no_state() {
        let mut c = ImageConverter::new(ConversionOptions::default()).unwrap();
        let err = c.set_image(Path::new("nope/none.png")).unwrap_err();
        assert!(matches!(err, AsciiError::MissingInput { .. }));
        assert!(c.frame().is_none());
    }

    #[test]
    fn color_frame_is_converted_then_mapped() {
        let mut c = ImageConverter::new(ConversionOptions::default().with_target(100, 100).with_ramp_level(1)).unwrap();
        c.set_frame(DynamicImage::ImageRgb8(RgbImage::from_pixel(256, 256, Rgb([140, 140, 140]))));
        assert_eq!(c.scale().unwrap().dimensions(), (100, 40));
        let grid = c.create_text().unwrap();
        assert_eq!((grid.columns(), grid.row_count()), (100, 40));
        assert!(grid.as_str().chars().all(|ch| ch == '=' || ch == '\n'));
    }

    #[test]
    fn text_is_written_with_txt_extension() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ImageConverter::new(ConversionOptions::default().with_target(10, 10)).unwrap();
        c.set_frame(DynamicImage::ImageLuma8(GrayImage::from_pixel(20, 20, Luma([0]))));
        c.scale().unwrap();
        c.create_text().unwrap();
        let out = c.write_text(Some(&dir.path().join("frame"))).unwrap();
        assert_eq!(out, dir.path().join("frame.txt"));
        assert_eq!(fs::read_to_string(&out).unwrap(), c.text().unwrap().as_str());
    }

    #[test]
    fn video_run_renders_and_flushes_every_frame() {
        let Some(pipeline) = font_pipeline(ConversionOptions::default().with_target(20, 20).with_batch_size(10)) else { return };
        let mut converter = VideoConverter::from_pipeline(pipeline);
        let factory = RecordingFactory::default();
        let mut writer = VideoWriter::new(factory.clone(), "out.mp4", 24.0, 10, FrameErrorPolicy::Skip);
        let mut source = VecSource::flat(25, 64, 48);

        let mut updates = Vec::new();
        let stats = converter.create_video(&mut source, &mut writer, |p| updates.push(p.completed)).unwrap();

        assert_eq!(stats.periodic_flushes, 2);
        assert_eq!(stats.final_frames, 5);
        assert_eq!(stats.frames_written, 25);
        assert_eq!(updates, (1..=25).collect::<Vec<u64>>());
        assert_eq!(factory.log.borrow().closes, 1);
    }

    #[test]
    fn mid_run_shape_change_is_rejected() {
        let Some(pipeline) = font_pipeline(ConversionOptions::default().with_target(40, 40)) else { return };
        let mut pipeline = pipeline;
        pipeline.render_frame(&GrayImage::from_pixel(64, 48, Luma([90]))).unwrap();
        let err = pipeline.render_frame(&GrayImage::from_pixel(48, 64, Luma([90]))).unwrap_err();
        assert!(matches!(err, AsciiError::CanvasMismatch { .. }));
    }

    #[test]
    fn new_target_discards_stale_results() {
        let mut c = ImageConverter::new(ConversionOptions::default().with_target(100, 100)).unwrap();
        c.set_frame(DynamicImage::ImageLuma8(GrayImage::from_pixel(256, 256, Luma([60]))));
        c.scale().unwrap();
        c.create_text().unwrap();

        c.set_target(20, 20).unwrap();
        assert!(c.text().is_none());
        assert!(matches!(c.write_text(None), Err(AsciiError::Precondition(_))));

        c.scale().unwrap();
        let grid = c.create_text().unwrap();
        assert_eq!((grid.columns(), grid.row_count()), (20, 8));

        assert!(c.set_target(0, 5).is_err());
        assert!(c.text().is_some());
    }

    #[test]
    fn gif_encodes_straight_to_output() {
        let plan = EncodePlan::for_input(Path::new("clips/dance.gif"), None);
        assert_eq!(plan.final_path, PathBuf::from("clips/dance_ascii.gif"));
        assert_eq!(plan.encode_path, plan.final_path);
        assert!(!plan.needs_mux);

        let factory = RecordingFactory::default();
        let mut writer = plan.writer(factory.clone(), 10.0, &ConversionOptions::default());
        assert_eq!(writer.path(), Path::new("clips/dance_ascii.gif"));
        writer.push(crate::writer::testing::tagged(1)).unwrap();
        writer.finish().unwrap();
        assert_eq!(factory.log.borrow().opened, vec![PathBuf::from("clips/dance_ascii.gif")]);

        let unused = FfmpegConfig { ffmpeg: PathBuf::from("no-such-ffmpeg"), ..FfmpegConfig::default() };
        assert!(!plan.finalize(&unused, Path::new("clips/dance.gif")).unwrap());
    }

    #[test]
    fn video_encodes_to_temp_then_muxes() {
        let plan = EncodePlan::for_input(Path::new("clips/talk.mp4"), Some(Path::new("out/talk.mp4")));
        assert_eq!(plan.final_path, PathBuf::from("out/talk.mp4"));
        assert_eq!(plan.encode_path, PathBuf::from("out/talk.noaudio.mp4"));
        assert!(plan.needs_mux);

        let factory = RecordingFactory::default();
        let mut writer = plan.writer(factory.clone(), 24.0, &ConversionOptions::default().with_batch_size(2));
        assert_eq!(writer.path(), Path::new("out/talk.noaudio.mp4"));
        for i in 0..3u8 {
            writer.push(crate::writer::testing::tagged(i)).unwrap();
        }
        writer.finish().unwrap();
        assert_eq!(factory.log.borrow().opened, vec![PathBuf::from("out/talk.noaudio.mp4")]);

        let default = EncodePlan::for_input(Path::new("clips/talk.webm"), None);
        assert_eq!(default.encode_path, PathBuf::from("clips/talk_ascii.noaudio.webm"));
    }

    #[test]
    fn failed_mux_keeps_the_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("talk.mp4");
        fs::write(&input, b"source").unwrap();
        let plan = EncodePlan::for_input(&input, None);
        fs::write(&plan.encode_path, b"silent video").unwrap();

        let missing = FfmpegConfig { ffmpeg: dir.path().join("no-such-ffmpeg"), ..FfmpegConfig::default() };
        let err = plan.finalize(&missing, &input).unwrap_err();
        assert!(matches!(err, AsciiError::Encoder(_)));
        assert!(plan.encode_path.exists());
        assert!(!plan.final_path.exists());
    }
}
