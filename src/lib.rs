//! # img2ascii - ASCII Art Converter Library
//!
//! `img2ascii` turns images, GIFs and videos into ASCII art: a text grid of
//! glyphs, and that grid rendered back to an image or an encoded video.
//!
//! ## Features
//!
//! - Area-averaged scaling to a bounded character grid, corrected for glyph aspect
//! - Two glyph ramps (70 and 10 characters) with configurable quantization
//! - Monospace rasterization on a canvas reused across video frames
//! - Batched ffmpeg encoding with the source audio re-attached
//! - Progress reporting with a remaining-time estimate
//!
//! ## Example
//!
//! ```no_run
//! use img2ascii::{convert_image, ConversionOptions};
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let options = ConversionOptions::default().with_target(200, 200).with_ramp_level(1);
//! let outputs = convert_image(Path::new("rick.png"), None, None, None, &options)?;
//! println!("wrote {} and {}", outputs.text.display(), outputs.image.display());
//! # Ok(())
//! # }
//! ```
//!
//! ## Progress Reporting
//!
//! ```no_run
//! use img2ascii::{convert_video_file, ConversionOptions, ProgressPhase};
//! use std::path::Path;
//!
//! let options = ConversionOptions::default();
//! convert_video_file(Path::new("clip.mp4"), None, &options, |progress| match progress.phase {
//!     ProgressPhase::ConvertingFrames => println!("{}", progress.message),
//!     ProgressPhase::MergingAudio => println!("Adding audio..."),
//!     ProgressPhase::Complete => println!("Done!"),
//! })
//! .unwrap();
//! ```

pub mod config;
pub mod convert;
pub mod error;
pub mod paths;
pub mod progress;
pub mod ramp;
pub mod raster;
pub mod scale;
pub mod source;
pub mod writer;

pub use config::{AppConfig, ConversionOptions, FfmpegConfig, FrameErrorPolicy, Preset, Quantization, ScaleTarget, X264_PRESETS};
pub use convert::{convert_image, convert_video_file, EncodePlan, FramePipeline, ImageConverter, ImageOutputs, VideoConverter, VideoReport};
pub use error::{AsciiError, Result};
pub use progress::{EtaTracker, Progress, ProgressPhase};
pub use ramp::{map_glyphs, GlyphGrid, GlyphRamp, RAMPS};
pub use raster::{CanvasLayout, Rasterizer};
pub use source::{FrameSource, VideoSource};
pub use writer::{EncoderFactory, FfmpegFactory, FlushStats, FrameEncoder, VideoWriter};
