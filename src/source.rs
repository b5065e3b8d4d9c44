//! Grayscale frame sources: still images through `image`, videos through an
//! `ffmpeg` subprocess writing raw rgb24 frames to a pipe.

use image::{DynamicImage, GrayImage, RgbImage};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use crate::config::FfmpegConfig;
use crate::error::{AsciiError, Result};

/// Sequential supplier of grayscale frames.
pub trait FrameSource {
    /// Next frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<GrayImage>>;

    /// Frames per second of the stream.
    fn fps(&self) -> f64;

    /// Total frames, 0 when the container does not say.
    fn frame_count(&self) -> u64;
}

/// Reduce any decoded image to a single intensity channel.
pub fn to_grayscale(img: DynamicImage) -> GrayImage {
    match img {
        DynamicImage::ImageLuma8(gray) => gray,
        other => {
            log::debug!("Converting {:?} frame to grayscale", other.color());
            other.to_luma8()
        }
    }
}

/// Decode `path` and convert it to grayscale.
pub fn load_gray_image(path: &Path) -> Result<GrayImage> {
    if !path.exists() {
        return Err(AsciiError::MissingInput { path: path.to_path_buf() });
    }
    let img = image::open(path)?;
    Ok(to_grayscale(img))
}

/// `true` when the path names a GIF, which is written without an audio pass.
pub fn is_gif(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.to_ascii_lowercase().contains("gif"))
}

/// Stream metadata reported by ffprobe, in display orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoInfo {
    /// Width after rotation metadata is applied
    pub width: u32,
    /// Height after rotation metadata is applied
    pub height: u32,
    pub fps: f64,
    /// 0 when unknown
    pub frame_count: u64,
    /// Display rotation in degrees, normalized to 0, 90, 180 or 270
    pub rotation: u32,
}

fn parse_rate(val: &str) -> Option<f64> {
    // "24/1", "30000/1001"
    let mut parts = val.splitn(2, '/');
    let num: f64 = parts.next()?.parse().ok()?;
    let den: f64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(1.0);
    Some(num / den).filter(|f| den > 0.0 && f.is_finite() && *f > 0.0)
}

/// Parse `key=value` lines from `ffprobe -of default=noprint_wrappers=1`.
///
/// A quarter-turn rotation (side data `rotation=` or the older `TAG:rotate=`)
/// swaps width and height. Without `nb_frames`, the frame count is estimated
/// from `duration` and the frame rate.
pub fn parse_probe_output(text: &str) -> Option<VideoInfo> {
    let mut width = None;
    let mut height = None;
    let mut fps = None;
    let mut frame_count = 0u64;
    let mut duration = None;
    let mut rotation = 0i64;

    for line in text.lines() {
        let line = line.trim();
        if let Some(val) = line.strip_prefix("width=") {
            width = val.parse::<u32>().ok();
        } else if let Some(val) = line.strip_prefix("height=") {
            height = val.parse::<u32>().ok();
        } else if let Some(val) = line.strip_prefix("r_frame_rate=") {
            fps = parse_rate(val);
        } else if let Some(val) = line.strip_prefix("nb_frames=") {
            frame_count = val.parse().unwrap_or(0);
        } else if let Some(val) = line.strip_prefix("duration=") {
            // stream duration first, container duration after; N/A keeps the earlier value
            if let Some(d) = val.parse::<f64>().ok().filter(|d| d.is_finite() && *d > 0.0) {
                duration.get_or_insert(d);
            }
        } else if let Some(val) = line.strip_prefix("rotation=").or_else(|| line.strip_prefix("TAG:rotate=")) {
            if let Ok(deg) = val.parse::<f64>() {
                rotation = deg.round() as i64;
            }
        }
    }

    let (Some(width), Some(height), Some(fps)) = (width, height, fps) else {
        return None;
    };
    if width == 0 || height == 0 {
        return None;
    }
    if frame_count == 0 {
        frame_count = duration.map(|d| (d * fps).round() as u64).unwrap_or(0);
    }
    let rotation = rotation.rem_euclid(360) as u32;
    let (width, height) = if rotation == 90 || rotation == 270 { (height, width) } else { (width, height) };
    Some(VideoInfo { width, height, fps, frame_count, rotation })
}

/// Query ffprobe for the first video stream of `path`.
pub fn probe_video(path: &Path, ffmpeg: &FfmpegConfig) -> Result<VideoInfo> {
    let output = Command::new(ffmpeg.ffprobe_cmd())
        .args(["-v", "error", "-select_streams", "v:0"])
        .args(["-show_entries", "stream=width,height,r_frame_rate,nb_frames,duration:stream_tags=rotate:stream_side_data=rotation:format=duration"])
        .args(["-of", "default=noprint_wrappers=1"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| AsciiError::encoder(format!("failed to run ffprobe (is it installed and on PATH?): {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AsciiError::encoder(format!("ffprobe failed on {}: {}", path.display(), stderr.trim())));
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let info = parse_probe_output(&text).ok_or_else(|| AsciiError::encoder(format!("ffprobe found no video stream in {}", path.display())))?;
    log::info!(
        "Probed {}: {}x{} @ {:.3} fps, {} frames, rotated {}",
        path.display(),
        info.width,
        info.height,
        info.fps,
        info.frame_count,
        info.rotation
    );
    Ok(info)
}

/// Decoder output arguments. The scale filter pins every frame to the probed
/// display size so each read of `width * height * 3` bytes is one whole frame.
pub fn decoder_output_args(info: &VideoInfo) -> Vec<String> {
    vec![
        "-vf".into(),
        format!("scale={}:{}", info.width, info.height),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-an".into(),
        "pipe:1".into(),
    ]
}

/// Read exactly `buf.len()` bytes; `Ok(false)` on a clean EOF before the first byte.
pub fn read_frame_bytes<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut total = 0usize;
    while total < buf.len() {
        match reader.read(&mut buf[total..]) {
            Ok(0) if total == 0 => return Ok(false),
            Ok(0) => {
                log::warn!("Decoder stream ended mid-frame ({} of {} bytes), dropping partial frame", total, buf.len());
                return Ok(false);
            }
            Ok(n) => total += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Video or GIF decoded frame by frame through ffmpeg.
pub struct VideoSource {
    path: PathBuf,
    info: VideoInfo,
    child: Child,
    stdout: ChildStdout,
    buf: Vec<u8>,
}

impl VideoSource {
    /// Probe `path` and start the decoder.
    ///
    /// # Errors
    /// `MissingInput` when the file does not exist, `Encoder` when ffprobe or
    /// ffmpeg cannot be run or find a video stream.
    pub fn open(path: &Path, ffmpeg: &FfmpegConfig) -> Result<Self> {
        if !path.exists() {
            return Err(AsciiError::MissingInput { path: path.to_path_buf() });
        }
        let info = probe_video(path, ffmpeg)?;

        let mut child = Command::new(ffmpeg.ffmpeg_cmd())
            .args(["-hide_banner", "-loglevel", "error", "-i"])
            .arg(path)
            .args(decoder_output_args(&info))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AsciiError::encoder(format!("failed to spawn ffmpeg decoder: {}", e)))?;

        let stdout = child.stdout.take().ok_or_else(|| AsciiError::encoder("failed to open ffmpeg stdout"))?;
        let frame_bytes = info.width as usize * info.height as usize * 3;

        Ok(Self { path: path.to_path_buf(), info, child, stdout, buf: vec![0u8; frame_bytes] })
    }

    pub fn info(&self) -> VideoInfo {
        self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSource for VideoSource {
    fn next_frame(&mut self) -> Result<Option<GrayImage>> {
        if !read_frame_bytes(&mut self.stdout, &mut self.buf)? {
            return Ok(None);
        }
        let rgb = RgbImage::from_raw(self.info.width, self.info.height, self.buf.clone())
            .ok_or_else(|| AsciiError::PixelFormat(format!("decoded frame is not {}x{} rgb24", self.info.width, self.info.height)))?;
        Ok(Some(to_grayscale(DynamicImage::ImageRgb8(rgb))))
    }

    fn fps(&self) -> f64 {
        self.info.fps
    }

    fn frame_count(&self) -> u64 {
        self.info.frame_count
    }
}

impl Drop for VideoSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    #[test]
    fn probe_output_parses_rational_fps() {
        let info = parse_probe_output("width=1280\nheight=720\nr_frame_rate=30000/1001\nnb_frames=120\n").unwrap();
        assert_eq!((info.width, info.height, info.frame_count), (1280, 720, 120));
        assert!((info.fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn probe_output_tolerates_unknown_frame_count() {
        let info = parse_probe_output("width=320\nheight=240\nr_frame_rate=25/1\nnb_frames=N/A").unwrap();
        assert_eq!(info.frame_count, 0);
        assert!(parse_probe_output("width=320\nheight=240\nr_frame_rate=0/0").is_none());
        assert!(parse_probe_output("").is_none());
    }

    #[test]
    fn quarter_turn_swaps_display_size() {
        let side_data = parse_probe_output("width=1920\nheight=1080\nr_frame_rate=30/1\nnb_frames=300\nrotation=-90\n").unwrap();
        assert_eq!((side_data.width, side_data.height, side_data.rotation), (1080, 1920, 270));

        let tagged = parse_probe_output("width=1920\nheight=1080\nr_frame_rate=30/1\nTAG:rotate=90\n").unwrap();
        assert_eq!((tagged.width, tagged.height, tagged.rotation), (1080, 1920, 90));

        let flipped = parse_probe_output("width=1920\nheight=1080\nr_frame_rate=30/1\nrotation=180\n").unwrap();
        assert_eq!((flipped.width, flipped.height), (1920, 1080));
    }

    #[test]
    fn decoder_is_pinned_to_display_size() {
        let info = parse_probe_output("width=1920\nheight=1080\nr_frame_rate=30/1\nrotation=90\n").unwrap();
        let args = decoder_output_args(&info);
        assert!(args.windows(2).any(|w| w[0] == "-vf" && w[1] == "scale=1080:1920"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn missing_frame_count_falls_back_to_duration() {
        let info = parse_probe_output("width=640\nheight=360\nr_frame_rate=25/1\nnb_frames=N/A\nduration=12.040000\n").unwrap();
        assert_eq!(info.frame_count, 301);
        let container = parse_probe_output("width=640\nheight=360\nr_frame_rate=25/1\nnb_frames=N/A\nduration=N/A\nduration=4.000000\n").unwrap();
        assert_eq!(container.frame_count, 100);
        let none = parse_probe_output("width=640\nheight=360\nr_frame_rate=25/1\nnb_frames=N/A\nduration=N/A\n").unwrap();
        assert_eq!(none.frame_count, 0);
    }

    #[test]
    fn color_is_reduced_to_one_channel() {
        let rgb = RgbImage::from_pixel(4, 2, Rgb([255, 255, 255]));
        let gray = to_grayscale(DynamicImage::ImageRgb8(rgb));
        assert_eq!(gray.dimensions(), (4, 2));
        assert!(gray.pixels().all(|p| p[0] == 255));

        let already = GrayImage::from_pixel(3, 3, Luma([7]));
        assert_eq!(to_grayscale(DynamicImage::ImageLuma8(already.clone())), already);
    }

    #[test]
    fn missing_image_is_reported() {
        let err = load_gray_image(Path::new("definitely/not/here.png")).unwrap_err();
        assert!(matches!(err, AsciiError::MissingInput { .. }));
    }

    #[test]
    fn gif_detection_is_case_insensitive() {
        assert!(is_gif(Path::new("clip.GIF")));
        assert!(is_gif(Path::new("dir/clip.gif")));
        assert!(!is_gif(Path::new("clip.mp4")));
        assert!(!is_gif(Path::new("gif")));
    }

    #[test]
    fn frame_reader_distinguishes_eof() {
        let data = vec![1u8; 6];
        let mut reader = std::io::Cursor::new(data);
        let mut buf = [0u8; 3];
        assert!(read_frame_bytes(&mut reader, &mut buf).unwrap());
        assert!(read_frame_bytes(&mut reader, &mut buf).unwrap());
        assert!(!read_frame_bytes(&mut reader, &mut buf).unwrap());
    }
}
