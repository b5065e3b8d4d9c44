use image::GrayImage;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};

use crate::config::{FfmpegConfig, FrameErrorPolicy};
use crate::error::{AsciiError, Result};
use crate::source::is_gif;

/// A streaming encoder that accepts frames in order until finished.
pub trait FrameEncoder {
    fn append(&mut self, frame: &GrayImage) -> Result<()>;

    /// Flush and release the encoder.
    fn finish(self) -> Result<()>;
}

/// Opens encoders bound to an output path.
pub trait EncoderFactory {
    type Encoder: FrameEncoder;

    fn open(&mut self, path: &Path, fps: f64, width: u32, height: u32) -> Result<Self::Encoder>;
}

/// Encodes raw gray frames by piping them into `ffmpeg`.
pub struct FfmpegEncoder {
    width: u32,
    height: u32,
    out_path: PathBuf,
    child: Child,
    stdin: Option<ChildStdin>,
    stderr: Option<JoinHandle<String>>,
}

/// Read `pipe` to the end on its own thread so the child never blocks on a full pipe.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut bytes) {
            log::debug!("Reading ffmpeg stderr failed: {}", e);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    })
}

fn uses_x264(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()).is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "mp4" | "m4v" | "mov" | "mkv"))
}

/// Output-side ffmpeg arguments for `path`.
pub fn output_args(path: &Path, preset: &str) -> Vec<String> {
    if is_gif(path) {
        return Vec::new();
    }
    // yuv420p needs even dimensions
    let mut args: Vec<String> = vec!["-vf".into(), "pad=ceil(iw/2)*2:ceil(ih/2)*2".into()];
    if uses_x264(path) {
        args.extend(["-c:v".into(), "libx264".into(), "-preset".into(), preset.to_string()]);
    }
    args.extend(["-pix_fmt".into(), "yuv420p".into()]);
    args
}

impl FfmpegEncoder {
    pub fn spawn(ffmpeg: &FfmpegConfig, path: &Path, fps: f64, width: u32, height: u32, preset: &str) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(AsciiError::encoder(format!("frame dimensions must be non-zero, got {}x{}", width, height)));
        }
        if fps <= 0.0 {
            return Err(AsciiError::encoder(format!("fps must be positive, got {}", fps)));
        }

        let mut cmd = Command::new(ffmpeg.ffmpeg_cmd());
        cmd.args(["-y", "-hide_banner", "-loglevel", "error", "-f", "rawvideo", "-pix_fmt", "gray"])
            .args(["-s", &format!("{}x{}", width, height), "-r", &format!("{}", fps)])
            .args(["-i", "pipe:0", "-an"])
            .args(output_args(path, preset))
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        log::debug!("Spawning encoder: {:?}", cmd);

        let mut child = cmd.spawn().map_err(|e| AsciiError::encoder(format!("failed to spawn ffmpeg (is it installed and on PATH?): {}", e)))?;
        let stdin = child.stdin.take().ok_or_else(|| AsciiError::encoder("failed to open ffmpeg stdin"))?;
        let stderr = child.stderr.take().map(drain);

        Ok(Self { width, height, out_path: path.to_path_buf(), child, stdin: Some(stdin), stderr })
    }
}

impl FrameEncoder for FfmpegEncoder {
    fn append(&mut self, frame: &GrayImage) -> Result<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(AsciiError::encoder(format!(
                "frame size mismatch: got {}x{}, expected {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(AsciiError::encoder("ffmpeg encoder is already finalized"));
        };
        stdin.write_all(frame.as_raw()).map_err(|e| AsciiError::encoder(format!("failed to write frame to ffmpeg: {}", e)))
    }

    fn finish(mut self) -> Result<()> {
        drop(self.stdin.take());
        let status = self.child.wait().map_err(|e| AsciiError::encoder(format!("failed waiting for ffmpeg: {}", e)))?;
        let stderr = self.stderr.take().and_then(|h| h.join().ok()).unwrap_or_default();
        if !status.success() {
            return Err(AsciiError::encoder(format!("ffmpeg exited with {} writing {}: {}", status, self.out_path.display(), stderr.trim())));
        }
        Ok(())
    }
}

/// Opens [`FfmpegEncoder`]s with a fixed x264 preset.
#[derive(Debug, Clone)]
pub struct FfmpegFactory {
    pub ffmpeg: FfmpegConfig,
    pub preset: &'static str,
}

impl EncoderFactory for FfmpegFactory {
    type Encoder = FfmpegEncoder;

    fn open(&mut self, path: &Path, fps: f64, width: u32, height: u32) -> Result<FfmpegEncoder> {
        FfmpegEncoder::spawn(&self.ffmpeg, path, fps, width, height, self.preset)
    }
}

/// Audio codec the container at `out` accepts.
pub fn audio_codec(out: &Path) -> &'static str {
    let ext = out.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some("webm" | "ogg" | "ogv") => "libopus",
        _ => "aac",
    }
}

/// ffmpeg arguments that copy the video of `video` and re-encode the audio of
/// `audio_source` for the container at `out`.
pub fn mux_args(video: &Path, audio_source: &Path, out: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-y", "-hide_banner", "-loglevel", "error", "-i"].map(OsString::from).to_vec();
    args.push(video.into());
    args.push("-i".into());
    args.push(audio_source.into());
    args.extend(["-map", "0:v:0", "-map", "1:a?", "-c:v", "copy", "-c:a", audio_codec(out), "-shortest"].map(OsString::from));
    args.push(out.into());
    args
}

/// Mux the video stream of `video` with the audio of `audio_source` into `out`.
/// A source without audio still yields `out`.
pub fn mux_audio(ffmpeg: &FfmpegConfig, video: &Path, audio_source: &Path, out: &Path) -> Result<()> {
    let output = Command::new(ffmpeg.ffmpeg_cmd())
        .args(mux_args(video, audio_source, out))
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| AsciiError::encoder(format!("failed to run ffmpeg for audio mux: {}", e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AsciiError::encoder(format!("audio mux failed: {}", stderr.trim())));
    }
    Ok(())
}

/// Counters reported when a writer finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Full batches flushed while frames were still arriving
    pub periodic_flushes: usize,
    /// Frames accepted by the encoder
    pub frames_written: usize,
    /// Frames flushed one by one at end of stream
    pub final_frames: usize,
    /// Frames the encoder rejected under [`FrameErrorPolicy::Skip`]
    pub dropped_frames: usize,
    /// Encoders opened over the run
    pub opens: usize,
}

/// Observable writer state. Flushing happens inside [`VideoWriter::push`]
/// and always returns to `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterPhase {
    Uninitialized,
    Open,
    Closed,
}

enum WriterState<E> {
    Uninitialized,
    Open(E),
    Closed,
}

/// Buffers rendered frames and hands them to an encoder every `batch_size` frames.
///
/// The encoder is opened on the first flush, reopened if frames arrive after
/// [`close`](Self::close), and closed exactly once, by `finish`, `close` or drop.
pub struct VideoWriter<F: EncoderFactory> {
    factory: F,
    path: PathBuf,
    fps: f64,
    batch_size: usize,
    policy: FrameErrorPolicy,
    buffer: Vec<GrayImage>,
    state: WriterState<F::Encoder>,
    stats: FlushStats,
}

impl<F: EncoderFactory> VideoWriter<F> {
    pub fn new(factory: F, path: impl Into<PathBuf>, fps: f64, batch_size: usize, policy: FrameErrorPolicy) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            factory,
            path: path.into(),
            fps,
            batch_size,
            policy,
            buffer: Vec::with_capacity(batch_size),
            state: WriterState::Uninitialized,
            stats: FlushStats::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn phase(&self) -> WriterPhase {
        match self.state {
            WriterState::Uninitialized => WriterPhase::Uninitialized,
            WriterState::Open(_) => WriterPhase::Open,
            WriterState::Closed => WriterPhase::Closed,
        }
    }

    /// Frames waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> FlushStats {
        self.stats
    }

    /// Buffer `frame`, flushing the whole batch once `batch_size` frames are held.
    pub fn push(&mut self, frame: GrayImage) -> Result<()> {
        self.buffer.push(frame);
        if self.buffer.len() >= self.batch_size {
            let batch = mem::replace(&mut self.buffer, Vec::with_capacity(self.batch_size));
            log::debug!("Flushing {} frames to {}", batch.len(), self.path.display());
            for frame in &batch {
                self.append(frame)?;
            }
            self.stats.periodic_flushes += 1;
        }
        Ok(())
    }

    fn encoder(&mut self, width: u32, height: u32) -> Result<&mut F::Encoder> {
        if !matches!(self.state, WriterState::Open(_)) {
            if matches!(self.state, WriterState::Closed) {
                log::warn!("Writer for {} was closed, reopening", self.path.display());
            }
            let encoder = self.factory.open(&self.path, self.fps, width, height)?;
            self.stats.opens += 1;
            self.state = WriterState::Open(encoder);
        }
        match &mut self.state {
            WriterState::Open(encoder) => Ok(encoder),
            _ => Err(AsciiError::Precondition("encoder is not open")),
        }
    }

    fn append(&mut self, frame: &GrayImage) -> Result<()> {
        let policy = self.policy;
        let result = self.encoder(frame.width(), frame.height())?.append(frame);
        match result {
            Ok(()) => {
                self.stats.frames_written += 1;
                Ok(())
            }
            Err(e) if policy == FrameErrorPolicy::Skip => {
                log::warn!("Dropping frame {}: {}", self.stats.frames_written + self.stats.dropped_frames + 1, e);
                self.stats.dropped_frames += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Release the encoder. A later `push` opens a fresh one.
    pub fn close(&mut self) -> Result<()> {
        match mem::replace(&mut self.state, WriterState::Closed) {
            WriterState::Open(encoder) => encoder.finish(),
            WriterState::Uninitialized => {
                self.state = WriterState::Uninitialized;
                Ok(())
            }
            WriterState::Closed => Ok(()),
        }
    }

    /// Flush a partial final batch frame by frame, then close.
    pub fn finish(&mut self) -> Result<FlushStats> {
        let rest = mem::take(&mut self.buffer);
        for frame in &rest {
            self.append(frame)?;
            self.stats.final_frames += 1;
        }
        self.close()?;
        Ok(self.stats)
    }
}

impl<F: EncoderFactory> Drop for VideoWriter<F> {
    fn drop(&mut self) {
        if let WriterState::Open(encoder) = mem::replace(&mut self.state, WriterState::Closed) {
            if let Err(e) = encoder.finish() {
                log::error!("Closing {} failed: {}", self.path.display(), e);
            }
        }
    }
}
