use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use img2ascii::{convert_image, convert_video_file, paths, AppConfig, ConversionOptions, FrameErrorPolicy, Progress, ProgressPhase};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(version, about = "Convert an image, GIF or video into ASCII art.")]
struct Args {
    /// Video or GIF to convert
    #[arg(short, long)]
    video: Option<PathBuf>,

    /// Image to convert
    #[arg(short, long)]
    image: Option<PathBuf>,

    /// x264 speed, 0 (placebo) to 9 (ultrafast)
    #[arg(long, visible_alias = "cs", value_parser = clap::value_parser!(u8).range(0..=9))]
    compression_speed: Option<u8>,

    /// Maximum glyph columns
    #[arg(long)]
    columns: Option<u32>,

    /// Maximum glyph rows
    #[arg(long)]
    rows: Option<u32>,

    /// Glyph ramp: 0 detailed, 1 compact
    #[arg(long)]
    ramp: Option<usize>,

    /// Font size multiplier for rendered output
    #[arg(long)]
    upscale: Option<u32>,

    /// Frames buffered between encoder flushes
    #[arg(long)]
    batch_size: Option<usize>,

    /// Monospace font file (.ttf/.otf)
    #[arg(long)]
    font: Option<PathBuf>,

    /// Rendered image or video output path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Text output path for image conversion
    #[arg(long)]
    text_output: Option<PathBuf>,

    /// Override the output file extension
    #[arg(long)]
    extension: Option<String>,

    /// Named preset from the config
    #[arg(long)]
    preset: Option<String>,

    /// Config file (JSON or TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// What to do when the encoder rejects a frame
    #[arg(long, value_enum)]
    on_frame_error: Option<FrameErrorPolicy>,

    /// Log filter passed to env_logger
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Overwrite existing outputs without asking
    #[arg(short, long, default_value_t = false)]
    yes: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(args.log_level.as_str())).init();

    let (video, image) = match (&args.video, &args.image) {
        (Some(_), Some(_)) => {
            log::warn!("Both --video and --image were given, pass only one");
            return Ok(());
        }
        (None, None) => {
            println!("Nothing happened");
            return Ok(());
        }
        (v, i) => (v.clone(), i.clone()),
    };

    let cfg = AppConfig::load(args.config.as_deref()).context("loading config")?;
    let options = build_options(&cfg, &args)?;
    let interactive = !args.yes && std::io::stdin().is_terminal();

    if let Some(input) = image {
        let text_out = paths::text_output_path(&input, args.text_output.as_deref());
        let image_out = paths::media_output_path(&input, args.output.as_deref(), args.extension.as_deref());
        if !confirm_overwrite(&[text_out.as_path(), image_out.as_path()], interactive)? {
            println!("Operation cancelled.");
            return Ok(());
        }
        println!("Converting image to ASCII...");
        let outputs = convert_image(&input, Some(&text_out), Some(&image_out), None, &options)
            .with_context(|| format!("converting {}", input.display()))?;
        println!("Wrote {} and {}", outputs.text.display(), outputs.image.display());
    } else if let Some(input) = video {
        let out = paths::media_output_path(&input, args.output.as_deref(), args.extension.as_deref());
        if !confirm_overwrite(&[out.as_path()], interactive)? {
            println!("Operation cancelled.");
            return Ok(());
        }
        println!("Converting video to ASCII...");
        let report = run_video(&input, &out, &options)?;
        println!(
            "Wrote {} ({} frames{})",
            report.output.display(),
            report.stats.frames_written,
            if report.audio_merged { ", audio merged" } else { "" }
        );
    }

    Ok(())
}

/// Preset values from the config, overridden by any explicit flags.
fn build_options(cfg: &AppConfig, args: &Args) -> Result<ConversionOptions> {
    let preset = args.preset.as_deref().unwrap_or(cfg.default_preset.as_str());
    let mut options = cfg.options_for(preset)?;

    let horizontal = args.columns.unwrap_or(options.target.horizontal);
    let vertical = args.rows.unwrap_or(options.target.vertical);
    options = options.with_target(horizontal, vertical);
    if let Some(ramp) = args.ramp {
        options = options.with_ramp_level(ramp);
    }
    if let Some(upscale) = args.upscale {
        options = options.with_upscale(upscale);
    }
    if let Some(batch) = args.batch_size {
        options = options.with_batch_size(batch);
    }
    if let Some(font) = &args.font {
        options = options.with_font_path(font);
    }
    if let Some(policy) = args.on_frame_error {
        options = options.with_frame_error_policy(policy);
    }
    if let Some(speed) = args.compression_speed {
        options = options.with_compression_speed(speed);
    }
    options.validate()?;
    Ok(options)
}

fn confirm_overwrite(outputs: &[&Path], interactive: bool) -> Result<bool> {
    let existing: Vec<String> = outputs.iter().filter(|p| p.exists()).map(|p| p.display().to_string()).collect();
    if existing.is_empty() || !interactive {
        return Ok(true);
    }
    let confirmed = Confirm::new()
        .with_prompt(format!("{} already exists. Overwrite?", existing.join(", ")))
        .default(false)
        .interact()?;
    Ok(confirmed)
}

fn run_video(input: &Path, out: &Path, options: &ConversionOptions) -> Result<img2ascii::VideoReport> {
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")?
        .progress_chars("#>-");
    let mut bar: Option<ProgressBar> = None;

    let report = convert_video_file(input, Some(out), options, |progress: &Progress| {
        let pb = bar.get_or_insert_with(|| {
            let pb = ProgressBar::new(progress.total);
            pb.set_style(style.clone());
            pb
        });
        match progress.phase {
            ProgressPhase::ConvertingFrames => {
                pb.set_position(progress.completed);
                match progress.eta_secs {
                    Some(s) => pb.set_message(format!("about {:.1}s to go", s)),
                    None => pb.set_message("converting frames"),
                }
            }
            ProgressPhase::MergingAudio => pb.set_message(progress.message.clone()),
            ProgressPhase::Complete => pb.finish_with_message("Done"),
        }
    })
    .with_context(|| format!("converting {}", input.display()))?;

    Ok(report)
}
