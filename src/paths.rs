use std::ffi::OsString;
use std::path::{Path, PathBuf};

const ASCII_SUFFIX: &str = "_ascii";

fn with_stem_suffix(path: &Path, suffix: &str, ext: Option<&str>) -> PathBuf {
    let mut name = path.file_stem().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    if let Some(ext) = ext.filter(|e| !e.is_empty()) {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}

/// `photo.png` -> `photo_ascii.txt`
pub fn default_text_path(input: &Path) -> PathBuf {
    with_stem_suffix(input, ASCII_SUFFIX, Some("txt"))
}

/// Append `.txt` unless the path already ends in it (any case).
pub fn coerce_txt_extension(path: &Path) -> PathBuf {
    let is_txt = path.extension().and_then(|e| e.to_str()).is_some_and(|e| e.eq_ignore_ascii_case("txt"));
    if is_txt {
        return path.to_path_buf();
    }
    let mut s = path.as_os_str().to_os_string();
    s.push(".txt");
    PathBuf::from(s)
}

/// Text output path: `custom` coerced to `.txt`, else the default beside `input`.
pub fn text_output_path(input: &Path, custom: Option<&Path>) -> PathBuf {
    match custom {
        Some(p) => coerce_txt_extension(p),
        None => default_text_path(input),
    }
}

/// `clip.mp4` -> `clip_ascii.mp4`
pub fn default_media_path(input: &Path) -> PathBuf {
    let ext = input.extension().and_then(|e| e.to_str());
    with_stem_suffix(input, ASCII_SUFFIX, ext)
}

/// Image or video output path: `custom` or the default, with the extension
/// replaced by `extension` when one is given.
pub fn media_output_path(input: &Path, custom: Option<&Path>, extension: Option<&str>) -> PathBuf {
    let path = custom.map(Path::to_path_buf).unwrap_or_else(|| default_media_path(input));
    match extension.map(|e| e.trim_start_matches('.')).filter(|e| !e.is_empty()) {
        Some(ext) => path.with_extension(ext),
        None => path,
    }
}

/// Where the silent video is written before audio is merged into `final_path`.
pub fn temp_video_path(final_path: &Path) -> PathBuf {
    let ext = final_path.extension().and_then(|e| e.to_str());
    with_stem_suffix(final_path, ".noaudio", ext)
}
