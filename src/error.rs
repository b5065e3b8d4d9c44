use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, AsciiError>;

/// Errors returned by every stage of the conversion pipeline.
#[derive(thiserror::Error, Debug)]
pub enum AsciiError {
    /// The source file does not exist.
    #[error("input file does not exist: {}", path.display())]
    MissingInput { path: PathBuf },

    /// A multi-channel frame could not be reduced to grayscale.
    #[error("grayscale conversion failed: {0}")]
    PixelFormat(String),

    /// A stage was called before the stage feeding it produced output.
    #[error("nothing to do: {0}")]
    Precondition(&'static str),

    /// A glyph grid does not match the canvas frozen on the first frame.
    #[error("canvas mismatch: canvas was sized for {expected}, got {got}")]
    CanvasMismatch { expected: String, got: String },

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("font error: {0}")]
    Font(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AsciiError {
    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn font(msg: impl Into<String>) -> Self {
        Self::Font(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(AsciiError::encoder("x").to_string().contains("encoder error:"));
        assert!(AsciiError::config("x").to_string().contains("invalid configuration:"));
        assert!(AsciiError::font("x").to_string().contains("font error:"));
        assert!(AsciiError::Precondition("no frame").to_string().contains("no frame"));
    }

    #[test]
    fn missing_input_names_the_path() {
        let err = AsciiError::MissingInput { path: PathBuf::from("clip.mp4") };
        assert!(err.to_string().contains("clip.mp4"));
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = AsciiError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
    }
}
