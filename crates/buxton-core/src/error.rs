//! Typed errors for the codec, model, and config layers.
//!
//! Binaries (`buxtond`, `buxton-ctl`) wrap these in `anyhow::Result` at
//! their outermost boundary; library code keeps them typed so the
//! resolver can map them deterministically onto a `StatusCode`.

use crate::wire::MAX_FRAME_LEN;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("bad magic: expected 0x{expected:x}, got 0x{actual:x}")]
    BadMagic { expected: u32, actual: u32 },

    #[error("frame length {0} exceeds the {MAX_FRAME_LEN}-byte cap")]
    FrameTooLarge(u32),

    #[error("frame declares total_len {declared} but buffer holds {actual}")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("param count {0} exceeds the 16-param cap")]
    TooManyParams(u32),

    #[error("unknown or forbidden message type 0x{0:x} for this direction")]
    BadMessageType(u32),

    #[error("unknown value type tag {0}")]
    UnknownValueType(u32),

    #[error("length field overflowed while parsing parameter {index}")]
    LengthOverflow { index: usize },

    #[error("parameter {index} string value is not valid UTF-8")]
    InvalidUtf8 { index: usize },

    #[error("buffer ended before the declared frame length")]
    Truncated,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(std::path::PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(std::path::PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(std::path::PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("failed to parse layer config {path}: {reason}")]
    LayerConfigInvalid { path: std::path::PathBuf, reason: String },
}
