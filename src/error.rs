// top-level error for the public API
//
// Only resource-class failures surface here. Shape, dtype, and arity
// violations are programmer errors and assert at build time instead of
// returning (the graph would be malformed either way).

#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    /// The arena backing a context cannot satisfy an allocation.
    #[error("{arena} arena exhausted: needed {needed} bytes, {available} available")]
    OutOfArena {
        /// Label such as `"context"`, `"scratch"`, `"object"`.
        arena: &'static str,
        needed: usize,
        available: usize,
    },

    /// The caller-provided work buffer is smaller than the plan requires.
    /// Retry with a buffer of at least `needed` bytes.
    #[error("work buffer too small: plan needs {needed} bytes, {available} provided")]
    WorkBufferTooSmall { needed: usize, available: usize },

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker thread {index} of {requested}")]
    ThreadSpawn {
        index: usize,
        requested: usize,
        #[source]
        source: std::io::Error,
    },

    /// A container file could not be read or written.
    #[error("{operation} failed for '{path}'")]
    FileSystem {
        operation: &'static str,
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The container header did not start with the expected magic bytes.
    #[error("unknown container magic 0x{magic:08x}")]
    InvalidMagic { magic: u32 },

    /// The container version is not one this reader understands.
    #[error("unsupported container version {version}")]
    UnsupportedVersion { version: u32 },

    /// A tensor info record names a dtype tag this build does not know.
    #[error("unknown dtype tag {tag} for tensor '{name}'")]
    UnknownDtype { tag: u32, name: String },

    /// A metadata record carries a value-type tag outside the known set.
    #[error("unrecognized metadata value type {tag} (0x{tag:08x})")]
    UnknownValueType { tag: u32 },

    /// A metadata value was present but of the wrong type.
    #[error("metadata key '{key}' is not a {expected}")]
    MetadataType {
        key: String,
        expected: &'static str,
    },

    /// Structural problem in a container body (truncated record, bad bool,
    /// tensor payload past end of file, and so on).
    #[error("malformed container: {reason}")]
    MalformedContainer { reason: String },
}

pub type ComputeResult<T> = std::result::Result<T, ComputeError>;
