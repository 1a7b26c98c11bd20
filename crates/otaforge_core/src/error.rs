use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("corrupt data: {0}")]
    Corrupt(String),

    #[error("invalid ramdisk: {0}")]
    InvalidRamdisk(String),

    #[error("prepatched boot image is not compatible with the original:\n{0}")]
    IncompatibleImage(String),

    #[error("key mismatch: {0}")]
    KeyMismatch(String),

    #[error("signing failed: {0}")]
    SigningFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error on {path}: {source}")]
    IoPath {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("protobuf decode error: {0}")]
    Proto(#[from] prost::DecodeError),
}

impl PatchError {
    pub fn io_path(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PatchError::IoPath {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PatchError>;
