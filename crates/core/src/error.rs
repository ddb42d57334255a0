use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("content store unreachable: {message}")]
    Connectivity { message: String },

    #[error("export failed: {message}")]
    Export { message: String },

    #[error("export produced no archive at {path:?}")]
    ExportMissingOutput { path: PathBuf },

    #[error("upload failed: {message}")]
    Upload { message: String },

    #[error("object not found: {key}")]
    NotFound { key: String },

    #[error("storage error: {message}")]
    Storage { message: String },
}
