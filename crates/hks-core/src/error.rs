use std::path::Path;

use thiserror::Error;

pub type HksResult<T> = Result<T, HksError>;

#[derive(Debug, Error)]
pub enum HksError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not exist: {0}")]
    NotExist(String),
    #[error("invalid key file: {0}")]
    InvalidKeyFile(String),
    #[error("insufficient data: need {required} bytes, have {available}")]
    InsufficientData { required: usize, available: usize },
    #[error("buffer too small: need {required}, have {available}")]
    BufferTooSmall { required: usize, available: usize },
    #[error("memory allocation failed for {0} bytes")]
    MallocFail(usize),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("bad state: {0}")]
    BadState(String),
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("no permission: {0}")]
    NoPermission(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("open file failed for {path}: {reason}")]
    OpenFileFail { path: String, reason: String },
    #[error("write file failed for {path}: {reason}")]
    WriteFileFail { path: String, reason: String },
    #[error("read file failed for {path}: {reason}")]
    ReadFileFail { path: String, reason: String },
    #[error("remove file failed for {path}: {reason}")]
    RemoveFileFail { path: String, reason: String },
    #[error("make dir failed for {path}: {reason}")]
    MakeDirFail { path: String, reason: String },
    #[error("file size unavailable for {0}")]
    FileSizeFail(String),
}

impl HksError {
    pub fn invalid<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidArgument(err.to_string())
    }
    pub fn corrupt<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidKeyFile(err.to_string())
    }
    pub fn storage<E: std::fmt::Display>(err: E) -> Self {
        Self::StorageFailure(err.to_string())
    }
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::InternalError(err.to_string())
    }
    pub fn crypto<E: std::fmt::Display>(err: E) -> Self {
        Self::Crypto(err.to_string())
    }

    pub fn open_file<E: std::fmt::Display>(path: &Path, err: E) -> Self {
        Self::OpenFileFail {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
    pub fn write_file<E: std::fmt::Display>(path: &Path, err: E) -> Self {
        Self::WriteFileFail {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
    pub fn read_file<E: std::fmt::Display>(path: &Path, err: E) -> Self {
        Self::ReadFileFail {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
    pub fn remove_file<E: std::fmt::Display>(path: &Path, err: E) -> Self {
        Self::RemoveFileFail {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }
    pub fn make_dir<E: std::fmt::Display>(path: &Path, err: E) -> Self {
        Self::MakeDirFail {
            path: path.display().to_string(),
            reason: err.to_string(),
        }
    }

    /// Numeric code surfaced across the service boundary.
    pub fn code(&self) -> i32 {
        match self {
            Self::BadState(_) => -2,
            Self::InvalidArgument(_) => -3,
            Self::NotSupported(_) => -4,
            Self::NoPermission(_) => -5,
            Self::InsufficientData { .. } => -6,
            Self::BufferTooSmall { .. } => -7,
            Self::StorageFailure(_) => -10,
            Self::NotExist(_) => -13,
            Self::FileSizeFail(_) => -15,
            Self::ReadFileFail { .. } => -16,
            Self::MallocFail(_) => -21,
            Self::InvalidKeyFile(_) => -27,
            Self::OpenFileFail { .. } => -28,
            Self::WriteFileFail { .. } => -29,
            Self::RemoveFileFail { .. } => -30,
            Self::Crypto(_) => -31,
            Self::MakeDirFail { .. } => -32,
            Self::InternalError(_) => -999,
        }
    }

    /// True when nothing is stored under the name, as opposed to corruption or I/O failure.
    pub fn is_not_exist(&self) -> bool {
        matches!(self, Self::NotExist(_))
    }
}
