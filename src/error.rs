use std::time::Duration;

use thiserror::Error;

/// Structural problems with a CNPJ candidate. These never reach the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("expected 14 digits, found {found}")]
    Length { found: usize },
    #[error("unexpected character {ch:?}")]
    NonDigit { ch: char },
    #[error("identifier is a single repeated digit")]
    RepeatedDigits,
    #[error("check digits {found} do not match expected {expected}")]
    ChecksumMismatch { expected: String, found: String },
    #[error("root {0} does not fit in 8 digits")]
    RootOutOfRange(u32),
    #[error("branch {0} does not fit in 4 digits")]
    BranchOutOfRange(u32),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("not found")]
    NotFound,
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("undecodable response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint format: {0}")]
    Format(#[from] serde_json::Error),
    #[error("checkpoint version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("reference set {0} is empty")]
    Empty(&'static str),
}
