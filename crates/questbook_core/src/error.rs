use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to one of the remote endpoints (wiki or task API).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid endpoint url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },
    #[error("failed to decode {what}: {detail}")]
    Decode { what: String, detail: String },
    #[error("remote api error [{code}]: {info}")]
    Api { code: String, info: String },
    #[error("request to {endpoint} exhausted its retry budget")]
    RetriesExhausted { endpoint: String },
}

impl FetchError {
    pub fn decode(what: impl Into<String>, detail: impl ToString) -> Self {
        Self::Decode {
            what: what.into(),
            detail: detail.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to write cached page {path}: {source}")]
    WritePage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write cache manifest {path}: {source}")]
    WriteManifest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode cache manifest: {0}")]
    EncodeManifest(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A wiki page whose markup could not be turned into quest data.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("page is empty")]
    Empty,
    #[error("page is a redirect to {0}")]
    Redirect(String),
    #[error("quest infobox not found")]
    MissingInfobox,
    #[error("quest infobox is not terminated")]
    UnterminatedInfobox,
    #[error("invalid extraction pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("duplicate quest normalized name: {0}")]
    DuplicateQuest(String),
    #[error("quest {0} references itself")]
    SelfReference(String),
}
