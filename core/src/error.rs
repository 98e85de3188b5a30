use reqwest::StatusCode;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayErr>;

/// Failures of the relay side: the upstream request and the stream it feeds.
///
/// Malformed frames are deliberately absent: they are recovered in place by
/// the relay stream and never surface as errors.
#[derive(Error, Debug)]
pub enum RelayErr {
    /// The completion service answered with a non-success status before any
    /// streaming began. No bytes are emitted in this case.
    #[error("upstream completion request failed with status {status}: {body}")]
    UpstreamRequest { status: StatusCode, body: String },

    /// The upstream event stream broke after streaming started (transport
    /// error, undecodable bytes, or idle timeout).
    #[error("upstream stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures of the chat client when talking to the relay.
#[derive(Error, Debug)]
pub enum ClientErr {
    /// The relay answered `POST /api/chat` with a non-success status.
    #[error("relay returned {status}")]
    Network { status: StatusCode },

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum ConfigErr {
    #[error("could not find home directory")]
    NoHomeDir,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
