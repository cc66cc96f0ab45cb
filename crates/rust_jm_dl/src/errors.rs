//! Contains user-defined errors.
//!
//! Every layer of the crate reports through [`JmError`]; the binary turns
//! these into `miette` reports, and the job queue records their text.

use std::fmt;

use miette::Diagnostic;
use thiserror::Error;

/// What kind of remote target an id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Album,
    Chapter,
    Blog,
}

impl TargetKind {
    /// Directory name used under the work root, e.g. `{root}/album/{id}`
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Album => "album",
            Self::Chapter => "photo",
            Self::Blog => "blog",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Album => "album",
            Self::Chapter => "chapter",
            Self::Blog => "blog",
        };
        f.pad(s)
    }
}

#[derive(Error, Debug, Diagnostic)]
pub enum JmError {
    #[error("{kind} {id} does not exist")]
    #[diagnostic(help("check if this id is actually valid"))]
    NotExist { kind: TargetKind, id: String },

    #[error("backend database unavailable at {url}")]
    #[diagnostic(help("the host is up but its database isn't; another host will be tried"))]
    BackendUnavailable { url: String },

    #[error("gave up on {url} after {attempts} attempts")]
    #[diagnostic(help("the host kept failing, consider raising `max_retries`"))]
    RetryExhausted { url: String, attempts: u32 },

    #[error("{url} responded with status {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("empty response body from {url}")]
    EmptyResponseBody { url: String },

    #[error("every known host failed for {path}")]
    #[diagnostic(help("all api domains are down or blocked, try again in a few minutes"))]
    AllHostsFailed { path: String },

    #[error("couldn't read host directory: {0}")]
    #[diagnostic(help("the directory payload changed shape; update `directory_secret` or `api_hosts`"))]
    HostDirectory(String),

    #[error("response payload could not be decrypted or parsed")]
    PayloadNotFound,

    #[error("api responded with code {code}: {message}")]
    Api { code: i64, message: String },

    #[error("scramble threshold missing from view template of chapter {chapter_id}")]
    ThresholdMissing { chapter_id: u64 },

    #[error("invalid url {0:?}")]
    InvalidUrl(String),

    #[error("chapter {chapter_id} lists an unusable image name {name:?}")]
    #[diagnostic(help("image names must be plain file names without directories"))]
    InvalidImageName { chapter_id: u64, name: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error("pdf error: {0}")]
    Pdf(String),

    #[error("config error: {0}")]
    #[diagnostic(help("see config.toml"))]
    Config(String),

    #[error("cancelled")]
    Cancelled,

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T, E = JmError> = std::result::Result<T, E>;

impl JmError {
    /// Whether the request layer should move on to the next host.
    pub fn is_failover(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. }
                | Self::EmptyResponseBody { .. }
                | Self::RetryExhausted { .. }
        )
    }

    /// Short text shown to whoever submitted the job.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotExist { kind, id } => format!("{kind} {id} does not exist"),
            Self::BackendUnavailable { .. } | Self::AllHostsFailed { .. } => {
                "tried every host, but the site is down".to_string()
            }
            Self::Cancelled => "the job was cancelled".to_string(),
            Self::Image(_) | Self::Zip(_) | Self::Pdf(_) => {
                format!("couldn't build the file: {self}")
            }
            other => format!("something went wrong: {other}"),
        }
    }
}

impl From<lopdf::Error> for JmError {
    fn from(e: lopdf::Error) -> Self {
        Self::Pdf(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_kinds() {
        let url = "https://a/x".to_string();

        assert!(JmError::BackendUnavailable { url: url.clone() }.is_failover());
        assert!(JmError::EmptyResponseBody { url: url.clone() }.is_failover());
        assert!(JmError::RetryExhausted { url, attempts: 6 }.is_failover());
        assert!(!JmError::PayloadNotFound.is_failover());
        assert!(!JmError::AllHostsFailed { path: "/album".into() }.is_failover());
    }

    #[test]
    fn not_exist_message_names_target() {
        let e = JmError::NotExist {
            kind: TargetKind::Album,
            id: "123".into(),
        };

        assert_eq!(e.user_message(), "album 123 does not exist");
    }
}
