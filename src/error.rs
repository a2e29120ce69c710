use thiserror::Error;

use crate::host::JobStatus;

/// Errors raised by the job state store and the host orchestration layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error("job is already stopped: {0}")]
    AlreadyStopped(String),

    #[error("job already exists: {0}")]
    JobExists(String),

    #[error("invalid status transition for job {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("execution backend error: {0}")]
    Backend(String),
}

/// Errors raised while turning a `ProviderSpec` into a live provider.
///
/// Everything except `Backend` is the caller's fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderConfigError {
    #[error("volume provider kind must not be blank")]
    BlankKind,

    #[error("volume provider kind '{0}' is not known")]
    UnknownKind(String),

    #[error("{kind} volume provider requires a '{param}' parameter")]
    MissingParameter { kind: String, param: &'static str },

    #[error("volume provider id must not be blank")]
    BlankId,

    #[error("volume provider backend failed: {0}")]
    Backend(String),
}

impl ProviderConfigError {
    pub fn is_validation(&self) -> bool {
        !matches!(self, ProviderConfigError::Backend(_))
    }
}

/// Errors raised by the volume manager and its providers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VolumeError {
    #[error("volume provider already exists: {0}")]
    ProviderAlreadyExists(String),

    #[error("no such volume provider: {0}")]
    NoSuchProvider(String),

    #[error("no such volume: {0}")]
    NoSuchVolume(String),

    #[error("volume backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the remote host client.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("stream terminated: {0}")]
    Stream(String),

    #[error("invalid agent URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, HostError>;
