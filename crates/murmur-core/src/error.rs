use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the murmur protocol and server layers.
#[derive(Debug, Error)]
pub enum MurmurError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("user already exists: {0}")]
    DuplicateUser(String),

    #[error("invalid credentials")]
    InvalidCredential,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("channel not joined: {0}")]
    NotJoined(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for MurmurError {
    fn from(e: serde_json::Error) -> Self {
        MurmurError::Codec(e.to_string())
    }
}

pub type MurmurResult<T> = Result<T, MurmurError>;

/// Error kinds as seen on the wire. Each kind owns one stable numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum ErrorKind {
    InvalidArgument = 400,
    Unauthorized = 401,
    InvalidCredential = 403,
    NotFound = 404,
    DuplicateUser = 409,
    NotJoined = 412,
    RateLimited = 429,
    Internal = 500,
    StoreUnavailable = 503,
}

impl ErrorKind {
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl From<ErrorKind> for u32 {
    fn from(k: ErrorKind) -> u32 {
        k as u32
    }
}

impl TryFrom<u32> for ErrorKind {
    type Error = String;
    fn try_from(v: u32) -> Result<Self, String> {
        match v {
            400 => Ok(Self::InvalidArgument),
            401 => Ok(Self::Unauthorized),
            403 => Ok(Self::InvalidCredential),
            404 => Ok(Self::NotFound),
            409 => Ok(Self::DuplicateUser),
            412 => Ok(Self::NotJoined),
            429 => Ok(Self::RateLimited),
            500 => Ok(Self::Internal),
            503 => Ok(Self::StoreUnavailable),
            _ => Err(format!("unknown error code: {v}")),
        }
    }
}

impl MurmurError {
    /// The wire-level kind this error is reported as.
    ///
    /// Codec failures on inbound frames are the client's fault, so they
    /// surface as `InvalidArgument`; transport and io failures never reach
    /// the client and fall back to `Internal`.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MurmurError::InvalidArgument(_) | MurmurError::Codec(_) => ErrorKind::InvalidArgument,
            MurmurError::NotFound(_) => ErrorKind::NotFound,
            MurmurError::DuplicateUser(_) => ErrorKind::DuplicateUser,
            MurmurError::InvalidCredential => ErrorKind::InvalidCredential,
            MurmurError::Unauthorized(_) => ErrorKind::Unauthorized,
            MurmurError::NotJoined(_) => ErrorKind::NotJoined,
            MurmurError::RateLimited(_) => ErrorKind::RateLimited,
            MurmurError::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
            MurmurError::Transport(_)
            | MurmurError::Timeout
            | MurmurError::Io(_)
            | MurmurError::Other(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> u32 {
        self.kind().code()
    }

    /// Rebuild an error from a `sys` error envelope received over the wire.
    pub fn from_wire(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::InvalidArgument => MurmurError::InvalidArgument(message),
            ErrorKind::Unauthorized => MurmurError::Unauthorized(message),
            ErrorKind::InvalidCredential => MurmurError::InvalidCredential,
            ErrorKind::NotFound => MurmurError::NotFound(message),
            ErrorKind::DuplicateUser => MurmurError::DuplicateUser(message),
            ErrorKind::NotJoined => MurmurError::NotJoined(message),
            ErrorKind::RateLimited => MurmurError::RateLimited(message),
            ErrorKind::StoreUnavailable => MurmurError::StoreUnavailable(message),
            ErrorKind::Internal => MurmurError::Other(message),
        }
    }
}
