use thiserror::Error;

/// Errors surfaced by the Matrix client adapter (4.E).
///
/// `errcode`/status mapping happens once, at the adapter boundary; everything
/// above it matches on these variants instead of re-parsing JSON error bodies.
#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("not found")]
    NotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("user in use")]
    UserInUse,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{errcode}: {message} ({status})")]
    Other {
        status: u16,
        errcode: String,
        message: String,
    },
}

impl MatrixError {
    pub fn from_response(status: u16, errcode: &str, message: &str) -> Self {
        match errcode {
            "M_NOT_FOUND" => MatrixError::NotFound,
            "M_FORBIDDEN" => MatrixError::Forbidden,
            "M_USER_IN_USE" => MatrixError::UserInUse,
            _ => MatrixError::Other {
                status,
                errcode: errcode.to_string(),
                message: message.to_string(),
            },
        }
    }

    /// Transport and 5xx errors are worth retrying; semantic 4xx errors are not.
    pub fn retryable(&self) -> bool {
        matches!(self, MatrixError::Transport(_))
    }
}

/// A parser error is always user-facing and never fatal (7).
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct CommandError(pub String);

impl CommandError {
    pub fn new(msg: impl Into<String>) -> Self {
        CommandError(msg.into())
    }
}

/// Raised by room membership handlers when a membership change makes the
/// room's invariants (3) false. This is a control-flow signal, not a failure:
/// the bridge controller matches on it explicitly to run cleanup+leave+forget
/// instead of logging it like an ordinary error.
#[derive(Debug, Clone, Copy)]
pub struct RoomInvalid;

impl std::fmt::Display for RoomInvalid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "room is no longer valid")
    }
}

impl std::error::Error for RoomInvalid {}
