//! Status codes attached to error effects.

use serde::{Deserialize, Serialize};

/// Status code carried by a rejected command.
///
/// Each variant maps onto a gRPC status code and an HTTP status so that the
/// hosting runtime can translate a [`Rejection`](crate::Rejection) into
/// whatever transport it serves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The command was invalid for the current state. Used when a handler
    /// rejects without naming a code.
    #[default]
    InvalidArgument,
    /// The addressed entity or resource does not exist.
    NotFound,
    /// The entity already exists.
    AlreadyExists,
    /// The caller is not allowed to issue this command.
    PermissionDenied,
    /// The caller could not be authenticated.
    Unauthenticated,
    /// The command conflicts with the current state.
    FailedPrecondition,
    /// Rate or quota exceeded.
    ResourceExhausted,
    /// The operation was aborted, typically by a concurrency conflict.
    Aborted,
    /// A deadline elapsed before the command completed.
    DeadlineExceeded,
    /// The command is not supported by this component.
    Unimplemented,
    /// The component is temporarily unavailable.
    Unavailable,
    /// An internal failure, e.g. an async computation that failed.
    Internal,
    /// Unclassified failure.
    Unknown,
}

impl ErrorCode {
    /// The numeric gRPC status code.
    pub fn grpc_code(self) -> i32 {
        match self {
            ErrorCode::Unknown => 2,
            ErrorCode::InvalidArgument => 3,
            ErrorCode::DeadlineExceeded => 4,
            ErrorCode::NotFound => 5,
            ErrorCode::AlreadyExists => 6,
            ErrorCode::PermissionDenied => 7,
            ErrorCode::ResourceExhausted => 8,
            ErrorCode::FailedPrecondition => 9,
            ErrorCode::Aborted => 10,
            ErrorCode::Unimplemented => 12,
            ErrorCode::Internal => 13,
            ErrorCode::Unavailable => 14,
            ErrorCode::Unauthenticated => 16,
        }
    }

    /// The HTTP status used when the rejection is served over HTTP.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorCode::InvalidArgument | ErrorCode::FailedPrecondition => 400,
            ErrorCode::Unauthenticated => 401,
            ErrorCode::PermissionDenied => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::AlreadyExists | ErrorCode::Aborted => 409,
            ErrorCode::ResourceExhausted => 429,
            ErrorCode::Unimplemented => 501,
            ErrorCode::Unavailable => 503,
            ErrorCode::DeadlineExceeded => 504,
            ErrorCode::Internal | ErrorCode::Unknown => 500,
        }
    }

    /// Map an HTTP status back to the closest code.
    ///
    /// Statuses without a dedicated mapping fall back to
    /// [`ErrorCode::Unknown`] for 5xx and [`ErrorCode::InvalidArgument`]
    /// for everything else.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 => ErrorCode::InvalidArgument,
            401 => ErrorCode::Unauthenticated,
            403 => ErrorCode::PermissionDenied,
            404 => ErrorCode::NotFound,
            409 => ErrorCode::AlreadyExists,
            429 => ErrorCode::ResourceExhausted,
            500 => ErrorCode::Internal,
            501 => ErrorCode::Unimplemented,
            503 => ErrorCode::Unavailable,
            504 => ErrorCode::DeadlineExceeded,
            s if s >= 500 => ErrorCode::Unknown,
            _ => ErrorCode::InvalidArgument,
        }
    }
}
