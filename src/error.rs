//! Storage error codes and upload stream error types.

use http::StatusCode;
use thiserror::Error;

/// Blob service error codes surfaced by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // General errors
    AuthenticationFailed,
    AuthorizationFailure,
    ConditionNotMet,
    InternalError,
    InvalidHeaderValue,
    InvalidInput,
    InvalidRange,
    Md5Mismatch,
    OperationTimedOut,
    RequestBodyTooLarge,
    ResourceNotFound,
    ServerBusy,

    // Blob-specific errors
    AppendPositionConditionNotMet,
    BlobAlreadyExists,
    BlobNotFound,
    BlockCountExceedsLimit,
    BlockListTooLong,
    ContainerAlreadyExists,
    ContainerNotFound,
    InvalidBlobType,
    InvalidBlockId,
    InvalidBlockList,
    InvalidPageRange,
    MaxBlobSizeConditionNotMet,
}

impl ErrorCode {
    /// Returns the string representation of the error code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::AuthenticationFailed => "AuthenticationFailed",
            ErrorCode::AuthorizationFailure => "AuthorizationFailure",
            ErrorCode::ConditionNotMet => "ConditionNotMet",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::InvalidHeaderValue => "InvalidHeaderValue",
            ErrorCode::InvalidInput => "InvalidInput",
            ErrorCode::InvalidRange => "InvalidRange",
            ErrorCode::Md5Mismatch => "Md5Mismatch",
            ErrorCode::OperationTimedOut => "OperationTimedOut",
            ErrorCode::RequestBodyTooLarge => "RequestBodyTooLarge",
            ErrorCode::ResourceNotFound => "ResourceNotFound",
            ErrorCode::ServerBusy => "ServerBusy",
            ErrorCode::AppendPositionConditionNotMet => "AppendPositionConditionNotMet",
            ErrorCode::BlobAlreadyExists => "BlobAlreadyExists",
            ErrorCode::BlobNotFound => "BlobNotFound",
            ErrorCode::BlockCountExceedsLimit => "BlockCountExceedsLimit",
            ErrorCode::BlockListTooLong => "BlockListTooLong",
            ErrorCode::ContainerAlreadyExists => "ContainerAlreadyExists",
            ErrorCode::ContainerNotFound => "ContainerNotFound",
            ErrorCode::InvalidBlobType => "InvalidBlobType",
            ErrorCode::InvalidBlockId => "InvalidBlockId",
            ErrorCode::InvalidBlockList => "InvalidBlockList",
            ErrorCode::InvalidPageRange => "InvalidPageRange",
            ErrorCode::MaxBlobSizeConditionNotMet => "MaxBlobSizeConditionNotMet",
        }
    }

    /// Returns the HTTP status code the service answers with for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            ErrorCode::InvalidHeaderValue
            | ErrorCode::InvalidInput
            | ErrorCode::Md5Mismatch
            | ErrorCode::RequestBodyTooLarge
            | ErrorCode::InvalidBlobType
            | ErrorCode::InvalidBlockId
            | ErrorCode::InvalidBlockList
            | ErrorCode::InvalidPageRange
            | ErrorCode::BlockCountExceedsLimit
            | ErrorCode::BlockListTooLong => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            ErrorCode::AuthenticationFailed => StatusCode::UNAUTHORIZED,

            // 403 Forbidden
            ErrorCode::AuthorizationFailure => StatusCode::FORBIDDEN,

            // 404 Not Found
            ErrorCode::BlobNotFound | ErrorCode::ContainerNotFound | ErrorCode::ResourceNotFound => {
                StatusCode::NOT_FOUND
            }

            // 409 Conflict
            ErrorCode::BlobAlreadyExists | ErrorCode::ContainerAlreadyExists => {
                StatusCode::CONFLICT
            }

            // 412 Precondition Failed
            ErrorCode::AppendPositionConditionNotMet
            | ErrorCode::ConditionNotMet
            | ErrorCode::MaxBlobSizeConditionNotMet => StatusCode::PRECONDITION_FAILED,

            // 416 Range Not Satisfiable
            ErrorCode::InvalidRange => StatusCode::RANGE_NOT_SATISFIABLE,

            // 500 Internal Server Error
            ErrorCode::InternalError | ErrorCode::OperationTimedOut => {
                StatusCode::INTERNAL_SERVER_ERROR
            }

            // 503 Service Unavailable
            ErrorCode::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns the default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::AuthenticationFailed => {
                "Server failed to authenticate the request. Make sure the value of the \
                 Authorization header is formed correctly including the signature."
            }
            ErrorCode::AuthorizationFailure => {
                "This request is not authorized to perform this operation."
            }
            ErrorCode::AppendPositionConditionNotMet => {
                "The append position condition specified was not met."
            }
            ErrorCode::BlobNotFound => "The specified blob does not exist.",
            ErrorCode::ConditionNotMet => "The condition specified using HTTP conditional header(s) is not met.",
            ErrorCode::ContainerAlreadyExists => "The specified container already exists.",
            ErrorCode::ContainerNotFound => "The specified container does not exist.",
            ErrorCode::InvalidBlockId => "The specified block ID is invalid.",
            ErrorCode::InvalidBlockList => "The specified block list is invalid.",
            ErrorCode::InvalidPageRange => "The page range specified is invalid.",
            ErrorCode::MaxBlobSizeConditionNotMet => "The max blob size condition specified was not met.",
            ErrorCode::Md5Mismatch => "The MD5 value specified in the request did not match the MD5 value calculated by the server.",
            ErrorCode::OperationTimedOut => "The operation could not be completed within the permitted time.",
            ErrorCode::ServerBusy => "The server is currently unable to receive requests. Please retry your request.",
            ErrorCode::InternalError => "The server encountered an internal error. Please retry the request.",
            _ => "An error occurred while processing the request.",
        }
    }

    /// Whether the service reports this code as a failed precondition (412).
    pub fn is_precondition(&self) -> bool {
        self.status_code() == StatusCode::PRECONDITION_FAILED
    }

    /// Whether a request failing with this code may succeed when resent.
    pub fn is_retryable(&self) -> bool {
        self.status_code().is_server_error()
    }
}

/// Storage error with code and message.
#[derive(Debug, Clone, Error)]
#[error("{code:?}: {message}")]
pub struct StorageError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: Option<String>,
}

impl StorageError {
    /// Creates a new storage error with the given code and default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            message: code.default_message().to_string(),
            code,
            request_id: None,
        }
    }

    /// Creates a new storage error with a custom message.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: None,
        }
    }

    /// Sets the request ID for this error.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a [`BlobOutputStream`](crate::stream::BlobOutputStream).
///
/// The type is `Clone` because a failure recorded by a background dispatch is
/// re-raised from every later call on the stream until it is closed.
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// The stream has already been closed.
    #[error("the stream is already closed")]
    StreamClosed,

    /// An access condition of the session was violated.
    #[error("precondition failed: {0}")]
    PreconditionFailed(#[source] StorageError),

    /// A block could not be uploaded once the retry policy was exhausted.
    #[error("block {block_id} failed to upload: {source}")]
    DispatchFailure {
        block_id: String,
        #[source]
        source: StorageError,
    },

    /// The final commit was rejected for a reason other than a precondition.
    #[error("commit failed: {0}")]
    CommitFailed(#[source] StorageError),

    /// The caller used the stream in a way its blob kind does not allow.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A write was dropped before all of its data had been buffered.
    #[error("a write was cancelled before all of its data was buffered")]
    WriteCancelled,

    /// A storage call made while opening the stream failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl UploadError {
    /// Classifies a failed block dispatch.
    pub fn dispatch(block_id: impl Into<String>, source: StorageError) -> Self {
        if source.code.is_precondition() {
            UploadError::PreconditionFailed(source)
        } else {
            UploadError::DispatchFailure {
                block_id: block_id.into(),
                source,
            }
        }
    }

    /// Classifies a failed commit.
    pub fn commit(source: StorageError) -> Self {
        if source.code.is_precondition() {
            UploadError::PreconditionFailed(source)
        } else {
            UploadError::CommitFailed(source)
        }
    }

    /// Classifies a failure while opening the stream.
    pub fn open(source: StorageError) -> Self {
        if source.code.is_precondition() {
            UploadError::PreconditionFailed(source)
        } else {
            UploadError::Storage(source)
        }
    }

    /// Returns the underlying storage error code, if any.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            UploadError::PreconditionFailed(e)
            | UploadError::CommitFailed(e)
            | UploadError::Storage(e) => Some(e.code),
            UploadError::DispatchFailure { source, .. } => Some(source.code),
            UploadError::StreamClosed
            | UploadError::WriteCancelled
            | UploadError::InvalidArgument(_) => None,
        }
    }
}

/// Result type alias for upload stream operations.
pub type UploadResult<T> = Result<T, UploadError>;
