//! Error types for the Interstellar call-lifecycle layer.
//!
//! The taxonomy mirrors how failures travel through a call:
//! - [`ConfigurationError`]: registry misses and unconfigured targets, always
//!   surfaced synchronously to the caller.
//! - [`AuthenticationError`]: a missing or invalid principal, always answered
//!   with `UNAUTHENTICATED` before dispatch.
//! - [`Abort`]: request framing rejected before authentication.
//! - [`RpcError`]: the explicitly typed error whose status and message reach
//!   the caller verbatim.
//! - [`CallError`]: everything an application handler can fail with.

use std::fmt;
use std::result;
use thiserror::Error;
use tonic::{Code, Status};

/// A specialized Result type for Interstellar operations.
pub type Result<T> = result::Result<T, Error>;

/// Boxed error used where a body or collaborator error type is erased.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Application-level error codes carried in the vendor error-code header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unspecified,
    InvalidUsage,
    MethodNotAllowed,
    PermissionDenied,
    AuthenticationCredentialsMissing,
    AuthenticationFailed,
    Unknown,
    /// A code defined by the remote application that this crate does not name.
    Other(u32),
}

impl ErrorCode {
    pub fn value(&self) -> u32 {
        match self {
            ErrorCode::Unspecified => 999_998,
            ErrorCode::InvalidUsage => 999_601,
            ErrorCode::MethodNotAllowed => 999_605,
            ErrorCode::PermissionDenied => 999_403,
            ErrorCode::AuthenticationCredentialsMissing => 999_401,
            ErrorCode::AuthenticationFailed => 999_402,
            ErrorCode::Unknown => 999_999,
            ErrorCode::Other(value) => *value,
        }
    }

    pub fn from_value(value: u32) -> Self {
        match value {
            999_998 => ErrorCode::Unspecified,
            999_601 => ErrorCode::InvalidUsage,
            999_605 => ErrorCode::MethodNotAllowed,
            999_403 => ErrorCode::PermissionDenied,
            999_401 => ErrorCode::AuthenticationCredentialsMissing,
            999_402 => ErrorCode::AuthenticationFailed,
            999_999 => ErrorCode::Unknown,
            other => ErrorCode::Other(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// An error whose protocol status, message and error code are meant for the
/// caller.
///
/// Handlers return this to fail a call with a specific status. On the client
/// side every non-OK status coming back from a remote service is turned into
/// one of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: Code,
    pub message: String,
    pub error_code: ErrorCode,
}

impl RpcError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            error_code: ErrorCode::Unspecified,
        }
    }

    pub fn with_error_code(mut self, error_code: ErrorCode) -> Self {
        self.error_code = error_code;
        self
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message).with_error_code(ErrorCode::InvalidUsage)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Code::AlreadyExists, message).with_error_code(ErrorCode::InvalidUsage)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(Code::PermissionDenied, message).with_error_code(ErrorCode::PermissionDenied)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(Code::Unauthenticated, message)
            .with_error_code(ErrorCode::AuthenticationCredentialsMissing)
    }

    /// Rebuilds the error from a status received by a client, reading the
    /// application error code from `error_code_header` when present.
    pub fn from_status(status: &Status, error_code_header: &str) -> Self {
        let error_code = status
            .metadata()
            .get(error_code_header)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u32>().ok())
            .map(ErrorCode::from_value)
            .unwrap_or(ErrorCode::Unspecified);

        Self {
            code: status.code(),
            message: status.message().to_string(),
            error_code,
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {} (error code {})", self.code, self.message, self.error_code)
    }
}

impl std::error::Error for RpcError {}

impl From<RpcError> for Status {
    fn from(err: RpcError) -> Self {
        Status::new(err.code, err.message)
    }
}

/// Registry misses and unconfigured remote targets.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("{0}")]
    NotConfigured(String),

    #[error("Stub, {stub}, does not exist for {package}. Please check the protobuf definition.")]
    UnknownStub { package: String, stub: String },

    #[error("Service method {method} does not exist for stub, {stub}. Please check the protobuf definition.")]
    UnknownMethod { stub: String, method: String },

    #[error("Error while loading {package}: {reason}")]
    PackageLoad { package: String, reason: String },

    #[error("Package {0} could not be found")]
    PackageNotFound(String),

    #[error("Invalid package identifier {0:?}; expected <prefix>-<service>-<namespace>[-<version>]")]
    InvalidPackageId(String),

    #[error("Remote service {0} is not configured")]
    UnknownRemoteService(String),

    #[error("Invalid endpoint for {service}: {reason}")]
    InvalidEndpoint { service: String, reason: String },

    #[error("Method {method} is {actual}, not {expected}")]
    CardinalityMismatch {
        method: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Invalid manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}

/// Reasons a principal could not be extracted from call metadata.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("Request user not found in request.")]
    MissingUser,

    #[error("Invalid request user payload.")]
    InvalidUser,

    #[error("Request service not found in request.")]
    MissingService,

    #[error("Invalid service payload.")]
    InvalidService,

    #[error("Invalid request to {0}")]
    InvalidAudience(String),

    #[error("Authorization header not found in request.")]
    MissingCredentials,

    #[error("Invalid Authorization header prefix.")]
    InvalidPrefix,

    #[error("Invalid Authorization header. No credentials provided.")]
    NoCredentials,

    #[error("Invalid Authorization header. Credentials string should not contain spaces.")]
    CredentialsContainSpaces,

    #[error("{0}")]
    InvalidToken(String),
}

impl AuthenticationError {
    /// Missing headers are told apart from credentials that were present but
    /// rejected.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            AuthenticationError::MissingUser
            | AuthenticationError::MissingService
            | AuthenticationError::MissingCredentials
            | AuthenticationError::NoCredentials => ErrorCode::AuthenticationCredentialsMissing,
            _ => ErrorCode::AuthenticationFailed,
        }
    }
}

impl From<AuthenticationError> for RpcError {
    fn from(err: AuthenticationError) -> Self {
        RpcError::new(Code::Unauthenticated, err.to_string()).with_error_code(err.error_code())
    }
}

/// A request rejected during protocol validation, before any principal is
/// extracted or handler invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
    pub http_status: u16,
    pub code: Option<Code>,
    pub message: Option<String>,
    pub error_code: Option<ErrorCode>,
}

impl Abort {
    /// An abort answered with an HTTP status only.
    pub fn http(http_status: u16) -> Self {
        Self {
            http_status,
            code: None,
            message: None,
            error_code: None,
        }
    }

    pub fn grpc(http_status: u16, code: Code, message: impl Into<String>, error_code: ErrorCode) -> Self {
        Self {
            http_status,
            code: Some(code),
            message: Some(message.into()),
            error_code: Some(error_code),
        }
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "{} {:?}: {}", self.http_status, code, message),
            _ => write!(f, "{}", self.http_status),
        }
    }
}

impl std::error::Error for Abort {}

/// Framing and decoding failures inside a dispatched stream.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("compressed messages are not supported")]
    CompressedMessage,

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("request body ended inside a message frame")]
    TruncatedFrame,

    #[error("failed to read request body: {0}")]
    Body(String),

    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("failed to encode message: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// What an application handler can fail with.
#[derive(Debug, Error)]
pub enum CallError {
    /// Status and message reach the caller verbatim.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Answered with `INTERNAL` and a generic message.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The peer went away; nothing can be sent back.
    #[error("stream terminated by peer")]
    StreamTerminated,

    /// Answered with `UNKNOWN` and a generic message; detail stays in the
    /// server log.
    #[error(transparent)]
    Application(#[from] anyhow::Error),
}

/// The error type for Interstellar operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Authentication error: {0}")]
    Authentication(#[from] AuthenticationError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        Error::Rpc(RpcError::new(status.code(), status.message()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::metadata::MetadataValue;

    #[test]
    fn test_error_code_roundtrip() {
        for code in [
            ErrorCode::Unspecified,
            ErrorCode::InvalidUsage,
            ErrorCode::MethodNotAllowed,
            ErrorCode::PermissionDenied,
            ErrorCode::AuthenticationCredentialsMissing,
            ErrorCode::AuthenticationFailed,
            ErrorCode::Unknown,
        ] {
            assert_eq!(ErrorCode::from_value(code.value()), code);
        }
        assert_eq!(ErrorCode::from_value(42), ErrorCode::Other(42));
    }

    #[test]
    fn test_authentication_error_codes() {
        assert_eq!(
            AuthenticationError::MissingService.error_code(),
            ErrorCode::AuthenticationCredentialsMissing
        );
        assert_eq!(
            AuthenticationError::InvalidAudience("billing".into()).error_code(),
            ErrorCode::AuthenticationFailed
        );
        assert_eq!(
            AuthenticationError::InvalidToken("Signature has expired.".into()).error_code(),
            ErrorCode::AuthenticationFailed
        );

        let err = RpcError::from(AuthenticationError::InvalidPrefix);
        assert_eq!(err.code, Code::Unauthenticated);
        assert_eq!(err.error_code, ErrorCode::AuthenticationFailed);
    }

    #[test]
    fn test_rpc_error_defaults() {
        let err = RpcError::invalid_argument("bad input");
        assert_eq!(err.code, Code::InvalidArgument);
        assert_eq!(err.error_code, ErrorCode::InvalidUsage);

        let err = RpcError::unknown("boom");
        assert_eq!(err.error_code, ErrorCode::Unspecified);
    }

    #[test]
    fn test_rpc_error_from_status_reads_error_code() {
        let mut status = Status::new(Code::PermissionDenied, "nope");
        status
            .metadata_mut()
            .insert("x-error-code", MetadataValue::from_static("999403"));

        let err = RpcError::from_status(&status, "x-error-code");
        assert_eq!(err.code, Code::PermissionDenied);
        assert_eq!(err.message, "nope");
        assert_eq!(err.error_code, ErrorCode::PermissionDenied);

        let bare = RpcError::from_status(&Status::internal("x"), "x-error-code");
        assert_eq!(bare.error_code, ErrorCode::Unspecified);
    }

    #[test]
    fn test_authentication_error_maps_to_unauthenticated() {
        let err: RpcError = AuthenticationError::MissingUser.into();
        assert_eq!(err.code, Code::Unauthenticated);
        assert_eq!(err.message, "Request user not found in request.");
    }
}
