use std::{
    error::Error,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::descriptor::Descriptor;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a koci-related operation.
pub type KociResult<T> = Result<T, KociError>;

/// An error that occurred during a registry or layout operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum KociError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error that occurred when a Serde JSON error occurred.
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that occurred when a blob's observed size did not match its descriptor.
    #[error("size mismatch: expected {expected}, got {actual}")]
    SizeMismatch {
        /// The size recorded in the descriptor.
        expected: u64,
        /// The size that was observed.
        actual: u64,
    },

    /// An error that occurred when a blob's computed digest did not match its descriptor.
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// The digest recorded in the descriptor.
        expected: String,
        /// The digest that was computed.
        actual: String,
    },

    /// An error that occurred when a manifest media type cannot be handled.
    #[error("unsupported manifest media type '{media_type}' in {context}")]
    UnsupportedManifest {
        /// The media type that was encountered.
        media_type: String,
        /// Where the media type was encountered.
        context: String,
    },

    /// An error that occurred when no descriptor matched the given criteria.
    #[error("descriptor not found: {0}")]
    DescriptorNotFound(String),

    /// An error that occurred when an index contains no manifest for the requested platform.
    #[error("no matching platform in index: {0}")]
    PlatformNotFound(String),

    /// An error that occurred when a descriptor cannot be removed from the store.
    #[error("unable to remove {}: {reason}", .descriptor.digest())]
    UnableToRemove {
        /// The descriptor that could not be removed.
        descriptor: Descriptor,
        /// Why the removal was refused.
        reason: String,
    },

    /// An error that occurred when parsing an invalid registry host.
    #[error("invalid registry: {0}")]
    InvalidRegistry(String),

    /// An error that occurred when parsing an invalid repository name.
    #[error("invalid repository: {0}")]
    InvalidRepository(String),

    /// An error that occurred when parsing an invalid tag.
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// An error that occurred when parsing an invalid digest.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// An error that occurred when the on-disk layout is not usable.
    #[error("invalid layout: {0}")]
    InvalidLayout(String),

    /// An error that occurred when the registry returned a non-success status with no
    /// structured body.
    #[error("http error {status}: {message}")]
    HttpError {
        /// The HTTP status code.
        status: u16,
        /// A human-readable description.
        message: String,
    },

    /// An error response decoded from a registry failure body.
    #[error("registry error: {0}")]
    FromResponse(#[from] OciFailureResponse),

    /// An error that occurred when the token endpoint returned no usable token.
    #[error("token endpoint returned an empty token")]
    EmptyTokenReturned,

    /// An error that occurred when the registry answered with an unexpected status code.
    #[error("unexpected status: expected {expected}, got {got}")]
    UnexpectedStatus {
        /// The status code the protocol requires.
        expected: u16,
        /// The status code that was received.
        got: u16,
    },

    /// An error observed by a waiter whose coordinated transfer failed in another task.
    #[error("transfer failed for {}", .0.digest())]
    TransferFailed(Descriptor),

    /// An error that occurred when a blob is not present in the store.
    #[error("blob not found: {}", .0.digest())]
    BlobNotFound(Descriptor),

    /// An error that occurred when the store refused an operation while transfers or
    /// removals are in progress.
    #[error("store busy: {0}")]
    StoreBusy(String),
}

/// A structured failure body returned by a registry, as defined by the OCI
/// distribution specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciFailureResponse {
    /// The individual errors reported by the registry.
    pub errors: Vec<OciError>,

    /// The HTTP status the body arrived with. Not part of the wire format.
    #[serde(skip)]
    pub status: u16,
}

/// A single error entry in a registry failure body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciError {
    /// The machine-readable error code.
    pub code: OciErrorCode,

    /// The human-readable message.
    #[serde(default)]
    pub message: String,

    /// Optional unstructured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// The error codes a registry may report, per the OCI distribution specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum OciErrorCode {
    Unknown,
    BlobUnknown,
    BlobUploadInvalid,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestBlobUnknown,
    ManifestInvalid,
    ManifestUnknown,
    ManifestUnverified,
    NameInvalid,
    NameUnknown,
    PaginationNumberInvalid,
    RangeInvalid,
    SizeInvalid,
    TagInvalid,
    Unauthorized,
    Denied,
    Unsupported,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl KociError {
    /// Creates a new `KociError` from any error type.
    pub fn custom(error: impl Into<anyhow::Error>) -> KociError {
        KociError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `KociResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> KociResult<T> {
    Result::Ok(value)
}

/// Decodes a non-success registry response into an error, preferring the
/// structured OCI failure body when the response declares itself as JSON.
pub async fn error_from_response(response: reqwest::Response) -> KociError {
    let status = response.status();
    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false);

    if is_json {
        if let Result::Ok(mut failure) = response.json::<OciFailureResponse>().await {
            failure.status = status.as_u16();
            return KociError::FromResponse(failure);
        }
    }

    KociError::HttpError {
        status: status.as_u16(),
        message: status
            .canonical_reason()
            .unwrap_or("unrecognized status")
            .to_string(),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for OciFailureResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status {}", self.status)?;
        for error in &self.errors {
            write!(f, "; {}: {}", error.code, error.message)?;
        }
        Result::Ok(())
    }
}

impl Error for OciFailureResponse {}

impl Display for OciErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            OciErrorCode::Unknown => "UNKNOWN",
            OciErrorCode::BlobUnknown => "BLOB_UNKNOWN",
            OciErrorCode::BlobUploadInvalid => "BLOB_UPLOAD_INVALID",
            OciErrorCode::BlobUploadUnknown => "BLOB_UPLOAD_UNKNOWN",
            OciErrorCode::DigestInvalid => "DIGEST_INVALID",
            OciErrorCode::ManifestBlobUnknown => "MANIFEST_BLOB_UNKNOWN",
            OciErrorCode::ManifestInvalid => "MANIFEST_INVALID",
            OciErrorCode::ManifestUnknown => "MANIFEST_UNKNOWN",
            OciErrorCode::ManifestUnverified => "MANIFEST_UNVERIFIED",
            OciErrorCode::NameInvalid => "NAME_INVALID",
            OciErrorCode::NameUnknown => "NAME_UNKNOWN",
            OciErrorCode::PaginationNumberInvalid => "PAGINATION_NUMBER_INVALID",
            OciErrorCode::RangeInvalid => "RANGE_INVALID",
            OciErrorCode::SizeInvalid => "SIZE_INVALID",
            OciErrorCode::TagInvalid => "TAG_INVALID",
            OciErrorCode::Unauthorized => "UNAUTHORIZED",
            OciErrorCode::Denied => "DENIED",
            OciErrorCode::Unsupported => "UNSUPPORTED",
        };
        write!(f, "{}", code)
    }
}

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_failure_response_decodes_wire_body() {
        let body = r#"{"errors":[{"code":"MANIFEST_UNKNOWN","message":"manifest unknown","detail":{"name":"library/alpine"}}]}"#;
        let mut response: OciFailureResponse = serde_json::from_str(body).unwrap();
        response.status = 404;

        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].code, OciErrorCode::ManifestUnknown);
        assert!(response.to_string().contains("MANIFEST_UNKNOWN"));
        assert!(response.to_string().contains("status 404"));
    }

    #[test]
    fn test_error_code_round_trip() {
        let json = serde_json::to_string(&OciErrorCode::BlobUploadUnknown).unwrap();
        assert_eq!(json, "\"BLOB_UPLOAD_UNKNOWN\"");
        let back: OciErrorCode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, OciErrorCode::BlobUploadUnknown);
    }

    #[test]
    fn test_error_custom_preserves_message() {
        let err = KociError::custom(std::fmt::Error);
        assert!(err.to_string().contains("an error occurred when formatting"));
    }
}
