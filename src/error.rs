//! Error types for rust-lwm2m
//!
//! Low-level components (option container, tokenizer, codecs) report [`Error`].
//! The data model translates those into the response-code shaped [`DmError`]
//! at its boundary.

use thiserror::Error;

use crate::coap_types::ResponseCode;

/// Main error type for the codec and option layers
#[derive(Debug, Error)]
pub enum Error {
    /// More payload bytes are required before the operation can complete.
    ///
    /// This is a suspension signal in the same sense as
    /// `std::io::ErrorKind::WouldBlock`: the caller feeds the next payload
    /// chunk and retries. It never poisons the component that returned it.
    #[error("next payload chunk required")]
    WantNextPayload,

    /// Malformed input payload; the decoder is unusable afterwards
    #[error("malformed payload: {0}")]
    Format(&'static str),

    /// Option value does not have the expected shape
    #[error("malformed option: {0}")]
    Malformed(&'static str),

    /// Requested option is not present or the iterator is exhausted
    #[error("option missing")]
    Missing,

    /// Fixed option buffer is too small
    #[error("message too big")]
    MessageTooBig,

    /// Dynamic storage could not grow
    #[error("out of memory")]
    OutOfMemory,

    /// Fixed scratch buffer is too small for the value being reconstructed
    #[error("buffer too small")]
    BufferTooSmall,

    /// Block-wise transfer received a block out of order
    #[error("block-wise transfer out of sequence")]
    BlockSequence,

    /// API called outside of its required state sequence
    #[error("invalid call sequence: {0}")]
    Logic(&'static str),

    /// IO error (configuration files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error (configuration files)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether this is the streaming suspension signal rather than a failure
    pub fn is_want_next_payload(&self) -> bool {
        matches!(self, Error::WantNextPayload)
    }
}

/// Result type alias for codec and option operations
pub type Result<T> = std::result::Result<T, Error>;

/// Data model errors, each corresponding to a CoAP response code
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmError {
    /// Path does not resolve to anything present (maps to CoAP 4.04)
    #[error("not found")]
    NotFound,

    /// Operation not supported by the target (maps to CoAP 4.05)
    #[error("method not allowed")]
    MethodNotAllowed,

    /// Malformed request or payload (maps to CoAP 4.00)
    #[error("bad request")]
    BadRequest,

    /// Access denied (maps to CoAP 4.01)
    #[error("unauthorized")]
    Unauthorized,

    /// Block sequence broken (maps to CoAP 4.08)
    #[error("request entity incomplete")]
    RequestEntityIncomplete,

    /// Payload exceeds a fixed capacity (maps to CoAP 4.13)
    #[error("request entity too large")]
    RequestEntityTooLarge,

    /// Payload format not supported (maps to CoAP 4.15)
    #[error("unsupported content format")]
    UnsupportedContentFormat,

    /// Handler or internal failure (maps to CoAP 5.00)
    #[error("internal server error")]
    InternalServerError,

    /// Operation not implemented (maps to CoAP 5.01)
    #[error("not implemented")]
    NotImplemented,
}

impl DmError {
    /// Response code the transport layer should answer with
    pub fn response_code(self) -> ResponseCode {
        match self {
            Self::NotFound => ResponseCode::NotFound,
            Self::MethodNotAllowed => ResponseCode::MethodNotAllowed,
            Self::BadRequest => ResponseCode::BadRequest,
            Self::Unauthorized => ResponseCode::Unauthorized,
            Self::RequestEntityIncomplete => ResponseCode::RequestEntityIncomplete,
            Self::RequestEntityTooLarge => ResponseCode::RequestEntityTooLarge,
            Self::UnsupportedContentFormat => ResponseCode::UnsupportedContentFormat,
            Self::InternalServerError => ResponseCode::InternalServerError,
            Self::NotImplemented => ResponseCode::NotImplemented,
        }
    }
}

impl From<Error> for DmError {
    fn from(err: Error) -> Self {
        match err {
            Error::Format(_) | Error::Malformed(_) | Error::Missing => DmError::BadRequest,
            Error::MessageTooBig | Error::BufferTooSmall => DmError::RequestEntityTooLarge,
            Error::BlockSequence => DmError::RequestEntityIncomplete,
            Error::WantNextPayload
            | Error::OutOfMemory
            | Error::Logic(_)
            | Error::Io(_)
            | Error::Json(_) => DmError::InternalServerError,
        }
    }
}

/// Result type alias for data model operations
pub type DmResult<T> = std::result::Result<T, DmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_level_errors_translate_to_response_codes() {
        assert_eq!(DmError::from(Error::Format("x")), DmError::BadRequest);
        assert_eq!(DmError::from(Error::Logic("x")), DmError::InternalServerError);
        assert_eq!(
            DmError::from(Error::BufferTooSmall).response_code().to_code_pair(),
            (4, 13)
        );
    }

    #[test]
    fn test_want_next_payload_is_not_a_failure() {
        assert!(Error::WantNextPayload.is_want_next_payload());
        assert!(!Error::Missing.is_want_next_payload());
    }
}
