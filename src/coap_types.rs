//! LwM2M-specific CoAP types and constants
//!
//! The data model never speaks CoAP itself; these types are the vocabulary it
//! shares with whatever transport sits on top of it.

/// Sentinel meaning "no Content-Format"; removes the option when set
pub const FORMAT_NONE: u16 = u16::MAX;

/// CoAP Content-Format identifiers used by LwM2M
/// See: https://www.iana.org/assignments/core-parameters/core-parameters.xhtml
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ContentFormat {
    /// text/plain;charset=utf-8
    PlainText = 0,
    /// application/link-format
    LinkFormat = 40,
    /// application/octet-stream
    Opaque = 42,
    /// application/cbor
    Cbor = 60,
    /// application/senml+json
    SenmlJson = 110,
    /// application/senml+cbor
    SenmlCbor = 112,
    /// application/senml-etch+json
    SenmlEtchJson = 320,
    /// application/senml-etch+cbor
    SenmlEtchCbor = 322,
    /// application/vnd.oma.lwm2m+tlv
    OmaTlv = 11542,
    /// application/vnd.oma.lwm2m+json
    Lwm2mJson = 11543,
    /// application/vnd.oma.lwm2m+cbor
    Lwm2mCbor = 11544,
}

impl ContentFormat {
    /// Convert from raw content-format ID
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::PlainText),
            40 => Some(Self::LinkFormat),
            42 => Some(Self::Opaque),
            60 => Some(Self::Cbor),
            110 => Some(Self::SenmlJson),
            112 => Some(Self::SenmlCbor),
            320 => Some(Self::SenmlEtchJson),
            322 => Some(Self::SenmlEtchCbor),
            11542 => Some(Self::OmaTlv),
            11543 => Some(Self::Lwm2mJson),
            11544 => Some(Self::Lwm2mCbor),
            _ => None,
        }
    }

    /// Get the raw content-format ID
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// LwM2M operations the data model distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Read a value or subtree
    Read,
    /// Discover attached resources
    Discover,
    /// Replace a subtree (CoAP PUT)
    WriteReplace,
    /// Update parts of a subtree (CoAP POST)
    WritePartialUpdate,
    /// Write several paths in one payload (CoAP iPATCH)
    WriteComposite,
    /// Execute a resource
    Execute,
    /// Create an object instance
    Create,
    /// Delete an object instance
    Delete,
    /// Build the registration payload
    Register,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Read => f.write_str("Read"),
            Operation::Discover => f.write_str("Discover"),
            Operation::WriteReplace => f.write_str("Write-Replace"),
            Operation::WritePartialUpdate => f.write_str("Write-Partial-Update"),
            Operation::WriteComposite => f.write_str("Write-Composite"),
            Operation::Execute => f.write_str("Execute"),
            Operation::Create => f.write_str("Create"),
            Operation::Delete => f.write_str("Delete"),
            Operation::Register => f.write_str("Register"),
        }
    }
}

impl Operation {
    /// Response code of a successful operation
    pub fn success_code(self) -> ResponseCode {
        match self {
            Operation::Read | Operation::Discover => ResponseCode::Content,
            Operation::Create | Operation::Register => ResponseCode::Created,
            Operation::Delete => ResponseCode::Deleted,
            Operation::WriteReplace
            | Operation::WritePartialUpdate
            | Operation::WriteComposite
            | Operation::Execute => ResponseCode::Changed,
        }
    }
}

/// CoAP response codes produced at the data model boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    // Success codes
    /// 2.01 Created
    Created,
    /// 2.02 Deleted
    Deleted,
    /// 2.04 Changed
    Changed,
    /// 2.05 Content
    Content,
    /// 2.31 Continue
    Continue,

    // Client error codes
    /// 4.00 Bad Request
    BadRequest,
    /// 4.01 Unauthorized
    Unauthorized,
    /// 4.02 Bad Option
    BadOption,
    /// 4.04 Not Found
    NotFound,
    /// 4.05 Method Not Allowed
    MethodNotAllowed,
    /// 4.08 Request Entity Incomplete
    RequestEntityIncomplete,
    /// 4.13 Request Entity Too Large
    RequestEntityTooLarge,
    /// 4.15 Unsupported Content-Format
    UnsupportedContentFormat,

    // Server error codes
    /// 5.00 Internal Server Error
    InternalServerError,
    /// 5.01 Not Implemented
    NotImplemented,
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (class, detail) = self.to_code_pair();
        write!(f, "{}.{:02}", class, detail)
    }
}

impl ResponseCode {
    /// Convert to CoAP response code format (class.detail)
    pub fn to_code_pair(self) -> (u8, u8) {
        match self {
            Self::Created => (2, 1),
            Self::Deleted => (2, 2),
            Self::Changed => (2, 4),
            Self::Content => (2, 5),
            Self::Continue => (2, 31),
            Self::BadRequest => (4, 0),
            Self::Unauthorized => (4, 1),
            Self::BadOption => (4, 2),
            Self::NotFound => (4, 4),
            Self::MethodNotAllowed => (4, 5),
            Self::RequestEntityIncomplete => (4, 8),
            Self::RequestEntityTooLarge => (4, 13),
            Self::UnsupportedContentFormat => (4, 15),
            Self::InternalServerError => (5, 0),
            Self::NotImplemented => (5, 1),
        }
    }

    /// Raw code byte as it appears in the CoAP header (`class << 5 | detail`)
    pub fn to_byte(self) -> u8 {
        let (class, detail) = self.to_code_pair();
        (class << 5) | detail
    }

    /// Check if this is a success code
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Created | Self::Deleted | Self::Changed | Self::Content | Self::Continue
        )
    }
}
