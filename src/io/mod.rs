//! Payload encoders and decoders
//!
//! Every format shares one abstract value model: an [`OutEntry`] (path plus
//! owned [`Value`]) flows into a [`PayloadEncoder`], and a
//! [`PayloadDecoder`] hands back borrowed [`Entry`] values, possibly one
//! chunk at a time. Both sides are explicit state machines: returning from a
//! call is the suspension point, and the struct carries everything needed to
//! resume with a fresh buffer.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::coap_types::ContentFormat;
use crate::error::{DmError, DmResult, Result};
use crate::uri::{ObjLink, UriPath};

pub mod base64;
pub mod cbor;
pub mod link_format;
pub mod opaque;
pub mod plaintext;
pub(crate) mod payload;
pub(crate) mod staging;
pub mod tlv;

pub use cbor::lwm2m::{Lwm2mCborDecoder, Lwm2mCborEncoder};
pub use cbor::plain::{CborDecoder, CborEncoder};
pub use cbor::senml::{SenmlCborDecoder, SenmlCborEncoder};
pub use opaque::{OpaqueDecoder, OpaqueEncoder};
pub use plaintext::{PlainTextDecoder, PlainTextEncoder};
pub use tlv::{TlvDecoder, TlvEncoder};

/// Set of value types, used both as a tag and as a type-hint bitmask
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DataType(u16);

impl DataType {
    /// No type at all
    pub const NONE: Self = Self(0);
    /// Null (no value)
    pub const NULL: Self = Self(1 << 0);
    /// Signed integer
    pub const INT: Self = Self(1 << 1);
    /// Unsigned integer
    pub const UINT: Self = Self(1 << 2);
    /// IEEE-754 double
    pub const DOUBLE: Self = Self(1 << 3);
    /// Boolean
    pub const BOOL: Self = Self(1 << 4);
    /// UTF-8 string
    pub const STRING: Self = Self(1 << 5);
    /// Opaque bytes
    pub const BYTES: Self = Self(1 << 6);
    /// Object link
    pub const OBJLINK: Self = Self(1 << 7);
    /// Time (seconds since the epoch)
    pub const TIME: Self = Self(1 << 8);
    /// String pulled from a callback
    pub const EXTERNAL_STRING: Self = Self(1 << 9);
    /// Bytes pulled from a callback
    pub const EXTERNAL_BYTES: Self = Self(1 << 10);
    /// Every type a decoder can produce
    pub const ANY: Self = Self(0x01FF);

    /// Whether every type of `other` is in `self`
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Whether the set names exactly one type
    pub fn is_single(self) -> bool {
        self.0.count_ones() == 1
    }

    /// Whether the set is empty
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for DataType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for DataType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for DataType {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 11] = [
            "Null", "Int", "UInt", "Double", "Bool", "String", "Bytes", "ObjLink", "Time",
            "ExternalString", "ExternalBytes",
        ];
        let mut set = f.debug_set();
        for (bit, name) in NAMES.iter().enumerate() {
            if self.0 & (1 << bit) != 0 {
                set.entry(&format_args!("{}", name));
            }
        }
        set.finish()
    }
}

/// Amount of work done by one drain or pull call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Bytes written into the caller's buffer
    pub written: usize,
    /// Whether more output is pending; call again with a fresh buffer
    pub more: bool,
}

/// Pull-style data source for large string or bytes values
///
/// `read` fills `buf` with data starting at `offset` and reports whether
/// anything remains after it.
pub trait ExternalData {
    /// Copy the next piece of data into `buf`
    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<Progress>;
}

impl<F> ExternalData for F
where
    F: FnMut(&mut [u8], usize) -> Result<Progress>,
{
    fn read(&mut self, buf: &mut [u8], offset: usize) -> Result<Progress> {
        self(buf, offset)
    }
}

/// Owned value handed to encoders
pub enum Value {
    /// No value (name-only records)
    Null,
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Double
    Double(f64),
    /// Boolean
    Bool(bool),
    /// UTF-8 string
    String(String),
    /// Opaque bytes
    Bytes(Vec<u8>),
    /// Object link
    ObjLink(ObjLink),
    /// Seconds since the epoch
    Time(i64),
    /// String pulled on demand
    ExternalString(Box<dyn ExternalData>),
    /// Bytes pulled on demand
    ExternalBytes(Box<dyn ExternalData>),
}

impl Value {
    /// Type tag of the value
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::NULL,
            Value::Int(_) => DataType::INT,
            Value::UInt(_) => DataType::UINT,
            Value::Double(_) => DataType::DOUBLE,
            Value::Bool(_) => DataType::BOOL,
            Value::String(_) => DataType::STRING,
            Value::Bytes(_) => DataType::BYTES,
            Value::ObjLink(_) => DataType::OBJLINK,
            Value::Time(_) => DataType::TIME,
            Value::ExternalString(_) => DataType::EXTERNAL_STRING,
            Value::ExternalBytes(_) => DataType::EXTERNAL_BYTES,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("Null"),
            Value::Int(v) => f.debug_tuple("Int").field(v).finish(),
            Value::UInt(v) => f.debug_tuple("UInt").field(v).finish(),
            Value::Double(v) => f.debug_tuple("Double").field(v).finish(),
            Value::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Value::String(v) => f.debug_tuple("String").field(v).finish(),
            Value::Bytes(v) => f.debug_tuple("Bytes").field(v).finish(),
            Value::ObjLink(v) => f.debug_tuple("ObjLink").field(v).finish(),
            Value::Time(v) => f.debug_tuple("Time").field(v).finish(),
            Value::ExternalString(_) => f.write_str("ExternalString(..)"),
            Value::ExternalBytes(_) => f.write_str("ExternalBytes(..)"),
        }
    }
}

/// One value to encode, tagged with its path
#[derive(Debug)]
pub struct OutEntry {
    /// Where the value lives
    pub path: UriPath,
    /// The value
    pub value: Value,
}

impl OutEntry {
    /// Create a new entry
    pub fn new(path: UriPath, value: Value) -> Self {
        Self { path, value }
    }
}

/// Piece of a string or bytes value delivered by a decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    /// Bytes of this piece
    pub data: &'a [u8],
    /// Position of `data` within the whole value
    pub offset: usize,
    /// Length of the whole value, once known
    pub full_length_hint: Option<usize>,
}

impl Chunk<'_> {
    /// Whether this is the final piece of the value
    pub fn is_last(&self) -> bool {
        self.full_length_hint == Some(self.offset + self.data.len())
    }
}

/// Value produced by a decoder
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InValue<'a> {
    /// No value
    Null,
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Double
    Double(f64),
    /// Boolean
    Bool(bool),
    /// Object link
    ObjLink(ObjLink),
    /// Seconds since the epoch
    Time(i64),
    /// Piece of a UTF-8 string
    String(Chunk<'a>),
    /// Piece of opaque bytes
    Bytes(Chunk<'a>),
}

impl InValue<'_> {
    /// Type tag of the value
    pub fn data_type(&self) -> DataType {
        match self {
            InValue::Null => DataType::NULL,
            InValue::Int(_) => DataType::INT,
            InValue::UInt(_) => DataType::UINT,
            InValue::Double(_) => DataType::DOUBLE,
            InValue::Bool(_) => DataType::BOOL,
            InValue::ObjLink(_) => DataType::OBJLINK,
            InValue::Time(_) => DataType::TIME,
            InValue::String(_) => DataType::STRING,
            InValue::Bytes(_) => DataType::BYTES,
        }
    }
}

/// Decoded value tagged with its path
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry<'a> {
    /// Where the value goes
    pub path: UriPath,
    /// The value or a piece of it
    pub value: InValue<'a>,
}

/// Outcome of [`PayloadDecoder::get_entry`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Next<'a> {
    /// A complete value, or the next piece of a streamed one
    Entry(Entry<'a>),
    /// The format carries no type; call again with a single-type hint
    WantTypeDisambiguation(UriPath),
    /// Feed the next payload chunk, then call again
    WantNextPayload,
    /// The payload is exhausted
    Eof,
}

/// Streaming encoder for one content format
pub trait PayloadEncoder {
    /// Content format produced
    fn content_format(&self) -> ContentFormat;

    /// Start encoding one entry; the previous one must be fully drained
    fn new_entry(&mut self, entry: OutEntry) -> Result<()>;

    /// Copy as much pending output as fits into `buf`
    fn get_payload(&mut self, buf: &mut [u8]) -> Result<Progress>;
}

/// Streaming decoder for one content format
pub trait PayloadDecoder {
    /// Content format consumed
    fn content_format(&self) -> ContentFormat;

    /// Hand over the next payload chunk
    ///
    /// Only valid on a fresh decoder or after `WantNextPayload`.
    fn feed_payload(&mut self, payload: &[u8], payload_finished: bool) -> Result<()>;

    /// Decode the next entry or entry piece
    ///
    /// `hint` is the set of types acceptable to the caller. Typed formats
    /// convert to a member of the set when lossless; untyped formats require
    /// a single type and otherwise answer `WantTypeDisambiguation`.
    fn get_entry(&mut self, hint: DataType) -> Result<Next<'_>>;
}

/// Build the encoder for a Read or Read-Composite response
pub fn out_ctx(
    format: u16,
    base_path: UriPath,
    items_count: usize,
) -> DmResult<Box<dyn PayloadEncoder>> {
    let format = ContentFormat::from_u16(format).ok_or(DmError::UnsupportedContentFormat)?;
    let single = || {
        if items_count == 1 {
            Ok(())
        } else {
            Err(DmError::UnsupportedContentFormat)
        }
    };
    let encoder: Box<dyn PayloadEncoder> = match format {
        ContentFormat::SenmlCbor | ContentFormat::SenmlEtchCbor => {
            Box::new(SenmlCborEncoder::new(format, base_path, items_count))
        }
        ContentFormat::Lwm2mCbor => Box::new(Lwm2mCborEncoder::new(items_count, None)),
        ContentFormat::OmaTlv => Box::new(TlvEncoder::new(base_path, items_count)?),
        ContentFormat::Cbor => {
            single()?;
            Box::new(CborEncoder::new())
        }
        ContentFormat::PlainText => {
            single()?;
            Box::new(PlainTextEncoder::new())
        }
        ContentFormat::Opaque => {
            single()?;
            Box::new(OpaqueEncoder::new())
        }
        ContentFormat::LinkFormat
        | ContentFormat::SenmlJson
        | ContentFormat::SenmlEtchJson
        | ContentFormat::Lwm2mJson => return Err(DmError::UnsupportedContentFormat),
    };
    Ok(encoder)
}

/// Build the decoder for a Write, Create or Write-Composite request
pub fn in_ctx(format: u16, request_uri: UriPath) -> DmResult<Box<dyn PayloadDecoder>> {
    let format = ContentFormat::from_u16(format).ok_or(DmError::UnsupportedContentFormat)?;
    let decoder: Box<dyn PayloadDecoder> = match format {
        ContentFormat::SenmlCbor | ContentFormat::SenmlEtchCbor => {
            Box::new(SenmlCborDecoder::new(format, request_uri))
        }
        ContentFormat::Lwm2mCbor => Box::new(Lwm2mCborDecoder::new(request_uri)),
        ContentFormat::OmaTlv => Box::new(TlvDecoder::new(request_uri)?),
        ContentFormat::Cbor => Box::new(CborDecoder::new(request_uri)?),
        ContentFormat::PlainText => Box::new(PlainTextDecoder::new(request_uri)?),
        ContentFormat::Opaque => Box::new(OpaqueDecoder::new(request_uri)?),
        ContentFormat::LinkFormat
        | ContentFormat::SenmlJson
        | ContentFormat::SenmlEtchJson
        | ContentFormat::Lwm2mJson => return Err(DmError::UnsupportedContentFormat),
    };
    Ok(decoder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_type_set_operations() {
        let hint = DataType::INT | DataType::DOUBLE;
        assert!(hint.contains(DataType::INT));
        assert!(!hint.contains(DataType::UINT));
        assert!(!hint.is_single());
        assert!((hint & DataType::DOUBLE).is_single());
        assert!(DataType::ANY.contains(DataType::TIME));
        assert!(!DataType::ANY.contains(DataType::EXTERNAL_BYTES));
    }

    #[test]
    fn test_chunk_is_last() {
        let chunk = Chunk {
            data: b"ab",
            offset: 3,
            full_length_hint: Some(5),
        };
        assert!(chunk.is_last());
        let chunk = Chunk {
            full_length_hint: None,
            ..chunk
        };
        assert!(!chunk.is_last());
    }

    #[test]
    fn test_factories_reject_unsupported_formats() {
        assert!(matches!(
            out_ctx(110, UriPath::Object(3), 1),
            Err(DmError::UnsupportedContentFormat)
        ));
        assert!(matches!(
            out_ctx(0, UriPath::Object(3), 2),
            Err(DmError::UnsupportedContentFormat)
        ));
        assert!(matches!(
            in_ctx(1234, UriPath::Object(3)),
            Err(DmError::UnsupportedContentFormat)
        ));
    }
}
