//! Plain text (Content-Format 0): one value of a single resource
//!
//! Numbers are decimal, booleans `0`/`1`, object links `oid:iid` and opaque
//! data base64. Strings pass through unchanged. The format carries no type,
//! so the decoder asks for a single-type hint before reading anything.

use std::ops::Range;

use log::debug;

use crate::coap_types::ContentFormat;
use crate::error::{Error, Result};
use crate::io::base64::{Base64Stream, InPlaceBase64};
use crate::io::payload::PayloadBuffer;
use crate::io::staging::{Framing, Staging};
use crate::io::{
    Chunk, DataType, Entry, InValue, Next, OutEntry, PayloadDecoder, PayloadEncoder, Progress,
    Value,
};
use crate::uri::{ObjLink, UriPath};

/// Longest accepted textual scalar
const MAX_SCALAR_TEXT: usize = 64;

fn format_double(value: f64) -> String {
    let text = value.to_string();
    if text.len() > 32 {
        format!("{:e}", value)
    } else {
        text
    }
}

#[derive(Debug, Default)]
pub struct PlainTextEncoder {
    staging: Staging,
    used: bool,
}

impl PlainTextEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadEncoder for PlainTextEncoder {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::PlainText
    }

    fn new_entry(&mut self, entry: OutEntry) -> Result<()> {
        if self.used {
            return Err(Error::Logic("plain text carries a single value"));
        }
        if matches!(entry.value, Value::Null) {
            return Err(Error::Logic("plain text cannot carry a null value"));
        }
        self.staging.begin_entry()?;
        self.used = true;

        let out = self.staging.out();
        match entry.value {
            Value::Null => {}
            Value::Int(v) | Value::Time(v) => out.extend_from_slice(v.to_string().as_bytes()),
            Value::UInt(v) => out.extend_from_slice(v.to_string().as_bytes()),
            Value::Double(v) => out.extend_from_slice(format_double(v).as_bytes()),
            Value::Bool(v) => out.push(if v { b'1' } else { b'0' }),
            Value::String(v) => out.extend_from_slice(v.as_bytes()),
            Value::ObjLink(link) => out.extend_from_slice(link.to_string().as_bytes()),
            Value::Bytes(v) => {
                let mut base64 = Base64Stream::default();
                base64.encode_chunk(&v, out);
                base64.finish(out);
            }
            Value::ExternalString(source) => {
                self.staging.push_external(source, Framing::Raw, Vec::new())
            }
            Value::ExternalBytes(source) => {
                self.staging.push_external(source, Framing::Base64, Vec::new())
            }
        }
        Ok(())
    }

    fn get_payload(&mut self, buf: &mut [u8]) -> Result<Progress> {
        self.staging.drain(buf)
    }
}

fn parse_scalar(raw: &[u8], ty: DataType) -> Option<InValue<'static>> {
    let text = std::str::from_utf8(raw).ok()?;
    if ty == DataType::INT {
        text.parse().ok().map(InValue::Int)
    } else if ty == DataType::UINT {
        text.parse().ok().map(InValue::UInt)
    } else if ty == DataType::TIME {
        text.parse().ok().map(InValue::Time)
    } else if ty == DataType::DOUBLE {
        text.parse().ok().map(InValue::Double)
    } else if ty == DataType::BOOL {
        match text {
            "0" => Some(InValue::Bool(false)),
            "1" => Some(InValue::Bool(true)),
            _ => None,
        }
    } else if ty == DataType::OBJLINK {
        text.parse::<ObjLink>().ok().map(InValue::ObjLink)
    } else {
        None
    }
}

fn chunk_entry(path: UriPath, ty: DataType, data: &[u8], offset: usize, last: bool) -> Next<'_> {
    let chunk = Chunk {
        data,
        offset,
        full_length_hint: last.then_some(offset + data.len()),
    };
    let value = if ty == DataType::BYTES {
        InValue::Bytes(chunk)
    } else {
        InValue::String(chunk)
    };
    Next::Entry(Entry { path, value })
}

#[derive(Debug)]
pub struct PlainTextDecoder {
    path: UriPath,
    payload: PayloadBuffer,
    ty: Option<DataType>,
    base64: InPlaceBase64,
    /// Decoded bytes of a base64 group split across chunks
    staged: heapless::Vec<u8, 3>,
    /// In-place output waiting behind `staged`
    pending: Option<Range<usize>>,
    offset: usize,
    done: bool,
    failed: bool,
}

impl PlainTextDecoder {
    /// The request must address a resource or resource instance
    pub fn new(request_uri: UriPath) -> Result<Self> {
        if !matches!(
            request_uri,
            UriPath::Resource(..) | UriPath::ResourceInstance(..)
        ) {
            return Err(Error::Format("plain text needs a resource path"));
        }
        Ok(Self {
            path: request_uri,
            payload: PayloadBuffer::new(MAX_SCALAR_TEXT),
            ty: None,
            base64: InPlaceBase64::new(),
            staged: heapless::Vec::new(),
            pending: None,
            offset: 0,
            done: false,
            failed: false,
        })
    }

    fn fail<T>(&mut self, reason: &'static str) -> Result<T> {
        debug!("plain text payload rejected: {}", reason);
        self.failed = true;
        Err(Error::Format(reason))
    }

    fn scalar(&mut self, ty: DataType) -> Result<Next<'_>> {
        let available = self.payload.available();
        if available > MAX_SCALAR_TEXT {
            return self.fail("textual value too long");
        }
        if !self.payload.is_finished() {
            self.payload.need(available + 1)?;
        }
        let value = parse_scalar(&self.payload.need(available)?[..available], ty);
        let Some(value) = value else {
            return self.fail("text does not parse as the resource type");
        };
        self.payload.consume(available);
        self.done = true;
        Ok(Next::Entry(Entry {
            path: self.path,
            value,
        }))
    }

    fn string(&mut self) -> Result<Next<'_>> {
        let last = self.payload.is_finished();
        let n = self.payload.available();
        if n == 0 && !last {
            self.payload.need(1)?;
        }
        let data: &[u8] = if n == 0 { &[] } else { self.payload.take(n)? };
        let offset = self.offset;
        self.offset += data.len();
        self.done = last;
        Ok(chunk_entry(self.path, DataType::STRING, data, offset, last))
    }

    fn bytes(&mut self) -> Result<Next<'_>> {
        let path = self.path;
        let offset = self.offset;
        if let Some(range) = self.pending.take() {
            let last = self.payload.is_finished();
            let data = self.payload.consumed_region(range);
            self.offset += data.len();
            self.done = last;
            return Ok(chunk_entry(path, DataType::BYTES, data, offset, last));
        }

        let last = self.payload.is_finished();
        let start = self.payload.position();
        let n = self.payload.available();
        if n == 0 && !last {
            self.payload.need(1)?;
        }
        let data: &mut [u8] = if n == 0 { &mut [] } else { self.payload.take(n)? };
        let decoded = match self.base64.decode_chunk(data, last) {
            Ok(decoded) => decoded,
            Err(e) => {
                debug!("plain text payload rejected: {}", e);
                self.failed = true;
                return Err(e);
            }
        };
        if decoded.staged.is_empty() && decoded.in_place == 0 && !last {
            self.payload.need(1)?;
            return Ok(Next::WantNextPayload);
        }
        if decoded.staged.is_empty() {
            let data = self.payload.consumed_region(start..start + decoded.in_place);
            self.offset += data.len();
            self.done = last;
            return Ok(chunk_entry(path, DataType::BYTES, data, offset, last));
        }

        if decoded.in_place > 0 {
            self.pending = Some(start..start + decoded.in_place);
        }
        let last = last && self.pending.is_none();
        self.staged = decoded.staged;
        self.offset += self.staged.len();
        self.done = last;
        Ok(chunk_entry(path, DataType::BYTES, &self.staged, offset, last))
    }

    fn next_entry(&mut self, hint: DataType) -> Result<Next<'_>> {
        if self.done {
            return Ok(Next::Eof);
        }
        let ty = match self.ty {
            Some(ty) => ty,
            None => {
                if !hint.is_single() {
                    return Ok(Next::WantTypeDisambiguation(self.path));
                }
                self.ty = Some(hint);
                hint
            }
        };
        if ty == DataType::STRING {
            self.string()
        } else if ty == DataType::BYTES {
            self.bytes()
        } else {
            self.scalar(ty)
        }
    }
}

impl PayloadDecoder for PlainTextDecoder {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::PlainText
    }

    fn feed_payload(&mut self, payload: &[u8], payload_finished: bool) -> Result<()> {
        self.payload.feed(payload, payload_finished)
    }

    fn get_entry(&mut self, hint: DataType) -> Result<Next<'_>> {
        if self.failed {
            return Err(Error::Format("decoder in error state"));
        }
        match self.next_entry(hint) {
            Err(Error::WantNextPayload) => Ok(Next::WantNextPayload),
            other => other,
        }
    }
}
