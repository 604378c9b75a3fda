//! OMA-TLV (Content-Format 11542)
//!
//! Every element starts with a type byte:
//!
//! ```text
//!   7 6   5      4 3        2 1 0
//!  [kind][id16][len type][len bits]
//! ```
//!
//! `kind` is 00 object instance, 01 resource instance, 10 multiple resource
//! and 11 resource with value. The length type says whether the length sits
//! in the low bits (00) or follows the ID in 1, 2 or 3 bytes.
//!
//! Container lengths must be known before their contents, so the encoder
//! keeps open instance and multiple-resource groups in memory until the next
//! entry leaves them or the last entry arrives.

use log::debug;

use crate::coap_types::ContentFormat;
use crate::error::{DmError, DmResult, Error, Result};
use crate::io::payload::PayloadBuffer;
use crate::io::staging::{EXTERNAL_CHUNK, Staging};
use crate::io::{
    Chunk, DataType, Entry, ExternalData, InValue, Next, OutEntry, PayloadDecoder, PayloadEncoder,
    Progress, Value,
};
use crate::uri::{ObjLink, UriPath};

/// Longest element header: type, 16-bit ID, 24-bit length
const MAX_HEADER: usize = 6;
/// Longest scalar value
const MAX_SCALAR: usize = 8;
const MAX_LENGTH: usize = 0x00FF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Instance = 0,
    ResourceInstance = 1,
    MultipleResource = 2,
    Resource = 3,
}

impl Kind {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Kind::Instance,
            1 => Kind::ResourceInstance,
            2 => Kind::MultipleResource,
            _ => Kind::Resource,
        }
    }

    /// Path length of an element of this kind
    fn level(self) -> usize {
        match self {
            Kind::Instance => 2,
            Kind::MultipleResource | Kind::Resource => 3,
            Kind::ResourceInstance => 4,
        }
    }

    fn is_container(self) -> bool {
        matches!(self, Kind::Instance | Kind::MultipleResource)
    }
}

fn write_header(out: &mut Vec<u8>, kind: Kind, id: u16, len: usize) -> Result<()> {
    if len > MAX_LENGTH {
        return Err(Error::MessageTooBig);
    }
    let mut ty = (kind as u8) << 6;
    if id > 0xFF {
        ty |= 0x20;
    }
    let len_bytes: usize = match len {
        0..=7 => {
            ty |= len as u8;
            0
        }
        8..=0xFF => {
            ty |= 0x08;
            1
        }
        0x100..=0xFFFF => {
            ty |= 0x10;
            2
        }
        _ => {
            ty |= 0x18;
            3
        }
    };
    out.push(ty);
    if id > 0xFF {
        out.extend_from_slice(&id.to_be_bytes());
    } else {
        out.push(id as u8);
    }
    out.extend_from_slice(&(len as u32).to_be_bytes()[4 - len_bytes..]);
    Ok(())
}

fn int_bytes(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let len = if i8::try_from(value).is_ok() {
        1
    } else if i16::try_from(value).is_ok() {
        2
    } else if i32::try_from(value).is_ok() {
        4
    } else {
        8
    };
    bytes[8 - len..].to_vec()
}

fn pull_all(mut source: Box<dyn ExternalData>) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut piece = [0u8; EXTERNAL_CHUNK];
    loop {
        let progress = source.read(&mut piece, data.len())?;
        if progress.written > piece.len() || (progress.written == 0 && progress.more) {
            return Err(Error::Logic("external source made no progress"));
        }
        data.extend_from_slice(&piece[..progress.written]);
        if data.len() > MAX_LENGTH {
            return Err(Error::MessageTooBig);
        }
        if !progress.more {
            return Ok(data);
        }
    }
}

fn value_bytes(value: Value) -> Result<Vec<u8>> {
    Ok(match value {
        Value::Null => Vec::new(),
        Value::Int(v) | Value::Time(v) => int_bytes(v),
        Value::UInt(v) => match i64::try_from(v) {
            Ok(v) => int_bytes(v),
            Err(_) => v.to_be_bytes().to_vec(),
        },
        Value::Double(v) => {
            let single = v as f32;
            if f64::from(single) == v {
                single.to_be_bytes().to_vec()
            } else {
                v.to_be_bytes().to_vec()
            }
        }
        Value::Bool(v) => vec![u8::from(v)],
        Value::String(v) => v.into_bytes(),
        Value::Bytes(v) => v,
        Value::ObjLink(link) => {
            let mut out = link.oid.to_be_bytes().to_vec();
            out.extend_from_slice(&link.iid.to_be_bytes());
            out
        }
        Value::ExternalString(source) | Value::ExternalBytes(source) => pull_all(source)?,
    })
}

#[derive(Debug)]
struct Group {
    kind: Kind,
    id: u16,
    body: Vec<u8>,
}

#[derive(Debug)]
pub struct TlvEncoder {
    base_path: UriPath,
    items_count: usize,
    emitted: usize,
    groups: Vec<Group>,
    staging: Staging,
}

impl TlvEncoder {
    /// TLV cannot describe several objects, so the base must name one
    pub fn new(base_path: UriPath, items_count: usize) -> DmResult<Self> {
        if base_path == UriPath::Root {
            return Err(DmError::UnsupportedContentFormat);
        }
        Ok(Self {
            base_path,
            items_count,
            emitted: 0,
            groups: Vec::new(),
            staging: Staging::default(),
        })
    }

    /// Containers an entry at `path` must sit in
    fn groups_for(&self, path: &UriPath) -> heapless::Vec<(Kind, u16), 2> {
        let mut wanted = heapless::Vec::new();
        let ids = path.ids();
        if self.base_path.len() <= 1 && path.len() >= 3 {
            let _ = wanted.push((Kind::Instance, ids[1]));
        }
        if self.base_path.len() <= 3 && path.len() == 4 {
            let _ = wanted.push((Kind::MultipleResource, ids[2]));
        }
        wanted
    }

    /// Serialize the innermost open group into its parent
    fn close_group(&mut self) -> Result<()> {
        let Some(group) = self.groups.pop() else {
            return Ok(());
        };
        let out = match self.groups.last_mut() {
            Some(parent) => &mut parent.body,
            None => self.staging.out(),
        };
        write_header(out, group.kind, group.id, group.body.len())?;
        out.extend_from_slice(&group.body);
        Ok(())
    }
}

impl PayloadEncoder for TlvEncoder {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::OmaTlv
    }

    fn new_entry(&mut self, entry: OutEntry) -> Result<()> {
        if self.emitted == self.items_count {
            return Err(Error::Logic("more entries than announced"));
        }
        let path = entry.path;
        if path.len() < 3 || !self.base_path.is_prefix_of(&path) {
            return Err(Error::Logic("TLV entry must be a resource under the base path"));
        }
        self.staging.begin_entry()?;
        self.emitted += 1;

        let wanted = self.groups_for(&path);
        let keep = self
            .groups
            .iter()
            .zip(wanted.iter())
            .take_while(|(open, want)| open.kind == want.0 && open.id == want.1)
            .count();
        while self.groups.len() > keep {
            self.close_group()?;
        }
        for &(kind, id) in &wanted[keep..] {
            self.groups.push(Group {
                kind,
                id,
                body: Vec::new(),
            });
        }

        let (kind, id) = if path.len() == 4 {
            (Kind::ResourceInstance, path.ids()[3])
        } else {
            (Kind::Resource, path.ids()[2])
        };
        let value = value_bytes(entry.value)?;
        let out = match self.groups.last_mut() {
            Some(group) => &mut group.body,
            None => self.staging.out(),
        };
        write_header(out, kind, id, value.len())?;
        out.extend_from_slice(&value);

        if self.emitted == self.items_count {
            while !self.groups.is_empty() {
                self.close_group()?;
            }
        }
        Ok(())
    }

    fn get_payload(&mut self, buf: &mut [u8]) -> Result<Progress> {
        self.staging.drain(buf)
    }
}

#[derive(Debug, Clone, Copy)]
struct Container {
    kind: Kind,
    path: UriPath,
    remaining: usize,
}

#[derive(Debug, Clone, Copy)]
struct Leaf {
    path: UriPath,
    len: usize,
    offset: usize,
    /// Type chosen for string-like values once streaming started
    ty: Option<DataType>,
}

#[derive(Debug)]
pub struct TlvDecoder {
    request_uri: UriPath,
    payload: PayloadBuffer,
    containers: heapless::Vec<Container, 2>,
    leaf: Option<Leaf>,
    failed: bool,
}

impl TlvDecoder {
    /// The request must at least name an object
    pub fn new(request_uri: UriPath) -> Result<Self> {
        if request_uri == UriPath::Root {
            return Err(Error::Format("TLV needs an object path"));
        }
        Ok(Self {
            request_uri,
            payload: PayloadBuffer::new(MAX_HEADER.max(MAX_SCALAR)),
            containers: heapless::Vec::new(),
            leaf: None,
            failed: false,
        })
    }

    fn fail<T>(&mut self, reason: &'static str) -> Result<T> {
        debug!("TLV payload rejected: {}", reason);
        self.failed = true;
        Err(Error::Format(reason))
    }

    /// Account for `n` consumed bytes in every open container
    fn consumed(&mut self, n: usize) {
        for container in self.containers.iter_mut() {
            container.remaining -= n;
        }
    }

    fn close_finished_containers(&mut self) {
        while self.containers.last().is_some_and(|c| c.remaining == 0) {
            self.containers.pop();
        }
    }

    /// Parse the next element header; containers are entered, leaves returned
    fn next_leaf(&mut self) -> Result<Option<Leaf>> {
        loop {
            self.close_finished_containers();
            if self.containers.is_empty() && self.payload.at_end()? {
                return Ok(None);
            }
            let (kind, id, len, header_len) = {
                let data = self.payload.need(2)?;
                let ty = data[0];
                let id_len = if ty & 0x20 != 0 { 2 } else { 1 };
                let len_bytes = usize::from((ty >> 3) & 0x03);
                let header_len = 1 + id_len + len_bytes;
                let data = self.payload.need(header_len)?;
                let id = if id_len == 2 {
                    u16::from_be_bytes([data[1], data[2]])
                } else {
                    u16::from(data[1])
                };
                let len = if len_bytes == 0 {
                    usize::from(ty & 0x07)
                } else {
                    data[1 + id_len..header_len]
                        .iter()
                        .fold(0usize, |acc, &b| acc << 8 | usize::from(b))
                };
                (Kind::from_bits(ty >> 6), id, len, header_len)
            };

            let parent = match self.containers.last().copied() {
                Some(container) => {
                    let expected = match container.kind {
                        Kind::Instance => kind == Kind::Resource || kind == Kind::MultipleResource,
                        _ => kind == Kind::ResourceInstance,
                    };
                    if !expected {
                        return self.fail("TLV element of the wrong kind inside a container");
                    }
                    if header_len + len > container.remaining {
                        return self.fail("TLV element overruns its container");
                    }
                    container.path
                }
                None => {
                    let level = kind.level();
                    let uri = self.request_uri;
                    if uri.len() < level - 1 {
                        return self.fail("TLV element too deep for the request path");
                    }
                    if uri.len() >= level && uri.id(level - 1) != Some(id) {
                        return self.fail("TLV element does not match the request path");
                    }
                    uri.truncated(level - 1)
                }
            };
            let Ok(path) = parent.child(id) else {
                return self.fail("invalid TLV element ID");
            };
            self.payload.consume(header_len);
            self.consumed(header_len);

            if kind.is_container() {
                if len == 0 {
                    continue;
                }
                if self
                    .containers
                    .push(Container {
                        kind,
                        path,
                        remaining: len,
                    })
                    .is_err()
                {
                    return self.fail("TLV nesting too deep");
                }
                continue;
            }
            return Ok(Some(Leaf {
                path,
                len,
                offset: 0,
                ty: None,
            }));
        }
    }

    fn scalar(&mut self, leaf: Leaf, ty: DataType) -> Result<InValue<'static>> {
        if leaf.len > MAX_SCALAR {
            return self.fail("TLV scalar too long");
        }
        let mut raw = [0u8; MAX_SCALAR];
        raw[..leaf.len].copy_from_slice(&self.payload.need(leaf.len)?[..leaf.len]);
        let raw = &raw[..leaf.len];
        let signed = || -> Option<i64> {
            match raw.len() {
                1 => Some(i64::from(raw[0] as i8)),
                2 => Some(i64::from(i16::from_be_bytes([raw[0], raw[1]]))),
                4 => Some(i64::from(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))),
                8 => raw.try_into().ok().map(i64::from_be_bytes),
                _ => None,
            }
        };
        let value = if ty == DataType::INT {
            signed().map(InValue::Int)
        } else if ty == DataType::TIME {
            signed().map(InValue::Time)
        } else if ty == DataType::UINT {
            if raw.len() == 8 {
                raw.try_into().ok().map(|b| InValue::UInt(u64::from_be_bytes(b)))
            } else {
                signed()
                    .and_then(|v| u64::try_from(v).ok())
                    .map(InValue::UInt)
            }
        } else if ty == DataType::DOUBLE {
            match raw.len() {
                4 => raw
                    .try_into()
                    .ok()
                    .map(|b| InValue::Double(f64::from(f32::from_be_bytes(b)))),
                8 => raw.try_into().ok().map(|b| InValue::Double(f64::from_be_bytes(b))),
                _ => None,
            }
        } else if ty == DataType::BOOL {
            match raw {
                [0] => Some(InValue::Bool(false)),
                [1] => Some(InValue::Bool(true)),
                _ => None,
            }
        } else if ty == DataType::OBJLINK {
            match raw {
                [a, b, c, d] => Some(InValue::ObjLink(ObjLink::new(
                    u16::from_be_bytes([*a, *b]),
                    u16::from_be_bytes([*c, *d]),
                ))),
                _ => None,
            }
        } else {
            None
        };
        let Some(value) = value else {
            return self.fail("TLV value does not fit the resource type");
        };
        self.payload.consume(leaf.len);
        self.consumed(leaf.len);
        Ok(value)
    }

    fn next_entry(&mut self, hint: DataType) -> Result<Next<'_>> {
        let mut leaf = match self.leaf {
            Some(leaf) => leaf,
            None => match self.next_leaf()? {
                Some(leaf) => {
                    self.leaf = Some(leaf);
                    leaf
                }
                None => return Ok(Next::Eof),
            },
        };

        let ty = match leaf.ty {
            Some(ty) => ty,
            None => {
                if !hint.is_single() {
                    return Ok(Next::WantTypeDisambiguation(leaf.path));
                }
                hint
            }
        };
        if ty != DataType::STRING && ty != DataType::BYTES {
            let value = self.scalar(leaf, ty)?;
            self.leaf = None;
            return Ok(Next::Entry(Entry {
                path: leaf.path,
                value,
            }));
        }

        leaf.ty = Some(ty);
        self.leaf = Some(leaf);
        let offset = leaf.offset;
        let n = if offset == leaf.len {
            0
        } else {
            self.payload.need(1)?;
            self.payload.available().min(leaf.len - offset)
        };
        leaf.offset += n;
        self.leaf = (leaf.offset < leaf.len).then_some(leaf);
        self.consumed(n);
        let data: &[u8] = if n == 0 { &[] } else { self.payload.take(n)? };
        let chunk = Chunk {
            data,
            offset,
            full_length_hint: Some(leaf.len),
        };
        let value = if ty == DataType::STRING {
            InValue::String(chunk)
        } else {
            InValue::Bytes(chunk)
        };
        Ok(Next::Entry(Entry {
            path: leaf.path,
            value,
        }))
    }
}

impl PayloadDecoder for TlvDecoder {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::OmaTlv
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

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(base: UriPath, entries: Vec<(UriPath, Value)>) -> Vec<u8> {
        let mut enc = TlvEncoder::new(base, entries.len()).unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 5];
        for (path, value) in entries {
            enc.new_entry(OutEntry::new(path, value)).unwrap();
            loop {
                let progress = enc.get_payload(&mut buf).unwrap();
                out.extend_from_slice(&buf[..progress.written]);
                if !progress.more {
                    break;
                }
            }
        }
        out
    }

    #[test]
    fn test_header_forms() {
        let mut out = Vec::new();
        write_header(&mut out, Kind::Resource, 1, 3).unwrap();
        write_header(&mut out, Kind::Resource, 300, 8).unwrap();
        write_header(&mut out, Kind::Instance, 0, 300).unwrap();
        assert_eq!(out, [0xC3, 0x01, 0xE8, 0x01, 0x2C, 0x08, 0x10, 0x00, 0x01, 0x2C]);
    }

    #[test]
    fn test_instance_with_multiple_resource() {
        let out = encode_all(
            UriPath::Object(3),
            vec![
                (UriPath::Resource(3, 0, 0), Value::String("ab".into())),
                (UriPath::ResourceInstance(3, 0, 7, 0), Value::Int(1)),
                (UriPath::ResourceInstance(3, 0, 7, 1), Value::Int(-2)),
            ],
        );
        assert_eq!(
            hex::encode(out),
            "08000cc200616286074100014101fe"
        );
    }

    #[test]
    fn test_single_resource_read() {
        let out = encode_all(
            UriPath::Resource(3, 0, 9),
            vec![(UriPath::Resource(3, 0, 9), Value::UInt(300))],
        );
        assert_eq!(out, [0xC2, 0x09, 0x01, 0x2C]);
        assert!(TlvEncoder::new(UriPath::Root, 1).is_err());
    }

    fn decode_all(payload: &[u8], uri: UriPath) -> Result<Vec<(UriPath, String)>> {
        let mut dec = TlvDecoder::new(uri)?;
        dec.feed_payload(payload, true)?;
        let mut out = Vec::new();
        let mut hint = DataType::ANY;
        loop {
            match dec.get_entry(hint)? {
                Next::WantTypeDisambiguation(path) => {
                    hint = if path.len() == 4 {
                        DataType::INT
                    } else {
                        DataType::STRING
                    };
                }
                Next::Entry(entry) => {
                    out.push((entry.path, format!("{:?}", entry.value)));
                    hint = DataType::ANY;
                }
                Next::Eof => return Ok(out),
                Next::WantNextPayload => panic!("whole payload was fed"),
            }
        }
    }

    #[test]
    fn test_decode_nested_with_disambiguation() {
        let payload = hex::decode("08000cc200616286074100014101fe").unwrap();
        let got = decode_all(&payload, UriPath::Object(3)).unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].0, UriPath::Resource(3, 0, 0));
        assert_eq!(got[1], (UriPath::ResourceInstance(3, 0, 7, 0), "Int(1)".to_string()));
        assert_eq!(got[2], (UriPath::ResourceInstance(3, 0, 7, 1), "Int(-2)".to_string()));
    }

    #[test]
    fn test_decode_rejects_mismatched_paths() {
        // resource 1 written to /3/0/2
        assert!(decode_all(&[0xC1, 0x01, 0x05], UriPath::Resource(3, 0, 2)).is_err());
        // bare resource written to an object path
        assert!(decode_all(&[0xC1, 0x01, 0x05], UriPath::Object(3)).is_err());
        // element overruns its container
        assert!(decode_all(&[0x02, 0x00, 0xC1, 0x01, 0x05], UriPath::Object(3)).is_err());
    }

    #[test]
    fn test_decode_streams_strings_across_chunks() {
        let mut dec = TlvDecoder::new(UriPath::Instance(3, 0)).unwrap();
        dec.feed_payload(&[0xC5, 0x00, b'h', b'e'], false).unwrap();
        let mut text = Vec::new();
        match dec.get_entry(DataType::STRING).unwrap() {
            Next::Entry(Entry {
                value: InValue::String(chunk),
                ..
            }) => {
                assert_eq!(chunk.offset, 0);
                assert_eq!(chunk.full_length_hint, Some(5));
                text.extend_from_slice(chunk.data);
            }
            other => panic!("{:?}", other),
        }
        assert_eq!(dec.get_entry(DataType::STRING).unwrap(), Next::WantNextPayload);
        dec.feed_payload(b"llo", true).unwrap();
        match dec.get_entry(DataType::STRING).unwrap() {
            Next::Entry(Entry {
                value: InValue::String(chunk),
                ..
            }) => {
                assert!(chunk.is_last());
                text.extend_from_slice(chunk.data);
            }
            other => panic!("{:?}", other),
        }
        assert_eq!(text, b"hello");
        assert_eq!(dec.get_entry(DataType::STRING).unwrap(), Next::Eof);
    }
}
