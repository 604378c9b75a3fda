//! CoAP option container
//!
//! Options are kept in their RFC 7252 wire form (delta + length nibbles,
//! sorted by option number) inside either a caller-owned fixed buffer or an
//! owned growable buffer. Adding an option re-encodes the delta of the option
//! that follows it, so [`Options::as_bytes`] is always a valid option block.

use std::ops::Range;

use crate::coap::block::{BlockKind, BlockOption};
use crate::coap_types::FORMAT_NONE;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::uri::UriPath;

/// If-Match
pub const IF_MATCH: u16 = 1;
/// Uri-Host
pub const URI_HOST: u16 = 3;
/// ETag
pub const ETAG: u16 = 4;
/// If-None-Match
pub const IF_NONE_MATCH: u16 = 5;
/// Observe
pub const OBSERVE: u16 = 6;
/// Uri-Port
pub const URI_PORT: u16 = 7;
/// Location-Path
pub const LOCATION_PATH: u16 = 8;
/// Uri-Path
pub const URI_PATH: u16 = 11;
/// Content-Format
pub const CONTENT_FORMAT: u16 = 12;
/// Max-Age
pub const MAX_AGE: u16 = 14;
/// Uri-Query
pub const URI_QUERY: u16 = 15;
/// Accept
pub const ACCEPT: u16 = 17;
/// Location-Query
pub const LOCATION_QUERY: u16 = 20;
/// Block2
pub const BLOCK2: u16 = 23;
/// Block1
pub const BLOCK1: u16 = 27;
/// Size2
pub const SIZE2: u16 = 28;
/// Proxy-Uri
pub const PROXY_URI: u16 = 35;
/// Size1
pub const SIZE1: u16 = 60;

/// Marker separating options from the payload
pub const PAYLOAD_MARKER: u8 = 0xFF;

const MAX_ETAG_LEN: usize = 8;
const MAX_UINT_LEN: usize = 8;
const MAX_NIBBLE_VALUE: usize = 0xFFFF + 269;

/// Entity tag: up to eight opaque bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct ETag {
    bytes: heapless::Vec<u8, MAX_ETAG_LEN>,
}

impl ETag {
    /// Create an ETag, failing with `Malformed` for more than 8 bytes
    pub fn new(bytes: &[u8]) -> Result<Self> {
        let bytes = heapless::Vec::from_slice(bytes)
            .map_err(|_| Error::Malformed("ETag longer than 8 bytes"))?;
        Ok(Self { bytes })
    }

    /// The tag bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of bytes in the tag
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the tag is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Cursor for reading repeated options one at a time
///
/// The iterator is bound to the option number of its first use; reusing it
/// with another number is rejected with a `Logic` error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OptionIter {
    number: Option<u16>,
    index: usize,
}

impl OptionIter {
    /// Create a fresh iterator
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&mut self, number: u16) -> Result<usize> {
        match self.number {
            Some(bound) if bound != number => {
                Err(Error::Logic("option iterator reused with another option number"))
            }
            _ => {
                self.number = Some(number);
                let index = self.index;
                self.index += 1;
                Ok(index)
            }
        }
    }
}

#[derive(Debug)]
enum Storage<'a> {
    Fixed { buf: &'a mut [u8], len: usize },
    Dynamic(Vec<u8>),
}

/// Location of one encoded option inside the buffer
#[derive(Debug, Clone)]
struct RawOpt {
    number: u16,
    start: usize,
    value: Range<usize>,
}

/// Sorted sequence of CoAP options
#[derive(Debug)]
pub struct Options<'a> {
    storage: Storage<'a>,
}

impl<'a> Options<'a> {
    /// Container backed by a caller-owned buffer; overflowing it fails with `MessageTooBig`
    pub fn new_fixed(buf: &'a mut [u8]) -> Self {
        Self {
            storage: Storage::Fixed { buf, len: 0 },
        }
    }
}

impl Options<'static> {
    /// Container backed by an owned buffer that grows on demand
    pub fn new_dynamic(initial_capacity: usize) -> Result<Self> {
        let mut buf = Vec::new();
        buf.try_reserve(initial_capacity)
            .map_err(|_| Error::OutOfMemory)?;
        Ok(Self {
            storage: Storage::Dynamic(buf),
        })
    }

    /// Owned container pre-sized to the configured option capacity
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new_dynamic(config.max_options_size)
    }

    /// Parse an option block received on the wire
    ///
    /// Parsing stops at the payload marker or at the end of `bytes`; the
    /// returned length is the number of bytes consumed, marker included.
    pub fn from_wire(bytes: &[u8]) -> Result<(Self, usize)> {
        let mut pos = 0;
        let mut number: u32 = 0;
        while pos < bytes.len() {
            if bytes[pos] == PAYLOAD_MARKER {
                if pos + 1 == bytes.len() {
                    return Err(Error::Malformed("payload marker without payload"));
                }
                let options = Self::new_dynamic(pos)?;
                return Ok((options.with_raw(&bytes[..pos])?, pos + 1));
            }
            let raw = parse_header(bytes, pos, number)?;
            number = u32::from(raw.number);
            pos = raw.value.end;
        }
        let options = Self::new_dynamic(pos)?;
        Ok((options.with_raw(bytes)?, pos))
    }

    fn with_raw(mut self, raw: &[u8]) -> Result<Self> {
        self.splice(0..0, raw)?;
        Ok(self)
    }
}

impl Options<'_> {
    /// Wire encoding of all options, in number order
    pub fn as_bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Fixed { buf, len } => &buf[..*len],
            Storage::Dynamic(buf) => buf,
        }
    }

    /// Whether no options are present
    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    /// Iterate over `(number, value)` pairs in wire order
    pub fn iter(&self) -> impl Iterator<Item = (u16, &[u8])> + '_ {
        let bytes = self.as_bytes();
        self.raw_opts().map(move |raw| (raw.number, &bytes[raw.value]))
    }

    /// Number of options present
    pub fn count(&self) -> usize {
        self.raw_opts().count()
    }

    /// Append an opaque option
    pub fn add_opaque(&mut self, number: u16, value: &[u8]) -> Result<()> {
        if value.len() > MAX_NIBBLE_VALUE {
            return Err(Error::MessageTooBig);
        }
        let opts: Vec<RawOpt> = self.raw_opts().collect();
        let insert_at = opts.iter().rposition(|raw| raw.number <= number);
        let (pos, prev_number) = match insert_at {
            Some(i) => (opts[i].value.end, opts[i].number),
            None => (0, 0),
        };
        let next = insert_at.map_or(0, |i| i + 1);

        let mut encoded = encode_header(number - prev_number, value.len());
        encoded.extend_from_slice(value);
        let replaced_end = match opts.get(next) {
            Some(following) => {
                encoded.extend(encode_header(following.number - number, following.value.len()));
                following.value.start
            }
            None => pos,
        };
        self.splice(pos..replaced_end, &encoded)
    }

    /// Append a UTF-8 string option
    pub fn add_string(&mut self, number: u16, value: &str) -> Result<()> {
        self.add_opaque(number, value.as_bytes())
    }

    /// Append an unsigned integer option in minimal-length form (0 is empty)
    pub fn add_uint(&mut self, number: u16, value: u64) -> Result<()> {
        let bytes = value.to_be_bytes();
        let skip = (value.leading_zeros() / 8) as usize;
        self.add_opaque(number, &bytes[skip..])
    }

    /// Append an option without value
    pub fn add_empty(&mut self, number: u16) -> Result<()> {
        self.add_opaque(number, &[])
    }

    /// Remove every instance of an option
    pub fn remove_by_number(&mut self, number: u16) -> Result<()> {
        let opts: Vec<RawOpt> = self.raw_opts().collect();
        let Some(first) = opts.iter().position(|raw| raw.number == number) else {
            return Ok(());
        };
        let last = opts.iter().rposition(|raw| raw.number == number).unwrap_or(first);
        let prev_number = if first == 0 { 0 } else { opts[first - 1].number };
        let start = opts[first].start;
        match opts.get(last + 1) {
            Some(following) => {
                let header =
                    encode_header(following.number - prev_number, following.value.len());
                self.splice(start..following.value.start, &header)
            }
            None => self.splice(start..opts[last].value.end, &[]),
        }
    }

    /// Set the single Content-Format option; [`FORMAT_NONE`] removes it
    pub fn set_content_format(&mut self, format: u16) -> Result<()> {
        self.remove_by_number(CONTENT_FORMAT)?;
        if format == FORMAT_NONE {
            return Ok(());
        }
        self.add_uint(CONTENT_FORMAT, u64::from(format))
    }

    /// Content-Format; the first occurrence wins
    pub fn get_content_format(&self) -> Result<u16> {
        let value = self.get_uint(CONTENT_FORMAT)?;
        u16::try_from(value).map_err(|_| Error::Malformed("Content-Format wider than 16 bits"))
    }

    /// Accept option, if present
    pub fn get_accept(&self) -> Result<u16> {
        let value = self.get_uint(ACCEPT)?;
        u16::try_from(value).map_err(|_| Error::Malformed("Accept wider than 16 bits"))
    }

    /// First occurrence of an integer option
    pub fn get_uint(&self, number: u16) -> Result<u64> {
        let value = self.first(number).ok_or(Error::Missing)?;
        decode_uint(value)
    }

    /// Add a BLOCK1 or BLOCK2 option
    pub fn add_block(&mut self, block: &BlockOption) -> Result<()> {
        let value = block.encode()?;
        self.add_uint(block.kind.option_number(), u64::from(value))
    }

    /// Read a BLOCK1 or BLOCK2 option
    pub fn get_block(&self, kind: BlockKind, bert_enabled: bool) -> Result<BlockOption> {
        let value = self.first(kind.option_number()).ok_or(Error::Missing)?;
        if value.len() > 3 {
            return Err(Error::Malformed("block option longer than 3 bytes"));
        }
        let raw = decode_uint(value)?;
        BlockOption::decode(kind, raw as u32, bert_enabled)
    }

    /// Add an Observe option
    pub fn add_observe(&mut self, value: u32) -> Result<()> {
        self.add_uint(OBSERVE, u64::from(value & 0x00FF_FFFF))
    }

    /// Observe option value
    pub fn get_observe(&self) -> Result<u32> {
        let value = self.first(OBSERVE).ok_or(Error::Missing)?;
        if value.len() > 3 {
            return Err(Error::Malformed("Observe longer than 3 bytes"));
        }
        Ok(decode_uint(value)? as u32)
    }

    /// Add an ETag option
    pub fn add_etag(&mut self, etag: &ETag) -> Result<()> {
        self.add_opaque(ETAG, etag.as_bytes())
    }

    /// First ETag; used where a single ETag is meaningful
    pub fn get_etag(&self) -> Result<ETag> {
        ETag::new(self.first(ETAG).ok_or(Error::Missing)?)
    }

    /// Next value of a repeated option
    pub fn get_bytes_it(&self, number: u16, it: &mut OptionIter) -> Result<&[u8]> {
        let index = it.advance(number)?;
        let bytes = self.as_bytes();
        self.raw_opts()
            .filter(|raw| raw.number == number)
            .nth(index)
            .map(|raw| &bytes[raw.value])
            .ok_or(Error::Missing)
    }

    /// Next value of a repeated string option
    pub fn get_string_it(&self, number: u16, it: &mut OptionIter) -> Result<&str> {
        let bytes = self.get_bytes_it(number, it)?;
        std::str::from_utf8(bytes).map_err(|_| Error::Malformed("option is not UTF-8"))
    }

    /// Next ETag (requests may carry several)
    pub fn get_etag_it(&self, it: &mut OptionIter) -> Result<ETag> {
        ETag::new(self.get_bytes_it(ETAG, it)?)
    }

    /// Build a data model path from the Uri-Path options
    ///
    /// A single empty segment (or no Uri-Path at all) addresses the root.
    pub fn uri_path(&self) -> Result<UriPath> {
        let mut it = OptionIter::new();
        let mut ids = heapless::Vec::<u16, 4>::new();
        loop {
            let segment = match self.get_string_it(URI_PATH, &mut it) {
                Ok(segment) => segment,
                Err(Error::Missing) => break,
                Err(err) => return Err(err),
            };
            if segment.is_empty() && ids.is_empty() {
                continue;
            }
            let id = segment
                .parse::<u16>()
                .map_err(|_| Error::Malformed("Uri-Path segment is not an ID"))?;
            ids.push(id)
                .map_err(|_| Error::Malformed("Uri-Path deeper than four levels"))?;
        }
        UriPath::from_ids(&ids).map_err(|_| Error::Malformed("Uri-Path uses reserved ID"))
    }

    fn first(&self, number: u16) -> Option<&[u8]> {
        let bytes = self.as_bytes();
        self.raw_opts()
            .find(|raw| raw.number == number)
            .map(|raw| &bytes[raw.value])
    }

    fn raw_opts(&self) -> RawOpts<'_> {
        RawOpts {
            bytes: self.as_bytes(),
            pos: 0,
            number: 0,
        }
    }

    fn splice(&mut self, range: Range<usize>, with: &[u8]) -> Result<()> {
        match &mut self.storage {
            Storage::Fixed { buf, len } => {
                let new_len = *len - range.len() + with.len();
                if new_len > buf.len() {
                    return Err(Error::MessageTooBig);
                }
                buf.copy_within(range.end..*len, range.start + with.len());
                buf[range.start..range.start + with.len()].copy_from_slice(with);
                *len = new_len;
            }
            Storage::Dynamic(buf) => {
                if with.len() > range.len() {
                    buf.try_reserve(with.len() - range.len())
                        .map_err(|_| Error::OutOfMemory)?;
                }
                buf.splice(range, with.iter().copied());
            }
        }
        Ok(())
    }
}

struct RawOpts<'b> {
    bytes: &'b [u8],
    pos: usize,
    number: u32,
}

impl Iterator for RawOpts<'_> {
    type Item = RawOpt;

    fn next(&mut self) -> Option<RawOpt> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        // Content was validated on the way in; a parse failure ends iteration.
        let raw = parse_header(self.bytes, self.pos, self.number).ok()?;
        self.pos = raw.value.end;
        self.number = u32::from(raw.number);
        Some(raw)
    }
}

fn parse_header(bytes: &[u8], start: usize, prev_number: u32) -> Result<RawOpt> {
    let head = bytes[start];
    let mut pos = start + 1;
    let delta = parse_nibble(head >> 4, bytes, &mut pos)?;
    let len = parse_nibble(head & 0x0F, bytes, &mut pos)?;
    let number = prev_number + delta as u32;
    let number = u16::try_from(number).map_err(|_| Error::Malformed("option number overflow"))?;
    if pos + len > bytes.len() {
        return Err(Error::Malformed("option value truncated"));
    }
    Ok(RawOpt {
        number,
        start,
        value: pos..pos + len,
    })
}

fn parse_nibble(nibble: u8, bytes: &[u8], pos: &mut usize) -> Result<usize> {
    match nibble {
        13 => {
            let ext = *bytes.get(*pos).ok_or(Error::Malformed("option header truncated"))?;
            *pos += 1;
            Ok(usize::from(ext) + 13)
        }
        14 => {
            let ext = bytes
                .get(*pos..*pos + 2)
                .ok_or(Error::Malformed("option header truncated"))?;
            *pos += 2;
            Ok(usize::from(u16::from_be_bytes([ext[0], ext[1]])) + 269)
        }
        15 => Err(Error::Malformed("reserved option nibble")),
        n => Ok(usize::from(n)),
    }
}

fn encode_nibble(value: usize) -> (u8, heapless::Vec<u8, 2>) {
    let mut ext = heapless::Vec::new();
    let nibble = if value < 13 {
        value as u8
    } else if value < 269 {
        let _ = ext.push((value - 13) as u8);
        13
    } else {
        let _ = ext.extend_from_slice(&((value - 269) as u16).to_be_bytes());
        14
    };
    (nibble, ext)
}

fn encode_header(delta: u16, len: usize) -> Vec<u8> {
    let (delta_nibble, delta_ext) = encode_nibble(usize::from(delta));
    let (len_nibble, len_ext) = encode_nibble(len);
    let mut out = Vec::with_capacity(5 + len);
    out.push((delta_nibble << 4) | len_nibble);
    out.extend_from_slice(&delta_ext);
    out.extend_from_slice(&len_ext);
    out
}

fn decode_uint(value: &[u8]) -> Result<u64> {
    if value.len() > MAX_UINT_LEN {
        return Err(Error::Malformed("integer option longer than 8 bytes"));
    }
    Ok(value.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uint_minimal_length() {
        let mut opts = Options::new_dynamic(16).unwrap();
        opts.add_uint(MAX_AGE, 0).unwrap();
        opts.add_uint(SIZE1, 0x0100).unwrap();
        // Max-Age: delta 14 (13 + 1), len 0; Size1: delta 46 (13 + 33), len 2
        assert_eq!(opts.as_bytes(), &[0xD0, 0x01, 0xD2, 33, 0x01, 0x00]);
        assert_eq!(opts.get_uint(MAX_AGE).unwrap(), 0);
        assert_eq!(opts.get_uint(SIZE1).unwrap(), 256);
    }

    #[test]
    fn test_out_of_order_adds_are_sorted() {
        let mut opts = Options::new_dynamic(0).unwrap();
        opts.add_uint(CONTENT_FORMAT, 60).unwrap();
        opts.add_string(URI_PATH, "3").unwrap();
        opts.add_string(URI_PATH, "0").unwrap();
        opts.add_opaque(ETAG, &[1, 2]).unwrap();

        let numbers: Vec<u16> = opts.iter().map(|(n, _)| n).collect();
        assert_eq!(numbers, vec![ETAG, URI_PATH, URI_PATH, CONTENT_FORMAT]);
        assert_eq!(
            opts.as_bytes(),
            &[0x42, 1, 2, 0x71, b'3', 0x01, b'0', 0x11, 60]
        );
        assert_eq!(opts.uri_path().unwrap(), UriPath::Instance(3, 0));
    }

    #[test]
    fn test_container_from_config() {
        let mut opts = Options::from_config(&Config::default()).unwrap();
        opts.set_content_format(112).unwrap();
        opts.add_observe(3).unwrap();
        assert_eq!(opts.get_content_format().unwrap(), 112);
        assert_eq!(opts.get_observe().unwrap(), 3);
    }

    #[test]
    fn test_fixed_buffer_overflow() {
        let mut buf = [0u8; 4];
        let mut opts = Options::new_fixed(&mut buf);
        opts.add_string(URI_PATH, "ab").unwrap();
        assert!(matches!(
            opts.add_string(URI_PATH, "c"),
            Err(Error::MessageTooBig)
        ));
        assert_eq!(opts.count(), 1);
    }

    #[test]
    fn test_remove_reencodes_following_delta() {
        let mut opts = Options::new_dynamic(0).unwrap();
        opts.add_opaque(ETAG, &[9]).unwrap();
        opts.add_string(URI_PATH, "1").unwrap();
        opts.add_string(URI_PATH, "2").unwrap();
        opts.add_uint(ACCEPT, 112).unwrap();
        opts.remove_by_number(URI_PATH).unwrap();
        let pairs: Vec<(u16, Vec<u8>)> = opts.iter().map(|(n, v)| (n, v.to_vec())).collect();
        assert_eq!(pairs, vec![(ETAG, vec![9]), (ACCEPT, vec![112])]);
        assert_eq!(opts.as_bytes(), &[0x41, 9, 0xD1, 0, 112]);
    }

    #[test]
    fn test_content_format_single_instance() {
        let mut opts = Options::new_dynamic(8).unwrap();
        opts.set_content_format(112).unwrap();
        opts.set_content_format(11544).unwrap();
        assert_eq!(opts.count(), 1);
        assert_eq!(opts.get_content_format().unwrap(), 11544);
        opts.set_content_format(FORMAT_NONE).unwrap();
        assert!(matches!(opts.get_content_format(), Err(Error::Missing)));
    }

    #[test]
    fn test_iterator_contract() {
        let mut opts = Options::new_dynamic(8).unwrap();
        opts.add_opaque(ETAG, &[1]).unwrap();
        opts.add_opaque(ETAG, &[2, 3]).unwrap();
        opts.add_string(URI_QUERY, "ep=x").unwrap();

        let mut it = OptionIter::new();
        assert_eq!(opts.get_etag_it(&mut it).unwrap().as_bytes(), &[1]);
        assert_eq!(opts.get_etag_it(&mut it).unwrap().as_bytes(), &[2, 3]);
        assert!(matches!(opts.get_etag_it(&mut it), Err(Error::Missing)));
        assert!(matches!(
            opts.get_string_it(URI_QUERY, &mut it),
            Err(Error::Logic(_))
        ));

        let mut it = OptionIter::new();
        assert_eq!(opts.get_string_it(URI_QUERY, &mut it).unwrap(), "ep=x");
    }

    #[test]
    fn test_etag_too_long_is_malformed() {
        assert!(matches!(ETag::new(&[0; 9]), Err(Error::Malformed(_))));
        let mut opts = Options::new_dynamic(16).unwrap();
        opts.add_opaque(ETAG, &[0; 9]).unwrap();
        assert!(matches!(opts.get_etag(), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_uint_too_long_is_malformed() {
        let mut opts = Options::new_dynamic(16).unwrap();
        opts.add_opaque(SIZE2, &[1; 9]).unwrap();
        assert!(matches!(opts.get_uint(SIZE2), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_from_wire_stops_at_payload_marker() {
        let wire = [0xB1, b'3', 0x01, b'0', 0x11, 0x3C, 0xFF, 0xAA];
        let (opts, consumed) = Options::from_wire(&wire).unwrap();
        assert_eq!(consumed, 7);
        assert_eq!(opts.uri_path().unwrap(), UriPath::Instance(3, 0));
        assert_eq!(opts.get_content_format().unwrap(), 60);
    }

    #[test]
    fn test_from_wire_rejects_reserved_nibble() {
        assert!(Options::from_wire(&[0xF0]).is_err());
        assert!(Options::from_wire(&[0x0F]).is_err());
        assert!(Options::from_wire(&[0x12, 0x01]).is_err());
    }

    #[test]
    fn test_large_delta_uses_two_byte_extension() {
        let mut opts = Options::new_dynamic(8).unwrap();
        opts.add_empty(2048).unwrap();
        assert_eq!(opts.as_bytes(), &[0xE0, 0x06, 0xF3]);
        let (parsed, _) = Options::from_wire(opts.as_bytes()).unwrap();
        assert_eq!(parsed.iter().next().unwrap().0, 2048);
    }
}
