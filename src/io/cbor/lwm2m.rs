//! LwM2M-CBOR (Content-Format 11544)
//!
//! Entries are nested maps keyed by path IDs. Consecutive entries sharing a
//! path prefix reuse the maps already open, so `/3/0/0` and `/3/0/1` encode
//! as `{3: {0: {0: a, 1: b}}}`. All maps are indefinite-length because the
//! number of children is unknown when a map is opened.
//!
//! A gateway prefix is one text key at the top level whose map holds the
//! object maps of an end device. The decoder accepts at most one and exposes
//! it through [`Lwm2mCborDecoder::gateway_prefix`].

use log::debug;

use crate::coap_types::ContentFormat;
use crate::error::{Error, Result};
use crate::io::cbor::tokenizer::{Tokenizer, ValueType};
use crate::io::cbor::{ValueReader, encode, stage_value};
use crate::io::staging::Staging;
use crate::io::{DataType, Entry, Next, OutEntry, PayloadDecoder, PayloadEncoder, Progress};
use crate::uri::{ID_INVALID, UriPath};

pub struct Lwm2mCborEncoder {
    items_count: usize,
    emitted: usize,
    gateway_prefix: bool,
    last_path: Option<UriPath>,
    staging: Staging,
}

impl Lwm2mCborEncoder {
    /// `gateway_prefix` wraps all objects in one more map under a text key
    pub fn new(items_count: usize, gateway_prefix: Option<&str>) -> Self {
        let mut staging = Staging::default();
        let out = staging.out();
        out.push(encode::INDEFINITE_MAP);
        if let Some(prefix) = gateway_prefix {
            encode::text(out, prefix);
            out.push(encode::INDEFINITE_MAP);
        }
        if items_count == 0 {
            if gateway_prefix.is_some() {
                out.push(encode::BREAK);
            }
            out.push(encode::BREAK);
        }
        Self {
            items_count,
            emitted: 0,
            gateway_prefix: gateway_prefix.is_some(),
            last_path: None,
            staging,
        }
    }
}

impl PayloadEncoder for Lwm2mCborEncoder {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::Lwm2mCbor
    }

    fn new_entry(&mut self, entry: OutEntry) -> Result<()> {
        if self.emitted == self.items_count {
            return Err(Error::Logic("more entries than announced"));
        }
        let path = entry.path;
        let len = path.len();
        if len == 0 {
            return Err(Error::Logic("LwM2M-CBOR entries need an object ID"));
        }
        self.staging.begin_entry()?;
        self.emitted += 1;

        let out = self.staging.out();
        let mut common = 0;
        if let Some(last) = self.last_path {
            // the last level of each path is a value, never an open map
            common = last.common_prefix_len(&path).min(len - 1).min(last.len() - 1);
            for _ in common..last.len() - 1 {
                out.push(encode::BREAK);
            }
        }
        let ids = path.ids();
        for &id in &ids[common..len - 1] {
            encode::uint(out, u64::from(id));
            out.push(encode::INDEFINITE_MAP);
        }
        encode::uint(out, u64::from(ids[len - 1]));

        let mut trailer = Vec::new();
        if self.emitted == self.items_count {
            trailer.resize(len - 1, encode::BREAK);
            if self.gateway_prefix {
                trailer.push(encode::BREAK);
            }
            trailer.push(encode::BREAK);
        }
        self.last_path = Some(path);
        stage_value(&mut self.staging, entry.value, &trailer);
        Ok(())
    }

    fn get_payload(&mut self, buf: &mut [u8]) -> Result<Progress> {
        self.staging.drain(buf)
    }
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    /// Tokenizer depth while inside this map
    depth: usize,
    /// Path IDs contributed by the key that opened the map
    added: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    Key,
    /// Reading an array key that started at this depth
    ArrayKey { depth: usize, added: usize },
    AfterKey { added: usize },
    Value { added: usize },
    /// Reading the text of a gateway prefix key
    Prefix,
    /// The gateway prefix must open a map
    AfterPrefix,
    Finished,
}

/// Longest accepted gateway prefix
const MAX_GATEWAY_PREFIX: usize = 64;

#[derive(Debug)]
pub struct Lwm2mCborDecoder {
    request_uri: UriPath,
    tok: Tokenizer,
    reader: ValueReader,
    stage: Stage,
    frames: heapless::Vec<Frame, 5>,
    ids: heapless::Vec<u16, 4>,
    prefix: Option<heapless::Vec<u8, MAX_GATEWAY_PREFIX>>,
    failed: bool,
}

impl Lwm2mCborDecoder {
    pub fn new(request_uri: UriPath) -> Self {
        Self {
            request_uri,
            tok: Tokenizer::new(),
            reader: ValueReader::default(),
            stage: Stage::Start,
            frames: heapless::Vec::new(),
            ids: heapless::Vec::new(),
            prefix: None,
            failed: false,
        }
    }

    /// Gateway prefix key of the payload, once it has been read
    pub fn gateway_prefix(&self) -> Option<&str> {
        if self.stage == Stage::Prefix {
            return None;
        }
        self.prefix
            .as_ref()
            .and_then(|prefix| std::str::from_utf8(prefix).ok())
    }

    fn fail<T>(&mut self, reason: &'static str) -> Result<T> {
        debug!("LwM2M-CBOR payload rejected: {}", reason);
        self.failed = true;
        Err(Error::Format(reason))
    }

    fn push_id(&mut self) -> Result<()> {
        let id = self.tok.number()?.as_u64();
        let Some(id) = id.and_then(|id| u16::try_from(id).ok()).filter(|&id| id != ID_INVALID)
        else {
            return self.fail("invalid path ID");
        };
        if self.ids.push(id).is_err() {
            return self.fail("path deeper than four levels");
        }
        Ok(())
    }

    fn pop_ids(&mut self, n: usize) {
        let keep = self.ids.len().saturating_sub(n);
        self.ids.truncate(keep);
    }

    fn next_entry(&mut self, hint: DataType) -> Result<Next<'_>> {
        loop {
            match self.stage {
                Stage::Start => {
                    if self.tok.current_value_type()? != ValueType::Map {
                        return self.fail("LwM2M-CBOR payload is not a map");
                    }
                    self.tok.enter_map()?;
                    // capacity matches the nesting limit
                    let _ = self.frames.push(Frame { depth: 1, added: 0 });
                    self.stage = Stage::Key;
                }
                Stage::Key => {
                    let depth = self.tok.nesting_level()?;
                    while let Some(frame) = self.frames.last().copied() {
                        if depth >= frame.depth {
                            break;
                        }
                        self.frames.pop();
                        self.pop_ids(frame.added);
                    }
                    if self.frames.is_empty() {
                        if self.tok.at_end()? {
                            self.stage = Stage::Finished;
                            return Ok(Next::Eof);
                        }
                        return self.fail("data after the LwM2M-CBOR map");
                    }
                    match self.tok.current_value_type()? {
                        ValueType::UInt => {
                            self.push_id()?;
                            self.stage = Stage::AfterKey { added: 1 };
                        }
                        ValueType::Array => {
                            self.tok.enter_array()?;
                            self.stage = Stage::ArrayKey { depth, added: 0 };
                        }
                        ValueType::TextString
                            if self.frames.len() == 1 && self.prefix.is_none() =>
                        {
                            self.tok.bytes()?;
                            self.prefix = Some(heapless::Vec::new());
                            self.stage = Stage::Prefix;
                        }
                        _ => return self.fail("LwM2M-CBOR key is not a path ID"),
                    }
                }
                Stage::ArrayKey { depth, added } => {
                    if self.tok.nesting_level()? <= depth {
                        if added == 0 {
                            return self.fail("empty LwM2M-CBOR array key");
                        }
                        self.stage = Stage::AfterKey { added };
                        continue;
                    }
                    if self.tok.current_value_type()? != ValueType::UInt {
                        return self.fail("LwM2M-CBOR key is not a path ID");
                    }
                    self.push_id()?;
                    self.stage = Stage::ArrayKey {
                        depth,
                        added: added + 1,
                    };
                }
                Stage::AfterKey { added } => {
                    if self.tok.current_value_type()? == ValueType::Map {
                        let depth = self.frames.last().map_or(1, |f| f.depth) + 1;
                        self.tok.enter_map()?;
                        if self.frames.push(Frame { depth, added }).is_err() {
                            return self.fail("LwM2M-CBOR nesting too deep");
                        }
                        self.stage = Stage::Key;
                        continue;
                    }
                    let Ok(path) = UriPath::from_ids(&self.ids) else {
                        return self.fail("invalid LwM2M-CBOR path");
                    };
                    if !self.request_uri.is_prefix_of(&path) {
                        return self.fail("LwM2M-CBOR entry outside the request path");
                    }
                    self.stage = Stage::Value { added };
                }
                Stage::Value { added } => {
                    let Ok(path) = UriPath::from_ids(&self.ids) else {
                        return self.fail("invalid LwM2M-CBOR path");
                    };
                    return match self.reader.read(&mut self.tok, hint) {
                        Ok((value, done)) => {
                            if done {
                                let keep = self.ids.len().saturating_sub(added);
                                self.ids.truncate(keep);
                                self.stage = Stage::Key;
                            }
                            Ok(Next::Entry(Entry { path, value }))
                        }
                        Err(e) => {
                            self.failed = !e.is_want_next_payload();
                            Err(e)
                        }
                    };
                }
                Stage::Prefix => {
                    let done = {
                        let (piece, done) = self.tok.bytes_get_some()?;
                        let fits = match self.prefix.as_mut() {
                            Some(prefix) => prefix.extend_from_slice(piece).is_ok(),
                            None => false,
                        };
                        if !fits {
                            return self.fail("gateway prefix too long");
                        }
                        done
                    };
                    if done {
                        let valid = self
                            .prefix
                            .as_ref()
                            .is_some_and(|prefix| std::str::from_utf8(prefix).is_ok());
                        if !valid {
                            return self.fail("gateway prefix is not UTF-8");
                        }
                        self.stage = Stage::AfterPrefix;
                    }
                }
                Stage::AfterPrefix => {
                    if self.tok.current_value_type()? != ValueType::Map {
                        return self.fail("gateway prefix does not hold a map");
                    }
                    self.tok.enter_map()?;
                    if self.frames.push(Frame { depth: 2, added: 0 }).is_err() {
                        return self.fail("LwM2M-CBOR nesting too deep");
                    }
                    self.stage = Stage::Key;
                }
                Stage::Finished => return Ok(Next::Eof),
            }
        }
    }
}

impl PayloadDecoder for Lwm2mCborDecoder {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::Lwm2mCbor
    }

    fn feed_payload(&mut self, payload: &[u8], payload_finished: bool) -> Result<()> {
        self.tok.feed_payload(payload, payload_finished)
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
    use crate::io::Value;

    fn drain(enc: &mut Lwm2mCborEncoder, buf: &mut [u8], out: &mut Vec<u8>) {
        loop {
            let progress = enc.get_payload(buf).unwrap();
            out.extend_from_slice(&buf[..progress.written]);
            if !progress.more {
                break;
            }
        }
    }

    fn encode_all(entries: Vec<(UriPath, Value)>, prefix: Option<&str>, buf_len: usize) -> Vec<u8> {
        let mut enc = Lwm2mCborEncoder::new(entries.len(), prefix);
        let mut buf = vec![0u8; buf_len];
        let mut out = Vec::new();
        for (path, value) in entries {
            enc.new_entry(OutEntry::new(path, value)).unwrap();
            drain(&mut enc, &mut buf, &mut out);
        }
        // an empty payload is only the preamble staged by `new`
        drain(&mut enc, &mut buf, &mut out);
        out
    }

    fn sample() -> Vec<(UriPath, Value)> {
        vec![
            (UriPath::Resource(3, 0, 0), Value::Int(1)),
            (UriPath::Resource(3, 0, 1), Value::Int(2)),
            (UriPath::ResourceInstance(3, 0, 7, 0), Value::Int(3)),
            (UriPath::Resource(3, 1, 0), Value::Bool(true)),
            (UriPath::Resource(4, 0, 0), Value::Int(4)),
        ]
    }

    #[test]
    fn test_shared_prefixes_reuse_open_maps() {
        let out = encode_all(sample(), None, 64);
        assert_eq!(
            hex::encode(out),
            "bf03bf00bf0001010207bf0003ffff01bf00f5ffff04bf00bf0004ffffff"
        );
    }

    #[test]
    fn test_output_independent_of_buffer_size() {
        let reference = encode_all(sample(), None, 64);
        for len in 1..8 {
            assert_eq!(encode_all(sample(), None, len), reference);
        }
    }

    #[test]
    fn test_gateway_prefix_and_empty_payload() {
        let out = encode_all(vec![(UriPath::Resource(3, 0, 0), Value::Int(1))], Some("dev1"), 64);
        assert_eq!(hex::encode(out), "bf6464657631bf03bf00bf0001ffffffff");
        assert_eq!(encode_all(Vec::new(), None, 8), [0xBF, 0xFF]);
    }

    #[test]
    fn test_ciborium_agrees() {
        let out = encode_all(sample(), None, 64);
        let parsed: ciborium::Value = ciborium::from_reader(&out[..]).unwrap();
        let root = parsed.as_map().unwrap();
        assert_eq!(root.len(), 2);
    }

    fn decode_all(payload: &[u8], uri: UriPath) -> Result<Vec<(UriPath, String)>> {
        let mut dec = Lwm2mCborDecoder::new(uri);
        dec.feed_payload(payload, true)?;
        let mut out = Vec::new();
        loop {
            match dec.get_entry(DataType::ANY)? {
                Next::Entry(entry) => out.push((entry.path, format!("{:?}", entry.value))),
                Next::Eof => return Ok(out),
                other => panic!("{:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_own_output() {
        let out = encode_all(sample(), None, 64);
        let got = decode_all(&out, UriPath::Root).unwrap();
        let paths: Vec<UriPath> = got.iter().map(|(p, _)| *p).collect();
        assert_eq!(paths, sample().into_iter().map(|(p, _)| p).collect::<Vec<_>>());
        assert_eq!(got[3].1, "Bool(true)");
    }

    #[test]
    fn test_decode_definite_maps_and_array_keys() {
        // {[3, 0]: {1: "x", [7, 2]: 5}}
        let payload = hex::decode("a1820300a201617882070205").unwrap();
        let got = decode_all(&payload, UriPath::Instance(3, 0)).unwrap();
        assert_eq!(got[0].0, UriPath::Resource(3, 0, 1));
        assert_eq!(got[1], (UriPath::ResourceInstance(3, 0, 7, 2), "UInt(5)".to_string()));
        assert!(matches!(
            decode_all(&payload, UriPath::Object(4)),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_gateway_prefix_decoded() {
        let out = encode_all(sample(), Some("dev1"), 64);
        let mut dec = Lwm2mCborDecoder::new(UriPath::Root);
        let mut paths = Vec::new();
        let mut fed = 0;
        loop {
            match dec.get_entry(DataType::INT | DataType::BOOL).unwrap() {
                Next::WantNextPayload => {
                    dec.feed_payload(&out[fed..fed + 1], fed + 1 == out.len()).unwrap();
                    fed += 1;
                }
                Next::Entry(entry) => paths.push(entry.path),
                Next::Eof => break,
                other => panic!("{:?}", other),
            }
        }
        assert_eq!(paths, sample().into_iter().map(|(p, _)| p).collect::<Vec<_>>());
        assert_eq!(dec.gateway_prefix(), Some("dev1"));

        // {"a": {}, "b": {}}
        let two_prefixes = hex::decode("bf6161bfff6162bfffff").unwrap();
        assert!(matches!(
            decode_all(&two_prefixes, UriPath::Root),
            Err(Error::Format(_))
        ));
        // {"a": 1}
        let not_a_map = hex::decode("bf616101ff").unwrap();
        assert!(matches!(
            decode_all(&not_a_map, UriPath::Root),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_decode_chunked() {
        let out = encode_all(sample(), None, 64);
        let mut dec = Lwm2mCborDecoder::new(UriPath::Root);
        let mut values = Vec::new();
        let mut fed = 0;
        loop {
            match dec.get_entry(DataType::INT | DataType::BOOL).unwrap() {
                Next::WantNextPayload => {
                    dec.feed_payload(&out[fed..fed + 1], fed + 1 == out.len()).unwrap();
                    fed += 1;
                }
                Next::Entry(entry) => values.push(entry.value.data_type()),
                Next::Eof => break,
                other => panic!("{:?}", other),
            }
        }
        assert_eq!(values.len(), 5);
        assert_eq!(values[3], DataType::BOOL);
    }
}
