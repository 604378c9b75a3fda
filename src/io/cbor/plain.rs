//! Plain CBOR (Content-Format 60): one bare value for a single resource

use crate::coap_types::ContentFormat;
use crate::error::{Error, Result};
use crate::io::cbor::{ValueReader, stage_value};
use crate::io::cbor::tokenizer::Tokenizer;
use crate::io::staging::Staging;
use crate::io::{DataType, Entry, Next, OutEntry, PayloadDecoder, PayloadEncoder, Progress};
use crate::uri::UriPath;

#[derive(Debug, Default)]
pub struct CborEncoder {
    staging: Staging,
    used: bool,
}

impl CborEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadEncoder for CborEncoder {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::Cbor
    }

    fn new_entry(&mut self, entry: OutEntry) -> Result<()> {
        if self.used {
            return Err(Error::Logic("plain CBOR carries a single value"));
        }
        self.staging.begin_entry()?;
        self.used = true;
        stage_value(&mut self.staging, entry.value, &[]);
        Ok(())
    }

    fn get_payload(&mut self, buf: &mut [u8]) -> Result<Progress> {
        self.staging.drain(buf)
    }
}

#[derive(Debug)]
pub struct CborDecoder {
    tok: Tokenizer,
    reader: ValueReader,
    path: UriPath,
    value_done: bool,
    failed: bool,
}

impl CborDecoder {
    /// The request must address a resource or resource instance
    pub fn new(request_uri: UriPath) -> Result<Self> {
        if !matches!(
            request_uri,
            UriPath::Resource(..) | UriPath::ResourceInstance(..)
        ) {
            return Err(Error::Format("plain CBOR needs a resource path"));
        }
        Ok(Self {
            tok: Tokenizer::new(),
            reader: ValueReader::default(),
            path: request_uri,
            value_done: false,
            failed: false,
        })
    }

    fn next_entry(&mut self, hint: DataType) -> Result<Next<'_>> {
        if self.value_done {
            if self.tok.at_end()? {
                return Ok(Next::Eof);
            }
            self.failed = true;
            return Err(Error::Format("data after the value"));
        }
        let path = self.path;
        match self.reader.read(&mut self.tok, hint) {
            Ok((value, done)) => {
                self.value_done = done;
                Ok(Next::Entry(Entry { path, value }))
            }
            Err(e) => {
                self.failed = !e.is_want_next_payload();
                Err(e)
            }
        }
    }
}

impl PayloadDecoder for CborDecoder {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::Cbor
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
    use crate::io::{Chunk, InValue, Value};

    fn encode(value: Value) -> Vec<u8> {
        let mut enc = CborEncoder::new();
        enc.new_entry(OutEntry::new(UriPath::Resource(3, 0, 0), value))
            .unwrap();
        let mut buf = [0u8; 64];
        let progress = enc.get_payload(&mut buf).unwrap();
        assert!(!progress.more);
        buf[..progress.written].to_vec()
    }

    #[test]
    fn test_encodes_bare_values() {
        assert_eq!(encode(Value::Int(-1)), [0x20]);
        assert_eq!(encode(Value::String("ab".into())), [0x62, b'a', b'b']);
        assert_eq!(encode(Value::Time(0)), [0xC1, 0x00]);
        assert_eq!(encode(Value::ObjLink(crate::uri::ObjLink::new(3, 1))), [0x63, b'3', b':', b'1']);
    }

    #[test]
    fn test_rejects_second_entry() {
        let mut enc = CborEncoder::new();
        enc.new_entry(OutEntry::new(UriPath::Resource(3, 0, 0), Value::Int(1)))
            .unwrap();
        let mut buf = [0u8; 8];
        enc.get_payload(&mut buf).unwrap();
        assert!(
            enc.new_entry(OutEntry::new(UriPath::Resource(3, 0, 1), Value::Int(1)))
                .is_err()
        );
    }

    #[test]
    fn test_decodes_value_and_eof() {
        let mut dec = CborDecoder::new(UriPath::Resource(3, 0, 1)).unwrap();
        dec.feed_payload(&[0x63, b'a', b'b', b'c'], true).unwrap();
        match dec.get_entry(DataType::STRING).unwrap() {
            Next::Entry(entry) => {
                assert_eq!(entry.path, UriPath::Resource(3, 0, 1));
                assert_eq!(
                    entry.value,
                    InValue::String(Chunk {
                        data: b"abc",
                        offset: 0,
                        full_length_hint: Some(3)
                    })
                );
            }
            other => panic!("{:?}", other),
        }
        assert_eq!(dec.get_entry(DataType::STRING).unwrap(), Next::Eof);
    }

    #[test]
    fn test_decode_across_chunks() {
        let mut dec = CborDecoder::new(UriPath::Resource(3, 0, 1)).unwrap();
        dec.feed_payload(&[0x19], false).unwrap();
        assert_eq!(dec.get_entry(DataType::INT).unwrap(), Next::WantNextPayload);
        dec.feed_payload(&[0x01, 0x00], true).unwrap();
        match dec.get_entry(DataType::INT).unwrap() {
            Next::Entry(entry) => assert_eq!(entry.value, InValue::Int(256)),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_requires_resource_path() {
        assert!(CborDecoder::new(UriPath::Instance(3, 0)).is_err());
    }

    #[test]
    fn test_trailing_data_is_an_error() {
        let mut dec = CborDecoder::new(UriPath::Resource(3, 0, 1)).unwrap();
        dec.feed_payload(&[0x01, 0x02], true).unwrap();
        assert!(matches!(dec.get_entry(DataType::INT).unwrap(), Next::Entry(_)));
        assert!(dec.get_entry(DataType::INT).is_err());
        assert!(dec.get_entry(DataType::INT).is_err());
    }
}
