//! Opaque (Content-Format 42): raw bytes of a single resource

use log::debug;

use crate::coap_types::ContentFormat;
use crate::error::{Error, Result};
use crate::io::payload::PayloadBuffer;
use crate::io::staging::{Framing, Staging};
use crate::io::{
    Chunk, DataType, Entry, InValue, Next, OutEntry, PayloadDecoder, PayloadEncoder, Progress,
    Value,
};
use crate::uri::UriPath;

#[derive(Debug, Default)]
pub struct OpaqueEncoder {
    staging: Staging,
    used: bool,
}

impl OpaqueEncoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PayloadEncoder for OpaqueEncoder {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::Opaque
    }

    fn new_entry(&mut self, entry: OutEntry) -> Result<()> {
        if self.used {
            return Err(Error::Logic("opaque payload carries a single value"));
        }
        if !matches!(entry.value, Value::Bytes(_) | Value::ExternalBytes(_)) {
            return Err(Error::Logic("opaque payload carries only bytes"));
        }
        self.staging.begin_entry()?;
        self.used = true;
        match entry.value {
            Value::Bytes(data) => self.staging.out().extend_from_slice(&data),
            Value::ExternalBytes(source) => {
                self.staging.push_external(source, Framing::Raw, Vec::new())
            }
            _ => {}
        }
        Ok(())
    }

    fn get_payload(&mut self, buf: &mut [u8]) -> Result<Progress> {
        self.staging.drain(buf)
    }
}

/// Streams the payload as chunks of one Bytes value
///
/// A lone leading byte is held back until the next chunk arrives, so a
/// single-NUL payload always reaches the resource as one final chunk.
#[derive(Debug)]
pub struct OpaqueDecoder {
    path: UriPath,
    payload: PayloadBuffer,
    offset: usize,
    done: bool,
    failed: bool,
}

impl OpaqueDecoder {
    /// The request must address a resource or resource instance
    pub fn new(request_uri: UriPath) -> Result<Self> {
        if !matches!(
            request_uri,
            UriPath::Resource(..) | UriPath::ResourceInstance(..)
        ) {
            return Err(Error::Format("opaque payload needs a resource path"));
        }
        Ok(Self {
            path: request_uri,
            payload: PayloadBuffer::new(1),
            offset: 0,
            done: false,
            failed: false,
        })
    }

    fn next_entry(&mut self, hint: DataType) -> Result<Next<'_>> {
        if self.done {
            return Ok(Next::Eof);
        }
        if !hint.contains(DataType::BYTES) {
            debug!("opaque payload written to a {:?} resource", hint);
            self.failed = true;
            return Err(Error::Format("opaque payload for a non-bytes resource"));
        }
        let last = self.payload.is_finished();
        let n = self.payload.available();
        if !last && (n == 0 || (self.offset == 0 && n == 1)) {
            self.payload.need(n + 1)?;
        }
        let data: &[u8] = if n == 0 { &[] } else { self.payload.take(n)? };
        let offset = self.offset;
        self.offset += data.len();
        self.done = last;
        Ok(Next::Entry(Entry {
            path: self.path,
            value: InValue::Bytes(Chunk {
                data,
                offset,
                full_length_hint: last.then_some(offset + data.len()),
            }),
        }))
    }
}

impl PayloadDecoder for OpaqueDecoder {
    fn content_format(&self) -> ContentFormat {
        ContentFormat::Opaque
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

    fn bytes_chunk(next: Next<'_>) -> (Vec<u8>, usize, Option<usize>) {
        match next {
            Next::Entry(Entry {
                value: InValue::Bytes(chunk),
                ..
            }) => (chunk.data.to_vec(), chunk.offset, chunk.full_length_hint),
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn test_encoder_streams_external_source() {
        let mut enc = OpaqueEncoder::new();
        let source = |buf: &mut [u8], offset: usize| -> Result<Progress> {
            let n = buf.len().min(300 - offset);
            for (i, b) in buf[..n].iter_mut().enumerate() {
                *b = (offset + i) as u8;
            }
            Ok(Progress {
                written: n,
                more: offset + n < 300,
            })
        };
        enc.new_entry(OutEntry::new(
            UriPath::Resource(5, 0, 0),
            Value::ExternalBytes(Box::new(source)),
        ))
        .unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 7];
        loop {
            let progress = enc.get_payload(&mut buf).unwrap();
            out.extend_from_slice(&buf[..progress.written]);
            if !progress.more {
                break;
            }
        }
        let expected: Vec<u8> = (0..300).map(|i| i as u8).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_encoder_rejects_non_bytes() {
        let mut enc = OpaqueEncoder::new();
        assert!(
            enc.new_entry(OutEntry::new(UriPath::Resource(5, 0, 0), Value::Int(1)))
                .is_err()
        );
    }

    #[test]
    fn test_chunks_carry_offsets() {
        let mut dec = OpaqueDecoder::new(UriPath::Resource(5, 0, 0)).unwrap();
        dec.feed_payload(&[1, 2, 3], false).unwrap();
        assert_eq!(
            bytes_chunk(dec.get_entry(DataType::BYTES).unwrap()),
            (vec![1, 2, 3], 0, None)
        );
        assert_eq!(dec.get_entry(DataType::BYTES).unwrap(), Next::WantNextPayload);
        dec.feed_payload(&[4], true).unwrap();
        assert_eq!(
            bytes_chunk(dec.get_entry(DataType::BYTES).unwrap()),
            (vec![4], 3, Some(4))
        );
        assert_eq!(dec.get_entry(DataType::BYTES).unwrap(), Next::Eof);
    }

    #[test]
    fn test_single_nul_arrives_as_one_final_chunk() {
        let mut dec = OpaqueDecoder::new(UriPath::Resource(5, 0, 0)).unwrap();
        dec.feed_payload(&[0], false).unwrap();
        assert_eq!(dec.get_entry(DataType::BYTES).unwrap(), Next::WantNextPayload);
        dec.feed_payload(&[], true).unwrap();
        assert_eq!(
            bytes_chunk(dec.get_entry(DataType::BYTES).unwrap()),
            (vec![0], 0, Some(1))
        );
    }

    #[test]
    fn test_empty_payload() {
        let mut dec = OpaqueDecoder::new(UriPath::Resource(5, 0, 0)).unwrap();
        dec.feed_payload(&[], true).unwrap();
        assert_eq!(
            bytes_chunk(dec.get_entry(DataType::BYTES).unwrap()),
            (vec![], 0, Some(0))
        );
    }

    #[test]
    fn test_non_bytes_resource_rejected() {
        let mut dec = OpaqueDecoder::new(UriPath::Resource(5, 0, 0)).unwrap();
        dec.feed_payload(&[1], true).unwrap();
        assert!(dec.get_entry(DataType::INT).is_err());
        assert!(OpaqueDecoder::new(UriPath::Object(5)).is_err());
    }
}
