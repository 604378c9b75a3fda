//! Streaming base64 for plaintext Bytes resources
//!
//! Encoding keeps up to two residual input bytes between chunks. Decoding
//! works inside the payload buffer itself: decoded bytes are only ever
//! written into the already-consumed prefix, which [`TwoCursor`] enforces.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

use crate::error::{Error, Result};

/// Incremental base64 encoder
#[derive(Debug, Default, Clone)]
pub(crate) struct Base64Stream {
    residue: heapless::Vec<u8, 2>,
}

impl Base64Stream {
    /// Encode all complete 3-byte groups of `residue ++ input` into `out`
    pub(crate) fn encode_chunk(&mut self, input: &[u8], out: &mut Vec<u8>) {
        let mut pending = Vec::with_capacity(self.residue.len() + input.len());
        pending.extend_from_slice(&self.residue);
        pending.extend_from_slice(input);
        let full = pending.len() / 3 * 3;
        out.extend_from_slice(BASE64.encode(&pending[..full]).as_bytes());
        self.residue.clear();
        // at most two bytes remain
        let _ = self.residue.extend_from_slice(&pending[full..]);
    }

    /// Flush the residue with padding
    pub(crate) fn finish(&mut self, out: &mut Vec<u8>) {
        if !self.residue.is_empty() {
            out.extend_from_slice(BASE64.encode(&self.residue).as_bytes());
            self.residue.clear();
        }
    }
}

/// Read and write positions over a shared buffer; `write <= read` always holds
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TwoCursor {
    read: usize,
    write: usize,
}

impl TwoCursor {
    /// Position of the next unread byte
    pub fn read_pos(&self) -> usize {
        self.read
    }

    /// Position of the next byte to write
    pub fn write_pos(&self) -> usize {
        self.write
    }

    /// Mark `n` input bytes consumed
    pub fn consume(&mut self, n: usize) {
        self.read += n;
    }

    /// Reserve `n` output bytes, refusing to overtake the read cursor
    pub fn produce(&mut self, n: usize) -> Result<usize> {
        if self.write + n > self.read {
            return Err(Error::Logic("write cursor would overtake read cursor"));
        }
        let at = self.write;
        self.write += n;
        Ok(at)
    }
}

/// Output of one in-place decode step
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecodedChunk {
    /// Bytes decoded from a group that straddled the previous chunk boundary;
    /// they precede the in-place output
    pub staged: heapless::Vec<u8, 3>,
    /// Length of the decoded prefix written into the input buffer
    pub in_place: usize,
}

/// Base64 decoder that reuses the input buffer as output storage
#[derive(Debug, Default, Clone)]
pub struct InPlaceBase64 {
    residue: heapless::Vec<u8, 3>,
    padded: bool,
}

impl InPlaceBase64 {
    /// Create a decoder with no pending input
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one payload chunk in place
    ///
    /// `last` marks the final chunk of the value; leftover characters that
    /// do not form a full group are then a format error.
    pub fn decode_chunk(&mut self, buf: &mut [u8], last: bool) -> Result<DecodedChunk> {
        let mut cursor = TwoCursor::default();
        let mut out = DecodedChunk::default();

        if !self.residue.is_empty() {
            let need = 4 - self.residue.len();
            if buf.len() < need {
                let _ = self.residue.extend_from_slice(buf);
                cursor.consume(buf.len());
            } else {
                let mut group = [0u8; 4];
                group[..self.residue.len()].copy_from_slice(&self.residue);
                group[self.residue.len()..].copy_from_slice(&buf[..need]);
                cursor.consume(need);
                self.residue.clear();
                let mut decoded = [0u8; 3];
                let n = self.decode_group(&group, &mut decoded)?;
                let _ = out.staged.extend_from_slice(&decoded[..n]);
            }
        }

        while buf.len() - cursor.read_pos() >= 4 {
            let mut group = [0u8; 4];
            group.copy_from_slice(&buf[cursor.read_pos()..cursor.read_pos() + 4]);
            cursor.consume(4);
            let mut decoded = [0u8; 3];
            let n = self.decode_group(&group, &mut decoded)?;
            let at = cursor.produce(n)?;
            buf[at..at + n].copy_from_slice(&decoded[..n]);
        }

        let leftover = &buf[cursor.read_pos()..];
        if !leftover.is_empty() {
            if self.padded {
                return Err(Error::Format("base64 data after padding"));
            }
            let _ = self.residue.extend_from_slice(leftover);
        }
        if last && !self.residue.is_empty() {
            return Err(Error::Format("base64 input is not a multiple of 4"));
        }
        out.in_place = cursor.write_pos();
        Ok(out)
    }

    fn decode_group(&mut self, group: &[u8; 4], out: &mut [u8; 3]) -> Result<usize> {
        if self.padded {
            return Err(Error::Format("base64 data after padding"));
        }
        let n = BASE64
            .decode_slice(group, out)
            .map_err(|_| Error::Format("invalid base64"))?;
        if group[3] == b'=' {
            self.padded = true;
        }
        Ok(n)
    }
}
