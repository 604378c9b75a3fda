//! Input buffering shared by the non-CBOR decoders

use std::ops::Range;

use crate::error::{Error, Result};

/// Unconsumed payload bytes of a decoder
///
/// Like the CBOR tokenizer, a decoder may only be fed after it asked for
/// more data; whatever it left unconsumed is kept in front of the new chunk.
/// The chunk itself is copied in, so memory use is bounded by the largest
/// chunk plus `max_leftover` bytes.
#[derive(Debug)]
pub(crate) struct PayloadBuffer {
    buf: Vec<u8>,
    pos: usize,
    finished: bool,
    want: bool,
    /// Most bytes a decoder may leave unconsumed when asking for more
    max_leftover: usize,
}

impl PayloadBuffer {
    pub(crate) fn new(max_leftover: usize) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            finished: false,
            want: true,
            max_leftover,
        }
    }

    pub(crate) fn feed(&mut self, payload: &[u8], finished: bool) -> Result<()> {
        if !self.want {
            return Err(Error::Logic("payload fed while the previous one is unconsumed"));
        }
        if self.buf.len() - self.pos > self.max_leftover {
            return Err(Error::Logic("too many leftover bytes"));
        }
        self.buf.drain(..self.pos);
        self.pos = 0;
        self.buf.extend_from_slice(payload);
        self.finished = finished;
        self.want = false;
        Ok(())
    }

    pub(crate) fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    /// Unconsumed bytes, at least `n` of them
    pub(crate) fn need(&mut self, n: usize) -> Result<&[u8]> {
        if self.available() >= n {
            return Ok(&self.buf[self.pos..]);
        }
        if self.finished {
            return Err(Error::Format("premature end of payload"));
        }
        self.want = true;
        Err(Error::WantNextPayload)
    }

    pub(crate) fn consume(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.buf.len());
    }

    /// Consume and return up to `max` bytes, at least one
    pub(crate) fn take(&mut self, max: usize) -> Result<&mut [u8]> {
        self.need(1)?;
        let n = self.available().min(max);
        let start = self.pos;
        self.pos += n;
        Ok(&mut self.buf[start..start + n])
    }

    /// Offset of the next unconsumed byte within the current chunk
    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    /// Already consumed bytes; valid until the next `feed`
    pub(crate) fn consumed_region(&self, range: Range<usize>) -> &[u8] {
        &self.buf[range.start.min(self.pos)..range.end.min(self.pos)]
    }

    /// Whether every byte of the final chunk was consumed
    pub(crate) fn at_end(&mut self) -> Result<bool> {
        if self.available() > 0 {
            return Ok(false);
        }
        if self.finished {
            return Ok(true);
        }
        self.want = true;
        Err(Error::WantNextPayload)
    }
}
