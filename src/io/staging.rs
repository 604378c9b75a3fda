//! Output staging shared by all encoders
//!
//! An encoder renders each entry into a byte queue; `drain` copies from the
//! queue into whatever buffer the caller supplies. Values pulled from an
//! [`ExternalData`] source are fetched in fixed-size pieces, so the produced
//! bytes never depend on the caller's buffer sizes.

use crate::error::{Error, Result};
use crate::io::base64::Base64Stream;
use crate::io::cbor::encode;
use crate::io::{ExternalData, Progress};

/// Size of one piece pulled from an external source
pub(crate) const EXTERNAL_CHUNK: usize = 128;

/// How pulled external data is framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// Verbatim
    Raw,
    /// Definite-length chunks of an indefinite CBOR string of this major type
    CborChunks(u8),
    /// Base64 text
    Base64,
}

struct External {
    source: Box<dyn ExternalData>,
    offset: usize,
    framing: Framing,
    base64: Base64Stream,
    trailer: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct Staging {
    buf: Vec<u8>,
    pos: usize,
    external: Option<External>,
    entry_open: bool,
}

impl std::fmt::Debug for Staging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Staging")
            .field("pending", &(self.buf.len() - self.pos))
            .field("external", &self.external.is_some())
            .field("entry_open", &self.entry_open)
            .finish()
    }
}

impl Staging {
    /// Mark the start of an entry; the previous entry must be drained
    pub(crate) fn begin_entry(&mut self) -> Result<()> {
        if self.entry_open && !self.is_drained() {
            return Err(Error::Logic("previous entry not fully drained"));
        }
        self.entry_open = true;
        Ok(())
    }

    /// Queue for bytes of the current entry
    pub(crate) fn out(&mut self) -> &mut Vec<u8> {
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        &mut self.buf
    }

    /// Stream an external source after the queued bytes, then `trailer`
    pub(crate) fn push_external(
        &mut self,
        source: Box<dyn ExternalData>,
        framing: Framing,
        trailer: Vec<u8>,
    ) {
        self.external = Some(External {
            source,
            offset: 0,
            framing,
            base64: Base64Stream::default(),
            trailer,
        });
    }

    /// Whether nothing is left to emit
    pub(crate) fn is_drained(&self) -> bool {
        self.pos == self.buf.len() && self.external.is_none()
    }

    /// Copy pending output into `out`
    pub(crate) fn drain(&mut self, out: &mut [u8]) -> Result<Progress> {
        let mut written = 0;
        loop {
            let available = self.buf.len() - self.pos;
            let n = available.min(out.len() - written);
            out[written..written + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
            if written == out.len() || self.pos < self.buf.len() {
                break;
            }
            if !self.pull_external()? {
                break;
            }
        }
        let more = !self.is_drained();
        if !more {
            self.entry_open = false;
        }
        Ok(Progress { written, more })
    }

    /// Refill the queue from the external source; false when nothing is left
    fn pull_external(&mut self) -> Result<bool> {
        let Some(ext) = self.external.as_mut() else {
            return Ok(false);
        };
        self.buf.clear();
        self.pos = 0;

        let mut piece = [0u8; EXTERNAL_CHUNK];
        let progress = ext.source.read(&mut piece, ext.offset)?;
        if progress.written > piece.len() {
            return Err(Error::Logic("external source overreported its output"));
        }
        if progress.written == 0 && progress.more {
            return Err(Error::Logic("external source made no progress"));
        }
        ext.offset += progress.written;
        let data = &piece[..progress.written];
        match ext.framing {
            Framing::Raw => self.buf.extend_from_slice(data),
            Framing::CborChunks(major) => {
                if !data.is_empty() {
                    encode::header(&mut self.buf, major, data.len() as u64);
                    self.buf.extend_from_slice(data);
                }
            }
            Framing::Base64 => ext.base64.encode_chunk(data, &mut self.buf),
        }
        if !progress.more {
            if ext.framing == Framing::Base64 {
                ext.base64.finish(&mut self.buf);
            }
            self.buf.extend_from_slice(&ext.trailer);
            self.external = None;
        }
        Ok(true)
    }
}
