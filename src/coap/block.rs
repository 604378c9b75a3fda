//! BLOCK1/BLOCK2 option values and block-wise transfer state
//!
//! The option value is `seq_num << 4 | M << 3 | szx` where the block size is
//! `16 << szx`. A size exponent of 7 is reserved by RFC 7252 and means BERT
//! (RFC 8323): 1024-byte units, several of which may travel in one message.

use log::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::io::Progress;

/// Unit size of BERT blocks
pub const BERT_UNIT: usize = 1024;

const SZX_BERT: u32 = 7;

/// Which block option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// Request payload blocks
    Block1,
    /// Response payload blocks
    Block2,
}

impl BlockKind {
    /// CoAP option number
    pub fn option_number(self) -> u16 {
        match self {
            BlockKind::Block1 => crate::coap::options::BLOCK1,
            BlockKind::Block2 => crate::coap::options::BLOCK2,
        }
    }
}

/// Decoded BLOCK1 or BLOCK2 option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockOption {
    /// Option kind
    pub kind: BlockKind,
    /// Block number
    pub seq_num: u32,
    /// More blocks follow
    pub has_more: bool,
    /// Block size in bytes; always 1024 for BERT
    pub size: u16,
    /// BERT block
    pub is_bert: bool,
}

impl BlockOption {
    /// Largest block number that fits in the option
    pub const MAX_SEQ_NUM: u32 = (1 << 20) - 1;

    /// Regular block of `size` bytes
    pub fn new(kind: BlockKind, seq_num: u32, has_more: bool, size: u16) -> Result<Self> {
        size_exponent(size)?;
        if seq_num > Self::MAX_SEQ_NUM {
            return Err(Error::Malformed("block number exceeds 20 bits"));
        }
        Ok(Self {
            kind,
            seq_num,
            has_more,
            size,
            is_bert: false,
        })
    }

    /// BERT block; `seq_num` counts 1024-byte units
    pub fn bert(kind: BlockKind, seq_num: u32, has_more: bool) -> Result<Self> {
        let mut block = Self::new(kind, seq_num, has_more, BERT_UNIT as u16)?;
        block.is_bert = true;
        Ok(block)
    }

    /// Option value
    pub fn encode(&self) -> Result<u32> {
        if self.seq_num > Self::MAX_SEQ_NUM {
            return Err(Error::Malformed("block number exceeds 20 bits"));
        }
        let szx = if self.is_bert {
            SZX_BERT
        } else {
            size_exponent(self.size)?
        };
        Ok(self.seq_num << 4 | u32::from(self.has_more) << 3 | szx)
    }

    /// Parse an option value
    ///
    /// A size exponent of 7 is only accepted when BERT is enabled.
    pub fn decode(kind: BlockKind, value: u32, bert_enabled: bool) -> Result<Self> {
        if value > 0x00FF_FFFF {
            return Err(Error::Malformed("block option longer than 3 bytes"));
        }
        let szx = value & 0x07;
        let (size, is_bert) = if szx == SZX_BERT {
            if !bert_enabled {
                return Err(Error::Malformed("BERT block without BERT support"));
            }
            (BERT_UNIT as u16, true)
        } else {
            (16u16 << szx, false)
        };
        Ok(Self {
            kind,
            seq_num: value >> 4,
            has_more: value & 0x08 != 0,
            size,
            is_bert,
        })
    }

    /// Byte offset of the block within the whole payload
    pub fn offset(&self) -> usize {
        self.seq_num as usize * usize::from(self.size)
    }
}

fn size_exponent(size: u16) -> Result<u32> {
    if !size.is_power_of_two() || !(16..=1024).contains(&size) {
        return Err(Error::Malformed("block size must be a power of two in 16..=1024"));
    }
    Ok(size.trailing_zeros() - 4)
}

/// Validates an incoming BLOCK1 sequence
#[derive(Debug, Default, Clone)]
pub struct Block1Assembler {
    expected_offset: usize,
    size: Option<u16>,
    finished: bool,
}

impl Block1Assembler {
    /// Start a fresh transfer
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the next block and return the offset of its payload
    ///
    /// Blocks must arrive in order with a constant size. Every block but the
    /// last carries exactly one block of payload, or a non-zero multiple of
    /// 1024 bytes for BERT.
    pub fn accept(&mut self, block: &BlockOption, payload_len: usize) -> Result<usize> {
        if block.kind != BlockKind::Block1 {
            return Err(Error::Logic("Block1Assembler fed a BLOCK2 option"));
        }
        if self.finished {
            warn!("block {} after the final block", block.seq_num);
            return Err(Error::BlockSequence);
        }
        if let Some(size) = self.size {
            if size != block.size {
                warn!("block size changed from {} to {}", size, block.size);
                return Err(Error::BlockSequence);
            }
        }
        let offset = block.offset();
        if offset != self.expected_offset {
            warn!(
                "block {} starts at {}, expected {}",
                block.seq_num, offset, self.expected_offset
            );
            return Err(Error::BlockSequence);
        }
        if block.has_more {
            let valid = if block.is_bert {
                payload_len != 0 && payload_len % BERT_UNIT == 0
            } else {
                payload_len == usize::from(block.size)
            };
            if !valid {
                warn!(
                    "block {} carries {} bytes, block size is {}",
                    block.seq_num, payload_len, block.size
                );
                return Err(Error::BlockSequence);
            }
        } else if !block.is_bert && payload_len > usize::from(block.size) {
            return Err(Error::BlockSequence);
        }

        self.size = Some(block.size);
        self.expected_offset = offset + payload_len;
        self.finished = !block.has_more;
        debug!("accepted block {} at offset {}", block.seq_num, offset);
        Ok(offset)
    }

    /// Bytes received so far
    pub fn received(&self) -> usize {
        self.expected_offset
    }

    /// Whether the final block arrived
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Cuts an encoder's output into BLOCK2 responses
#[derive(Debug, Clone)]
pub struct Block2Planner {
    size: u16,
    bert: bool,
    offset: usize,
    finished: bool,
}

impl Block2Planner {
    /// Planner producing blocks of `size` bytes, or BERT blocks
    pub fn new(size: u16, bert: bool) -> Result<Self> {
        size_exponent(size)?;
        Ok(Self {
            size: if bert { BERT_UNIT as u16 } else { size },
            bert,
            offset: 0,
            finished: false,
        })
    }

    /// Planner using the configured block size
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.block_size, config.bert_enabled)
    }

    /// Current block size
    pub fn size(&self) -> u16 {
        self.size
    }

    /// Apply the BLOCK2 option of a follow-up request
    ///
    /// The requested block must start where the previous response ended. A
    /// smaller requested size takes effect from this block on.
    pub fn on_request(&mut self, requested: &BlockOption) -> Result<()> {
        if requested.kind != BlockKind::Block2 {
            return Err(Error::Logic("Block2Planner fed a BLOCK1 option"));
        }
        if requested.size < self.size {
            debug!("block size renegotiated from {} to {}", self.size, requested.size);
            self.size = requested.size;
            self.bert = false;
        }
        if requested.offset() != self.offset {
            warn!(
                "block {} requested at offset {}, next block starts at {}",
                requested.seq_num,
                requested.offset(),
                self.offset
            );
            return Err(Error::BlockSequence);
        }
        Ok(())
    }

    /// Whether the last block has been produced
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fill `buf` with the next block using `fill`, which drains an encoder
    ///
    /// Returns the number of payload bytes and the BLOCK2 option to send.
    /// `fill` may fail with any error that low-level errors convert into,
    /// such as the data model's `DmError`.
    pub fn next_block<F, E>(
        &mut self,
        buf: &mut [u8],
        mut fill: F,
    ) -> std::result::Result<(usize, BlockOption), E>
    where
        F: FnMut(&mut [u8]) -> std::result::Result<Progress, E>,
        E: From<Error>,
    {
        if self.finished {
            return Err(Error::Logic("all blocks already produced").into());
        }
        let capacity = if self.bert {
            buf.len() / BERT_UNIT * BERT_UNIT
        } else {
            usize::from(self.size)
        };
        if capacity == 0 || buf.len() < capacity {
            return Err(Error::BufferTooSmall.into());
        }

        let mut written = 0;
        let mut more = true;
        while more && written < capacity {
            let progress = fill(&mut buf[written..capacity])?;
            written += progress.written;
            more = progress.more;
        }

        let unit = usize::from(self.size);
        let seq_num = u32::try_from(self.offset / unit)
            .map_err(|_| Error::Malformed("block number exceeds 20 bits"))?;
        let block = if self.bert {
            BlockOption::bert(BlockKind::Block2, seq_num, more)?
        } else {
            BlockOption::new(BlockKind::Block2, seq_num, more, self.size)?
        };
        self.offset += written;
        self.finished = !more;
        Ok((written, block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let block = BlockOption::new(BlockKind::Block2, 5, true, 64).unwrap();
        let value = block.encode().unwrap();
        assert_eq!(value, 5 << 4 | 1 << 3 | 2);
        assert_eq!(BlockOption::decode(BlockKind::Block2, value, false).unwrap(), block);
        assert_eq!(block.offset(), 320);
    }

    #[test]
    fn test_bert_requires_support() {
        let block = BlockOption::bert(BlockKind::Block1, 3, true).unwrap();
        let value = block.encode().unwrap();
        assert_eq!(value & 0x07, 7);
        assert!(BlockOption::decode(BlockKind::Block1, value, false).is_err());
        let decoded = BlockOption::decode(BlockKind::Block1, value, true).unwrap();
        assert!(decoded.is_bert);
        assert_eq!(decoded.size, 1024);
    }

    #[test]
    fn test_rejects_invalid_sizes_and_numbers() {
        assert!(BlockOption::new(BlockKind::Block1, 0, false, 48).is_err());
        assert!(BlockOption::new(BlockKind::Block1, 0, false, 2048).is_err());
        assert!(BlockOption::new(BlockKind::Block1, 1 << 20, false, 16).is_err());
        assert!(BlockOption::decode(BlockKind::Block1, 0x0100_0000, false).is_err());
    }

    #[test]
    fn test_assembler_accepts_consecutive_blocks() {
        let mut asm = Block1Assembler::new();
        let b0 = BlockOption::new(BlockKind::Block1, 0, true, 16).unwrap();
        let b1 = BlockOption::new(BlockKind::Block1, 1, false, 16).unwrap();
        assert_eq!(asm.accept(&b0, 16).unwrap(), 0);
        assert_eq!(asm.accept(&b1, 5).unwrap(), 16);
        assert!(asm.is_finished());
        assert_eq!(asm.received(), 21);
    }

    #[test]
    fn test_assembler_rejects_gaps_and_short_blocks() {
        let mut asm = Block1Assembler::new();
        let b0 = BlockOption::new(BlockKind::Block1, 0, true, 16).unwrap();
        assert!(matches!(asm.accept(&b0, 10), Err(Error::BlockSequence)));

        let mut asm = Block1Assembler::new();
        asm.accept(&b0, 16).unwrap();
        let b2 = BlockOption::new(BlockKind::Block1, 2, true, 16).unwrap();
        assert!(matches!(asm.accept(&b2, 16), Err(Error::BlockSequence)));
    }

    #[test]
    fn test_assembler_bert_multiples() {
        let mut asm = Block1Assembler::new();
        let b0 = BlockOption::bert(BlockKind::Block1, 0, true).unwrap();
        assert_eq!(asm.accept(&b0, 2048).unwrap(), 0);
        let b2 = BlockOption::bert(BlockKind::Block1, 2, false).unwrap();
        assert_eq!(asm.accept(&b2, 100).unwrap(), 2048);

        let mut asm = Block1Assembler::new();
        assert!(asm.accept(&b0, 1500).is_err());
    }

    fn source(data: Vec<u8>) -> impl FnMut(&mut [u8]) -> Result<Progress> {
        let mut pos = 0;
        move |buf: &mut [u8]| {
            let n = buf.len().min(data.len() - pos);
            buf[..n].copy_from_slice(&data[pos..pos + n]);
            pos += n;
            Ok(Progress {
                written: n,
                more: pos < data.len(),
            })
        }
    }

    #[test]
    fn test_planner_splits_payload() {
        let data: Vec<u8> = (0..40).collect();
        let mut fill = source(data.clone());
        let mut planner = Block2Planner::new(16, false).unwrap();
        let mut buf = [0u8; 64];
        let mut collected = Vec::new();
        let mut seq = 0;
        while !planner.is_finished() {
            let (n, block) = planner.next_block(&mut buf, &mut fill).unwrap();
            assert_eq!(block.seq_num, seq);
            assert_eq!(block.has_more, !planner.is_finished());
            collected.extend_from_slice(&buf[..n]);
            seq += 1;
        }
        assert_eq!(seq, 3);
        assert_eq!(collected, data);
    }

    #[test]
    fn test_planner_late_negotiation() {
        let data: Vec<u8> = (0..64).collect();
        let mut fill = source(data);
        let mut planner = Block2Planner::new(32, false).unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = planner.next_block(&mut buf, &mut fill).unwrap();
        assert_eq!(n, 32);

        // 32 bytes in, the client switches to 16-byte blocks: block 2
        let request = BlockOption::new(BlockKind::Block2, 2, false, 16).unwrap();
        planner.on_request(&request).unwrap();
        let (n, block) = planner.next_block(&mut buf, &mut fill).unwrap();
        assert_eq!(n, 16);
        assert_eq!(block.seq_num, 2);
        assert_eq!(block.size, 16);

        let wrong = BlockOption::new(BlockKind::Block2, 5, false, 16).unwrap();
        assert!(matches!(planner.on_request(&wrong), Err(Error::BlockSequence)));
    }
}
