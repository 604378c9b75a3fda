//! Resumable low-level CBOR decoder
//!
//! The tokenizer owns the unconsumed tail of the payload. When an item's
//! header straddles a chunk boundary, the call fails with
//! [`Error::WantNextPayload`] without consuming anything; the leftover bytes
//! (never more than a header, i.e. 9 bytes) are carried over to the next
//! [`Tokenizer::feed_payload`] call.
//!
//! Fed chunks are copied into an owned buffer behind that leftover rather
//! than borrowed, so decoded strings can be returned as slices of it. The
//! buffer never holds more than one chunk plus the read-ahead, and its
//! capacity is reused from chunk to chunk.
//!
//! Tags 0 (RFC 3339 time), 1 (epoch time) and 4 (decimal fraction) are
//! resolved here so callers only see numbers. Any other error poisons the
//! tokenizer: every later call fails.

use log::debug;

use crate::error::{Error, Result};
use crate::io::cbor::MAX_NESTING_DEPTH;
use crate::io::cbor::encode::{
    BREAK, MAJOR_ARRAY, MAJOR_BYTES, MAJOR_MAP, MAJOR_NEGATIVE_INT, MAJOR_SIMPLE, MAJOR_TAG,
    MAJOR_TEXT, MAJOR_UINT, TAG_EPOCH_TIME,
};
use crate::io::cbor::time::{MAX_TIME_STRING, parse_rfc3339};

/// Longest header: initial byte plus an 8-byte argument
pub(crate) const READ_AHEAD: usize = 9;

const TAG_TIME_STRING: u64 = 0;
const TAG_DECIMAL_FRACTION: u64 = 4;

/// Kind of the next item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    UInt,
    NegativeInt,
    ByteString,
    TextString,
    Array,
    Map,
    Float,
    Double,
    Bool,
    Timestamp,
}

/// Numeric item
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    UInt(u64),
    Int(i64),
    Float(f32),
    Double(f64),
}

impl Number {
    /// Value as a double, possibly rounded
    pub fn as_f64(self) -> f64 {
        match self {
            Number::UInt(v) => v as f64,
            Number::Int(v) => v as f64,
            Number::Float(v) => f64::from(v),
            Number::Double(v) => v,
        }
    }

    /// Value as a signed integer, if exactly representable
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Number::UInt(v) => i64::try_from(v).ok(),
            Number::Int(v) => Some(v),
            Number::Float(v) => float_to_i64(f64::from(v)),
            Number::Double(v) => float_to_i64(v),
        }
    }

    /// Value as an unsigned integer, if exactly representable
    pub fn as_u64(self) -> Option<u64> {
        match self {
            Number::UInt(v) => Some(v),
            Number::Int(v) => u64::try_from(v).ok(),
            Number::Float(v) => float_to_u64(f64::from(v)),
            Number::Double(v) => float_to_u64(v),
        }
    }
}

fn float_to_i64(v: f64) -> Option<i64> {
    if v.fract() == 0.0 && v >= -9.223_372_036_854_776e18 && v < 9.223_372_036_854_776e18 {
        Some(v as i64)
    } else {
        None
    }
}

fn float_to_u64(v: f64) -> Option<u64> {
    if v.fract() == 0.0 && v >= 0.0 && v < 1.844_674_407_370_955_2e19 {
        Some(v as u64)
    } else {
        None
    }
}

/// Tokenizer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Ready to decode
    Ok,
    /// Clean end of payload at the top level
    Finished,
    /// Unrecoverable; the tokenizer must be recreated
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LevelKind {
    Array,
    Map,
    IndefiniteString,
    DecimalFraction,
}

#[derive(Debug, Clone, Copy)]
struct Level {
    kind: LevelKind,
    /// Items left, `None` when indefinite
    remaining: Option<u64>,
    parsed: u64,
}

#[derive(Debug, Clone, Copy)]
struct Header {
    major: u8,
    /// Argument, or the additional info for simple values below 24
    arg: u64,
    indefinite: bool,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
struct Item {
    header: Header,
    ty: ValueType,
    tag: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct StringState {
    major: u8,
    indefinite: bool,
    in_chunk: bool,
    chunk_remaining: u64,
}

#[derive(Debug, Clone)]
enum Partial {
    None,
    TimeString {
        remaining: usize,
        text: heapless::Vec<u8, MAX_TIME_STRING>,
    },
    DecimalFraction {
        exponent: Option<i64>,
    },
}

#[derive(Debug)]
pub struct Tokenizer {
    buf: Vec<u8>,
    pos: usize,
    payload_finished: bool,
    want_payload: bool,
    state: State,
    nesting: heapless::Vec<Level, MAX_NESTING_DEPTH>,
    current: Option<Item>,
    pending_tag: Option<u64>,
    string: Option<StringState>,
    partial: Partial,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            payload_finished: false,
            want_payload: true,
            state: State::Ok,
            nesting: heapless::Vec::new(),
            current: None,
            pending_tag: None,
            string: None,
            partial: Partial::None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Hand over the next payload chunk
    ///
    /// Only allowed on a fresh tokenizer or after `WantNextPayload`.
    pub fn feed_payload(&mut self, payload: &[u8], payload_finished: bool) -> Result<()> {
        self.check_state()?;
        if !self.want_payload {
            return self.fail(Error::Logic("payload fed while the previous one is unconsumed"));
        }
        if self.buf.len() - self.pos > READ_AHEAD {
            return self.fail(Error::Logic("read-ahead overflow"));
        }
        self.buf.drain(..self.pos);
        self.pos = 0;
        self.buf.extend_from_slice(payload);
        self.payload_finished = payload_finished;
        self.want_payload = false;
        Ok(())
    }

    /// Kind of the next item, without consuming it
    pub fn current_value_type(&mut self) -> Result<ValueType> {
        self.check_state()?;
        if self.string.is_some() || !matches!(self.partial, Partial::None) {
            return self.fail(Error::Logic("previous item not fully consumed"));
        }
        let res = self.prepare().map(|item| item.ty);
        self.guard(res)
    }

    /// Consume a null
    pub fn null(&mut self) -> Result<()> {
        let res = self.take(ValueType::Null).map(|_| ());
        self.guard(res)
    }

    /// Consume a boolean
    pub fn bool(&mut self) -> Result<bool> {
        let res = self.take(ValueType::Bool).map(|item| item.header.arg == 21);
        self.guard(res)
    }

    /// Consume a number, time or decimal fraction
    pub fn number(&mut self) -> Result<Number> {
        self.check_state()?;
        let res = self.number_inner();
        self.guard(res)
    }

    /// Start reading a byte or text string
    ///
    /// Returns the total size, or `None` for indefinite-length strings.
    pub fn bytes(&mut self) -> Result<Option<usize>> {
        self.check_state()?;
        let res = self.bytes_inner();
        self.guard(res)
    }

    /// Next piece of the string started with [`Tokenizer::bytes`]
    ///
    /// The flag is set with the final piece.
    pub fn bytes_get_some(&mut self) -> Result<(&[u8], bool)> {
        self.check_state()?;
        match self.bytes_get_some_inner() {
            Ok((start, end, done)) => Ok((&self.buf[start..end], done)),
            Err(e) => self.fail(e),
        }
    }

    /// Enter an array; returns its length unless indefinite
    pub fn enter_array(&mut self) -> Result<Option<usize>> {
        self.check_state()?;
        let res = self.enter(ValueType::Array, LevelKind::Array);
        self.guard(res)
    }

    /// Enter a map; returns the number of pairs unless indefinite
    pub fn enter_map(&mut self) -> Result<Option<usize>> {
        self.check_state()?;
        let res = self.enter(ValueType::Map, LevelKind::Map);
        self.guard(res)
    }

    /// Depth of open containers once finished ones are closed
    ///
    /// Callers detect the end of an indefinite container by the depth
    /// dropping back.
    pub fn nesting_level(&mut self) -> Result<usize> {
        self.check_state()?;
        if self.current.is_none() && self.string.is_none() && matches!(self.partial, Partial::None)
        {
            let res = self.settle();
            self.guard(res)?;
        }
        Ok(self.nesting.len())
    }

    /// Whether the whole payload has been consumed at the top level
    pub fn at_end(&mut self) -> Result<bool> {
        if self.state == State::Finished {
            return Ok(true);
        }
        if self.nesting_level()? != 0
            || self.current.is_some()
            || self.pending_tag.is_some()
            || self.string.is_some()
            || !matches!(self.partial, Partial::None)
        {
            return Ok(false);
        }
        if self.pos < self.buf.len() {
            return Ok(false);
        }
        if self.payload_finished {
            self.state = State::Finished;
            return Ok(true);
        }
        self.want_payload = true;
        Err(Error::WantNextPayload)
    }

    fn check_state(&self) -> Result<()> {
        match self.state {
            State::Error => Err(Error::Format("tokenizer in error state")),
            _ => Ok(()),
        }
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        if !err.is_want_next_payload() {
            debug!("CBOR decoding failed: {}", err);
            self.state = State::Error;
        }
        Err(err)
    }

    fn guard<T>(&mut self, res: Result<T>) -> Result<T> {
        match res {
            Ok(v) => Ok(v),
            Err(e) => self.fail(e),
        }
    }

    /// Available bytes, at least `n` of them
    fn need(&mut self, n: usize) -> Result<&[u8]> {
        if self.buf.len() - self.pos >= n {
            return Ok(&self.buf[self.pos..]);
        }
        if self.payload_finished {
            return Err(Error::Format("premature end of payload"));
        }
        self.want_payload = true;
        Err(Error::WantNextPayload)
    }

    fn peek_header(&mut self) -> Result<Header> {
        let initial = self.need(1)?[0];
        let major = initial >> 5;
        let info = initial & 0x1F;
        let extra = match info {
            0..=23 => 0,
            24 => 1,
            25 => 2,
            26 => 4,
            27 => 8,
            31 => {
                if matches!(major, MAJOR_UINT | MAJOR_NEGATIVE_INT | MAJOR_TAG) {
                    return Err(Error::Format("indefinite length on a scalar"));
                }
                return Ok(Header {
                    major,
                    arg: 0,
                    indefinite: true,
                    len: 1,
                });
            }
            _ => return Err(Error::Format("reserved additional information")),
        };
        let data = self.need(1 + extra)?;
        let arg = if info < 24 {
            u64::from(info)
        } else {
            data[1..=extra]
                .iter()
                .fold(0u64, |acc, &b| acc << 8 | u64::from(b))
        };
        Ok(Header {
            major,
            arg,
            indefinite: false,
            len: 1 + extra,
        })
    }

    fn consume(&mut self, n: usize) {
        self.pos += n;
    }

    /// One item of the innermost container is done
    fn item_done(&mut self) {
        if let Some(level) = self.nesting.last_mut() {
            level.parsed += 1;
            if let Some(remaining) = level.remaining.as_mut() {
                *remaining = remaining.saturating_sub(1);
            }
        }
    }

    fn push_level(&mut self, kind: LevelKind, remaining: Option<u64>) -> Result<()> {
        self.nesting
            .push(Level {
                kind,
                remaining,
                parsed: 0,
            })
            .map_err(|_| Error::Format("nesting too deep"))
    }

    fn pop_level(&mut self) {
        self.nesting.pop();
        self.item_done();
    }

    /// Close every container that is complete
    fn settle(&mut self) -> Result<()> {
        while let Some(level) = self.nesting.last().copied() {
            match level.remaining {
                Some(0) => self.pop_level(),
                Some(_) => return Ok(()),
                None => {
                    if self.need(1)?[0] != BREAK {
                        return Ok(());
                    }
                    if level.kind == LevelKind::Map && level.parsed % 2 != 0 {
                        return Err(Error::Format("map ends after a key"));
                    }
                    self.consume(1);
                    self.pop_level();
                }
            }
        }
        Ok(())
    }

    /// Parse the header of the next item, consuming any tags before it
    fn prepare(&mut self) -> Result<Item> {
        if let Some(item) = self.current {
            return Ok(item);
        }
        if self.pending_tag.is_none() {
            self.settle()?;
        }
        loop {
            let header = self.peek_header()?;
            if header.major == MAJOR_TAG {
                self.consume(header.len);
                if matches!(
                    header.arg,
                    TAG_TIME_STRING | TAG_EPOCH_TIME | TAG_DECIMAL_FRACTION
                ) {
                    self.pending_tag = Some(header.arg);
                }
                continue;
            }
            if header.major == MAJOR_SIMPLE && header.indefinite {
                return Err(Error::Format("unexpected break"));
            }
            let tag = self.pending_tag;
            let ty = classify(&header, tag)?;
            let item = Item { header, ty, tag };
            self.pending_tag = None;
            self.current = Some(item);
            return Ok(item);
        }
    }

    /// Consume a whole scalar item of the given type
    fn take(&mut self, ty: ValueType) -> Result<Item> {
        self.check_state()?;
        let item = self.prepare()?;
        if item.ty != ty {
            return Err(Error::Logic("item type mismatch"));
        }
        self.consume(item.header.len);
        self.current = None;
        self.item_done();
        Ok(item)
    }

    fn number_inner(&mut self) -> Result<Number> {
        match self.partial {
            Partial::TimeString { .. } => return self.continue_time_string(),
            Partial::DecimalFraction { .. } => return self.continue_decimal_fraction(),
            Partial::None => {}
        }
        let item = self.prepare()?;
        match (item.ty, item.tag) {
            (ValueType::Timestamp, Some(TAG_TIME_STRING)) => {
                if item.header.indefinite {
                    return Err(Error::Format("indefinite date/time string"));
                }
                let len = usize::try_from(item.header.arg).unwrap_or(usize::MAX);
                if len > MAX_TIME_STRING {
                    return Err(Error::Format("date/time string too long"));
                }
                self.consume(item.header.len);
                self.current = None;
                self.partial = Partial::TimeString {
                    remaining: len,
                    text: heapless::Vec::new(),
                };
                self.continue_time_string()
            }
            (ValueType::Double, Some(TAG_DECIMAL_FRACTION)) => {
                if item.header.indefinite || item.header.arg != 2 {
                    return Err(Error::Format("decimal fraction must be a 2-item array"));
                }
                self.consume(item.header.len);
                self.current = None;
                self.push_level(LevelKind::DecimalFraction, Some(2))?;
                self.partial = Partial::DecimalFraction { exponent: None };
                self.continue_decimal_fraction()
            }
            (
                ValueType::UInt
                | ValueType::NegativeInt
                | ValueType::Float
                | ValueType::Double
                | ValueType::Timestamp,
                _,
            ) => {
                let number = scalar_number(&item.header)?;
                self.consume(item.header.len);
                self.current = None;
                self.item_done();
                Ok(number)
            }
            _ => Err(Error::Logic("item is not a number")),
        }
    }

    fn continue_time_string(&mut self) -> Result<Number> {
        let Partial::TimeString { remaining, text } = &mut self.partial else {
            return Err(Error::Logic("no date/time string in progress"));
        };
        if *remaining > 0 {
            let available = self.buf.len() - self.pos;
            if available == 0 {
                if self.payload_finished {
                    return Err(Error::Format("premature end of payload"));
                }
                self.want_payload = true;
                return Err(Error::WantNextPayload);
            }
            let n = available.min(*remaining);
            // capacity was checked against the declared length
            let _ = text.extend_from_slice(&self.buf[self.pos..self.pos + n]);
            *remaining -= n;
            self.pos += n;
            if *remaining > 0 {
                if self.payload_finished {
                    return Err(Error::Format("premature end of payload"));
                }
                self.want_payload = true;
                return Err(Error::WantNextPayload);
            }
        }
        let (seconds, fraction) = parse_rfc3339(&text[..])?;
        self.partial = Partial::None;
        self.item_done();
        if fraction == 0.0 {
            Ok(Number::Int(seconds))
        } else {
            Ok(Number::Double(seconds as f64 + fraction))
        }
    }

    fn continue_decimal_fraction(&mut self) -> Result<Number> {
        loop {
            let Partial::DecimalFraction { exponent } = self.partial else {
                return Err(Error::Logic("no decimal fraction in progress"));
            };
            let header = self.peek_header()?;
            let value = match header.major {
                MAJOR_UINT => i64::try_from(header.arg)
                    .map_err(|_| Error::Format("decimal fraction component out of range"))?,
                MAJOR_NEGATIVE_INT => i64::try_from(header.arg)
                    .map(|v| -1 - v)
                    .map_err(|_| Error::Format("decimal fraction component out of range"))?,
                _ => return Err(Error::Format("decimal fraction components must be integers")),
            };
            self.consume(header.len);
            self.item_done();
            match exponent {
                None => {
                    self.partial = Partial::DecimalFraction {
                        exponent: Some(value),
                    };
                }
                Some(exponent) => {
                    let exponent = i32::try_from(exponent)
                        .map_err(|_| Error::Format("decimal fraction exponent out of range"))?;
                    self.partial = Partial::None;
                    // the array level is complete; close it and count it in the parent
                    self.pop_level();
                    return Ok(Number::Double(value as f64 * 10f64.powi(exponent)));
                }
            }
        }
    }

    fn bytes_inner(&mut self) -> Result<Option<usize>> {
        let item = self.prepare()?;
        if !matches!(item.ty, ValueType::ByteString | ValueType::TextString) {
            return Err(Error::Logic("item is not a string"));
        }
        self.consume(item.header.len);
        self.current = None;
        if item.header.indefinite {
            self.push_level(LevelKind::IndefiniteString, None)?;
            self.string = Some(StringState {
                major: item.header.major,
                indefinite: true,
                in_chunk: false,
                chunk_remaining: 0,
            });
            Ok(None)
        } else {
            self.string = Some(StringState {
                major: item.header.major,
                indefinite: false,
                in_chunk: true,
                chunk_remaining: item.header.arg,
            });
            Ok(Some(usize::try_from(item.header.arg).map_err(|_| Error::OutOfMemory)?))
        }
    }

    /// Range of the next string piece within `buf`, plus the completion flag
    fn bytes_get_some_inner(&mut self) -> Result<(usize, usize, bool)> {
        let Some(mut string) = self.string else {
            return Err(Error::Logic("no string in progress"));
        };
        loop {
            if string.in_chunk && string.chunk_remaining > 0 {
                let available = self.need(1)?.len();
                let n = usize::try_from(string.chunk_remaining)
                    .unwrap_or(usize::MAX)
                    .min(available);
                let start = self.pos;
                self.consume(n);
                string.chunk_remaining -= n as u64;
                let mut done = false;
                if string.chunk_remaining == 0 {
                    string.in_chunk = false;
                    if !string.indefinite {
                        done = true;
                    } else if self.buf.get(self.pos) == Some(&BREAK) {
                        self.consume(1);
                        self.nesting.pop();
                        done = true;
                    }
                }
                if done {
                    self.string = None;
                    self.item_done();
                } else {
                    self.string = Some(string);
                }
                return Ok((start, start + n, done));
            }
            if !string.indefinite {
                // empty definite string
                self.string = None;
                self.item_done();
                return Ok((self.pos, self.pos, true));
            }
            let header = self.peek_header()?;
            if header.major == MAJOR_SIMPLE && header.indefinite {
                self.consume(1);
                self.nesting.pop();
                self.string = None;
                self.item_done();
                return Ok((self.pos, self.pos, true));
            }
            if header.major != string.major || header.indefinite {
                return Err(Error::Format("invalid chunk in indefinite-length string"));
            }
            self.consume(header.len);
            string.in_chunk = true;
            string.chunk_remaining = header.arg;
            self.string = Some(string);
        }
    }

    fn enter(&mut self, ty: ValueType, kind: LevelKind) -> Result<Option<usize>> {
        let item = self.prepare()?;
        if item.ty != ty || item.tag.is_some() {
            return Err(Error::Logic("item is not the expected container"));
        }
        let count = if item.header.indefinite {
            None
        } else {
            Some(item.header.arg)
        };
        let remaining = match (kind, count) {
            (LevelKind::Map, Some(pairs)) => Some(
                pairs
                    .checked_mul(2)
                    .ok_or(Error::Format("map length out of range"))?,
            ),
            (_, count) => count,
        };
        self.push_level(kind, remaining)?;
        self.consume(item.header.len);
        self.current = None;
        count
            .map(|c| usize::try_from(c).map_err(|_| Error::Format("container length out of range")))
            .transpose()
    }
}

fn classify(header: &Header, tag: Option<u64>) -> Result<ValueType> {
    let ty = match header.major {
        MAJOR_UINT => ValueType::UInt,
        MAJOR_NEGATIVE_INT => ValueType::NegativeInt,
        MAJOR_BYTES => ValueType::ByteString,
        MAJOR_TEXT => ValueType::TextString,
        MAJOR_ARRAY => ValueType::Array,
        MAJOR_MAP => ValueType::Map,
        MAJOR_SIMPLE => match header.arg {
            20 | 21 if header.len == 1 => ValueType::Bool,
            22 | 23 if header.len == 1 => ValueType::Null,
            _ => match header.len {
                3 => ValueType::Float,
                5 => ValueType::Float,
                9 => ValueType::Double,
                _ => return Err(Error::Format("unsupported simple value")),
            },
        },
        _ => return Err(Error::Format("unexpected tag")),
    };
    match (tag, ty) {
        (None, ty) => Ok(ty),
        (Some(TAG_TIME_STRING), ValueType::TextString) => Ok(ValueType::Timestamp),
        (
            Some(TAG_EPOCH_TIME),
            ValueType::UInt | ValueType::NegativeInt | ValueType::Float | ValueType::Double,
        ) => Ok(ValueType::Timestamp),
        (Some(TAG_DECIMAL_FRACTION), ValueType::Array) => Ok(ValueType::Double),
        _ => Err(Error::Format("tag does not match the tagged item")),
    }
}

fn scalar_number(header: &Header) -> Result<Number> {
    match header.major {
        MAJOR_UINT => Ok(Number::UInt(header.arg)),
        MAJOR_NEGATIVE_INT => i64::try_from(header.arg)
            .map(|v| Number::Int(-1 - v))
            .map_err(|_| Error::Format("negative integer out of range")),
        MAJOR_SIMPLE => match header.len {
            3 => Ok(Number::Float(half::f16::from_bits(header.arg as u16).to_f32())),
            5 => Ok(Number::Float(f32::from_bits(header.arg as u32))),
            9 => Ok(Number::Double(f64::from_bits(header.arg))),
            _ => Err(Error::Logic("item is not a number")),
        },
        _ => Err(Error::Logic("item is not a number")),
    }
}
