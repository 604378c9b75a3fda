//! SenML-CBOR (RFC 8428) with LwM2M conventions
//!
//! A payload is an array of records. The first record carries the base name
//! (the request path), every record carries the remaining path as its name
//! unless it equals the base, and the value label selects the type:
//!
//! | label | meaning |
//! |-------|---------|
//! | -2    | bn      |
//! | -3    | bt      |
//! | 0     | n       |
//! | 2     | v       |
//! | 3     | vs      |
//! | 4     | vb      |
//! | 6     | t       |
//! | 8     | vd      |
//! | "vlo" | object link |
//!
//! Labels of a record may come in any order. Scalar values are held until
//! the end of their record; string and byte values are streamed as they
//! arrive, so the names of such a record must precede its value.

use log::debug;

use crate::coap_types::ContentFormat;
use crate::error::{Error, Result};
use crate::io::cbor::tokenizer::{Tokenizer, ValueType};
use crate::io::cbor::{ValueReader, encode, stage_value};
use crate::io::staging::Staging;
use crate::io::{DataType, Entry, InValue, Next, OutEntry, PayloadDecoder, PayloadEncoder, Progress, Value};
use crate::uri::UriPath;

const LABEL_BASE_NAME: i64 = -2;
const LABEL_BASE_TIME: i64 = -3;
const LABEL_NAME: i64 = 0;
const LABEL_VALUE: i64 = 2;
const LABEL_STRING_VALUE: i64 = 3;
const LABEL_BOOL_VALUE: i64 = 4;
const LABEL_TIME: i64 = 6;
const LABEL_DATA_VALUE: i64 = 8;
const LABEL_OBJLINK_VALUE: &str = "vlo";

/// Longest name: "/65535/65535/65535/65535"
const MAX_NAME: usize = 24;

pub struct SenmlCborEncoder {
    format: ContentFormat,
    base_path: UriPath,
    items_count: usize,
    emitted: usize,
    staging: Staging,
}

impl SenmlCborEncoder {
    pub fn new(format: ContentFormat, base_path: UriPath, items_count: usize) -> Self {
        let mut staging = Staging::default();
        encode::header(staging.out(), encode::MAJOR_ARRAY, items_count as u64);
        Self {
            format,
            base_path,
            items_count,
            emitted: 0,
            staging,
        }
    }

    fn relative_name(&self, path: &UriPath) -> Result<Option<String>> {
        if !self.base_path.is_prefix_of(path) {
            return Err(Error::Logic("entry outside the base path"));
        }
        if *path == self.base_path {
            return Ok(None);
        }
        let ids = path.ids();
        let name = ids[self.base_path.len()..path.len()]
            .iter()
            .map(|id| format!("/{}", id))
            .collect();
        Ok(Some(name))
    }
}

impl PayloadEncoder for SenmlCborEncoder {
    fn content_format(&self) -> ContentFormat {
        self.format
    }

    fn new_entry(&mut self, entry: OutEntry) -> Result<()> {
        if self.emitted == self.items_count {
            return Err(Error::Logic("more entries than announced"));
        }
        let name = self.relative_name(&entry.path)?;
        self.staging.begin_entry()?;
        let base_name = self.emitted == 0 && self.base_path != UriPath::Root;
        self.emitted += 1;

        let has_value = !matches!(entry.value, Value::Null);
        let pairs = usize::from(base_name) + usize::from(name.is_some()) + usize::from(has_value);
        let out = self.staging.out();
        encode::header(out, encode::MAJOR_MAP, pairs as u64);
        if base_name {
            encode::int(out, LABEL_BASE_NAME);
            encode::text(out, &self.base_path.to_string());
        }
        if let Some(name) = name {
            encode::int(out, LABEL_NAME);
            encode::text(out, &name);
        }
        let value = match entry.value {
            Value::Null => return Ok(()),
            Value::Int(_) | Value::UInt(_) | Value::Double(_) => {
                encode::int(out, LABEL_VALUE);
                entry.value
            }
            Value::Time(t) => {
                encode::int(out, LABEL_VALUE);
                Value::Int(t)
            }
            Value::String(_) | Value::ExternalString(_) => {
                encode::int(out, LABEL_STRING_VALUE);
                entry.value
            }
            Value::Bool(_) => {
                encode::int(out, LABEL_BOOL_VALUE);
                entry.value
            }
            Value::Bytes(_) | Value::ExternalBytes(_) => {
                encode::int(out, LABEL_DATA_VALUE);
                entry.value
            }
            Value::ObjLink(_) => {
                encode::text(out, LABEL_OBJLINK_VALUE);
                entry.value
            }
        };
        stage_value(&mut self.staging, value, &[]);
        Ok(())
    }

    fn get_payload(&mut self, buf: &mut [u8]) -> Result<Progress> {
        self.staging.drain(buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Label {
    BaseName,
    Name,
    Ignored,
    Value(DataType),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    BetweenRecords,
    Label,
    /// Reading a text label
    TextLabel,
    /// Label consumed, its value not yet
    AfterLabel(Label),
    /// Reading a name or base name string
    NameText(Label),
    Value(DataType),
    Finished,
}

#[derive(Debug)]
pub struct SenmlCborDecoder {
    format: ContentFormat,
    request_uri: UriPath,
    tok: Tokenizer,
    reader: ValueReader,
    stage: Stage,
    base_name: heapless::String<MAX_NAME>,
    name: heapless::String<MAX_NAME>,
    text: heapless::Vec<u8, MAX_NAME>,
    path: UriPath,
    has_value: bool,
    /// Scalar value of the current record, emitted when the record ends
    held: Option<InValue<'static>>,
    failed: bool,
}

/// Owned copy of a value that borrows nothing
fn detach(value: InValue<'_>) -> Option<InValue<'static>> {
    match value {
        InValue::Null => Some(InValue::Null),
        InValue::Int(v) => Some(InValue::Int(v)),
        InValue::UInt(v) => Some(InValue::UInt(v)),
        InValue::Double(v) => Some(InValue::Double(v)),
        InValue::Bool(v) => Some(InValue::Bool(v)),
        InValue::ObjLink(v) => Some(InValue::ObjLink(v)),
        InValue::Time(v) => Some(InValue::Time(v)),
        InValue::String(_) | InValue::Bytes(_) => None,
    }
}

fn is_streamed(allowed: DataType) -> bool {
    allowed == DataType::STRING || allowed == DataType::BYTES
}

impl SenmlCborDecoder {
    pub fn new(format: ContentFormat, request_uri: UriPath) -> Self {
        Self {
            format,
            request_uri,
            tok: Tokenizer::new(),
            reader: ValueReader::default(),
            stage: Stage::Start,
            base_name: heapless::String::new(),
            name: heapless::String::new(),
            text: heapless::Vec::new(),
            path: UriPath::Root,
            has_value: false,
            held: None,
            failed: false,
        }
    }

    fn fail<T>(&mut self, reason: &'static str) -> Result<T> {
        debug!("SenML-CBOR payload rejected: {}", reason);
        self.failed = true;
        Err(Error::Format(reason))
    }

    /// Collect a short text item into `self.text`
    fn read_text(&mut self) -> Result<()> {
        loop {
            let (data, done) = self.tok.bytes_get_some()?;
            if self.text.extend_from_slice(data).is_err() {
                return self.fail("SenML name too long");
            }
            if done {
                return Ok(());
            }
        }
    }

    fn resolve_path(&mut self) -> Result<UriPath> {
        let mut full = heapless::String::<{ 2 * MAX_NAME }>::new();
        // both halves fit by construction
        let _ = full.push_str(&self.base_name);
        let _ = full.push_str(&self.name);
        let Ok(path) = full.parse::<UriPath>() else {
            return self.fail("SenML name is not a valid path");
        };
        if !self.request_uri.is_prefix_of(&path) {
            return self.fail("SenML record outside the request path");
        }
        Ok(path)
    }

    fn next_entry(&mut self, hint: DataType) -> Result<Next<'_>> {
        loop {
            match self.stage {
                Stage::Start => {
                    if self.tok.current_value_type()? != ValueType::Array {
                        return self.fail("SenML payload is not an array");
                    }
                    self.tok.enter_array()?;
                    self.stage = Stage::BetweenRecords;
                }
                Stage::BetweenRecords => {
                    if self.tok.nesting_level()? == 0 {
                        if self.tok.at_end()? {
                            self.stage = Stage::Finished;
                            return Ok(Next::Eof);
                        }
                        return self.fail("data after the SenML array");
                    }
                    if self.tok.current_value_type()? != ValueType::Map {
                        return self.fail("SenML record is not a map");
                    }
                    self.tok.enter_map()?;
                    self.name.clear();
                    self.has_value = false;
                    self.held = None;
                    self.stage = Stage::Label;
                }
                Stage::Label => {
                    if self.tok.nesting_level()? < 2 {
                        self.stage = Stage::BetweenRecords;
                        if let Some(value) = self.held.take() {
                            let path = self.resolve_path()?;
                            return Ok(Next::Entry(Entry { path, value }));
                        }
                        if !self.has_value {
                            let path = self.resolve_path()?;
                            if !hint.contains(DataType::NULL) {
                                return self.fail("SenML record without a value");
                            }
                            return Ok(Next::Entry(Entry {
                                path,
                                value: InValue::Null,
                            }));
                        }
                        continue;
                    }
                    let label = match self.tok.current_value_type()? {
                        ValueType::UInt | ValueType::NegativeInt => {
                            let Some(label) = self.tok.number()?.as_i64() else {
                                return self.fail("SenML label out of range");
                            };
                            match label {
                                LABEL_BASE_NAME => Label::BaseName,
                                LABEL_NAME => Label::Name,
                                LABEL_BASE_TIME | LABEL_TIME => Label::Ignored,
                                LABEL_VALUE => Label::Value(
                                    DataType::INT | DataType::UINT | DataType::DOUBLE | DataType::TIME,
                                ),
                                LABEL_STRING_VALUE => Label::Value(DataType::STRING),
                                LABEL_BOOL_VALUE => Label::Value(DataType::BOOL),
                                LABEL_DATA_VALUE => Label::Value(DataType::BYTES),
                                _ => return self.fail("unsupported SenML label"),
                            }
                        }
                        ValueType::TextString => {
                            self.tok.bytes()?;
                            self.text.clear();
                            self.stage = Stage::TextLabel;
                            continue;
                        }
                        _ => return self.fail("invalid SenML label"),
                    };
                    self.stage = Stage::AfterLabel(label);
                }
                Stage::AfterLabel(label) => self.on_label(label)?,
                Stage::TextLabel => {
                    self.read_text()?;
                    if self.text[..] != *LABEL_OBJLINK_VALUE.as_bytes() {
                        return self.fail("unsupported SenML label");
                    }
                    self.stage = Stage::AfterLabel(Label::Value(DataType::OBJLINK));
                }
                Stage::NameText(label) => {
                    self.read_text()?;
                    let Ok(text) = std::str::from_utf8(&self.text) else {
                        return self.fail("SenML name is not UTF-8");
                    };
                    let target = if label == Label::BaseName {
                        &mut self.base_name
                    } else {
                        &mut self.name
                    };
                    target.clear();
                    // same capacity as `text`
                    let _ = target.push_str(text);
                    self.stage = Stage::Label;
                }
                Stage::Value(allowed) => {
                    let effective = hint & allowed;
                    if effective.is_empty() {
                        return self.fail("SenML value type does not match the resource");
                    }
                    if !is_streamed(allowed) {
                        let value = match self.reader.read(&mut self.tok, effective) {
                            Ok((value, _)) => detach(value),
                            Err(e) => {
                                self.failed = !e.is_want_next_payload();
                                return Err(e);
                            }
                        };
                        let Some(value) = value else {
                            return self.fail("SenML scalar label holds a string");
                        };
                        self.held = Some(value);
                        self.stage = Stage::Label;
                        continue;
                    }
                    let path = self.path;
                    return match self.reader.read(&mut self.tok, effective) {
                        Ok((value, done)) => {
                            if done {
                                self.stage = Stage::Label;
                            }
                            Ok(Next::Entry(Entry { path, value }))
                        }
                        Err(e) => {
                            self.failed = !e.is_want_next_payload();
                            Err(e)
                        }
                    };
                }
                Stage::Finished => return Ok(Next::Eof),
            }
        }
    }

    fn on_label(&mut self, label: Label) -> Result<()> {
        match label {
            Label::BaseName | Label::Name => {
                if self.has_value && self.held.is_none() {
                    return self.fail("SenML name after the value");
                }
                if self.tok.current_value_type()? != ValueType::TextString {
                    return self.fail("SenML name is not a text string");
                }
                self.tok.bytes()?;
                self.text.clear();
                self.stage = Stage::NameText(label);
            }
            Label::Ignored => {
                self.tok.number()?;
                self.stage = Stage::Label;
            }
            Label::Value(allowed) => {
                if self.has_value {
                    return self.fail("SenML record with two values");
                }
                if is_streamed(allowed) {
                    self.path = self.resolve_path()?;
                }
                self.has_value = true;
                self.stage = Stage::Value(allowed);
            }
        }
        Ok(())
    }
}

impl PayloadDecoder for SenmlCborDecoder {
    fn content_format(&self) -> ContentFormat {
        self.format
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
