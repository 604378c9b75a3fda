//! CBOR based formats: plain CBOR (60), SenML-CBOR (112/322), LwM2M-CBOR (11544)

use crate::error::{Error, Result};
use crate::io::staging::{Framing, Staging};
use crate::io::{Chunk, DataType, InValue, Value};
use crate::uri::ObjLink;

pub(crate) mod encode;
pub mod lwm2m;
pub mod plain;
pub mod senml;
pub(crate) mod time;
pub mod tokenizer;

pub use tokenizer::{Number, State, Tokenizer, ValueType};

/// Deepest container nesting any supported CBOR payload needs
///
/// LwM2M-CBOR is the worst case: root, object, instance and resource maps
/// plus one level inside a value (decimal fraction or indefinite string).
pub const MAX_NESTING_DEPTH: usize = 5;

/// Longest textual object link, "65535:65535"
const OBJLINK_MAX: usize = 11;

/// Append `value` to the staging queue, followed by `trailer`
///
/// External values become indefinite-length strings whose chunks are pulled
/// while draining.
pub(crate) fn stage_value(staging: &mut Staging, value: Value, trailer: &[u8]) {
    let out = staging.out();
    match value {
        Value::Null => encode::null(out),
        Value::Int(v) => encode::int(out, v),
        Value::UInt(v) => encode::uint(out, v),
        Value::Double(v) => encode::double(out, v),
        Value::Bool(v) => encode::boolean(out, v),
        Value::String(v) => encode::text(out, &v),
        Value::Bytes(v) => encode::bytes(out, &v),
        Value::ObjLink(v) => encode::text(out, &v.to_string()),
        Value::Time(v) => {
            encode::tag(out, encode::TAG_EPOCH_TIME);
            encode::int(out, v);
        }
        Value::ExternalString(source) => {
            out.push(encode::INDEFINITE_TEXT);
            let mut tail = vec![encode::BREAK];
            tail.extend_from_slice(trailer);
            staging.push_external(source, Framing::CborChunks(encode::MAJOR_TEXT), tail);
            return;
        }
        Value::ExternalBytes(source) => {
            out.push(encode::INDEFINITE_BYTES);
            let mut tail = vec![encode::BREAK];
            tail.extend_from_slice(trailer);
            staging.push_external(source, Framing::CborChunks(encode::MAJOR_BYTES), tail);
            return;
        }
    }
    out.extend_from_slice(trailer);
}

#[derive(Debug)]
struct StringProgress {
    bytes: bool,
    offset: usize,
    total: Option<usize>,
}

/// Reads one value from the tokenizer, streaming strings piece by piece
#[derive(Debug, Default)]
pub(crate) struct ValueReader {
    string: Option<StringProgress>,
    objlink: Option<heapless::Vec<u8, OBJLINK_MAX>>,
    /// Number whose tagged encoding straddled a payload boundary
    number: Option<ValueType>,
}

impl ValueReader {
    /// Whether a string value is partially delivered
    #[cfg(test)]
    pub(crate) fn in_progress(&self) -> bool {
        self.string.is_some() || self.objlink.is_some() || self.number.is_some()
    }

    /// Read the next value or value piece, converted to a type in `hint`
    ///
    /// The flag tells whether the value is complete.
    pub(crate) fn read<'t>(
        &mut self,
        tok: &'t mut Tokenizer,
        hint: DataType,
    ) -> Result<(InValue<'t>, bool)> {
        if self.objlink.is_some() {
            return self.read_objlink(tok).map(|link| (InValue::ObjLink(link), true));
        }
        if let Some(ty) = self.number {
            let number = tok.number()?;
            self.number = None;
            return Ok((convert_number(ty, number, hint)?, true));
        }
        if self.string.is_none() {
            match tok.current_value_type()? {
                ValueType::Null => {
                    if !hint.contains(DataType::NULL) {
                        return Err(Error::Format("unexpected null"));
                    }
                    tok.null()?;
                    return Ok((InValue::Null, true));
                }
                ValueType::Bool => {
                    if !hint.contains(DataType::BOOL) {
                        return Err(Error::Format("unexpected boolean"));
                    }
                    return Ok((InValue::Bool(tok.bool()?), true));
                }
                ty @ (ValueType::UInt
                | ValueType::NegativeInt
                | ValueType::Float
                | ValueType::Double
                | ValueType::Timestamp) => {
                    self.number = Some(ty);
                    let number = tok.number()?;
                    self.number = None;
                    return Ok((convert_number(ty, number, hint)?, true));
                }
                ValueType::ByteString => {
                    if !hint.contains(DataType::BYTES) {
                        return Err(Error::Format("unexpected byte string"));
                    }
                    let total = tok.bytes()?;
                    self.string = Some(StringProgress {
                        bytes: true,
                        offset: 0,
                        total,
                    });
                }
                ValueType::TextString => {
                    if hint.contains(DataType::STRING) {
                        let total = tok.bytes()?;
                        self.string = Some(StringProgress {
                            bytes: false,
                            offset: 0,
                            total,
                        });
                    } else if hint.contains(DataType::OBJLINK) {
                        if tok.bytes()?.is_some_and(|len| len > OBJLINK_MAX) {
                            return Err(Error::Format("object link too long"));
                        }
                        self.objlink = Some(heapless::Vec::new());
                        return self.read_objlink(tok).map(|link| (InValue::ObjLink(link), true));
                    } else {
                        return Err(Error::Format("unexpected text string"));
                    }
                }
                ValueType::Array | ValueType::Map => {
                    return Err(Error::Format("container where a value was expected"));
                }
            }
        }

        let (data, done) = tok.bytes_get_some()?;
        let Some(progress) = self.string.as_mut() else {
            return Err(Error::Logic("no string in progress"));
        };
        let chunk = Chunk {
            data,
            offset: progress.offset,
            full_length_hint: if done {
                Some(progress.offset + data.len())
            } else {
                progress.total
            },
        };
        progress.offset += data.len();
        let value = if progress.bytes {
            InValue::Bytes(chunk)
        } else {
            InValue::String(chunk)
        };
        if done {
            self.string = None;
        }
        Ok((value, done))
    }

    fn read_objlink(&mut self, tok: &mut Tokenizer) -> Result<ObjLink> {
        let Some(text) = self.objlink.as_mut() else {
            return Err(Error::Logic("no object link in progress"));
        };
        loop {
            let (data, done) = tok.bytes_get_some()?;
            text.extend_from_slice(data)
                .map_err(|_| Error::Format("object link too long"))?;
            if done {
                break;
            }
        }
        let link = std::str::from_utf8(&text[..])
            .ok()
            .and_then(|s| s.parse::<ObjLink>().ok())
            .ok_or(Error::Format("invalid object link"))?;
        self.objlink = None;
        Ok(link)
    }
}

/// Lossless conversion of a decoded number to a type in `hint`
pub(crate) fn convert_number(
    ty: ValueType,
    number: Number,
    hint: DataType,
) -> Result<InValue<'static>> {
    let order: &[DataType] = match ty {
        ValueType::UInt => &[DataType::UINT, DataType::INT, DataType::DOUBLE, DataType::TIME],
        ValueType::NegativeInt => &[DataType::INT, DataType::DOUBLE, DataType::TIME],
        ValueType::Timestamp => &[DataType::TIME, DataType::INT, DataType::UINT, DataType::DOUBLE],
        _ => &[DataType::DOUBLE, DataType::INT, DataType::UINT, DataType::TIME],
    };
    for &candidate in order {
        if !hint.contains(candidate) {
            continue;
        }
        let value = if candidate == DataType::UINT {
            number.as_u64().map(InValue::UInt)
        } else if candidate == DataType::INT {
            number.as_i64().map(InValue::Int)
        } else if candidate == DataType::TIME {
            number.as_i64().map(InValue::Time)
        } else {
            let v = number.as_f64();
            let exact = match number {
                Number::UInt(u) => v < 1.844_674_407_370_955_2e19 && v as u64 == u,
                Number::Int(i) => v as i64 == i,
                _ => true,
            };
            exact.then_some(InValue::Double(v))
        };
        if let Some(value) = value {
            return Ok(value);
        }
    }
    Err(Error::Format("number does not fit the expected type"))
}
