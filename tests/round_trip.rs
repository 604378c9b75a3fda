//! Encode then decode single values at encoding width boundaries
//!
//! Every value goes through each format's encoder and back through its
//! decoder, with the payload fed in 1-byte, 3-byte and whole chunks.

use rust_lwm2m::io::{self, DataType, InValue, Next, OutEntry, PayloadDecoder, PayloadEncoder, Value};
use rust_lwm2m::{ContentFormat, UriPath};

const PATH: UriPath = UriPath::Resource(3, 0, 1);

const FORMATS: &[ContentFormat] = &[
    ContentFormat::PlainText,
    ContentFormat::Cbor,
    ContentFormat::SenmlCbor,
    ContentFormat::OmaTlv,
    ContentFormat::Lwm2mCbor,
];

#[derive(Debug, Clone, PartialEq)]
enum Sample {
    Int(i64),
    UInt(u64),
    Double(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
}

impl Sample {
    fn to_value(&self) -> Value {
        match self {
            Sample::Int(v) => Value::Int(*v),
            Sample::UInt(v) => Value::UInt(*v),
            Sample::Double(v) => Value::Double(*v),
            Sample::Bool(v) => Value::Bool(*v),
            Sample::Text(v) => Value::String(v.clone()),
            Sample::Bytes(v) => Value::Bytes(v.clone()),
        }
    }

    fn data_type(&self) -> DataType {
        match self {
            Sample::Int(_) => DataType::INT,
            Sample::UInt(_) => DataType::UINT,
            Sample::Double(_) => DataType::DOUBLE,
            Sample::Bool(_) => DataType::BOOL,
            Sample::Text(_) => DataType::STRING,
            Sample::Bytes(_) => DataType::BYTES,
        }
    }
}

const STRING_LENGTHS: &[usize] = &[0, 4, 23, 24, 255, 256];

fn samples() -> Vec<Sample> {
    let mut samples = vec![
        Sample::Int(0),
        Sample::Int(-1),
        Sample::Int(i64::from(i16::MAX)),
        Sample::Int(i64::from(i16::MAX) + 1),
        Sample::Int(i64::from(i16::MIN)),
        Sample::Int(i64::from(i32::MAX)),
        Sample::Int(i64::from(i32::MAX) + 1),
        Sample::Int(i64::MAX),
        Sample::Int(i64::MIN),
        Sample::UInt(u64::from(u32::MAX) + 1),
        Sample::UInt(u64::MAX),
        // exact as f32
        Sample::Double(1.5),
        Sample::Double(-100000.0),
        Sample::Double(f64::from(f32::MAX)),
        // need all 64 bits
        Sample::Double(0.1),
        Sample::Double(-1e300),
        Sample::Bool(false),
        Sample::Bool(true),
    ];
    for &len in STRING_LENGTHS {
        let text: String = (0..len).map(|i| (b'a' + (i % 26) as u8) as char).collect();
        samples.push(Sample::Text(text));
        samples.push(Sample::Bytes((0..len).map(|i| (i * 7) as u8).collect()));
    }
    samples
}

fn encode(format: ContentFormat, sample: &Sample) -> Vec<u8> {
    let base = match format {
        ContentFormat::SenmlCbor => UriPath::Instance(3, 0),
        _ => PATH,
    };
    let mut enc = io::out_ctx(format.as_u16(), base, 1).unwrap();
    enc.new_entry(OutEntry::new(PATH, sample.to_value())).unwrap();
    let mut buf = [0u8; 7];
    let mut out = Vec::new();
    loop {
        let progress = enc.get_payload(&mut buf).unwrap();
        out.extend_from_slice(&buf[..progress.written]);
        if !progress.more {
            return out;
        }
    }
}

fn decode(format: ContentFormat, payload: &[u8], step: usize, hint: DataType) -> Sample {
    let request_uri = match format {
        ContentFormat::SenmlCbor | ContentFormat::Lwm2mCbor => UriPath::Root,
        _ => PATH,
    };
    let mut dec = io::in_ctx(format.as_u16(), request_uri).unwrap();
    let mut chunks = payload.chunks(step.max(1)).peekable();
    let mut pending = Vec::new();
    let mut decoded = None;
    loop {
        match dec.get_entry(hint).unwrap() {
            Next::WantNextPayload => match chunks.next() {
                Some(chunk) => dec.feed_payload(chunk, chunks.peek().is_none()).unwrap(),
                None => dec.feed_payload(&[], true).unwrap(),
            },
            Next::Entry(entry) => {
                assert_eq!(entry.path, PATH);
                assert!(decoded.is_none(), "value after the complete one");
                decoded = match entry.value {
                    InValue::Int(v) => Some(Sample::Int(v)),
                    InValue::UInt(v) => Some(Sample::UInt(v)),
                    InValue::Double(v) => Some(Sample::Double(v)),
                    InValue::Bool(v) => Some(Sample::Bool(v)),
                    InValue::String(chunk) | InValue::Bytes(chunk) => {
                        assert_eq!(chunk.offset, pending.len());
                        pending.extend_from_slice(chunk.data);
                        if !chunk.is_last() {
                            continue;
                        }
                        let data = std::mem::take(&mut pending);
                        if hint == DataType::STRING {
                            Some(Sample::Text(String::from_utf8(data).unwrap()))
                        } else {
                            Some(Sample::Bytes(data))
                        }
                    }
                    other => panic!("unexpected {:?}", other),
                };
            }
            Next::Eof => return decoded.unwrap(),
            Next::WantTypeDisambiguation(path) => panic!("single type asked again for {}", path),
        }
    }
}

#[test]
fn test_boundary_values_survive_every_format() {
    let mut failures = Vec::new();
    for &format in FORMATS {
        for sample in samples() {
            let payload = encode(format, &sample);
            for step in [1, 3, payload.len()] {
                let got = decode(format, &payload, step, sample.data_type());
                if got != sample {
                    failures.push(format!("{:?} step {}: {:?} -> {:?}", format, step, sample, got));
                }
            }
        }
    }
    assert!(failures.is_empty(), "{:#?}", failures);
}

#[test]
fn test_cbor_integer_widths() {
    let cases: &[(i64, &str)] = &[
        (23, "17"),
        (24, "1818"),
        (i64::from(i16::MAX), "197fff"),
        (i64::from(i16::MAX) + 1, "198000"),
        (i64::from(i32::MAX) + 1, "1a80000000"),
        (i64::MIN, "3b7fffffffffffffff"),
    ];
    for &(value, expected) in cases {
        assert_eq!(hex::encode(encode(ContentFormat::Cbor, &Sample::Int(value))), expected);
    }
}

#[test]
fn test_tlv_picks_narrowest_width() {
    // resource 1 TLV header, then the value bytes
    let cases: &[(Sample, &str)] = &[
        (Sample::Int(i64::from(i16::MAX)), "c2017fff"),
        (Sample::Int(i64::from(i16::MAX) + 1), "c40100008000"),
        (Sample::Double(1.5), "c4013fc00000"),
        (Sample::Double(0.1), "c801083fb999999999999a"),
    ];
    for (sample, expected) in cases {
        assert_eq!(hex::encode(encode(ContentFormat::OmaTlv, sample)), *expected);
    }
}
