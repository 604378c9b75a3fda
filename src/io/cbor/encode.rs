//! Canonical CBOR primitives (RFC 8949 preferred serialization)

/// Unsigned integer
pub(crate) const MAJOR_UINT: u8 = 0;
/// Negative integer
pub(crate) const MAJOR_NEGATIVE_INT: u8 = 1;
/// Byte string
pub(crate) const MAJOR_BYTES: u8 = 2;
/// Text string
pub(crate) const MAJOR_TEXT: u8 = 3;
/// Array
pub(crate) const MAJOR_ARRAY: u8 = 4;
/// Map
pub(crate) const MAJOR_MAP: u8 = 5;
/// Tag
pub(crate) const MAJOR_TAG: u8 = 6;
/// Floats and simple values
pub(crate) const MAJOR_SIMPLE: u8 = 7;

/// Start of an indefinite-length byte string
pub(crate) const INDEFINITE_BYTES: u8 = 0x5F;
/// Start of an indefinite-length text string
pub(crate) const INDEFINITE_TEXT: u8 = 0x7F;
/// Start of an indefinite-length map
pub(crate) const INDEFINITE_MAP: u8 = 0xBF;
/// Break stop code
pub(crate) const BREAK: u8 = 0xFF;

/// Epoch-based date/time
pub(crate) const TAG_EPOCH_TIME: u64 = 1;

const FALSE: u8 = 0xF4;
const TRUE: u8 = 0xF5;
const NULL: u8 = 0xF6;
const FLOAT32: u8 = 0xFA;
const FLOAT64: u8 = 0xFB;

/// Initial byte plus argument in the shortest form
pub(crate) fn header(out: &mut Vec<u8>, major: u8, value: u64) {
    let ty = major << 5;
    if value < 24 {
        out.push(ty | value as u8);
    } else if let Ok(v) = u8::try_from(value) {
        out.extend_from_slice(&[ty | 24, v]);
    } else if let Ok(v) = u16::try_from(value) {
        out.push(ty | 25);
        out.extend_from_slice(&v.to_be_bytes());
    } else if let Ok(v) = u32::try_from(value) {
        out.push(ty | 26);
        out.extend_from_slice(&v.to_be_bytes());
    } else {
        out.push(ty | 27);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

pub(crate) fn uint(out: &mut Vec<u8>, value: u64) {
    header(out, MAJOR_UINT, value);
}

pub(crate) fn int(out: &mut Vec<u8>, value: i64) {
    if value >= 0 {
        header(out, MAJOR_UINT, value as u64);
    } else {
        // -1 - n, computed without overflow for i64::MIN
        header(out, MAJOR_NEGATIVE_INT, !(value as u64));
    }
}

/// Single precision when the value survives the round trip, double otherwise
pub(crate) fn double(out: &mut Vec<u8>, value: f64) {
    let single = value as f32;
    if value.is_nan() || f64::from(single) == value {
        out.push(FLOAT32);
        out.extend_from_slice(&single.to_bits().to_be_bytes());
    } else {
        out.push(FLOAT64);
        out.extend_from_slice(&value.to_bits().to_be_bytes());
    }
}

pub(crate) fn boolean(out: &mut Vec<u8>, value: bool) {
    out.push(if value { TRUE } else { FALSE });
}

pub(crate) fn null(out: &mut Vec<u8>) {
    out.push(NULL);
}

pub(crate) fn text(out: &mut Vec<u8>, value: &str) {
    header(out, MAJOR_TEXT, value.len() as u64);
    out.extend_from_slice(value.as_bytes());
}

pub(crate) fn bytes(out: &mut Vec<u8>, value: &[u8]) {
    header(out, MAJOR_BYTES, value.len() as u64);
    out.extend_from_slice(value);
}

pub(crate) fn tag(out: &mut Vec<u8>, value: u64) {
    header(out, MAJOR_TAG, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(f: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut out = Vec::new();
        f(&mut out);
        out
    }

    #[test]
    fn test_integer_boundaries() {
        assert_eq!(enc(|o| uint(o, 23)), [0x17]);
        assert_eq!(enc(|o| uint(o, 24)), [0x18, 0x18]);
        assert_eq!(enc(|o| int(o, i16::MAX as i64)), [0x19, 0x7F, 0xFF]);
        assert_eq!(enc(|o| int(o, i16::MAX as i64 + 1)), [0x19, 0x80, 0x00]);
        assert_eq!(
            enc(|o| int(o, i32::MAX as i64 + 1)),
            [0x1A, 0x80, 0x00, 0x00, 0x00]
        );
        assert_eq!(enc(|o| int(o, -1)), [0x20]);
        assert_eq!(enc(|o| int(o, -25)), [0x38, 0x18]);
        assert_eq!(
            enc(|o| int(o, i64::MIN)),
            [0x3B, 0x7F, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn test_float_width_selection() {
        assert_eq!(enc(|o| double(o, 1.5)), [0xFA, 0x3F, 0xC0, 0x00, 0x00]);
        assert_eq!(
            enc(|o| double(o, 1.1)),
            [0xFB, 0x3F, 0xF1, 0x99, 0x99, 0x99, 0x99, 0x99, 0x9A]
        );
    }

    #[test]
    fn test_string_header_transitions() {
        for (len, head_len) in [(0usize, 1usize), (23, 1), (24, 2), (255, 2), (256, 3)] {
            let s = "x".repeat(len);
            assert_eq!(enc(|o| text(o, &s)).len(), head_len + len);
        }
    }
}
