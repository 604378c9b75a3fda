//! RFC 3339 date/time strings (CBOR tag 0)

use crate::error::{Error, Result};

/// Longest accepted date/time string
pub(crate) const MAX_TIME_STRING: usize = 64;

/// Seconds since the epoch for `YYYY-MM-DDTHH:MM:SS[.frac](Z|+HH:MM|-HH:MM)`
///
/// Returns the fractional part separately so callers can keep integral
/// times integral.
pub(crate) fn parse_rfc3339(text: &[u8]) -> Result<(i64, f64)> {
    const BAD: Error = Error::Format("invalid RFC 3339 date/time");

    if text.len() < 20 {
        return Err(BAD);
    }
    let year = digits(&text[0..4])?;
    let month = digits(&text[5..7])?;
    let day = digits(&text[8..10])?;
    let hour = digits(&text[11..13])?;
    let minute = digits(&text[14..16])?;
    let second = digits(&text[17..19])?;
    if text[4] != b'-'
        || text[7] != b'-'
        || !matches!(text[10], b'T' | b't')
        || text[13] != b':'
        || text[16] != b':'
    {
        return Err(BAD);
    }
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 60
    {
        return Err(BAD);
    }

    let mut rest = &text[19..];
    let mut fraction = 0.0;
    if rest.first() == Some(&b'.') {
        let end = rest[1..]
            .iter()
            .position(|b| !b.is_ascii_digit())
            .map_or(rest.len(), |p| p + 1);
        if end == 1 {
            return Err(BAD);
        }
        let frac = std::str::from_utf8(&rest[..end]).map_err(|_| BAD)?;
        fraction = format!("0{}", frac).parse::<f64>().map_err(|_| BAD)?;
        rest = &rest[end..];
    }

    let offset = match rest {
        [b'Z' | b'z'] => 0,
        [sign @ (b'+' | b'-'), h1, h2, b':', m1, m2] => {
            let minutes = digits(&[*h1, *h2])? * 60 + digits(&[*m1, *m2])?;
            if *sign == b'+' { minutes * 60 } else { -minutes * 60 }
        }
        _ => return Err(BAD),
    };

    let days = days_from_civil(year, month, day);
    let seconds = days * 86_400 + hour * 3_600 + minute * 60 + second - offset;
    Ok((seconds, fraction))
}

fn digits(text: &[u8]) -> Result<i64> {
    text.iter().try_fold(0i64, |acc, &b| {
        if b.is_ascii_digit() {
            Ok(acc * 10 + i64::from(b - b'0'))
        } else {
            Err(Error::Format("invalid RFC 3339 date/time"))
        }
    })
}

/// Days between 1970-01-01 and the given proleptic Gregorian date
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc8949_example() {
        // RFC 8949 appendix A: 0("2013-03-21T20:04:00Z") == 1(1363896240)
        assert_eq!(parse_rfc3339(b"2013-03-21T20:04:00Z").unwrap(), (1_363_896_240, 0.0));
    }

    #[test]
    fn test_offset_and_fraction() {
        let (secs, frac) = parse_rfc3339(b"2013-03-21T22:04:00.5+02:00").unwrap();
        assert_eq!(secs, 1_363_896_240);
        assert_eq!(frac, 0.5);
        assert_eq!(parse_rfc3339(b"1970-01-01T00:00:00Z").unwrap().0, 0);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_rfc3339(b"2013-03-21 20:04:00Z").is_err());
        assert!(parse_rfc3339(b"2013-13-21T20:04:00Z").is_err());
        assert!(parse_rfc3339(b"2013-03-21T20:04:00").is_err());
        assert!(parse_rfc3339(b"2013-03-21T20:04:00.Z").is_err());
    }
}
