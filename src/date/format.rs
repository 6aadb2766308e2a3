use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

use super::DateParseError;
use super::parser::fraction_to_millis;
use super::zone::{Zone, parse_timezone_argument};

#[derive(Default)]
struct Fields {
    year: Option<i32>,
    month: Option<u32>,
    day: Option<u32>,
    hour: u32,
    minute: u32,
    second: u32,
    millis: u32,
    zone: Option<(Zone, String)>,
}

struct Cursor<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn take_digits(&mut self, min: usize, max: usize) -> Option<&'a str> {
        let rest = self.rest();
        let len = rest
            .bytes()
            .take(max)
            .take_while(|b| b.is_ascii_digit())
            .count();
        if len < min {
            return None;
        }
        self.pos += len;
        Some(&rest[..len])
    }

    fn take_sign(&mut self) -> Option<i32> {
        match self.rest().as_bytes().first()? {
            b'+' => {
                self.pos += 1;
                Some(1)
            }
            b'-' => {
                self.pos += 1;
                Some(-1)
            }
            _ => None,
        }
    }

    fn take_literal(&mut self, ch: char) -> Option<()> {
        if self.rest().starts_with(ch) {
            self.pos += ch.len_utf8();
            Some(())
        } else {
            None
        }
    }
}

/// Parses `input` according to an explicit format.
///
/// Supported specifiers: `%Y` (4-digit year), `%m`, `%d`, `%H`, `%M`, `%S`,
/// `%L` (milliseconds), `%z` (`+HHMM` / `+HH:MM`), `%Z` (signed minute
/// offset, e.g. `+60`) and `%%`.
pub fn parse_date_with_format(
    input: &str,
    format: &str,
    timezone: Option<&str>,
) -> Result<DateTime<Utc>, DateParseError> {
    let mismatch = || DateParseError::FormatMismatch {
        input: input.to_string(),
        format: format.to_string(),
    };

    let mut fields = Fields::default();
    let mut cursor = Cursor { input, pos: 0 };
    let mut spec = format.chars();

    while let Some(ch) = spec.next() {
        if ch != '%' {
            cursor.take_literal(ch).ok_or_else(mismatch)?;
            continue;
        }
        let directive = spec
            .next()
            .ok_or_else(|| DateParseError::InvalidFormat(format.to_string()))?;
        match directive {
            'Y' => fields.year = Some(parse_num(cursor.take_digits(4, 4)).ok_or_else(mismatch)?),
            'm' => fields.month = Some(parse_num(cursor.take_digits(1, 2)).ok_or_else(mismatch)?),
            'd' => fields.day = Some(parse_num(cursor.take_digits(1, 2)).ok_or_else(mismatch)?),
            'H' => fields.hour = parse_num(cursor.take_digits(1, 2)).ok_or_else(mismatch)?,
            'M' => fields.minute = parse_num(cursor.take_digits(2, 2)).ok_or_else(mismatch)?,
            'S' => fields.second = parse_num(cursor.take_digits(2, 2)).ok_or_else(mismatch)?,
            'L' => {
                let digits = cursor.take_digits(1, 3).ok_or_else(mismatch)?;
                fields.millis = fraction_to_millis(&format!("{:0>3}", digits));
            }
            'z' => {
                let start = cursor.pos;
                cursor.take_sign().ok_or_else(mismatch)?;
                cursor.take_digits(2, 2).ok_or_else(mismatch)?;
                let _ = cursor.take_literal(':');
                cursor.take_digits(2, 2).ok_or_else(mismatch)?;
                let token = &input[start..cursor.pos];
                let zone = Zone::parse(token).ok_or_else(mismatch)?;
                fields.zone = Some((zone, token.to_string()));
            }
            'Z' => {
                let start = cursor.pos;
                let sign = cursor.take_sign().ok_or_else(mismatch)?;
                let minutes: i32 = parse_num(cursor.take_digits(1, 3)).ok_or_else(mismatch)?;
                let zone = Zone::from_minutes(sign * minutes).ok_or_else(mismatch)?;
                fields.zone = Some((zone, input[start..cursor.pos].to_string()));
            }
            '%' => cursor.take_literal('%').ok_or_else(mismatch)?,
            _ => return Err(DateParseError::InvalidFormat(format.to_string())),
        }
    }

    if !cursor.rest().is_empty() {
        return Err(mismatch());
    }

    let (Some(year), Some(month), Some(day)) = (fields.year, fields.month, fields.day) else {
        return Err(DateParseError::MissingDateComponent {
            input: input.to_string(),
        });
    };

    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(mismatch)?;
    let time = NaiveTime::from_hms_milli_opt(fields.hour, fields.minute, fields.second, fields.millis)
        .ok_or_else(mismatch)?;

    let zone = match (fields.zone, timezone) {
        (Some((_, token)), Some(_)) => {
            return Err(DateParseError::TimezoneConflict {
                input: input.to_string(),
                zone: token,
            });
        }
        (Some((zone, _)), None) => zone,
        (None, Some(arg)) => parse_timezone_argument(arg)?,
        (None, None) => Zone::utc(),
    };

    zone.resolve(&date.and_time(time)).ok_or_else(mismatch)
}

fn parse_num<T: std::str::FromStr>(digits: Option<&str>) -> Option<T> {
    digits?.parse().ok()
}
