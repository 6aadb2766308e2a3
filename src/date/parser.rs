use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use lazy_static::lazy_static;
use regex::{Captures, Regex};

use super::DateParseError;
use super::zone::{Zone, parse_timezone_argument};

lazy_static! {
    static ref ISO_DATE_RE: Regex = Regex::new(r"^(\d{4})[-/](\d{1,2})[-/](\d{1,2})").unwrap();
    static ref US_DATE_RE: Regex = Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{4})").unwrap();
    static ref MONTH_FIRST_RE: Regex =
        Regex::new(r"^([A-Za-z]+)\.?\s+(\d{1,2})(?:st|nd|rd|th)?,?\s+(\d{4})").unwrap();
    static ref DAY_FIRST_RE: Regex =
        Regex::new(r"^(\d{1,2})(?:st|nd|rd|th)?\s+([A-Za-z]+)\.?,?\s+(\d{4})").unwrap();
    static ref TIME_FIRST_RE: Regex = Regex::new(r"^\d{1,2}:\d{2}").unwrap();
    static ref REST_RE: Regex = Regex::new(
        r"^(?:(?:T|\s+)(\d{1,2}):(\d{2})(?::(\d{2})(?:\.(\d+))?)?)?\s*(Z|[+-]\d{2}(?::?\d{2})?|[A-Za-z][A-Za-z_]*(?:/[A-Za-z0-9_+\-]+)*)?$"
    )
    .unwrap();
}

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

pub(crate) fn month_from_name(name: &str) -> Option<u32> {
    let name = name.to_ascii_lowercase();
    if name.len() < 3 {
        return None;
    }
    MONTHS
        .iter()
        .position(|full| full.starts_with(name.as_str()))
        .map(|idx| idx as u32 + 1)
}

/// Milliseconds from the digits after the decimal point: "81" -> 810.
pub(crate) fn fraction_to_millis(digits: &str) -> u32 {
    let mut millis = 0;
    for (i, ch) in digits.chars().take(3).enumerate() {
        let digit = ch.to_digit(10).unwrap_or(0);
        millis += digit * 10u32.pow(2 - i as u32);
    }
    millis
}

struct DatePart<'a> {
    year: i32,
    month: u32,
    day: u32,
    rest: &'a str,
}

fn number<T: std::str::FromStr>(caps: &Captures<'_>, idx: usize) -> Option<T> {
    caps.get(idx)?.as_str().parse().ok()
}

fn split_date(input: &str) -> Option<DatePart<'_>> {
    if let Some(caps) = ISO_DATE_RE.captures(input) {
        return Some(DatePart {
            year: number(&caps, 1)?,
            month: number(&caps, 2)?,
            day: number(&caps, 3)?,
            rest: &input[caps.get(0)?.end()..],
        });
    }
    if let Some(caps) = US_DATE_RE.captures(input) {
        return Some(DatePart {
            year: number(&caps, 3)?,
            month: number(&caps, 1)?,
            day: number(&caps, 2)?,
            rest: &input[caps.get(0)?.end()..],
        });
    }
    if let Some(caps) = MONTH_FIRST_RE.captures(input) {
        if let Some(month) = month_from_name(&caps[1]) {
            return Some(DatePart {
                year: number(&caps, 3)?,
                month,
                day: number(&caps, 2)?,
                rest: &input[caps.get(0)?.end()..],
            });
        }
    }
    if let Some(caps) = DAY_FIRST_RE.captures(input) {
        if let Some(month) = month_from_name(&caps[2]) {
            return Some(DatePart {
                year: number(&caps, 3)?,
                month,
                day: number(&caps, 1)?,
                rest: &input[caps.get(0)?.end()..],
            });
        }
    }
    None
}

/// Parses a free-form date/time string into a UTC instant.
///
/// The wall-clock fields are interpreted in the zone embedded in the string,
/// else in `timezone`, else in UTC. Giving both is an error, as is a string
/// with a time but no date.
pub fn parse_date_string(input: &str, timezone: Option<&str>) -> Result<DateTime<Utc>, DateParseError> {
    let trimmed = input.trim();
    let unparseable = || DateParseError::Unparseable {
        input: input.to_string(),
    };

    let Some(date) = split_date(trimmed) else {
        if TIME_FIRST_RE.is_match(trimmed) {
            return Err(DateParseError::MissingDateComponent {
                input: input.to_string(),
            });
        }
        return Err(unparseable());
    };

    let caps = REST_RE.captures(date.rest).ok_or_else(unparseable)?;

    let hour: u32 = number(&caps, 1).unwrap_or(0);
    let minute: u32 = number(&caps, 2).unwrap_or(0);
    let second: u32 = number(&caps, 3).unwrap_or(0);
    let millis = caps.get(4).map_or(0, |m| fraction_to_millis(m.as_str()));

    let day = NaiveDate::from_ymd_opt(date.year, date.month, date.day).ok_or_else(unparseable)?;
    let time = NaiveTime::from_hms_milli_opt(hour, minute, second, millis).ok_or_else(unparseable)?;
    let naive = day.and_time(time);

    let zone = match (caps.get(5), timezone) {
        (Some(embedded), arg) => {
            // A trailing word that is not a zone is garbage, not a conflict.
            let zone = Zone::parse(embedded.as_str()).ok_or_else(unparseable)?;
            if arg.is_some() {
                return Err(DateParseError::TimezoneConflict {
                    input: input.to_string(),
                    zone: embedded.as_str().to_string(),
                });
            }
            zone
        }
        (None, Some(arg)) => parse_timezone_argument(arg)?,
        (None, None) => Zone::utc(),
    };

    zone.resolve(&naive).ok_or_else(unparseable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_names_accept_prefixes() {
        assert_eq!(month_from_name("Jul"), Some(7));
        assert_eq!(month_from_name("sept"), Some(9));
        assert_eq!(month_from_name("DECEMBER"), Some(12));
        assert_eq!(month_from_name("ju"), None);
        assert_eq!(month_from_name("smarch"), None);
    }

    #[test]
    fn fractions_truncate_to_millis() {
        assert_eq!(fraction_to_millis("81"), 810);
        assert_eq!(fraction_to_millis("5"), 500);
        assert_eq!(fraction_to_millis("123456"), 123);
    }
}
