use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use lazy_static::lazy_static;
use regex::Regex;

use super::DateParseError;

lazy_static! {
    static ref OFFSET_RE: Regex = Regex::new(r"^([+-])(\d{2})(?::?(\d{2}))?$").unwrap();
}

/// A resolved zone: either a fixed UTC offset or an IANA zone with DST rules.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Zone {
    Fixed(FixedOffset),
    Named(Tz),
}

impl Zone {
    pub(crate) fn utc() -> Self {
        Self::Fixed(Utc.fix())
    }

    /// Recognizes `Z`, `UTC`, `GMT`, `+HH`, `+HHMM`, `+HH:MM` and IANA names.
    pub(crate) fn parse(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.eq_ignore_ascii_case("z")
            || token.eq_ignore_ascii_case("utc")
            || token.eq_ignore_ascii_case("gmt")
        {
            return Some(Self::utc());
        }

        if let Some(caps) = OFFSET_RE.captures(token) {
            let hours: i32 = caps[2].parse().ok()?;
            let minutes: i32 = caps.get(3).map_or(Some(0), |m| m.as_str().parse().ok())?;
            if hours > 23 || minutes > 59 {
                return None;
            }
            let seconds = hours * 3600 + minutes * 60;
            let seconds = if &caps[1] == "-" { -seconds } else { seconds };
            return FixedOffset::east_opt(seconds).map(Self::Fixed);
        }

        token.parse::<Tz>().ok().map(Self::Named)
    }

    pub(crate) fn from_minutes(minutes: i32) -> Option<Self> {
        FixedOffset::east_opt(minutes * 60).map(Self::Fixed)
    }

    /// Resolves a wall-clock time in this zone to an instant.
    ///
    /// Ambiguous local times (DST fall-back) take the earlier instant;
    /// non-existent ones (DST spring-forward) do not resolve.
    pub(crate) fn resolve(&self, naive: &NaiveDateTime) -> Option<DateTime<Utc>> {
        match self {
            Self::Fixed(offset) => offset
                .from_local_datetime(naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
            Self::Named(tz) => tz
                .from_local_datetime(naive)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// Parses the caller-supplied `timezone` argument.
pub(crate) fn parse_timezone_argument(timezone: &str) -> Result<Zone, DateParseError> {
    Zone::parse(timezone).ok_or_else(|| DateParseError::UnknownTimezone(timezone.to_string()))
}
