//! Flexible date/time string parsing behind `$dateFromString`.
//!
//! Two entry points: [`parse_date_string`] accepts the free-form shapes
//! people actually send (ISO-8601, slashed dates, English month names,
//! offsets and IANA zone names), [`parse_date_with_format`] follows an
//! explicit `%`-format.

mod format;
mod parser;
mod zone;

pub use format::parse_date_with_format;
pub use parser::parse_date_string;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DateParseError {
    #[error("Error parsing date string '{input}'")]
    Unparseable { input: String },

    #[error("an incomplete date/time string has been found, with elements missing: '{input}'")]
    MissingDateComponent { input: String },

    #[error(
        "you cannot pass in a date/time string with time zone information ('{zone}') together with a timezone argument"
    )]
    TimezoneConflict { input: String, zone: String },

    #[error("unrecognized time zone identifier: \"{0}\"")]
    UnknownTimezone(String),

    #[error("Error parsing date string '{input}' with format '{format}'")]
    FormatMismatch { input: String, format: String },

    #[error("Invalid format specifier in '{0}'")]
    InvalidFormat(String),
}
