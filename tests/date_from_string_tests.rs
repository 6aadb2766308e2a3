use chrono::{TimeZone, Utc};
use serde_json::{Value, json};
use shardagg::core::Document;
use shardagg::evaluator::{Expr, evaluate};
use shardagg::{DateParseError, RouterError, parse_date_string, parse_date_with_format};

fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

fn eval(expr: Value, input: Value) -> shardagg::Result<Value> {
    let expr = Expr::parse(&expr)?;
    evaluate(&expr, &doc(input))
}

#[test]
fn test_iso_string_keeps_fractional_millis() {
    let parsed = parse_date_string("2017-07-04T11:56:02.81Z", None).unwrap();
    assert_eq!(parsed, Utc.with_ymd_and_hms(2017, 7, 4, 11, 56, 2).unwrap() + chrono::Duration::milliseconds(810));
}

#[test]
fn test_named_month_with_embedded_zone() {
    // New York is on daylight time in July.
    let parsed = parse_date_string("July 4th, 2017 11:56:02 America/New_York", None).unwrap();
    assert_eq!(parsed, Utc.with_ymd_and_hms(2017, 7, 4, 15, 56, 2).unwrap());
}

#[test]
fn test_timezone_argument_applies_to_naive_string() {
    let parsed = parse_date_string("2017-07-04 11:56:02", Some("+02:00")).unwrap();
    assert_eq!(parsed, Utc.with_ymd_and_hms(2017, 7, 4, 9, 56, 2).unwrap());

    let date_only = parse_date_string("2017-07-04", None).unwrap();
    assert_eq!(date_only, Utc.with_ymd_and_hms(2017, 7, 4, 0, 0, 0).unwrap());
}

#[test]
fn test_embedded_zone_conflicts_with_argument() {
    let err = parse_date_string("2017-07-04T11:56:02Z", Some("Europe/London")).unwrap_err();
    assert!(matches!(err, DateParseError::TimezoneConflict { .. }));
}

#[test]
fn test_time_without_date_is_rejected() {
    let err = parse_date_string("11:56:02", None).unwrap_err();
    assert!(matches!(err, DateParseError::MissingDateComponent { .. }));
}

#[test]
fn test_trailing_garbage_is_unparseable() {
    let err = parse_date_string("2017-07-04T11:56:02 banana", None).unwrap_err();
    assert!(matches!(err, DateParseError::Unparseable { .. }));

    let err = parse_date_string("2017-02-30", None).unwrap_err();
    assert!(matches!(err, DateParseError::Unparseable { .. }));
}

#[test]
fn test_unknown_timezone_argument() {
    let err = parse_date_string("2017-07-04", Some("Mars/Olympus")).unwrap_err();
    assert_eq!(err, DateParseError::UnknownTimezone("Mars/Olympus".into()));
}

#[test]
fn test_explicit_format() {
    let parsed = parse_date_with_format("04/07/2017 11:56", "%d/%m/%Y %H:%M", None).unwrap();
    assert_eq!(parsed, Utc.with_ymd_and_hms(2017, 7, 4, 11, 56, 0).unwrap());

    let err = parse_date_with_format("2017-07-04", "%d/%m/%Y", None).unwrap_err();
    assert!(matches!(err, DateParseError::FormatMismatch { .. }));
}

#[test]
fn test_date_from_string_expression() {
    let value = eval(
        json!({"$dateFromString": {"dateString": "$when"}}),
        json!({"when": "2017-07-04T11:56:02.81Z"}),
    )
    .unwrap();
    assert_eq!(value, json!({"$date": "2017-07-04T11:56:02.810Z"}));
}

#[test]
fn test_date_from_string_on_null_and_on_error() {
    let on_null = eval(
        json!({"$dateFromString": {"dateString": "$missing", "onNull": "none"}}),
        json!({}),
    )
    .unwrap();
    assert_eq!(on_null, json!("none"));

    let on_error = eval(
        json!({"$dateFromString": {"dateString": "$when", "onError": "$when"}}),
        json!({"when": "not a date"}),
    )
    .unwrap();
    assert_eq!(on_error, json!("not a date"));

    let err = eval(
        json!({"$dateFromString": {"dateString": "$when"}}),
        json!({"when": "not a date"}),
    )
    .unwrap_err();
    assert!(matches!(err, RouterError::DateParse(DateParseError::Unparseable { .. })));
}

#[test]
fn test_date_from_string_rejects_unknown_arguments() {
    let result = eval(
        json!({"$dateFromString": {"dateString": "2017-07-04", "locale": "fr"}}),
        json!({}),
    );
    assert!(matches!(result, Err(RouterError::ParseError(_))));
}
