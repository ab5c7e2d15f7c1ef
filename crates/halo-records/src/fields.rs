//! Transcoding of raw Halo values into stored field values.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use halo_core::LookupKey;
use serde_json::Value as JsonValue;

/// Halo sends 1900-01-01 (and occasionally other placeholder years) for
/// dates that were never set.
const LAST_EMPTY_YEAR: i32 = 1980;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    /// Boolean, false when absent.
    Flag,
    /// Boolean inverted on the way in, false when absent.
    NegatedFlag,
    OptionalBool,
    /// RFC 3339, or naive and read as UTC.
    Timestamp,
    /// Timestamp where placeholder years mean "no date".
    HaloDate,
    /// Date part of a [`FieldKind::HaloDate`].
    HaloDay,
}

impl FieldKind {
    /// Whether an empty string means "not sent". Text keeps it verbatim.
    pub fn blank_is_absent(self) -> bool {
        !matches!(self, Self::Text)
    }
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// `Ok(None)` for placeholder dates, `Err` for text that is not a date.
pub fn parse_halo_date(raw: &str) -> Result<Option<DateTime<Utc>>, String> {
    let parsed = parse_timestamp(raw).ok_or_else(|| format!("unparseable date {raw:?}"))?;
    Ok((parsed.year() > LAST_EMPTY_YEAR).then_some(parsed))
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Integer ids arrive as numbers, as floats such as `12.0`, or as strings.
pub fn parse_key(value: &JsonValue) -> Option<LookupKey> {
    match value {
        JsonValue::Number(number) => number.as_i64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.fract() == 0.0 && float.abs() < 9.0e15)
                .map(|float| float as i64)
        }),
        JsonValue::String(text) => {
            let text = text.trim();
            text.parse().ok().or_else(|| {
                text.parse::<f64>()
                    .ok()
                    .and_then(|float| parse_key(&JsonValue::from(float)))
            })
        }
        _ => None,
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(text) => text.trim().is_empty(),
        _ => false,
    }
}

fn as_bool(value: &JsonValue) -> Option<bool> {
    match value {
        JsonValue::Bool(flag) => Some(*flag),
        JsonValue::Number(number) => number.as_i64().map(|n| n != 0),
        _ => None,
    }
}

pub fn transcode(kind: FieldKind, raw: Option<&JsonValue>) -> Result<JsonValue, String> {
    let raw = raw.filter(|value| !value.is_null());
    let Some(value) = raw else {
        return Ok(match kind {
            FieldKind::Flag | FieldKind::NegatedFlag => JsonValue::Bool(false),
            _ => JsonValue::Null,
        });
    };

    match kind {
        FieldKind::Text => match value {
            JsonValue::String(_) => Ok(value.clone()),
            JsonValue::Number(number) => Ok(JsonValue::String(number.to_string())),
            JsonValue::Bool(flag) => Ok(JsonValue::String(flag.to_string())),
            other => Err(format!("expected text, got {other}")),
        },
        FieldKind::Integer => {
            if is_blank(value) {
                return Ok(JsonValue::Null);
            }
            parse_key(value)
                .map(JsonValue::from)
                .ok_or_else(|| format!("expected integer, got {value}"))
        }
        FieldKind::Float => {
            if is_blank(value) {
                return Ok(JsonValue::Null);
            }
            let float = match value {
                JsonValue::Number(number) => number.as_f64(),
                JsonValue::String(text) => text.trim().parse::<f64>().ok(),
                _ => None,
            };
            float
                .filter(|float| float.is_finite())
                .map(JsonValue::from)
                .ok_or_else(|| format!("expected number, got {value}"))
        }
        FieldKind::Flag | FieldKind::OptionalBool => as_bool(value)
            .map(JsonValue::Bool)
            .ok_or_else(|| format!("expected boolean, got {value}")),
        FieldKind::NegatedFlag => as_bool(value)
            .map(|flag| JsonValue::Bool(!flag))
            .ok_or_else(|| format!("expected boolean, got {value}")),
        FieldKind::Timestamp | FieldKind::HaloDate | FieldKind::HaloDay => {
            if is_blank(value) {
                return Ok(JsonValue::Null);
            }
            let text = value
                .as_str()
                .ok_or_else(|| format!("expected date text, got {value}"))?;
            let parsed = if kind == FieldKind::Timestamp {
                Some(parse_timestamp(text).ok_or_else(|| format!("unparseable timestamp {text:?}"))?)
            } else {
                parse_halo_date(text)?
            };
            Ok(match (kind, parsed) {
                (_, None) => JsonValue::Null,
                (FieldKind::HaloDay, Some(at)) => {
                    JsonValue::String(at.date_naive().format("%Y-%m-%d").to_string())
                }
                (_, Some(at)) => JsonValue::String(format_timestamp(at)),
            })
        }
    }
}
