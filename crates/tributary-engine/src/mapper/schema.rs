//! Type coercion into canonical field types

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Number, Value};

use crate::models::FieldType;

/// Parse an RFC 3339 string or a unix timestamp (seconds or milliseconds)
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            let raw = n.as_i64()?;
            // Anything past the year 2286 in seconds is treated as milliseconds.
            if raw.abs() >= 10_000_000_000 {
                Utc.timestamp_millis_opt(raw).single()
            } else {
                Utc.timestamp_opt(raw, 0).single()
            }
        }
        _ => None,
    }
}

/// Parse a timestamp with an explicit strftime pattern, interpreted as UTC
pub fn parse_timestamp_with(value: &Value, format: &str) -> Option<DateTime<Utc>> {
    let text = value.as_str()?;
    DateTime::parse_from_str(text, format)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(text, format).map(|naive| naive.and_utc()))
        .ok()
}

pub fn timestamp_value(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339())
}

fn float_value(f: f64) -> Result<Value, String> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| format!("{f} is not a finite number"))
}

/// Coerce `value` into `field_type`, or explain why it cannot be
pub fn coerce(value: Value, field_type: FieldType) -> Result<Value, String> {
    let mismatch = |v: &Value| format!("cannot convert {v} to {}", field_type.as_str());

    match field_type {
        FieldType::Any => Ok(value),
        FieldType::String => match value {
            Value::String(_) => Ok(value),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(mismatch(&other)),
        },
        FieldType::Integer => match &value {
            Value::Number(n) if n.is_i64() || n.is_u64() => Ok(value.clone()),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(Value::from(f as i64)),
                _ => Err(mismatch(&value)),
            },
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| mismatch(&value)),
            _ => Err(mismatch(&value)),
        },
        FieldType::Float => match &value {
            Value::Number(n) => n.as_f64().map(float_value).unwrap_or_else(|| Err(mismatch(&value))),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| mismatch(&value))
                .and_then(float_value),
            _ => Err(mismatch(&value)),
        },
        FieldType::Boolean => match &value {
            Value::Bool(_) => Ok(value.clone()),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Value::Bool(false)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Value::Bool(true)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                _ => Err(mismatch(&value)),
            },
            _ => Err(mismatch(&value)),
        },
        FieldType::Timestamp => parse_timestamp(&value)
            .map(timestamp_value)
            .ok_or_else(|| mismatch(&value)),
        FieldType::Array => match value {
            Value::Array(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        FieldType::Object => match value {
            Value::Object(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
    }
}

/// Whether `value` already has the shape of `field_type`
pub fn conforms(value: &Value, field_type: FieldType) -> bool {
    match field_type {
        FieldType::Any => true,
        FieldType::String => value.is_string(),
        FieldType::Integer => value.is_i64() || value.is_u64(),
        FieldType::Float => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Timestamp => value
            .as_str()
            .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
        FieldType::Array => value.is_array(),
        FieldType::Object => value.is_object(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_scalars() {
        assert_eq!(coerce(json!("42"), FieldType::Integer).unwrap(), json!(42));
        assert_eq!(coerce(json!(3.0), FieldType::Integer).unwrap(), json!(3));
        assert!(coerce(json!(3.5), FieldType::Integer).is_err());
        assert_eq!(coerce(json!(7), FieldType::String).unwrap(), json!("7"));
        assert_eq!(coerce(json!("yes"), FieldType::Boolean).unwrap(), json!(true));
        assert_eq!(coerce(json!("2.5"), FieldType::Float).unwrap(), json!(2.5));
        assert!(coerce(json!({"a": 1}), FieldType::String).is_err());
    }

    #[test]
    fn test_coerce_timestamps() {
        let from_epoch = coerce(json!(1_700_000_000), FieldType::Timestamp).unwrap();
        assert_eq!(from_epoch, json!("2023-11-14T22:13:20+00:00"));

        let from_millis = coerce(json!(1_700_000_000_000i64), FieldType::Timestamp).unwrap();
        assert_eq!(from_millis, from_epoch);

        let normalized = coerce(json!("2026-03-01T12:00:00+02:00"), FieldType::Timestamp).unwrap();
        assert_eq!(normalized, json!("2026-03-01T10:00:00+00:00"));
    }

    #[test]
    fn test_parse_with_format() {
        let at = parse_timestamp_with(&json!("01/03/2026 08:30"), "%d/%m/%Y %H:%M").unwrap();
        assert_eq!(at.to_rfc3339(), "2026-03-01T08:30:00+00:00");
    }

    #[test]
    fn test_conforms() {
        assert!(conforms(&json!(1), FieldType::Float));
        assert!(!conforms(&json!(1.5), FieldType::Integer));
        assert!(conforms(&json!("2026-01-01T00:00:00Z"), FieldType::Timestamp));
    }
}
