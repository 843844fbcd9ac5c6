//! Replaces Unix timestamps embedded in OpenWeather payloads with local-time
//! strings, using the UTC offset the payload itself carries.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats `timestamp` as wall-clock time at `offset_secs` east of UTC.
pub fn format_local(timestamp: i64, offset_secs: i32) -> Option<String> {
    let offset = FixedOffset::east_opt(offset_secs)?;
    let utc = DateTime::from_timestamp(timestamp, 0)?;
    Some(utc.with_timezone(&offset).format(TIMESTAMP_FORMAT).to_string())
}

pub fn format_utc(timestamp: i64) -> String {
    format_local(timestamp, 0).unwrap_or_else(|| timestamp.to_string())
}

/// Current-conditions payload: `dt`, `sys.sunrise` and `sys.sunset`, shifted
/// by the top-level `timezone`.
pub fn normalize_current(payload: &mut Value) {
    let Some(offset) = offset_at(payload, "/timezone") else {
        return;
    };

    for pointer in ["/dt", "/sys/sunrise", "/sys/sunset"] {
        replace_timestamp(payload, pointer, offset);
    }
}

/// Forecast payload: `city.sunrise`, `city.sunset` and every `list[].dt`,
/// shifted by `city.timezone`.
pub fn normalize_forecast(payload: &mut Value) {
    let Some(offset) = offset_at(payload, "/city/timezone") else {
        return;
    };

    for pointer in ["/city/sunrise", "/city/sunset"] {
        replace_timestamp(payload, pointer, offset);
    }

    if let Some(items) = payload.get_mut("list").and_then(Value::as_array_mut) {
        for item in items {
            replace_timestamp(item, "/dt", offset);
        }
    }
}

fn offset_at(payload: &Value, pointer: &str) -> Option<i32> {
    payload
        .pointer(pointer)
        .and_then(Value::as_i64)
        .and_then(|offset| i32::try_from(offset).ok())
}

fn replace_timestamp(payload: &mut Value, pointer: &str, offset_secs: i32) {
    let Some(field) = payload.pointer_mut(pointer) else {
        return;
    };
    let Some(formatted) = field.as_i64().and_then(|ts| format_local(ts, offset_secs)) else {
        return;
    };
    *field = Value::String(formatted);
}
