//! Database utility functions.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Number, Value};
use uuid::Uuid;

use crate::db::{ColumnDefinition, Generator};

/// Random (v4) uuid, hyphenated.
pub fn generate_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// Time-based (v1) uuid, hyphenated.
pub fn generate_time_uuid() -> String {
    let seed = Uuid::new_v4();
    let mut node_id = [0u8; 6];
    node_id.copy_from_slice(&seed.as_bytes()[..6]);
    Uuid::now_v1(&node_id).to_string()
}

/// Value assigned to an empty primary key field.
pub fn generate_key_value(column: &ColumnDefinition) -> Value {
    match column.options.generator {
        Some(Generator::Uuid) => Value::String(generate_uuid()),
        Some(Generator::TimeUuid) => Value::String(generate_time_uuid()),
        None if column.column_type.is_numeric() => Value::Number(Number::from(0)),
        None => Value::String(String::new()),
    }
}

/// Empty means missing, null, "", 0 or false.
pub fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Bool(b)) => !b,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::Array(_)) | Some(Value::Object(_)) => false,
    }
}

/// Milliseconds since the epoch, the in-record representation of dates.
pub fn current_timestamp_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// `on_upsert` hook refreshing a date column.
pub fn touch_timestamp(_current: &Value) -> Value {
    Value::Number(Number::from(current_timestamp_millis()))
}

pub fn millis_to_datetime(millis: i64) -> Option<NaiveDateTime> {
    DateTime::<Utc>::from_timestamp_millis(millis).map(|dt| dt.naive_utc())
}

pub fn datetime_to_millis(datetime: &NaiveDateTime) -> i64 {
    datetime.and_utc().timestamp_millis()
}

/// Human readable value used in log lines and cache keys.
pub fn value_to_key_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
