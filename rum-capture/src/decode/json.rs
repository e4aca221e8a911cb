use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use super::{DecodeError, Precision};
use crate::point::{FieldValue, Measurement, Point};

#[derive(Deserialize)]
struct JsonPoint {
    measurement: String,
    #[serde(default)]
    tags: BTreeMap<String, String>,
    #[serde(default)]
    fields: BTreeMap<String, Value>,
    time: Option<i64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JsonBody {
    Batch(Vec<JsonPoint>),
    Single(JsonPoint),
}

fn field_value(key: &str, value: Value) -> Result<FieldValue, DecodeError> {
    match value {
        Value::Bool(b) => Ok(FieldValue::Bool(b)),
        Value::String(s) => Ok(FieldValue::String(s)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(FieldValue::Int(i))
            } else if let Some(u) = n.as_u64() {
                Ok(FieldValue::UInt(u))
            } else if let Some(f) = n.as_f64() {
                Ok(FieldValue::Float(f))
            } else {
                Err(DecodeError::InvalidJsonPoint(format!(
                    "field {key}: unsupported number {n}"
                )))
            }
        }
        Value::Null | Value::Array(_) | Value::Object(_) => Err(DecodeError::InvalidJsonPoint(
            format!("field {key}: only numbers, strings and booleans are allowed"),
        )),
    }
}

fn into_point(raw: JsonPoint, precision: Precision, now: i64) -> Result<Point, DecodeError> {
    let measurement: Measurement = raw.measurement.parse()?;
    let fields = raw
        .fields
        .into_iter()
        .map(|(k, v)| field_value(&k, v).map(|v| (k, v)))
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    let time = match raw.time {
        Some(ts) => precision.to_nanos(ts)?,
        None => now,
    };
    Point::new(measurement, raw.tags, fields, time)
        .map_err(|e| DecodeError::InvalidJsonPoint(e.to_string()))
}

pub fn decode_json(body: &[u8], precision: Precision, now: i64) -> Result<Vec<Point>, DecodeError> {
    let raw = match serde_json::from_slice::<JsonBody>(body)
        .map_err(|e| DecodeError::InvalidJsonPoint(e.to_string()))?
    {
        JsonBody::Batch(points) => points,
        JsonBody::Single(point) => vec![point],
    };
    raw.into_iter()
        .map(|p| into_point(p, precision, now))
        .collect()
}
