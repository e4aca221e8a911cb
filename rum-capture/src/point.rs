use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// The RUM measurements the collector accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Measurement {
    View,
    Resource,
    Action,
    LongTask,
    Error,
    Telemetry,
    Session,
}

/// Per-point enrichment steps, see `Measurement::enrichments`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enrichment {
    SourceMap,
    Provider,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown measurement: {0}")]
pub struct UnknownMeasurement(pub String);

impl Measurement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Measurement::View => "view",
            Measurement::Resource => "resource",
            Measurement::Action => "action",
            Measurement::LongTask => "long_task",
            Measurement::Error => "error",
            Measurement::Telemetry => "telemetry",
            Measurement::Session => "session",
        }
    }

    pub fn enrichments(&self) -> &'static [Enrichment] {
        match self {
            Measurement::Error => &[Enrichment::SourceMap],
            Measurement::Resource => &[Enrichment::Provider],
            Measurement::View
            | Measurement::Action
            | Measurement::LongTask
            | Measurement::Telemetry
            | Measurement::Session => &[],
        }
    }
}

impl FromStr for Measurement {
    type Err = UnknownMeasurement;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "view" => Ok(Measurement::View),
            "resource" => Ok(Measurement::Resource),
            "action" => Ok(Measurement::Action),
            // older SDKs send the name with a space
            "long_task" | "long task" => Ok(Measurement::LongTask),
            "error" => Ok(Measurement::Error),
            "telemetry" => Ok(Measurement::Telemetry),
            "session" => Ok(Measurement::Session),
            other => Err(UnknownMeasurement(other.to_string())),
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::UInt(v) => write!(f, "{v}"),
            FieldValue::Float(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::String(v) => f.write_str(v),
            FieldValue::Bytes(v) => f.write_str(&base64::engine::general_purpose::STANDARD.encode(v)),
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::String(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::String(value.to_string())
    }
}

impl Serialize for FieldValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Int(v) => serializer.serialize_i64(*v),
            FieldValue::UInt(v) => serializer.serialize_u64(*v),
            FieldValue::Float(v) => serializer.serialize_f64(*v),
            FieldValue::Bool(v) => serializer.serialize_bool(*v),
            FieldValue::String(v) => serializer.serialize_str(v),
            FieldValue::Bytes(v) => {
                serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(v))
            }
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PointError {
    #[error("point {0} holds no field")]
    NoFields(Measurement),
}

/// A decoded RUM point. The measurement is fixed at creation, tags and
/// fields grow during enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: Measurement,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    /// Nanoseconds since the unix epoch
    pub time: i64,
}

impl Point {
    pub fn new(
        measurement: Measurement,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        time: i64,
    ) -> Result<Self, PointError> {
        if fields.is_empty() {
            return Err(PointError::NoFields(measurement));
        }
        Ok(Self {
            measurement,
            tags,
            fields,
            time,
        })
    }

    pub fn measurement(&self) -> Measurement {
        self.measurement
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn field(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    pub fn add_field(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Sets the tag unless the client already sent one.
    pub fn add_tag_if_absent(&mut self, key: &str, value: &str) {
        if !self.tags.contains_key(key) {
            self.tags.insert(key.to_string(), value.to_string());
        }
    }
}

impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Point", 4)?;
        state.serialize_field("measurement", self.measurement.as_str())?;
        state.serialize_field("tags", &self.tags)?;
        state.serialize_field("fields", &self.fields)?;
        state.serialize_field("time", &self.time)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn measurement_names() {
        assert_eq!("long task".parse(), Ok(Measurement::LongTask));
        assert_eq!("long_task".parse(), Ok(Measurement::LongTask));
        assert_eq!(Measurement::LongTask.as_str(), "long_task");
        assert_eq!(
            "click".parse::<Measurement>(),
            Err(UnknownMeasurement("click".to_string()))
        );
    }

    #[test]
    fn enrichment_table() {
        assert_eq!(Measurement::Error.enrichments(), &[Enrichment::SourceMap]);
        assert_eq!(Measurement::Resource.enrichments(), &[Enrichment::Provider]);
        assert!(Measurement::View.enrichments().is_empty());
    }

    #[test]
    fn point_requires_fields() {
        let res = Point::new(Measurement::View, BTreeMap::new(), BTreeMap::new(), 0);
        assert_eq!(res, Err(PointError::NoFields(Measurement::View)));
    }

    #[test]
    fn client_tags_win_over_added_ones() {
        let mut point = Point::new(
            Measurement::View,
            BTreeMap::from([("city".to_string(), "Lyon".to_string())]),
            BTreeMap::from([("duration".to_string(), FieldValue::Int(12))]),
            1,
        )
        .unwrap();

        point.add_tag_if_absent("city", "unknown");
        point.add_tag_if_absent("country", "FR");

        assert_eq!(point.tag("city"), Some("Lyon"));
        assert_eq!(point.tag("country"), Some("FR"));
    }

    #[test]
    fn serializes_bytes_as_base64() {
        let point = Point::new(
            Measurement::Error,
            BTreeMap::new(),
            BTreeMap::from([
                ("raw".to_string(), FieldValue::Bytes(b"hi".to_vec())),
                ("count".to_string(), FieldValue::UInt(3)),
            ]),
            42,
        )
        .unwrap();

        assert_eq!(
            serde_json::to_value(&point).unwrap(),
            json!({
                "measurement": "error",
                "tags": {},
                "fields": {"count": 3, "raw": "aGk="},
                "time": 42
            })
        );
    }
}
