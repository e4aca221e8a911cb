use std::collections::BTreeMap;

use prost::Message;

use super::{DecodeError, Precision};
use crate::point::{FieldValue, Measurement, Point};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbPoints {
    #[prost(message, repeated, tag = "1")]
    pub arr: Vec<PbPoint>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbPoint {
    #[prost(string, tag = "1")]
    pub name: String,
    /// Tags and fields, tags carry `is_tag` and a string value.
    #[prost(message, repeated, tag = "2")]
    pub fields: Vec<PbField>,
    /// Zero means the point has no time.
    #[prost(int64, tag = "5")]
    pub time: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PbField {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "pb_field::Val", tags = "2, 3, 4, 5, 6, 11")]
    pub val: Option<pb_field::Val>,
    #[prost(bool, tag = "8")]
    pub is_tag: bool,
}

pub mod pb_field {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Val {
        #[prost(int64, tag = "2")]
        I(i64),
        #[prost(uint64, tag = "3")]
        U(u64),
        #[prost(double, tag = "4")]
        F(f64),
        #[prost(bool, tag = "5")]
        B(bool),
        #[prost(bytes, tag = "6")]
        D(Vec<u8>),
        #[prost(string, tag = "11")]
        S(String),
    }
}

fn into_point(raw: PbPoint, precision: Precision, now: i64) -> Result<Point, DecodeError> {
    let measurement: Measurement = raw.name.parse()?;
    let mut tags = BTreeMap::new();
    let mut fields = BTreeMap::new();
    for field in raw.fields {
        let Some(val) = field.val else {
            return Err(DecodeError::InvalidProtobuf(format!("{} has no value", field.key)));
        };
        if field.is_tag {
            let pb_field::Val::S(value) = val else {
                return Err(DecodeError::InvalidProtobuf(format!(
                    "tag {} is not a string",
                    field.key
                )));
            };
            tags.insert(field.key, value);
            continue;
        }
        let value = match val {
            pb_field::Val::I(v) => FieldValue::Int(v),
            pb_field::Val::U(v) => FieldValue::UInt(v),
            pb_field::Val::F(v) => FieldValue::Float(v),
            pb_field::Val::B(v) => FieldValue::Bool(v),
            pb_field::Val::D(v) => FieldValue::Bytes(v),
            pb_field::Val::S(v) => FieldValue::String(v),
        };
        fields.insert(field.key, value);
    }
    let time = match raw.time {
        0 => now,
        ts => precision.to_nanos(ts)?,
    };
    Point::new(measurement, tags, fields, time)
        .map_err(|e| DecodeError::InvalidProtobuf(e.to_string()))
}

pub fn decode_protobuf(
    body: &[u8],
    precision: Precision,
    now: i64,
) -> Result<Vec<Point>, DecodeError> {
    let points =
        PbPoints::decode(body).map_err(|e| DecodeError::InvalidProtobuf(e.to_string()))?;
    points
        .arr
        .into_iter()
        .map(|p| into_point(p, precision, now))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(key: &str, val: pb_field::Val, is_tag: bool) -> PbField {
        PbField {
            key: key.to_string(),
            val: Some(val),
            is_tag,
        }
    }

    #[test]
    fn decodes_tags_and_fields() {
        let body = PbPoints {
            arr: vec![PbPoint {
                name: "resource".to_string(),
                fields: vec![
                    field("app_id", pb_field::Val::S("app_a".to_string()), true),
                    field("duration", pb_field::Val::I(31), false),
                    field("raw", pb_field::Val::D(vec![1, 2]), false),
                ],
                time: 0,
            }],
        }
        .encode_to_vec();

        let points = decode_protobuf(&body, Precision::Nanos, 9).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].measurement(), Measurement::Resource);
        assert_eq!(points[0].tag("app_id"), Some("app_a"));
        assert_eq!(points[0].field("duration"), Some(&FieldValue::Int(31)));
        assert_eq!(points[0].field("raw"), Some(&FieldValue::Bytes(vec![1, 2])));
        assert_eq!(points[0].time, 9);
    }

    #[test]
    fn rejects_non_string_tags() {
        let body = PbPoints {
            arr: vec![PbPoint {
                name: "view".to_string(),
                fields: vec![
                    field("app_id", pb_field::Val::I(1), true),
                    field("duration", pb_field::Val::I(1), false),
                ],
                time: 1,
            }],
        }
        .encode_to_vec();

        assert!(matches!(
            decode_protobuf(&body, Precision::Nanos, 0),
            Err(DecodeError::InvalidProtobuf(_))
        ));
        assert!(matches!(
            decode_protobuf(b"\xff\xff", Precision::Nanos, 0),
            Err(DecodeError::InvalidProtobuf(_))
        ));
    }
}
