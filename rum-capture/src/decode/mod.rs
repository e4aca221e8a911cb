//! Decoding of RUM write payloads into `Point`s.
//!
//! Three encodings are accepted, picked from the `Content-Type` header:
//! JSON arrays of points, protobuf `PbPoints` and, by default, line protocol.

use std::str::FromStr;

use thiserror::Error;

use crate::point::{Point, UnknownMeasurement};

mod json;
mod line_protocol;
pub mod pb;

pub use json::decode_json;
pub use line_protocol::decode_line_protocol;
pub use pb::decode_protobuf;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid precision: {0}")]
    InvalidPrecision(String),
    #[error("line {line}: {reason}")]
    InvalidLineProtocol { line: usize, reason: String },
    #[error("invalid JSON point: {0}")]
    InvalidJsonPoint(String),
    #[error("invalid protobuf points: {0}")]
    InvalidProtobuf(String),
    #[error(transparent)]
    UnknownMeasurement(#[from] UnknownMeasurement),
    #[error("timestamp {0} overflows nanoseconds")]
    TimestampOverflow(i64),
}

/// Unit of the timestamps sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precision {
    Hours,
    Minutes,
    Seconds,
    Millis,
    Micros,
    #[default]
    Nanos,
}

impl Precision {
    fn nanos_per_unit(&self) -> i64 {
        match self {
            Precision::Hours => 3_600_000_000_000,
            Precision::Minutes => 60_000_000_000,
            Precision::Seconds => 1_000_000_000,
            Precision::Millis => 1_000_000,
            Precision::Micros => 1_000,
            Precision::Nanos => 1,
        }
    }

    pub fn to_nanos(&self, timestamp: i64) -> Result<i64, DecodeError> {
        timestamp
            .checked_mul(self.nanos_per_unit())
            .ok_or(DecodeError::TimestampOverflow(timestamp))
    }
}

impl FromStr for Precision {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h" => Ok(Precision::Hours),
            "m" => Ok(Precision::Minutes),
            "s" => Ok(Precision::Seconds),
            "ms" => Ok(Precision::Millis),
            "u" => Ok(Precision::Micros),
            "n" => Ok(Precision::Nanos),
            other => Err(DecodeError::InvalidPrecision(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Protobuf,
    LineProtocol,
}

impl Encoding {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some(ct) if ct.contains("application/json") => Encoding::Json,
            Some(ct) if ct.contains("protobuf") => Encoding::Protobuf,
            _ => Encoding::LineProtocol,
        }
    }
}

/// Decodes a body, `now` is stamped on points sent without a time.
pub fn decode(
    body: &[u8],
    encoding: Encoding,
    precision: Precision,
    now: i64,
) -> Result<Vec<Point>, DecodeError> {
    match encoding {
        Encoding::Json => decode_json(body, precision, now),
        Encoding::Protobuf => decode_protobuf(body, precision, now),
        Encoding::LineProtocol => {
            let body = std::str::from_utf8(body).map_err(|e| DecodeError::InvalidLineProtocol {
                line: 0,
                reason: format!("body is not UTF-8: {e}"),
            })?;
            decode_line_protocol(body, precision, now)
        }
    }
}
