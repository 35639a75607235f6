//! ---
//! shem_section: "02-module-messaging"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Message model, parsing, and canonical encoding."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};

use crate::name::validate_name;
use crate::value::{parse_value, Value};
use crate::{CodecError, MAX_MESSAGE_BYTES, TIME_STEP_MINUTES};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// A single measurement at the current time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointValue {
    pub value: Value,
}

/// A sequence of values on the 5-minute grid starting at `start_time`.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeries {
    pub start_time: DateTime<Utc>,
    pub values: Vec<Value>,
}

/// The payload carried by a message. Future payload shapes are additive: a
/// new variant with its own type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    PointValue(PointValue),
    TimeSeries(TimeSeries),
}

impl Payload {
    /// The wire type identifier.
    pub fn type_str(&self) -> &'static str {
        match self {
            Payload::PointValue(_) => "pointvalue",
            Payload::TimeSeries(_) => "timeseries",
        }
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Payload::PointValue(point) => {
                buf.extend_from_slice(point.value.to_string().as_bytes());
            }
            Payload::TimeSeries(series) => {
                buf.extend_from_slice(
                    series
                        .start_time
                        .format(TIMESTAMP_FORMAT)
                        .to_string()
                        .as_bytes(),
                );
                for value in &series.values {
                    buf.push(b'\n');
                    buf.extend_from_slice(value.to_string().as_bytes());
                }
            }
        }
    }
}

/// A parsed message: a (possibly qualified) name and a payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub name: String,
    pub payload: Payload,
}

impl Message {
    /// Convenience constructor for a pointvalue message.
    pub fn point(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            payload: Payload::PointValue(PointValue { value }),
        }
    }

    /// The wire type identifier of the payload.
    pub fn type_str(&self) -> &'static str {
        self.payload.type_str()
    }

    /// A copy of the message with a different name.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: self.payload.clone(),
        }
    }

    /// Encode the message body in canonical format, without the surrounding
    /// blank lines.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.payload.type_str().as_bytes());
        buf.push(b' ');
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(b'\n');
        self.payload.encode_into(&mut buf);
        buf
    }

    /// Encode the message with the blank-line framing on both sides.
    pub fn encode_framed(&self) -> Vec<u8> {
        let body = self.encode();
        let mut buf = Vec::with_capacity(body.len() + 4);
        buf.extend_from_slice(b"\n\n");
        buf.extend_from_slice(&body);
        buf.extend_from_slice(b"\n\n");
        buf
    }

    /// Parse a single message body. The input should not include the
    /// surrounding blank lines.
    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() > MAX_MESSAGE_BYTES {
            return Err(CodecError::MessageTooLarge);
        }

        if !is_printable_ascii(data) {
            return Err(CodecError::InvalidCharacters);
        }

        let text = std::str::from_utf8(data).map_err(|_| CodecError::InvalidCharacters)?;
        let mut lines: Vec<&str> = text.split('\n').collect();

        while lines.last() == Some(&"") {
            lines.pop();
        }

        if lines.is_empty() {
            return Err(CodecError::EmptyMessage);
        }

        let mut header = lines[0].split_whitespace();
        let (msg_type, name) = match (header.next(), header.next(), header.next()) {
            (Some(msg_type), Some(name), None) => (msg_type, name),
            _ => return Err(CodecError::MalformedHeader(lines[0].to_owned())),
        };

        validate_name(name)?;

        let payload = match msg_type {
            "pointvalue" => parse_point_value(&lines[1..])?,
            "timeseries" => parse_time_series(&lines[1..])?,
            other => return Err(CodecError::UnknownType(other.to_owned())),
        };

        Ok(Self {
            name: name.to_owned(),
            payload,
        })
    }
}

/// All bytes printable ASCII (0x20-0x7E) or newline.
fn is_printable_ascii(data: &[u8]) -> bool {
    data.iter().all(|&b| b == b'\n' || (0x20..=0x7E).contains(&b))
}

fn parse_point_value(lines: &[&str]) -> Result<Payload, CodecError> {
    if lines.len() != 1 {
        return Err(CodecError::MissingValue);
    }
    let value = parse_value(lines[0])?;
    Ok(Payload::PointValue(PointValue { value }))
}

fn parse_time_series(lines: &[&str]) -> Result<Payload, CodecError> {
    if lines.len() < 2 {
        return Err(CodecError::MissingTimestamp);
    }

    let start_time = NaiveDateTime::parse_from_str(lines[0], TIMESTAMP_FORMAT)
        .map_err(|_| CodecError::InvalidTimestamp(lines[0].to_owned()))?
        .and_utc();

    if start_time.minute() % TIME_STEP_MINUTES != 0 {
        return Err(CodecError::InvalidTimestamp(lines[0].to_owned()));
    }

    let values = lines[1..]
        .iter()
        .map(|line| parse_value(line))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Payload::TimeSeries(TimeSeries { start_time, values }))
}
