//! ---
//! shem_section: "02-module-messaging"
//! shem_subsection: "module"
//! shem_type: "source"
//! shem_scope: "code"
//! shem_description: "Message validation, parsing, and encoding for module communication."
//! shem_version: "v0.1.0"
//! shem_owner: "tbd"
//! ---
//! Validation, parsing, and encoding of the SHEM module message protocol.
//!
//! A message on the wire is a header line `TYPE NAME` followed by payload
//! lines, framed by blank lines on both sides. The accepted character set is
//! printable ASCII plus newline; values are decimal numbers with at most 8
//! integer and 3 fraction digits, rendered canonically with exactly 3
//! fraction digits, or the literal `missing`.

mod message;
mod name;
mod stream;
mod value;

use thiserror::Error;

pub use message::{Message, Payload, PointValue, TimeSeries};
pub use name::{split_name, validate_name, validate_name_part};
pub use stream::{MessageReader, MessageWriter};
pub use value::Value;

/// Maximum length of a name component.
pub const MAX_NAME_LENGTH: usize = 100;
/// Maximum message body size in bytes, excluding the separating blank lines.
pub const MAX_MESSAGE_BYTES: usize = 10_000;
/// Grid step of timeseries start times, in minutes.
pub const TIME_STEP_MINUTES: u32 = 5;

/// Errors produced while validating, parsing, or encoding messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid variable name: {0}")]
    InvalidName(String),
    #[error("invalid numeric value: {0:?}")]
    InvalidValue(String),
    #[error("value outside allowed range")]
    ValueOutOfRange,
    #[error("invalid or misaligned timestamp: {0:?}")]
    InvalidTimestamp(String),
    #[error("unknown message type: {0:?}")]
    UnknownType(String),
    #[error("message exceeds maximum size")]
    MessageTooLarge,
    #[error("empty message")]
    EmptyMessage,
    #[error("pointvalue requires exactly one value line")]
    MissingValue,
    #[error("timeseries requires timestamp and at least one value")]
    MissingTimestamp,
    #[error("message contains invalid characters")]
    InvalidCharacters,
    #[error("expected 'type name' header, got {0:?}")]
    MalformedHeader(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
