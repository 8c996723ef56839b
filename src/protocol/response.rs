//! Response definitions
//!
//! Represents responses to clients and peer hosts.

use serde::{Deserialize, Serialize};

use crate::error::CradleError;
use crate::keyspace::Directory;
use crate::storage::Record;

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    NotFound = 0x01,
    RangeMismatch = 0x02,
    Error = 0x03,
    RoutingLoop = 0x04,
    Timeout = 0x05,
    ConnectionFailure = 0x06,
    Malformed = 0x07,
    Conflict = 0x08,
    Unavailable = 0x09,
}

impl Status {
    pub fn from_byte(byte: u8) -> Option<Self> {
        let status = match byte {
            0x00 => Status::Ok,
            0x01 => Status::NotFound,
            0x02 => Status::RangeMismatch,
            0x03 => Status::Error,
            0x04 => Status::RoutingLoop,
            0x05 => Status::Timeout,
            0x06 => Status::ConnectionFailure,
            0x07 => Status::Malformed,
            0x08 => Status::Conflict,
            0x09 => Status::Unavailable,
            _ => return None,
        };
        Some(status)
    }
}

impl From<&CradleError> for Status {
    fn from(err: &CradleError) -> Self {
        match err {
            CradleError::NotFound => Status::NotFound,
            CradleError::RangeMismatch { .. } => Status::RangeMismatch,
            CradleError::RoutingLoop { .. } => Status::RoutingLoop,
            CradleError::Timeout(_) => Status::Timeout,
            CradleError::ConnectionFailure { .. } => Status::ConnectionFailure,
            CradleError::MalformedRequest(_) => Status::Malformed,
            CradleError::RangeConflict(_)
            | CradleError::MigrationConflict(_)
            | CradleError::UnknownNode(_) => Status::Conflict,
            CradleError::Unavailable(_) | CradleError::Shutdown => Status::Unavailable,
            CradleError::Remote { status, .. } => *status,
            _ => Status::Error,
        }
    }
}

/// Response body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Value for GET
    Value(Vec<u8>),

    /// Records for LIST; `resume` is where a follow-up LIST continues
    Records {
        records: Vec<Record>,
        resume: Option<Vec<u8>>,
    },

    /// Human-readable text (errors, admin acknowledgements, PONG)
    Message(String),

    /// Snapshot answering a DIRECTORY frame
    Directory(Directory),
}

/// A response to send back along the originating connection
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Status code
    pub status: Status,

    /// Optional payload
    pub payload: Option<Payload>,
}

impl Response {
    /// Create an OK response with optional payload
    pub fn ok(payload: Option<Payload>) -> Self {
        Self {
            status: Status::Ok,
            payload,
        }
    }

    pub fn value(value: Vec<u8>) -> Self {
        Self::ok(Some(Payload::Value(value)))
    }

    pub fn records(records: Vec<Record>, resume: Option<Vec<u8>>) -> Self {
        Self::ok(Some(Payload::Records { records, resume }))
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::ok(Some(Payload::Message(text.into())))
    }

    /// Create a NOT_FOUND response
    pub fn not_found() -> Self {
        Self {
            status: Status::NotFound,
            payload: None,
        }
    }

    /// Create an ERROR response
    pub fn error(message: &str) -> Self {
        Self {
            status: Status::Error,
            payload: Some(Payload::Message(message.to_string())),
        }
    }

    /// Typed error response carrying the error text
    pub fn from_error(err: &CradleError) -> Self {
        let status = Status::from(err);
        let message = match err {
            // Keep relayed text as-is instead of nesting "Remote ..." prefixes
            CradleError::Remote { message, .. } => message.clone(),
            _ => err.to_string(),
        };
        match status {
            Status::NotFound => Self::not_found(),
            _ => Self {
                status,
                payload: Some(Payload::Message(message)),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    /// Turn a non-OK response back into an error
    pub fn into_result(self) -> crate::error::Result<Option<Payload>> {
        match self.status {
            Status::Ok => Ok(self.payload),
            Status::NotFound => Err(CradleError::NotFound),
            status => {
                let message = match self.payload {
                    Some(Payload::Message(text)) => text,
                    _ => format!("{:?}", status),
                };
                Err(CradleError::Remote { status, message })
            }
        }
    }
}
