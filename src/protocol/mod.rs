//! Protocol Module
//!
//! Defines the wire protocol spoken by clients and peer hosts.
//!
//! ## Protocol Format (V1 - Framed Binary)
//!
//! ### Frame Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Kind (1) │ Len (4)  │         Body                │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Frames
//! - 0x01: REQUEST   - Body: {op, key, value?, filter?, hop_count}
//! - 0x02: ADMIN     - Body: lifecycle command
//! - 0x03: DIRECTORY - Body: empty
//! - 0x04: PING      - Body: empty
//!
//! ### Status Codes
//! - 0x00: OK
//! - 0x01: NOT_FOUND
//! - 0x02: RANGE_MISMATCH
//! - 0x03: ERROR
//! - 0x04: ROUTING_LOOP
//! - 0x05: TIMEOUT
//! - 0x06: CONNECTION_FAILURE
//! - 0x07: MALFORMED
//! - 0x08: CONFLICT
//! - 0x09: UNAVAILABLE

mod codec;
mod request;
mod response;

pub use codec::{
    decode_frame, decode_response, encode_frame, encode_response, read_frame, read_response,
    write_frame, write_response, HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use request::{AdminCommand, Frame, FrameKind, ListFilter, Operation, Request, MAX_KEY_SIZE};
pub use response::{Payload, Response, Status};
