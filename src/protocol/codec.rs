//! Protocol codec
//!
//! Encoding and decoding functions for the wire protocol.
//!
//! ## Wire Format
//!
//! ### Frame Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Kind (1) │ Len (4)  │         Body                │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Body by Frame Kind
//! - REQUEST:   bincode(Request)
//! - ADMIN:     bincode(AdminCommand)
//! - DIRECTORY: empty
//! - PING:      empty
//!
//! ### Response Format
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │Status(1) │ Len (4)  │   bincode(Payload) or empty │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! Header errors (unknown kind, oversized length) leave the stream in an
//! unknown state and surface as `Protocol`; a body that fails to decode
//! surfaces as `MalformedRequest` and the stream stays usable.

use std::io::{Read, Write};

use bytes::{BufMut, BytesMut};

use crate::error::{CradleError, Result};
use super::{AdminCommand, Frame, FrameKind, Payload, Request, Response, Status};

/// Header size: 1 byte kind/status + 4 bytes length
pub const HEADER_SIZE: usize = 5;

/// Maximum body size (16 MB)
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

// =============================================================================
// Frame Encoding/Decoding
// =============================================================================

/// Encode a frame to bytes
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>> {
    let body = match frame {
        Frame::Request(request) => bincode::serialize(request)?,
        Frame::Admin(command) => bincode::serialize(command)?,
        Frame::Directory | Frame::Ping => Vec::new(),
    };
    Ok(with_header(frame.kind() as u8, &body))
}

/// Decode a complete frame from bytes
pub fn decode_frame(bytes: &[u8]) -> Result<Frame> {
    let (kind, body_len) = parse_header(bytes, "frame")?;
    let body = body_slice(bytes, body_len, "frame")?;
    decode_frame_body(kind, body)
}

fn decode_frame_body(kind: u8, body: &[u8]) -> Result<Frame> {
    match kind {
        k if k == FrameKind::Request as u8 => {
            let request: Request = bincode::deserialize(body).map_err(|e| {
                CradleError::MalformedRequest(format!("undecodable request body: {}", e))
            })?;
            request.validate()?;
            Ok(Frame::Request(request))
        }
        k if k == FrameKind::Admin as u8 => {
            let command: AdminCommand = bincode::deserialize(body).map_err(|e| {
                CradleError::MalformedRequest(format!("undecodable admin body: {}", e))
            })?;
            Ok(Frame::Admin(command))
        }
        k if k == FrameKind::Directory as u8 => expect_empty(body, "DIRECTORY", Frame::Directory),
        k if k == FrameKind::Ping as u8 => expect_empty(body, "PING", Frame::Ping),
        _ => Err(CradleError::Protocol(format!(
            "Unknown frame kind: 0x{:02x}",
            kind
        ))),
    }
}

fn expect_empty(body: &[u8], name: &str, frame: Frame) -> Result<Frame> {
    if !body.is_empty() {
        return Err(CradleError::MalformedRequest(format!(
            "{} frame: unexpected body of {} bytes",
            name,
            body.len()
        )));
    }
    Ok(frame)
}

// =============================================================================
// Response Encoding/Decoding
// =============================================================================

/// Encode a response to bytes
pub fn encode_response(response: &Response) -> Result<Vec<u8>> {
    let body = match &response.payload {
        Some(payload) => bincode::serialize(payload)?,
        None => Vec::new(),
    };
    Ok(with_header(response.status as u8, &body))
}

/// Decode a response from bytes
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let (status_byte, body_len) = parse_header(bytes, "response")?;
    let body = body_slice(bytes, body_len, "response")?;
    decode_response_body(status_byte, body)
}

fn decode_response_body(status_byte: u8, body: &[u8]) -> Result<Response> {
    let status = Status::from_byte(status_byte).ok_or_else(|| {
        CradleError::Protocol(format!("Unknown response status: 0x{:02x}", status_byte))
    })?;

    let payload = if body.is_empty() {
        None
    } else {
        let payload: Payload = bincode::deserialize(body)
            .map_err(|e| CradleError::Protocol(format!("undecodable response body: {}", e)))?;
        Some(payload)
    };

    Ok(Response { status, payload })
}

// =============================================================================
// Stream-based I/O helpers
// =============================================================================

/// Read a complete frame from a stream
///
/// Blocks until a complete frame is received or an error occurs
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame> {
    let (kind, body) = read_raw(reader, "frame")?;
    decode_frame_body(kind, &body)
}

/// Write a frame to a stream
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

/// Read a complete response from a stream
pub fn read_response<R: Read>(reader: &mut R) -> Result<Response> {
    let (status, body) = read_raw(reader, "response")?;
    decode_response_body(status, &body)
}

/// Write a response to a stream
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<()> {
    let bytes = encode_response(response)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}

// =============================================================================
// Private Helpers
// =============================================================================

fn with_header(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut message = BytesMut::with_capacity(HEADER_SIZE + body.len());
    message.put_u8(tag);
    message.put_u32(body.len() as u32);
    message.put_slice(body);
    message.to_vec()
}

fn parse_header(bytes: &[u8], what: &str) -> Result<(u8, usize)> {
    if bytes.len() < HEADER_SIZE {
        return Err(CradleError::Protocol(format!(
            "Incomplete {} header: expected {} bytes, got {}",
            what,
            HEADER_SIZE,
            bytes.len()
        )));
    }
    let body_len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    check_len(body_len, what)?;
    Ok((bytes[0], body_len as usize))
}

fn body_slice<'a>(bytes: &'a [u8], body_len: usize, what: &str) -> Result<&'a [u8]> {
    let total_len = HEADER_SIZE + body_len;
    if bytes.len() < total_len {
        return Err(CradleError::Protocol(format!(
            "Incomplete {} body: expected {} bytes, got {}",
            what,
            total_len,
            bytes.len()
        )));
    }
    Ok(&bytes[HEADER_SIZE..total_len])
}

fn check_len(body_len: u32, what: &str) -> Result<()> {
    if body_len > MAX_PAYLOAD_SIZE {
        return Err(CradleError::Protocol(format!(
            "{} body too large: {} bytes (max {})",
            what, body_len, MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}

fn read_raw<R: Read>(reader: &mut R, what: &str) -> Result<(u8, Vec<u8>)> {
    // Read header first
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header)?;

    let body_len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    check_len(body_len, what)?;

    // Read body
    let mut body = vec![0u8; body_len as usize];
    if body_len > 0 {
        reader.read_exact(&mut body)?;
    }
    Ok((header[0], body))
}
