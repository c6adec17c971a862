//! Serialized HTTP response snapshots.
//!
//! An [`Envelope`] is the storable form of a captured response: optional
//! status code, header pairs in emission order, and the body bytes. The
//! binary encoding follows protocol-buffer wire rules with the schema
//!
//! ```text
//! message Response {
//!     optional int32  code    = 1;
//!     repeated Header headers = 2;   // message Header { string key = 1; string value = 2; }
//!     optional bytes  body    = 3;
//! }
//! ```
//!
//! Unknown fields are skipped on decode, so envelopes written by a newer
//! revision with extra trailing fields still parse.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::capture::{Recorder, ResponseWriter, SinkError};
use crate::http::{Headers, Response, StatusCode};

// Field numbers of the envelope message.
const FIELD_CODE: u32 = 1;
const FIELD_HEADER: u32 = 2;
const FIELD_BODY: u32 = 3;

// Field numbers of the nested header message.
const FIELD_HEADER_KEY: u32 = 1;
const FIELD_HEADER_VALUE: u32 = 2;

// Protobuf wire types.
const WIRE_VARINT: u32 = 0;
const WIRE_FIXED64: u32 = 1;
const WIRE_LEN: u32 = 2;
const WIRE_FIXED32: u32 = 5;

/// Errors from decoding stored envelope bytes.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("envelope bytes truncated")]
    Truncated,

    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    #[error("unsupported wire type {0}")]
    UnsupportedWireType(u32),

    #[error("length prefix {0} exceeds remaining input")]
    LengthOutOfBounds(u64),

    #[error("status code {0} does not fit in 32 bits")]
    StatusOutOfRange(u64),

    #[error("header field is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Errors from replaying a decoded envelope onto a response sink.
#[derive(Debug, Error)]
pub enum ReplayError {
    /// The stored status has no `StatusCode` representation.
    #[error("stored status code {0} is not a valid HTTP status")]
    InvalidStatus(u32),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// A serializable snapshot of an HTTP response.
///
/// Round-trip fidelity is the contract: capture, encode, decode, and replay
/// must reproduce the identical status, header sequence, and body bytes.
///
/// # Examples
///
/// ```
/// use servecache::envelope::Envelope;
/// use servecache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("X-Id", "7")
///     .body("cached body");
///
/// let envelope = Envelope::capture(&response).unwrap();
/// let bytes = envelope.encode();
/// let decoded = Envelope::decode(&bytes).unwrap();
/// assert_eq!(decoded, envelope);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    status_code: Option<u32>,
    headers: Headers,
    body: Bytes,
}

impl Envelope {
    /// Assembles an envelope from already-captured parts.
    pub fn from_parts(status_code: Option<u32>, headers: Headers, body: Bytes) -> Self {
        Self {
            status_code,
            headers,
            body,
        }
    }

    /// Captures a live [`Response`] into an envelope via a fresh [`Recorder`].
    ///
    /// # Errors
    ///
    /// Returns [`SinkError`] if the response emission violates the sink
    /// protocol; with a fresh recorder this indicates a bug in `write_to`.
    pub fn capture(response: &Response) -> Result<Self, SinkError> {
        let mut recorder = Recorder::new();
        response.write_to(&mut recorder)?;
        Ok(recorder.into_envelope())
    }

    /// The stored status code, if one was explicitly written.
    pub fn status_code(&self) -> Option<u32> {
        self.status_code
    }

    /// The stored header pairs, in original emission order.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter()
    }

    /// The stored body bytes.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replays this envelope onto a response sink: headers in original order,
    /// then the status (defaulting to `200 OK` when absent), then the body.
    ///
    /// # Errors
    ///
    /// - [`ReplayError::InvalidStatus`] — the stored code has no
    ///   [`StatusCode`] representation (foreign or corrupt producer).
    /// - [`ReplayError::Sink`] — the sink rejected a write.
    pub fn replay<W: ResponseWriter>(&self, sink: &mut W) -> Result<(), ReplayError> {
        let status = match self.status_code {
            None => StatusCode::Ok,
            Some(code) => u16::try_from(code)
                .ok()
                .and_then(StatusCode::from_u16)
                .ok_or(ReplayError::InvalidStatus(code))?,
        };

        for (name, value) in self.headers.iter() {
            sink.append_header(name, value)?;
        }
        sink.write_status(status)?;
        sink.write_body(&self.body)?;
        Ok(())
    }

    /// Replays into a fresh [`Response`], ready to hand back to a caller.
    pub fn into_response(self) -> Result<Response, ReplayError> {
        let mut recorder = Recorder::new();
        self.replay(&mut recorder)?;
        Ok(recorder.into_response())
    }

    /// Encodes the envelope into its binary wire form.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 + self.headers.len() * 32 + self.body.len());

        if let Some(code) = self.status_code {
            put_tag(&mut buf, FIELD_CODE, WIRE_VARINT);
            put_uvarint(&mut buf, u64::from(code));
        }

        for (name, value) in self.headers.iter() {
            put_tag(&mut buf, FIELD_HEADER, WIRE_LEN);
            let inner_len = len_delimited_size(FIELD_HEADER_KEY, name.len())
                + len_delimited_size(FIELD_HEADER_VALUE, value.len());
            put_uvarint(&mut buf, inner_len as u64);
            put_string_field(&mut buf, FIELD_HEADER_KEY, name);
            put_string_field(&mut buf, FIELD_HEADER_VALUE, value);
        }

        if !self.body.is_empty() {
            put_tag(&mut buf, FIELD_BODY, WIRE_LEN);
            put_uvarint(&mut buf, self.body.len() as u64);
            buf.extend_from_slice(&self.body);
        }

        buf.freeze()
    }

    /// Decodes an envelope from its binary wire form.
    ///
    /// Unknown field numbers are skipped; absent fields fall back to their
    /// defaults (no status, no headers, empty body).
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for truncated input, oversized varints,
    /// out-of-bounds length prefixes, non-UTF-8 header strings, or wire
    /// types this codec cannot skip.
    pub fn decode(mut input: &[u8]) -> Result<Self, DecodeError> {
        let mut status_code = None;
        let mut headers = Headers::new();
        let mut body = Bytes::new();

        while !input.is_empty() {
            let (field, wire) = get_tag(&mut input)?;
            match (field, wire) {
                (FIELD_CODE, WIRE_VARINT) => {
                    let raw = get_uvarint(&mut input)?;
                    status_code =
                        Some(u32::try_from(raw).map_err(|_| DecodeError::StatusOutOfRange(raw))?);
                }
                (FIELD_HEADER, WIRE_LEN) => {
                    let chunk = get_len_delimited(&mut input)?;
                    let (name, value) = decode_header(chunk)?;
                    headers.append(name, value);
                }
                (FIELD_BODY, WIRE_LEN) => {
                    let chunk = get_len_delimited(&mut input)?;
                    body = Bytes::copy_from_slice(chunk);
                }
                (_, wire) => skip_field(&mut input, wire)?,
            }
        }

        Ok(Self {
            status_code,
            headers,
            body,
        })
    }
}

/// Decodes one nested header message into its key and value strings.
fn decode_header(mut input: &[u8]) -> Result<(String, String), DecodeError> {
    let mut key = String::new();
    let mut value = String::new();

    while !input.is_empty() {
        let (field, wire) = get_tag(&mut input)?;
        match (field, wire) {
            (FIELD_HEADER_KEY, WIRE_LEN) => {
                key = String::from_utf8(get_len_delimited(&mut input)?.to_vec())?;
            }
            (FIELD_HEADER_VALUE, WIRE_LEN) => {
                value = String::from_utf8(get_len_delimited(&mut input)?.to_vec())?;
            }
            (_, wire) => skip_field(&mut input, wire)?,
        }
    }

    Ok((key, value))
}

// ── Wire primitives ──────────────────────────────────────────────────────────

fn put_tag(buf: &mut BytesMut, field: u32, wire: u32) {
    put_uvarint(buf, u64::from(field << 3 | wire));
}

fn put_uvarint(buf: &mut BytesMut, mut v: u64) {
    while v >= 0x80 {
        buf.extend_from_slice(&[(v as u8) | 0x80]);
        v >>= 7;
    }
    buf.extend_from_slice(&[v as u8]);
}

fn put_string_field(buf: &mut BytesMut, field: u32, s: &str) {
    put_tag(buf, field, WIRE_LEN);
    put_uvarint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// Size of a length-delimited field: tag byte, length varint, payload.
///
/// Field numbers here fit in a single tag byte.
fn len_delimited_size(_field: u32, payload: usize) -> usize {
    1 + uvarint_size(payload as u64) + payload
}

fn uvarint_size(v: u64) -> usize {
    let bits = 64 - v.max(1).leading_zeros() as usize;
    bits.div_ceil(7)
}

fn get_uvarint(input: &mut &[u8]) -> Result<u64, DecodeError> {
    let mut value: u64 = 0;
    let mut shift = 0;
    loop {
        let (&byte, rest) = input.split_first().ok_or(DecodeError::Truncated)?;
        *input = rest;
        if shift >= 64 {
            return Err(DecodeError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn get_tag(input: &mut &[u8]) -> Result<(u32, u32), DecodeError> {
    let tag = get_uvarint(input)? as u32;
    Ok((tag >> 3, tag & 0x7))
}

fn get_len_delimited<'a>(input: &mut &'a [u8]) -> Result<&'a [u8], DecodeError> {
    let len = get_uvarint(input)?;
    let len_usize = usize::try_from(len).map_err(|_| DecodeError::LengthOutOfBounds(len))?;
    if len_usize > input.len() {
        return Err(DecodeError::LengthOutOfBounds(len));
    }
    let (chunk, rest) = input.split_at(len_usize);
    *input = rest;
    Ok(chunk)
}

/// Skips a field with an unknown number, keeping decode forward-compatible.
fn skip_field(input: &mut &[u8], wire: u32) -> Result<(), DecodeError> {
    match wire {
        WIRE_VARINT => {
            get_uvarint(input)?;
        }
        WIRE_LEN => {
            get_len_delimited(input)?;
        }
        WIRE_FIXED64 => {
            if input.len() < 8 {
                return Err(DecodeError::Truncated);
            }
            *input = &input[8..];
        }
        WIRE_FIXED32 => {
            if input.len() < 4 {
                return Err(DecodeError::Truncated);
            }
            *input = &input[4..];
        }
        other => return Err(DecodeError::UnsupportedWireType(other)),
    }
    Ok(())
}
