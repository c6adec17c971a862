//! In-memory response capture.
//!
//! A miss-triggered handler invocation must not touch the live connection:
//! its output is recorded first, stored, and only then replayed. This module
//! defines the sink protocol handlers' output flows through —
//! [`ResponseWriter`] — and the buffering implementation, [`Recorder`].
//!
//! The sink protocol mirrors HTTP emission semantics:
//!
//! 1. header appends, any number, while the status is still open;
//! 2. the status, exactly once;
//! 3. body writes.
//!
//! Violations are reported as [`SinkError`] values rather than panics; they
//! indicate a bug in the emitting code and fail that single request.

use bytes::BytesMut;
use thiserror::Error;

use crate::envelope::Envelope;
use crate::http::{Headers, Response, StatusCode};

/// Sink protocol violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The status was written a second time.
    #[error("response status written twice")]
    StatusAlreadySent,

    /// A header arrived after the status had been finalized.
    #[error("header {name:?} written after the status was sent")]
    HeaderAfterStatus { name: String },
}

/// A sink for the parts of an HTTP response, in emission order.
///
/// Implemented by [`Recorder`] for both directions of the cache: capturing a
/// fresh handler response into an envelope, and assembling a stored envelope
/// back into a [`Response`].
pub trait ResponseWriter {
    /// Appends a header entry. Only valid before [`write_status`](Self::write_status).
    fn append_header(&mut self, name: &str, value: &str) -> Result<(), SinkError>;

    /// Finalizes the status. Valid exactly once.
    fn write_status(&mut self, status: StatusCode) -> Result<(), SinkError>;

    /// Appends a chunk of body bytes.
    ///
    /// Writing a body without a prior status is allowed; the response then
    /// replays with the default `200 OK`, mirroring standard HTTP semantics.
    fn write_body(&mut self, chunk: &[u8]) -> Result<(), SinkError>;
}

/// A [`ResponseWriter`] that buffers everything in memory.
///
/// Nothing written here is visible outside the buffer; the live client never
/// observes intermediate state from a miss-triggered computation.
///
/// # Examples
///
/// ```
/// use servecache::capture::{Recorder, ResponseWriter};
/// use servecache::http::StatusCode;
///
/// let mut rec = Recorder::new();
/// rec.append_header("X-Trace", "abc").unwrap();
/// rec.write_status(StatusCode::Ok).unwrap();
/// rec.write_body(b"hello").unwrap();
///
/// let envelope = rec.into_envelope();
/// assert_eq!(envelope.status_code(), Some(200));
/// assert_eq!(envelope.body(), b"hello");
/// ```
#[derive(Debug, Default)]
pub struct Recorder {
    status: Option<StatusCode>,
    headers: Headers,
    body: BytesMut,
}

impl Recorder {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the recorder into a serializable [`Envelope`].
    ///
    /// An unset status is preserved as absent; it defaults to `200 OK` only
    /// at replay time.
    pub fn into_envelope(self) -> Envelope {
        Envelope::from_parts(
            self.status.map(|s| u32::from(s.as_u16())),
            self.headers,
            self.body.freeze(),
        )
    }

    /// Consumes the recorder into a live [`Response`].
    ///
    /// Used on the replay path: a stored envelope is written into a fresh
    /// recorder, then assembled into the response handed back to the caller.
    pub fn into_response(self) -> Response {
        let mut response = Response::new(self.status.unwrap_or(StatusCode::Ok));
        for (name, value) in self.headers.iter() {
            response.add_header(name, value);
        }
        response.body_bytes(Vec::from(self.body.freeze()))
    }
}

impl ResponseWriter for Recorder {
    fn append_header(&mut self, name: &str, value: &str) -> Result<(), SinkError> {
        if self.status.is_some() {
            return Err(SinkError::HeaderAfterStatus {
                name: name.to_owned(),
            });
        }
        self.headers.append(name, value);
        Ok(())
    }

    fn write_status(&mut self, status: StatusCode) -> Result<(), SinkError> {
        if self.status.is_some() {
            return Err(SinkError::StatusAlreadySent);
        }
        self.status = Some(status);
        Ok(())
    }

    fn write_body(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.body.extend_from_slice(chunk);
        Ok(())
    }
}
