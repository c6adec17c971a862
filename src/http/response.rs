//! HTTP/1.1 response builder and wire serialization.

use bytes::{BufMut, BytesMut};

use crate::capture::{ResponseWriter, SinkError};

use super::{Headers, StatusCode};

/// An HTTP/1.1 response.
///
/// Built fluently by handlers, then either serialized to HTTP/1.1 wire bytes
/// with [`into_bytes`](Self::into_bytes) (the live connection path) or emitted
/// onto a [`ResponseWriter`] with [`write_to`](Self::write_to) (the capture
/// path, where a recorder turns it into a cacheable envelope).
///
/// # Examples
///
/// ```
/// use servecache::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Vec<u8>,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
            keep_alive: true,
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Appends a header in-place, for code that holds a `Response` it did not build.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.append(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into().into_bytes();
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls the `Connection: keep-alive` / `Connection: close` header.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the explicitly set headers (not the ones added at wire time).
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the body bytes.
    pub fn body_ref(&self) -> &[u8] {
        &self.body
    }

    /// Emits this response onto a [`ResponseWriter`] sink.
    ///
    /// Only what the handler set explicitly is emitted: headers in append
    /// order, then the status, then the body. Connection management headers
    /// (`Connection`, `Content-Length`, the fallback `Content-Type`) are a
    /// transport concern and deliberately excluded, so a captured response
    /// replays cleanly on connections with different keep-alive behavior.
    ///
    /// # Errors
    ///
    /// Propagates [`SinkError`] from the sink; with a fresh recorder this
    /// cannot happen, since the emission order honors the sink protocol.
    pub fn write_to<W: ResponseWriter>(&self, sink: &mut W) -> Result<(), SinkError> {
        for (name, value) in self.headers.iter() {
            sink.append_header(name, value)?;
        }
        sink.write_status(self.status)?;
        sink.write_body(&self.body)?;
        Ok(())
    }

    /// Serializes the response into HTTP/1.1 wire format.
    ///
    /// Adds the transport headers that [`write_to`](Self::write_to) skips:
    /// a fallback `Content-Type` when the body is non-empty, `Connection`,
    /// and `Content-Length`.
    pub fn into_bytes(mut self) -> BytesMut {
        let content_length = self.body.len();

        if !self.body.is_empty() && !self.headers.contains("content-type") {
            self.headers
                .append("Content-Type", "text/plain; charset=utf-8");
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.append("Connection", connection);

        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        // Status line
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        // Headers
        for (name, value) in self.headers.iter() {
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }

        // Content-Length is always the last header before the blank line
        buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());

        // Header/body separator
        buf.put(&b"\r\n"[..]);

        if !self.body.is_empty() {
            buf.put(self.body.as_slice());
        }

        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::Ok).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn custom_header() {
        let r = Response::new(StatusCode::Ok)
            .header("X-Request-Id", "abc-123")
            .body("ok");
        let s = to_string(r.into_bytes());
        assert!(s.contains("X-Request-Id: abc-123\r\n"));
    }

    #[test]
    fn no_body_no_content_type() {
        let r = Response::new(StatusCode::NoContent);
        let s = to_string(r.into_bytes());
        assert!(!s.contains("Content-Type"));
        assert!(s.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::Ok).keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn write_to_excludes_transport_headers() {
        use crate::capture::Recorder;

        let r = Response::new(StatusCode::Ok)
            .header("X-Custom", "yes")
            .body("payload");
        let mut rec = Recorder::new();
        r.write_to(&mut rec).unwrap();
        let envelope = rec.into_envelope();
        let names: Vec<_> = envelope.headers().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-Custom"]);
    }
}
