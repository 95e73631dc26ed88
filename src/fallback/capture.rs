//! Per-attempt response capture
//!
//! A [`ResponseCapture`] sits between the attempt executor and the real
//! client sink for exactly one attempt. Successful streaming replies pass
//! through live with a flush per write; everything else is buffered so the
//! client never sees bytes from a failed attempt. Buffered successes are
//! replayed by the handler via [`ResponseCapture::flush_non_stream_success`].

use std::io;
use std::time::{Duration, Instant};

use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::sink::ResponseSink;

/// Content-Type fragments that mark an upstream reply as streaming.
const STREAMING_CONTENT_TYPES: [&str; 3] =
    ["text/event-stream", "text/plain", "application/x-ndjson"];

/// How the capture is relaying the current attempt's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// No header or body seen yet
    Undetermined,
    /// Streaming reply, forwarded live on success
    Streaming,
    /// Buffered reply, replayed after the attempt succeeds
    Buffered,
}

/// Capturing sink wrapping the client sink for one attempt.
pub struct ResponseCapture<'a> {
    inner: &'a mut dyn ResponseSink,
    status: StatusCode,
    success: bool,
    mode: CaptureMode,
    header_sent: bool,
    buffer: Vec<u8>,
    /// Upstream headers snapshotted for buffered replay
    snapshot: HeaderMap,
    started_at: Instant,
    first_byte_at: Option<Instant>,
    total_bytes: usize,
}

impl<'a> ResponseCapture<'a> {
    /// Wrap the client sink for one attempt starting at `started_at`.
    pub fn new(inner: &'a mut dyn ResponseSink, started_at: Instant) -> Self {
        Self {
            inner,
            status: StatusCode::OK,
            success: false,
            mode: CaptureMode::Undetermined,
            header_sent: false,
            buffer: Vec::new(),
            snapshot: HeaderMap::new(),
            started_at,
            first_byte_at: None,
            total_bytes: 0,
        }
    }

    /// Whether the attempt produced a 2xx/3xx status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Status code reported by the upstream (200 until a header is written).
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    /// Whether the reply classified as streaming.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.mode == CaptureMode::Streaming
    }

    /// Current relay mode.
    #[must_use]
    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    /// Bytes held back from the client (the error body on failure).
    #[must_use]
    pub fn buffered_data(&self) -> &[u8] {
        &self.buffer
    }

    /// Total body bytes the executor wrote.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// Time from attempt start to the first body byte, if any arrived.
    #[must_use]
    pub fn first_byte_time(&self) -> Option<Duration> {
        self.first_byte_at.map(|at| at - self.started_at)
    }

    /// Replay a buffered successful reply to the client.
    ///
    /// Snapshotted upstream headers are replayed minus `Content-Length` and
    /// `Content-Type`; the body is emitted as `application/json`.
    ///
    /// # Errors
    ///
    /// Propagates write failures from the client sink.
    pub fn flush_non_stream_success(&mut self) -> io::Result<()> {
        if self.mode == CaptureMode::Streaming || !self.success {
            return Ok(());
        }

        let replay = std::mem::take(&mut self.snapshot);
        for name in replay.keys() {
            if name != CONTENT_LENGTH && name != CONTENT_TYPE {
                self.inner.headers_mut().remove(name);
            }
        }
        for (name, value) in &replay {
            if name != CONTENT_LENGTH && name != CONTENT_TYPE {
                self.inner.headers_mut().append(name.clone(), value.clone());
            }
        }
        self.inner.headers_mut().remove(CONTENT_LENGTH);
        self.inner
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if !self.header_sent {
            self.inner.write_header(self.status);
            self.header_sent = true;
        }
        self.inner.write(&self.buffer)?;
        Ok(())
    }

    /// Classify the reply from the Content-Type currently on the header map.
    fn classify(&mut self) {
        self.mode = if is_streaming_content_type(self.inner.headers()) {
            CaptureMode::Streaming
        } else {
            CaptureMode::Buffered
        };
    }
}

impl ResponseSink for ResponseCapture<'_> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn write_header(&mut self, status: StatusCode) {
        self.status = status;
        self.success = (200..400).contains(&status.as_u16());

        if self.mode == CaptureMode::Undetermined {
            self.classify();
        }

        match self.mode {
            CaptureMode::Streaming => {
                if self.success && !self.header_sent {
                    self.inner.write_header(status);
                    self.header_sent = true;
                }
            }
            _ => {
                // Held back until the attempt is known good.
                self.snapshot = self.inner.headers().clone();
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        if self.mode == CaptureMode::Undetermined {
            self.classify();
        }

        if self.first_byte_at.is_none() {
            self.first_byte_at = Some(Instant::now());
        }
        self.total_bytes += data.len();

        if self.mode == CaptureMode::Streaming && self.success {
            if !self.header_sent {
                self.inner.write_header(self.status);
                self.header_sent = true;
            }
            let written = self.inner.write(data)?;
            self.inner.flush();
            return Ok(written);
        }

        self.buffer.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) {
        if self.mode == CaptureMode::Streaming && self.success && self.header_sent {
            self.inner.flush();
        }
    }
}

/// Whether the headers' Content-Type marks the reply as streaming.
fn is_streaming_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|content_type| {
            STREAMING_CONTENT_TYPES
                .iter()
                .any(|marker| content_type.contains(marker))
        })
}
