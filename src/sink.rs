//! Response sink collaborator interface
//!
//! The outer HTTP layer supplies a sink for each request; the fallback core
//! writes the winning attempt's reply through it. The header map is shared:
//! mutations made by the attempt executor are visible to the sink and vice
//! versa.

use std::io;

use http::{HeaderMap, StatusCode};

/// Destination for an upstream reply.
///
/// Implementations are expected to deliver bytes to the connected client;
/// `write` may block while the client is slow, which is how backpressure
/// propagates to the executor on streaming replies.
pub trait ResponseSink: Send {
    /// The response header map.
    fn headers(&self) -> &HeaderMap;

    /// Mutable access to the response header map.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Write the response status line. Must be called at most once before
    /// any body bytes.
    fn write_header(&mut self, status: StatusCode);

    /// Write body bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Flush buffered bytes to the client.
    fn flush(&mut self);
}
