//! Remote chunk access for slides served over the network.
//!
//! The transport itself (TLS, sockets) lives outside this crate: callers
//! supply a [`ChunkFetcher`] that performs
//! `GET /slide/<filename>/<offset>/<length>` and hands back the raw
//! HTTP-framed response. This module locates the end of the headers
//! (CRLFCRLF) and validates that the body carries at least the requested
//! byte count.

use bytes::Bytes;

use crate::error::IoError;

/// Where a remote slide lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLocation {
    pub hostname: String,
    pub port: u16,
    pub filename: String,
}

/// An opaque transport that downloads one byte range of a remote slide.
///
/// Implementations return the complete HTTP response (status line, headers,
/// body); framing is handled by the caller via [`split_http_response`].
pub trait ChunkFetcher: Send + Sync {
    /// Download `length` bytes of `path` starting at `offset`.
    fn fetch_chunk(
        &self,
        hostname: &str,
        port: u16,
        path: &str,
        offset: u64,
        length: u64,
    ) -> Result<Bytes, IoError>;
}

/// Find the end of the HTTP headers in a raw response.
///
/// Returns the byte offset of the first body byte (just past CRLFCRLF), or
/// `None` if the separator is absent.
pub fn find_end_of_http_headers(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Split a raw HTTP response into headers and body.
pub fn split_http_response(raw: &[u8]) -> Result<(&[u8], &[u8]), IoError> {
    let body_start = find_end_of_http_headers(raw).ok_or_else(|| {
        IoError::MalformedResponse("no CRLFCRLF header terminator found".to_string())
    })?;
    Ok(raw.split_at(body_start))
}

/// Download one chunk of a remote slide and return exactly `length` body
/// bytes.
///
/// The response may carry more than `length` bytes (trailing padding from
/// the server); the excess is trimmed. A shorter body is a failed read.
pub fn read_remote_chunk(
    fetcher: &dyn ChunkFetcher,
    location: &RemoteLocation,
    offset: u64,
    length: u64,
) -> Result<Bytes, IoError> {
    let raw = fetcher.fetch_chunk(
        &location.hostname,
        location.port,
        &location.filename,
        offset,
        length,
    )?;
    let body_start = find_end_of_http_headers(&raw).ok_or_else(|| {
        IoError::MalformedResponse("no CRLFCRLF header terminator found".to_string())
    })?;
    let body_len = raw.len() - body_start;
    if (body_len as u64) < length {
        return Err(IoError::ShortRead {
            offset,
            requested: length,
            actual: body_len as u64,
        });
    }
    Ok(raw.slice(body_start..body_start + length as usize))
}
