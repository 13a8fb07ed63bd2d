//! Response header serialization.
//!
//! Headers go out in a fixed order: status line, the preset Server/Date
//! block, then (when present) Last-Modified, Connection, Location, Allow,
//! Content-Type, Transfer-Encoding, Content-Encoding, Content-Length,
//! Content-Range, any extra plugin rows, and the terminating blank line.
//! The result is an `IovBuf` of mixed static and owned entries, written in
//! one vectored batch with the body.

use crate::channel::IovBuf;
use crate::http::{clock, status};
use bytes::Bytes;

/// Connection header disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnHeader {
    /// No Connection header emitted.
    #[default]
    Unset,
    /// `Keep-Alive` with the idle timeout and remaining-request count.
    KeepAlive { timeout: u64, remaining: u32 },
    /// `Connection: Close`.
    Close,
}

/// Builder for one response's header block.
#[derive(Default)]
pub struct ResponseHeaders {
    pub status: u16,
    pub connection: ConnHeader,
    pub last_modified: Option<i64>,
    pub location: Option<String>,
    pub allow: Option<String>,
    pub content_type: Option<String>,
    pub transfer_chunked: bool,
    pub content_encoding: Option<String>,
    pub content_length: Option<u64>,
    /// `(start, end, total)` for a `Content-Range: bytes` header.
    pub content_range: Option<(u64, u64, u64)>,
    /// Extra rows appended by plugins, one per entry, CRLF added here.
    pub extra_rows: Vec<String>,
}

impl ResponseHeaders {
    pub fn new(status: u16) -> ResponseHeaders {
        ResponseHeaders {
            status,
            ..ResponseHeaders::default()
        }
    }

    /// Assemble the header block in wire order.
    ///
    /// `preset` is the worker's cached Server/Date block. Unknown status
    /// codes fall back to a formatted line rather than the static table.
    pub fn prepare(&self, preset: &Bytes) -> IovBuf {
        let mut iov = IovBuf::with_capacity(16);

        match status::status_line(self.status) {
            Some(line) => iov.push_static(line.as_bytes()),
            None => iov.push(Bytes::from(format!("HTTP/1.1 {}\r\n", self.status))),
        }
        iov.push(preset.clone());

        if let Some(mtime) = self.last_modified {
            if let Some(date) = clock::utime2gmt(mtime) {
                iov.push_static(b"Last-Modified: ");
                iov.push(Bytes::from(format!("{date}\r\n")));
            }
        }

        match self.connection {
            ConnHeader::Unset => {}
            ConnHeader::KeepAlive { timeout, remaining } => {
                iov.push(Bytes::from(format!(
                    "Keep-Alive: timeout={timeout}, max={remaining}\r\n"
                )));
                iov.push_static(b"Connection: Keep-Alive\r\n");
            }
            ConnHeader::Close => iov.push_static(b"Connection: Close\r\n"),
        }

        if let Some(ref location) = self.location {
            iov.push_static(b"Location: ");
            iov.push(Bytes::from(format!("{location}\r\n")));
        }

        if let Some(ref allow) = self.allow {
            iov.push_static(b"Allow: ");
            iov.push(Bytes::from(format!("{allow}\r\n")));
        }

        if let Some(ref content_type) = self.content_type {
            iov.push_static(b"Content-Type: ");
            iov.push(Bytes::from(format!("{content_type}\r\n")));
        }

        // Redirect statuses carry no entity, so no transfer coding either.
        if self.transfer_chunked && !(300..=305).contains(&self.status) {
            iov.push_static(b"Transfer-Encoding: Chunked\r\n");
        }

        if let Some(ref encoding) = self.content_encoding {
            iov.push_static(b"Content-Encoding: ");
            iov.push(Bytes::from(format!("{encoding}\r\n")));
        }

        if !self.transfer_chunked {
            if let Some(len) = self.content_length {
                iov.push_static(b"Content-Length: ");
                iov.push(Bytes::from(format!("{len}\r\n")));
            }
        }

        if let Some((start, end, total)) = self.content_range {
            iov.push(Bytes::from(format!(
                "Content-Range: bytes {start}-{end}/{total}\r\n"
            )));
        }

        for row in &self.extra_rows {
            iov.push(Bytes::from(format!("{row}\r\n")));
        }

        iov.push_static(b"\r\n");
        iov
    }
}
