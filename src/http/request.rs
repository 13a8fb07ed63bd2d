//! Request parsing, limited to what routing and keep-alive decisions need:
//! the request line and the header block. Body semantics beyond that are a
//! handler concern.

/// Protocol version from the request line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

/// A parsed request head.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    headers: Vec<(String, String)>,
}

impl Request {
    /// Case-insensitive header lookup; first match wins.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the client asked to keep the connection open.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`;
    /// HTTP/1.0 requires an explicit keep-alive token.
    pub fn keep_alive(&self) -> bool {
        let connection = self.header("Connection");
        match self.version {
            HttpVersion::Http11 => {
                !connection.is_some_and(|v| v.eq_ignore_ascii_case("close"))
            }
            HttpVersion::Http10 => {
                connection.is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
            }
        }
    }
}

/// Result of one parse attempt over the connection's input buffer.
#[derive(Debug)]
pub enum ParseOutcome {
    /// A full request head; `usize` is the bytes consumed including the
    /// terminating blank line.
    Complete(Request, usize),
    /// The head is not terminated yet; read more.
    Partial,
    /// Malformed request line or header; a protocol error.
    Invalid,
}

/// Parse one request head from the front of `buf`.
pub fn parse(buf: &[u8]) -> ParseOutcome {
    let Some(head_len) = find_head_end(buf) else {
        return ParseOutcome::Partial;
    };
    let head = &buf[..head_len];
    let Ok(text) = std::str::from_utf8(head) else {
        return ParseOutcome::Invalid;
    };

    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or("");
    let mut parts = request_line.split(' ');
    let (Some(method), Some(target), Some(version)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return ParseOutcome::Invalid;
    };
    if method.is_empty() || target.is_empty() || parts.next().is_some() {
        return ParseOutcome::Invalid;
    }
    let version = match version {
        "HTTP/1.1" => HttpVersion::Http11,
        "HTTP/1.0" => HttpVersion::Http10,
        _ => return ParseOutcome::Invalid,
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return ParseOutcome::Invalid;
        };
        if name.is_empty() || name.contains(' ') {
            return ParseOutcome::Invalid;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }

    ParseOutcome::Complete(
        Request {
            method: method.to_string(),
            target: target.to_string(),
            version,
            headers,
        },
        head_len + 4,
    )
}

/// Offset of the `\r\n\r\n` head terminator, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
