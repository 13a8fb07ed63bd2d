//! RFC1123 date handling and the cached Server/Date preset block.
//!
//! Workers refresh the preset once per second on a timer instead of
//! formatting a date on every response.

use bytes::Bytes;
use chrono::{NaiveDateTime, TimeZone, Utc};

/// RFC1123-style format, e.g. `Wed, 23 Jun 2010 22:32:01 GMT`.
const DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Format a unix timestamp as an RFC1123 date string.
///
/// Returns `None` for timestamps outside chrono's representable range.
pub fn utime2gmt(unix: i64) -> Option<String> {
    Utc.timestamp_opt(unix, 0)
        .single()
        .map(|dt| dt.format(DATE_FORMAT).to_string())
}

/// Parse an RFC1123 date string back into a unix timestamp.
pub fn gmt2utime(date: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(date, DATE_FORMAT)
        .ok()
        .map(|dt| dt.and_utc().timestamp())
}

/// Build the preset `Server` + `Date` header block sent on every response.
pub fn preset_headers(server_name: &str, unix: i64) -> Bytes {
    let date = utime2gmt(unix).unwrap_or_default();
    Bytes::from(format!("Server: {server_name}\r\nDate: {date}\r\n"))
}

/// Current unix time.
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utime2gmt_known_value() {
        assert_eq!(
            utime2gmt(1277332321).as_deref(),
            Some("Wed, 23 Jun 2010 22:32:01 GMT")
        );
    }

    #[test]
    fn test_gmt2utime_round_trip() {
        assert_eq!(gmt2utime("Wed, 23 Jun 2010 22:32:01 GMT"), Some(1277332321));

        let now = 1724800000;
        let formatted = utime2gmt(now).unwrap();
        assert_eq!(gmt2utime(&formatted), Some(now));
    }

    #[test]
    fn test_gmt2utime_rejects_garbage() {
        assert_eq!(gmt2utime("not a date"), None);
        assert_eq!(gmt2utime(""), None);
    }

    #[test]
    fn test_preset_headers_shape() {
        let preset = preset_headers("howler/0.1.0", 1277332321);
        assert_eq!(
            &preset[..],
            b"Server: howler/0.1.0\r\nDate: Wed, 23 Jun 2010 22:32:01 GMT\r\n" as &[u8]
        );
    }
}
