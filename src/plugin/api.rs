//! Function table handed to plugins at init time.
//!
//! The table is fixed and append-only: entries are never removed or
//! reordered across versions, only added at the end of each group, so
//! independently built extensions keep working against newer cores.

use crate::channel::{IovBuf, Stream};
use crate::http::{clock, status};

/// The core services a plugin may call.
///
/// Plugins receive a shared reference at init and during stage dispatch;
/// the table itself is built once before any worker starts.
pub struct PluginApi {
    // Time
    pub time_unix: fn() -> i64,
    pub time_to_gmt: fn(i64) -> Option<String>,
    pub time_from_gmt: fn(&str) -> Option<i64>,
    // HTTP
    pub status_line: fn(u16) -> Option<&'static str>,
    // Streams / channels
    pub iov_create: fn(usize) -> IovBuf,
    pub stream_iov: fn(IovBuf) -> Stream,
}

impl PluginApi {
    pub fn new() -> PluginApi {
        PluginApi {
            time_unix: clock::now_unix,
            time_to_gmt: clock::utime2gmt,
            time_from_gmt: clock::gmt2utime,
            status_line: status::status_line,
            iov_create: IovBuf::with_capacity,
            stream_iov: Stream::iov,
        }
    }
}

impl Default for PluginApi {
    fn default() -> Self {
        PluginApi::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_table_wiring() {
        let api = PluginApi::new();
        assert_eq!(
            (api.time_to_gmt)(1277332321).as_deref(),
            Some("Wed, 23 Jun 2010 22:32:01 GMT")
        );
        assert_eq!(
            (api.time_from_gmt)("Wed, 23 Jun 2010 22:32:01 GMT"),
            Some(1277332321)
        );
        assert_eq!((api.status_line)(200), Some("HTTP/1.1 200 OK\r\n"));
        assert!((api.time_unix)() > 1277332321);

        let mut iov = (api.iov_create)(4);
        iov.push_static(b"x");
        let stream = (api.stream_iov)(iov);
        assert_eq!(stream.remaining(), 1);
    }
}
