//! Per-connection state.
//!
//! A connection is owned by exactly one worker for its whole life; it is
//! registered only with that worker's event loop and every access happens
//! on that worker's thread. The owner thread id is recorded at accept time
//! and checked in debug builds on each touch.

use crate::channel::Channel;
use bytes::BytesMut;
use mio::net::TcpStream;
use std::thread::{self, ThreadId};
use std::time::Instant;

/// Why a connection ended, recorded before teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The response completed and keep-alive was off.
    Done,
    /// The peer closed or reset.
    Closed,
    /// A protocol or I/O error.
    Error,
    /// Idle past the configured timeout.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Waiting for or accumulating request bytes.
    Reading,
    /// Draining the output channel.
    Writing,
    /// Marked for teardown at the end of the dispatch pass.
    Closing,
}

pub struct Connection {
    pub stream: TcpStream,
    pub state: ConnState,
    pub input: BytesMut,
    pub channel: Channel,
    pub last_activity: Instant,
    pub close_reason: Option<CloseReason>,
    /// Requests answered on this connection, for the keep-alive budget.
    pub requests_served: u32,
    pub keepalive: bool,
    owner: ThreadId,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Connection {
        Connection {
            stream,
            state: ConnState::Reading,
            input: BytesMut::with_capacity(4096),
            channel: Channel::new(),
            last_activity: Instant::now(),
            close_reason: None,
            requests_served: 0,
            keepalive: false,
            owner: thread::current().id(),
        }
    }

    /// Record activity and assert thread affinity in debug builds.
    pub fn touch(&mut self) {
        debug_assert_eq!(
            thread::current().id(),
            self.owner,
            "connection accessed off its owning worker thread"
        );
        self.last_activity = Instant::now();
    }

    pub fn mark_closing(&mut self, reason: CloseReason) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason);
        }
        self.state = ConnState::Closing;
    }

    pub fn is_closing(&self) -> bool {
        self.state == ConnState::Closing
    }

    /// Whether the idle timeout has elapsed.
    pub fn idle_for(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdListener;
    use std::time::Duration;

    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = StdListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), client)
    }

    #[test]
    fn test_new_connection_starts_reading() {
        let (stream, _client) = connected_pair();
        let conn = Connection::new(stream);
        assert_eq!(conn.state, ConnState::Reading);
        assert_eq!(conn.requests_served, 0);
        assert!(conn.close_reason.is_none());
        assert!(conn.channel.is_empty());
    }

    #[test]
    fn test_mark_closing_keeps_first_reason() {
        let (stream, _client) = connected_pair();
        let mut conn = Connection::new(stream);
        conn.mark_closing(CloseReason::Timeout);
        conn.mark_closing(CloseReason::Error);
        assert!(conn.is_closing());
        assert_eq!(conn.close_reason, Some(CloseReason::Timeout));
    }

    #[test]
    fn test_touch_resets_idle_clock() {
        let (stream, _client) = connected_pair();
        let mut conn = Connection::new(stream);
        conn.last_activity = Instant::now() - Duration::from_secs(60);
        assert!(conn.idle_for(Instant::now()) >= Duration::from_secs(60));
        conn.touch();
        assert!(conn.idle_for(Instant::now()) < Duration::from_secs(1));
    }
}
