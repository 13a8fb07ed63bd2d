//! Per-worker scheduler.
//!
//! Each worker owns one event loop, one duplicate of the listening socket
//! and a slot table of connections. All workers poll the listener; the
//! kernel hands each pending connection to one of them and the rest see
//! would-block. A connection stays with the worker that accepted it for
//! its whole life.
//!
//! Besides socket events the loop handles two periodic timers (the cached
//! date header refresh and the idle-connection scan) and the cross-thread
//! wake channel used for shutdown.

use crate::channel::Stream;
use crate::connection::{CloseReason, ConnState, Connection};
use crate::event::{EventKind, EventLoop, InterestSet, ReadyEvent, LISTENER_TOKEN, WAKER_TOKEN};
use crate::http::header::{ConnHeader, ResponseHeaders};
use crate::http::request::{self, ParseOutcome, Request};
use crate::http::clock;
use crate::plugin::{self, Stage, StageContext, StageStatus};
use crate::server::ServerContext;
use bytes::{Buf, Bytes};
use mio::net::TcpListener;
use mio::Token;
use slab::Slab;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 4096;

/// Handle to a spawned worker: its thread plus the wake channel used to
/// interrupt a blocked wait from outside.
pub struct WorkerHandle {
    pub thread: JoinHandle<()>,
    pub waker: Arc<mio::Waker>,
}

/// Spawn one worker thread over its own duplicate of the listener.
///
/// The event loop is created before the thread starts so the wake channel
/// is available to the caller even if the worker exits early.
pub fn spawn(
    id: usize,
    listener: std::net::TcpListener,
    ctx: Arc<ServerContext>,
    stop: Arc<AtomicBool>,
) -> io::Result<WorkerHandle> {
    let event_loop = EventLoop::create(ctx.config.event_queue_size)?;
    let waker = event_loop.waker();

    let thread = thread::Builder::new()
        .name(format!("worker-{id}"))
        .spawn(move || match Worker::new(id, listener, ctx, stop, event_loop) {
            Ok(mut worker) => worker.run(),
            Err(e) => error!(worker = id, error = %e, "worker startup failed"),
        })?;

    Ok(WorkerHandle { thread, waker })
}

struct Worker {
    id: usize,
    ctx: Arc<ServerContext>,
    event_loop: EventLoop,
    listener: TcpListener,
    connections: Slab<Connection>,
    stop: Arc<AtomicBool>,
    /// Cached `Server:` + `Date:` header block, refreshed once a second.
    preset: Bytes,
    clock_timer: Token,
    timeout_timer: Token,
}

impl Worker {
    fn new(
        id: usize,
        listener: std::net::TcpListener,
        ctx: Arc<ServerContext>,
        stop: Arc<AtomicBool>,
        mut event_loop: EventLoop,
    ) -> io::Result<Worker> {
        listener.set_nonblocking(true)?;
        let mut listener = TcpListener::from_std(listener);
        event_loop.add(
            &mut listener,
            LISTENER_TOKEN,
            EventKind::Listener,
            InterestSet::READ,
        )?;

        let clock_timer = event_loop.timeout_create(Duration::from_secs(1));
        let scan_interval = (ctx.config.timeout_secs / 2).max(1);
        let timeout_timer = event_loop.timeout_create(Duration::from_secs(scan_interval));

        let preset = clock::preset_headers(&ctx.config.server_name, clock::now_unix());

        info!(worker = id, "worker started");

        Ok(Worker {
            id,
            ctx,
            event_loop,
            listener,
            connections: Slab::new(),
            stop,
            preset,
            clock_timer,
            timeout_timer,
        })
    }

    fn run(&mut self) {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            let count = match self.event_loop.wait() {
                Ok(count) => count,
                Err(e) => {
                    error!(worker = self.id, error = %e, "event wait failed");
                    continue;
                }
            };

            for idx in 0..count {
                let event = self.event_loop.ready_event(idx);
                match event.token {
                    WAKER_TOKEN => {
                        // Stop flag is re-checked at the top of the loop.
                    }
                    LISTENER_TOKEN => self.accept_connections(),
                    t if t == self.clock_timer => self.refresh_preset(),
                    t if t == self.timeout_timer => self.scan_timeouts(),
                    Token(key) => self.handle_connection_event(key, event),
                }
            }
        }

        self.drain();
        info!(worker = self.id, "worker stopped");
    }

    fn refresh_preset(&mut self) {
        self.preset = clock::preset_headers(&self.ctx.config.server_name, clock::now_unix());
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.len() >= self.ctx.config.max_connections {
                        warn!(worker = self.id, "connection limit reached");
                        continue;
                    }

                    let key = self.connections.insert(Connection::new(stream));
                    let conn = &mut self.connections[key];
                    if let Err(e) = self.event_loop.add(
                        &mut conn.stream,
                        Token(key),
                        EventKind::Connection,
                        InterestSet::READ,
                    ) {
                        error!(worker = self.id, error = %e, "register failed");
                        self.connections.remove(key);
                        continue;
                    }

                    self.run_lifecycle_stage(Stage::Accepted);
                    debug!(worker = self.id, conn = key, peer = %peer, "accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Drained, or another worker won this round.
                    self.event_loop.clear_ready(LISTENER_TOKEN, InterestSet::READ);
                    break;
                }
                Err(e) => {
                    error!(worker = self.id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn handle_connection_event(&mut self, key: usize, event: ReadyEvent) {
        if !self.connections.contains(key) {
            return;
        }
        self.connections[key].touch();

        if event.readable {
            self.handle_readable(key);
        }
        if event.writable {
            if let Some(conn) = self.connections.get(key) {
                if conn.state == ConnState::Writing {
                    self.flush_output(key);
                }
            }
            // Pipelined requests may have been buffered while writing.
            if self
                .connections
                .get(key)
                .is_some_and(|c| c.state == ConnState::Reading && !c.input.is_empty())
            {
                self.process_input(key);
            }
        }

        if self
            .connections
            .get(key)
            .is_some_and(|c| c.is_closing())
        {
            self.close_connection(key);
        }
    }

    fn handle_readable(&mut self, key: usize) {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            let conn = &mut self.connections[key];
            match conn.stream.read(&mut buf) {
                Ok(0) => {
                    conn.mark_closing(CloseReason::Closed);
                    return;
                }
                Ok(n) => conn.input.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.event_loop.clear_ready(Token(key), InterestSet::READ);
                    break;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(worker = self.id, conn = key, error = %e, "read failed");
                    conn.mark_closing(CloseReason::Error);
                    return;
                }
            }
        }

        self.process_input(key);
    }

    /// Parse and answer as many pipelined requests as the buffer holds,
    /// stopping once the connection leaves the reading state.
    fn process_input(&mut self, key: usize) {
        loop {
            let conn = &mut self.connections[key];
            if conn.state != ConnState::Reading || conn.is_closing() {
                break;
            }

            match request::parse(&conn.input) {
                ParseOutcome::Partial => {
                    // An unterminated head may not grow without bound.
                    if conn.input.len() > self.ctx.config.max_request_size {
                        debug!(worker = self.id, conn = key, "request head too large");
                        self.respond_reject(key, 413);
                    }
                    break;
                }
                ParseOutcome::Invalid => {
                    debug!(worker = self.id, conn = key, "malformed request");
                    self.respond_reject(key, 400);
                    break;
                }
                ParseOutcome::Complete(req, consumed) => {
                    self.connections[key].input.advance(consumed);
                    self.dispatch_request(key, req);
                    self.flush_output(key);
                }
            }
        }
    }

    /// Run stages 20 through 40 for one parsed request and queue the
    /// response on the connection's channel.
    fn dispatch_request(&mut self, key: usize, req: Request) {
        let max_requests = self.ctx.config.max_keepalive_requests;
        let timeout = self.ctx.config.timeout_secs;

        let conn = &mut self.connections[key];
        conn.requests_served += 1;
        let served = conn.requests_served;
        let mut keepalive = req.keep_alive() && served < max_requests;

        let mut headers = ResponseHeaders::new(0);
        let mut body: Option<Bytes> = None;

        {
            let mut ctx = StageContext {
                api: &self.ctx.api,
                request: Some(&req),
                headers: &mut headers,
                body: &mut body,
            };
            match self.ctx.plugins.run_stage(Stage::RequestParsed, &mut ctx) {
                StageStatus::End => keepalive = false,
                StageStatus::Defer => {
                    self.park_connection(key);
                    return;
                }
                StageStatus::NotMe | StageStatus::Continue => {}
            }
        }

        {
            let mut ctx = StageContext {
                api: &self.ctx.api,
                request: Some(&req),
                headers: &mut headers,
                body: &mut body,
            };
            match self.ctx.plugins.run_stage(Stage::Content, &mut ctx) {
                StageStatus::NotMe => {
                    // No plugin claimed the request.
                    let not_found = Bytes::from_static(b"Not Found\r\n");
                    headers.status = 404;
                    headers.content_type = Some("text/plain".to_string());
                    headers.content_length = Some(not_found.len() as u64);
                    body = Some(not_found);
                }
                StageStatus::End => keepalive = false,
                StageStatus::Defer => {
                    self.park_connection(key);
                    return;
                }
                StageStatus::Continue => {}
            }
        }

        headers.connection = if keepalive {
            ConnHeader::KeepAlive {
                timeout,
                remaining: max_requests - served,
            }
        } else {
            ConnHeader::Close
        };

        {
            let mut ctx = StageContext {
                api: &self.ctx.api,
                request: Some(&req),
                headers: &mut headers,
                body: &mut body,
            };
            self.ctx.plugins.run_stage(Stage::Finalize, &mut ctx);
        }

        let mut iov = headers.prepare(&self.preset);
        if let Some(body) = body {
            iov.push(body);
        }

        let conn = &mut self.connections[key];
        conn.keepalive = keepalive;
        conn.channel.append(Stream::iov(iov));
    }

    /// Best-effort rejection response, then close with an error
    /// disposition.
    fn respond_reject(&mut self, key: usize, status: u16) {
        let mut headers = ResponseHeaders::new(status);
        headers.connection = ConnHeader::Close;
        let iov = headers.prepare(&self.preset);

        let conn = &mut self.connections[key];
        conn.channel.append(Stream::iov(iov));
        let _ = conn.channel.flush(&mut conn.stream);
        conn.mark_closing(CloseReason::Error);
    }

    /// Park a connection a plugin has taken over; nothing in this build
    /// resumes it, so the idle scan is what eventually reclaims it.
    fn park_connection(&mut self, key: usize) {
        let conn = &mut self.connections[key];
        if let Err(e) =
            self.event_loop
                .set_interest(&mut conn.stream, Token(key), InterestSet::SLEEP)
        {
            debug!(worker = self.id, conn = key, error = %e, "park failed");
            conn.mark_closing(CloseReason::Error);
        }
    }

    /// Drive the channel until it empties or the socket pushes back, then
    /// reconcile interest with the resulting state.
    fn flush_output(&mut self, key: usize) {
        let conn = &mut self.connections[key];
        if conn.is_closing() {
            return;
        }
        if conn.channel.is_empty() {
            return;
        }

        loop {
            match conn.channel.flush(&mut conn.stream) {
                Ok(crate::channel::FlushStatus::Done) => {
                    if conn.keepalive {
                        conn.state = ConnState::Reading;
                        if let Err(e) = self.event_loop.set_interest(
                            &mut conn.stream,
                            Token(key),
                            InterestSet::READ,
                        ) {
                            debug!(worker = self.id, conn = key, error = %e, "rearm failed");
                            conn.mark_closing(CloseReason::Error);
                        }
                    } else {
                        conn.mark_closing(CloseReason::Done);
                    }
                    return;
                }
                Ok(crate::channel::FlushStatus::Pending) => continue,
                Ok(crate::channel::FlushStatus::WouldBlock) => {
                    conn.state = ConnState::Writing;
                    self.event_loop.clear_ready(Token(key), InterestSet::WRITE);
                    if let Err(e) = self.event_loop.set_interest(
                        &mut conn.stream,
                        Token(key),
                        InterestSet::WRITE,
                    ) {
                        debug!(worker = self.id, conn = key, error = %e, "rearm failed");
                        conn.mark_closing(CloseReason::Error);
                    }
                    return;
                }
                Err(e) => {
                    debug!(worker = self.id, conn = key, error = %e, "write failed");
                    conn.mark_closing(CloseReason::Error);
                    return;
                }
            }
        }
    }

    fn scan_timeouts(&mut self) {
        let now = Instant::now();
        let limit = Duration::from_secs(self.ctx.config.timeout_secs);
        let stale: Vec<usize> = self
            .connections
            .iter()
            .filter(|(_, c)| c.idle_for(now) >= limit)
            .map(|(key, _)| key)
            .collect();

        for key in stale {
            debug!(worker = self.id, conn = key, "idle timeout");
            self.connections[key].mark_closing(CloseReason::Timeout);
            self.close_connection(key);
        }
    }

    fn close_connection(&mut self, key: usize) {
        let mut conn = self.connections.remove(key);
        if let Err(e) = self.event_loop.del(&mut conn.stream, Token(key)) {
            debug!(worker = self.id, conn = key, error = %e, "deregister failed");
        }
        self.run_lifecycle_stage(Stage::Cleanup);
        debug!(
            worker = self.id,
            conn = key,
            reason = ?conn.close_reason,
            requests = conn.requests_served,
            "connection closed"
        );
    }

    /// Stages 10 and 50 run outside a request, against scratch state.
    fn run_lifecycle_stage(&self, stage: Stage) {
        let mut headers = ResponseHeaders::new(0);
        let mut body = None;
        let mut ctx = plugin::scratch_context(&self.ctx.api, &mut headers, &mut body);
        self.ctx.plugins.run_stage(stage, &mut ctx);
    }

    /// Finalize every open connection before the loop is destroyed.
    /// Queued output gets one non-blocking flush attempt on the way out.
    fn drain(&mut self) {
        let keys: Vec<usize> = self.connections.iter().map(|(key, _)| key).collect();
        for key in keys {
            self.run_lifecycle_stage(Stage::Finalize);
            let conn = &mut self.connections[key];
            if !conn.channel.is_empty() {
                let _ = conn.channel.flush(&mut conn.stream);
            }
            conn.mark_closing(CloseReason::Done);
            self.close_connection(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::IovBuf;
    use crate::config::Config;
    use crate::plugin::{PluginApi, PluginRegistry};

    fn test_context() -> Arc<ServerContext> {
        let api = PluginApi::new();
        let plugins = PluginRegistry::load(plugin::providers(), &[], &api);
        Arc::new(ServerContext {
            config: Config::default(),
            plugins,
            api,
        })
    }

    fn test_worker() -> Worker {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let event_loop = EventLoop::create(8).unwrap();
        Worker::new(
            0,
            listener,
            test_context(),
            Arc::new(AtomicBool::new(false)),
            event_loop,
        )
        .unwrap()
    }

    #[test]
    fn test_drain_flushes_queued_output() {
        let mut worker = test_worker();

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        accepted.set_nonblocking(true).unwrap();

        let key = worker
            .connections
            .insert(Connection::new(mio::net::TcpStream::from_std(accepted)));
        let mut iov = IovBuf::new();
        iov.push_static(b"queued goodbye\r\n");
        worker.connections[key].channel.append(Stream::iov(iov));

        worker.drain();
        assert!(worker.connections.is_empty());

        let mut received = String::new();
        let mut client = client;
        client.read_to_string(&mut received).unwrap();
        assert_eq!(received, "queued goodbye\r\n");
    }
}
