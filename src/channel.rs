//! Vectored output channel.
//!
//! Each connection owns a `Channel`: a FIFO of `Stream` segments holding
//! either a list of memory buffers or a file region. A flush performs one
//! vectored-write attempt over as many front segments as fit a capped
//! batch, consuming bytes strictly from the front and firing each stream's
//! finished callback exactly once, in enqueue order. File regions go out
//! through sendfile on Linux with a read-then-write fallback elsewhere;
//! both paths share consumption and callback semantics.

use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, IoSlice, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use tracing::trace;

/// Cap on iovec entries per vectored-write attempt.
const MAX_FLUSH_SLICES: usize = 64;

/// Chunk size for the non-sendfile file path.
const FILE_CHUNK: usize = 16 * 1024;

/// Ordered list of byte buffers with a running total length.
///
/// Entries are `Bytes`, so each one either borrows static storage or owns
/// its allocation; dropping an entry is its single release point. Growth
/// goes through `Vec`, which always allocates anew and copies.
#[derive(Default)]
pub struct IovBuf {
    entries: Vec<Bytes>,
    total_len: usize,
}

impl IovBuf {
    pub fn new() -> IovBuf {
        IovBuf::default()
    }

    pub fn with_capacity(entries: usize) -> IovBuf {
        IovBuf {
            entries: Vec::with_capacity(entries),
            total_len: 0,
        }
    }

    /// Append one buffer. Empty buffers are skipped.
    pub fn push(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.total_len += data.len();
        self.entries.push(data);
    }

    /// Append a static byte string without copying.
    pub fn push_static(&mut self, data: &'static [u8]) {
        self.push(Bytes::from_static(data));
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    /// Consume bytes strictly from the front, splitting an entry mid-way
    /// when necessary. Consuming the full queued length resets the buffer
    /// in constant time.
    ///
    /// # Panics
    /// Requesting more than the queued total is a caller contract
    /// violation, not a recoverable condition.
    pub fn consume(&mut self, mut bytes: usize) {
        assert!(
            bytes <= self.total_len,
            "consume beyond queued length: {} > {}",
            bytes,
            self.total_len
        );
        if bytes == self.total_len {
            self.entries.clear();
            self.total_len = 0;
            return;
        }

        self.total_len -= bytes;
        let mut drained = 0;
        for entry in self.entries.iter_mut() {
            if bytes >= entry.len() {
                bytes -= entry.len();
                drained += 1;
            } else {
                entry.advance(bytes);
                bytes = 0;
                break;
            }
        }
        debug_assert_eq!(bytes, 0);
        self.entries.drain(..drained);
    }

    /// Append `IoSlice` views of the entries onto `out`, up to `limit`
    /// total slices.
    fn fill_slices<'a>(&'a self, out: &mut Vec<IoSlice<'a>>, limit: usize) {
        for entry in &self.entries {
            if out.len() >= limit {
                return;
            }
            out.push(IoSlice::new(entry));
        }
    }

    /// Concatenate the entries. Test and diagnostics helper.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total_len);
        for entry in &self.entries {
            out.extend_from_slice(entry);
        }
        out
    }
}

/// Callback invoked once when a stream has been fully consumed.
pub type FinishedCallback = Box<dyn FnOnce() + Send>;

/// What a stream carries.
pub enum StreamPayload {
    /// In-memory buffers, written with vectored I/O.
    Iov(IovBuf),
    /// A contiguous region of a file, written with sendfile when available.
    FileRegion {
        file: File,
        offset: u64,
        remaining: u64,
    },
}

/// One output segment: a payload plus an optional completion callback.
///
/// The callback fires exactly once, when the last payload byte has been
/// consumed, before the stream is dequeued. On forced teardown the owned
/// buffers are dropped without invoking it.
pub struct Stream {
    payload: StreamPayload,
    on_finished: Option<FinishedCallback>,
}

impl Stream {
    pub fn iov(buf: IovBuf) -> Stream {
        Stream {
            payload: StreamPayload::Iov(buf),
            on_finished: None,
        }
    }

    pub fn file(file: File, offset: u64, len: u64) -> Stream {
        Stream {
            payload: StreamPayload::FileRegion {
                file,
                offset,
                remaining: len,
            },
            on_finished: None,
        }
    }

    pub fn with_finished(mut self, cb: FinishedCallback) -> Stream {
        self.on_finished = Some(cb);
        self
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        match &self.payload {
            StreamPayload::Iov(buf) => buf.total_len(),
            StreamPayload::FileRegion { remaining, .. } => *remaining as usize,
        }
    }

    fn consume(&mut self, bytes: usize) {
        match &mut self.payload {
            StreamPayload::Iov(buf) => buf.consume(bytes),
            StreamPayload::FileRegion {
                offset, remaining, ..
            } => {
                debug_assert!(bytes as u64 <= *remaining);
                *offset += bytes as u64;
                *remaining -= bytes as u64;
            }
        }
    }

    fn finish(&mut self) {
        if let Some(cb) = self.on_finished.take() {
            cb();
        }
    }
}

/// Outcome of one flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// Everything queued was written; the channel is empty.
    Done,
    /// Progress was made but segments remain queued.
    Pending,
    /// The socket cannot take more right now; wait for Write readiness.
    WouldBlock,
}

/// FIFO of output streams for one connection.
///
/// Invariant: `total_len` equals the sum of the queued streams' remaining
/// lengths at all times.
#[derive(Default)]
pub struct Channel {
    streams: VecDeque<Stream>,
    total_len: usize,
}

impl Channel {
    pub fn new() -> Channel {
        Channel::default()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Enqueue a stream. Zero-length streams complete (and fire their
    /// callback) on the next flush or consume.
    pub fn append(&mut self, stream: Stream) {
        self.total_len += stream.remaining();
        self.streams.push_back(stream);
    }

    /// Consume bytes from the front of the queue, firing finished
    /// callbacks for fully consumed streams in order.
    ///
    /// # Panics
    /// Requesting more than the queued total is a caller contract
    /// violation.
    pub fn consume(&mut self, mut bytes: usize) {
        assert!(
            bytes <= self.total_len,
            "consume beyond queued length: {} > {}",
            bytes,
            self.total_len
        );
        self.total_len -= bytes;

        loop {
            let Some(front) = self.streams.front_mut() else {
                debug_assert_eq!(bytes, 0);
                break;
            };
            let take = bytes.min(front.remaining());
            front.consume(take);
            bytes -= take;
            if front.remaining() == 0 {
                let mut done = self.streams.pop_front().expect("front exists");
                done.finish();
                continue;
            }
            if bytes == 0 {
                break;
            }
        }
    }

    /// One write attempt over the front of the queue: a vectored write of
    /// up to [`MAX_FLUSH_SLICES`] memory slices, or a file transmit when a
    /// file region is at the front.
    pub fn flush<W: Write + AsRawFd>(&mut self, io: &mut W) -> io::Result<FlushStatus> {
        // Complete any zero-length streams parked at the front.
        self.consume(0);
        if self.streams.is_empty() {
            return Ok(FlushStatus::Done);
        }

        let written = {
            let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_FLUSH_SLICES);
            for stream in &self.streams {
                match &stream.payload {
                    StreamPayload::Iov(buf) => {
                        buf.fill_slices(&mut slices, MAX_FLUSH_SLICES);
                        if slices.len() >= MAX_FLUSH_SLICES {
                            break;
                        }
                    }
                    StreamPayload::FileRegion { .. } => break,
                }
            }

            if slices.is_empty() {
                match self.transmit_file_front(io) {
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(FlushStatus::WouldBlock)
                    }
                    Err(e) => return Err(e),
                }
            } else {
                match io.write_vectored(&slices) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write returned 0",
                        ))
                    }
                    Ok(n) => n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(FlushStatus::WouldBlock)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => 0,
                    Err(e) => return Err(e),
                }
            }
        };

        trace!(written, queued = self.total_len, "channel flush");
        self.consume(written);

        if self.streams.is_empty() {
            Ok(FlushStatus::Done)
        } else {
            Ok(FlushStatus::Pending)
        }
    }

    /// Write from the file region at the queue front. Zero-copy via
    /// sendfile on Linux; read-then-write elsewhere and when sendfile is
    /// refused for this descriptor pair.
    fn transmit_file_front<W: Write + AsRawFd>(&mut self, io: &mut W) -> io::Result<usize> {
        let front = self.streams.front().expect("file stream at front");
        let StreamPayload::FileRegion {
            file,
            offset,
            remaining,
        } = &front.payload
        else {
            unreachable!("transmit_file_front called without a file region");
        };
        let count = (*remaining as usize).min(FILE_CHUNK);

        #[cfg(target_os = "linux")]
        {
            match sendfile_once(io.as_raw_fd(), file, *offset, count) {
                Ok(n) => return Ok(n),
                Err(ref e)
                    if matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOSYS)) =>
                {
                    // Descriptor pair not eligible; fall through to the
                    // copying path below.
                }
                Err(e) => return Err(e),
            }
        }

        let mut chunk = vec![0u8; count];
        let n = file.read_at(&mut chunk, *offset)?;
        if n == 0 && count > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file region truncated",
            ));
        }
        io.write(&chunk[..n])
    }
}

#[cfg(target_os = "linux")]
fn sendfile_once(out_fd: i32, file: &File, offset: u64, count: usize) -> io::Result<usize> {
    let mut off = offset as libc::off_t;
    let n = unsafe { libc::sendfile(out_fd, file.as_raw_fd(), &mut off, count) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
