//! Buffered message channel over a worker stream.
//!
//! The channel owns fixed 4 KiB input/output buffers plus a growable
//! scratch buffer, and is reattached to a different stream whenever the
//! active worker changes (`set_fd` + `reset`). Reads eagerly drain the
//! stream into the input buffer; answers accumulate in the output buffer
//! until `flush`.
//!
//! End-of-stream is never fatal here: `read_query` reports it as `None`
//! and the engine retires the worker. Malformed traffic (unknown tags, a
//! `CHLD` without its descriptor, two descriptors in flight) is a
//! protocol violation and panics with context.

use std::os::fd::RawFd;

use texpresso_error::{EngineError, Result};
use texpresso_types::encoding::unpack_tag;
use texpresso_types::limits::{CHANNEL_BUF_SIZE, SCRATCH_INITIAL_SIZE};
use texpresso_types::{FileId, PicCache};
use tracing::trace;

use crate::message::{Answer, Ask, Query, QueryKind, QueryTag};
use crate::sys;

/// Magic the engine sends when a worker connects.
pub const SERVER_HANDSHAKE: &[u8; 12] = b"TEXPRESSOS01";
/// Magic a compatible worker replies with.
pub const CLIENT_HANDSHAKE: &[u8; 12] = b"TEXPRESSOC01";

struct InputBuf {
    data: Box<[u8]>,
    pos: usize,
    len: usize,
}

struct OutputBuf {
    data: Box<[u8]>,
    pos: usize,
}

/// The engine side of the worker protocol.
pub struct Channel {
    fd: Option<RawFd>,
    input: InputBuf,
    output: OutputBuf,
    /// Descriptor received via ancillary data, waiting for its `CHLD`.
    passed_fd: Option<RawFd>,
    scratch: Vec<u8>,
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fd: None,
            input: InputBuf {
                data: vec![0u8; CHANNEL_BUF_SIZE].into_boxed_slice(),
                pos: 0,
                len: 0,
            },
            output: OutputBuf {
                data: vec![0u8; CHANNEL_BUF_SIZE].into_boxed_slice(),
                pos: 0,
            },
            passed_fd: None,
            scratch: vec![0u8; SCRATCH_INITIAL_SIZE],
        }
    }

    /// Attach the channel to a different stream, discarding buffered
    /// input and output. A no-op when the stream is unchanged.
    pub fn set_fd(&mut self, fd: Option<RawFd>) {
        if self.fd != fd {
            self.fd = fd;
            self.reset();
        }
    }

    /// Discard buffered input and output.
    pub fn reset(&mut self) {
        self.input.pos = 0;
        self.input.len = 0;
        self.output.pos = 0;
    }

    /// Growable scratch buffer for staging payloads.
    pub fn get_buffer(&mut self, n: usize) -> &mut [u8] {
        if self.scratch.len() < n {
            let mut cap = self.scratch.len().max(SCRATCH_INITIAL_SIZE);
            while cap < n {
                cap *= 2;
            }
            self.scratch.resize(cap, 0);
        }
        &mut self.scratch[..n]
    }

    fn fd(&self) -> RawFd {
        self.fd.expect("channel has no stream attached")
    }

    // -- handshake ----------------------------------------------------------

    /// Negotiate with a freshly connected worker.
    ///
    /// Writes the server magic and reads the client reply. Returns
    /// `Ok(true)` on a matching reply *or* a short read (the worker has
    /// not spoken yet; the engine will retry), `Ok(false)` on a full
    /// non-matching reply.
    pub fn handshake(&mut self) -> Result<bool> {
        let fd = self.fd();
        sys::write_all(fd, SERVER_HANDSHAKE)?;
        let mut reply = [0u8; 12];
        if !self.read_exact_raw(&mut reply)? {
            return Ok(true);
        }
        self.reset();
        Ok(&reply == CLIENT_HANDSHAKE)
    }

    /// Read exactly `out.len()` bytes, bypassing the input buffer.
    /// Returns `Ok(false)` on end-of-stream before completion.
    fn read_exact_raw(&mut self, out: &mut [u8]) -> Result<bool> {
        let fd = self.fd();
        let mut off = 0;
        while off < out.len() {
            let (n, fds) = sys::recv_with_fds(fd, &mut out[off..])?;
            self.absorb_fds(fds);
            if n == 0 {
                return Ok(false);
            }
            off += n;
        }
        Ok(true)
    }

    // -- input --------------------------------------------------------------

    fn absorb_fds(&mut self, fds: Vec<RawFd>) {
        for fd in fds {
            assert!(
                self.passed_fd.is_none(),
                "protocol violation: worker passed more than one descriptor"
            );
            self.passed_fd = Some(fd);
        }
    }

    /// Ensure at least `n` unread bytes sit in the input buffer, reading
    /// eagerly from the stream. `Ok(false)` on end-of-stream.
    fn load_at_least(&mut self, n: usize) -> Result<bool> {
        debug_assert!(n <= CHANNEL_BUF_SIZE);
        let avail = self.input.len - self.input.pos;
        if avail >= n {
            return Ok(true);
        }

        // Shift out the consumed prefix, then refill.
        self.input.data.copy_within(self.input.pos..self.input.len, 0);
        self.input.pos = 0;
        self.input.len = avail;

        while self.input.len < n {
            let fd = self.fd();
            let len = self.input.len;
            let (got, fds) = sys::recv_with_fds(fd, &mut self.input.data[len..])?;
            self.absorb_fds(fds);
            if got == 0 {
                return Ok(false);
            }
            self.input.len += got;
        }
        Ok(true)
    }

    fn try_read_u32(&mut self) -> Result<Option<u32>> {
        if !self.load_at_least(4)? {
            return Ok(None);
        }
        let p = self.input.pos;
        let v = u32::from_le_bytes(self.input.data[p..p + 4].try_into().unwrap());
        self.input.pos += 4;
        Ok(Some(v))
    }

    fn try_read_i32(&mut self) -> Result<Option<i32>> {
        Ok(self.try_read_u32()?.map(|v| v as i32))
    }

    fn try_read_f32(&mut self) -> Result<Option<f32>> {
        Ok(self.try_read_u32()?.map(f32::from_bits))
    }

    fn try_read_zstr(&mut self) -> Result<Option<String>> {
        let mut out = Vec::new();
        loop {
            if self.input.pos == self.input.len && !self.load_at_least(1)? {
                return Ok(None);
            }
            let c = self.input.data[self.input.pos];
            self.input.pos += 1;
            if c == 0 {
                break;
            }
            out.push(c);
        }
        match String::from_utf8(out) {
            Ok(s) => Ok(Some(s)),
            Err(e) => panic!("protocol violation: non-UTF-8 string from worker: {e}"),
        }
    }

    /// Read a `size`-byte payload, spilling past the input buffer if the
    /// payload is larger than it. `Ok(None)` on end-of-stream.
    fn try_read_payload(&mut self, size: usize) -> Result<Option<Vec<u8>>> {
        let mut out = vec![0u8; size];
        let avail = (self.input.len - self.input.pos).min(size);
        out[..avail].copy_from_slice(&self.input.data[self.input.pos..self.input.pos + avail]);
        self.input.pos += avail;

        let mut off = avail;
        while off < size {
            let fd = self.fd();
            let (n, fds) = sys::recv_with_fds(fd, &mut out[off..])?;
            self.absorb_fds(fds);
            if n == 0 {
                return Ok(None);
            }
            off += n;
        }
        Ok(Some(out))
    }

    // -- queries ------------------------------------------------------------

    /// Whether a query is available: buffered input, or the stream
    /// becoming readable within `timeout_ms`.
    pub fn has_pending_query(&self, timeout_ms: i32) -> Result<bool> {
        if self.input.pos != self.input.len {
            return Ok(true);
        }
        Ok(sys::poll_readable(self.fd(), timeout_ms)?)
    }

    /// Tag of the next query, without consuming it.
    pub fn peek_query(&mut self) -> Result<QueryTag> {
        if !self.load_at_least(4)? {
            return Err(EngineError::ChannelClosed);
        }
        let p = self.input.pos;
        let raw = u32::from_le_bytes(self.input.data[p..p + 4].try_into().unwrap());
        match QueryTag::from_u32(raw) {
            Some(tag) => Ok(tag),
            None => panic!(
                "protocol violation: unexpected query tag {:?}",
                unpack_tag(raw)
            ),
        }
    }

    /// Parse one framed query. `Ok(None)` when the stream ends at or
    /// inside a frame boundary.
    pub fn read_query(&mut self) -> Result<Option<Query>> {
        macro_rules! field {
            ($e:expr) => {
                match $e? {
                    Some(v) => v,
                    None => return Ok(None),
                }
            };
        }

        let raw = field!(self.try_read_u32());
        let tag = QueryTag::from_u32(raw).unwrap_or_else(|| {
            panic!(
                "protocol violation: unexpected query tag {:?}",
                unpack_tag(raw)
            )
        });
        let time = field!(self.try_read_i32());

        let kind = match tag {
            QueryTag::Open => QueryKind::Open {
                fid: FileId::new(field!(self.try_read_i32())),
                path: field!(self.try_read_zstr()),
                mode: field!(self.try_read_zstr()),
            },
            QueryTag::Read => QueryKind::Read {
                fid: FileId::new(field!(self.try_read_i32())),
                pos: field!(self.try_read_i32()),
                size: field!(self.try_read_i32()),
            },
            QueryTag::Write => {
                let fid = FileId::new(field!(self.try_read_i32()));
                let pos = field!(self.try_read_i32());
                let size = field!(self.try_read_i32());
                let size = usize::try_from(size)
                    .unwrap_or_else(|_| panic!("protocol violation: negative WRIT size {size}"));
                let data = field!(self.try_read_payload(size));
                QueryKind::Write { fid, pos, data }
            }
            QueryTag::Close => QueryKind::Close {
                fid: FileId::new(field!(self.try_read_i32())),
            },
            QueryTag::Size => QueryKind::Size {
                fid: FileId::new(field!(self.try_read_i32())),
            },
            QueryTag::Seen => QueryKind::Seen {
                fid: FileId::new(field!(self.try_read_i32())),
                pos: field!(self.try_read_i32()),
            },
            QueryTag::Gpic => QueryKind::Gpic {
                path: field!(self.try_read_zstr()),
                kind: field!(self.try_read_i32()),
                page: field!(self.try_read_i32()),
            },
            QueryTag::Spic => QueryKind::Spic {
                path: field!(self.try_read_zstr()),
                cache: PicCache {
                    kind: field!(self.try_read_i32()),
                    page: field!(self.try_read_i32()),
                    bounds: [
                        field!(self.try_read_f32()),
                        field!(self.try_read_f32()),
                        field!(self.try_read_f32()),
                        field!(self.try_read_f32()),
                    ],
                },
            },
            QueryTag::Chld => {
                let pid = field!(self.try_read_u32()) as i32;
                let fd = self
                    .passed_fd
                    .take()
                    .expect("protocol violation: CHLD query without an attached descriptor");
                QueryKind::Chld { pid, fd }
            }
        };

        let query = Query { time, kind };
        trace!(query = %query, "<-");
        Ok(Some(query))
    }

    // -- answers ------------------------------------------------------------

    /// Serialize an answer into the output buffer.
    pub fn write_answer(&mut self, answer: &Answer) -> Result<()> {
        trace!(answer = %answer, "->");
        let mut wire = Vec::with_capacity(16);
        answer.encode_into(&mut wire);
        self.write_bytes(&wire)
    }

    /// Serialize a server-initiated ask into the output buffer.
    pub fn write_ask(&mut self, ask: Ask) -> Result<()> {
        trace!(ask = %ask, "->");
        self.write_bytes(&ask.to_u32().to_le_bytes())
    }

    /// Drain the output buffer to the stream.
    pub fn flush(&mut self) -> Result<()> {
        if self.output.pos > 0 {
            sys::write_all(self.fd(), &self.output.data[..self.output.pos])?;
            self.output.pos = 0;
        }
        Ok(())
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        if self.output.pos + buf.len() <= CHANNEL_BUF_SIZE {
            self.output.data[self.output.pos..self.output.pos + buf.len()].copy_from_slice(buf);
            self.output.pos += buf.len();
            return Ok(());
        }

        self.flush()?;

        if buf.len() > CHANNEL_BUF_SIZE {
            sys::write_all(self.fd(), buf)?;
        } else {
            self.output.data[..buf.len()].copy_from_slice(buf);
            self.output.pos = buf.len();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn attached_pair() -> (Channel, UnixStream, UnixStream) {
        let (engine_end, worker_end) = UnixStream::pair().expect("socketpair");
        let mut channel = Channel::new();
        channel.set_fd(Some(engine_end.as_raw_fd()));
        (channel, engine_end, worker_end)
    }

    #[test]
    fn reads_a_query_written_by_a_worker() {
        let (mut channel, _keep, mut worker) = attached_pair();
        let q = Query {
            time: 42,
            kind: QueryKind::Read {
                fid: FileId::new(3),
                pos: 0,
                size: 64,
            },
        };
        worker.write_all(&q.encode()).expect("write");
        assert_eq!(channel.read_query().expect("read"), Some(q));
    }

    #[test]
    fn peek_does_not_consume() {
        let (mut channel, _keep, mut worker) = attached_pair();
        let q = Query {
            time: 1,
            kind: QueryKind::Size {
                fid: FileId::new(9),
            },
        };
        worker.write_all(&q.encode()).expect("write");
        assert_eq!(channel.peek_query().expect("peek"), QueryTag::Size);
        assert_eq!(channel.read_query().expect("read"), Some(q));
    }

    #[test]
    fn eof_at_frame_boundary_is_none() {
        let (mut channel, _keep, worker) = attached_pair();
        drop(worker);
        assert_eq!(channel.read_query().expect("read"), None);
    }

    #[test]
    fn eof_inside_a_frame_is_none() {
        let (mut channel, _keep, mut worker) = attached_pair();
        let wire = Query {
            time: 7,
            kind: QueryKind::Open {
                fid: FileId::new(1),
                path: "a.tex".to_owned(),
                mode: "r".to_owned(),
            },
        }
        .encode();
        worker.write_all(&wire[..10]).expect("write");
        drop(worker);
        assert_eq!(channel.read_query().expect("read"), None);
    }

    #[test]
    fn large_write_payload_spills_the_input_buffer() {
        let (mut channel, _keep, mut worker) = attached_pair();
        let data = vec![0xAB; CHANNEL_BUF_SIZE * 2 + 17];
        let q = Query {
            time: 0,
            kind: QueryKind::Write {
                fid: FileId::new(5),
                pos: 0,
                data: data.clone(),
            },
        };
        let wire = q.encode();
        let writer = std::thread::spawn(move || {
            worker.write_all(&wire).expect("write");
        });
        let got = channel.read_query().expect("read").expect("query");
        writer.join().expect("join");
        assert_eq!(
            got.kind,
            QueryKind::Write {
                fid: FileId::new(5),
                pos: 0,
                data,
            }
        );
    }

    #[test]
    #[should_panic(expected = "unexpected query tag")]
    fn unknown_tag_panics() {
        let (mut channel, _keep, mut worker) = attached_pair();
        worker.write_all(b"XXXX\0\0\0\0").expect("write");
        let _ = channel.read_query();
    }

    #[test]
    fn scratch_buffer_grows_by_doubling() {
        let mut channel = Channel::new();
        assert_eq!(channel.get_buffer(10).len(), 10);
        assert_eq!(channel.get_buffer(5000).len(), 5000);
        channel.get_buffer(100)[0] = 42;
    }
}
