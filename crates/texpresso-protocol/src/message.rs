//! Query, answer, and ask messages with their 4-byte tags.
//!
//! The variant dispatch is a single `match` on the packed tag. Encoding is
//! worker-side (tests and in-process workers); decoding of queries lives in
//! [`crate::channel::Channel`], which owns the input buffering.

use std::fmt;
use std::io::Read;
use std::os::fd::RawFd;

use texpresso_types::encoding::{
    append_f32_le, append_i32_le, append_u32_le, append_zstr, pack_tag, unpack_tag,
};
use texpresso_types::{FileId, PicCache};

// ---------------------------------------------------------------------------
// Query tags
// ---------------------------------------------------------------------------

/// Tag of a worker query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryTag {
    Open,
    Read,
    Write,
    Close,
    Size,
    Seen,
    Gpic,
    Spic,
    Chld,
}

impl QueryTag {
    /// Packed little-endian wire value.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        match self {
            Self::Open => pack_tag(*b"OPEN"),
            Self::Read => pack_tag(*b"READ"),
            Self::Write => pack_tag(*b"WRIT"),
            Self::Close => pack_tag(*b"CLOS"),
            Self::Size => pack_tag(*b"SIZE"),
            Self::Seen => pack_tag(*b"SEEN"),
            Self::Gpic => pack_tag(*b"GPIC"),
            Self::Spic => pack_tag(*b"SPIC"),
            Self::Chld => pack_tag(*b"CHLD"),
        }
    }

    /// Parse a packed wire value; `None` for unknown tags.
    #[must_use]
    pub const fn from_u32(v: u32) -> Option<Self> {
        match unpack_tag(v) {
            [b'O', b'P', b'E', b'N'] => Some(Self::Open),
            [b'R', b'E', b'A', b'D'] => Some(Self::Read),
            [b'W', b'R', b'I', b'T'] => Some(Self::Write),
            [b'C', b'L', b'O', b'S'] => Some(Self::Close),
            [b'S', b'I', b'Z', b'E'] => Some(Self::Size),
            [b'S', b'E', b'E', b'N'] => Some(Self::Seen),
            [b'G', b'P', b'I', b'C'] => Some(Self::Gpic),
            [b'S', b'P', b'I', b'C'] => Some(Self::Spic),
            [b'C', b'H', b'L', b'D'] => Some(Self::Chld),
            _ => None,
        }
    }

    /// ASCII label, for diagnostics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Read => "READ",
            Self::Write => "WRIT",
            Self::Close => "CLOS",
            Self::Size => "SIZE",
            Self::Seen => "SEEN",
            Self::Gpic => "GPIC",
            Self::Spic => "SPIC",
            Self::Chld => "CHLD",
        }
    }
}

impl fmt::Display for QueryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// One framed query from a worker: its timestamp plus the operation.
///
/// `time` is milliseconds since the worker started.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub time: i32,
    pub kind: QueryKind,
}

/// The operation part of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKind {
    /// Open a file into slot `fid`. `mode` follows `fopen` conventions;
    /// only the first byte (`r`/`w`) matters to the engine.
    Open {
        fid: FileId,
        path: String,
        mode: String,
    },
    /// Read `size` bytes at `pos` from slot `fid`.
    Read { fid: FileId, pos: i32, size: i32 },
    /// Write bytes at `pos` into slot `fid`. `fid` −1 redirects to stdout.
    Write {
        fid: FileId,
        pos: i32,
        data: Vec<u8>,
    },
    /// Release slot `fid`.
    Close { fid: FileId },
    /// Ask for the effective size of slot `fid`.
    Size { fid: FileId },
    /// Declare that the worker's processing has reached `pos` in slot
    /// `fid`. Never answered.
    Seen { fid: FileId, pos: i32 },
    /// Probe the graphics bounding-box cache.
    Gpic { path: String, kind: i32, page: i32 },
    /// Fill the graphics bounding-box cache.
    Spic { path: String, cache: PicCache },
    /// The worker forked; `fd` arrived as ancillary data and is the
    /// channel to the new child.
    Chld { pid: i32, fd: RawFd },
}

impl QueryKind {
    /// Tag of this query.
    #[must_use]
    pub fn tag(&self) -> QueryTag {
        match self {
            Self::Open { .. } => QueryTag::Open,
            Self::Read { .. } => QueryTag::Read,
            Self::Write { .. } => QueryTag::Write,
            Self::Close { .. } => QueryTag::Close,
            Self::Size { .. } => QueryTag::Size,
            Self::Seen { .. } => QueryTag::Seen,
            Self::Gpic { .. } => QueryTag::Gpic,
            Self::Spic { .. } => QueryTag::Spic,
            Self::Chld { .. } => QueryTag::Chld,
        }
    }
}

impl Query {
    /// Serialize this query as a worker would put it on the wire.
    ///
    /// `Chld` encodes its pid only; the fd travels as ancillary data (see
    /// [`crate::sys::send_with_fd`]).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        append_u32_le(&mut buf, self.kind.tag().to_u32());
        append_i32_le(&mut buf, self.time);
        match &self.kind {
            QueryKind::Open { fid, path, mode } => {
                append_i32_le(&mut buf, fid.raw());
                append_zstr(&mut buf, path);
                append_zstr(&mut buf, mode);
            }
            QueryKind::Read { fid, pos, size } => {
                append_i32_le(&mut buf, fid.raw());
                append_i32_le(&mut buf, *pos);
                append_i32_le(&mut buf, *size);
            }
            QueryKind::Write { fid, pos, data } => {
                append_i32_le(&mut buf, fid.raw());
                append_i32_le(&mut buf, *pos);
                append_i32_le(&mut buf, data.len() as i32);
                buf.extend_from_slice(data);
            }
            QueryKind::Close { fid } | QueryKind::Size { fid } => {
                append_i32_le(&mut buf, fid.raw());
            }
            QueryKind::Seen { fid, pos } => {
                append_i32_le(&mut buf, fid.raw());
                append_i32_le(&mut buf, *pos);
            }
            QueryKind::Gpic { path, kind, page } => {
                append_zstr(&mut buf, path);
                append_i32_le(&mut buf, *kind);
                append_i32_le(&mut buf, *page);
            }
            QueryKind::Spic { path, cache } => {
                append_zstr(&mut buf, path);
                append_i32_le(&mut buf, cache.kind);
                append_i32_le(&mut buf, cache.page);
                for b in cache.bounds {
                    append_f32_le(&mut buf, b);
                }
            }
            QueryKind::Chld { pid, fd: _ } => {
                append_u32_le(&mut buf, *pid as u32);
            }
        }
        buf
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}ms: {}", self.time, self.kind)
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open { fid, path, mode } => write!(f, "OPEN({fid}, {path:?}, {mode:?})"),
            Self::Read { fid, pos, size } => write!(f, "READ({fid}, {pos}, {size})"),
            Self::Write { fid, pos, data } => write!(f, "WRIT({fid}, {pos}, {})", data.len()),
            Self::Close { fid } => write!(f, "CLOS({fid})"),
            Self::Size { fid } => write!(f, "SIZE({fid})"),
            Self::Seen { fid, pos } => write!(f, "SEEN({fid}, {pos})"),
            Self::Gpic { path, kind, page } => write!(f, "GPIC({path:?}, {kind}, {page})"),
            Self::Spic { path, cache } => write!(
                f,
                "SPIC({path:?}, {}, {}, {:.02}, {:.02}, {:.02}, {:.02})",
                cache.kind,
                cache.page,
                cache.bounds[0],
                cache.bounds[1],
                cache.bounds[2],
                cache.bounds[3]
            ),
            Self::Chld { pid, fd } => write!(f, "CHLD(pid:{pid}, fd:{fd})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Answers
// ---------------------------------------------------------------------------

/// Tag of an engine answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnswerTag {
    Done,
    Pass,
    Size,
    Read,
    Fork,
    Open,
    Gpic,
}

impl AnswerTag {
    /// Packed little-endian wire value.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        match self {
            Self::Done => pack_tag(*b"DONE"),
            Self::Pass => pack_tag(*b"PASS"),
            Self::Size => pack_tag(*b"SIZE"),
            Self::Read => pack_tag(*b"READ"),
            Self::Fork => pack_tag(*b"FORK"),
            Self::Open => pack_tag(*b"OPEN"),
            Self::Gpic => pack_tag(*b"GPIC"),
        }
    }

    /// Parse a packed wire value; `None` for unknown tags.
    #[must_use]
    pub const fn from_u32(v: u32) -> Option<Self> {
        match unpack_tag(v) {
            [b'D', b'O', b'N', b'E'] => Some(Self::Done),
            [b'P', b'A', b'S', b'S'] => Some(Self::Pass),
            [b'S', b'I', b'Z', b'E'] => Some(Self::Size),
            [b'R', b'E', b'A', b'D'] => Some(Self::Read),
            [b'F', b'O', b'R', b'K'] => Some(Self::Fork),
            [b'O', b'P', b'E', b'N'] => Some(Self::Open),
            [b'G', b'P', b'I', b'C'] => Some(Self::Gpic),
            _ => None,
        }
    }

    /// ASCII label, for diagnostics.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Done => "DONE",
            Self::Pass => "PASS",
            Self::Size => "SIZE",
            Self::Read => "READ",
            Self::Fork => "FORK",
            Self::Open => "OPEN",
            Self::Gpic => "GPIC",
        }
    }
}

impl fmt::Display for AnswerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An engine answer to a worker query.
#[derive(Debug, Clone, PartialEq)]
pub enum Answer {
    /// Operation performed.
    Done,
    /// The engine declines; the worker falls back to its own resolution.
    Pass,
    /// The worker must fork before retrying the read.
    Fork,
    /// Effective file size.
    Size(i32),
    /// Bytes served from the effective data of an entry.
    Read(Vec<u8>),
    /// Open succeeded; carries the path as resolved by the engine.
    Open(String),
    /// Cached graphics bounding box.
    Gpic([f32; 4]),
}

impl Answer {
    /// Tag of this answer.
    #[must_use]
    pub fn tag(&self) -> AnswerTag {
        match self {
            Self::Done => AnswerTag::Done,
            Self::Pass => AnswerTag::Pass,
            Self::Fork => AnswerTag::Fork,
            Self::Size(_) => AnswerTag::Size,
            Self::Read(_) => AnswerTag::Read,
            Self::Open(_) => AnswerTag::Open,
            Self::Gpic(_) => AnswerTag::Gpic,
        }
    }

    /// Serialize into `buf` exactly as [`crate::Channel::write_answer`]
    /// puts it on the wire.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        append_u32_le(buf, self.tag().to_u32());
        match self {
            Self::Done | Self::Pass | Self::Fork => {}
            Self::Size(n) => append_i32_le(buf, *n),
            Self::Read(data) => {
                append_i32_le(buf, data.len() as i32);
                buf.extend_from_slice(data);
            }
            Self::Open(path) => {
                append_i32_le(buf, path.len() as i32);
                buf.extend_from_slice(path.as_bytes());
            }
            Self::Gpic(bounds) => {
                for b in bounds {
                    append_f32_le(buf, *b);
                }
            }
        }
    }

    /// Blocking worker-side decode from a stream.
    ///
    /// # Errors
    /// I/O errors from the underlying stream; `InvalidData` on an unknown
    /// tag or a negative payload size.
    pub fn read_from(r: &mut impl Read) -> std::io::Result<Self> {
        fn read_u32(r: &mut impl Read) -> std::io::Result<u32> {
            let mut b = [0u8; 4];
            r.read_exact(&mut b)?;
            Ok(u32::from_le_bytes(b))
        }
        fn read_i32(r: &mut impl Read) -> std::io::Result<i32> {
            let mut b = [0u8; 4];
            r.read_exact(&mut b)?;
            Ok(i32::from_le_bytes(b))
        }
        fn read_f32(r: &mut impl Read) -> std::io::Result<f32> {
            let mut b = [0u8; 4];
            r.read_exact(&mut b)?;
            Ok(f32::from_le_bytes(b))
        }
        fn read_payload(r: &mut impl Read) -> std::io::Result<Vec<u8>> {
            let size = read_i32(r)?;
            let size = usize::try_from(size).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "negative payload size")
            })?;
            let mut data = vec![0u8; size];
            r.read_exact(&mut data)?;
            Ok(data)
        }

        let raw = read_u32(r)?;
        let tag = AnswerTag::from_u32(raw).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown answer tag {:?}", unpack_tag(raw)),
            )
        })?;
        Ok(match tag {
            AnswerTag::Done => Self::Done,
            AnswerTag::Pass => Self::Pass,
            AnswerTag::Fork => Self::Fork,
            AnswerTag::Size => Self::Size(read_i32(r)?),
            AnswerTag::Read => Self::Read(read_payload(r)?),
            AnswerTag::Open => Self::Open(
                String::from_utf8(read_payload(r)?)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?,
            ),
            AnswerTag::Gpic => Self::Gpic([
                read_f32(r)?,
                read_f32(r)?,
                read_f32(r)?,
                read_f32(r)?,
            ]),
        })
    }
}

impl fmt::Display for Answer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(data) => write!(f, "READ {}", data.len()),
            Self::Size(n) => write!(f, "SIZE {n}"),
            Self::Open(path) => write!(f, "OPEN {path:?}"),
            Self::Gpic(b) => write!(f, "GPIC {b:?}"),
            other => f.write_str(other.tag().label()),
        }
    }
}

// ---------------------------------------------------------------------------
// Asks (server-initiated)
// ---------------------------------------------------------------------------

/// Out-of-band request from the engine to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ask {
    /// Ask the worker to flush any buffered `SEEN` notifications.
    Flush,
}

impl Ask {
    /// Packed little-endian wire value.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        match self {
            Self::Flush => pack_tag(*b"FLSH"),
        }
    }
}

impl fmt::Display for Ask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flush => f.write_str("FLSH"),
        }
    }
}
