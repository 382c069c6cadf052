//! Wire protocol between the engine and its TeX worker processes.
//!
//! The protocol is query/answer over a bidirectional byte stream (a Unix
//! socketpair in practice) with ancillary file-descriptor passing for
//! `CHLD`. Messages are framed by a 4-byte ASCII tag; integers are 32-bit
//! little-endian, floats IEEE-754 f32, strings NUL-terminated.
//!
//! [`Channel`] is the engine side: it buffers I/O, peeks and parses
//! queries, and stages answers. Workers (and the test suites standing in
//! for them) use [`Query::encode`] / [`Answer::read_from`].

mod channel;
mod message;
pub mod sys;

pub use channel::{Channel, CLIENT_HANDSHAKE, SERVER_HANDSHAKE};
pub use message::{Answer, AnswerTag, Ask, Query, QueryKind, QueryTag};
