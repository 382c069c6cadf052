//! Wire round-trip coverage: every query variant a worker can send must
//! decode back to itself through the channel, including `WRIT` payloads
//! and the `CHLD` ancillary descriptor.

use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use proptest::prelude::*;
use texpresso_protocol::{sys, Channel, Query, QueryKind, CLIENT_HANDSHAKE, SERVER_HANDSHAKE};
use texpresso_types::{FileId, PicCache};

fn attached_pair() -> (Channel, UnixStream, UnixStream) {
    let (engine_end, worker_end) = UnixStream::pair().expect("socketpair");
    let mut channel = Channel::new();
    channel.set_fd(Some(engine_end.as_raw_fd()));
    (channel, engine_end, worker_end)
}

fn round_trip(kind: QueryKind, time: i32) {
    let (mut channel, _keep, mut worker) = attached_pair();
    let query = Query { time, kind };
    worker.write_all(&query.encode()).expect("write");
    let decoded = channel.read_query().expect("read").expect("query");
    assert_eq!(decoded, query);
}

#[test]
fn every_fixed_variant_round_trips() {
    round_trip(
        QueryKind::Open {
            fid: FileId::new(3),
            path: "/t/main.tex".to_owned(),
            mode: "rb".to_owned(),
        },
        100,
    );
    round_trip(
        QueryKind::Read {
            fid: FileId::new(3),
            pos: 128,
            size: 4096,
        },
        101,
    );
    round_trip(
        QueryKind::Write {
            fid: FileId::new(4),
            pos: 0,
            data: b"\\documentclass{article}".to_vec(),
        },
        102,
    );
    round_trip(
        QueryKind::Close {
            fid: FileId::new(3),
        },
        103,
    );
    round_trip(
        QueryKind::Size {
            fid: FileId::new(3),
        },
        104,
    );
    round_trip(
        QueryKind::Seen {
            fid: FileId::new(3),
            pos: 17,
        },
        105,
    );
    round_trip(
        QueryKind::Gpic {
            path: "figure.pdf".to_owned(),
            kind: 2,
            page: 0,
        },
        106,
    );
    round_trip(
        QueryKind::Spic {
            path: "figure.pdf".to_owned(),
            cache: PicCache {
                kind: 2,
                page: 0,
                bounds: [0.0, 0.0, 595.0, 842.0],
            },
        },
        107,
    );
}

#[test]
fn chld_descriptor_arrives_through_ancillary_data() {
    let (mut channel, _keep, worker) = attached_pair();
    let (child_end, _child_peer) = UnixStream::pair().expect("socketpair");

    let query = Query {
        time: 650,
        kind: QueryKind::Chld {
            pid: 4242,
            fd: child_end.as_raw_fd(),
        },
    };
    sys::send_with_fd(
        worker.as_raw_fd(),
        &query.encode(),
        Some(child_end.as_raw_fd()),
    )
    .expect("send");

    let decoded = channel.read_query().expect("read").expect("query");
    match decoded.kind {
        QueryKind::Chld { pid, fd } => {
            assert_eq!(pid, 4242);
            assert!(fd >= 0);
            sys::close_fd(fd);
        }
        other => panic!("expected CHLD, got {other:?}"),
    }
    assert_eq!(decoded.time, 650);
}

#[test]
fn handshake_succeeds_against_a_compatible_worker() {
    let (mut channel, _keep, mut worker) = attached_pair();
    worker.write_all(CLIENT_HANDSHAKE).expect("write");
    assert!(channel.handshake().expect("handshake"));

    // The engine wrote its magic first.
    let mut server = [0u8; 12];
    use std::io::Read;
    worker.read_exact(&mut server).expect("read");
    assert_eq!(&server, SERVER_HANDSHAKE);
}

#[test]
fn handshake_rejects_a_wrong_magic() {
    let (mut channel, _keep, mut worker) = attached_pair();
    worker.write_all(b"TEXPRESSOX99").expect("write");
    assert!(!channel.handshake().expect("handshake"));
}

#[test]
fn handshake_tolerates_a_silent_worker() {
    let (mut channel, _keep, worker) = attached_pair();
    drop(worker);
    // Short (empty) reply reads as "not yet negotiated".
    assert!(channel.handshake().expect("handshake"));
}

proptest! {
    #[test]
    fn prop_read_query_inverts_encode(
        time in 0i32..1_000_000,
        fid in 0i32..1024,
        pos in 0i32..1_000_000,
        size in 0i32..100_000,
        path in "[a-zA-Z0-9_./-]{1,64}",
        data in proptest::collection::vec(any::<u8>(), 0..2048),
    ) {
        let cases = vec![
            QueryKind::Open { fid: FileId::new(fid), path: path.clone(), mode: "r".to_owned() },
            QueryKind::Read { fid: FileId::new(fid), pos, size },
            QueryKind::Write { fid: FileId::new(fid), pos, data },
            QueryKind::Seen { fid: FileId::new(fid), pos },
            QueryKind::Gpic { path, kind: size, page: pos },
        ];
        for kind in cases {
            let (mut channel, _keep, mut worker) = attached_pair();
            let query = Query { time, kind };
            worker.write_all(&query.encode()).expect("write");
            let decoded = channel.read_query().expect("read").expect("query");
            prop_assert_eq!(decoded, query);
        }
    }
}
