//! End-to-end tests for the broadcast loop, driving it over real sockets
//! against scripted safekeepers and a scripted primary.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use pq_proto::{
    BeMessage, FeMessage, RowDescriptor, StandbyReply, XLogDataBody, INT4_OID,
    STANDBY_STATUS_UPDATE_TAG, XLOG_HDR_END_POS, XLOG_HDR_SIZE, XLOG_HDR_START_POS,
};
use utils::lsn::Lsn;
use walproposer::protocol::{
    NodeId, SafekeeperInfo, ServerInfo, PG_VERSION_NUM, SK_PROTOCOL_VERSION,
};
use walproposer::proxy::{Proxy, ProxyConf};
use walproposer::upstream::PqWalStream;

const TIMELINE: u32 = 1;
const SEG_SIZE: u32 = 16 * 1024 * 1024;

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        thread::sleep(Duration::from_millis(5));
    }
}

// ---------------------------------------------------------------- safekeeper

enum AckMode {
    Immediate,
    /// Hold each ack until a token arrives.
    Gated(mpsc::Receiver<()>),
}

struct FakeOpts {
    wal_end: u64,
    ack: AckMode,
    /// Close the connection right after receiving the first WAL frame,
    /// without acknowledging it.
    drop_first_frame: bool,
    /// Echo the epoch proposal with a different term.
    corrupt_vote: bool,
    /// Answer the handshake with an incompatible protocol version.
    bad_protocol_version: bool,
}

impl Default for FakeOpts {
    fn default() -> FakeOpts {
        FakeOpts {
            wal_end: 100,
            ack: AckMode::Immediate,
            drop_first_frame: false,
            corrupt_vote: false,
            bad_protocol_version: false,
        }
    }
}

#[derive(Default, Clone)]
struct PeerLog {
    /// (wal_start, wal_end) of every received frame.
    frames: Arc<Mutex<Vec<(u64, u64)>>>,
    proposals: Arc<Mutex<Vec<NodeId>>>,
    connections: Arc<AtomicUsize>,
    quits: Arc<AtomicUsize>,
}

fn spawn_fake_safekeeper(opts: FakeOpts) -> (SocketAddr, PeerLog) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let log = PeerLog::default();
    let served_log = log.clone();
    thread::spawn(move || {
        let mut opts = opts;
        for conn in listener.incoming() {
            let Ok(mut sock) = conn else { break };
            served_log.connections.fetch_add(1, Ordering::SeqCst);
            // an error just means the proxy went away; wait for it to retry
            let _ = serve_safekeeper_conn(&mut sock, &mut opts, &served_log);
        }
    });
    (addr, log)
}

fn serve_safekeeper_conn(
    sock: &mut TcpStream,
    opts: &mut FakeOpts,
    log: &PeerLog,
) -> std::io::Result<()> {
    // greeting from the proxy
    let mut buf = vec![0u8; ServerInfo::ENCODED_LEN];
    sock.read_exact(&mut buf)?;
    let mut bytes = Bytes::from(buf);
    let greeting = ServerInfo::from_bytes(&mut bytes).unwrap();
    assert_eq!(greeting.protocol_version, SK_PROTOCOL_VERSION);
    assert_eq!(greeting.timeline, TIMELINE);

    // our answer
    let reply = SafekeeperInfo {
        server: ServerInfo {
            protocol_version: if opts.bad_protocol_version {
                999
            } else {
                SK_PROTOCOL_VERSION
            },
            pg_version: PG_VERSION_NUM,
            wal_seg_size: greeting.wal_seg_size,
            timeline: greeting.timeline,
            node_id: NodeId {
                term: 0,
                uuid: [7; 16],
            },
            wal_end: Lsn(opts.wal_end),
        },
    };
    let mut out = BytesMut::new();
    reply.write(&mut out);
    sock.write_all(&out)?;

    // the epoch proposal, echoed back verbatim or corrupted
    let mut buf = vec![0u8; NodeId::ENCODED_LEN];
    sock.read_exact(&mut buf)?;
    let mut bytes = Bytes::from(buf);
    let proposal = NodeId::from_bytes(&mut bytes).unwrap();
    log.proposals.lock().unwrap().push(proposal);
    let verdict = if opts.corrupt_vote {
        NodeId {
            term: proposal.term + 1,
            ..proposal
        }
    } else {
        proposal
    };
    let mut out = BytesMut::new();
    verdict.write(&mut out);
    sock.write_all(&out)?;

    // streaming: frames are delimited by their patched end position
    loop {
        let mut hdr = [0u8; XLOG_HDR_SIZE];
        sock.read_exact(&mut hdr)?;
        match hdr[0] {
            b'w' => {
                let start = BigEndian::read_u64(&hdr[XLOG_HDR_START_POS..XLOG_HDR_START_POS + 8]);
                let end = BigEndian::read_u64(&hdr[XLOG_HDR_END_POS..XLOG_HDR_END_POS + 8]);
                let mut payload = vec![0u8; (end - start) as usize];
                sock.read_exact(&mut payload)?;
                log.frames.lock().unwrap().push((start, end));
                if opts.drop_first_frame {
                    opts.drop_first_frame = false;
                    return Ok(());
                }
                if let AckMode::Gated(rx) = &opts.ack {
                    // a closed gate means the test is done holding us back
                    let _ = rx.recv();
                }
                let mut ack = [0u8; 8];
                LittleEndian::write_u64(&mut ack, end);
                sock.write_all(&ack)?;
            }
            b'q' => {
                log.quits.fetch_add(1, Ordering::SeqCst);
                return Ok(());
            }
            other => panic!("unexpected frame tag {other}"),
        }
    }
}

/// A listener that accepts connections and never answers anything.
fn spawn_silent_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let mut held = Vec::new();
        for conn in listener.incoming() {
            if let Ok(sock) = conn {
                held.push(sock);
            }
        }
    });
    addr
}

// ------------------------------------------------------------------- primary

#[derive(Default, Clone)]
struct PrimaryLog {
    queries: Arc<Mutex<Vec<String>>>,
    /// flush positions of received standby status updates
    feedback: Arc<Mutex<Vec<u64>>>,
}

/// Scripted records as `((wal_pos, body_len), feedback_to_wait_for)`. The
/// primary sends a record, then blocks until it sees the given flush position
/// acknowledged; when the script runs out it closes the stream.
fn spawn_fake_primary(
    wal_end: u64,
    script: Vec<((u64, usize), Option<u64>)>,
) -> (SocketAddr, PrimaryLog) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let log = PrimaryLog::default();
    let served_log = log.clone();
    thread::spawn(move || {
        if let Ok((mut sock, _)) = listener.accept() {
            let _ = serve_primary(&mut sock, wal_end, script, &served_log);
        }
    });
    (addr, log)
}

fn serve_primary(
    sock: &mut TcpStream,
    wal_end: u64,
    script: Vec<((u64, usize), Option<u64>)>,
    log: &PrimaryLog,
) -> anyhow::Result<()> {
    // length-prefixed, untagged startup packet
    let mut lenbuf = [0u8; 4];
    sock.read_exact(&mut lenbuf)?;
    let len = BigEndian::read_u32(&lenbuf) as usize;
    let mut rest = vec![0u8; len - 4];
    sock.read_exact(&mut rest)?;
    let mut out = BytesMut::new();
    BeMessage::write(&mut out, &BeMessage::AuthenticationOk);
    BeMessage::write(&mut out, &BeMessage::ReadyForQuery);
    sock.write_all(&out)?;

    // answer queries until replication starts
    let mut inbuf = BytesMut::new();
    loop {
        let FeMessage::Query(q) = read_fe(sock, &mut inbuf)? else {
            anyhow::bail!("unexpected frontend message");
        };
        let q = String::from_utf8(q.to_vec())?;
        log.queries.lock().unwrap().push(q.clone());
        let mut out = BytesMut::new();
        if q == "IDENTIFY_SYSTEM" {
            let lsn = Lsn(wal_end).to_string();
            let timeline = TIMELINE.to_string();
            BeMessage::write(
                &mut out,
                &BeMessage::RowDescription(&[
                    RowDescriptor::text_col(b"systemid"),
                    RowDescriptor {
                        name: b"timeline",
                        typoid: INT4_OID,
                        typlen: 4,
                    },
                    RowDescriptor::text_col(b"xlogpos"),
                    RowDescriptor::text_col(b"dbname"),
                ]),
            );
            BeMessage::write(
                &mut out,
                &BeMessage::DataRow(&[
                    Some(b"314159"),
                    Some(timeline.as_bytes()),
                    Some(lsn.as_bytes()),
                    None,
                ]),
            );
            BeMessage::write(&mut out, &BeMessage::CommandComplete(b"IDENTIFY_SYSTEM"));
            BeMessage::write(&mut out, &BeMessage::ReadyForQuery);
            sock.write_all(&out)?;
        } else if q == "SHOW wal_segment_size" {
            BeMessage::write(
                &mut out,
                &BeMessage::RowDescription(&[RowDescriptor::text_col(b"wal_segment_size")]),
            );
            BeMessage::write(&mut out, &BeMessage::DataRow(&[Some(b"16MB")]));
            BeMessage::write(&mut out, &BeMessage::CommandComplete(b"SHOW"));
            BeMessage::write(&mut out, &BeMessage::ReadyForQuery);
            sock.write_all(&out)?;
        } else if q.starts_with("START_REPLICATION") {
            BeMessage::write(&mut out, &BeMessage::CopyBothResponse);
            sock.write_all(&out)?;
            break;
        } else {
            anyhow::bail!("unexpected query {q}");
        }
    }

    // stream the scripted records
    for ((pos, body_len), expect) in script {
        let body = vec![0xabu8; body_len];
        let mut out = BytesMut::new();
        BeMessage::write(
            &mut out,
            &BeMessage::XLogData(XLogDataBody {
                wal_start: pos,
                wal_end: 0, // the proxy overwrites this field anyway
                timestamp: 0,
                data: &body,
            }),
        );
        sock.write_all(&out)?;
        if let Some(expected_flush) = expect {
            loop {
                let FeMessage::CopyData(data) = read_fe(sock, &mut inbuf)? else {
                    anyhow::bail!("unexpected frontend message");
                };
                assert_eq!(data[0], STANDBY_STATUS_UPDATE_TAG);
                let reply = StandbyReply::parse(&data[1..]).unwrap();
                assert_eq!(reply.write_lsn, reply.flush_lsn);
                log.feedback.lock().unwrap().push(reply.flush_lsn);
                if reply.flush_lsn >= expected_flush {
                    break;
                }
            }
        }
    }
    Ok(()) // dropping the socket ends the stream
}

fn read_fe(sock: &mut TcpStream, buf: &mut BytesMut) -> anyhow::Result<FeMessage> {
    loop {
        if let Some(msg) = FeMessage::parse(buf)? {
            return Ok(msg);
        }
        let mut chunk = [0u8; 8192];
        let n = sock.read(&mut chunk)?;
        if n == 0 {
            anyhow::bail!("client went away");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

// --------------------------------------------------------------------- proxy

fn start_proxy(
    primary: SocketAddr,
    safekeepers: Vec<SocketAddr>,
    quorum: usize,
) -> thread::JoinHandle<anyhow::Result<Lsn>> {
    thread::spawn(move || {
        let mut upstream = PqWalStream::connect(primary, "test", "walproposer-test")?;
        let identity = upstream.identify()?;
        let wal_seg_size = upstream.show_wal_segment_size()?;
        assert_eq!(wal_seg_size, SEG_SIZE);
        let server_info = ServerInfo {
            protocol_version: SK_PROTOCOL_VERSION,
            pg_version: PG_VERSION_NUM,
            wal_seg_size,
            timeline: identity.timeline,
            node_id: NodeId {
                term: 0,
                uuid: [1; 16],
            },
            wal_end: identity.wal_end,
        };
        let conf = ProxyConf {
            quorum,
            safekeepers: safekeepers
                .iter()
                .map(|a| (a.ip().to_string(), a.port()))
                .collect(),
        };
        let mut proxy = Proxy::new(conf, server_info, upstream);
        proxy.run()?;
        Ok(proxy.last_ack_pos())
    })
}

// --------------------------------------------------------------------- tests

#[test]
fn quorum_commit_happy_path() {
    let peers: Vec<_> = (0..3)
        .map(|_| spawn_fake_safekeeper(FakeOpts::default()))
        .collect();
    let (primary, plog) = spawn_fake_primary(
        100,
        vec![
            ((100, 64), Some(164)),
            ((200, 64), Some(264)),
            ((300, 64), Some(364)),
        ],
    );

    let handle = start_proxy(primary, peers.iter().map(|(a, _)| *a).collect(), 2);
    let last_ack = handle.join().unwrap().unwrap();
    assert_eq!(last_ack, Lsn(364));
    assert_eq!(&*plog.feedback.lock().unwrap(), &[164, 264, 364]);
    assert!(plog
        .queries
        .lock()
        .unwrap()
        .iter()
        .any(|q| q == "START_REPLICATION 0/0 TIMELINE 1"));

    for (_, log) in &peers {
        wait_until("all frames and the quit marker", || {
            log.frames.lock().unwrap().len() == 3 && log.quits.load(Ordering::SeqCst) == 1
        });
        assert_eq!(
            &*log.frames.lock().unwrap(),
            &[(100, 164), (200, 264), (300, 364)]
        );
        let proposals = log.proposals.lock().unwrap();
        assert_eq!(proposals.len(), 1);
        // term 0 everywhere, so the claimed epoch is term 1
        assert_eq!(proposals[0].term, 1);
    }
}

#[test]
fn slow_peer_holds_queue_without_feedback_regression() {
    let (gate_tx, gate_rx) = mpsc::channel();
    let (fast0, log0) = spawn_fake_safekeeper(FakeOpts::default());
    let (fast1, _log1) = spawn_fake_safekeeper(FakeOpts::default());
    let (slow, slow_log) = spawn_fake_safekeeper(FakeOpts {
        ack: AckMode::Gated(gate_rx),
        ..FakeOpts::default()
    });
    let (primary, plog) =
        spawn_fake_primary(100, vec![((100, 64), Some(164)), ((200, 64), Some(264))]);

    let handle = start_proxy(primary, vec![fast0, fast1, slow], 2);

    // the fast majority alone must drive the feedback to 264
    wait_until("feedback to reach 264", || {
        plog.feedback.lock().unwrap().last() == Some(&264)
    });
    // now let the laggard ack both records so the queue can drain
    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();

    let last_ack = handle.join().unwrap().unwrap();
    assert_eq!(last_ack, Lsn(264));
    // feedback advanced strictly, one step per record, and never regressed
    assert_eq!(&*plog.feedback.lock().unwrap(), &[164, 264]);
    wait_until("the slow peer to receive both records", || {
        slow_log.frames.lock().unwrap().len() == 2
    });
    assert_eq!(&*slow_log.frames.lock().unwrap(), &[(100, 164), (200, 264)]);
    assert_eq!(&*log0.frames.lock().unwrap(), &[(100, 164), (200, 264)]);
}

#[test]
fn dropped_peer_reconnects_and_is_resent_unacked_wal() {
    let (fast0, _) = spawn_fake_safekeeper(FakeOpts::default());
    let (flaky, flaky_log) = spawn_fake_safekeeper(FakeOpts {
        drop_first_frame: true,
        ..FakeOpts::default()
    });
    let (fast1, _) = spawn_fake_safekeeper(FakeOpts::default());
    let (primary, _plog) = spawn_fake_primary(100, vec![((100, 64), Some(164))]);

    let handle = start_proxy(primary, vec![fast0, flaky, fast1], 2);
    let last_ack = handle.join().unwrap().unwrap();
    assert_eq!(last_ack, Lsn(164));

    // the flaky peer went through connect + handshake + vote twice and got
    // the same record again after rejoining
    wait_until("the flaky peer to be resent the record", || {
        flaky_log.frames.lock().unwrap().len() == 2
    });
    assert_eq!(flaky_log.connections.load(Ordering::SeqCst), 2);
    assert_eq!(flaky_log.proposals.lock().unwrap().len(), 2);
    assert_eq!(&*flaky_log.frames.lock().unwrap(), &[(100, 164), (100, 164)]);
}

#[test]
fn no_quorum_means_no_streaming() {
    let (responsive, log) = spawn_fake_safekeeper(FakeOpts::default());
    let silent0 = spawn_silent_listener();
    let silent1 = spawn_silent_listener();
    let (primary, plog) = spawn_fake_primary(100, vec![]);

    // the loop will wait forever; leave it behind once the test is done
    let _ = start_proxy(primary, vec![responsive, silent0, silent1], 2);

    thread::sleep(Duration::from_millis(500));
    let queries = plog.queries.lock().unwrap();
    assert!(
        !queries.iter().any(|q| q.starts_with("START_REPLICATION")),
        "replication must not start below quorum, got {queries:?}"
    );
    assert!(
        log.proposals.lock().unwrap().is_empty(),
        "no epoch proposal may be sent below quorum"
    );
}

#[test]
fn epoch_rejection_aborts_the_proxy() {
    let (honest, _) = spawn_fake_safekeeper(FakeOpts::default());
    let (rogue0, _) = spawn_fake_safekeeper(FakeOpts {
        corrupt_vote: true,
        ..FakeOpts::default()
    });
    let (rogue1, _) = spawn_fake_safekeeper(FakeOpts {
        corrupt_vote: true,
        ..FakeOpts::default()
    });
    let (primary, _plog) = spawn_fake_primary(100, vec![]);

    let handle = start_proxy(primary, vec![honest, rogue0, rogue1], 2);
    let err = handle.join().unwrap().unwrap_err();
    assert!(
        format!("{err:#}").contains("rejected our connection request"),
        "unexpected error: {err:#}"
    );
}

#[test]
fn incompatible_peer_is_kept_out_of_the_quorum() {
    let (good0, _) = spawn_fake_safekeeper(FakeOpts::default());
    let (good1, _) = spawn_fake_safekeeper(FakeOpts::default());
    let (old, old_log) = spawn_fake_safekeeper(FakeOpts {
        bad_protocol_version: true,
        ..FakeOpts::default()
    });
    let (primary, plog) = spawn_fake_primary(100, vec![((100, 64), Some(164))]);

    let handle = start_proxy(primary, vec![good0, good1, old], 2);
    let last_ack = handle.join().unwrap().unwrap();
    assert_eq!(last_ack, Lsn(164));
    assert_eq!(&*plog.feedback.lock().unwrap(), &[164]);
    assert!(
        old_log.proposals.lock().unwrap().is_empty(),
        "a peer speaking the wrong protocol version must never see a proposal"
    );
}
