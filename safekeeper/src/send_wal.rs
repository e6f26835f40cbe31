//! WAL re-streaming: per-client walsender sessions over blocking sockets,
//! gated on the flush notifier, plus the registry that tracks them.

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use regex::Regex;
use serde::Serialize;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::wal_storage::SegmentStore;
use crate::SafekeeperConf;
use pq_proto::{
    get_current_timestamp, BeMessage, FeMessage, RowDescriptor, StandbyReply, TimeLineID,
    XLogDataBody, HOT_STANDBY_FEEDBACK_TAG, INT4_OID, MAX_MESSAGE_LEN, MAX_SEND_SIZE,
    STANDBY_STATUS_UPDATE_TAG,
};
use utils::lsn::Lsn;

static START_REPLICATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"START_REPLICATION(?: PHYSICAL)? ([[:xdigit:]]+/[[:xdigit:]]+) TIMELINE ([0-9]+)")
        .unwrap()
});

/// Registry of active walsenders plus the flush notifier they block on.
pub struct WalSenders {
    shared: Mutex<WalSendersShared>,
    cond: Condvar,
}

struct WalSendersShared {
    /// WAL below this position is durable and may be served.
    flush_lsn: Lsn,
    streaming: bool,
    slots: Vec<Option<WalSenderState>>,
    threads: Vec<JoinHandle<()>>,
}

// Serialized is used only for pretty printing in debug output.
#[derive(Debug, Clone, Serialize)]
pub struct WalSenderState {
    pub addr: SocketAddr,
    /// Most recent progress report from this client, if any.
    pub last_reply: Option<StandbyReply>,
}

pub type WalSenderId = usize;

impl WalSenders {
    pub fn new(flush_lsn: Lsn) -> Arc<WalSenders> {
        Arc::new(WalSenders {
            shared: Mutex::new(WalSendersShared {
                flush_lsn,
                streaming: true,
                slots: Vec::new(),
                threads: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }

    /// Durable WAL advanced: remember the new flush position and wake every
    /// sender. The caller guarantees monotonicity.
    pub fn notify_flush_lsn(&self, lsn: Lsn) {
        let mut shared = self.shared.lock();
        debug_assert!(lsn >= shared.flush_lsn);
        shared.flush_lsn = lsn;
        self.cond.notify_all();
    }

    pub fn flush_lsn(&self) -> Lsn {
        self.shared.lock().flush_lsn
    }

    pub fn is_streaming(&self) -> bool {
        self.shared.lock().streaming
    }

    /// Get state of all registered walsenders.
    pub fn get_all(&self) -> Vec<WalSenderState> {
        self.shared.lock().slots.iter().flatten().cloned().collect()
    }

    /// Track a spawned sender thread so `stop` can join it.
    pub fn register_thread(&self, handle: JoinHandle<()>) {
        self.shared.lock().threads.push(handle);
    }

    /// Register a new walsender. The returned guard frees the slot on drop.
    fn register(self: &Arc<WalSenders>, addr: SocketAddr) -> WalSenderGuard {
        let slots = &mut self.shared.lock().slots;
        let state = WalSenderState {
            addr,
            last_reply: None,
        };
        // find a free slot or add one
        let id = if let Some(pos) = slots.iter().position(|s| s.is_none()) {
            slots[pos] = Some(state);
            pos
        } else {
            slots.push(Some(state));
            slots.len() - 1
        };
        WalSenderGuard {
            id,
            walsenders: self.clone(),
        }
    }

    fn record_standby_reply(&self, id: WalSenderId, reply: &StandbyReply) {
        let mut shared = self.shared.lock();
        if let Some(slot) = shared.slots[id].as_mut() {
            slot.last_reply = Some(*reply);
        }
    }

    fn unregister(&self, id: WalSenderId) {
        self.shared.lock().slots[id] = None;
    }

    /// Block until the flush position advances past `pos` or streaming stops.
    /// `None` means shutdown.
    fn wait_for_lsn(&self, pos: Lsn) -> Option<Lsn> {
        let mut shared = self.shared.lock();
        while shared.streaming && shared.flush_lsn <= pos {
            self.cond.wait(&mut shared);
        }
        shared.streaming.then_some(shared.flush_lsn)
    }

    /// Stop streaming and join every sender thread one by one, releasing the
    /// lock in between so exiting senders can unregister.
    pub fn stop(&self) {
        self.shared.lock().streaming = false;
        self.cond.notify_all();
        loop {
            let handle = self.shared.lock().threads.pop();
            match handle {
                Some(handle) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }
    }
}

/// Scope guard for a slot in the registry.
pub struct WalSenderGuard {
    id: WalSenderId,
    walsenders: Arc<WalSenders>,
}

impl WalSenderGuard {
    pub fn id(&self) -> WalSenderId {
        self.id
    }
}

impl Drop for WalSenderGuard {
    fn drop(&mut self) {
        self.walsenders.unregister(self.id);
    }
}

/// Run one replication client session to completion: discard the startup
/// packet, answer commands until `START_REPLICATION`, then stream stored WAL
/// as the flush position advances. `startup_packet_len` is what remains of
/// the startup packet after its length word.
pub fn run_sender(
    conf: &SafekeeperConf,
    store: &dyn SegmentStore,
    senders: &Arc<WalSenders>,
    mut sock: TcpStream,
    peer_addr: SocketAddr,
    startup_packet_len: usize,
) -> Result<()> {
    // the startup packet carries nothing we use
    let mut startup = vec![0u8; startup_packet_len];
    sock.read_exact(&mut startup)
        .context("could not read startup packet")?;

    let mut out = BytesMut::new();
    BeMessage::write(&mut out, &BeMessage::AuthenticationOk);
    BeMessage::write(&mut out, &BeMessage::ReadyForQuery);
    sock.write_all(&out)?;

    // answer commands until the client switches to replication
    let mut inbuf = BytesMut::new();
    let (mut startpos, timeline) = loop {
        let query = match read_fe_message(&mut sock, &mut inbuf)? {
            FeMessage::Query(q) => q,
            FeMessage::Terminate => return Ok(()),
            other => bail!("unexpected message {:?} while waiting for a command", other),
        };
        let query = std::str::from_utf8(&query)?.trim().to_owned();
        info!("got query {:?} from {}", query, peer_addr);
        if query == "IDENTIFY_SYSTEM" {
            handle_identify_system(&mut sock, conf, senders)?;
        } else if let Some(caps) = START_REPLICATION_RE.captures(&query) {
            let start_lsn: Lsn = caps[1]
                .parse()
                .context("parse start LSN from START_REPLICATION command")?;
            let timeline: TimeLineID = caps[2]
                .parse()
                .context("parse timeline from START_REPLICATION command")?;
            let mut out = BytesMut::new();
            BeMessage::write(&mut out, &BeMessage::CopyBothResponse);
            sock.write_all(&out)?;
            break (start_lsn, timeline);
        } else if query.to_ascii_lowercase() == "show wal_segment_size" {
            handle_show_wal_segment_size(&mut sock, conf)?;
        } else {
            bail!("unsupported command '{query}'");
        }
    };

    // a client without a position gets everything that is durable now
    if startpos == Lsn::INVALID {
        startpos = senders.flush_lsn();
    }
    // always start streaming at the beginning of a segment
    let wal_seg_size = conf.wal_seg_size;
    startpos = startpos.segment_lsn(wal_seg_size);
    info!("streaming WAL for timeline {} from {}", timeline, startpos);

    let guard = senders.register(peer_addr);
    let mut wal_file: Option<File> = None;
    let mut send_buf = vec![0u8; MAX_SEND_SIZE];

    while let Some(flush_lsn) = senders.wait_for_lsn(startpos) {
        // the client may have reported progress in the meantime
        drain_replica_feedback(&mut sock, senders, guard.id())?;

        let file = match wal_file.take() {
            Some(file) => wal_file.insert(file),
            None => wal_file.insert(open_segment_at(store, timeline, startpos, wal_seg_size)?),
        };

        // cap each chunk to the frame limit and to the current segment
        let send_size = (flush_lsn.0 - startpos.0) as usize;
        let send_size = send_size.min(MAX_SEND_SIZE);
        let send_size = send_size.min(wal_seg_size - startpos.segment_offset(wal_seg_size));
        let send_buf = &mut send_buf[..send_size];
        file.read_exact(send_buf)
            .with_context(|| format!("could not read {send_size} bytes of WAL at {startpos}"))?;

        let mut out = BytesMut::with_capacity(send_size + 32);
        BeMessage::write(
            &mut out,
            &BeMessage::XLogData(XLogDataBody {
                wal_start: startpos.0,
                wal_end: flush_lsn.0,
                timestamp: get_current_timestamp(),
                data: send_buf,
            }),
        );
        sock.write_all(&out)?;
        debug!(
            "sent {} bytes of WAL {}-{}",
            send_size,
            startpos,
            startpos + send_size as u64
        );

        startpos += send_size as u64;
        if startpos.segment_offset(wal_seg_size) == 0 {
            // crossed into the next segment, reopen on the next pass
            wal_file = None;
        }
    }
    Ok(())
}

fn open_segment_at(
    store: &dyn SegmentStore,
    timeline: TimeLineID,
    pos: Lsn,
    wal_seg_size: usize,
) -> Result<File> {
    let mut file = store.open_segment(timeline, pos.segment_number(wal_seg_size))?;
    let offs = pos.segment_offset(wal_seg_size);
    if offs > 0 {
        file.seek(SeekFrom::Start(offs as u64))?;
    }
    Ok(file)
}

/// Consume any feedback frames the client has sent, without blocking on an
/// idle connection. Progress reports are recorded, everything else is logged
/// and skipped.
fn drain_replica_feedback(
    sock: &mut TcpStream,
    senders: &Arc<WalSenders>,
    id: WalSenderId,
) -> Result<()> {
    loop {
        sock.set_nonblocking(true)?;
        let got = {
            let mut first = [0u8; 5];
            match sock.read(&mut first) {
                Ok(0) => {
                    let _ = sock.set_nonblocking(false);
                    bail!("replica closed the connection");
                }
                Ok(n) => {
                    sock.set_nonblocking(false)?;
                    (first, n)
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    sock.set_nonblocking(false)?;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    sock.set_nonblocking(false)?;
                    continue;
                }
                Err(e) => {
                    let _ = sock.set_nonblocking(false);
                    return Err(e).context("could not read replica feedback");
                }
            }
        };
        // a frame has started; finish it in blocking mode
        let (mut hdr, n) = got;
        if n < hdr.len() {
            sock.read_exact(&mut hdr[n..])?;
        }
        let tag = hdr[0];
        let len = BigEndian::read_u32(&hdr[1..5]) as usize;
        if !(4..=MAX_MESSAGE_LEN).contains(&len) {
            bail!("invalid replica message length {len}");
        }
        let mut body = vec![0u8; len - 4];
        sock.read_exact(&mut body)?;
        if tag != b'd' {
            info!("unexpected replica message '{}'", tag as char);
            continue;
        }
        match body.first() {
            Some(&STANDBY_STATUS_UPDATE_TAG) => match StandbyReply::parse(&body[1..]) {
                Ok(reply) => senders.record_standby_reply(id, &reply),
                Err(e) => warn!("could not parse standby reply: {e}"),
            },
            Some(&HOT_STANDBY_FEEDBACK_TAG) => debug!("ignoring hot standby feedback"),
            other => info!("unexpected replica feedback tag {other:?}"),
        }
    }
}

/// `IDENTIFY_SYSTEM`: one row with our system id, timeline and current flush
/// position.
fn handle_identify_system(
    sock: &mut TcpStream,
    conf: &SafekeeperConf,
    senders: &Arc<WalSenders>,
) -> Result<()> {
    let sysid = conf.system_id.to_string();
    let timeline = conf.timeline.to_string();
    let lsn = senders.flush_lsn().to_string();
    let mut out = BytesMut::new();
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
            Some(sysid.as_bytes()),
            Some(timeline.as_bytes()),
            Some(lsn.as_bytes()),
            None,
        ]),
    );
    BeMessage::write(&mut out, &BeMessage::CommandComplete(b"IDENTIFY_SYSTEM"));
    BeMessage::write(&mut out, &BeMessage::ReadyForQuery);
    sock.write_all(&out)?;
    Ok(())
}

/// `SHOW wal_segment_size`, which replication tooling asks before streaming.
fn handle_show_wal_segment_size(sock: &mut TcpStream, conf: &SafekeeperConf) -> Result<()> {
    let value = if conf.wal_seg_size % (1024 * 1024) == 0 {
        format!("{}MB", conf.wal_seg_size / 1024 / 1024)
    } else {
        format!("{}kB", conf.wal_seg_size / 1024)
    };
    let mut out = BytesMut::new();
    BeMessage::write(
        &mut out,
        &BeMessage::RowDescription(&[RowDescriptor::text_col(b"wal_segment_size")]),
    );
    BeMessage::write(&mut out, &BeMessage::DataRow(&[Some(value.as_bytes())]));
    BeMessage::write(&mut out, &BeMessage::CommandComplete(b"SELECT 1"));
    BeMessage::write(&mut out, &BeMessage::ReadyForQuery);
    sock.write_all(&out)?;
    Ok(())
}

fn read_fe_message(sock: &mut TcpStream, buf: &mut BytesMut) -> Result<FeMessage> {
    loop {
        if let Some(msg) = FeMessage::parse(buf)? {
            return Ok(msg);
        }
        let mut chunk = [0u8; 8192];
        let n = sock.read(&mut chunk)?;
        if n == 0 {
            bail!("client went away while waiting for a command");
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
