//! WAL broadcast event loop.
//!
//! A single thread multiplexes the upstream replication socket and every
//! safekeeper socket through one readiness poll per iteration. All per-peer
//! work happens in nonblocking steps driven by the states in [`crate::peer`];
//! there is nothing to lock because nothing leaves this thread.

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use std::cmp::max;
use std::io::Write;
use tracing::{debug, error, info, warn};

use crate::msg_queue::{quorum_lsn, MessageQueue, WalMessage};
use crate::net;
use crate::peer::{InflightWal, Safekeeper, SafekeeperState};
use crate::protocol::{NodeId, SafekeeperInfo, ServerInfo, SK_PROTOCOL_VERSION};
use crate::upstream::{UpstreamMessage, WalStream};
use pq_proto::{
    get_current_timestamp, StandbyReply, XLOG_HDR_END_POS, XLOG_HDR_SIZE, XLOG_HDR_START_POS,
};
use utils::lsn::Lsn;

pub struct ProxyConf {
    /// How many safekeepers must confirm a record before the primary hears
    /// about it.
    pub quorum: usize,
    /// Safekeeper endpoints as (host, port).
    pub safekeepers: Vec<(String, u16)>,
}

#[derive(Debug, Clone, Copy)]
enum Token {
    Upstream,
    Peer(usize),
}

pub struct Proxy<S: WalStream> {
    conf: ProxyConf,
    server_info: ServerInfo,
    upstream: S,
    peers: Vec<Safekeeper>,
    queue: MessageQueue,
    /// Quorum position last reported to the primary.
    last_ack_pos: Lsn,
    /// Highest node id observed across handshakes, seeded with our own.
    max_node_id: NodeId,
    /// The epoch fixed at quorum, once there is one. One-shot.
    proposed_epoch: Option<NodeId>,
    /// Replication has been started on the upstream connection.
    started: bool,
    /// The upstream stream has not ended yet.
    streaming: bool,
}

impl<S: WalStream> Proxy<S> {
    pub fn new(conf: ProxyConf, server_info: ServerInfo, upstream: S) -> Proxy<S> {
        let n = conf.safekeepers.len();
        assert!(
            conf.quorum >= 1 && conf.quorum <= n,
            "invalid quorum {} for {} safekeepers",
            conf.quorum,
            n
        );
        let peers = conf
            .safekeepers
            .iter()
            .map(|(host, port)| Safekeeper::new(host.clone(), *port))
            .collect();
        Proxy {
            peers,
            queue: MessageQueue::new(n),
            last_ack_pos: Lsn::INVALID,
            max_node_id: server_info.node_id,
            proposed_epoch: None,
            started: false,
            streaming: true,
            conf,
            server_info,
            upstream,
        }
    }

    /// Run until the upstream stream ends and every accepted record is
    /// acknowledged, then tell the safekeepers to wrap up.
    pub fn run(&mut self) -> Result<()> {
        while self.streaming || !self.queue.is_empty() {
            self.step(-1)?;
        }
        self.stop_safekeepers();
        Ok(())
    }

    /// One event-loop iteration: poll for readiness (a negative timeout
    /// blocks indefinitely) and dispatch every event. Fatal protocol errors
    /// abort; per-peer I/O errors only recycle that peer.
    pub fn step(&mut self, timeout_ms: i32) -> Result<()> {
        // Reconnect peers that went offline. The event flow itself paces
        // these retries; there is no timer.
        for i in 0..self.peers.len() {
            if self.peers[i].sock.is_none() {
                self.reset_connection(i);
            }
        }
        let events = self.poll_events(timeout_ms)?;
        for (token, revents) in events {
            match token {
                Token::Upstream => self.handle_upstream()?,
                Token::Peer(i) => self.handle_peer_event(i, revents)?,
            }
        }
        Ok(())
    }

    /// Quorum position last reported to the primary.
    pub fn last_ack_pos(&self) -> Lsn {
        self.last_ack_pos
    }

    /// Records accepted from the primary and not yet fully acknowledged.
    pub fn pending_messages(&self) -> usize {
        self.queue.len()
    }

    fn poll_events(&mut self, timeout_ms: i32) -> Result<Vec<(Token, PollFlags)>> {
        let mut tokens = Vec::new();
        let mut pollfds = Vec::new();
        let upstream_fd = self.upstream.poll_fd();
        if self.started && self.streaming {
            tokens.push(Token::Upstream);
            pollfds.push(PollFd::new(&upstream_fd, PollFlags::POLLIN));
        }
        for (i, sk) in self.peers.iter().enumerate() {
            if let Some(sock) = &sk.sock {
                let interest = match sk.state {
                    SafekeeperState::Connecting | SafekeeperState::SendWal => PollFlags::POLLOUT,
                    _ => PollFlags::POLLIN,
                };
                tokens.push(Token::Peer(i));
                pollfds.push(PollFd::new(sock, interest));
            }
        }
        match poll(&mut pollfds, timeout_ms) {
            Ok(0) => Ok(Vec::new()),
            Ok(_) => Ok(tokens
                .iter()
                .zip(pollfds.iter())
                .filter_map(|(token, pfd)| {
                    let revents = pfd.revents().unwrap_or_else(PollFlags::empty);
                    (!revents.is_empty()).then_some((*token, revents))
                })
                .collect()),
            Err(Errno::EINTR) => Ok(Vec::new()),
            Err(e) => Err(e).context("poll failed"),
        }
    }

    fn handle_peer_event(&mut self, i: usize, revents: PollFlags) -> Result<()> {
        let readable =
            revents.intersects(PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP);
        let writable =
            revents.intersects(PollFlags::POLLOUT | PollFlags::POLLERR | PollFlags::POLLHUP);
        match self.peers[i].state {
            // Stale event for a recycled slot, or a state with no interest in
            // this readiness; level-triggered polling makes skipping safe.
            SafekeeperState::Offline => {}
            SafekeeperState::Connecting if writable => self.finish_connect(i),
            SafekeeperState::Connecting => {}
            SafekeeperState::SendWal if writable => self.continue_send_wal(i),
            SafekeeperState::SendWal => {}
            SafekeeperState::Handshake if readable => self.recv_handshake(i),
            SafekeeperState::Handshake => {}
            SafekeeperState::WaitVerdict if readable => self.recv_verdict(i)?,
            SafekeeperState::WaitVerdict => {}
            SafekeeperState::RecvAck if readable => self.recv_ack(i),
            SafekeeperState::RecvAck => {}
            SafekeeperState::Idle | SafekeeperState::Voting if readable => self.probe_peer(i),
            SafekeeperState::Idle | SafekeeperState::Voting => {}
        }
        Ok(())
    }

    /// Close the connection to safekeeper `i`, if any, and immediately try to
    /// open a new one. On a pending connect the peer parks in `Connecting`;
    /// on failure it stays `Offline` and a later iteration retries.
    fn reset_connection(&mut self, i: usize) {
        {
            let sk = &mut self.peers[i];
            if sk.state != SafekeeperState::Offline || sk.sock.is_some() {
                info!("connection with safekeeper {} failed", sk.addr());
                sk.close();
            }
        }
        let (host, port) = {
            let sk = &self.peers[i];
            (sk.host.clone(), sk.port)
        };
        match net::connect_nonblocking(&host, port) {
            Ok((sock, established)) => {
                debug!(
                    "{} safekeeper {}:{}",
                    if established {
                        "connected to"
                    } else {
                        "connecting to"
                    },
                    host,
                    port
                );
                self.peers[i].sock = Some(sock);
                if established {
                    self.start_handshake(i);
                } else {
                    self.peers[i].state = SafekeeperState::Connecting;
                }
            }
            Err(e) => {
                warn!("failed to connect to safekeeper {}:{}: {}", host, port, e);
            }
        }
    }

    /// A nonblocking connect resolved; check the outcome and start the
    /// handshake on success.
    fn finish_connect(&mut self, i: usize) {
        let err = match self.peers[i].sock.as_ref() {
            Some(sock) => sock.take_error().unwrap_or_else(Some),
            None => return,
        };
        match err {
            None => self.start_handshake(i),
            Some(e) => {
                warn!(
                    "failed to connect to safekeeper {}: {}",
                    self.peers[i].addr(),
                    e
                );
                self.peers[i].close();
            }
        }
    }

    /// Send our greeting; the safekeeper answers with its own state.
    fn start_handshake(&mut self, i: usize) {
        let mut buf = BytesMut::with_capacity(ServerInfo::ENCODED_LEN);
        self.server_info.write(&mut buf);
        let res = {
            let sk = &mut self.peers[i];
            match sk.sock.as_mut() {
                Some(sock) => sock.write_all(&buf),
                None => return,
            }
        };
        match res {
            Ok(()) => {
                let sk = &mut self.peers[i];
                sk.state = SafekeeperState::Handshake;
                sk.async_offs = 0;
            }
            Err(e) => {
                warn!(
                    "handshake write to safekeeper {} failed: {}",
                    self.peers[i].addr(),
                    e
                );
                self.reset_connection(i);
            }
        }
    }

    fn recv_handshake(&mut self, i: usize) {
        const WANT: usize = SafekeeperInfo::ENCODED_LEN;
        let res = {
            let sk = &mut self.peers[i];
            let offs = sk.async_offs;
            match sk.sock.as_mut() {
                Some(sock) => net::read_partial(sock, &mut sk.recv_buf[offs..WANT]),
                None => return,
            }
        };
        match res {
            Ok(n) => {
                self.peers[i].async_offs += n;
                if self.peers[i].async_offs == WANT {
                    self.finish_handshake(i);
                }
            }
            Err(e) => {
                warn!(
                    "handshake read from safekeeper {} failed: {}",
                    self.peers[i].addr(),
                    e
                );
                self.reset_connection(i);
            }
        }
    }

    fn finish_handshake(&mut self, i: usize) {
        let info = {
            let sk = &self.peers[i];
            let mut bytes = Bytes::copy_from_slice(&sk.recv_buf[..SafekeeperInfo::ENCODED_LEN]);
            match SafekeeperInfo::from_bytes(&mut bytes) {
                Ok(info) => info,
                Err(e) => {
                    warn!("garbled handshake from safekeeper {}: {}", sk.addr(), e);
                    self.reset_connection(i);
                    return;
                }
            }
        };
        if info.server.protocol_version != SK_PROTOCOL_VERSION {
            error!(
                "safekeeper {} has incompatible protocol version {} vs. {}",
                self.peers[i].addr(),
                info.server.protocol_version,
                SK_PROTOCOL_VERSION
            );
            self.reset_connection(i);
            return;
        }
        {
            let sk = &mut self.peers[i];
            sk.state = SafekeeperState::Voting;
            sk.async_offs = 0;
            sk.ack_pos = info.server.wal_end;
            sk.info = Some(info);
        }
        if info.server.node_id > self.max_node_id {
            self.max_node_id = info.server.node_id;
        }
        // WAL the safekeeper already has flushed counts as delivered
        self.queue.mark_acked(i, info.server.wal_end);
        self.handle_safekeeper_response();
        self.maybe_propose_epoch(i);
    }

    /// Relay the already-fixed epoch proposal to this safekeeper, or, when
    /// handshaken peers first reach quorum, fix a new epoch and propose it to
    /// all of them. The epoch never changes afterwards.
    fn maybe_propose_epoch(&mut self, i: usize) {
        match self.proposed_epoch {
            Some(epoch) => self.send_proposal(i, epoch),
            None => {
                let n_connected = self
                    .peers
                    .iter()
                    .filter(|sk| sk.state == SafekeeperState::Voting)
                    .count();
                if n_connected >= self.conf.quorum {
                    // increment term to claim a fresh epoch
                    let epoch = NodeId {
                        term: self.max_node_id.term + 1,
                        uuid: self.max_node_id.uuid,
                    };
                    self.proposed_epoch = Some(epoch);
                    info!(
                        "handshake completed with {} safekeepers, proposing epoch term {}",
                        n_connected, epoch.term
                    );
                    for j in 0..self.peers.len() {
                        if self.peers[j].state == SafekeeperState::Voting {
                            self.send_proposal(j, epoch);
                        }
                    }
                }
            }
        }
    }

    fn send_proposal(&mut self, i: usize, epoch: NodeId) {
        let mut buf = BytesMut::with_capacity(NodeId::ENCODED_LEN);
        epoch.write(&mut buf);
        let res = {
            let sk = &mut self.peers[i];
            match sk.sock.as_mut() {
                Some(sock) => sock.write_all(&buf),
                None => return,
            }
        };
        match res {
            Ok(()) => {
                let sk = &mut self.peers[i];
                sk.state = SafekeeperState::WaitVerdict;
                sk.async_offs = 0;
            }
            Err(e) => {
                warn!(
                    "epoch proposal to safekeeper {} failed: {}",
                    self.peers[i].addr(),
                    e
                );
                self.reset_connection(i);
            }
        }
    }

    fn recv_verdict(&mut self, i: usize) -> Result<()> {
        const WANT: usize = NodeId::ENCODED_LEN;
        let res = {
            let sk = &mut self.peers[i];
            let offs = sk.async_offs;
            match sk.sock.as_mut() {
                Some(sock) => net::read_partial(sock, &mut sk.recv_buf[offs..WANT]),
                None => return Ok(()),
            }
        };
        let n = match res {
            Ok(n) => n,
            Err(e) => {
                warn!(
                    "verdict read from safekeeper {} failed: {}",
                    self.peers[i].addr(),
                    e
                );
                self.reset_connection(i);
                return Ok(());
            }
        };
        self.peers[i].async_offs += n;
        if self.peers[i].async_offs < WANT {
            return Ok(());
        }

        let verdict = {
            let sk = &self.peers[i];
            let mut bytes = Bytes::copy_from_slice(&sk.recv_buf[..WANT]);
            match NodeId::from_bytes(&mut bytes) {
                Ok(id) => id,
                Err(e) => {
                    warn!("garbled verdict from safekeeper {}: {}", sk.addr(), e);
                    self.reset_connection(i);
                    return Ok(());
                }
            }
        };
        let Some(epoch) = self.proposed_epoch else {
            bail!("verdict received without a proposed epoch");
        };
        // a safekeeper that accepts our candidacy echoes the proposal back
        if verdict != epoch {
            bail!(
                "safekeeper {} with term {} rejected our connection request with term {}",
                self.peers[i].addr(),
                verdict.term,
                epoch.term
            );
        }
        {
            let sk = &mut self.peers[i];
            sk.state = SafekeeperState::Idle;
            sk.async_offs = 0;
        }
        if !self.started {
            let n_votes = self
                .peers
                .iter()
                .filter(|sk| sk.state == SafekeeperState::Idle)
                .count();
            if n_votes >= self.conf.quorum {
                info!(
                    "successfully established connection with {} safekeepers, starting streaming",
                    n_votes
                );
                self.start_streaming()?;
            }
        } else {
            // a peer that rejoined mid-stream picks up its backlog
            self.feed_peer(i);
        }
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<()> {
        let acks: Vec<Lsn> = self.peers.iter().map(|sk| sk.ack_pos).collect();
        let startpos = max(
            quorum_lsn(&acks, self.conf.quorum),
            self.server_info.wal_end,
        );
        // always start streaming at the beginning of a segment
        let startpos = startpos.segment_lsn(self.server_info.wal_seg_size as usize);
        self.upstream
            .start_replication(startpos, self.server_info.timeline)
            .context("could not start replication")?;
        self.started = true;
        // WAL frames may already have arrived together with the mode switch
        // and sit in the transport's buffer, where readiness polling cannot
        // see them; drain before going back to waiting.
        self.handle_upstream()
    }

    fn handle_upstream(&mut self) -> Result<()> {
        loop {
            match self.upstream.poll_message() {
                Ok(Some(UpstreamMessage::Wal(data))) => self.accept_wal_message(data)?,
                Ok(Some(UpstreamMessage::Keepalive)) => continue,
                Ok(Some(UpstreamMessage::End)) => {
                    info!("end of WAL stream reached");
                    self.end_streaming();
                    break;
                }
                Ok(None) => break,
                Err(e) => {
                    error!("could not read COPY data: {:#}", e);
                    self.end_streaming();
                    break;
                }
            }
        }
        Ok(())
    }

    fn end_streaming(&mut self) {
        self.streaming = false;
        self.upstream.shutdown();
    }

    fn accept_wal_message(&mut self, data: Bytes) -> Result<()> {
        if data.len() < XLOG_HDR_SIZE {
            bail!("malformed WAL frame of {} bytes", data.len());
        }
        let mut frame = BytesMut::from(&data[..]);
        let wal_pos = Lsn(BigEndian::read_u64(
            &frame[XLOG_HDR_START_POS..XLOG_HDR_START_POS + 8],
        ));
        // Overwrite the end-position field with the end of this record; the
        // safekeeper uses it to delimit the record on its side.
        let wal_end = wal_pos + (data.len() - XLOG_HDR_SIZE) as u64;
        BigEndian::write_u64(
            &mut frame[XLOG_HDR_END_POS..XLOG_HDR_END_POS + 8],
            wal_end.0,
        );
        self.queue.enqueue(WalMessage {
            data: frame.freeze(),
            wal_pos,
            wal_end,
            ack_mask: 0,
        });
        // hand it to everyone who is ready for a record right now
        for i in 0..self.peers.len() {
            if self.peers[i].state == SafekeeperState::Idle {
                self.feed_peer(i);
            }
        }
        Ok(())
    }

    /// Hand the oldest record this safekeeper has not acknowledged to it.
    fn feed_peer(&mut self, i: usize) {
        debug_assert_eq!(self.peers[i].state, SafekeeperState::Idle);
        let Some(msg) = self.queue.next_unacked(i) else {
            return;
        };
        let inflight = InflightWal {
            data: msg.data.clone(),
            wal_end: msg.wal_end,
        };
        let res = {
            let sk = &mut self.peers[i];
            match sk.sock.as_mut() {
                Some(sock) => net::write_partial(sock, &inflight.data),
                None => return,
            }
        };
        match res {
            Ok(n) => {
                let sk = &mut self.peers[i];
                if n == inflight.data.len() {
                    sk.state = SafekeeperState::RecvAck;
                    sk.async_offs = 0;
                } else {
                    // wait until the socket is available for write
                    sk.state = SafekeeperState::SendWal;
                    sk.async_offs = n;
                }
                sk.curr_msg = Some(inflight);
            }
            Err(e) => {
                warn!(
                    "WAL write to safekeeper {} failed: {}",
                    self.peers[i].addr(),
                    e
                );
                self.reset_connection(i);
            }
        }
    }

    /// Writability arrived for a partially sent record: push more bytes.
    fn continue_send_wal(&mut self, i: usize) {
        let (res, len) = {
            let sk = &mut self.peers[i];
            let offs = sk.async_offs;
            let data = match &sk.curr_msg {
                Some(msg) => msg.data.clone(),
                None => return,
            };
            match sk.sock.as_mut() {
                Some(sock) => (net::write_partial(sock, &data[offs..]), data.len()),
                None => return,
            }
        };
        match res {
            Ok(n) => {
                let sk = &mut self.peers[i];
                sk.async_offs += n;
                if sk.async_offs == len {
                    // record completely sent, wait for its ack
                    sk.state = SafekeeperState::RecvAck;
                    sk.async_offs = 0;
                }
            }
            Err(e) => {
                warn!(
                    "WAL write to safekeeper {} failed: {}",
                    self.peers[i].addr(),
                    e
                );
                self.reset_connection(i);
            }
        }
    }

    fn recv_ack(&mut self, i: usize) {
        const WANT: usize = 8;
        let res = {
            let sk = &mut self.peers[i];
            let offs = sk.async_offs;
            match sk.sock.as_mut() {
                Some(sock) => net::read_partial(sock, &mut sk.recv_buf[offs..WANT]),
                None => return,
            }
        };
        let n = match res {
            Ok(n) => n,
            Err(e) => {
                warn!(
                    "ack read from safekeeper {} failed: {}",
                    self.peers[i].addr(),
                    e
                );
                self.reset_connection(i);
                return;
            }
        };
        self.peers[i].async_offs += n;
        if self.peers[i].async_offs < WANT {
            return;
        }

        let ack = Lsn(LittleEndian::read_u64(&self.peers[i].recv_buf[..WANT]));
        let done = {
            let sk = &mut self.peers[i];
            sk.async_offs = 0;
            sk.ack_pos = ack;
            // the in-flight record is settled only once the ack covers it
            match &sk.curr_msg {
                Some(msg) => ack >= msg.wal_end,
                None => true,
            }
        };
        self.queue.mark_acked(i, ack);
        if done {
            let sk = &mut self.peers[i];
            sk.curr_msg = None;
            sk.state = SafekeeperState::Idle;
        }
        self.handle_safekeeper_response();
        if done {
            self.feed_peer(i);
        }
    }

    /// A safekeeper we expect nothing from spoke out of turn: either it
    /// closed the connection or it is violating the protocol. Recycle it
    /// either way.
    fn probe_peer(&mut self, i: usize) {
        let res = {
            let sk = &mut self.peers[i];
            let mut byte = [0u8; 1];
            match sk.sock.as_mut() {
                Some(sock) => net::read_partial(sock, &mut byte),
                None => return,
            }
        };
        match res {
            Ok(0) => {} // spurious wakeup
            Ok(_) => {
                warn!("unexpected data from safekeeper {}", self.peers[i].addr());
                self.reset_connection(i);
            }
            Err(e) => {
                warn!(
                    "connection with safekeeper {} lost: {}",
                    self.peers[i].addr(),
                    e
                );
                self.reset_connection(i);
            }
        }
    }

    /// Recompute the quorum position and, when it advanced, report it to the
    /// primary as flush feedback. Queue pruning already happened while the
    /// ack bits were set.
    fn handle_safekeeper_response(&mut self) {
        let acks: Vec<Lsn> = self.peers.iter().map(|sk| sk.ack_pos).collect();
        let min_quorum_lsn = quorum_lsn(&acks, self.conf.quorum);
        if min_quorum_lsn > self.last_ack_pos {
            self.last_ack_pos = min_quorum_lsn;
            debug!("quorum LSN advanced to {}", min_quorum_lsn);
            if self.started && self.streaming {
                let reply = StandbyReply {
                    write_lsn: min_quorum_lsn.0,
                    flush_lsn: min_quorum_lsn.0,
                    apply_lsn: Lsn::INVALID.0,
                    reply_ts: get_current_timestamp(),
                    reply_requested: false,
                };
                if let Err(e) = self.upstream.send_feedback(&reply) {
                    error!("could not send feedback packet: {:#}", e);
                    self.end_streaming();
                }
            }
        }
    }

    /// Tell every live safekeeper we are done and close the sockets.
    fn stop_safekeepers(&mut self) {
        debug_assert!(self.queue.is_empty(), "quit with unacknowledged messages");
        let mut quit = [0u8; XLOG_HDR_SIZE];
        quit[0] = b'q';
        for sk in self.peers.iter_mut() {
            let addr = sk.addr();
            if let Some(sock) = sk.sock.as_mut() {
                if let Err(e) = sock.write_all(&quit) {
                    debug!("quit message to safekeeper {} failed: {}", addr, e);
                }
            }
            sk.close();
        }
    }
}
