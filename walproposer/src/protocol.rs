//! Fixed-layout records exchanged between the proxy and its safekeepers.
//!
//! Handshake records and acknowledgements travel as little-endian fields in
//! the order they are declared; WAL frames relayed inside the stream keep the
//! big-endian layout of the replication protocol they were received in.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub use pq_proto::{SystemId, TimeLineID};
use utils::lsn::Lsn;

/// Proxy/safekeeper protocol version. Bumped on every layout change.
pub const SK_PROTOCOL_VERSION: u32 = 1;

/// PostgreSQL version the proxy advertises in its greeting.
pub const PG_VERSION_NUM: u32 = 150002;

/// Hard cap on the safekeeper fan-out; ack tracking uses one u64 bitmask.
pub const MAX_SAFEKEEPERS: usize = 64;

/// Consensus logical timestamp.
pub type Term = u64;

pub type PgUuid = [u8; 16];

/// Unique id of a node claiming the right to stream WAL. Total order is by
/// term first, then by the uuid bytes, so the id with the highest term always
/// wins regardless of who generated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub term: Term,
    pub uuid: PgUuid,
}

impl NodeId {
    pub const ENCODED_LEN: usize = 8 + 16;

    pub const ZERO: NodeId = NodeId {
        term: 0,
        uuid: [0; 16],
    };

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.term);
        buf.put_slice(&self.uuid);
    }

    pub fn from_bytes(bytes: &mut Bytes) -> Result<NodeId> {
        if bytes.remaining() < Self::ENCODED_LEN {
            bail!("NodeId is incomplete");
        }
        let term = bytes.get_u64_le();
        let mut uuid = [0u8; 16];
        bytes.copy_to_slice(&mut uuid);
        Ok(NodeId { term, uuid })
    }
}

/// Greeting the proxy sends to every safekeeper right after connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// proxy/safekeeper protocol version
    pub protocol_version: u32,
    /// PostgreSQL server version
    pub pg_version: u32,
    pub wal_seg_size: u32,
    pub timeline: TimeLineID,
    pub node_id: NodeId,
    /// end of WAL known to the sender
    pub wal_end: Lsn,
}

impl ServerInfo {
    pub const ENCODED_LEN: usize = 4 + 4 + 4 + 4 + NodeId::ENCODED_LEN + 8;

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.protocol_version);
        buf.put_u32_le(self.pg_version);
        buf.put_u32_le(self.wal_seg_size);
        buf.put_u32_le(self.timeline);
        self.node_id.write(buf);
        buf.put_u64_le(self.wal_end.0);
    }

    pub fn from_bytes(bytes: &mut Bytes) -> Result<ServerInfo> {
        if bytes.remaining() < Self::ENCODED_LEN {
            bail!("ServerInfo is incomplete");
        }
        Ok(ServerInfo {
            protocol_version: bytes.get_u32_le(),
            pg_version: bytes.get_u32_le(),
            wal_seg_size: bytes.get_u32_le(),
            timeline: bytes.get_u32_le(),
            node_id: NodeId::from_bytes(bytes)?,
            wal_end: Lsn(bytes.get_u64_le()),
        })
    }
}

/// Safekeeper's answer to the greeting: the same shape, carrying the
/// safekeeper's own last flushed position and the highest term it has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafekeeperInfo {
    pub server: ServerInfo,
}

impl SafekeeperInfo {
    pub const ENCODED_LEN: usize = ServerInfo::ENCODED_LEN;

    pub fn write(&self, buf: &mut BytesMut) {
        self.server.write(buf);
    }

    pub fn from_bytes(bytes: &mut Bytes) -> Result<SafekeeperInfo> {
        Ok(SafekeeperInfo {
            server: ServerInfo::from_bytes(bytes)?,
        })
    }
}
