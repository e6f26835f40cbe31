//! The subset of the PostgreSQL wire protocol needed to speak physical
//! replication on either side of a connection: tagged-frame parsing for
//! frontend messages, serialization of the backend messages a walsender
//! emits, and the CopyData payloads (`'w'` WAL frames, `'k'` keepalives,
//! `'r'` standby status updates) exchanged inside COPY-both mode.

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

pub type Oid = u32;
pub type SystemId = u64;
pub type TimeLineID = u32;
/// Microseconds since the PostgreSQL epoch (2000-01-01 00:00:00 UTC).
pub type TimestampTz = i64;

pub const TEXT_OID: Oid = 25;
pub const INT4_OID: Oid = 23;
pub const INT8_OID: Oid = 20;

pub const XLOG_BLCKSZ: usize = 8192;
/// Upper bound on the WAL payload carried by a single XLogData frame.
pub const MAX_SEND_SIZE: usize = XLOG_BLCKSZ * 16;

/// Size of the `'w'` frame header: tag, start LSN, end LSN, send time.
pub const XLOG_HDR_SIZE: usize = 1 + 8 + 8 + 8;
/// Offset of the start LSN within a `'w'` frame.
pub const XLOG_HDR_START_POS: usize = 1;
/// Offset of the end LSN within a `'w'` frame.
pub const XLOG_HDR_END_POS: usize = 9;

/// Replica feedback tags carried inside frontend CopyData frames.
pub const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';
pub const HOT_STANDBY_FEEDBACK_TAG: u8 = b'h';

/// No frontend frame may be larger than this; bigger lengths indicate a
/// desynchronized or malicious peer.
pub const MAX_MESSAGE_LEN: usize = 10 * 1024 * 1024;

const STARTUP_PROTOCOL_VERSION: u32 = 196608; // 3.0

/// Seconds between the Unix epoch and the PostgreSQL epoch.
const PG_EPOCH_OFFSET_SECS: u64 = 946_684_800;

/// Current time as a PostgreSQL timestamp.
pub fn get_current_timestamp() -> TimestampTz {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d
            .as_micros()
            .saturating_sub(PG_EPOCH_OFFSET_SECS as u128 * 1_000_000) as TimestampTz,
        Err(_) => 0,
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// Malformed frame or unexpected content.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Frame length exceeds [`MAX_MESSAGE_LEN`].
    #[error("oversized message: {0} bytes")]
    Oversized(usize),
}

/// Parse one tagged protocol frame: a tag byte followed by a big-endian u32
/// length counting itself and the body. Returns `None` until `buf` holds the
/// whole frame; the parsed frame is consumed from `buf` and the body returned
/// without the header.
pub fn parse_tagged_frame(buf: &mut BytesMut) -> Result<Option<(u8, Bytes)>, ProtocolError> {
    if buf.len() < 5 {
        return Ok(None);
    }
    let tag = buf[0];
    let len = BigEndian::read_u32(&buf[1..5]) as usize;
    if len < 4 {
        return Err(ProtocolError::Protocol(format!(
            "invalid message length {len}"
        )));
    }
    if len > MAX_MESSAGE_LEN {
        return Err(ProtocolError::Oversized(len));
    }
    let total = len + 1;
    if buf.len() < total {
        return Ok(None);
    }
    let mut frame = buf.split_to(total);
    frame.advance(5);
    Ok(Some((tag, frame.freeze())))
}

/// Frontend message, as seen by a walsender serving a replication client.
#[derive(Debug, PartialEq, Eq)]
pub enum FeMessage {
    /// Simple query; the body with the terminating NUL stripped.
    Query(Bytes),
    CopyData(Bytes),
    CopyDone,
    CopyFail,
    Terminate,
}

impl FeMessage {
    /// Try to parse one message out of `buf`; `None` means more bytes are
    /// needed.
    pub fn parse(buf: &mut BytesMut) -> Result<Option<FeMessage>, ProtocolError> {
        let (tag, body) = match parse_tagged_frame(buf)? {
            Some(frame) => frame,
            None => return Ok(None),
        };
        match tag {
            b'Q' => {
                let end = body.iter().position(|&b| b == 0).unwrap_or(body.len());
                Ok(Some(FeMessage::Query(body.slice(..end))))
            }
            b'd' => Ok(Some(FeMessage::CopyData(body))),
            b'c' => Ok(Some(FeMessage::CopyDone)),
            b'f' => Ok(Some(FeMessage::CopyFail)),
            b'X' => Ok(Some(FeMessage::Terminate)),
            tag => Err(ProtocolError::Protocol(format!(
                "unknown message tag: {tag}"
            ))),
        }
    }
}

/// Single column description for a RowDescription message.
#[derive(Debug, Clone, Copy)]
pub struct RowDescriptor<'a> {
    pub name: &'a [u8],
    pub typoid: Oid,
    pub typlen: i16,
}

impl Default for RowDescriptor<'_> {
    fn default() -> Self {
        RowDescriptor {
            name: b"",
            typoid: TEXT_OID,
            typlen: -1,
        }
    }
}

impl RowDescriptor<'_> {
    pub const fn text_col(name: &[u8]) -> RowDescriptor {
        RowDescriptor {
            name,
            typoid: TEXT_OID,
            typlen: -1,
        }
    }

    pub const fn int8_col(name: &[u8]) -> RowDescriptor {
        RowDescriptor {
            name,
            typoid: INT8_OID,
            typlen: 8,
        }
    }
}

/// Body of an XLogData frame (`'w'`), the unit of WAL transfer.
#[derive(Debug)]
pub struct XLogDataBody<'a> {
    pub wal_start: u64,
    pub wal_end: u64,
    pub timestamp: TimestampTz,
    pub data: &'a [u8],
}

/// Sender keepalive (`'k'`).
#[derive(Debug)]
pub struct WalSndKeepAlive {
    pub wal_end: u64,
    pub timestamp: TimestampTz,
    pub request_reply: bool,
}

/// Standby status update (`'r'`), sent by a replication client to report
/// progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandbyReply {
    pub write_lsn: u64,
    pub flush_lsn: u64,
    pub apply_lsn: u64,
    pub reply_ts: TimestampTz,
    pub reply_requested: bool,
}

impl StandbyReply {
    /// On-wire size including the tag byte.
    pub const ENCODED_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

    pub fn write(&self, buf: &mut BytesMut) {
        buf.put_u8(STANDBY_STATUS_UPDATE_TAG);
        buf.put_u64(self.write_lsn);
        buf.put_u64(self.flush_lsn);
        buf.put_u64(self.apply_lsn);
        buf.put_i64(self.reply_ts);
        buf.put_u8(self.reply_requested as u8);
    }

    /// Parse from the CopyData body with the leading tag byte stripped.
    pub fn parse(body: &[u8]) -> Result<StandbyReply, ProtocolError> {
        if body.len() < Self::ENCODED_LEN - 1 {
            return Err(ProtocolError::Protocol(format!(
                "standby reply too short: {} bytes",
                body.len()
            )));
        }
        Ok(StandbyReply {
            write_lsn: BigEndian::read_u64(&body[0..8]),
            flush_lsn: BigEndian::read_u64(&body[8..16]),
            apply_lsn: BigEndian::read_u64(&body[16..24]),
            reply_ts: BigEndian::read_i64(&body[24..32]),
            reply_requested: body[32] != 0,
        })
    }
}

/// Backend message a walsender may emit.
#[derive(Debug)]
pub enum BeMessage<'a> {
    AuthenticationOk,
    ReadyForQuery,
    RowDescription(&'a [RowDescriptor<'a>]),
    DataRow(&'a [Option<&'a [u8]>]),
    CommandComplete(&'a [u8]),
    CopyBothResponse,
    CopyData(&'a [u8]),
    XLogData(XLogDataBody<'a>),
    KeepAlive(WalSndKeepAlive),
}

impl BeMessage<'_> {
    /// Serialize `message` into `buf`.
    pub fn write(buf: &mut BytesMut, message: &BeMessage) {
        match message {
            BeMessage::AuthenticationOk => {
                buf.put_u8(b'R');
                write_body(buf, |buf| buf.put_i32(0));
            }

            BeMessage::ReadyForQuery => {
                buf.put_u8(b'Z');
                write_body(buf, |buf| buf.put_u8(b'I'));
            }

            BeMessage::RowDescription(rows) => {
                buf.put_u8(b'T');
                write_body(buf, |buf| {
                    buf.put_i16(rows.len() as i16);
                    for row in rows.iter() {
                        write_cstr(buf, row.name);
                        buf.put_i32(0); /* table oid */
                        buf.put_i16(0); /* attnum */
                        buf.put_u32(row.typoid);
                        buf.put_i16(row.typlen);
                        buf.put_i32(-1); /* typmod */
                        buf.put_i16(0); /* format code, text */
                    }
                });
            }

            BeMessage::DataRow(vals) => {
                buf.put_u8(b'D');
                write_body(buf, |buf| {
                    buf.put_u16(vals.len() as u16);
                    for val_opt in vals.iter() {
                        match val_opt {
                            Some(val) => {
                                buf.put_u32(val.len() as u32);
                                buf.put_slice(val);
                            }
                            None => buf.put_i32(-1),
                        }
                    }
                });
            }

            BeMessage::CommandComplete(cmd) => {
                buf.put_u8(b'C');
                write_body(buf, |buf| write_cstr(buf, cmd));
            }

            BeMessage::CopyBothResponse => {
                buf.put_u8(b'W');
                write_body(buf, |buf| {
                    // overall copy format, 0 = text, and no columns
                    buf.put_u8(0);
                    buf.put_i16(0);
                });
            }

            BeMessage::CopyData(data) => {
                buf.put_u8(b'd');
                write_body(buf, |buf| buf.put_slice(data));
            }

            BeMessage::XLogData(body) => {
                buf.put_u8(b'd');
                write_body(buf, |buf| {
                    buf.put_u8(b'w');
                    buf.put_u64(body.wal_start);
                    buf.put_u64(body.wal_end);
                    buf.put_i64(body.timestamp);
                    buf.put_slice(body.data);
                });
            }

            BeMessage::KeepAlive(req) => {
                buf.put_u8(b'd');
                write_body(buf, |buf| {
                    buf.put_u8(b'k');
                    buf.put_u64(req.wal_end);
                    buf.put_i64(req.timestamp);
                    buf.put_u8(req.request_reply as u8);
                });
            }
        }
    }
}

/// Write a startup packet for a replication connection: a length-prefixed,
/// untagged frame of NUL-terminated parameter pairs.
pub fn write_startup_packet(buf: &mut BytesMut, params: &[(&str, &str)]) {
    let base = buf.len();
    buf.put_u32(0); // length, patched below
    buf.put_u32(STARTUP_PROTOCOL_VERSION);
    for (k, v) in params {
        write_cstr(buf, k.as_bytes());
        write_cstr(buf, v.as_bytes());
    }
    buf.put_u8(0);
    let size = (buf.len() - base) as u32;
    BigEndian::write_u32(&mut buf[base..], size);
}

/// Write a message body with its length prefix: reserve the length word, run
/// the closure, patch the length in (it counts itself but not the tag).
fn write_body<F>(buf: &mut BytesMut, f: F)
where
    F: FnOnce(&mut BytesMut),
{
    let base = buf.len();
    buf.put_u32(0);
    f(buf);
    let size = (buf.len() - base) as u32;
    BigEndian::write_u32(&mut buf[base..], size);
}

fn write_cstr(buf: &mut BytesMut, s: &[u8]) {
    debug_assert!(!s.contains(&0), "string with embedded NUL");
    buf.put_slice(s);
    buf.put_u8(0);
}
