//! Narrow facade over the transport that delivers the primary's replication
//! stream, and its implementation for a plain PostgreSQL connection.

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use tracing::{info, warn};

use pq_proto::{parse_tagged_frame, write_startup_packet, BeMessage, StandbyReply, TimeLineID};
use utils::lsn::Lsn;

/// What the primary identified itself as.
#[derive(Debug, Clone, Copy)]
pub struct PrimaryIdentity {
    pub system_id: pq_proto::SystemId,
    pub timeline: TimeLineID,
    pub wal_end: Lsn,
}

/// One message pulled off the replication stream.
#[derive(Debug)]
pub enum UpstreamMessage {
    /// A `'w'` frame, raw bytes exactly as they should reach the safekeepers.
    Wal(Bytes),
    /// A `'k'` frame; carries nothing the proxy needs.
    Keepalive,
    /// The stream is over: drain outstanding acks and exit.
    End,
}

/// The event loop's view of the upstream transport.
pub trait WalStream {
    /// Descriptor to include in the readiness poll while streaming.
    fn poll_fd(&self) -> BorrowedFd<'_>;

    /// Enter COPY-both mode starting at `start` on `timeline`.
    fn start_replication(&mut self, start: Lsn, timeline: TimeLineID) -> Result<()>;

    /// Fetch the next message without blocking; `None` means no complete
    /// message is buffered yet.
    fn poll_message(&mut self) -> Result<Option<UpstreamMessage>>;

    /// Send a standby status update.
    fn send_feedback(&mut self, reply: &StandbyReply) -> Result<()>;

    /// Release the connection once the stream is over.
    fn shutdown(&mut self) {}
}

/// Replication client over a raw PostgreSQL frontend/backend connection.
///
/// The handshake phase (startup, `IDENTIFY_SYSTEM`, `SHOW`) runs blocking;
/// `start_replication` switches the socket to nonblocking and subsequent
/// frames are reassembled through an internal buffer.
pub struct PqWalStream {
    stream: TcpStream,
    buf: BytesMut,
}

impl PqWalStream {
    /// Connect and run the session startup, failing on any authentication
    /// demand: credentials are outside this tool's remit.
    pub fn connect(addr: SocketAddr, user: &str, appname: &str) -> Result<PqWalStream> {
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("could not connect to primary at {addr}"))?;
        stream.set_nodelay(true)?;
        let mut this = PqWalStream {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
        };

        let mut startup = BytesMut::new();
        write_startup_packet(
            &mut startup,
            &[
                ("user", user),
                ("replication", "true"),
                ("application_name", appname),
            ],
        );
        this.stream.write_all(&startup)?;

        loop {
            let (tag, body) = this.read_message()?;
            match tag {
                b'R' => {
                    if body.len() < 4 || BigEndian::read_u32(&body[..4]) != 0 {
                        bail!("primary demands authentication, which is not supported");
                    }
                }
                b'S' | b'K' | b'N' => {} // parameter status, cancel key, notice
                b'Z' => break,
                b'E' => bail!("primary refused connection: {}", error_message(&body)),
                tag => bail!("unexpected message '{}' during startup", tag as char),
            }
        }
        Ok(this)
    }

    /// Run `IDENTIFY_SYSTEM` and parse the single row of the reply.
    pub fn identify(&mut self) -> Result<PrimaryIdentity> {
        let rows = self.simple_query("IDENTIFY_SYSTEM")?;
        let row = rows.first().context("IDENTIFY_SYSTEM returned no rows")?;
        let system_id = std::str::from_utf8(column(row, 0)?)?
            .parse::<u64>()
            .context("bad system id")?;
        let timeline = std::str::from_utf8(column(row, 1)?)?
            .parse::<TimeLineID>()
            .context("bad timeline")?;
        let wal_end = std::str::from_utf8(column(row, 2)?)?
            .parse::<Lsn>()
            .context("bad xlogpos")?;
        // a database-specific connection cannot stream physical WAL
        if row.get(3).and_then(|c| c.as_ref()).is_some() {
            bail!("replication connection is unexpectedly database specific");
        }
        Ok(PrimaryIdentity {
            system_id,
            timeline,
            wal_end,
        })
    }

    /// Ask the primary for its WAL segment size.
    pub fn show_wal_segment_size(&mut self) -> Result<u32> {
        let rows = self.simple_query("SHOW wal_segment_size")?;
        let row = rows.first().context("SHOW wal_segment_size returned no rows")?;
        let val = row
            .first()
            .and_then(|c| c.as_ref())
            .context("SHOW wal_segment_size returned a null value")?;
        parse_size(std::str::from_utf8(val)?)
    }

    /// Send a simple query and collect the data rows of the reply.
    fn simple_query(&mut self, query: &str) -> Result<Vec<Vec<Option<Bytes>>>> {
        self.send_query(query)?;
        let mut rows = Vec::new();
        loop {
            let (tag, body) = self.read_message()?;
            match tag {
                b'T' => {} // row description, we know what we asked for
                b'D' => rows.push(parse_data_row(&body)?),
                b'C' => {} // command complete
                b'Z' => break,
                b'E' => bail!("query '{}' failed: {}", query, error_message(&body)),
                tag => bail!("unexpected message '{}' in reply to '{}'", tag as char, query),
            }
        }
        Ok(rows)
    }

    fn send_query(&mut self, query: &str) -> Result<()> {
        let mut buf = BytesMut::with_capacity(query.len() + 6);
        buf.put_u8(b'Q');
        buf.put_u32(4 + query.len() as u32 + 1);
        buf.put_slice(query.as_bytes());
        buf.put_u8(0);
        self.stream.write_all(&buf)?;
        Ok(())
    }

    /// Blocking read of one backend message; handshake phase only.
    fn read_message(&mut self) -> Result<(u8, Bytes)> {
        loop {
            if let Some(frame) = parse_tagged_frame(&mut self.buf)? {
                return Ok(frame);
            }
            let mut chunk = [0u8; 8192];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                bail!("primary closed the connection");
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl WalStream for PqWalStream {
    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }

    fn start_replication(&mut self, start: Lsn, timeline: TimeLineID) -> Result<()> {
        let query = format!("START_REPLICATION {start} TIMELINE {timeline}");
        info!("{}", query);
        self.send_query(&query)?;
        loop {
            let (tag, body) = self.read_message()?;
            match tag {
                b'W' => break, // CopyBothResponse
                b'E' => bail!(
                    "could not send replication command \"START_REPLICATION\": {}",
                    error_message(&body)
                ),
                _ => {}
            }
        }
        self.stream.set_nonblocking(true)?;
        Ok(())
    }

    fn poll_message(&mut self) -> Result<Option<UpstreamMessage>> {
        loop {
            match parse_tagged_frame(&mut self.buf)? {
                Some((b'd', payload)) => {
                    return Ok(Some(match payload.first() {
                        Some(b'w') => UpstreamMessage::Wal(payload),
                        Some(b'k') => UpstreamMessage::Keepalive,
                        other => {
                            warn!("unexpected COPY payload tag {:?}", other);
                            UpstreamMessage::Keepalive
                        }
                    }));
                }
                Some((b'c', _)) => return Ok(Some(UpstreamMessage::End)), // CopyDone
                Some((b'E', body)) => bail!("error from primary: {}", error_message(&body)),
                Some((tag, _)) => {
                    warn!("ignoring message '{}' in COPY mode", tag as char);
                    continue;
                }
                None => {}
            }
            // no complete frame buffered, pull more bytes
            let mut chunk = [0u8; 64 * 1024];
            match self.stream.read(&mut chunk) {
                Ok(0) => return Ok(Some(UpstreamMessage::End)),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("could not read COPY data"),
            }
        }
    }

    fn send_feedback(&mut self, reply: &StandbyReply) -> Result<()> {
        let mut payload = BytesMut::with_capacity(StandbyReply::ENCODED_LEN);
        reply.write(&mut payload);
        let mut buf = BytesMut::with_capacity(payload.len() + 5);
        BeMessage::write(&mut buf, &BeMessage::CopyData(&payload));
        self.stream
            .write_all(&buf)
            .context("could not send feedback packet")?;
        Ok(())
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn column(row: &[Option<Bytes>], idx: usize) -> Result<&Bytes> {
    row.get(idx)
        .and_then(|c| c.as_ref())
        .with_context(|| format!("IDENTIFY_SYSTEM column {idx} is missing"))
}

fn parse_data_row(body: &Bytes) -> Result<Vec<Option<Bytes>>> {
    let mut buf = body.clone();
    if buf.remaining() < 2 {
        bail!("short DataRow message");
    }
    let ncols = buf.get_u16() as usize;
    let mut cols = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        if buf.remaining() < 4 {
            bail!("short DataRow message");
        }
        let len = buf.get_i32();
        if len < 0 {
            cols.push(None);
            continue;
        }
        let len = len as usize;
        if buf.remaining() < len {
            bail!("short DataRow message");
        }
        cols.push(Some(buf.copy_to_bytes(len)));
    }
    Ok(cols)
}

/// Pull the human-readable message out of an ErrorResponse body.
fn error_message(body: &[u8]) -> String {
    let mut rest = body;
    while let Some((&code, tail)) = rest.split_first() {
        if code == 0 {
            break;
        }
        let Some(end) = tail.iter().position(|&b| b == 0) else {
            break;
        };
        if code == b'M' {
            return String::from_utf8_lossy(&tail[..end]).into_owned();
        }
        rest = &tail[end + 1..];
    }
    "unknown error".to_owned()
}

/// Parse a size setting the way PostgreSQL renders it, e.g. `16MB`.
fn parse_size(val: &str) -> Result<u32> {
    let val = val.trim();
    let split = val
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(val.len());
    let (num, unit) = val.split_at(split);
    let num: u32 = num
        .parse()
        .with_context(|| format!("bad size value '{val}'"))?;
    let multiplier: u32 = match unit.trim() {
        "" | "B" => 1,
        "kB" => 1024,
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        other => bail!("unknown size unit '{other}'"),
    };
    num.checked_mul(multiplier).context("size out of range")
}
