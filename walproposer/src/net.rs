//! Nonblocking socket helpers with partial-progress semantics.
//!
//! All proxy sockets run in nonblocking mode. Reads and writes report how far
//! they got before the kernel would block; the caller keeps the offset and
//! resumes when the event loop signals readiness again.

use socket2::{Domain, Socket, Type};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

/// Resolve `host:port` and start a nonblocking connect to the first address.
/// The second field of the result tells whether the connection is already
/// established or still in progress (completion is signalled by writability).
pub fn connect_nonblocking(host: &str, port: u16) -> io::Result<(TcpStream, bool)> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("could not resolve {host}")))?;
    connect_addr_nonblocking(addr)
}

pub fn connect_addr_nonblocking(addr: SocketAddr) -> io::Result<(TcpStream, bool)> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    sock.set_nonblocking(true)?;
    sock.set_nodelay(true)?;
    match sock.connect(&addr.into()) {
        Ok(()) => Ok((sock.into(), true)),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok((sock.into(), false)),
        Err(e) => Err(e),
    }
}

/// Read into `buf` until it is full or the socket would block. Returns how
/// many bytes were read; an orderly close by the peer is an error here since
/// every caller expects a fixed-length record.
pub fn read_partial(stream: &mut TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut offs = 0;
    while offs < buf.len() {
        match stream.read(&mut buf[offs..]) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "peer closed connection",
                ))
            }
            Ok(n) => offs += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(offs)
}

/// Write from `buf` until everything is sent or the socket would block.
/// Returns how many bytes were written.
pub fn write_partial(stream: &mut TcpStream, buf: &[u8]) -> io::Result<usize> {
    let mut offs = 0;
    while offs < buf.len() {
        match stream.write(&buf[offs..]) {
            Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "socket write returned 0")),
            Ok(n) => offs += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(offs)
}
