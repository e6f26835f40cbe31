//! TCP accept loop for replication clients: one walsender thread each.

use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ByteOrder};
use std::io::Read;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

use crate::send_wal::{self, WalSenders};
use crate::wal_storage::SegmentStore;
use crate::SafekeeperConf;

/// Accept incoming TCP connections and spawn each into a walsender thread,
/// registering the thread so shutdown can join it.
pub fn thread_main(
    conf: SafekeeperConf,
    store: Arc<dyn SegmentStore>,
    senders: Arc<WalSenders>,
    listener: TcpListener,
) -> Result<()> {
    info!("WAL service listening on {}", listener.local_addr()?);
    loop {
        match listener.accept() {
            Ok((sock, peer_addr)) => {
                debug!("accepted connection from {}", peer_addr);
                let handle = {
                    let conf = conf.clone();
                    let store = store.clone();
                    let senders = senders.clone();
                    thread::Builder::new()
                        .name("WAL sender thread".into())
                        .spawn(move || {
                            if let Err(err) = handle_socket(conf, store, senders, sock, peer_addr) {
                                error!("connection handler exited: {err:#}");
                            }
                        })
                        .context("failed to spawn WAL sender thread")?
                };
                senders.register_thread(handle);
            }
            Err(e) => error!("failed to accept connection: {e}"),
        }
    }
}

/// Read the startup packet length word and hand the session over.
fn handle_socket(
    conf: SafekeeperConf,
    store: Arc<dyn SegmentStore>,
    senders: Arc<WalSenders>,
    mut sock: TcpStream,
    peer_addr: SocketAddr,
) -> Result<()> {
    sock.set_nodelay(true)?;
    let mut lenbuf = [0u8; 4];
    sock.read_exact(&mut lenbuf)
        .context("could not read startup packet length")?;
    let len = BigEndian::read_u32(&lenbuf) as usize;
    if !(8..=10_000).contains(&len) {
        bail!("invalid startup packet length {len}");
    }
    send_wal::run_sender(&conf, store.as_ref(), &senders, sock, peer_addr, len - 4)
}
