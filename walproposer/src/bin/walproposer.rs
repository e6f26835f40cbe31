//! `walproposer` binary: pull streaming WAL from a primary server and
//! broadcast it to a group of safekeepers, acknowledging each record back to
//! the primary once a quorum of them has it.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::ToSocketAddrs;
use tracing::info;

use utils::logging::{self, LogFormat};
use walproposer::protocol::{
    NodeId, ServerInfo, MAX_SAFEKEEPERS, PG_VERSION_NUM, SK_PROTOCOL_VERSION,
};
use walproposer::proxy::{Proxy, ProxyConf};
use walproposer::upstream::PqWalStream;

const ABOUT: &str = "Tee PostgreSQL streaming write-ahead logs to a group of safekeepers, \
acknowledging each record once a quorum of them has it.";

#[derive(Parser)]
#[command(name = "walproposer", about = ABOUT, version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Quorum for sending response to server. Defaults to a majority of the
    /// safekeepers.
    #[arg(short, long)]
    quorum: Option<usize>,
    /// Comma separated list of safekeepers in format 'host1:port1,host2:port2'.
    #[arg(short, long, value_delimiter = ',', required = true)]
    safekeepers: Vec<String>,
    /// Connection string: 'key=value' pairs such as 'host=... port=... user=...'.
    #[arg(short = 'd', long)]
    dbname: Option<String>,
    /// Database server host.
    #[arg(long)]
    host: Option<String>,
    /// Database server port number.
    #[arg(short, long)]
    port: Option<u16>,
    /// Connect as specified database user.
    #[arg(short = 'U', long)]
    username: Option<String>,
    /// Format for logging, either 'plain' or 'json'.
    #[arg(long, default_value = "plain")]
    log_format: String,
}

struct ConnParams {
    host: String,
    port: u16,
    user: String,
}

/// Connection defaults, overlaid with the connection string, overlaid with
/// the explicit options.
fn conn_params(args: &Args) -> Result<ConnParams> {
    let mut params = ConnParams {
        host: "127.0.0.1".to_owned(),
        port: 5432,
        user: "postgres".to_owned(),
    };
    if let Some(conninfo) = &args.dbname {
        for piece in conninfo.split_whitespace() {
            let Some((key, value)) = piece.split_once('=') else {
                bail!("invalid connection string piece '{piece}'");
            };
            match key {
                "host" => params.host = value.to_owned(),
                "port" => {
                    params.port = value
                        .parse()
                        .with_context(|| format!("invalid port number \"{value}\""))?
                }
                "user" => params.user = value.to_owned(),
                // everything else is meaningless for a replication connection
                _ => {}
            }
        }
    }
    if let Some(host) = &args.host {
        params.host = host.clone();
    }
    if let Some(port) = args.port {
        params.port = port;
    }
    if let Some(user) = &args.username {
        params.user = user.clone();
    }
    Ok(params)
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(LogFormat::from_config(&args.log_format)?)?;

    let mut safekeepers = Vec::new();
    for addr in &args.safekeepers {
        let Some((host, port)) = addr.rsplit_once(':') else {
            bail!("safekeeper port is not specified in '{addr}'");
        };
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port number \"{port}\""))?;
        safekeepers.push((host.to_owned(), port));
    }
    if safekeepers.is_empty() {
        bail!("safekeeper addresses are not specified");
    }
    if safekeepers.len() > MAX_SAFEKEEPERS {
        bail!("too many safekeepers");
    }
    let majority = safekeepers.len() / 2 + 1;
    let quorum = args.quorum.unwrap_or(majority);
    if quorum < majority || quorum > safekeepers.len() {
        bail!(
            "invalid quorum value: {}, should be {}..{}",
            quorum,
            majority,
            safekeepers.len()
        );
    }

    let params = conn_params(&args)?;
    let addr = (params.host.as_str(), params.port)
        .to_socket_addrs()?
        .next()
        .with_context(|| format!("could not resolve {}", params.host))?;

    let mut upstream = PqWalStream::connect(addr, &params.user, "walproposer")?;
    let identity = upstream.identify()?;
    let wal_seg_size = upstream.show_wal_segment_size()?;
    info!(
        "connected to primary: system {}, timeline {}, WAL end {}",
        identity.system_id, identity.timeline, identity.wal_end
    );

    let server_info = ServerInfo {
        protocol_version: SK_PROTOCOL_VERSION,
        pg_version: PG_VERSION_NUM,
        wal_seg_size,
        timeline: identity.timeline,
        node_id: NodeId {
            term: 0,
            uuid: rand::random(),
        },
        wal_end: identity.wal_end,
    };

    let conf = ProxyConf { quorum, safekeepers };
    Proxy::new(conf, server_info, upstream).run()
}
