//! The `client` binary: submits a single operation and waits for a
//! quorum-backed reply (§6).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use bft2f::communication::message::{Header, SystemMessage};
use bft2f::communication::socket::{UdpPeerHandle, MAX_DATAGRAM_SIZE};
use bft2f::communication::PeerHandle;
use bft2f::core::client::{Client, RequestStatus};
use bft2f::error::*;
use bft2f::{config, InitConfig};

#[derive(Parser, Debug)]
#[command(name = "client")]
struct Args {
    /// This client's own id.
    #[arg(long)]
    id: u32,

    /// The local address to bind the UDP socket on.
    #[arg(long)]
    bind: SocketAddr,

    /// Every replica's `id@host:port`, comma-separated.
    #[arg(long)]
    replicas: String,

    /// Maximum tolerated faulty replicas.
    #[arg(long)]
    f: usize,

    /// The operation to submit.
    #[arg(long)]
    op: String,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(true) => ExitCode::from(0),
        Ok(false) => ExitCode::from(3),
        Err(e) if e.kind() == ErrorKind::Configuration => {
            error!("configuration error: {}", e);
            ExitCode::from(2)
        }
        Err(e) if e.kind() == ErrorKind::Client => {
            error!("request timed out: {}", e);
            ExitCode::from(1)
        }
        Err(e) => {
            error!("client exited with an error: {}", e);
            ExitCode::from(1)
        }
    }
}

/// Returns `Ok(true)` once the request completes normally, `Ok(false)`
/// if a fork was detected.
fn run(args: Args) -> Result<bool> {
    let _guard = bft2f::init(InitConfig { async_threads: 2 })?;

    let addrs: BTreeMap<_, _> = config::parse_node_list(&args.replicas)?;
    let n = addrs.len();
    let keypair = Arc::new(config::load_keypair()?);
    let view_timeout = config::view_timeout()?;

    bft2f::async_runtime::block_on(request(args, addrs, n, keypair, view_timeout))
}

async fn request(
    args: Args,
    addrs: BTreeMap<bft2f::communication::NodeId, SocketAddr>,
    n: usize,
    keypair: Arc<bft2f::crypto::signature::KeyPair>,
    timeout: std::time::Duration,
) -> Result<bool> {
    let id = bft2f::communication::NodeId(args.id);
    let socket = UdpPeerHandle::bind(args.bind, addrs).await?;

    let mut client: Client<String, String> = Client::new(id, n, args.f, keypair.clone());
    let (req, targets) = client.make_request(args.op.clone());

    let payload = SystemMessage::<String, String>::Request(req).encode()?;
    for to in targets {
        let signature = keypair.sign(&payload);
        let wire = bft2f::communication::message::WireMessage::new(id, to, &payload, signature);
        let (header, body) = wire.into_inner();
        let mut datagram = vec![0u8; Header::LENGTH + body.len()];
        header.serialize_into(&mut datagram[..Header::LENGTH])?;
        datagram[Header::LENGTH..].copy_from_slice(body);
        socket.send_to(to, datagram).await?;
    }
    info!("client {} submitted request to {} replicas", id, n);

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err("no quorum of matching replies before the view timeout")
                .wrapped(ErrorKind::Client);
        }
        let datagram = tokio::time::timeout(remaining, socket.recv_datagram(&mut buf)).await;
        let (_header, len) = match datagram {
            Ok(Ok(pair)) => pair,
            Ok(Err(e)) => {
                warn!("client {} socket error: {}", id, e);
                continue;
            }
            Err(_) => {
                return Err("no quorum of matching replies before the view timeout")
                    .wrapped(ErrorKind::Client)
            }
        };
        let msg: SystemMessage<String, String> = match SystemMessage::decode(&buf[Header::LENGTH..len]) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("client {} dropped an undecodable datagram: {}", id, e);
                continue;
            }
        };
        let reply = match msg {
            SystemMessage::Reply(reply) => reply,
            _ => continue,
        };
        match client.on_reply(reply) {
            RequestStatus::Pending => continue,
            RequestStatus::Tentative => {
                info!("client {} has a tentative reply, waiting for full quorum", id);
                continue;
            }
            RequestStatus::Complete(result) => {
                println!("{}", result);
                return Ok(true);
            }
            RequestStatus::ForkSuspected => {
                warn!("client {} suspects a fork in the replicated history", id);
                return Ok(false);
            }
        }
    }
}
