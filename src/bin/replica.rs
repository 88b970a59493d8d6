//! The `replica` binary: boots a single BFT2F replica over UDP (§6).

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};

use bft2f::communication::channel::new_channel;
use bft2f::communication::message::{Header, SystemMessage};
use bft2f::communication::socket::{UdpPeerHandle, MAX_DATAGRAM_SIZE};
use bft2f::communication::NodeConfig;
use bft2f::core::server::{Replica, ReplicaEvent, SystemParams};
use bft2f::demo::EchoService;
use bft2f::error::*;
use bft2f::timeouts::TimeoutsHandle;
use bft2f::{config, InitConfig};

/// A single BFT2F replica.
#[derive(Parser, Debug)]
#[command(name = "replica")]
struct Args {
    /// This replica's own id.
    #[arg(long)]
    id: u32,

    /// The local address to bind the UDP socket on.
    #[arg(long)]
    bind: SocketAddr,

    /// Every replica's `id@host:port`, comma-separated, self included.
    #[arg(long)]
    peers: String,

    /// Every client's `id@host:port`, comma-separated, used to route replies.
    #[arg(long, default_value = "")]
    clients: String,

    /// Maximum tolerated faulty replicas.
    #[arg(long)]
    f: usize,

    /// Silences this replica's own votes, to exercise view-change paths.
    #[arg(long, default_value_t = false)]
    faulty: bool,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::from(0),
        Err(e) if e.kind() == ErrorKind::Configuration => {
            error!("configuration error: {}", e);
            ExitCode::from(2)
        }
        Err(e) => {
            error!("replica exited with an error: {}", e);
            ExitCode::from(1)
        }
    }
}

fn run(args: Args) -> Result<()> {
    let _guard = bft2f::init(InitConfig { async_threads: num_cpus::get() })?;

    let mut addrs: BTreeMap<_, _> = config::parse_node_list(&args.peers)?;
    let n = addrs.len();
    if n != SystemParams::minimum_n(args.f) {
        return Err(format!(
            "--peers lists {} replicas, but f={} requires exactly {}",
            n,
            args.f,
            SystemParams::minimum_n(args.f)
        ))
        .wrapped(ErrorKind::Configuration);
    }
    addrs.extend(config::parse_node_list(&args.clients)?);

    let keypair = Arc::new(config::load_keypair()?);
    let params = SystemParams {
        n,
        f: args.f,
        watermark: config::watermark()?,
        checkpoint_interval: config::checkpoint_interval()?,
        cohesion_window: bft2f::checkpoint::DEFAULT_COHESION_WINDOW,
        view_timeout: config::view_timeout()?,
    };
    let node_config = NodeConfig {
        id: bft2f::communication::NodeId(args.id),
        n,
        f: args.f,
        addrs,
        public_keys: BTreeMap::new(),
    };

    bft2f::async_runtime::block_on(serve(args, node_config, params, keypair))
}

async fn serve(
    args: Args,
    config: NodeConfig,
    params: SystemParams,
    keypair: Arc<bft2f::crypto::signature::KeyPair>,
) -> Result<()> {
    let id = config.id;
    let peer_addrs = config.addrs.clone();
    let socket = Arc::new(UdpPeerHandle::bind(args.bind, peer_addrs).await?);

    let (executed_tx, mut executed_rx) = new_channel();
    let (events_tx, mut events_rx) = futures::channel::mpsc::unbounded();
    let events = TimeoutsHandle::new(events_tx);

    let mut replica = Replica::new(
        id,
        config,
        params,
        EchoService,
        socket.clone(),
        keypair,
        executed_tx,
        events,
        args.faulty,
    );

    info!("replica {} listening on {}", id, args.bind);

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            datagram = socket.recv_datagram(&mut buf) => {
                match datagram {
                    Ok((header, n)) => {
                        match SystemMessage::decode(&buf[Header::LENGTH..n]) {
                            Ok(msg) => {
                                if let Err(e) = replica.handle_message(header, msg).await {
                                    warn!("replica {} dropped a message: {}", id, e);
                                }
                            }
                            Err(e) => warn!("replica {} dropped an undecodable datagram: {}", id, e),
                        }
                    }
                    Err(e) => warn!("replica {} socket error: {}", id, e),
                }
            }
            Some(executed) = executed_rx.recv() => {
                if let Err(e) = replica.handle_event(ReplicaEvent::Executed(executed)).await {
                    warn!("replica {} failed to dispatch a reply: {}", id, e);
                }
            }
            Some(event) = futures::StreamExt::next(&mut events_rx) => {
                if let Err(e) = replica.handle_event(event).await {
                    warn!("replica {} failed to handle a timer event: {}", id, e);
                }
            }
        }
    }
}
