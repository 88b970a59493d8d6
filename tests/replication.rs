//! Drives a small cluster entirely in-memory (§4.M), exercising the
//! normal-case commit pipeline end to end through `Replica` and
//! `Client`, with no sockets involved.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;

use bft2f::communication::channel::{new_channel, ChannelRx};
use bft2f::communication::message::{Header, RequestMessage, SystemMessage, WireMessage};
use bft2f::communication::{NodeConfig, NodeId, PeerHandle};
use bft2f::core::client::{Client, RequestStatus};
use bft2f::core::server::{Replica, ReplicaEvent, SystemParams};
use bft2f::crypto::signature::KeyPair;
use bft2f::demo::EchoService;
use bft2f::executable::ExecutedReply;
use bft2f::ordering::{SeqNo, View};
use bft2f::testing::{InMemoryPeerHandle, Network};
use bft2f::timeouts::TimeoutsHandle;
use bft2f::InitConfig;

const N: usize = 4;
const F: usize = 1;

fn params() -> SystemParams {
    SystemParams {
        n: N,
        f: F,
        watermark: 128,
        checkpoint_interval: 128,
        cohesion_window: bft2f::checkpoint::DEFAULT_COHESION_WINDOW,
        view_timeout: Duration::from_millis(300),
    }
}

fn keypair_for(id: u32) -> Arc<KeyPair> {
    Arc::new(KeyPair::from_bytes(&[id as u8 + 1; 32]).unwrap())
}

/// Boots `N` replicas onto `network`, one marked `faulty` per
/// `faulty[i]`, and spawns each one's own event loop task.
fn spawn_cluster_with(network: &Network, faulty: &[bool]) -> Vec<tokio::task::JoinHandle<()>> {
    (0..N as u32)
        .map(|i| {
            let id = NodeId(i);
            let (peer, inbox) = network.register(id);
            let config = NodeConfig { id, n: N, f: F, addrs: BTreeMap::new(), public_keys: BTreeMap::new() };
            let (executed_tx, executed_rx) = new_channel();
            let (events_tx, events_rx) = futures::channel::mpsc::unbounded();
            let events = TimeoutsHandle::new(events_tx);
            let replica = Replica::new(
                id,
                config,
                params(),
                EchoService,
                Arc::new(peer),
                keypair_for(i),
                executed_tx,
                events,
                faulty[i as usize],
            );
            spawn_replica(replica, inbox, executed_rx, events_rx)
        })
        .collect()
}

/// Boots `N` correct replicas onto `network` and spawns each one's own
/// event loop task, mirroring `bin/replica.rs`'s `tokio::select!` shape.
fn spawn_cluster(network: &Network) -> Vec<tokio::task::JoinHandle<()>> {
    spawn_cluster_with(network, &[false; N])
}

fn spawn_replica(
    mut replica: Replica<EchoService>,
    mut inbox: ChannelRx<Vec<u8>>,
    mut executed_rx: ChannelRx<ExecutedReply<String>>,
    mut events_rx: UnboundedReceiver<ReplicaEvent<String>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(bytes) = inbox.recv() => {
                    let header = Header::deserialize_from(&bytes[..Header::LENGTH]).unwrap();
                    let msg: SystemMessage<String, String> =
                        SystemMessage::decode(&bytes[Header::LENGTH..]).unwrap();
                    replica.handle_message(header, msg).await.unwrap();
                }
                Some(executed) = executed_rx.recv() => {
                    replica.handle_event(ReplicaEvent::Executed(executed)).await.unwrap();
                }
                Some(event) = events_rx.next() => {
                    replica.handle_event(event).await.unwrap();
                }
                else => break,
            }
        }
    })
}

async fn send_request(
    peer: &InMemoryPeerHandle,
    from: NodeId,
    targets: &[NodeId],
    keypair: &KeyPair,
    req: RequestMessage<String>,
) {
    let payload = SystemMessage::<String, String>::Request(req).encode().unwrap();
    for &to in targets {
        let signature = keypair.sign(&payload);
        let wire = WireMessage::new(from, to, &payload, signature);
        let (header, body) = wire.into_inner();
        let mut datagram = vec![0u8; Header::LENGTH + body.len()];
        header.serialize_into(&mut datagram[..Header::LENGTH]).unwrap();
        datagram[Header::LENGTH..].copy_from_slice(body);
        peer.send_to(to, datagram).await.unwrap();
    }
}

/// Waits for the outstanding request to complete, returning the reply
/// payload, the sequence number it committed at, and the view it
/// committed under.
async fn recv_complete(
    client: &mut Client<String, String>,
    rx: &mut ChannelRx<Vec<u8>>,
    budget: Duration,
) -> (String, SeqNo, View) {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        assert!(!remaining.is_zero(), "client never reached a complete reply in time");
        let bytes = tokio::time::timeout(remaining, rx.recv())
            .await
            .expect("timed out waiting for a reply")
            .expect("client inbox closed unexpectedly");
        let msg: SystemMessage<String, String> =
            SystemMessage::decode(&bytes[Header::LENGTH..]).unwrap();
        let reply = match msg {
            SystemMessage::Reply(reply) => reply,
            _ => continue,
        };
        let seq = reply.entry.seq;
        let view = reply.entry.view;
        if let RequestStatus::Complete(result) = client.on_reply(reply) {
            return (result, seq, view);
        }
    }
}

#[tokio::test]
async fn normal_case_commits_and_replies() {
    let _guard = bft2f::init(InitConfig { async_threads: 2 }).unwrap();
    let network = Network::new();
    let handles = spawn_cluster(&network);

    let client_id = NodeId(N as u32);
    let client_keypair = keypair_for(client_id.id());
    let (client_peer, mut client_rx) = network.register(client_id);
    let mut client: Client<String, String> = Client::new(client_id, N, F, client_keypair.clone());

    let (req, targets) = client.make_request("hello".to_string());
    send_request(&client_peer, client_id, &targets, &client_keypair, req).await;

    let (result, seq, _view) = recv_complete(&mut client, &mut client_rx, Duration::from_secs(5)).await;
    assert_eq!(result, "hello");
    assert_eq!(seq, SeqNo::from(0));

    for h in handles {
        h.abort();
    }
}

/// A client multicasts its request to every replica (§4.H); the three
/// backups that aren't primary each forward their own copy to it. The
/// primary must collapse these into a single ordered sequence number
/// rather than spend one per forwarded copy.
#[tokio::test]
async fn concurrent_duplicate_forwards_consume_a_single_sequence_number() {
    let _guard = bft2f::init(InitConfig { async_threads: 2 }).unwrap();
    let network = Network::new();
    let handles = spawn_cluster(&network);

    let client_id = NodeId(N as u32);
    let client_keypair = keypair_for(client_id.id());
    let (client_peer, mut client_rx) = network.register(client_id);
    let mut client: Client<String, String> = Client::new(client_id, N, F, client_keypair.clone());

    let (req1, targets1) = client.make_request("first".to_string());
    send_request(&client_peer, client_id, &targets1, &client_keypair, req1).await;
    let (_, seq1, _) = recv_complete(&mut client, &mut client_rx, Duration::from_secs(5)).await;

    let (req2, targets2) = client.make_request("second".to_string());
    send_request(&client_peer, client_id, &targets2, &client_keypair, req2).await;
    let (result2, seq2, _) = recv_complete(&mut client, &mut client_rx, Duration::from_secs(5)).await;

    assert_eq!(result2, "second");
    assert_eq!(seq2, seq1.next(), "a request's backup-forwarded copies must not consume extra sequence numbers");

    for h in handles {
        h.abort();
    }
}

/// S2: one backup is silently faulty (`faulty: true` suppresses its
/// own outbound `PrePrepare`/`Prepare`/`Commit` broadcasts). The other
/// `2f+1` correct replicas must still assemble a commit quorum among
/// themselves and reply.
#[tokio::test]
async fn faulty_backup_does_not_block_the_commit_quorum() {
    let _guard = bft2f::init(InitConfig { async_threads: 2 }).unwrap();
    let network = Network::new();
    let handles = spawn_cluster_with(&network, &[false, false, false, true]);

    let client_id = NodeId(N as u32);
    let client_keypair = keypair_for(client_id.id());
    let (client_peer, mut client_rx) = network.register(client_id);
    let mut client: Client<String, String> = Client::new(client_id, N, F, client_keypair.clone());

    let (req, targets) = client.make_request("hello".to_string());
    send_request(&client_peer, client_id, &targets, &client_keypair, req).await;

    let (result, seq, view) = recv_complete(&mut client, &mut client_rx, Duration::from_secs(5)).await;
    assert_eq!(result, "hello");
    assert_eq!(seq, SeqNo::from(0));
    assert_eq!(view, View::INITIAL);

    for h in handles {
        h.abort();
    }
}

/// S3: the view-0 primary (replica 0) never proposes anything — it is
/// registered on the network (so sends to it don't error) but its
/// event loop is never spawned, so every message routed to it just
/// piles up unread. The three backups forward the client's request to
/// it, time out waiting on view 0, and move the cluster to view 1,
/// whose primary (by `View::primary`'s round robin, `1 % 4`) is
/// replica 1. A request resent once the new view is in place must
/// still commit.
#[tokio::test]
async fn view_change_recovers_from_a_silent_primary() {
    let _guard = bft2f::init(InitConfig { async_threads: 2 }).unwrap();
    let network = Network::new();

    // registering replica 0 without spawning its loop models a crashed
    // primary: its inbox accumulates forwarded requests and view-change
    // traffic that nobody ever reads.
    let (_dead_primary_peer, _dead_primary_inbox) = network.register(NodeId(0));

    let mut handles = Vec::new();
    for i in 1..N as u32 {
        let id = NodeId(i);
        let (peer, inbox) = network.register(id);
        let config = NodeConfig { id, n: N, f: F, addrs: BTreeMap::new(), public_keys: BTreeMap::new() };
        let (executed_tx, executed_rx) = new_channel();
        let (events_tx, events_rx) = futures::channel::mpsc::unbounded();
        let events = TimeoutsHandle::new(events_tx);
        let replica = Replica::new(
            id,
            config,
            params(),
            EchoService,
            Arc::new(peer),
            keypair_for(i),
            executed_tx,
            events,
            false,
        );
        handles.push(spawn_replica(replica, inbox, executed_rx, events_rx));
    }

    let client_id = NodeId(N as u32);
    let client_keypair = keypair_for(client_id.id());
    let (client_peer, mut client_rx) = network.register(client_id);
    let mut client: Client<String, String> = Client::new(client_id, N, F, client_keypair.clone());

    // the dead primary never pre-prepares this one; every backup arms
    // a view timer on it and, hearing nothing back, moves to view 1.
    let (req1, targets1) = client.make_request("hello".to_string());
    send_request(&client_peer, client_id, &targets1, &client_keypair, req1).await;

    // give the 300ms view timer (and the view-change/new-view exchange
    // it triggers) room to run its course before resending.
    tokio::time::sleep(Duration::from_millis(800)).await;

    let (req2, targets2) = client.make_request("hello again".to_string());
    send_request(&client_peer, client_id, &targets2, &client_keypair, req2).await;

    let (result, seq, view) =
        recv_complete(&mut client, &mut client_rx, Duration::from_secs(5)).await;
    assert_eq!(result, "hello again");
    assert_eq!(seq, SeqNo::from(0));
    assert_eq!(view, View::INITIAL.next(), "request should commit under the new primary, view 1");

    for h in handles {
        h.abort();
    }
}
