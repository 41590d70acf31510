//! End-to-end transport scenarios over the in-process datagram layer.
//!
//! Every test runs under a paused tokio clock, so timer-driven behavior
//! (handshake backoff, retransmission, keepalives, idle close) is exercised
//! in virtual time.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use sstream::datagram::memory::{FaultPlan, FaultVerdict, MemoryNetwork};
use sstream::packet::{ChannelHeader, StreamHeader, StreamPacketType};
use sstream::{ConnectionManager, Endpoint, SstError, Stream, StreamState};

const HOST_A: u64 = 1;
const HOST_B: u64 = 2;

fn setup(faults: FaultPlan) -> (ConnectionManager<u64>, Arc<MemoryNetwork<u64>>) {
    let manager = ConnectionManager::new();
    let net = MemoryNetwork::new(manager.strand(), faults);
    manager.create_datagram_layer(HOST_A, net.layer(HOST_A));
    manager.create_datagram_layer(HOST_B, net.layer(HOST_B));
    (manager, net)
}

/// Poll `cond` while letting virtual time advance, up to `max`.
async fn wait_until(mut cond: impl FnMut() -> bool, max: Duration) -> bool {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    loop {
        if cond() {
            return true;
        }
        if waited >= max {
            return false;
        }
        tokio::time::sleep(step).await;
        waited += step;
    }
}

type SharedStream = Arc<Mutex<Option<Arc<Stream<u64>>>>>;

/// Listen on (HOST_A, 42), connect from HOST_B, and return both root
/// streams once the handshake completes.
async fn establish(manager: &ConnectionManager<u64>) -> (Arc<Stream<u64>>, Arc<Stream<u64>>) {
    let accepted: SharedStream = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&accepted);
    manager
        .listen(
            Arc::new(move |result| {
                *sink.lock() = Some(result.expect("accept failed"));
            }),
            Endpoint::new(HOST_A, 42),
        )
        .expect("listen failed");

    let connected: SharedStream = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&connected);
    manager
        .connect_stream(
            Endpoint::new(HOST_B, 0),
            Endpoint::new(HOST_A, 42),
            Box::new(move |result| {
                *sink.lock() = Some(result.expect("connect failed"));
            }),
        )
        .expect("connect_stream failed");

    assert!(
        wait_until(
            || connected.lock().is_some() && accepted.lock().is_some(),
            Duration::from_secs(120),
        )
        .await,
        "handshake did not complete"
    );

    let initiator = connected.lock().clone().unwrap();
    let acceptor = accepted.lock().clone().unwrap();
    (initiator, acceptor)
}

fn collecting_reader(stream: &Arc<Stream<u64>>) -> Arc<Mutex<Vec<u8>>> {
    let collected: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    stream.read_callback(move |data| sink.lock().extend_from_slice(data));
    collected
}

#[tokio::test(start_paused = true)]
async fn handshake_establishes_both_sides() {
    let (manager, _net) = setup(FaultPlan::default());
    let (initiator, acceptor) = establish(&manager).await;

    assert!(initiator.connected());
    assert!(acceptor.connected());

    // The connect side learned its peer port from the handshake reply: the
    // acceptor picked its local port to match the channel it allocated.
    let init_conn = initiator.connection().unwrap();
    let acc_conn = acceptor.connection().unwrap();
    assert_eq!(
        init_conn.remote_endpoint().port,
        acc_conn.local_endpoint().port
    );
    assert_eq!(manager.active_connections(), 2);
}

#[tokio::test(start_paused = true)]
async fn bidirectional_stream_delivery() {
    let (manager, _net) = setup(FaultPlan::default());
    let (initiator, acceptor) = establish(&manager).await;

    let at_acceptor = collecting_reader(&acceptor);
    let at_initiator = collecting_reader(&initiator);

    assert_eq!(initiator.write(b"ping from the initiator").unwrap(), 23);
    assert_eq!(acceptor.write(b"pong from the acceptor").unwrap(), 22);

    assert!(
        wait_until(
            || at_acceptor.lock().len() == 23 && at_initiator.lock().len() == 22,
            Duration::from_secs(60),
        )
        .await
    );
    assert_eq!(at_acceptor.lock().as_slice(), b"ping from the initiator");
    assert_eq!(at_initiator.lock().as_slice(), b"pong from the acceptor");
    assert_eq!(initiator.state(), StreamState::Connected);
}

#[tokio::test(start_paused = true)]
async fn writev_gathers_slices() {
    let (manager, _net) = setup(FaultPlan::default());
    let (initiator, acceptor) = establish(&manager).await;

    let received = collecting_reader(&acceptor);
    let n = initiator
        .writev(&[b"one ".as_slice(), b"two ".as_slice(), b"three".as_slice()])
        .unwrap();
    assert_eq!(n, 13);

    assert!(wait_until(|| received.lock().len() == 13, Duration::from_secs(60)).await);
    assert_eq!(received.lock().as_slice(), b"one two three");
}

#[tokio::test(start_paused = true)]
async fn large_transfer_survives_loss_and_reorder() {
    let (manager, _net) = setup(FaultPlan {
        drop_every_nth: Some(7),
        reorder_probability: 0.1,
        seed: 42,
        ..FaultPlan::default()
    });
    let (initiator, acceptor) = establish(&manager).await;

    const TOTAL: usize = 1 << 20; // 1 MiB
    let payload: Vec<u8> = (0..TOTAL).map(|i| (i * 31 % 251) as u8).collect();

    let received = collecting_reader(&acceptor);

    // 4 KiB application writes; the queue budget holds the whole payload.
    for chunk in payload.chunks(4096) {
        assert_eq!(initiator.write(chunk).unwrap(), chunk.len());
    }

    assert!(
        wait_until(|| received.lock().len() == TOTAL, Duration::from_secs(3600)).await,
        "transfer did not complete: got {} of {} bytes",
        received.lock().len(),
        TOTAL
    );
    assert_eq!(*received.lock(), payload, "delivered bytes differ");
}

#[tokio::test(start_paused = true)]
async fn late_ack_does_not_duplicate_delivery() {
    let (manager, net) = setup(FaultPlan::default());
    let (initiator, acceptor) = establish(&manager).await;

    let received = collecting_reader(&acceptor);

    // Hold the first stream-level ACK hostage so the sender times out and
    // requeues the data.
    let held_one = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&held_one);
    net.set_intercept(move |raw| {
        if *flag.lock() {
            return FaultVerdict::Deliver;
        }
        let Ok(channel) = ChannelHeader::decode(raw) else {
            return FaultVerdict::Deliver;
        };
        if channel.payload.is_empty() {
            return FaultVerdict::Deliver;
        }
        let Ok(stream) = StreamHeader::decode(&channel.payload) else {
            return FaultVerdict::Deliver;
        };
        if stream.packet_type == StreamPacketType::Ack {
            *flag.lock() = true;
            return FaultVerdict::Hold;
        }
        FaultVerdict::Deliver
    });

    let message = vec![0xA5u8; 600];
    initiator.write(&message).unwrap();

    // The retransmission path has to resolve it: the duplicate data is
    // acked, and the graveyard swallows the stale seqno.
    assert!(wait_until(|| received.lock().len() >= 600, Duration::from_secs(120)).await);

    // Now release the original ack, long after a fresh one settled things.
    net.release_held();
    tokio::time::sleep(Duration::from_secs(30)).await;

    // Exactly one copy delivered, before and after the late ack.
    assert_eq!(received.lock().len(), 600);
    assert_eq!(received.lock().as_slice(), message.as_slice());

    // The stream is still usable afterwards.
    initiator.write(b"after the late ack").unwrap();
    assert!(wait_until(|| received.lock().len() == 618, Duration::from_secs(120)).await);
}

#[tokio::test(start_paused = true)]
async fn graceful_close_drains_queued_data() {
    let (manager, _net) = setup(FaultPlan::default());
    let (initiator, acceptor) = establish(&manager).await;

    let received = collecting_reader(&acceptor);

    let payload = vec![7u8; 32 * 1024];
    assert_eq!(initiator.write(&payload).unwrap(), payload.len());
    initiator.close(false);

    assert!(wait_until(|| received.lock().len() == payload.len(), Duration::from_secs(600)).await);
    assert!(
        wait_until(
            || initiator.state() == StreamState::Disconnected,
            Duration::from_secs(600),
        )
        .await,
        "stream did not drain to Disconnected"
    );

    // Writes after close are rejected.
    assert!(matches!(
        initiator.write(b"too late"),
        Err(SstError::StreamClosed)
    ));
}

#[tokio::test(start_paused = true)]
async fn idle_partition_closes_both_connections() {
    let (manager, net) = setup(FaultPlan::default());

    // One long-lived listener whose latest accepted stream is observable.
    let accepted: SharedStream = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&accepted);
    manager
        .listen(
            Arc::new(move |result| {
                *sink.lock() = Some(result.expect("accept failed"));
            }),
            Endpoint::new(HOST_A, 42),
        )
        .unwrap();

    let connect = |connected: SharedStream| {
        let sink = Arc::clone(&connected);
        manager
            .connect_stream(
                Endpoint::new(HOST_B, 0),
                Endpoint::new(HOST_A, 42),
                Box::new(move |result| {
                    *sink.lock() = Some(result.expect("connect failed"));
                }),
            )
            .unwrap();
    };

    let connected: SharedStream = Arc::new(Mutex::new(None));
    connect(Arc::clone(&connected));
    assert!(
        wait_until(
            || connected.lock().is_some() && accepted.lock().is_some(),
            Duration::from_secs(120),
        )
        .await
    );
    assert_eq!(manager.active_connections(), 2);

    // Partition the network: keepalives stop arriving on both sides.
    net.set_intercept(|_| FaultVerdict::Drop);

    // 300 s of receive silence (plus slack for the service cadence) closes
    // the streams, which tears down the connections and frees the channels.
    assert!(
        wait_until(|| manager.active_connections() == 0, Duration::from_secs(900)).await,
        "connections were not torn down after the idle timeout"
    );

    // The endpoints are reusable: a fresh handshake succeeds.
    net.set_intercept(|_| FaultVerdict::Deliver);
    *accepted.lock() = None;
    let reconnected: SharedStream = Arc::new(Mutex::new(None));
    connect(Arc::clone(&reconnected));
    assert!(
        wait_until(
            || reconnected.lock().is_some() && accepted.lock().is_some(),
            Duration::from_secs(120),
        )
        .await,
        "reconnect after idle close failed"
    );

    let initiator = reconnected.lock().clone().unwrap();
    let acceptor = accepted.lock().clone().unwrap();
    let received = collecting_reader(&acceptor);
    initiator.write(b"fresh start").unwrap();
    assert!(wait_until(|| received.lock().len() == 11, Duration::from_secs(60)).await);
}

#[tokio::test(start_paused = true)]
async fn datagram_fragmentation_round_trip() {
    let (manager, _net) = setup(FaultPlan::default());
    let (initiator, acceptor) = establish(&manager).await;

    let init_conn = initiator.connection().unwrap();
    let acc_conn = acceptor.connection().unwrap();

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    acc_conn.register_datagram_reader(8, Arc::new(move |data| sink.lock().push(data.to_vec())));

    let payload: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
    let done = Arc::new(Mutex::new(None));
    let done_sink = Arc::clone(&done);
    init_conn
        .datagram(
            Bytes::from(payload.clone()),
            7,
            8,
            Some(Box::new(move |result, _data| {
                *done_sink.lock() = Some(result.is_ok());
            })),
        )
        .unwrap();

    assert_eq!(*done.lock(), Some(true));

    // One callback with the reassembled 4096-byte payload.
    assert!(wait_until(|| !received.lock().is_empty(), Duration::from_secs(60)).await);
    let got = received.lock();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0], payload);
}

#[tokio::test(start_paused = true)]
async fn child_streams_carry_initial_data() {
    let (manager, _net) = setup(FaultPlan::default());
    let (initiator, acceptor) = establish(&manager).await;

    // Accept child streams on port 9 and read everything they deliver.
    let child_data: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let accepted_child: SharedStream = Arc::new(Mutex::new(None));
    let data_sink = Arc::clone(&child_data);
    let child_sink = Arc::clone(&accepted_child);
    acceptor.listen_substream(
        9,
        Arc::new(move |result| {
            let stream = result.expect("child accept failed");
            let sink = Arc::clone(&data_sink);
            stream.read_callback(move |data| sink.lock().extend_from_slice(data));
            *child_sink.lock() = Some(stream);
        }),
    );

    let created_child: SharedStream = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&created_child);
    let buffered = initiator
        .create_child_stream(
            b"hello child",
            5,
            9,
            Box::new(move |result| {
                *sink.lock() = Some(result.expect("child create failed"));
            }),
        )
        .unwrap();
    assert_eq!(buffered, 11);

    assert!(
        wait_until(
            || created_child.lock().is_some() && child_data.lock().len() == 11,
            Duration::from_secs(120),
        )
        .await
    );
    assert_eq!(child_data.lock().as_slice(), b"hello child");

    // More data flows over the child after the handshake.
    let child = created_child.lock().clone().unwrap();
    child.write(b" and more").unwrap();
    assert!(wait_until(|| child_data.lock().len() == 20, Duration::from_secs(60)).await);
}

#[tokio::test(start_paused = true)]
async fn unreachable_peer_fails_the_creation_callback() {
    let (manager, _net) = setup(FaultPlan::default());

    // Nobody listens on (HOST_A, 99): the handshake retries, backs off,
    // and eventually reports failure.
    let outcome: Arc<Mutex<Option<std::result::Result<(), ()>>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&outcome);
    manager
        .connect_stream(
            Endpoint::new(HOST_B, 0),
            Endpoint::new(HOST_A, 99),
            Box::new(move |result| {
                *sink.lock() = Some(result.map(|_| ()).map_err(|_| ()));
            }),
        )
        .unwrap();

    assert!(
        wait_until(|| outcome.lock().is_some(), Duration::from_secs(600)).await,
        "creation callback never fired"
    );
    assert_eq!(*outcome.lock(), Some(Err(())));
    assert!(
        wait_until(|| manager.active_connections() == 0, Duration::from_secs(600)).await,
        "failed connection was not cleaned up"
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_pending_connect_is_rejected() {
    let (manager, _net) = setup(FaultPlan::default());

    manager
        .connect_stream(
            Endpoint::new(HOST_B, 77),
            Endpoint::new(HOST_A, 42),
            Box::new(|_| {}),
        )
        .ok();

    let failed = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&failed);
    let result = manager.connect_stream(
        Endpoint::new(HOST_B, 77),
        Endpoint::new(HOST_A, 42),
        Box::new(move |result| {
            *sink.lock() = Some(result.is_err());
        }),
    );
    assert!(result.is_err());
    assert_eq!(*failed.lock(), Some(true));
}

#[tokio::test(start_paused = true)]
async fn stop_requests_graceful_shutdown() {
    let (manager, _net) = setup(FaultPlan::default());
    let (initiator, acceptor) = establish(&manager).await;
    let _reader = collecting_reader(&acceptor);

    initiator.write(b"parting words").unwrap();
    manager.stop();

    assert!(
        wait_until(
            || initiator.state() == StreamState::Disconnected
                && acceptor.state() == StreamState::Disconnected,
            Duration::from_secs(600),
        )
        .await,
        "streams did not stop"
    );
}
