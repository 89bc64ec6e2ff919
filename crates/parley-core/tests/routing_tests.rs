//! End-to-end routing tests.
//!
//! Instances are simulated in-process: each one is a task driving a
//! `NodeClient` over an in-memory duplex stream, connected to a real bridge
//! and router.

use bytes::Bytes;
use parley_core::bridge::{BridgeStats, InstanceBridge};
use parley_core::{Dispatch, NodeClient, ParleyError, Quotas, RouteReport, Router};
use std::time::Duration;
use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

type Client = NodeClient<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;
type BridgeTask = JoinHandle<(InstanceBridge, parley_core::Result<()>)>;

struct Run {
    router: JoinHandle<RouteReport>,
    bridges: Vec<BridgeTask>,
}

impl Run {
    /// Wait for every bridge and the router.
    async fn finish(self) -> (RouteReport, Vec<(BridgeStats, parley_core::Result<()>)>) {
        let mut bridges = Vec::new();
        for bridge in self.bridges {
            let (bridge, result) = bridge.await.unwrap();
            bridges.push((bridge.stats(), result));
        }
        (self.router.await.unwrap(), bridges)
    }
}

/// Start a router and `n` bridges; returns the instances' ends of the pipes.
fn start(n: usize, quotas: Quotas) -> (Run, Vec<DuplexStream>) {
    let (router, channels) = Router::new(n);
    let router = tokio::spawn(router.record_history(true).run());
    let mut bridges = Vec::new();
    let mut instances = Vec::new();
    for (id, channels) in channels.into_iter().enumerate() {
        let (instance, coordinator) = duplex(64 * 1024);
        instances.push(instance);
        bridges.push(tokio::spawn(async move {
            let mut bridge = InstanceBridge::new(id, n, quotas);
            let (reader, writer) = split(coordinator);
            let result = bridge.run(reader, writer, channels).await;
            (bridge, result)
        }));
    }
    (Run { router, bridges }, instances)
}

async fn connect(stream: DuplexStream) -> Client {
    let (reader, writer) = split(stream);
    NodeClient::connect(reader, writer).await.unwrap()
}

/// Instances that only connect and leave.
fn idle(streams: Vec<DuplexStream>) -> Vec<JoinHandle<()>> {
    streams
        .into_iter()
        .map(|stream| {
            tokio::spawn(async move {
                connect(stream).await.finish().await.unwrap();
            })
        })
        .collect()
}

#[tokio::test]
async fn test_round_trip_between_two_of_twenty() {
    let (run, mut streams) = start(20, Quotas::default());
    let receiver_stream = streams.remove(5);
    let sender_stream = streams.remove(3);
    let others = idle(streams);

    let receiver = tokio::spawn(async move {
        let mut client = connect(receiver_stream).await;
        assert_eq!(client.node_count(), 20);
        assert_eq!(client.node_id(), 5);
        let received = client.receive(3, 0).await.unwrap();
        client.finish().await.unwrap();
        received
    });
    let sender = tokio::spawn(async move {
        let mut client = connect(sender_stream).await;
        assert_eq!(client.node_id(), 3);
        client.send(5, 0, b"foobaz").await.unwrap();
        client.finish().await.unwrap();
    });

    let (source, payload) = receiver.await.unwrap();
    assert_eq!(source, 3);
    assert_eq!(payload, Bytes::from_static(b"foobaz"));
    sender.await.unwrap();
    for other in others {
        other.await.unwrap();
    }

    let (report, bridges) = run.finish().await;
    assert!(report.is_success());
    assert!(report.undelivered.is_empty());
    assert_eq!(report.requests_processed, 2);
    assert!(bridges.iter().all(|(_, result)| result.is_ok()));
    assert_eq!(bridges[3].0.messages_sent, 1);
    assert_eq!(bridges[3].0.bytes_sent, 6);
}

#[tokio::test]
async fn test_messages_keep_send_order() {
    let (run, mut streams) = start(2, Quotas::default());
    let receiver_stream = streams.pop().unwrap();
    let sender_stream = streams.pop().unwrap();

    let sender = tokio::spawn(async move {
        let mut client = connect(sender_stream).await;
        for i in 0..5u8 {
            client.send(1, i as i32, &[b'0' + i]).await.unwrap();
        }
        client.finish().await.unwrap();
    });
    let receiver = tokio::spawn(async move {
        let mut client = connect(receiver_stream).await;
        let mut payloads = Vec::new();
        for _ in 0..5 {
            let (_, payload) = client.receive(0, 0).await.unwrap();
            payloads.push(payload);
        }
        client.finish().await.unwrap();
        payloads
    });

    sender.await.unwrap();
    let payloads = receiver.await.unwrap();
    assert_eq!(payloads, vec!["0", "1", "2", "3", "4"]);

    let (report, _) = run.finish().await;
    assert!(report.is_success());
    let history = report.history.unwrap();
    assert_eq!(history.len(), 10);
    assert!(history.windows(2).all(|w| w[0].time <= w[1].time));
}

#[tokio::test]
async fn test_receive_any_takes_earliest_sender() {
    let (run, mut streams) = start(3, Quotas::default());
    let early_stream = streams.pop().unwrap();
    let late_stream = streams.pop().unwrap();
    let receiver_stream = streams.pop().unwrap();

    // Instance 2 sends before instance 1 in virtual time.
    let early = tokio::spawn(async move {
        let mut client = connect(early_stream).await;
        client.send(0, 10, b"early").await.unwrap();
        client.finish().await.unwrap();
    });
    let late = tokio::spawn(async move {
        let mut client = connect(late_stream).await;
        client.send(0, 20, b"late").await.unwrap();
        client.finish().await.unwrap();
    });
    let receiver = tokio::spawn(async move {
        let mut client = connect(receiver_stream).await;
        let first = client.receive_any(0).await.unwrap();
        let second = client.receive_any(0).await.unwrap();
        client.finish().await.unwrap();
        (first, second)
    });

    let ((first_source, first), (second_source, second)) = receiver.await.unwrap();
    assert_eq!((first_source, &first[..]), (2, &b"early"[..]));
    assert_eq!((second_source, &second[..]), (1, &b"late"[..]));
    early.await.unwrap();
    late.await.unwrap();

    let (report, bridges) = run.finish().await;
    assert!(report.is_success());
    assert_eq!(report.final_time, Duration::from_millis(20));
    assert_eq!(bridges[0].0.time_blocked, Duration::from_millis(20));
}

#[tokio::test]
async fn test_blocking_time_carries_into_later_requests() {
    let (run, mut streams) = start(2, Quotas::default());
    let sender_stream = streams.pop().unwrap();
    let receiver_stream = streams.pop().unwrap();

    let sender = tokio::spawn(async move {
        let mut client = connect(sender_stream).await;
        client.send(0, 1234, b"wake up").await.unwrap();
        client.finish().await.unwrap();
    });
    let receiver = tokio::spawn(async move {
        let mut client = connect(receiver_stream).await;
        client.receive_any(0).await.unwrap();
        client.send(1, 1, b"too late").await.unwrap();
        client.finish().await.unwrap();
    });
    sender.await.unwrap();
    receiver.await.unwrap();

    let (report, bridges) = run.finish().await;
    assert!(report.is_success());
    assert_eq!(report.undelivered.len(), 1);
    assert!(report.undelivered[0].send_time >= Duration::from_millis(1234));
    assert_eq!(bridges[0].0.time_blocked, Duration::from_millis(1234));
}

#[tokio::test]
async fn test_deadlock_is_reported_with_blocked_instances() {
    let (run, mut streams) = start(3, Quotas::default());
    let third = streams.pop().unwrap();
    let second = streams.pop().unwrap();
    let first = streams.pop().unwrap();

    let waiters: Vec<_> = [first, third]
        .into_iter()
        .map(|stream| {
            tokio::spawn(async move {
                let mut client = connect(stream).await;
                client.receive(1, 0).await
            })
        })
        .collect();
    let quitter = tokio::spawn(async move {
        connect(second).await.finish().await.unwrap();
    });

    for waiter in waiters {
        assert!(waiter.await.unwrap().is_err());
    }
    quitter.await.unwrap();

    let (report, bridges) = run.finish().await;
    assert!(matches!(
        report.error,
        Some(ParleyError::Deadlock { ref blocked }) if blocked == &[0, 2]
    ));
    assert!(matches!(bridges[0].1, Err(ParleyError::MissingResponse)));
    assert!(bridges[1].1.is_ok());
}

#[tokio::test]
async fn test_quota_violation_stops_the_run() {
    let (run, mut streams) = start(2, Quotas::default());
    let idle_stream = streams.pop().unwrap();
    let sender_stream = streams.pop().unwrap();

    let sender = tokio::spawn(async move {
        let mut client = connect(sender_stream).await;
        for i in 0..=1000 {
            if client.send(1, i, b"x").await.is_err() {
                break;
            }
        }
    });
    let idle = tokio::spawn(async move {
        connect(idle_stream).await.finish().await.unwrap();
    });

    let (report, bridges) = run.finish().await;
    sender.await.unwrap();
    idle.await.unwrap();

    let err = report.error.unwrap();
    assert_eq!(err.instance_id(), Some(0));
    assert!(err.is_quota());
    assert!(bridges[0].1.as_ref().unwrap_err().is_quota());
    assert_eq!(report.undelivered.len(), 1000);
}

#[tokio::test]
async fn test_invalid_target_is_attributed() {
    let (run, mut streams) = start(2, Quotas::default());
    let idle_stream = streams.pop().unwrap();
    let sender_stream = streams.pop().unwrap();

    let sender = tokio::spawn(async move {
        let mut client = connect(sender_stream).await;
        let _ = client.send(7, 0, b"nowhere").await;
    });
    let idle = tokio::spawn(async move {
        connect(idle_stream).await.finish().await.unwrap();
    });

    let (report, _) = run.finish().await;
    sender.await.unwrap();
    idle.await.unwrap();

    let err = report.error.unwrap();
    assert_eq!(err.instance_id(), Some(0));
    assert!(err.is_protocol());
    assert_eq!(
        err.to_string(),
        "instance 0: protocol error: invalid target instance in a send request: 7"
    );
}

/// Three rounds of a ring exchange where instance 0 also collects a tally
/// from everybody through receive-any. `pacing` delays each instance in real
/// time before every round.
async fn ring_exchange(pacing: [u64; 4]) -> (Vec<Dispatch>, Vec<(usize, Bytes)>) {
    let (run, streams) = start(4, Quotas::default());
    let mut instances = Vec::new();
    for (id, stream) in streams.into_iter().enumerate() {
        let delay = Duration::from_millis(pacing[id]);
        instances.push(tokio::spawn(async move {
            let mut client = connect(stream).await;
            let mut received = Vec::new();
            for round in 0..3 {
                tokio::time::sleep(delay).await;
                let time = (round * 100 + id * 7) as i32;
                let payload = format!("{}:{}", id, round);
                client.send((id + 1) % 4, time, payload.as_bytes()).await.unwrap();
                if id == 0 {
                    // Tallies from 1, 2 and 3 plus the ring message from 3.
                    for k in 0..4 {
                        received.push(client.receive_any(time + 2 + k).await.unwrap());
                    }
                } else {
                    client.send(0, time + 1, b"tally").await.unwrap();
                    received.push(client.receive((id + 3) % 4, time + 2).await.unwrap());
                }
            }
            client.finish().await.unwrap();
            received
        }));
    }

    let mut collected = Vec::new();
    for instance in instances {
        collected.push(instance.await.unwrap());
    }
    let (report, _) = run.finish().await;
    assert!(report.is_success(), "{:?}", report.error);
    assert!(report.undelivered.is_empty());
    (report.history.unwrap(), collected.swap_remove(0))
}

#[tokio::test]
async fn test_runs_are_reproducible() {
    let (first_history, first_received) = ring_exchange([0, 3, 1, 2]).await;
    let (second_history, second_received) = ring_exchange([2, 0, 3, 1]).await;

    // 3 rounds of: 4 ring sends, 3 tallies, 3 receives and 4 receive-anys.
    assert_eq!(first_history.len(), 42);
    assert_eq!(first_history, second_history);
    assert_eq!(first_received, second_received);
}
