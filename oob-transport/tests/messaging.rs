//! End-to-end delivery between endpoints over the in-memory network.

mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use oob_transport::{
    Buffers, Bytes, MemoryNetwork, Oob, OobError, PeerState, ProcessName, RecvFlags, SendFlags,
};
use support::{endpoint, init_tracing, introduce, name, next, pattern, sink, wait_until, WAIT};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_and_receive_between_endpoints() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = endpoint(&net, 0).await;
    let b = endpoint(&net, 1).await;
    introduce(&[&a, &b]);

    let (on_recv, mut received) = sink();
    b.recv_async(ProcessName::ANY, vec![vec![0; 64]], 7, RecvFlags::empty(), on_recv)
        .expect("post");
    let (on_send, mut sent) = sink();
    a.send_async(b.local_name(), vec![Bytes::from_static(b"hello")], 7, on_send)
        .expect("send");

    let done = next(&mut sent).await;
    assert_eq!(done.status, Ok(5));
    assert_eq!(done.peer, b.local_name());
    assert!(matches!(done.buffers, Buffers::Sent(_)));

    let got = next(&mut received).await;
    assert_eq!(got.status, Ok(5));
    assert_eq!(got.peer, a.local_name());
    assert_eq!(got.tag, 7);
    assert_eq!(got.buffers.to_vec(), b"hello");

    assert_eq!(a.peer_state(b.local_name()), Some(PeerState::Connected));
    wait_until(|| b.peer_state(a.local_name()) == Some(PeerState::Connected)).await;
    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_posted_receive_for_peer_takes_message_directly() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = endpoint(&net, 0).await;
    let b = endpoint(&net, 1).await;
    introduce(&[&a, &b]);

    let (on_recv, mut received) = sink();
    b.recv_async(a.local_name(), vec![vec![0; 128]], 5, RecvFlags::empty(), on_recv)
        .expect("post");
    a.send_async(b.local_name(), vec![Bytes::from(pattern(100))], 5, |_| {})
        .expect("send");

    let got = next(&mut received).await;
    assert_eq!(got.status, Ok(100));
    assert_eq!(got.peer, a.local_name());
    assert_eq!(got.buffers.to_vec(), pattern(100));
    let stats = b.stats();
    assert_eq!(stats.matching.unexpected, 0);
    assert_eq!(stats.matching.posted, 0);
    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_posted_receives_match_arrivals_in_order() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = endpoint(&net, 0).await;
    let b = endpoint(&net, 1).await;
    introduce(&[&a, &b]);

    let (first, mut first_rx) = sink();
    b.recv_async(a.local_name(), vec![vec![0; 8]], 7, RecvFlags::empty(), first)
        .expect("post");
    let (second, mut second_rx) = sink();
    b.recv_async(a.local_name(), vec![vec![0; 8]], 7, RecvFlags::empty(), second)
        .expect("post");
    for payload in [b"first", b"secnd"] {
        a.send_async(b.local_name(), vec![Bytes::from_static(payload)], 7, |_| {})
            .expect("send");
    }

    assert_eq!(next(&mut first_rx).await.buffers.to_vec(), b"first");
    assert_eq!(next(&mut second_rx).await.buffers.to_vec(), b"secnd");
    assert_eq!(b.stats().matching.unexpected, 0);
    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_byte_transfers_deliver_large_message() {
    init_tracing();
    let net = MemoryNetwork::new().with_max_transfer(1).with_capacity(16);
    let a = endpoint(&net, 0).await;
    let b = endpoint(&net, 1).await;
    introduce(&[&a, &b]);

    let payload = pattern(10_000);
    let (on_recv, mut received) = sink();
    b.recv_async(a.local_name(), Vec::new(), 1, RecvFlags::ALLOCATE_BUFFER, on_recv)
        .expect("post");
    a.send_async(
        b.local_name(),
        vec![Bytes::from(payload[..4_000].to_vec()), Bytes::from(payload[4_000..].to_vec())],
        1,
        |_| {},
    )
    .expect("send");

    let got = next(&mut received).await;
    assert_eq!(got.status, Ok(10_000));
    assert!(matches!(got.buffers, Buffers::Pooled(_)));
    assert_eq!(got.buffers.to_vec(), payload);
    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unexpected_messages_match_in_arrival_order() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = endpoint(&net, 0).await;
    let b = endpoint(&net, 1).await;
    introduce(&[&a, &b]);

    for i in 0..3u8 {
        a.send_async(b.local_name(), vec![Bytes::from(vec![i; 4])], 3, |_| {})
            .expect("send");
    }
    wait_until(|| b.stats().matching.unexpected == 3).await;
    assert_eq!(b.stats().matching.unexpected_bytes, 12);

    for i in 0..3u8 {
        let (on_recv, mut received) = sink();
        b.recv_async(a.local_name(), vec![vec![0; 4]], 3, RecvFlags::empty(), on_recv)
            .expect("post");
        let got = next(&mut received).await;
        assert_eq!(got.buffers.to_vec(), vec![i; 4]);
    }
    assert_eq!(b.stats().matching.unexpected, 0);
    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_persistent_receive_sees_every_message() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = endpoint(&net, 0).await;
    let b = endpoint(&net, 1).await;
    let c = endpoint(&net, 2).await;
    introduce(&[&a, &b, &c]);

    let (on_recv, mut received) = sink();
    c.recv_async(ProcessName::ANY, vec![vec![0; 8]], 9, RecvFlags::PERSISTENT, on_recv)
        .expect("post");
    a.send_async(c.local_name(), vec![Bytes::from_static(b"from-a")], 9, |_| {})
        .expect("send");
    b.send_async(c.local_name(), vec![Bytes::from_static(b"from-b")], 9, |_| {})
        .expect("send");

    let mut senders = vec![next(&mut received).await, next(&mut received).await]
        .into_iter()
        .map(|done| (done.peer, done.buffers.to_vec()))
        .collect::<Vec<_>>();
    senders.sort();
    assert_eq!(
        senders,
        vec![
            (a.local_name(), b"from-a".to_vec()),
            (b.local_name(), b"from-b".to_vec()),
        ]
    );
    assert_eq!(c.stats().matching.posted, 1);

    c.cancel_recv(ProcessName::ANY, 9).expect("cancel");
    assert_eq!(next(&mut received).await.status, Err(OobError::Cancelled));
    for ep in [a, b, c] {
        ep.shutdown();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_to_self_loops_back() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = endpoint(&net, 0).await;

    let (on_recv, mut received) = sink();
    a.recv_async(a.local_name(), vec![vec![0; 16]], 2, RecvFlags::empty(), on_recv)
        .expect("post");
    let (on_send, mut sent) = sink();
    a.send_async(a.local_name(), vec![Bytes::from_static(b"me")], 2, on_send)
        .expect("send");

    assert_eq!(next(&mut received).await.buffers.to_vec(), b"me");
    assert_eq!(next(&mut sent).await.status, Ok(2));
    assert_eq!(a.stats().peers, 0);
    a.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_recv_until_times_out_without_consuming() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = endpoint(&net, 0).await;
    let b = endpoint(&net, 1).await;
    introduce(&[&a, &b]);

    let waiter = b.clone();
    let result = tokio::task::spawn_blocking(move || {
        waiter.recv_until(
            ProcessName::ANY,
            vec![vec![0; 8]],
            4,
            RecvFlags::empty(),
            Instant::now() + Duration::from_millis(50),
        )
    })
    .await
    .expect("join");
    assert!(matches!(result, Err(OobError::Timeout)));
    assert_eq!(b.stats().matching.posted, 0);

    a.send_async(b.local_name(), vec![Bytes::from_static(b"late")], 4, |_| {})
        .expect("send");
    wait_until(|| b.stats().matching.unexpected == 1).await;

    let waiter = b.clone();
    let got = tokio::task::spawn_blocking(move || {
        waiter.recv(ProcessName::ANY, vec![vec![0; 8]], 4, RecvFlags::empty())
    })
    .await
    .expect("join")
    .expect("recv");
    assert_eq!(got.size, 4);
    assert_eq!(got.buffers.to_vec(), b"late");
    a.shutdown();
    b.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_truncated_receive_reports_full_size() {
    init_tracing();
    let net = MemoryNetwork::new();
    let a = endpoint(&net, 0).await;
    let b = endpoint(&net, 1).await;
    introduce(&[&a, &b]);

    a.send_async(b.local_name(), vec![Bytes::from(pattern(100))], 5, |_| {})
        .expect("send");
    a.send_async(b.local_name(), vec![Bytes::from(pattern(100))], 5, |_| {})
        .expect("send");
    wait_until(|| b.stats().matching.unexpected == 2).await;

    let (on_recv, mut received) = sink();
    b.recv_async(a.local_name(), vec![vec![0; 10]], 5, RecvFlags::TRUNCATE, on_recv)
        .expect("post");
    let got = next(&mut received).await;
    assert_eq!(got.status, Ok(100));
    assert_eq!(got.buffers.to_vec(), pattern(10));

    let (plain, mut received) = sink();
    b.recv_async(a.local_name(), vec![vec![0; 10]], 5, RecvFlags::empty(), plain)
        .expect("post");
    assert_eq!(next(&mut received).await.status, Ok(10));
    a.shutdown();
    b.shutdown();
}

#[test]
fn test_blocking_api_on_progress_threads() {
    init_tracing();
    let net = Arc::new(MemoryNetwork::new());
    let (a, a_thread) =
        Oob::start_with_progress_thread(support::config(0), net.clone()).expect("start a");
    let (b, b_thread) =
        Oob::start_with_progress_thread(support::config(1), net).expect("start b");
    introduce(&[&a, &b]);

    let receiver = b.clone();
    let handle = std::thread::spawn(move || {
        receiver.recv(name(0), vec![vec![0; 4], vec![0; 4]], 11, RecvFlags::empty())
    });

    let sent = a
        .send(
            b.local_name(),
            vec![Bytes::from_static(b"abcd"), Bytes::from_static(b"efg")],
            11,
            SendFlags::empty(),
        )
        .expect("send");
    assert_eq!(sent, 7);

    let got = handle.join().expect("join").expect("recv");
    assert_eq!(got.size, 7);
    match got.buffers {
        Buffers::Copied(bufs) => assert_eq!(bufs, vec![b"abcd".to_vec(), b"efg".to_vec()]),
        other => panic!("unexpected buffers {other:?}"),
    }

    a.ping(b.local_name(), Instant::now() + Duration::from_secs(5))
        .expect("ping");
    a.shutdown();
    b.shutdown();
    a_thread.join();
    b_thread.join();
}

#[test]
fn test_blocking_send_from_inside_callback() {
    init_tracing();
    let net = Arc::new(MemoryNetwork::new());
    let (a, a_thread) =
        Oob::start_with_progress_thread(support::config(0), net.clone()).expect("start a");
    let (b, b_thread) =
        Oob::start_with_progress_thread(support::config(1), net).expect("start b");
    introduce(&[&a, &b]);

    // Leave a message waiting so the receive below matches on this thread.
    a.send(a.local_name(), vec![Bytes::from_static(b"go")], 12, SendFlags::empty())
        .expect("send to self");

    let (tx, rx) = std::sync::mpsc::channel();
    let sender = a.clone();
    let target = b.local_name();
    a.recv_async(a.local_name(), vec![vec![0; 2]], 12, RecvFlags::empty(), move |_| {
        let result = sender.send_until(
            target,
            vec![Bytes::from_static(b"hi")],
            13,
            SendFlags::empty(),
            Instant::now() + Duration::from_secs(3),
        );
        let _ = tx.send(result);
    })
    .expect("post");

    assert_eq!(rx.recv_timeout(WAIT).expect("callback result"), Ok(2));
    let got = b
        .recv_until(
            a.local_name(),
            vec![vec![0; 4]],
            13,
            RecvFlags::empty(),
            Instant::now() + WAIT,
        )
        .expect("recv");
    assert_eq!(got.buffers.to_vec(), b"hi");
    a.shutdown();
    b.shutdown();
    a_thread.join();
    b_thread.join();
}
