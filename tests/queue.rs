//! Bounded FIFO (`Queue`), multi-subscriber broadcast (`Hub`), and the
//! simpler rendezvous `Channel`, covering S4 and the closed-state
//! invariants.

use std::time::Duration;

use effect_rail::channel::Channel;
use effect_rail::error::RuntimeError;
use effect_rail::hub::Hub;
use effect_rail::queue::Queue;

// S4: bounded Queue(cap=1); producer sends 3, consumer receives 3; the
// third send blocks until the first receive completes; after close, the
// consumer drains remaining items then sees a closed error.
#[tokio::test]
async fn s4_bounded_queue_backpressure_and_drain_then_closed() {
    let q: Queue<i32> = Queue::new(1);
    let producer_q = q.clone();
    let producer = tokio::spawn(async move {
        for i in 0..3 {
            producer_q.send(i).await.unwrap();
        }
        producer_q.close();
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    // With capacity 1, the producer can have at most one buffered item
    // waiting beyond the one send that's gone through already.
    assert!(q.size() <= 1);

    let mut received = Vec::new();
    loop {
        match q.receive().await {
            Ok(v) => received.push(v),
            Err(RuntimeError::ReceiveOnClosed) => break,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    producer.await.unwrap();
    assert_eq!(received, vec![0, 1, 2]);
}

#[tokio::test]
async fn send_after_close_fails_receive_drains_first() {
    let q: Queue<i32> = Queue::new(0);
    q.send(1).await.unwrap();
    q.close();
    assert!(matches!(q.send(2).await, Err(RuntimeError::SendOnClosed)));
    assert_eq!(q.receive().await.unwrap(), 1);
    assert!(matches!(q.receive().await, Err(RuntimeError::ReceiveOnClosed)));
}

#[tokio::test]
async fn fifo_order_is_preserved_per_producer() {
    let q: Queue<i32> = Queue::new(0);
    for i in 0..10 {
        q.send(i).await.unwrap();
    }
    q.close();
    let mut got = Vec::new();
    while let Ok(v) = q.receive().await {
        got.push(v);
    }
    assert_eq!(got, (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn hub_publish_reaches_every_live_subscriber() {
    let hub: Hub<i32> = Hub::new();
    let s1 = hub.subscribe(0).unwrap();
    let s2 = hub.subscribe(0).unwrap();
    hub.publish(99).await.unwrap();
    assert_eq!(s1.receive().await.unwrap(), 99);
    assert_eq!(s2.receive().await.unwrap(), 99);
}

#[tokio::test]
async fn hub_unsubscribe_only_closes_that_subscription() {
    let hub: Hub<i32> = Hub::new();
    let s1 = hub.subscribe(0).unwrap();
    let s2 = hub.subscribe(0).unwrap();
    s1.close();
    hub.publish(1).await.unwrap();
    assert_eq!(s2.receive().await.unwrap(), 1);
    assert!(s1.receive().await.is_err());
}

#[tokio::test]
async fn hub_close_closes_every_subscriber_and_refuses_new_ones() {
    let hub: Hub<i32> = Hub::new();
    let s1 = hub.subscribe(0).unwrap();
    hub.close();
    assert!(s1.receive().await.is_err());
    assert!(hub.subscribe(0).is_err());
}

#[tokio::test]
async fn channel_send_after_close_fails() {
    let c: Channel<i32> = Channel::unbounded();
    c.send(1).await.unwrap();
    c.close();
    assert!(c.send(2).await.is_err());
    assert_eq!(c.receive().await.unwrap(), 1);
}
