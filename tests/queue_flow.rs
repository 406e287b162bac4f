use std::sync::Arc;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use meshlink::meshtastic::{FlowControlledQueue, MeshError, MessageQueue};

#[tokio::test]
async fn producer_blocks_until_consumer_drains() {
    let q = Arc::new(MessageQueue::new(4));
    let token = CancellationToken::new();

    let producer = {
        let q = q.clone();
        let token = token.clone();
        tokio::spawn(async move {
            for i in 0..20u32 {
                loop {
                    match q.enqueue(i) {
                        Ok(()) => break,
                        Err(MeshError::QueueFull) => q.wait_for_space(&token).await.unwrap(),
                        Err(e) => panic!("enqueue failed: {e}"),
                    }
                }
            }
            q.close();
        })
    };

    let mut got = Vec::new();
    loop {
        match q.dequeue() {
            Ok(v) => got.push(v),
            Err(MeshError::QueueEmpty) => match q.wait_for_item(&token).await {
                Ok(()) => {}
                Err(MeshError::QueueClosed) if q.is_empty() => break,
                Err(MeshError::QueueClosed) => {}
                Err(e) => panic!("wait failed: {e}"),
            },
            Err(e) => panic!("dequeue failed: {e}"),
        }
        assert!(q.size() <= q.capacity());
    }
    tokio::time::timeout(Duration::from_secs(1), producer)
        .await
        .expect("producer stuck")
        .unwrap();
    assert_eq!(got, (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn priority_items_jump_regular_backlog() {
    let q = MessageQueue::new(8);
    for i in 0..3 {
        q.enqueue(format!("r{i}")).unwrap();
    }
    assert_ok!(q.enqueue_priority("p0".to_string()));
    assert_ok!(q.enqueue_priority("p1".to_string()));
    let stats = q.stats();
    assert_eq!((stats.regular, stats.priority), (3, 2));

    let order: Vec<String> = std::iter::from_fn(|| q.dequeue().ok()).collect();
    assert_eq!(order, vec!["p0", "p1", "r0", "r1", "r2"]);
    assert_err!(q.dequeue());
    q.clear();
    assert!(q.is_empty());
    assert!(q.has_space());
}

#[tokio::test]
async fn send_window_opens_on_ack() {
    let q = Arc::new(FlowControlledQueue::<u32>::new(16, 1, Duration::from_secs(30)));
    q.enqueue(1).unwrap();
    let id = q.dequeue().unwrap();
    q.message_sent(id);
    assert!(!q.can_send());

    let token = CancellationToken::new();
    let waiter = {
        let q = q.clone();
        let token = token.clone();
        tokio::spawn(async move { q.wait_for_send_window(&token).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!waiter.is_finished());
    assert!(q.message_acked(id));
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("window never opened")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn send_window_wait_respects_cancel_and_close() {
    let q = FlowControlledQueue::<u32>::new(4, 1, Duration::from_secs(30));
    q.message_sent(5);
    let token = CancellationToken::new();
    token.cancel();
    assert!(matches!(
        q.wait_for_send_window(&token).await,
        Err(MeshError::Cancelled)
    ));
    q.close();
    assert!(matches!(
        q.wait_for_send_window(&CancellationToken::new()).await,
        Err(MeshError::QueueClosed)
    ));
}

#[tokio::test]
async fn stale_acks_expire_while_waiting() {
    let q = FlowControlledQueue::<u32>::new(4, 1, Duration::from_millis(50));
    q.message_sent(9);
    tokio::time::timeout(
        Duration::from_secs(1),
        q.wait_for_send_window(&CancellationToken::new()),
    )
    .await
    .expect("expiry sweep never ran")
    .unwrap();
    assert_eq!(q.flow_stats().pending_acks, 0);
}
