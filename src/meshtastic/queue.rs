//! Bounded outbound queue with a priority lane, plus an ack-window wrapper.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{MeshError, Result};
use super::lock;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    pub regular: usize,
    pub priority: usize,
    pub closed: bool,
}

struct Lanes<T> {
    regular: VecDeque<T>,
    priority: VecDeque<T>,
    closed: bool,
    // Dropped on close so every waiter wakes up.
    space_tx: Option<mpsc::Sender<()>>,
    item_tx: Option<mpsc::Sender<()>>,
}

impl<T> Lanes<T> {
    fn len(&self) -> usize {
        self.regular.len() + self.priority.len()
    }
}

/// Bounded FIFO with a priority lane. Capacity covers both lanes together.
pub struct MessageQueue<T> {
    capacity: usize,
    lanes: Mutex<Lanes<T>>,
    space_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    item_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
}

impl<T> MessageQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (space_tx, space_rx) = mpsc::channel(1);
        let (item_tx, item_rx) = mpsc::channel(1);
        Self {
            capacity: capacity.max(1),
            lanes: Mutex::new(Lanes {
                regular: VecDeque::new(),
                priority: VecDeque::new(),
                closed: false,
                space_tx: Some(space_tx),
                item_tx: Some(item_tx),
            }),
            space_rx: tokio::sync::Mutex::new(space_rx),
            item_rx: tokio::sync::Mutex::new(item_rx),
        }
    }

    pub fn enqueue(&self, item: T) -> Result<()> {
        self.push(item, false)
    }

    pub fn enqueue_priority(&self, item: T) -> Result<()> {
        self.push(item, true)
    }

    fn push(&self, item: T, priority: bool) -> Result<()> {
        let mut lanes = lock(&self.lanes);
        if lanes.closed {
            return Err(MeshError::QueueClosed);
        }
        if lanes.len() >= self.capacity {
            return Err(MeshError::QueueFull);
        }
        if priority {
            lanes.priority.push_back(item);
        } else {
            lanes.regular.push_back(item);
        }
        if let Some(tx) = &lanes.item_tx {
            let _ = tx.try_send(());
        }
        Ok(())
    }

    /// Remove the next item, priority lane first.
    pub fn dequeue(&self) -> Result<T> {
        let mut lanes = lock(&self.lanes);
        let item = match lanes.priority.pop_front() {
            Some(item) => item,
            None => lanes.regular.pop_front().ok_or(MeshError::QueueEmpty)?,
        };
        if let Some(tx) = &lanes.space_tx {
            let _ = tx.try_send(());
        }
        Ok(item)
    }

    /// Remove the next item only if `take` accepts it; `Ok(None)` leaves it queued.
    pub fn dequeue_if<F>(&self, take: F) -> Result<Option<T>>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut lanes = lock(&self.lanes);
        let lane = if lanes.priority.is_empty() {
            &mut lanes.regular
        } else {
            &mut lanes.priority
        };
        let Some(head) = lane.front() else {
            return Err(MeshError::QueueEmpty);
        };
        if !take(head) {
            return Ok(None);
        }
        let item = lane.pop_front();
        if let Some(tx) = &lanes.space_tx {
            let _ = tx.try_send(());
        }
        Ok(item)
    }

    pub fn size(&self) -> usize {
        lock(&self.lanes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn has_space(&self) -> bool {
        self.size() < self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every queued item, waking anyone waiting for space.
    pub fn clear(&self) {
        let mut lanes = lock(&self.lanes);
        lanes.regular.clear();
        lanes.priority.clear();
        if let Some(tx) = &lanes.space_tx {
            let _ = tx.try_send(());
        }
    }

    pub fn close(&self) {
        let mut lanes = lock(&self.lanes);
        lanes.closed = true;
        lanes.space_tx = None;
        lanes.item_tx = None;
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.lanes).closed
    }

    pub fn stats(&self) -> QueueStats {
        let lanes = lock(&self.lanes);
        QueueStats {
            size: lanes.len(),
            capacity: self.capacity,
            regular: lanes.regular.len(),
            priority: lanes.priority.len(),
            closed: lanes.closed,
        }
    }

    /// Wait until an enqueue would not fail with `QueueFull`.
    pub async fn wait_for_space(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.space_rx.lock().await;
        loop {
            {
                let lanes = lock(&self.lanes);
                if lanes.closed {
                    return Err(MeshError::QueueClosed);
                }
                if lanes.len() < self.capacity {
                    return Ok(());
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(MeshError::Cancelled),
                signal = rx.recv() => {
                    if signal.is_none() {
                        return Err(MeshError::QueueClosed);
                    }
                }
            }
        }
    }

    /// Wait until at least one item is queued.
    pub async fn wait_for_item(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.item_rx.lock().await;
        loop {
            {
                let lanes = lock(&self.lanes);
                if lanes.len() > 0 {
                    return Ok(());
                }
                if lanes.closed {
                    return Err(MeshError::QueueClosed);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(MeshError::Cancelled),
                signal = rx.recv() => {
                    if signal.is_none() {
                        return Err(MeshError::QueueClosed);
                    }
                }
            }
        }
    }
}

impl<T: Clone> MessageQueue<T> {
    pub fn peek(&self) -> Result<T> {
        let lanes = lock(&self.lanes);
        lanes
            .priority
            .front()
            .or_else(|| lanes.regular.front())
            .cloned()
            .ok_or(MeshError::QueueEmpty)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowControlStats {
    pub max_window: usize,
    pub current_window: usize,
    pub pending_acks: usize,
    pub ack_required: bool,
    pub ack_timeout: Duration,
}

struct Window {
    current: usize,
    ack_required: bool,
    pending: HashMap<u32, Instant>,
}

/// [`MessageQueue`] plus a send window of packets awaiting acknowledgement.
pub struct FlowControlledQueue<T> {
    queue: MessageQueue<T>,
    max_window: usize,
    ack_timeout: Duration,
    window: Mutex<Window>,
}

impl<T> FlowControlledQueue<T> {
    pub fn new(capacity: usize, max_window: usize, ack_timeout: Duration) -> Self {
        Self {
            queue: MessageQueue::new(capacity),
            max_window: max_window.max(1),
            ack_timeout,
            window: Mutex::new(Window {
                current: 0,
                ack_required: true,
                pending: HashMap::new(),
            }),
        }
    }

    pub fn queue(&self) -> &MessageQueue<T> {
        &self.queue
    }

    pub fn enqueue(&self, item: T) -> Result<()> {
        self.queue.enqueue(item)
    }

    pub fn enqueue_priority(&self, item: T) -> Result<()> {
        self.queue.enqueue_priority(item)
    }

    pub fn dequeue(&self) -> Result<T> {
        self.queue.dequeue()
    }

    pub fn close(&self) {
        self.queue.close();
    }

    /// Next item for the wire. Items flagged by `needs_window` wait while the window
    /// is full; everything else goes straight through.
    pub fn dequeue_ready<F>(&self, needs_window: F) -> Result<Option<T>>
    where
        F: FnOnce(&T) -> bool,
    {
        let open = self.can_send();
        self.queue.dequeue_if(|item| open || !needs_window(item))
    }

    pub fn can_send(&self) -> bool {
        let w = lock(&self.window);
        !w.ack_required || w.current < self.max_window
    }

    /// Wait until the window has room, sweeping expired acks while waiting.
    pub async fn wait_for_send_window(&self, cancel: &CancellationToken) -> Result<()> {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            if self.queue.is_closed() {
                return Err(MeshError::QueueClosed);
            }
            if self.can_send() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(MeshError::Cancelled),
                _ = tick.tick() => {
                    self.cleanup_expired_acks();
                }
            }
        }
    }

    /// Record a packet that expects an ack. No-op when acks are not required.
    pub fn message_sent(&self, id: u32) {
        let mut w = lock(&self.window);
        if !w.ack_required {
            return;
        }
        if w.pending.insert(id, Instant::now()).is_none() {
            w.current += 1;
        }
    }

    /// Release the window slot held by `id`. Unknown ids are ignored.
    pub fn message_acked(&self, id: u32) -> bool {
        let mut w = lock(&self.window);
        if w.pending.remove(&id).is_some() {
            w.current = w.current.saturating_sub(1);
            true
        } else {
            false
        }
    }

    /// Evict pending acks older than the ack timeout. Returns how many were dropped.
    pub fn cleanup_expired_acks(&self) -> usize {
        let mut w = lock(&self.window);
        let timeout = self.ack_timeout;
        let before = w.pending.len();
        w.pending.retain(|_, sent| sent.elapsed() < timeout);
        let expired = before - w.pending.len();
        if expired > 0 {
            w.current = w.current.saturating_sub(expired);
            debug!("Dropped {} unacknowledged packets from send window", expired);
        }
        expired
    }

    pub fn set_ack_required(&self, required: bool) {
        let mut w = lock(&self.window);
        w.ack_required = required;
        if !required {
            w.pending.clear();
            w.current = 0;
        }
    }

    pub fn flow_stats(&self) -> FlowControlStats {
        let w = lock(&self.window);
        FlowControlStats {
            max_window: self.max_window,
            current_window: w.current,
            pending_acks: w.pending.len(),
            ack_required: w.ack_required,
            ack_timeout: self.ack_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn priority_lane_first() {
        let q = MessageQueue::new(2);
        q.enqueue("A").unwrap();
        q.enqueue_priority("B").unwrap();
        assert!(matches!(q.enqueue("C"), Err(MeshError::QueueFull)));
        assert_eq!(q.peek().unwrap(), "B");
        assert_eq!(q.dequeue().unwrap(), "B");
        assert_eq!(q.dequeue().unwrap(), "A");
        assert!(matches!(q.dequeue(), Err(MeshError::QueueEmpty)));
    }

    #[test]
    fn closed_queue_rejects_and_drains() {
        let q = MessageQueue::new(4);
        q.enqueue(1).unwrap();
        q.close();
        assert!(matches!(q.enqueue(2), Err(MeshError::QueueClosed)));
        assert_eq!(q.dequeue().unwrap(), 1);
        let s = q.stats();
        assert!(s.closed);
        assert_eq!(s.size, 0);
    }

    #[tokio::test]
    async fn wait_for_space_wakes_on_dequeue() {
        let q = Arc::new(MessageQueue::new(1));
        q.enqueue(1u32).unwrap();
        let token = CancellationToken::new();
        let waiter = {
            let q = q.clone();
            let token = token.clone();
            tokio::spawn(async move { q.wait_for_space(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        q.dequeue().unwrap();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .expect("join");
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn wait_for_item_sees_close_and_cancel() {
        let q = Arc::new(MessageQueue::<u32>::new(1));
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            q.wait_for_item(&token).await,
            Err(MeshError::Cancelled)
        ));

        let live = CancellationToken::new();
        let waiter = {
            let q = q.clone();
            let live = live.clone();
            tokio::spawn(async move { q.wait_for_item(&live).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.close();
        let res = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter timed out")
            .expect("join");
        assert!(matches!(res, Err(MeshError::QueueClosed)));
    }

    #[test]
    fn window_tracks_acks() {
        let q: FlowControlledQueue<u32> =
            FlowControlledQueue::new(10, 2, Duration::from_secs(30));
        q.message_sent(1);
        assert!(q.can_send());
        q.message_sent(2);
        assert!(!q.can_send());
        assert!(!q.message_acked(99));
        assert!(q.message_acked(1));
        assert!(q.can_send());
        q.set_ack_required(false);
        let s = q.flow_stats();
        assert_eq!(s.current_window, 0);
        assert_eq!(s.pending_acks, 0);
        q.message_sent(3);
        assert_eq!(q.flow_stats().current_window, 0);
    }

    #[test]
    fn full_window_only_holds_acked_items() {
        // (id, wants ack)
        let q: FlowControlledQueue<(u32, bool)> =
            FlowControlledQueue::new(10, 1, Duration::from_secs(30));
        q.message_sent(1);
        q.enqueue((2, true)).unwrap();
        assert_eq!(q.dequeue_ready(|p| p.1).unwrap(), None);
        assert_eq!(q.queue().size(), 1);

        q.enqueue_priority((3, false)).unwrap();
        assert_eq!(q.dequeue_ready(|p| p.1).unwrap(), Some((3, false)));

        q.message_acked(1);
        assert_eq!(q.dequeue_ready(|p| p.1).unwrap(), Some((2, true)));
        assert!(matches!(q.dequeue_ready(|p| p.1), Err(MeshError::QueueEmpty)));
    }

    #[test]
    fn expired_acks_free_the_window() {
        let q: FlowControlledQueue<u32> =
            FlowControlledQueue::new(10, 1, Duration::from_millis(1));
        q.message_sent(7);
        assert!(!q.can_send());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(q.cleanup_expired_acks(), 1);
        assert!(q.can_send());
    }
}
