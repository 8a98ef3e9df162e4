// SPDX-License-Identifier: MIT
//! Bounded FIFO outbound call queue.
//!
//! Each connection gets one `CallQueue` bounding how many outbound CALLs may
//! be in flight at once. Calls beyond the bound queue in FIFO order rather
//! than being rejected outright — a charging station issuing a burst of
//! StatusNotification calls should see them drain in order, not bounce.

use tokio::sync::{mpsc, oneshot, Semaphore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::errors::RpcError;

/// Fallback buffered-byte ceiling for mailboxes built with [`OutboundMailbox::new`]
/// rather than [`OutboundMailbox::new_with_threshold`]. Matches the
/// configuration default.
const DEFAULT_BACKPRESSURE_THRESHOLD_BYTES: usize = 512 * 1024;

/// A permit that must be held for the lifetime of one in-flight call.
///
/// Dropping it returns the slot to the queue, letting the next queued call
/// proceed.
pub struct CallSlot {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Bounded concurrency gate for outbound calls on one connection.
///
/// Not a literal queue of messages — callers that can't acquire a slot
/// immediately `.await` on `acquire()`, which parks them in FIFO order via
/// the underlying semaphore's wait list.
pub struct CallQueue {
    semaphore: Arc<Semaphore>,
    capacity: AtomicUsize,
}

impl CallQueue {
    pub fn new(max_in_flight: usize) -> Self {
        let capacity = max_in_flight.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
        }
    }

    /// Wait for a slot to become free, then hold it until the returned guard
    /// is dropped.
    pub async fn acquire(&self) -> CallSlot {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("call queue semaphore never closed");
        CallSlot { _permit: permit }
    }

    /// Try to take a slot without waiting; returns `None` if all slots are
    /// currently held.
    pub fn try_acquire(&self) -> Option<CallSlot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| CallSlot { _permit: permit })
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Widen capacity to at least `n` slots, returning the number of
    /// permits actually added so the caller can hand that count back to
    /// [`CallQueue::restore`] afterward. A no-op (returns 0) if already at
    /// or above `n`.
    pub fn raise_to(&self, n: usize) -> usize {
        let current = self.capacity.load(Ordering::Relaxed);
        if n <= current {
            return 0;
        }
        let extra = n - current;
        self.semaphore.add_permits(extra);
        self.capacity.store(n, Ordering::Relaxed);
        extra
    }

    /// Undo a prior [`CallQueue::raise_to`] by forgetting `added` permits.
    /// Forgetting blocks on no in-flight acquisition — permits simply
    /// vanish from the pool once released, so capacity may briefly stay
    /// above its restored value until outstanding slots drain.
    pub fn restore(&self, added: usize) {
        if added == 0 {
            return;
        }
        self.semaphore.forget_permits(added);
        self.capacity.fetch_sub(added, Ordering::Relaxed);
    }
}

/// A bounded mailbox for frames queued to be written to one connection's
/// socket, independent of the in-flight call gate above. Used by the
/// cluster router and endpoint to hand a connection task outbound frames
/// without blocking the sender.
#[derive(Clone)]
pub struct OutboundMailbox {
    tx: mpsc::Sender<String>,
    /// Approximate count of bytes queued but not yet written to the socket.
    /// Incremented on send, decremented by the writer task via
    /// [`OutboundMailbox::note_sent`] once a frame actually goes out.
    buffered_bytes: Arc<AtomicUsize>,
    backpressure_threshold: usize,
}

impl OutboundMailbox {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        Self::new_with_threshold(capacity, DEFAULT_BACKPRESSURE_THRESHOLD_BYTES)
    }

    pub fn new_with_threshold(capacity: usize, backpressure_threshold: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                buffered_bytes: Arc::new(AtomicUsize::new(0)),
                backpressure_threshold,
            },
            rx,
        )
    }

    /// Enqueue a frame, failing with `RpcError::QueueFull` if the mailbox is
    /// saturated rather than blocking indefinitely.
    pub fn try_send(&self, frame: String) -> Result<(), RpcError> {
        let len = frame.len();
        self.tx
            .try_send(frame)
            .map(|()| self.account_send(len))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RpcError::QueueFull(self.tx.capacity()),
                mpsc::error::TrySendError::Closed(_) => RpcError::Disconnected,
            })
    }

    pub async fn send(&self, frame: String) -> Result<(), RpcError> {
        let len = frame.len();
        self.tx
            .send(frame)
            .await
            .map(|()| self.account_send(len))
            .map_err(|_| RpcError::Disconnected)
    }

    fn account_send(&self, len: usize) {
        let buffered = self.buffered_bytes.fetch_add(len, Ordering::Relaxed) + len;
        if buffered > self.backpressure_threshold {
            warn!(
                buffered_bytes = buffered,
                threshold = self.backpressure_threshold,
                "backpressure: mailbox buffered bytes exceeds threshold"
            );
        }
    }

    /// Called by the writer task once `len` bytes have actually been flushed
    /// to the socket, so `buffered_bytes` reflects what's still queued rather
    /// than everything ever sent.
    pub fn note_sent(&self, len: usize) {
        self.buffered_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some(cur.saturating_sub(len)))
            .ok();
    }

    /// Current approximate count of buffered, not-yet-written bytes.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Relaxed)
    }
}

/// One call submitted while the connection was not `OPEN`, held until
/// reconnect flushes it through the normal send path.
pub struct OfflineCall {
    pub action: String,
    pub payload: serde_json::Value,
    pub idempotency_key: Option<String>,
    pub responder: oneshot::Sender<Result<serde_json::Value, RpcError>>,
}

/// FIFO holding area for calls submitted while a client connection is
/// reconnecting. Bounded at `capacity`; pushing past capacity drops the
/// oldest entry (its responder is dropped, so the original caller sees a
/// `Disconnected` error rather than hanging forever).
pub struct OfflineQueue {
    entries: VecDeque<OfflineCall>,
    capacity: usize,
}

impl OfflineQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    /// Enqueue a call, dropping the oldest entry first if already at
    /// capacity. Returns `false` (and drops `call` immediately) if
    /// `capacity` is zero — offline queueing is disabled.
    pub fn push(&mut self, call: OfflineCall) -> bool {
        if self.capacity == 0 {
            return false;
        }
        if self.entries.len() >= self.capacity {
            if let Some(dropped) = self.entries.pop_front() {
                warn!(action = dropped.action, "offline queue at capacity — dropping oldest call");
            }
        }
        self.entries.push_back(call);
        true
    }

    /// Drain every queued call in FIFO order for the caller to resend.
    pub fn drain(&mut self) -> Vec<OfflineCall> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_blocks_until_a_slot_frees() {
        let queue = CallQueue::new(1);
        let first = queue.acquire().await;
        assert!(queue.try_acquire().is_none());
        drop(first);
        assert!(queue.try_acquire().is_some());
    }

    #[tokio::test]
    async fn zero_is_clamped_to_one_slot() {
        let queue = CallQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[tokio::test]
    async fn raise_to_widens_and_restore_undoes_it() {
        let queue = CallQueue::new(1);
        let first = queue.acquire().await;
        assert!(queue.try_acquire().is_none());

        let added = queue.raise_to(3);
        assert_eq!(added, 2);
        assert_eq!(queue.capacity(), 3);
        let second = queue.acquire().await;
        let third = queue.acquire().await;
        assert!(queue.try_acquire().is_none());

        drop((first, second, third));
        queue.restore(added);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.try_acquire().is_some());
    }

    #[tokio::test]
    async fn raise_to_below_current_capacity_is_a_no_op() {
        let queue = CallQueue::new(4);
        assert_eq!(queue.raise_to(2), 0);
        assert_eq!(queue.capacity(), 4);
    }

    #[tokio::test]
    async fn mailbox_rejects_when_full() {
        let (mailbox, mut rx) = OutboundMailbox::new(1);
        mailbox.try_send("a".to_string()).unwrap();
        let err = mailbox.try_send("b".to_string()).unwrap_err();
        assert!(matches!(err, RpcError::QueueFull(_)));
        let received = rx.recv().await.unwrap();
        assert_eq!(received, "a");
    }

    #[tokio::test]
    async fn mailbox_send_fails_after_receiver_dropped() {
        let (mailbox, rx) = OutboundMailbox::new(1);
        drop(rx);
        let err = mailbox.send("x".to_string()).await.unwrap_err();
        assert!(matches!(err, RpcError::Disconnected));
    }

    #[tokio::test]
    async fn buffered_bytes_tracks_queued_and_flushed_frames() {
        let (mailbox, _rx) = OutboundMailbox::new(4);
        mailbox.send("hello".to_string()).await.unwrap();
        assert_eq!(mailbox.buffered_bytes(), 5);
        mailbox.send("!!".to_string()).await.unwrap();
        assert_eq!(mailbox.buffered_bytes(), 7);
        mailbox.note_sent(5);
        assert_eq!(mailbox.buffered_bytes(), 2);
    }

    fn offline_call(action: &str) -> (OfflineCall, oneshot::Receiver<Result<serde_json::Value, RpcError>>) {
        let (tx, rx) = oneshot::channel();
        (
            OfflineCall {
                action: action.to_string(),
                payload: serde_json::json!({}),
                idempotency_key: None,
                responder: tx,
            },
            rx,
        )
    }

    #[test]
    fn offline_queue_drops_oldest_past_capacity() {
        let mut queue = OfflineQueue::new(2);
        let (a, _rx_a) = offline_call("A");
        let (b, _rx_b) = offline_call("B");
        let (c, rx_c) = offline_call("C");
        assert!(queue.push(a));
        assert!(queue.push(b));
        assert!(queue.push(c));
        assert_eq!(queue.len(), 2);
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].action, "B");
        assert_eq!(drained[1].action, "C");
        drop(rx_c);
    }

    #[test]
    fn zero_capacity_disables_offline_queueing() {
        let mut queue = OfflineQueue::new(0);
        let (a, _rx) = offline_call("A");
        assert!(!queue.push(a));
        assert!(queue.is_empty());
    }
}
