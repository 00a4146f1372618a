//! Pending request queue
//!
//! Requests travel from callers to the worker over a channel; the worker keeps
//! them in a local heap ordered by priority, then enqueue time, then id.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::DiagError;

/// Monotonic request identifier
pub type RequestId = u64;

/// Request priorities (lower runs first)
pub mod priority {
    /// Session control and security access
    pub const SESSION: u8 = 0;
    /// Data identifiers, DTCs, ECU reset, raw requests
    pub const ROUTINE: u8 = 1;
    /// Tester present
    pub const KEEPALIVE: u8 = 2;
}

pub type SuccessFn = Box<dyn FnOnce(Vec<u8>) -> Result<(), DiagError> + Send>;
pub type FailureFn = Box<dyn FnOnce(&DiagError) + Send>;

/// A service call with its callbacks, as submitted to the orchestrator
pub struct Request {
    pub(crate) service: &'static str,
    pub(crate) payload: Vec<u8>,
    pub(crate) priority: u8,
    pub(crate) timeout: Option<Duration>,
    pub(crate) expect_response: bool,
    pub(crate) keepalive: bool,
    pub(crate) on_success: Option<SuccessFn>,
    pub(crate) on_failure: Option<FailureFn>,
}

impl Request {
    /// Request with routine priority that waits for a response
    pub fn new(service: &'static str, payload: Vec<u8>) -> Self {
        Self {
            service,
            payload,
            priority: priority::ROUTINE,
            timeout: None,
            expect_response: true,
            keepalive: false,
            on_success: None,
            on_failure: None,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Overall timeout, otherwise the active profile's request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Send without waiting for a response
    pub fn no_response(mut self) -> Self {
        self.expect_response = false;
        self
    }

    pub(crate) fn keepalive(mut self) -> Self {
        self.keepalive = true;
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: FnOnce(Vec<u8>) -> Result<(), DiagError> + Send + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_failure<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&DiagError) + Send + 'static,
    {
        self.on_failure = Some(Box::new(f));
        self
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("service", &self.service)
            .field("payload", &hex::encode(&self.payload))
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("expect_response", &self.expect_response)
            .finish_non_exhaustive()
    }
}

/// A request that has been assigned an id
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    pub id: RequestId,
    pub enqueued_at: Instant,
    pub request: Request,
}

impl QueuedRequest {
    fn key(&self) -> (u8, Instant, RequestId) {
        (self.request.priority, self.enqueued_at, self.id)
    }

    /// Whether it waited longer than `timeout` in the queue
    pub fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.enqueued_at) > timeout
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // Reversed: BinaryHeap is a max-heap and the smallest key runs first
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Worker-local priority queue
#[derive(Debug, Default)]
pub(crate) struct RequestQueue {
    heap: BinaryHeap<QueuedRequest>,
}

impl RequestQueue {
    pub fn push(&mut self, item: QueuedRequest) {
        self.heap.push(item);
    }

    pub fn pop(&mut self) -> Option<QueuedRequest> {
        self.heap.pop()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queued(id: RequestId, priority: u8, enqueued_at: Instant) -> QueuedRequest {
        QueuedRequest {
            id,
            enqueued_at,
            request: Request::new("Raw", vec![0x3E, 0x00]).priority(priority),
        }
    }

    #[test]
    fn test_priority_then_fifo() {
        let t0 = Instant::now();
        let mut queue = RequestQueue::default();
        queue.push(queued(1, priority::KEEPALIVE, t0));
        queue.push(queued(2, priority::ROUTINE, t0 + Duration::from_millis(1)));
        queue.push(queued(3, priority::SESSION, t0 + Duration::from_millis(2)));
        queue.push(queued(4, priority::ROUTINE, t0 + Duration::from_millis(3)));
        queue.push(queued(5, priority::SESSION, t0 + Duration::from_millis(4)));
        assert_eq!(queue.len(), 5);

        let order: Vec<RequestId> = std::iter::from_fn(|| queue.pop()).map(|q| q.id).collect();
        assert_eq!(order, vec![3, 5, 2, 4, 1]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_same_instant_falls_back_to_id() {
        let t0 = Instant::now();
        let mut queue = RequestQueue::default();
        queue.push(queued(9, priority::ROUTINE, t0));
        queue.push(queued(7, priority::ROUTINE, t0));
        queue.push(queued(8, priority::ROUTINE, t0));
        let order: Vec<RequestId> = std::iter::from_fn(|| queue.pop()).map(|q| q.id).collect();
        assert_eq!(order, vec![7, 8, 9]);
    }

    #[test]
    fn test_staleness() {
        let t0 = Instant::now();
        let item = queued(1, priority::ROUTINE, t0);
        assert!(!item.is_stale(Duration::from_secs(1), t0 + Duration::from_millis(500)));
        assert!(item.is_stale(Duration::from_secs(1), t0 + Duration::from_millis(1500)));
    }
}
