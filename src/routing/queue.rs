// Priority work queue
//
// A bounded binary heap ordered by (priority descending, arrival sequence
// ascending) under one mutex and condition variable; a pool of worker
// threads drains it through the registered processor. Shutdown abandons
// pending items: every callback fires with an internal error, nothing is
// processed after the stop flag is set.

use crate::error::GatewayError;
use crate::routing::rpc::{ErrorCode, RouteRequest, RouteResponse};
use parking_lot::{Condvar, Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Callback invoked exactly once with the routing outcome.
pub type ResponseCallback = Box<dyn FnOnce(RouteResponse) + Send>;

/// Hook the workers run for each dequeued request.
pub type Processor = Arc<dyn Fn(&RouteRequest) -> RouteResponse + Send + Sync>;

/// One queued routing request.
pub struct QueueItem {
    pub request: RouteRequest,
    pub callback: ResponseCallback,
    pub priority: i32,
    pub enqueued_at: SystemTime,
    sequence: u64,
}

impl QueueItem {
    pub fn new(request: RouteRequest, callback: ResponseCallback, priority: i32) -> Self {
        Self {
            request,
            callback,
            priority,
            enqueued_at: SystemTime::now(),
            sequence: 0,
        }
    }
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueueItem {}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier arrival.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Item handed back when the queue cannot accept it.
pub struct RejectedItem {
    pub item: QueueItem,
    pub reason: GatewayError,
}

struct QueueInner {
    heap: BinaryHeap<QueueItem>,
    next_sequence: u64,
    stopped: bool,
}

/// Bounded priority queue with a worker-thread pool.
pub struct WorkQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    max_size: usize,
    processor: RwLock<Option<Processor>>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl WorkQueue {
    pub fn new(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_sequence: 0,
                stopped: false,
            }),
            available: Condvar::new(),
            max_size,
            processor: RwLock::new(None),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Install the routing hook the workers invoke.
    pub fn set_processor(&self, processor: Processor) {
        *self.processor.write() = Some(processor);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Enqueue an item. Fails fast when the queue is stopped or full; the
    /// rejected item comes back so the caller can fire its callback.
    pub fn enqueue(&self, mut item: QueueItem) -> Result<(), RejectedItem> {
        let mut inner = self.inner.lock();
        if inner.stopped {
            return Err(RejectedItem {
                item,
                reason: GatewayError::Shutdown,
            });
        }
        if inner.heap.len() >= self.max_size {
            return Err(RejectedItem {
                item,
                reason: GatewayError::Capacity(format!("work queue at capacity {}", self.max_size)),
            });
        }
        item.sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(item);
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Block until an item is available or the queue stops.
    fn dequeue(&self) -> Option<QueueItem> {
        let mut inner = self.inner.lock();
        loop {
            if inner.stopped {
                return None;
            }
            if let Some(item) = inner.heap.pop() {
                return Some(item);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Spawn the worker pool.
    pub fn start(self: &Arc<Self>, worker_count: usize) {
        let mut workers = self.workers.lock();
        info!(worker_count, "starting work queue");
        for index in 0..worker_count {
            let queue = Arc::clone(self);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("route-worker-{}", index))
                    .spawn(move || queue.worker_loop())
                    .expect("spawn worker thread"),
            );
        }
    }

    fn worker_loop(&self) {
        while let Some(item) = self.dequeue() {
            let processor = self.processor.read().clone();
            let response = match processor {
                Some(processor) => processor(&item.request),
                None => {
                    warn!("no processor installed, rejecting request");
                    RouteResponse::error(
                        item.request.message_id.clone(),
                        ErrorCode::InternalError,
                        "no processor installed",
                    )
                }
            };
            (item.callback)(response);
        }
        debug!("worker exiting");
    }

    /// Stop the queue: wake the workers, join them, and fail every pending
    /// item with a shutdown error. Nothing pending is processed.
    pub fn stop(&self) {
        let abandoned: Vec<QueueItem> = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                Vec::new()
            } else {
                inner.stopped = true;
                inner.heap.drain().collect()
            }
        };
        self.available.notify_all();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }

        info!(abandoned = abandoned.len(), "work queue stopped");
        for item in abandoned {
            (item.callback)(RouteResponse::error(
                item.request.message_id.clone(),
                ErrorCode::InternalError,
                "routing service shutting down",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn request(id: &str) -> RouteRequest {
        RouteRequest::new(id, "chat")
    }

    fn noop_callback() -> ResponseCallback {
        Box::new(|_| {})
    }

    #[test]
    fn test_dequeue_order_priority_then_fifo() {
        let queue = WorkQueue::new(100);
        queue
            .enqueue(QueueItem::new(request("low-1"), noop_callback(), 1))
            .unwrap_or_else(|_| panic!("enqueue"));
        queue
            .enqueue(QueueItem::new(request("high-1"), noop_callback(), 5))
            .unwrap_or_else(|_| panic!("enqueue"));
        queue
            .enqueue(QueueItem::new(request("low-2"), noop_callback(), 1))
            .unwrap_or_else(|_| panic!("enqueue"));
        queue
            .enqueue(QueueItem::new(request("high-2"), noop_callback(), 5))
            .unwrap_or_else(|_| panic!("enqueue"));

        let order: Vec<String> = std::iter::from_fn(|| {
            let mut inner = queue.inner.lock();
            inner.heap.pop().map(|i| i.request.message_id.clone())
        })
        .collect();
        assert_eq!(order, ["high-1", "high-2", "low-1", "low-2"]);
    }

    #[test]
    fn test_capacity_rejection_returns_item() {
        let queue = WorkQueue::new(1);
        queue
            .enqueue(QueueItem::new(request("a"), noop_callback(), 0))
            .unwrap_or_else(|_| panic!("enqueue"));
        let rejected = queue
            .enqueue(QueueItem::new(request("b"), noop_callback(), 0))
            .err()
            .expect("second enqueue must fail");
        assert!(matches!(rejected.reason, GatewayError::Capacity(_)));
        assert_eq!(rejected.item.request.message_id, "b");
    }

    #[test]
    fn test_workers_drain_in_priority_order() {
        let queue = WorkQueue::new(100);
        let processed = Arc::new(PlMutex::new(Vec::new()));
        let processed_in_hook = Arc::clone(&processed);
        queue.set_processor(Arc::new(move |request| {
            processed_in_hook.lock().push(request.message_id.clone());
            RouteResponse::success(request.message_id.clone())
        }));

        // Enqueue before starting the single worker so ordering is exact.
        for (id, priority) in [("c", 0), ("a", 9), ("b", 5)] {
            queue
                .enqueue(QueueItem::new(request(id), noop_callback(), priority))
                .unwrap_or_else(|_| panic!("enqueue"));
        }
        queue.start(1);

        while queue.len() > 0 {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        queue.stop();
        assert_eq!(processed.lock().as_slice(), ["a", "b", "c"]);
    }

    #[test]
    fn test_callbacks_receive_processor_response() {
        let queue = WorkQueue::new(10);
        queue.set_processor(Arc::new(|request| {
            RouteResponse::success(request.message_id.clone())
        }));
        queue.start(2);

        let (tx, rx) = std::sync::mpsc::channel();
        queue
            .enqueue(QueueItem::new(
                request("m1"),
                Box::new(move |response| {
                    let _ = tx.send(response);
                }),
                0,
            ))
            .unwrap_or_else(|_| panic!("enqueue"));

        let response = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
        assert!(response.accepted);
        assert_eq!(response.message_id, "m1");
        queue.stop();
    }

    #[test]
    fn test_stop_abandons_pending_with_shutdown_error() {
        let queue = WorkQueue::new(10);
        // No workers: items stay pending.
        let (tx, rx) = std::sync::mpsc::channel();
        for id in ["x", "y"] {
            let tx = tx.clone();
            queue
                .enqueue(QueueItem::new(
                    request(id),
                    Box::new(move |response| {
                        let _ = tx.send(response);
                    }),
                    0,
                ))
                .unwrap_or_else(|_| panic!("enqueue"));
        }

        queue.stop();
        for _ in 0..2 {
            let response = rx.recv_timeout(std::time::Duration::from_secs(1)).unwrap();
            assert!(!response.accepted);
            assert_eq!(response.error_code, ErrorCode::InternalError);
        }

        // Enqueue after stop fails with shutdown.
        let rejected = queue
            .enqueue(QueueItem::new(request("z"), noop_callback(), 0))
            .err()
            .expect("enqueue after stop must fail");
        assert!(matches!(rejected.reason, GatewayError::Shutdown));
    }
}
