/*!
Cooperative priority gate over all AI-provider calls.

A single dispatcher task owns a priority heap of waiters. It releases at
most one waiter per `min_interval`; within a priority class, waiters are
released in enqueue order. User-initiated requests enter at `High`,
background auto-translate at `Normal`.
*/

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{Error, Result};

pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    High,
}

struct Waiter {
    priority: Priority,
    seq: u64,
    release: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then FIFO by insertion sequence.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Clone)]
pub struct AiRateLimiter {
    enqueue: mpsc::UnboundedSender<(Priority, oneshot::Sender<()>)>,
}

impl AiRateLimiter {
    /// Spawns the dispatcher task; it lives for the rest of the process.
    pub fn new(min_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(rx, min_interval));
        AiRateLimiter { enqueue: tx }
    }

    /// Wait for a release slot. Dropping the returned future unregisters
    /// the waiter; the dispatcher skips closed channels on pop.
    pub async fn acquire(&self, priority: Priority) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue
            .send((priority, tx))
            .map_err(|_| Error::RateLimited)?;
        rx.await.map_err(|_| Error::RateLimited)
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<(Priority, oneshot::Sender<()>)>,
    min_interval: Duration,
) {
    let mut heap: BinaryHeap<Waiter> = BinaryHeap::new();
    let mut seq: u64 = 0;
    let mut last_release: Option<Instant> = None;

    loop {
        if heap.is_empty() {
            match rx.recv().await {
                Some((priority, release)) => {
                    heap.push(Waiter {
                        priority,
                        seq,
                        release,
                    });
                    seq += 1;
                }
                None => break,
            }
        }

        // Merge anything that arrived since the last pop, so a High waiter
        // enqueued during the interval sleep is considered first.
        while let Ok((priority, release)) = rx.try_recv() {
            heap.push(Waiter {
                priority,
                seq,
                release,
            });
            seq += 1;
        }

        let Some(waiter) = heap.pop() else { continue };

        if waiter.release.is_closed() {
            // Cancelled while queued.
            continue;
        }

        if let Some(last) = last_release {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                // Not yet eligible: re-enqueue and sleep out the remainder.
                heap.push(waiter);
                tokio::time::sleep(min_interval - elapsed).await;
                continue;
            }
        }

        if waiter.release.send(()).is_ok() {
            last_release = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn heap_orders_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        let mk = |priority, seq| {
            let (tx, _rx) = oneshot::channel();
            // Receivers must stay alive or the waiter counts as cancelled;
            // leak them for the duration of this ordering check.
            std::mem::forget(_rx);
            Waiter {
                priority,
                seq,
                release: tx,
            }
        };
        heap.push(mk(Priority::Normal, 0));
        heap.push(mk(Priority::Normal, 1));
        heap.push(mk(Priority::High, 2));
        heap.push(mk(Priority::Normal, 3));
        heap.push(mk(Priority::High, 4));

        let order: Vec<(Priority, u64)> = std::iter::from_fn(|| heap.pop())
            .map(|w| (w.priority, w.seq))
            .collect();
        assert_eq!(
            order,
            vec![
                (Priority::High, 2),
                (Priority::High, 4),
                (Priority::Normal, 0),
                (Priority::Normal, 1),
                (Priority::Normal, 3),
            ]
        );
    }

    #[tokio::test]
    async fn high_priority_released_before_queued_normals() {
        let limiter = AiRateLimiter::new(Duration::from_millis(100));

        // First acquire passes immediately and starts the interval clock.
        limiter.acquire(Priority::Normal).await.unwrap();

        // Everything enqueued now lands in the heap before the next release.
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(Priority::Normal).await.unwrap();
                order.lock().unwrap().push(format!("normal-{}", i));
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        {
            let limiter = limiter.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(Priority::High).await.unwrap();
                order.lock().unwrap().push("high".to_string());
            }));
        }

        for h in handles {
            h.await.unwrap();
        }
        let order = order.lock().unwrap();
        assert_eq!(order[0], "high", "High waiter must be released first: {order:?}");
    }

    #[tokio::test]
    async fn cancelled_waiter_is_skipped() {
        let limiter = AiRateLimiter::new(Duration::from_millis(50));
        limiter.acquire(Priority::Normal).await.unwrap();

        // Enqueue a High waiter, then cancel it while it sits in the queue.
        let doomed = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire(Priority::High).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        doomed.abort();

        // The next waiter still gets released.
        tokio::time::timeout(Duration::from_secs(1), limiter.acquire(Priority::Normal))
            .await
            .expect("dispatcher must skip the cancelled waiter")
            .unwrap();
    }
}
