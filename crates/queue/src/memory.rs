//! In-process queue with visibility-timeout semantics.
//!
//! One priority queue per logical queue behind its own async mutex; higher
//! priority dequeues first, FIFO within a priority. Delayed and in-flight
//! messages are promoted back to visible lazily on the next receive, so no
//! background task is needed.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use priority_queue::PriorityQueue;
use tokio::sync::Mutex;
use tracing::debug;

use crawlgrid_core::CrawlError;

use crate::{Queue, QueueDepth, QueueMessage, QueueName};

/// Dequeue order: priority first, then arrival order.
type Rank = (u8, Reverse<u64>);

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    body: String,
    priority: u8,
}

struct InFlight {
    message: StoredMessage,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    visible: PriorityQueue<u64, Rank>,
    bodies: HashMap<u64, StoredMessage>,
    delayed: Vec<(Instant, StoredMessage)>,
    in_flight: HashMap<String, InFlight>,
}

impl QueueState {
    fn push_visible(&mut self, message: StoredMessage) {
        self.visible.push(message.id, (message.priority, Reverse(message.id)));
        self.bodies.insert(message.id, message);
    }

    /// Promote delayed messages whose time has come and redeliver in-flight
    /// messages whose visibility lapsed.
    fn promote(&mut self, now: Instant) {
        let mut due = Vec::new();
        self.delayed.retain(|(at, message)| {
            if *at <= now {
                due.push(message.clone());
                false
            } else {
                true
            }
        });
        for message in due {
            self.push_visible(message);
        }

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(flight) = self.in_flight.remove(&receipt) {
                debug!(id = flight.message.id, "visibility lapsed, message redelivered");
                self.push_visible(flight.message);
            }
        }
    }
}

pub struct MemoryQueue {
    queues: DashMap<QueueName, Arc<Mutex<QueueState>>>,
    next_id: AtomicU64,
    next_receipt: AtomicU64,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            next_id: AtomicU64::new(1),
            next_receipt: AtomicU64::new(1),
        }
    }

    fn state(&self, queue: QueueName) -> Arc<Mutex<QueueState>> {
        self.queues
            .entry(queue)
            .or_insert_with(|| Arc::new(Mutex::new(QueueState::default())))
            .clone()
    }

    fn next_message(&self, body: String, priority: u8) -> StoredMessage {
        StoredMessage {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            body,
            priority,
        }
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn send(&self, queue: QueueName, body: String, priority: u8) -> Result<(), CrawlError> {
        let state = self.state(queue);
        let mut state = state.lock().await;
        let message = self.next_message(body, priority);
        state.push_visible(message);
        Ok(())
    }

    async fn send_delayed(
        &self,
        queue: QueueName,
        body: String,
        priority: u8,
        delay: Duration,
    ) -> Result<(), CrawlError> {
        let state = self.state(queue);
        let mut state = state.lock().await;
        let message = self.next_message(body, priority);
        if delay.is_zero() {
            state.push_visible(message);
        } else {
            state.delayed.push((Instant::now() + delay, message));
        }
        Ok(())
    }

    async fn send_batch(
        &self,
        queue: QueueName,
        bodies: Vec<(String, u8)>,
    ) -> Result<(), CrawlError> {
        let state = self.state(queue);
        let mut state = state.lock().await;
        for (body, priority) in bodies {
            let message = self.next_message(body, priority);
            state.push_visible(message);
        }
        Ok(())
    }

    async fn receive(
        &self,
        queue: QueueName,
        max: usize,
        visibility: Duration,
    ) -> Result<Vec<QueueMessage>, CrawlError> {
        let state = self.state(queue);
        let mut state = state.lock().await;
        let now = Instant::now();
        state.promote(now);

        let mut out = Vec::with_capacity(max.min(state.visible.len()));
        for _ in 0..max {
            let Some((id, _)) = state.visible.pop() else {
                break;
            };
            let Some(message) = state.bodies.remove(&id) else {
                continue;
            };
            let receipt = format!("r-{}", self.next_receipt.fetch_add(1, Ordering::Relaxed));
            out.push(QueueMessage {
                id: id.to_string(),
                body: message.body.clone(),
                receipt: receipt.clone(),
            });
            state.in_flight.insert(
                receipt,
                InFlight {
                    message,
                    deadline: now + visibility,
                },
            );
        }
        Ok(out)
    }

    async fn ack(&self, queue: QueueName, receipt: &str) -> Result<(), CrawlError> {
        let state = self.state(queue);
        let mut state = state.lock().await;
        if state.in_flight.remove(receipt).is_none() {
            debug!(receipt, queue = %queue, "ack for unknown receipt ignored");
        }
        Ok(())
    }

    async fn nack(
        &self,
        queue: QueueName,
        receipt: &str,
        delay: Duration,
    ) -> Result<(), CrawlError> {
        let state = self.state(queue);
        let mut state = state.lock().await;
        if let Some(flight) = state.in_flight.remove(receipt) {
            if delay.is_zero() {
                state.push_visible(flight.message);
            } else {
                state.delayed.push((Instant::now() + delay, flight.message));
            }
        }
        Ok(())
    }

    async fn depth(&self, queue: QueueName) -> Result<QueueDepth, CrawlError> {
        let state = self.state(queue);
        let state = state.lock().await;
        Ok(QueueDepth {
            visible: state.visible.len() + state.delayed.len(),
            in_flight: state.in_flight.len(),
        })
    }
}
