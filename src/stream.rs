//! Bounded multi-consumer event streams.
//!
//! Two overflow policies are supported:
//!
//! - [`OverflowPolicy::DropOldest`]: the stream keeps a replay buffer of the
//!   last `capacity` items. New receivers first see the replay buffer, then live
//!   items. A receiver that falls more than `capacity` items behind silently
//!   skips the oldest ones. Used for per-subscription output.
//! - [`OverflowPolicy::DropNewest`]: no replay. Each receiver has its own queue
//!   of `capacity` items and new items are dropped for receivers whose queue is
//!   full. Used for the global stream, where slow consumers must not hold up
//!   dispatch.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    DropNewest,
}

#[derive(Debug)]
enum Inner<T> {
    Replay {
        buffer: VecDeque<T>,
        sender: Option<broadcast::Sender<T>>,
    },
    Queues {
        senders: Vec<mpsc::Sender<T>>,
        closed: bool,
    },
}

#[derive(Debug)]
pub struct EventStream<T> {
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Inner<T>>,
    dropped: AtomicU64,
}

impl<T: Clone + Send + 'static> EventStream<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        let inner = match policy {
            OverflowPolicy::DropOldest => {
                let (sender, _) = broadcast::channel(capacity);
                Inner::Replay {
                    buffer: VecDeque::with_capacity(capacity),
                    sender: Some(sender),
                }
            }
            OverflowPolicy::DropNewest => Inner::Queues {
                senders: Vec::new(),
                closed: false,
            },
        };

        Self {
            capacity,
            policy,
            inner: Mutex::new(inner),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Items discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Items currently held for replay.
    pub fn buffered(&self) -> Vec<T> {
        match &*self.inner.lock() {
            Inner::Replay { buffer, .. } => buffer.iter().cloned().collect(),
            Inner::Queues { .. } => Vec::new(),
        }
    }

    pub fn publish(&self, item: T) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Replay { buffer, sender } => {
                let Some(sender) = sender else {
                    return;
                };
                if buffer.len() == self.capacity {
                    buffer.pop_front();
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
                buffer.push_back(item.clone());
                // No receivers is fine, the replay buffer still holds the item
                let _ = sender.send(item);
            }
            Inner::Queues { senders, closed } => {
                if *closed {
                    return;
                }
                senders.retain(|sender| match sender.try_send(item.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        trace!("Dropping item for a full receiver");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    pub fn subscribe(&self) -> StreamReceiver<T> {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Replay { buffer, sender } => StreamReceiver {
                replay: buffer.clone(),
                source: match sender {
                    Some(sender) => Source::Live(sender.subscribe()),
                    None => Source::Ended,
                },
            },
            Inner::Queues { senders, closed } => {
                if *closed {
                    return StreamReceiver {
                        replay: VecDeque::new(),
                        source: Source::Ended,
                    };
                }
                let (sender, receiver) = mpsc::channel(self.capacity);
                senders.push(sender);
                StreamReceiver {
                    replay: VecDeque::new(),
                    source: Source::Queue(receiver),
                }
            }
        }
    }

    /// Ends the stream. Receivers drain what they already hold, then see `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        match &mut *inner {
            Inner::Replay { sender, .. } => {
                sender.take();
            }
            Inner::Queues { senders, closed } => {
                senders.clear();
                *closed = true;
            }
        }
    }
}

#[derive(Debug)]
enum Source<T> {
    Live(broadcast::Receiver<T>),
    Queue(mpsc::Receiver<T>),
    Ended,
}

#[derive(Debug)]
pub struct StreamReceiver<T> {
    replay: VecDeque<T>,
    source: Source<T>,
}

impl<T: Clone + Send + 'static> StreamReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(item) = self.replay.pop_front() {
            return Some(item);
        }

        match &mut self.source {
            Source::Live(receiver) => loop {
                match receiver.recv().await {
                    Ok(item) => return Some(item),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        trace!("Receiver lagged, skipped {} item(s)", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            Source::Queue(receiver) => receiver.recv().await,
            Source::Ended => None,
        }
    }

    /// Non-blocking variant of [`StreamReceiver::recv`].
    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(item) = self.replay.pop_front() {
            return Some(item);
        }

        match &mut self.source {
            Source::Live(receiver) => loop {
                match receiver.try_recv() {
                    Ok(item) => return Some(item),
                    Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                    Err(_) => return None,
                }
            },
            Source::Queue(receiver) => receiver.try_recv().ok(),
            Source::Ended => None,
        }
    }

    /// Everything that can be received right now.
    pub fn drain(&mut self) -> Vec<T> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
