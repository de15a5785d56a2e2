//! Response queue between the transport delivery task and the dispatcher
//!
//! Items keep transport arrival order regardless of which request they
//! belong to. A bounded queue makes `push` wait for free space instead of
//! dropping anything, which stalls the delivery task and, through the
//! transport, the backend.

use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::data::InferResponse;
use crate::{Error, Result};

/// Item delivered by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Response for some request
    Response(InferResponse),
    /// Transport-level failure not tied to a request; fatal to the session
    TransportError(String),
}

/// Create a response queue; `capacity = None` makes it unbounded
pub fn response_queue(capacity: Option<usize>) -> (QueueWriter, QueueReader) {
    let depth = Arc::new(QueueDepth::default());
    let (writer, reader) = match capacity {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (WriterInner::Bounded(tx), ReaderInner::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (WriterInner::Unbounded(tx), ReaderInner::Unbounded(rx))
        }
    };

    (
        QueueWriter {
            inner: writer,
            depth: Arc::clone(&depth),
            capacity,
        },
        QueueReader {
            inner: reader,
            depth,
        },
    )
}

#[derive(Debug, Default)]
struct QueueDepth {
    // Signed: a pop may be counted before the matching push
    current: AtomicIsize,
    high_water: AtomicUsize,
}

impl QueueDepth {
    fn pushed(&self) {
        let now = self.current.fetch_add(1, Ordering::AcqRel) + 1;
        self.high_water.fetch_max(now.max(0) as usize, Ordering::AcqRel);
    }

    fn popped(&self) {
        self.current.fetch_sub(1, Ordering::AcqRel);
    }

    fn current(&self) -> usize {
        self.current.load(Ordering::Acquire).max(0) as usize
    }
}

#[derive(Clone)]
enum WriterInner {
    Bounded(mpsc::Sender<Delivery>),
    Unbounded(mpsc::UnboundedSender<Delivery>),
}

enum ReaderInner {
    Bounded(mpsc::Receiver<Delivery>),
    Unbounded(mpsc::UnboundedReceiver<Delivery>),
}

/// Pushing end, held by the delivery path
#[derive(Clone)]
pub struct QueueWriter {
    inner: WriterInner,
    depth: Arc<QueueDepth>,
    capacity: Option<usize>,
}

impl QueueWriter {
    /// Append an item, waiting for space when the queue is bounded and full
    ///
    /// # Errors
    ///
    /// * `Error::Transport` - The reading end is gone
    pub async fn push(&self, item: Delivery) -> Result<()> {
        let sent = match &self.inner {
            WriterInner::Bounded(tx) => tx.send(item).await.is_ok(),
            WriterInner::Unbounded(tx) => tx.send(item).is_ok(),
        };
        if sent {
            self.depth.pushed();
            Ok(())
        } else {
            Err(Error::Transport("response queue closed".into()))
        }
    }

    /// Configured bound, if any
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Items currently queued
    pub fn len(&self) -> usize {
        self.depth.current()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Largest depth observed so far
    pub fn high_water_mark(&self) -> usize {
        self.depth.high_water.load(Ordering::Acquire)
    }
}

/// Popping end, held by the dispatcher
pub struct QueueReader {
    inner: ReaderInner,
    depth: Arc<QueueDepth>,
}

impl QueueReader {
    /// Next item in arrival order; `None` once every writer is gone and the queue is empty
    pub async fn pop(&mut self) -> Option<Delivery> {
        let item = match &mut self.inner {
            ReaderInner::Bounded(rx) => rx.recv().await,
            ReaderInner::Unbounded(rx) => rx.recv().await,
        };
        if item.is_some() {
            self.depth.popped();
        }
        item
    }

    /// Next item if one is ready
    pub fn try_pop(&mut self) -> Option<Delivery> {
        let item = match &mut self.inner {
            ReaderInner::Bounded(rx) => rx.try_recv().ok(),
            ReaderInner::Unbounded(rx) => rx.try_recv().ok(),
        };
        if item.is_some() {
            self.depth.popped();
        }
        item
    }
}
