//! Chunk producer boundary
//!
//! A producer is the opaque data source behind one request. The responder
//! pulls from it lazily, one chunk at a time, and emits a response per chunk
//! before pulling the next.

use async_trait::async_trait;

use crate::data::{InferRequest, Tensor};
use crate::Result;

/// Lazily produces the output chunks of one request
#[async_trait]
pub trait ChunkProducer: Send {
    /// Next chunk in source order
    ///
    /// # Returns
    ///
    /// * `Ok(Some(outputs))` - One chunk, as named output tensors
    /// * `Ok(None)` - Exhausted
    /// * `Err(_)` - Mid-stream failure; no further calls are made
    async fn next_chunk(&mut self) -> Result<Option<Vec<Tensor>>>;

    /// Release resources held by the producer
    ///
    /// Called exactly once, after success or failure.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Creates one producer per request
#[async_trait]
pub trait ProducerFactory: Send + Sync {
    /// Bind a new producer to `request`
    async fn open(&self, request: &InferRequest) -> Result<Box<dyn ChunkProducer>>;
}
