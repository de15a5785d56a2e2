//! Transport boundary
//!
//! The protocol only needs a reliable, in-order bidirectional stream of typed
//! messages. This module defines that boundary as a pair of traits
//! (`MessageSink` for the outbound half, `MessageSource` for the inbound
//! half) plus `Connector` / `Listener` for establishing streams. How messages
//! travel (gRPC, sockets, in-process channels) is up to the implementation.
//!
//! # Architecture
//!
//! ```text
//! Client                                   Backend
//! ┌───────────────┐   ClientMessage    ┌────────────────┐
//! │ StreamSession │ ─────────────────> │ BackendServer  │
//! │               │                    │                │
//! │               │ <───────────────── │ Responder      │
//! └───────────────┘   ServerMessage    └────────────────┘
//! ```
//!
//! `LocalHub` implements both ends in-process over tokio channels.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::data::{InferRequest, InferResponse, RequestId};
use crate::Result;

pub mod local;

pub use local::{LocalHub, LocalListener};

/// Message sent from client to backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// New inference request
    Infer(InferRequest),
    /// Stop producing responses for a request
    Cancel {
        /// Request to cancel
        request_id: RequestId,
    },
}

/// Message sent from backend to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Response belonging to one request
    Response(InferResponse),
    /// Stream-level failure not tied to any request
    StreamError {
        /// Failure description
        message: String,
    },
}

/// Outbound half of a bidirectional stream
#[async_trait]
pub trait MessageSink<T: Send + 'static>: Send {
    /// Send one message
    ///
    /// # Errors
    ///
    /// * `Error::Transport` - The stream is closed
    async fn send(&mut self, item: T) -> Result<()>;

    /// Close the outbound half; the peer's source then ends
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a bidirectional stream
#[async_trait]
pub trait MessageSource<T: Send + 'static>: Send {
    /// Receive the next message
    ///
    /// Returns `None` once the peer closed the stream, `Some(Err)` on a
    /// transport failure.
    async fn recv(&mut self) -> Option<Result<T>>;
}

/// Client end of an established stream
pub struct ClientStream {
    /// Requests and cancels go here
    pub sink: Box<dyn MessageSink<ClientMessage>>,
    /// Responses arrive here
    pub source: Box<dyn MessageSource<ServerMessage>>,
}

/// Backend end of an accepted stream
pub struct ServerStream {
    /// Identifier of the connected peer (for logging)
    pub peer: String,
    /// Responses go here
    pub sink: Box<dyn MessageSink<ServerMessage>>,
    /// Requests arrive here
    pub source: Box<dyn MessageSource<ClientMessage>>,
}

impl std::fmt::Debug for ServerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStream").field("peer", &self.peer).finish()
    }
}

/// Establishes client streams
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a stream to `endpoint`
    ///
    /// # Errors
    ///
    /// * `Error::Connection` - Endpoint unreachable
    async fn connect(&self, endpoint: &str) -> Result<ClientStream>;
}

/// Accepts backend streams
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next client; `None` once the listener is shut down
    async fn accept(&mut self) -> Option<ServerStream>;

    /// Endpoint this listener is bound to
    fn endpoint(&self) -> &str;
}
