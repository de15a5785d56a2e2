//! In-process transport over tokio channels
//!
//! A `LocalHub` is a registry of endpoints living in one process. Backends
//! `bind` an endpoint name and receive a `LocalListener`; clients `connect`
//! through the hub (it implements `Connector`). Every connection is a pair of
//! bounded channels, so a peer that stops reading exerts backpressure on the
//! other side.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{
    ClientMessage, ClientStream, Connector, Listener, MessageSink, MessageSource, ServerMessage,
    ServerStream,
};
use crate::{Error, Result};

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Registry of in-process endpoints
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    endpoints: Mutex<HashMap<String, mpsc::Sender<ServerStream>>>,
    channel_capacity: usize,
    next_peer: AtomicU64,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    /// Create a hub with the default per-direction channel capacity
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a hub whose connections buffer at most `capacity` messages per direction
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                endpoints: Mutex::new(HashMap::new()),
                channel_capacity: capacity.max(1),
                next_peer: AtomicU64::new(0),
            }),
        }
    }

    /// Bind an endpoint name
    ///
    /// The endpoint stays reachable until the returned listener is dropped.
    ///
    /// # Errors
    ///
    /// * `Error::Connection` - The endpoint is already bound
    pub fn bind(&self, endpoint: impl Into<String>) -> Result<LocalListener> {
        let endpoint = endpoint.into();
        let mut endpoints = self.inner.endpoints.lock();

        if endpoints.get(&endpoint).is_some_and(|tx| !tx.is_closed()) {
            return Err(Error::connection(endpoint, "endpoint already bound"));
        }

        let (tx, rx) = mpsc::channel(self.inner.channel_capacity);
        endpoints.insert(endpoint.clone(), tx);
        info!("Local endpoint '{}' bound", endpoint);

        Ok(LocalListener {
            endpoint,
            incoming: rx,
            hub: Arc::downgrade(&self.inner),
        })
    }

    /// Whether an endpoint currently accepts connections
    pub fn is_bound(&self, endpoint: &str) -> bool {
        self.inner
            .endpoints
            .lock()
            .get(endpoint)
            .is_some_and(|tx| !tx.is_closed())
    }
}

#[async_trait]
impl Connector for LocalHub {
    async fn connect(&self, endpoint: &str) -> Result<ClientStream> {
        let acceptor = self
            .inner
            .endpoints
            .lock()
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::connection(endpoint, "no listener bound"))?;

        let capacity = self.inner.channel_capacity;
        let (to_server_tx, to_server_rx) = mpsc::channel(capacity);
        let (to_client_tx, to_client_rx) = mpsc::channel(capacity);

        let peer = format!(
            "local-peer-{}",
            self.inner.next_peer.fetch_add(1, Ordering::Relaxed)
        );

        acceptor
            .send(ServerStream {
                peer: peer.clone(),
                sink: Box::new(ChannelSink::new(to_client_tx)),
                source: Box::new(ChannelSource::new(to_server_rx)),
            })
            .await
            .map_err(|_| Error::connection(endpoint, "listener shut down"))?;

        debug!("Connected {} to local endpoint '{}'", peer, endpoint);

        Ok(ClientStream {
            sink: Box::new(ChannelSink::<ClientMessage>::new(to_server_tx)),
            source: Box::new(ChannelSource::<ServerMessage>::new(to_client_rx)),
        })
    }
}

/// Accepting end of a bound local endpoint
pub struct LocalListener {
    endpoint: String,
    incoming: mpsc::Receiver<ServerStream>,
    hub: Weak<HubInner>,
}

#[async_trait]
impl Listener for LocalListener {
    async fn accept(&mut self) -> Option<ServerStream> {
        self.incoming.recv().await
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for LocalListener {
    fn drop(&mut self) {
        self.incoming.close();
        if let Some(hub) = self.hub.upgrade() {
            let mut endpoints = hub.endpoints.lock();
            // Only our own sender is closed now; a newer bind keeps its entry
            if endpoints
                .get(&self.endpoint)
                .is_some_and(|tx| tx.is_closed())
            {
                endpoints.remove(&self.endpoint);
            }
        }
        debug!("Local endpoint '{}' unbound", self.endpoint);
    }
}

/// Sink half backed by a bounded tokio channel
pub struct ChannelSink<T> {
    tx: Option<mpsc::Sender<T>>,
}

impl<T> ChannelSink<T> {
    /// Wrap a channel sender
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx: Some(tx) }
    }
}

#[async_trait]
impl<T: Send + 'static> MessageSink<T> for ChannelSink<T> {
    async fn send(&mut self, item: T) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| Error::Transport("sink already closed".into()))?;
        tx.send(item)
            .await
            .map_err(|_| Error::Transport("peer closed the stream".into()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}

/// Source half backed by a bounded tokio channel
pub struct ChannelSource<T> {
    rx: mpsc::Receiver<T>,
}

impl<T> ChannelSource<T> {
    /// Wrap a channel receiver
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self { rx }
    }
}

#[async_trait]
impl<T: Send + 'static> MessageSource<T> for ChannelSource<T> {
    async fn recv(&mut self) -> Option<Result<T>> {
        self.rx.recv().await.map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::InferResponse;

    #[tokio::test]
    async fn test_connect_to_unbound_endpoint_fails() {
        let hub = LocalHub::new();
        let err = hub.connect("local://nowhere").await.err().unwrap();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_double_bind_rejected_until_dropped() {
        let hub = LocalHub::new();
        let listener = hub.bind("local://decoder").unwrap();
        assert!(hub.bind("local://decoder").is_err());
        assert!(hub.is_bound("local://decoder"));

        drop(listener);
        assert!(!hub.is_bound("local://decoder"));
        assert!(hub.bind("local://decoder").is_ok());
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let hub = LocalHub::new();
        let mut listener = hub.bind("local://echo").unwrap();

        let mut client = hub.connect("local://echo").await.unwrap();
        let mut server = listener.accept().await.unwrap();
        assert!(server.peer.starts_with("local-peer-"));

        client
            .sink
            .send(ClientMessage::Cancel {
                request_id: "a".into(),
            })
            .await
            .unwrap();
        let received = server.source.recv().await.unwrap().unwrap();
        assert_eq!(
            received,
            ClientMessage::Cancel {
                request_id: "a".into()
            }
        );

        let reply = ServerMessage::Response(InferResponse::final_marker("a", "m", 0));
        server.sink.send(reply.clone()).await.unwrap();
        assert_eq!(client.source.recv().await.unwrap().unwrap(), reply);

        // Closing the server sink ends the client source
        server.sink.close().await.unwrap();
        assert!(client.source.recv().await.is_none());
    }
}
