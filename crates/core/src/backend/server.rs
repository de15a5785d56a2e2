//! Backend server
//!
//! Serves every stream accepted by a `Listener`. Each connection gets:
//!
//! - a bounded response channel forwarded to the stream's sink, so a slow
//!   client stalls the producers instead of growing memory
//! - a semaphore bounding how many of its requests execute at once
//! - one task per request, each with its own producer and cancel flag
//!
//! When a connection ends every request still running on it is cancelled.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::responder::{CancelFlag, DecoupledResponder, ResponseSender};
use crate::config::ServerConfig;
use crate::data::{InferRequest, RequestId};
use crate::error::{ResponseError, ResponseErrorKind};
use crate::transport::{ClientMessage, Listener, ServerMessage, ServerStream};
use crate::{Error, Result};

type InFlight = Arc<Mutex<HashMap<RequestId, CancelFlag>>>;

struct ServerInner {
    responder: Arc<DecoupledResponder>,
    config: ServerConfig,
    connections: AtomicU64,
    requests: AtomicU64,
}

/// Serves a decoupled responder over accepted streams
#[derive(Clone)]
pub struct BackendServer {
    inner: Arc<ServerInner>,
}

/// Handle to a server running on its own task
///
/// Dropping the handle without calling `shutdown` also stops the server.
pub struct ServerHandle {
    endpoint: String,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl ServerHandle {
    /// Endpoint being served
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Stop accepting, end every connection and wait for the server task
    ///
    /// Connected clients receive a stream error before their stream closes.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.task
            .await
            .map_err(|e| Error::Other(format!("server task failed: {}", e)))?
    }
}

impl BackendServer {
    /// Create a server for `responder`
    ///
    /// # Errors
    ///
    /// * `Error::ConfigError` - Invalid server configuration
    pub fn new(responder: DecoupledResponder, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                responder: Arc::new(responder),
                config,
                connections: AtomicU64::new(0),
                requests: AtomicU64::new(0),
            }),
        })
    }

    /// Connections accepted so far
    pub fn connections_accepted(&self) -> u64 {
        self.inner.connections.load(Ordering::Relaxed)
    }

    /// Requests received so far, across all connections
    pub fn requests_received(&self) -> u64 {
        self.inner.requests.load(Ordering::Relaxed)
    }

    /// Run the accept loop on a background task
    pub fn spawn<L>(&self, listener: L) -> ServerHandle
    where
        L: Listener + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let endpoint = listener.endpoint().to_string();
        let server = self.clone();
        let task = tokio::spawn(async move { server.serve(listener, shutdown_rx).await });
        ServerHandle {
            endpoint,
            shutdown_tx,
            task,
        }
    }

    /// Accept streams until the listener closes or `shutdown` flips to true
    pub async fn serve<L>(&self, mut listener: L, mut shutdown: watch::Receiver<bool>) -> Result<()>
    where
        L: Listener,
    {
        info!(
            "🚀 Serving model '{}' on {}",
            self.inner.responder.model_config().name,
            listener.endpoint()
        );

        let mut connections: Vec<JoinHandle<()>> = Vec::new();
        loop {
            let stream = tokio::select! {
                _ = shutdown.changed() => break,
                stream = listener.accept() => stream,
            };
            let Some(stream) = stream else {
                debug!("Listener on {} closed", listener.endpoint());
                break;
            };

            self.inner.connections.fetch_add(1, Ordering::Relaxed);
            info!("Accepted connection from {}", stream.peer);
            connections.retain(|c| !c.is_finished());
            connections.push(tokio::spawn(handle_connection(
                Arc::clone(&self.inner),
                stream,
                shutdown.clone(),
            )));
        }

        info!(
            "Server on {} stopping, waiting for {} connection(s)",
            listener.endpoint(),
            connections.len()
        );
        for result in futures::future::join_all(connections).await {
            if let Err(e) = result {
                error!("Connection task failed: {}", e);
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    inner: Arc<ServerInner>,
    stream: ServerStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let ServerStream {
        peer,
        mut sink,
        mut source,
    } = stream;

    let (responses_tx, mut responses_rx) =
        mpsc::channel::<ServerMessage>(inner.config.response_channel_capacity);

    let forward_peer = peer.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(message) = responses_rx.recv().await {
            if let Err(e) = sink.send(message).await {
                debug!("Stopped forwarding to {}: {}", forward_peer, e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let semaphore = Arc::new(Semaphore::new(inner.config.max_concurrent_requests));
    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => {
                let _ = responses_tx
                    .send(ServerMessage::StreamError {
                        message: "server shutting down".into(),
                    })
                    .await;
                break;
            }
            message = source.recv() => message,
        };

        match message {
            Some(Ok(ClientMessage::Infer(request))) => {
                inner.requests.fetch_add(1, Ordering::Relaxed);
                tasks.retain(|t| !t.is_finished());
                if let Some(task) = start_request(
                    &inner,
                    request,
                    &responses_tx,
                    &semaphore,
                    &in_flight,
                )
                .await
                {
                    tasks.push(task);
                }
            }
            Some(Ok(ClientMessage::Cancel { request_id })) => {
                match in_flight.lock().get(&request_id) {
                    Some(flag) => {
                        flag.cancel();
                        info!("Cancel requested by {} for '{}'", peer, request_id);
                    }
                    None => debug!(
                        "Cancel from {} for '{}' which is not running",
                        peer, request_id
                    ),
                }
            }
            Some(Err(e)) => {
                warn!("Stream from {} failed: {}", peer, e);
                break;
            }
            None => {
                info!("Peer {} disconnected", peer);
                break;
            }
        }
    }

    let running: Vec<CancelFlag> = in_flight.lock().values().cloned().collect();
    if !running.is_empty() {
        info!("Cancelling {} request(s) of {}", running.len(), peer);
        for flag in running {
            flag.cancel();
        }
    }

    // Forwarder ends once every request task dropped its sender clone
    drop(responses_tx);
    futures::future::join_all(tasks).await;
    let _ = forwarder.await;
    debug!("Connection {} closed", peer);
}

async fn start_request(
    inner: &Arc<ServerInner>,
    request: InferRequest,
    responses_tx: &mpsc::Sender<ServerMessage>,
    semaphore: &Arc<Semaphore>,
    in_flight: &InFlight,
) -> Option<JoinHandle<()>> {
    let flag = CancelFlag::new();
    let duplicate = {
        let mut running = in_flight.lock();
        if running.contains_key(&request.id) {
            true
        } else {
            running.insert(request.id.clone(), flag.clone());
            false
        }
    };

    if duplicate {
        warn!("Request id '{}' is already running, rejecting", request.id);
        let _ = ResponseSender::new(
            &request.id,
            &inner.responder.model_config().name,
            responses_tx.clone(),
        )
        .send_error(ResponseError::new(
            ResponseErrorKind::InvalidRequest,
            format!("request id '{}' is already running", request.id),
        ))
        .await;
        return None;
    }

    let responder = Arc::clone(&inner.responder);
    let semaphore = Arc::clone(semaphore);
    let in_flight = Arc::clone(in_flight);
    let tx = responses_tx.clone();

    Some(tokio::spawn(async move {
        let request_id = request.id.clone();
        // Acquired inside the task so cancels keep flowing while at capacity
        let Ok(_permit) = semaphore.acquire_owned().await else {
            return;
        };

        if let Err(e) = responder.execute(vec![request], &tx, &flag).await {
            debug!("Response stream for '{}' ended early: {}", request_id, e);
        }

        let mut running = in_flight.lock();
        if running.get(&request_id).is_some_and(|f| f.is_same(&flag)) {
            running.remove(&request_id);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::producers::ByteChunkFactory;
    use crate::config::ModelConfig;
    use crate::data::Tensor;
    use crate::transport::{Connector, LocalHub, MessageSink, MessageSource};

    fn server(config: ServerConfig) -> BackendServer {
        let responder = DecoupledResponder::new(
            ModelConfig::decoupled("decoder", "IN", "OUT"),
            Arc::new(ByteChunkFactory::new("IN", "OUT", 4)),
        )
        .unwrap();
        BackendServer::new(responder, config).unwrap()
    }

    #[test]
    fn test_invalid_server_config_rejected() {
        let responder = DecoupledResponder::new(
            ModelConfig::decoupled("decoder", "IN", "OUT"),
            Arc::new(ByteChunkFactory::new("IN", "OUT", 4)),
        )
        .unwrap();
        let config = ServerConfig {
            max_concurrent_requests: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(
            BackendServer::new(responder, config),
            Err(Error::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_serves_request_over_local_hub() {
        let hub = LocalHub::new();
        let server = server(ServerConfig::default());
        let handle = server.spawn(hub.bind("local://decoder").unwrap());

        let mut stream = hub.connect("local://decoder").await.unwrap();
        let request =
            InferRequest::new("r", "decoder").with_input(Tensor::from_bytes("IN", vec![1u8; 8]));
        stream.sink.send(ClientMessage::Infer(request)).await.unwrap();

        let mut responses = Vec::new();
        while let Some(Ok(ServerMessage::Response(r))) = stream.source.recv().await {
            let done = r.is_final;
            responses.push(r);
            if done {
                break;
            }
        }
        assert_eq!(responses.len(), 3);
        assert!(responses[2].is_bare_final());
        assert_eq!(server.requests_received(), 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_sends_stream_error() {
        let hub = LocalHub::new();
        let handle = server(ServerConfig::default()).spawn(hub.bind("local://decoder").unwrap());
        assert_eq!(handle.endpoint(), "local://decoder");

        let mut stream = hub.connect("local://decoder").await.unwrap();
        // Make sure the connection was accepted before shutting down
        stream
            .sink
            .send(ClientMessage::Cancel {
                request_id: "none".into(),
            })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        handle.shutdown().await.unwrap();
        assert!(matches!(
            stream.source.recv().await,
            Some(Ok(ServerMessage::StreamError { .. }))
        ));
        assert!(stream.source.recv().await.is_none());
    }
}
