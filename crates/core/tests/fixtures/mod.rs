//! Shared fixtures for integration tests
//!
//! - `ScriptedFactory` produces numbered chunks and can fail or stall on demand
//! - `Harness` runs a `BackendServer` on a `LocalHub` endpoint
//!
//! Per-request behavior of the scripted producer is taken from request
//! parameters so one server can serve well-behaved and failing requests:
//!
//! | parameter    | meaning                                  |
//! |--------------|------------------------------------------|
//! | `chunks`     | number of chunks, `endless` for no limit |
//! | `fail_after` | fail after this many chunks              |
//! | `delay_ms`   | sleep before every chunk                 |

#![allow(dead_code)]

use async_trait::async_trait;
use remotemedia_decoupled::backend::{
    BackendServer, ChunkProducer, DecoupledResponder, ProducerFactory, ServerHandle,
};
use remotemedia_decoupled::client::StreamSession;
use remotemedia_decoupled::config::{ModelConfig, ServerConfig, SessionConfig};
use remotemedia_decoupled::data::{InferRequest, Tensor};
use remotemedia_decoupled::transport::LocalHub;
use remotemedia_decoupled::{Error, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const MODEL: &str = "nvdec";
pub const INPUT: &str = "INPUT0";
pub const OUTPUT: &str = "OUTPUT0";
pub const CHUNK_LEN: usize = 10;

/// Decoupled model with one input and one output
pub fn model() -> ModelConfig {
    ModelConfig::decoupled(MODEL, INPUT, OUTPUT)
}

/// Request with a `len`-byte payload
pub fn request(id: &str, len: usize) -> InferRequest {
    InferRequest::new(id, MODEL).with_input(Tensor::from_bytes(INPUT, vec![0xAB; len]))
}

/// Request for the scripted producer
pub fn scripted(id: &str, chunks: &str) -> InferRequest {
    request(id, 1).with_parameter("chunks", chunks)
}

/// Counters shared by every producer of one factory
#[derive(Debug, Default)]
pub struct ProducerStats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl ProducerStats {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Wait until `n` producers were closed, or give up after `limit`
    pub async fn wait_closed(&self, n: usize, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.closed() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.closed() >= n
    }
}

/// Producer emitting `[1, CHUNK_LEN]` chunks filled with the chunk index
pub struct ScriptedProducer {
    total: Option<usize>,
    fail_after: Option<usize>,
    delay: Option<Duration>,
    produced: usize,
    stats: Arc<ProducerStats>,
}

#[async_trait]
impl ChunkProducer for ScriptedProducer {
    async fn next_chunk(&mut self) -> Result<Option<Vec<Tensor>>> {
        if self.fail_after == Some(self.produced) {
            return Err(Error::ProducerFailure(format!(
                "decoder failed after {} chunks",
                self.produced
            )));
        }
        if self.total.is_some_and(|total| self.produced >= total) {
            return Ok(None);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let byte = (self.produced % 256) as u8;
        self.produced += 1;
        Ok(Some(vec![Tensor::from_bytes(OUTPUT, vec![byte; CHUNK_LEN])]))
    }

    async fn close(&mut self) -> Result<()> {
        self.stats.active.fetch_sub(1, Ordering::SeqCst);
        self.stats.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory for `ScriptedProducer`
#[derive(Default)]
pub struct ScriptedFactory {
    pub stats: Arc<ProducerStats>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

fn param<T: std::str::FromStr>(request: &InferRequest, key: &str) -> Option<T> {
    request.parameters.get(key).and_then(|v| v.parse().ok())
}

#[async_trait]
impl ProducerFactory for ScriptedFactory {
    async fn open(&self, request: &InferRequest) -> Result<Box<dyn ChunkProducer>> {
        let total = match request.parameters.get("chunks").map(String::as_str) {
            Some("endless") => None,
            Some(n) => Some(
                n.parse()
                    .map_err(|_| Error::InvalidRequest(format!("bad chunk count '{}'", n)))?,
            ),
            None => Some(3),
        };

        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        let active = self.stats.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_active.fetch_max(active, Ordering::SeqCst);

        Ok(Box::new(ScriptedProducer {
            total,
            fail_after: param(request, "fail_after"),
            delay: param::<u64>(request, "delay_ms").map(Duration::from_millis),
            produced: 0,
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// Backend server on an in-process endpoint
pub struct Harness {
    pub hub: LocalHub,
    pub endpoint: String,
    server: Option<ServerHandle>,
}

impl Harness {
    /// Serve `model` with `factory` on a fresh hub
    pub fn start(
        hub: LocalHub,
        model: ModelConfig,
        factory: Arc<dyn ProducerFactory>,
        config: ServerConfig,
    ) -> Self {
        let endpoint = format!("local://{}", model.name);
        let responder = DecoupledResponder::new(model, factory).expect("valid model config");
        let server = BackendServer::new(responder, config).expect("valid server config");
        let listener = hub.bind(endpoint.clone()).expect("endpoint free");
        Self {
            server: Some(server.spawn(listener)),
            hub,
            endpoint,
        }
    }

    /// Default model and server config, scripted producers
    pub fn scripted() -> (Self, Arc<ProducerStats>) {
        let factory = ScriptedFactory::new();
        let stats = Arc::clone(&factory.stats);
        let harness = Self::start(
            LocalHub::new(),
            model(),
            Arc::new(factory),
            ServerConfig::default(),
        );
        (harness, stats)
    }

    /// Open a session to the served endpoint
    pub async fn session(&self, config: SessionConfig) -> StreamSession {
        StreamSession::open(&self.hub, &self.endpoint, config)
            .await
            .expect("session opens")
    }

    /// Stop the server; connected sessions see a stream error
    pub async fn shutdown(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown().await.expect("server stops cleanly");
        }
    }
}
