//! RemoteMedia Decoupled - streaming request/response correlation
//!
//! One client request yields an unbounded, ordered sequence of responses,
//! each tagged with the request id and terminated by an explicit final
//! marker. Many such requests share one bidirectional stream.
//!
//! # Architecture
//!
//! - `client` - stream session, correlation table, response queue
//! - `backend` - decoupled responder, chunk producers, server loop
//! - `transport` - stream boundary traits and the in-process `LocalHub`
//! - `config` - session, server and model configuration
//! - `data` - tensors, requests and responses
//!
//! # Example
//!
//! ```ignore
//! use remotemedia_decoupled::backend::{BackendServer, ByteChunkFactory, DecoupledResponder};
//! use remotemedia_decoupled::client::StreamSession;
//! use remotemedia_decoupled::config::{ModelConfig, ServerConfig, SessionConfig};
//! use remotemedia_decoupled::data::{InferRequest, Tensor};
//! use remotemedia_decoupled::transport::LocalHub;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> remotemedia_decoupled::Result<()> {
//!     let hub = LocalHub::new();
//!     let responder = DecoupledResponder::new(
//!         ModelConfig::decoupled("decoder", "INPUT0", "OUTPUT0"),
//!         Arc::new(ByteChunkFactory::new("INPUT0", "OUTPUT0", 10)),
//!     )?;
//!     let server = BackendServer::new(responder, ServerConfig::default())?
//!         .spawn(hub.bind("local://decoder")?);
//!
//!     let session = StreamSession::open(&hub, "local://decoder", SessionConfig::default()).await?;
//!     let request = InferRequest::new("req0", "decoder")
//!         .with_input(Tensor::from_bytes("INPUT0", vec![0u8; 30]));
//!     let responses = session.infer(request, None).await?;
//!     assert_eq!(responses.len(), 3);
//!
//!     session.close().await?;
//!     server.shutdown().await
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod client;
pub mod config;
pub mod data;
pub mod error;
pub mod transport;

pub use client::{InferenceClient, StreamSession};
pub use config::{DeploymentConfig, ModelConfig, ServerConfig, SessionConfig};
pub use data::{InferRequest, InferResponse, RequestId, Tensor};
pub use error::{Error, ResponseError, ResponseErrorKind, Result};

/// Install the tracing subscriber
///
/// Filters come from `RUST_LOG`, defaulting to `info`. Calling this more
/// than once is harmless.
pub fn init() -> Result<()> {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("RemoteMedia decoupled runtime initialized");
    }
    Ok(())
}
