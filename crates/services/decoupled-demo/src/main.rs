//! Decoupled streaming demo
//!
//! Starts a decoupled backend on an in-process endpoint, opens a streaming
//! client against it, submits a handful of requests and prints how each one
//! was answered.
//!
//! # Usage
//!
//! ```bash
//! # Three requests of 30 bytes, 10-byte chunks
//! cargo run -p remotemedia-decoupled-demo
//!
//! # Frame sequences from a deployment file
//! cargo run -p remotemedia-decoupled-demo -- --config deploy.toml --producer frames
//!
//! # With logging
//! RUST_LOG=debug cargo run -p remotemedia-decoupled-demo
//! ```
//!
//! # Environment Variables
//!
//! - `DECOUPLED_ENDPOINT`: Endpoint name (default: `local://nvdec`)
//! - `DECOUPLED_CONFIG`: Deployment config file (`.json`, `.toml`, `.yaml`)
//! - `RUST_LOG`: Logging level (default: `info`)

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use remotemedia_decoupled::backend::{
    BackendServer, ByteChunkFactory, DecoupledResponder, FrameSequenceFactory, ProducerFactory,
    SpooledFactory,
};
use remotemedia_decoupled::client::InferenceClient;
use remotemedia_decoupled::config::{DeploymentConfig, ModelConfig};
use remotemedia_decoupled::data::{InferRequest, RequestId, Tensor};
use remotemedia_decoupled::transport::LocalHub;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProducerKind {
    /// Fixed-size byte chunks
    Bytes,
    /// Sequences of fixed-size frames
    Frames,
    /// Byte chunks read back from a temporary spool file
    Spooled,
}

#[derive(Parser)]
#[command(name = "decoupled-demo")]
#[command(about = "Run a decoupled backend and a streaming client in one process", long_about = None)]
struct Cli {
    /// Deployment config file
    #[arg(short, long, env = "DECOUPLED_CONFIG")]
    config: Option<PathBuf>,

    /// Endpoint name (overrides the config file)
    #[arg(long, env = "DECOUPLED_ENDPOINT")]
    endpoint: Option<String>,

    /// Number of concurrent requests
    #[arg(short = 'n', long, default_value = "3")]
    requests: usize,

    /// Payload size of each request in bytes
    #[arg(long, default_value = "30")]
    payload_bytes: usize,

    /// Chunk size for byte producers, frame size for the frame producer
    #[arg(long, default_value = "10")]
    chunk_size: usize,

    /// Producer behind the model
    #[arg(long, value_enum, default_value = "bytes")]
    producer: ProducerKind,

    /// Overall timeout in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,
}

fn load_deployment(cli: &Cli) -> Result<DeploymentConfig> {
    let mut deployment = match &cli.config {
        Some(path) => DeploymentConfig::from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => DeploymentConfig::default(),
    };

    if deployment.model.name.is_empty() {
        deployment.model = ModelConfig::decoupled("nvdec", "INPUT0", "OUTPUT0");
    }
    if let Some(endpoint) = &cli.endpoint {
        deployment.endpoint = Some(endpoint.clone());
    }
    deployment.validate()?;
    Ok(deployment)
}

fn producer_factory(cli: &Cli, model: &ModelConfig) -> Result<Arc<dyn ProducerFactory>> {
    let input = model
        .input
        .first()
        .context("model declares no inputs")?
        .name
        .clone();
    let output = model
        .output
        .first()
        .context("model declares no outputs")?
        .name
        .clone();

    let factory: Arc<dyn ProducerFactory> = match cli.producer {
        ProducerKind::Bytes => Arc::new(ByteChunkFactory::new(input, output, cli.chunk_size)),
        ProducerKind::Frames => Arc::new(FrameSequenceFactory::new(input, output, cli.chunk_size)),
        ProducerKind::Spooled => Arc::new(SpooledFactory::new(input, output, cli.chunk_size)),
    };
    Ok(factory)
}

async fn run(cli: Cli) -> Result<()> {
    let deployment = load_deployment(&cli)?;
    let endpoint = deployment
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("local://{}", deployment.model.name));
    let input_name = deployment
        .model
        .input
        .first()
        .map(|i| i.name.clone())
        .unwrap_or_else(|| "INPUT0".to_string());

    let hub = LocalHub::new();
    let responder = DecoupledResponder::new(
        deployment.model.clone(),
        producer_factory(&cli, &deployment.model)?,
    )?;
    let server = BackendServer::new(responder, deployment.server.clone())?
        .spawn(hub.bind(endpoint.clone())?);

    let client = InferenceClient::new(Arc::new(hub.clone()), endpoint, deployment.session.clone());
    let session = client.start_stream().await?;

    let ids: Vec<RequestId> = (0..cli.requests).map(|i| format!("req{}", i)).collect();
    for (i, id) in ids.iter().enumerate() {
        let payload: Vec<u8> = (0..cli.payload_bytes).map(|b| (b + i) as u8).collect();
        session.submit(
            InferRequest::new(id.clone(), deployment.model.name.clone())
                .with_input(Tensor::from_bytes(input_name.clone(), payload)),
        )?;
    }

    let results = session
        .collect(&ids, Some(Duration::from_millis(cli.timeout_ms)))
        .await?;

    for id in &ids {
        match results.get(id) {
            Some(Ok(responses)) => {
                let bytes: usize = responses
                    .iter()
                    .flat_map(|r| r.outputs())
                    .map(Tensor::byte_size)
                    .sum();
                info!(
                    "{}: {} response(s), {} byte(s), final on last: {}",
                    id,
                    responses.len(),
                    bytes,
                    responses.last().is_some_and(|r| r.is_final)
                );
            }
            Some(Err(e)) => error!("{}: {}", id, e),
            None => error!("{}: no result", id),
        }
    }

    println!("{}", serde_json::to_string_pretty(&session.stats())?);

    client.stop_stream().await?;
    server.shutdown().await?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    remotemedia_decoupled::init()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "RemoteMedia decoupled demo starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("remotemedia-decoupled")
        .enable_all()
        .build()?;

    runtime.block_on(run(cli)).map_err(|e| {
        error!("Demo failed: {:#}", e);
        e
    })
}
