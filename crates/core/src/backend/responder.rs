//! Decoupled responder
//!
//! Backend half of the protocol. For each request the responder opens a
//! producer, emits one response per produced chunk as soon as it is ready,
//! and terminates the sequence with exactly one final item. The number of
//! responses is not known up front.
//!
//! # Lifecycle
//!
//! - `DecoupledResponder::new` checks the model configuration once and
//!   refuses anything that is not decoupled
//! - `execute` handles one batch of requests
//! - dropping the responder releases it

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::producer::{ChunkProducer, ProducerFactory};
use crate::config::ModelConfig;
use crate::data::{InferRequest, InferResponse, RequestId, Tensor};
use crate::error::{ResponseError, ResponseErrorKind};
use crate::transport::ServerMessage;
use crate::{Error, Result};

/// Cooperative cancellation flag checked between chunks
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both handles refer to the same flag
    pub fn is_same(&self, other: &CancelFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Emits the response sequence of one request
///
/// Assigns sequence numbers and refuses to send anything once a final or
/// error response went out.
pub struct ResponseSender {
    request_id: RequestId,
    model_name: String,
    tx: mpsc::Sender<ServerMessage>,
    next_sequence: u64,
    finished: bool,
}

impl ResponseSender {
    /// Sender for `request_id` writing into `tx`
    pub fn new(
        request_id: impl Into<RequestId>,
        model_name: impl Into<String>,
        tx: mpsc::Sender<ServerMessage>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            model_name: model_name.into(),
            tx,
            next_sequence: 0,
            finished: false,
        }
    }

    /// Request this sender belongs to
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Responses sent so far
    pub fn sent(&self) -> u64 {
        self.next_sequence
    }

    /// Whether the terminal response was sent
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Intermediate response
    pub async fn send(&mut self, outputs: Vec<Tensor>) -> Result<()> {
        self.emit(|id, model, seq| InferResponse::chunk(id, model, seq, outputs))
            .await
    }

    /// Last chunk, carrying the final flag
    pub async fn send_last(&mut self, outputs: Vec<Tensor>) -> Result<()> {
        self.emit(|id, model, seq| InferResponse {
            is_final: true,
            ..InferResponse::chunk(id, model, seq, outputs)
        })
        .await
    }

    /// Flag-only final marker
    pub async fn send_final(&mut self) -> Result<()> {
        self.emit(InferResponse::final_marker).await
    }

    /// Error response; ends the sequence
    pub async fn send_error(&mut self, error: ResponseError) -> Result<()> {
        self.emit(|id, model, seq| InferResponse::error(id, model, seq, error))
            .await
    }

    async fn emit<F>(&mut self, build: F) -> Result<()>
    where
        F: FnOnce(RequestId, String, u64) -> InferResponse,
    {
        if self.finished {
            return Err(Error::ProtocolViolation(format!(
                "request '{}' already sent its final response",
                self.request_id
            )));
        }

        let response = build(
            self.request_id.clone(),
            self.model_name.clone(),
            self.next_sequence,
        );
        let is_final = response.is_final;

        self.tx
            .send(ServerMessage::Response(response))
            .await
            .map_err(|_| Error::Transport("response channel closed".into()))?;

        self.next_sequence += 1;
        self.finished = is_final;
        Ok(())
    }
}

/// Backend responder for a decoupled model
pub struct DecoupledResponder {
    config: ModelConfig,
    factory: Arc<dyn ProducerFactory>,
}

impl std::fmt::Debug for DecoupledResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoupledResponder")
            .field("model", &self.config.name)
            .finish()
    }
}

impl DecoupledResponder {
    /// Create a responder for `config`
    ///
    /// # Errors
    ///
    /// * `Error::ConfigError` - The model is not decoupled or declares no outputs
    pub fn new(config: ModelConfig, factory: Arc<dyn ProducerFactory>) -> Result<Self> {
        if !config.is_decoupled() {
            return Err(Error::ConfigError(format!(
                "model '{}' must set model_transaction_policy.decoupled = true \
                 to emit a variable number of responses per request",
                config.name
            )));
        }
        if config.output.is_empty() {
            return Err(Error::ConfigError(format!(
                "model '{}' declares no outputs",
                config.name
            )));
        }
        if config.max_batch_size > 1 {
            return Err(Error::ConfigError(format!(
                "model '{}' sets max_batch_size = {}; decoupled execution takes one request at a time",
                config.name, config.max_batch_size
            )));
        }

        info!(
            "Initialized decoupled responder for model '{}' ({} output(s), final on last chunk: {})",
            config.name,
            config.output.len(),
            config.attach_final_to_last_chunk
        );
        Ok(Self { config, factory })
    }

    /// Model configuration this responder serves
    pub fn model_config(&self) -> &ModelConfig {
        &self.config
    }

    /// Handle one batch of requests
    ///
    /// Every request gets a complete response sequence, even when it is
    /// rejected. Only a closed response channel is reported as `Err`.
    pub async fn execute(
        &self,
        requests: Vec<InferRequest>,
        responses: &mpsc::Sender<ServerMessage>,
        cancel: &CancelFlag,
    ) -> Result<()> {
        if requests.len() > 1 {
            warn!(
                "Model '{}' received a batch of {} requests, rejecting",
                self.config.name,
                requests.len()
            );
            let error = ResponseError::from_error(&Error::UnsupportedBatch(requests.len()));
            for request in &requests {
                ResponseSender::new(&request.id, &self.config.name, responses.clone())
                    .send_error(error.clone())
                    .await?;
            }
            return Ok(());
        }

        for request in requests {
            self.execute_one(request, responses, cancel).await?;
        }
        Ok(())
    }

    async fn execute_one(
        &self,
        request: InferRequest,
        responses: &mpsc::Sender<ServerMessage>,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let mut sender = ResponseSender::new(&request.id, &self.config.name, responses.clone());

        if let Err(e) = self.check_request(&request) {
            warn!("Rejecting request '{}': {}", request.id, e);
            return sender.send_error(ResponseError::from_error(&e)).await;
        }

        let mut producer = match self.factory.open(&request).await {
            Ok(producer) => producer,
            Err(e) => {
                warn!("Failed to open producer for '{}': {}", request.id, e);
                let kind = match e {
                    Error::InvalidRequest(_) => ResponseErrorKind::InvalidRequest,
                    _ => ResponseErrorKind::ProducerFailure,
                };
                return sender.send_error(ResponseError::new(kind, e.to_string())).await;
            }
        };

        debug!("Executing request '{}' on '{}'", request.id, self.config.name);
        let result = self
            .pump(&request, producer.as_mut(), &mut sender, cancel)
            .await;

        if let Err(e) = producer.close().await {
            warn!("Failed to release producer for '{}': {}", request.id, e);
        }
        result
    }

    async fn pump(
        &self,
        request: &InferRequest,
        producer: &mut dyn ChunkProducer,
        sender: &mut ResponseSender,
        cancel: &CancelFlag,
    ) -> Result<()> {
        let attach_final = self.config.attach_final_to_last_chunk;
        // One chunk of lookahead when the final flag rides on the last chunk
        let mut pending: Option<Vec<Tensor>> = None;

        loop {
            if cancel.is_cancelled() {
                if let Some(outputs) = pending.take() {
                    sender.send(outputs).await?;
                }
                info!(
                    "Request '{}' cancelled after {} response(s)",
                    request.id,
                    sender.sent()
                );
                return sender
                    .send_error(ResponseError::new(
                        ResponseErrorKind::Cancelled,
                        "cancelled by client",
                    ))
                    .await;
            }

            match producer.next_chunk().await {
                Ok(Some(chunk)) => {
                    let outputs = filter_outputs(request, chunk);
                    if attach_final {
                        if let Some(previous) = pending.replace(outputs) {
                            sender.send(previous).await?;
                        }
                    } else {
                        sender.send(outputs).await?;
                    }
                }
                Ok(None) => {
                    match pending.take() {
                        Some(last) => sender.send_last(last).await?,
                        None => sender.send_final().await?,
                    }
                    debug!(
                        "Request '{}' finished with {} response(s)",
                        request.id,
                        sender.sent()
                    );
                    return Ok(());
                }
                Err(e) => {
                    if let Some(outputs) = pending.take() {
                        sender.send(outputs).await?;
                    }
                    warn!(
                        "Producer for '{}' failed after {} response(s): {}",
                        request.id,
                        sender.sent(),
                        e
                    );
                    return sender
                        .send_error(ResponseError::new(
                            ResponseErrorKind::ProducerFailure,
                            e.to_string(),
                        ))
                        .await;
                }
            }
        }
    }

    fn check_request(&self, request: &InferRequest) -> Result<()> {
        request.validate()?;

        if request.model_name != self.config.name {
            return Err(Error::InvalidRequest(format!(
                "request addresses model '{}', this backend serves '{}'",
                request.model_name, self.config.name
            )));
        }

        if let Some(unknown) = request
            .requested_outputs
            .iter()
            .find(|name| self.config.output_config(name).is_none())
        {
            return Err(Error::InvalidRequest(format!(
                "model '{}' has no output named '{}'",
                self.config.name, unknown
            )));
        }
        Ok(())
    }
}

impl Drop for DecoupledResponder {
    fn drop(&mut self) {
        debug!("Finalizing responder for model '{}'", self.config.name);
    }
}

fn filter_outputs(request: &InferRequest, mut outputs: Vec<Tensor>) -> Vec<Tensor> {
    outputs.retain(|t| request.wants_output(&t.name));
    outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::producers::ByteChunkFactory;
    use crate::config::TransactionPolicy;

    fn model() -> ModelConfig {
        ModelConfig::decoupled("decoder", "IN", "OUT")
    }

    fn responder(config: ModelConfig) -> DecoupledResponder {
        DecoupledResponder::new(config, Arc::new(ByteChunkFactory::new("IN", "OUT", 10))).unwrap()
    }

    fn request(id: &str, len: usize) -> InferRequest {
        InferRequest::new(id, "decoder").with_input(Tensor::from_bytes("IN", vec![3u8; len]))
    }

    async fn collect(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<InferResponse> {
        let mut out = Vec::new();
        while let Ok(ServerMessage::Response(r)) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    #[test]
    fn test_non_decoupled_model_refused() {
        let config = ModelConfig {
            model_transaction_policy: TransactionPolicy { decoupled: false },
            ..model()
        };
        let err = DecoupledResponder::new(config, Arc::new(ByteChunkFactory::new("IN", "OUT", 1)))
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_model_without_outputs_refused() {
        let config = ModelConfig {
            output: Vec::new(),
            ..model()
        };
        assert!(DecoupledResponder::new(config, Arc::new(ByteChunkFactory::new("IN", "OUT", 1)))
            .is_err());
    }

    #[test]
    fn test_batching_model_refused() {
        let factory = Arc::new(ByteChunkFactory::new("IN", "OUT", 1));
        let batching = ModelConfig {
            max_batch_size: 4,
            ..model()
        };
        match DecoupledResponder::new(batching, factory.clone()) {
            Err(Error::ConfigError(message)) => assert!(message.contains("max_batch_size")),
            other => panic!("expected ConfigError, got {:?}", other.map(|_| ())),
        }

        let single = ModelConfig {
            max_batch_size: 1,
            ..model()
        };
        assert!(DecoupledResponder::new(single, factory).is_ok());
    }

    #[tokio::test]
    async fn test_chunks_then_bare_final() {
        let responder = responder(model());
        let (tx, mut rx) = mpsc::channel(16);
        responder
            .execute(vec![request("req0", 30)], &tx, &CancelFlag::new())
            .await
            .unwrap();

        let responses = collect(&mut rx).await;
        assert_eq!(responses.len(), 4);
        assert!(responses[..3].iter().all(|r| !r.is_final && r.outputs().len() == 1));
        assert!(responses[3].is_bare_final());
        assert_eq!(
            responses.iter().map(|r| r.sequence).collect::<Vec<_>>(),
            vec![0, 1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_final_attached_to_last_chunk() {
        let config = ModelConfig {
            attach_final_to_last_chunk: true,
            ..model()
        };
        let responder = responder(config);
        let (tx, mut rx) = mpsc::channel(16);
        responder
            .execute(vec![request("req0", 30)], &tx, &CancelFlag::new())
            .await
            .unwrap();

        let responses = collect(&mut rx).await;
        assert_eq!(responses.len(), 3);
        assert_eq!(responses.iter().filter(|r| r.is_final).count(), 1);
        assert!(responses[2].is_final);
        assert_eq!(responses[2].outputs().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_rejected_per_request() {
        let responder = responder(model());
        let (tx, mut rx) = mpsc::channel(16);
        responder
            .execute(
                vec![request("a", 10), request("b", 10)],
                &tx,
                &CancelFlag::new(),
            )
            .await
            .unwrap();

        let responses = collect(&mut rx).await;
        assert_eq!(responses.len(), 2);
        for response in &responses {
            assert!(response.is_final);
            assert_eq!(
                response.error_detail().map(|e| e.kind),
                Some(ResponseErrorKind::UnsupportedBatch)
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_output_and_wrong_model_rejected() {
        let responder = responder(model());
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancelFlag::new();

        responder
            .execute(vec![request("a", 10).with_requested_output("MISSING")], &tx, &cancel)
            .await
            .unwrap();
        let mut other = request("b", 10);
        other.model_name = "encoder".into();
        responder.execute(vec![other], &tx, &cancel).await.unwrap();

        let responses = collect(&mut rx).await;
        assert_eq!(responses.len(), 2);
        assert!(responses
            .iter()
            .all(|r| r.error_detail().map(|e| e.kind) == Some(ResponseErrorKind::InvalidRequest)));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_chunk() {
        let responder = responder(model());
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancelFlag::new();
        cancel.cancel();

        responder
            .execute(vec![request("a", 100)], &tx, &cancel)
            .await
            .unwrap();
        let responses = collect(&mut rx).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(
            responses[0].error_detail().map(|e| e.kind),
            Some(ResponseErrorKind::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_sender_refuses_after_final() {
        let (tx, _rx) = mpsc::channel(4);
        let mut sender = ResponseSender::new("a", "decoder", tx);
        sender.send(Vec::new()).await.unwrap();
        sender.send_final().await.unwrap();
        assert!(sender.is_finished());
        assert!(matches!(
            sender.send(Vec::new()).await,
            Err(Error::ProtocolViolation(_))
        ));
        assert_eq!(sender.sent(), 2);
    }

    #[tokio::test]
    async fn test_closed_channel_reported() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let responder = responder(model());
        assert!(matches!(
            responder
                .execute(vec![request("a", 10)], &tx, &CancelFlag::new())
                .await,
            Err(Error::Transport(_))
        ));
    }
}
