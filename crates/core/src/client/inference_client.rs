//! Inference client owning at most one stream at a time

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use super::session::StreamSession;
use crate::config::SessionConfig;
use crate::data::{InferRequest, InferResponse};
use crate::transport::Connector;
use crate::{Error, Result};

/// Client bound to one endpoint
///
/// `start_stream` opens a `StreamSession`; a second `start_stream` fails
/// until `stop_stream` is called. A stream that failed on its own may be
/// replaced without stopping it first.
pub struct InferenceClient {
    connector: Arc<dyn Connector>,
    endpoint: String,
    config: SessionConfig,
    stream: Mutex<Option<Arc<StreamSession>>>,
}

impl InferenceClient {
    /// Create a client; no connection is made until `start_stream`
    pub fn new(
        connector: Arc<dyn Connector>,
        endpoint: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        Self {
            connector,
            endpoint: endpoint.into(),
            config,
            stream: Mutex::new(None),
        }
    }

    /// Endpoint this client connects to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Open the stream
    ///
    /// # Errors
    ///
    /// * `Error::InvalidState` - A stream is already active
    /// * `Error::Connection` - Endpoint unreachable after all attempts
    pub async fn start_stream(&self) -> Result<Arc<StreamSession>> {
        let mut slot = self.stream.lock().await;

        if let Some(existing) = slot.as_ref() {
            if existing.is_active() {
                return Err(Error::InvalidState(format!(
                    "stream {} to {} is already open",
                    existing.session_id(),
                    self.endpoint
                )));
            }
            // Failed stream: release its tasks before replacing it
            existing.close().await?;
        }

        let session = Arc::new(
            StreamSession::open(self.connector.as_ref(), &self.endpoint, self.config.clone())
                .await?,
        );
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Close the stream if one is open; a no-op otherwise
    pub async fn stop_stream(&self) -> Result<()> {
        let session = self.stream.lock().await.take();
        match session {
            Some(session) => {
                info!("Stopping stream {}", session.session_id());
                session.close().await
            }
            None => Ok(()),
        }
    }

    /// The current stream
    ///
    /// # Errors
    ///
    /// * `Error::InvalidState` - `start_stream` has not been called
    pub async fn stream(&self) -> Result<Arc<StreamSession>> {
        self.stream
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::InvalidState("no stream started".into()))
    }

    /// Submit one request on the current stream and wait for all of its responses
    pub async fn infer(
        &self,
        request: InferRequest,
        timeout: Option<Duration>,
    ) -> Result<Vec<InferResponse>> {
        self.stream().await?.infer(request, timeout).await
    }
}
