//! Client-side stream session
//!
//! A `StreamSession` owns one bidirectional stream to a backend and
//! multiplexes any number of in-flight requests over it.
//!
//! # Tasks
//!
//! ```text
//!  submit() ──> outbound channel ──> writer task ──> MessageSink
//!
//!  MessageSource ──> delivery task ──> ResponseQueue ──> dispatcher task
//!                                                           │
//!                                                           ▼
//!  drain()/collect() <── Notify ──────────────────── CorrelationTable
//! ```
//!
//! `submit` never waits on I/O. `drain` is the only place a caller waits,
//! and it waits on a per-request notification rather than polling.

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::correlation::{AbortReason, Completion, CorrelationTable, RouteOutcome};
use super::queue::{response_queue, Delivery, QueueReader, QueueWriter};
use super::retry::RetryExecutor;
use crate::config::SessionConfig;
use crate::data::{InferRequest, InferResponse, RequestId};
use crate::transport::{
    ClientMessage, ClientStream, Connector, MessageSink, MessageSource, ServerMessage,
};
use crate::{Error, Result};

/// Lifecycle state of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Accepting submissions
    Open,
    /// Closed by the caller
    Closed,
    /// Stream lost; the reason is kept for error reporting
    Failed(String),
}

/// Counters for everything the session observes
#[derive(Debug, Default)]
pub struct SessionStats {
    connect_attempts: AtomicU64,
    submitted: AtomicU64,
    responses_received: AtomicU64,
    error_responses: AtomicU64,
    requests_finished: AtomicU64,
    cancels_sent: AtomicU64,
    protocol_violations: AtomicU64,
    dropped_after_close: AtomicU64,
}

/// Point-in-time copy of `SessionStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Connection attempts made by `open`, including the successful one
    pub connect_attempts: u64,
    /// Requests accepted by `submit`
    pub submitted: u64,
    /// Responses routed into the correlation table
    pub responses_received: u64,
    /// Routed responses that carried an error
    pub error_responses: u64,
    /// Requests whose final or error response was routed
    pub requests_finished: u64,
    /// Cancel messages sent
    pub cancels_sent: u64,
    /// Responses that could not be correlated
    pub protocol_violations: u64,
    /// Items discarded because they arrived after close
    pub dropped_after_close: u64,
    /// Largest response queue depth observed
    pub queue_high_water: usize,
}

impl SessionStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self, queue_high_water: usize) -> StatsSnapshot {
        StatsSnapshot {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            submitted: self.submitted.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            error_responses: self.error_responses.load(Ordering::Relaxed),
            requests_finished: self.requests_finished.load(Ordering::Relaxed),
            cancels_sent: self.cancels_sent.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
            dropped_after_close: self.dropped_after_close.load(Ordering::Relaxed),
            queue_high_water,
        }
    }
}

/// Table and lifecycle state share one lock so that a submit can never
/// register an entry after close has aborted the table.
struct Guarded {
    table: CorrelationTable,
    state: SessionState,
}

/// State shared with the background tasks
struct SessionShared {
    session_id: String,
    endpoint: String,
    guarded: Mutex<Guarded>,
    stats: SessionStats,
    violations: Mutex<Vec<String>>,
}

impl SessionShared {
    fn is_open(&self) -> bool {
        self.guarded.lock().state == SessionState::Open
    }

    /// Route one item popped from the response queue
    fn dispatch(&self, item: Delivery) {
        match item {
            Delivery::Response(response) => {
                let mut guarded = self.guarded.lock();
                if guarded.state != SessionState::Open {
                    SessionStats::bump(&self.stats.dropped_after_close);
                    debug!(
                        "Session {} dropping response for '{}' delivered after close",
                        self.session_id, response.request_id
                    );
                    return;
                }

                SessionStats::bump(&self.stats.responses_received);
                if response.is_error() {
                    SessionStats::bump(&self.stats.error_responses);
                }
                trace!(
                    "Session {} routing response {} of '{}' (final={})",
                    self.session_id,
                    response.sequence,
                    response.request_id,
                    response.is_final
                );

                match guarded.table.route(response) {
                    RouteOutcome::Appended => {}
                    RouteOutcome::Completed | RouteOutcome::Failed => {
                        SessionStats::bump(&self.stats.requests_finished);
                    }
                    RouteOutcome::Violation(detail) => {
                        drop(guarded);
                        self.record_violation(detail);
                    }
                    RouteOutcome::OutOfSequence { detail, finished } => {
                        drop(guarded);
                        if finished {
                            SessionStats::bump(&self.stats.requests_finished);
                        }
                        self.record_violation(detail);
                    }
                }
            }
            Delivery::TransportError(reason) => self.fail(reason),
        }
    }

    fn record_violation(&self, detail: String) {
        SessionStats::bump(&self.stats.protocol_violations);
        warn!("Session {} protocol violation: {}", self.session_id, detail);
        self.violations.lock().push(detail);
    }

    /// Session-fatal transport failure: every open request fails
    fn fail(&self, reason: String) {
        let mut guarded = self.guarded.lock();
        if guarded.state != SessionState::Open {
            SessionStats::bump(&self.stats.dropped_after_close);
            debug!(
                "Session {} ignoring transport error after close: {}",
                self.session_id, reason
            );
            return;
        }
        guarded.state = SessionState::Failed(reason.clone());
        let aborted = guarded
            .table
            .abort_all(AbortReason::Disconnected(reason.clone()));
        error!(
            "Session {} to {} failed ({} open request(s) aborted): {}",
            self.session_id, self.endpoint, aborted, reason
        );
    }

    fn state_error(&self, state: &SessionState) -> Error {
        match state {
            SessionState::Failed(reason) => Error::connection(&self.endpoint, reason.clone()),
            _ => Error::SessionClosed(self.session_id.clone()),
        }
    }
}

/// Bidirectional stream to one backend, multiplexing many requests
///
/// All methods take `&self`; wrap the session in an `Arc` to share it
/// between tasks.
///
/// # Example
///
/// ```ignore
/// let session = StreamSession::open(&hub, "local://decoder", SessionConfig::default()).await?;
/// session.submit(request)?;
/// let responses = session.drain("req0", Some(Duration::from_secs(5))).await?;
/// session.close().await?;
/// ```
pub struct StreamSession {
    shared: Arc<SessionShared>,
    config: SessionConfig,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
    queue: QueueWriter,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StreamSession {
    /// Connect to `endpoint` and start the background tasks
    ///
    /// Connection attempts are retried according to `config.connect_retry`.
    ///
    /// # Errors
    ///
    /// * `Error::Connection` - Endpoint unreachable after all attempts
    /// * `Error::ConfigError` - Invalid session configuration
    pub async fn open(
        connector: &dyn Connector,
        endpoint: &str,
        config: SessionConfig,
    ) -> Result<Self> {
        config.validate()?;

        let mut attempts = 0u64;
        let stream = RetryExecutor::new(config.connect_retry.clone())
            .execute(|| connector.connect(endpoint), |_| attempts += 1)
            .await?;

        let session = Self::from_stream(stream, endpoint, config);
        session
            .shared
            .stats
            .connect_attempts
            .store(attempts, Ordering::Relaxed);
        Ok(session)
    }

    /// Start a session over an already established stream
    pub fn from_stream(stream: ClientStream, endpoint: &str, config: SessionConfig) -> Self {
        let session_id = format!("session-{}", Uuid::new_v4());
        let shared = Arc::new(SessionShared {
            session_id: session_id.clone(),
            endpoint: endpoint.to_string(),
            guarded: Mutex::new(Guarded {
                table: CorrelationTable::new(),
                state: SessionState::Open,
            }),
            stats: SessionStats::default(),
            violations: Mutex::new(Vec::new()),
        });

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (queue, reader) = response_queue(config.queue_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ClientStream { sink, source } = stream;
        let tasks = vec![
            tokio::spawn(run_writer(
                session_id.clone(),
                sink,
                outbound_rx,
                queue.clone(),
            )),
            tokio::spawn(run_delivery(
                Arc::clone(&shared),
                source,
                queue.clone(),
                shutdown_rx.clone(),
            )),
            tokio::spawn(run_dispatcher(Arc::clone(&shared), reader, shutdown_rx)),
        ];

        info!(
            "Session {} opened to {} (queue capacity: {:?})",
            session_id, endpoint, config.queue_capacity
        );

        Self {
            shared,
            config,
            outbound: Mutex::new(Some(outbound_tx)),
            queue,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        }
    }

    /// Unique identifier of this session
    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    /// Endpoint this session is connected to
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        self.shared.guarded.lock().state.clone()
    }

    /// Whether the session accepts submissions
    pub fn is_active(&self) -> bool {
        self.shared.is_open()
    }

    /// Queue a request for transmission
    ///
    /// Returns as soon as the request is registered and queued; the writer
    /// task performs the I/O.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidRequest` - Malformed request, or its id is already in flight
    /// * `Error::SessionClosed` - Session was closed
    /// * `Error::Connection` - Stream was lost
    pub fn submit(&self, request: InferRequest) -> Result<()> {
        request.validate()?;

        let outbound = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| Error::SessionClosed(self.shared.session_id.clone()))?;

        {
            let mut guarded = self.shared.guarded.lock();
            if guarded.state != SessionState::Open {
                return Err(self.shared.state_error(&guarded.state));
            }
            guarded.table.register(&request.id)?;
        }

        let request_id = request.id.clone();
        if outbound.send(ClientMessage::Infer(request)).is_err() {
            self.shared.guarded.lock().table.unregister(&request_id);
            return Err(Error::connection(
                &self.shared.endpoint,
                "writer task stopped",
            ));
        }

        SessionStats::bump(&self.shared.stats.submitted);
        debug!(
            "Session {} submitted request '{}'",
            self.shared.session_id, request_id
        );
        Ok(())
    }

    /// Push one inbound item onto the response queue
    ///
    /// Called by the delivery task for every item read from the transport;
    /// exposed for transports that push items themselves. Waits only when
    /// the queue is bounded and full.
    pub async fn on_delivery(&self, item: Delivery) -> Result<()> {
        if !self.shared.is_open() {
            return Err(self.shared.state_error(&self.state()));
        }
        self.queue.push(item).await
    }

    /// Wait for a request to finish and return its responses
    ///
    /// The entry is retired when this returns a result. `timeout = None`
    /// falls back to `config.request_timeout_ms`; if that is unset too the
    /// call waits until the request finishes or the session ends. A timeout
    /// leaves the entry open so the call can be retried.
    ///
    /// # Errors
    ///
    /// * `Error::Timeout` - Request still open when the timeout elapsed
    /// * `Error::RequestFailed` - Response stream ended with an error
    /// * `Error::SessionClosed` - Session closed before the request finished
    /// * `Error::Connection` - Stream lost before the request finished
    /// * `Error::InvalidRequest` - Id unknown or already drained
    pub async fn drain(
        &self,
        request_id: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<InferResponse>> {
        let completion = match timeout.or_else(|| self.config.request_timeout()) {
            Some(limit) => tokio::time::timeout(limit, self.wait_finished(request_id))
                .await
                .map_err(|_| Error::Timeout {
                    timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    request_ids: vec![request_id.to_string()],
                })??,
            None => self.wait_finished(request_id).await?,
        };
        self.resolve(request_id, completion)
    }

    /// Submit a request and wait for all of its responses
    pub async fn infer(
        &self,
        request: InferRequest,
        timeout: Option<Duration>,
    ) -> Result<Vec<InferResponse>> {
        let request_id = request.id.clone();
        self.submit(request)?;
        self.drain(&request_id, timeout).await
    }

    /// Wait for several requests under one overall deadline
    ///
    /// Each request resolves independently: a request that ended in an error
    /// response maps to its own `Err`, as does one drained elsewhere while
    /// this call waited. Session-fatal errors and the deadline fail the whole
    /// call; the timeout error names every request still open.
    ///
    /// # Errors
    ///
    /// * `Error::InvalidRequest` - An id is unknown or listed twice
    pub async fn collect(
        &self,
        request_ids: &[RequestId],
        timeout: Option<Duration>,
    ) -> Result<HashMap<RequestId, Result<Vec<InferResponse>>>> {
        let mut seen = HashSet::with_capacity(request_ids.len());
        if let Some(duplicate) = request_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(Error::InvalidRequest(format!(
                "request '{}' listed more than once",
                duplicate
            )));
        }

        {
            let guarded = self.shared.guarded.lock();
            if let Some(unknown) = request_ids.iter().find(|id| !guarded.table.contains(id)) {
                return Err(Error::InvalidRequest(format!(
                    "request '{}' is not outstanding",
                    unknown
                )));
            }
        }

        let limit = timeout.or_else(|| self.config.request_timeout());
        let deadline = limit.map(|l| tokio::time::Instant::now() + l);
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expired);

        let mut waits: FuturesUnordered<_> = request_ids
            .iter()
            .map(|id| async move { (id.clone(), self.wait_finished(id).await) })
            .collect();
        let mut results = HashMap::with_capacity(request_ids.len());

        while !waits.is_empty() {
            tokio::select! {
                Some((id, completion)) = waits.next() => {
                    match completion.and_then(|c| self.resolve(&id, c)) {
                        Err(e) if e.is_session_fatal() => return Err(e),
                        resolved => {
                            results.insert(id, resolved);
                        }
                    }
                }
                _ = &mut expired => {
                    let mut still_open: Vec<RequestId> = request_ids
                        .iter()
                        .filter(|id| !results.contains_key(*id))
                        .cloned()
                        .collect();
                    still_open.sort();
                    warn!(
                        "Session {} collect timed out with {} request(s) open",
                        self.shared.session_id,
                        still_open.len()
                    );
                    return Err(Error::Timeout {
                        timeout_ms: limit
                            .map(|l| u64::try_from(l.as_millis()).unwrap_or(u64::MAX))
                            .unwrap_or_default(),
                        request_ids: still_open,
                    });
                }
            }
        }

        Ok(results)
    }

    /// Ask the backend to stop producing responses for a request
    ///
    /// The request stays open until the backend's terminal response arrives.
    pub fn cancel(&self, request_id: &str) -> Result<()> {
        if !self.shared.guarded.lock().table.is_open(request_id) {
            return Err(Error::InvalidRequest(format!(
                "request '{}' is not open",
                request_id
            )));
        }

        let outbound = self
            .outbound
            .lock()
            .clone()
            .ok_or_else(|| Error::SessionClosed(self.shared.session_id.clone()))?;
        outbound
            .send(ClientMessage::Cancel {
                request_id: request_id.to_string(),
            })
            .map_err(|_| Error::connection(&self.shared.endpoint, "writer task stopped"))?;

        SessionStats::bump(&self.shared.stats.cancels_sent);
        info!(
            "Session {} sent cancel for '{}'",
            self.shared.session_id, request_id
        );
        Ok(())
    }

    /// Ids of requests still waiting for responses
    pub fn open_requests(&self) -> Vec<RequestId> {
        self.shared.guarded.lock().table.open_ids()
    }

    /// Descriptions of every protocol violation observed so far
    pub fn protocol_violations(&self) -> Vec<String> {
        self.shared.violations.lock().clone()
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot(self.queue.high_water_mark())
    }

    /// Close the stream
    ///
    /// Every open request resolves with `Error::SessionClosed`. Items that
    /// arrive afterwards are counted and discarded. Calling `close` again is
    /// a no-op.
    pub async fn close(&self) -> Result<()> {
        {
            let mut guarded = self.shared.guarded.lock();
            if guarded.state == SessionState::Open {
                guarded.state = SessionState::Closed;
                let aborted = guarded.table.abort_all(AbortReason::SessionClosed);
                info!(
                    "Session {} closing ({} open request(s) aborted)",
                    self.shared.session_id, aborted
                );
            }
        }

        // Dropping the sender lets the writer flush and close the sink
        self.outbound.lock().take();
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        if handles.is_empty() {
            return Ok(());
        }

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let limit = Duration::from_millis(self.config.close_timeout_ms);
        if tokio::time::timeout(limit, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(
                "Session {} background tasks did not stop within {}ms, aborting",
                self.shared.session_id, self.config.close_timeout_ms
            );
            for abort in aborts {
                abort.abort();
            }
        }

        info!("Session {} closed", self.shared.session_id);
        Ok(())
    }

    async fn wait_finished(&self, request_id: &str) -> Result<Completion> {
        loop {
            let notify = {
                let mut guarded = self.shared.guarded.lock();
                if let Some(completion) = guarded.table.take_finished(request_id) {
                    return Ok(completion);
                }
                guarded.table.waiter(request_id).ok_or_else(|| {
                    Error::InvalidRequest(format!("request '{}' is not outstanding", request_id))
                })?
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-check: the entry may have finished before the waiter was enabled
            {
                let mut guarded = self.shared.guarded.lock();
                if let Some(completion) = guarded.table.take_finished(request_id) {
                    return Ok(completion);
                }
                if !guarded.table.contains(request_id) {
                    return Err(Error::InvalidRequest(format!(
                        "request '{}' is not outstanding",
                        request_id
                    )));
                }
            }

            notified.await;
        }
    }

    fn resolve(&self, request_id: &str, completion: Completion) -> Result<Vec<InferResponse>> {
        match completion {
            Completion::Complete(responses) => Ok(responses),
            Completion::Failed { error, responses } => Err(Error::RequestFailed {
                request_id: request_id.to_string(),
                source: error,
                responses,
            }),
            Completion::Aborted {
                reason: AbortReason::SessionClosed,
                ..
            } => Err(Error::SessionClosed(self.shared.session_id.clone())),
            Completion::Aborted {
                reason: AbortReason::Disconnected(reason),
                ..
            } => Err(Error::connection(&self.shared.endpoint, reason)),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if self.shared.is_open() {
            debug!(
                "Session {} dropped without close, stopping background tasks",
                self.shared.session_id
            );
            let mut guarded = self.shared.guarded.lock();
            guarded.state = SessionState::Closed;
            guarded.table.abort_all(AbortReason::SessionClosed);
        }
        let _ = self.shutdown_tx.send(true);
    }
}

/// Forward queued submissions to the transport
async fn run_writer(
    session_id: String,
    mut sink: Box<dyn MessageSink<ClientMessage>>,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    queue: QueueWriter,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = sink.send(message).await {
            error!("Session {} failed to send: {}", session_id, e);
            let _ = queue
                .push(Delivery::TransportError(format!("send failed: {}", e)))
                .await;
            return;
        }
    }

    if let Err(e) = sink.close().await {
        debug!("Session {} sink close failed: {}", session_id, e);
    }
    debug!("Session {} writer finished", session_id);
}

/// Read every inbound item and push it onto the response queue
async fn run_delivery(
    shared: Arc<SessionShared>,
    mut source: Box<dyn MessageSource<ServerMessage>>,
    queue: QueueWriter,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            item = source.recv() => item,
        };

        let delivery = match item {
            Some(Ok(ServerMessage::Response(response))) => Delivery::Response(response),
            Some(Ok(ServerMessage::StreamError { message })) => Delivery::TransportError(message),
            Some(Err(e)) => Delivery::TransportError(e.to_string()),
            None => {
                if shared.is_open() {
                    let _ = queue
                        .push(Delivery::TransportError("stream closed by backend".into()))
                        .await;
                }
                break;
            }
        };

        if queue.push(delivery).await.is_err() {
            break;
        }
    }
    debug!("Session {} delivery finished", shared.session_id);
}

/// Pop the response queue and route every item
async fn run_dispatcher(
    shared: Arc<SessionShared>,
    mut reader: QueueReader,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            item = reader.pop() => item,
        };
        match item {
            Some(item) => shared.dispatch(item),
            None => break,
        }
    }

    // Anything still queued arrived after close
    while let Some(item) = reader.try_pop() {
        shared.dispatch(item);
    }
    debug!("Session {} dispatcher finished", shared.session_id);
}
