//! Client side of the decoupled streaming protocol
//!
//! One logical call yields an unbounded, ordered sequence of responses. The
//! client multiplexes many such calls over a single stream:
//!
//! - [`StreamSession`] owns the stream and the background tasks
//! - [`CorrelationTable`] groups responses by request id
//! - [`response_queue`] hands inbound items from the transport to the dispatcher
//! - [`InferenceClient`] manages the start/stop lifecycle of one session
//! - [`RetryExecutor`] retries connection establishment with backoff

pub mod correlation;
pub mod inference_client;
pub mod queue;
pub mod retry;
pub mod session;

pub use correlation::{AbortReason, Completion, CorrelationTable, EntryState, RouteOutcome};
pub use inference_client::InferenceClient;
pub use queue::{response_queue, Delivery, QueueReader, QueueWriter};
pub use retry::RetryExecutor;
pub use session::{SessionState, SessionStats, StatsSnapshot, StreamSession};
