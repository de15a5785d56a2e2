//! Correlation table: request id → responses collected so far
//!
//! Entries are created when a request is submitted and removed when the
//! caller takes a finished entry, so finished requests never pile up. Every
//! response that cannot be attributed to an open entry is reported as a
//! protocol violation rather than dropped.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::data::{InferResponse, RequestId};
use crate::error::ResponseError;
use crate::{Error, Result};

/// Why an entry was resolved without a final response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The session was closed by the caller
    SessionClosed,
    /// The stream to the backend was lost
    Disconnected(String),
}

/// Completion state of an entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// Waiting for more responses
    Open,
    /// Final response observed
    Complete,
    /// Error response observed
    Failed(ResponseError),
    /// Resolved by the session
    Aborted(AbortReason),
}

impl EntryState {
    /// Whether no more responses are expected
    pub fn is_done(&self) -> bool {
        !matches!(self, EntryState::Open)
    }
}

/// Result of routing one response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Appended; more responses expected
    Appended,
    /// Request finished successfully
    Completed,
    /// Request finished with an error response
    Failed,
    /// Response could not be attributed; the description says why
    Violation(String),
    /// Response was kept but its sequence number was not the expected one
    OutOfSequence {
        /// What was expected and what arrived
        detail: String,
        /// Whether this response also finished the request
        finished: bool,
    },
}

/// Finished entry handed back to the caller
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// All responses, the last one final
    Complete(Vec<InferResponse>),
    /// Stream ended with an error response (included as the last item)
    Failed {
        /// Backend error
        error: ResponseError,
        /// Every response received
        responses: Vec<InferResponse>,
    },
    /// Resolved by the session before a final response arrived
    Aborted {
        /// Why
        reason: AbortReason,
        /// Responses received before the abort
        responses: Vec<InferResponse>,
    },
}

#[derive(Debug)]
struct Entry {
    responses: Vec<InferResponse>,
    state: EntryState,
    next_sequence: u64,
    notify: Arc<Notify>,
}

impl Entry {
    fn new() -> Self {
        Self {
            responses: Vec::new(),
            state: EntryState::Open,
            next_sequence: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn finish(&mut self, state: EntryState) {
        self.state = state;
        self.notify.notify_waiters();
    }
}

/// Request id → accumulated responses and completion state
///
/// Not synchronized itself; the session keeps it behind a mutex.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    entries: HashMap<RequestId, Entry>,
}

impl CorrelationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for a newly submitted request
    ///
    /// # Errors
    ///
    /// * `Error::InvalidRequest` - The id is already present (open or not yet drained)
    pub fn register(&mut self, id: &str) -> Result<()> {
        if self.entries.contains_key(id) {
            return Err(Error::InvalidRequest(format!(
                "request id '{}' is already in flight",
                id
            )));
        }
        self.entries.insert(id.to_string(), Entry::new());
        Ok(())
    }

    /// Remove an entry that never reached the backend
    pub fn unregister(&mut self, id: &str) {
        self.entries.remove(id);
    }

    /// Route one response to its entry
    ///
    /// A bare final marker following a successful response is folded into
    /// that response, so a finished sequence always ends with exactly one
    /// final item. Error responses finish the entry whether or not they are
    /// flagged final.
    pub fn route(&mut self, response: InferResponse) -> RouteOutcome {
        let Some(entry) = self.entries.get_mut(&response.request_id) else {
            return RouteOutcome::Violation(format!(
                "response for unknown request id '{}' (sequence {})",
                response.request_id, response.sequence
            ));
        };

        if entry.state.is_done() {
            return RouteOutcome::Violation(format!(
                "response for request '{}' after it finished (sequence {})",
                response.request_id, response.sequence
            ));
        }

        let request_id = response.request_id.clone();
        let received = response.sequence;
        let expected = entry.next_sequence;
        entry.next_sequence = received + 1;

        let error = response.error_detail().cloned();
        let outcome = if let Some(error) = error {
            entry.responses.push(response);
            entry.finish(EntryState::Failed(error));
            RouteOutcome::Failed
        } else if response.is_final {
            if !response.is_bare_final() {
                entry.responses.push(response);
            } else if let Some(last) = entry.responses.last_mut() {
                last.is_final = true;
            } else {
                entry.responses.push(response);
            }
            entry.finish(EntryState::Complete);
            RouteOutcome::Completed
        } else {
            entry.responses.push(response);
            RouteOutcome::Appended
        };

        if received != expected {
            return RouteOutcome::OutOfSequence {
                detail: format!(
                    "request '{}' expected sequence {} but received {}",
                    request_id, expected, received
                ),
                finished: outcome != RouteOutcome::Appended,
            };
        }

        outcome
    }

    /// Whether the id has an entry that is still waiting for responses
    pub fn is_open(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| e.state == EntryState::Open)
    }

    /// Whether the id has an entry at all
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// State of an entry
    pub fn state(&self, id: &str) -> Option<&EntryState> {
        self.entries.get(id).map(|e| &e.state)
    }

    /// Responses received so far for an entry
    pub fn responses(&self, id: &str) -> Option<&[InferResponse]> {
        self.entries.get(id).map(|e| e.responses.as_slice())
    }

    /// Wake-up handle that fires when the entry finishes
    pub fn waiter(&self, id: &str) -> Option<Arc<Notify>> {
        self.entries.get(id).map(|e| Arc::clone(&e.notify))
    }

    /// Remove and return the entry if it is finished
    ///
    /// Returns `None` both for unknown ids and for entries still open; use
    /// `contains` to tell them apart.
    pub fn take_finished(&mut self, id: &str) -> Option<Completion> {
        if !self.entries.get(id)?.state.is_done() {
            return None;
        }
        let entry = self.entries.remove(id)?;
        Some(match entry.state {
            EntryState::Complete | EntryState::Open => Completion::Complete(entry.responses),
            EntryState::Failed(error) => Completion::Failed {
                error,
                responses: entry.responses,
            },
            EntryState::Aborted(reason) => Completion::Aborted {
                reason,
                responses: entry.responses,
            },
        })
    }

    /// Resolve every open entry; returns how many were open
    pub fn abort_all(&mut self, reason: AbortReason) -> usize {
        let mut aborted = 0;
        for entry in self.entries.values_mut() {
            if entry.state == EntryState::Open {
                entry.finish(EntryState::Aborted(reason.clone()));
                aborted += 1;
            }
        }
        aborted
    }

    /// Ids of entries still waiting for responses
    pub fn open_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Open)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Number of entries, finished or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Tensor;
    use crate::error::ResponseErrorKind;

    fn chunk(id: &str, seq: u64, byte: u8) -> InferResponse {
        InferResponse::chunk(id, "m", seq, vec![Tensor::from_bytes("OUT", vec![byte; 10])])
    }

    #[test]
    fn test_duplicate_register_rejected_without_corruption() {
        let mut table = CorrelationTable::new();
        table.register("a").unwrap();
        assert_eq!(table.route(chunk("a", 0, 1)), RouteOutcome::Appended);

        assert!(matches!(table.register("a"), Err(Error::InvalidRequest(_))));
        assert_eq!(table.responses("a").map(<[_]>::len), Some(1));
        assert!(table.is_open("a"));
    }

    #[test]
    fn test_bare_final_folds_into_last_chunk() {
        let mut table = CorrelationTable::new();
        table.register("req0").unwrap();
        for seq in 0..3 {
            assert_eq!(table.route(chunk("req0", seq, seq as u8)), RouteOutcome::Appended);
        }
        assert_eq!(
            table.route(InferResponse::final_marker("req0", "m", 3)),
            RouteOutcome::Completed
        );

        match table.take_finished("req0") {
            Some(Completion::Complete(responses)) => {
                assert_eq!(responses.len(), 3);
                assert!(responses[2].is_final);
                assert!(responses[..2].iter().all(|r| !r.is_final));
            }
            other => panic!("unexpected completion: {:?}", other),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn test_final_marker_alone_is_kept() {
        let mut table = CorrelationTable::new();
        table.register("empty").unwrap();
        table.route(InferResponse::final_marker("empty", "m", 0));

        match table.take_finished("empty") {
            Some(Completion::Complete(responses)) => {
                assert_eq!(responses.len(), 1);
                assert!(responses[0].is_bare_final());
            }
            other => panic!("unexpected completion: {:?}", other),
        }
    }

    #[test]
    fn test_error_response_finishes_entry_with_partials() {
        let mut table = CorrelationTable::new();
        table.register("a").unwrap();
        table.route(chunk("a", 0, 1));
        table.route(chunk("a", 1, 2));
        let error = ResponseError::new(ResponseErrorKind::ProducerFailure, "decode failed");
        assert_eq!(
            table.route(InferResponse::error("a", "m", 2, error.clone())),
            RouteOutcome::Failed
        );

        match table.take_finished("a") {
            Some(Completion::Failed { error: e, responses }) => {
                assert_eq!(e, error);
                assert_eq!(responses.len(), 3);
                assert!(responses[2].is_error());
            }
            other => panic!("unexpected completion: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_late_responses_are_violations() {
        let mut table = CorrelationTable::new();
        assert!(matches!(
            table.route(chunk("ghost", 0, 0)),
            RouteOutcome::Violation(_)
        ));

        table.register("a").unwrap();
        table.route(InferResponse::final_marker("a", "m", 0));
        assert!(matches!(
            table.route(chunk("a", 1, 0)),
            RouteOutcome::Violation(_)
        ));
        // Still drainable after the late response
        assert!(matches!(
            table.take_finished("a"),
            Some(Completion::Complete(_))
        ));
    }

    #[test]
    fn test_sequence_gap_reported_but_kept() {
        let mut table = CorrelationTable::new();
        table.register("a").unwrap();
        table.route(chunk("a", 0, 0));
        assert!(matches!(
            table.route(chunk("a", 2, 0)),
            RouteOutcome::OutOfSequence { finished: false, .. }
        ));
        assert_eq!(table.responses("a").map(<[_]>::len), Some(2));
        assert_eq!(table.route(chunk("a", 3, 0)), RouteOutcome::Appended);
    }

    #[test]
    fn test_final_with_sequence_gap_still_finishes() {
        let mut table = CorrelationTable::new();
        table.register("a").unwrap();
        table.route(chunk("a", 0, 0));
        assert!(matches!(
            table.route(InferResponse::final_marker("a", "m", 5)),
            RouteOutcome::OutOfSequence { finished: true, .. }
        ));
        assert!(matches!(
            table.take_finished("a"),
            Some(Completion::Complete(_))
        ));
    }

    #[test]
    fn test_take_open_entry_returns_none() {
        let mut table = CorrelationTable::new();
        table.register("a").unwrap();
        assert!(table.take_finished("a").is_none());
        assert!(table.contains("a"));
        assert!(table.take_finished("missing").is_none());
    }

    #[test]
    fn test_abort_all_only_touches_open_entries() {
        let mut table = CorrelationTable::new();
        table.register("done").unwrap();
        table.route(InferResponse::final_marker("done", "m", 0));
        table.register("b").unwrap();
        table.register("c").unwrap();
        assert_eq!(table.open_ids(), vec!["b".to_string(), "c".to_string()]);

        assert_eq!(table.abort_all(AbortReason::SessionClosed), 2);
        assert!(matches!(
            table.take_finished("done"),
            Some(Completion::Complete(_))
        ));
        assert!(matches!(
            table.take_finished("b"),
            Some(Completion::Aborted {
                reason: AbortReason::SessionClosed,
                ..
            })
        ));
        assert!(table.open_ids().is_empty());
    }
}
