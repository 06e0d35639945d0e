//! State and helpers shared by the network-backed module kinds.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::transport::TransportError;

/// Query parameters sent with fetches.
pub type QueryParams = BTreeMap<String, String>;

/// Endpoint that never hits the network; writes apply locally.
pub const LOCAL_ENDPOINT: &str = "#";

/// Status used when a failure carries neither a code nor an HTTP status.
pub const UNKNOWN_STATUS: &str = "UNKNOWN";

/// Normalized description of the last failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorTracking {
    pub status: String,
    pub messages: Vec<String>,
}

impl ErrorTracking {
    pub fn is_empty(&self) -> bool {
        self.status.is_empty() && self.messages.is_empty()
    }

    pub(crate) fn from_failure(error: &TransportError, messages: Vec<String>) -> Self {
        Self {
            status: error.status_label(),
            messages,
        }
    }
}

/// Fields every fetchable module carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchableState {
    pub name: String,
    pub endpoint: String,
    pub persistent: bool,
    pub ready: bool,
    pub fetching: bool,
    pub failed: bool,
    pub params: Option<QueryParams>,
    pub errors: ErrorTracking,
}

impl FetchableState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: LOCAL_ENDPOINT.to_string(),
            persistent: false,
            ready: false,
            fetching: false,
            failed: false,
            params: None,
            errors: ErrorTracking::default(),
        }
    }

    /// Whether a fetch is running or has already settled one way or the other.
    pub fn settled_or_busy(&self) -> bool {
        self.fetching || self.ready || self.failed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchableMutation {
    SetEndpoint(String),
    SetPersistent(bool),
    SetReady(bool),
    SetFetching(bool),
    SetFailed(bool),
    SetParams(Option<QueryParams>),
    SetErrors(ErrorTracking),
    ResetErrors,
}

impl FetchableMutation {
    pub fn apply(self, state: &mut FetchableState) {
        match self {
            FetchableMutation::SetEndpoint(endpoint) => state.endpoint = endpoint,
            FetchableMutation::SetPersistent(persistent) => state.persistent = persistent,
            FetchableMutation::SetReady(ready) => state.ready = ready,
            FetchableMutation::SetFetching(fetching) => state.fetching = fetching,
            FetchableMutation::SetFailed(failed) => state.failed = failed,
            FetchableMutation::SetParams(params) => state.params = params,
            FetchableMutation::SetErrors(errors) => state.errors = errors,
            FetchableMutation::ResetErrors => state.errors = ErrorTracking::default(),
        }
    }
}

/// The cancellation signal for a module's current network operation.
///
/// `kill` cancels whatever is in flight and installs a fresh token, so at most
/// one operation per module is ever live. The replaced token is dropped once
/// its operation observes the cancellation.
#[derive(Debug, Default)]
pub struct AbortSlot {
    token: Mutex<CancellationToken>,
}

impl AbortSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    /// Cancels the live token and returns its replacement.
    pub fn kill(&self) -> CancellationToken {
        let mut token = self.token.lock();
        token.cancel();
        *token = CancellationToken::new();
        token.clone()
    }

    /// Like [`AbortSlot::kill`], running `record` before the slot is released
    /// so the state it writes cannot interleave with another `kill_then`.
    pub fn kill_then(&self, record: impl FnOnce()) -> CancellationToken {
        let mut token = self.token.lock();
        token.cancel();
        *token = CancellationToken::new();
        record();
        token.clone()
    }
}
