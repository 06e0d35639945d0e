//! Debounced, per-attribute optimistic writes for single modules.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use http::Method;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use super::{PatcherState, PatcherUpdate, SingleController};
use crate::contracts::Controller;
use crate::fetchable::LOCAL_ENDPOINT;
use crate::transport::NetRequest;

/// Where a patcher is in its write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    Idle,
    /// A value is cached and waiting out the debounce.
    Pending,
    InFlight,
    /// The last write failed; the cached value is kept.
    Error,
}

struct PatcherRuntime {
    phase: WritePhase,
    pending: Option<CancellationToken>,
    in_flight: CancellationToken,
}

/// Write buffer for one attribute of a single module's value.
///
/// Edits land in a local cache immediately. After the debounce elapses with
/// no further edits, the cached value is sent as a partial update. Only the
/// newest write can settle: starting a write cancels the previous one.
pub struct Patcher {
    attr: String,
    controller: Weak<SingleController>,
    debounce: Duration,
    runtime: Mutex<PatcherRuntime>,
}

impl fmt::Debug for Patcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Patcher")
            .field("attr", &self.attr)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Patcher {
    pub(crate) fn new(
        attr: String,
        controller: Weak<SingleController>,
        debounce: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            attr,
            controller,
            debounce,
            runtime: Mutex::new(PatcherRuntime {
                phase: WritePhase::Idle,
                pending: None,
                in_flight: CancellationToken::new(),
            }),
        })
    }

    pub fn attr_name(&self) -> &str {
        &self.attr
    }

    pub fn phase(&self) -> WritePhase {
        self.runtime.lock().phase
    }

    fn set_phase(&self, phase: WritePhase) {
        self.runtime.lock().phase = phase;
    }

    fn controller(&self) -> Option<Arc<SingleController>> {
        self.controller.upgrade()
    }

    fn state(&self) -> PatcherState {
        self.controller()
            .map(|controller| controller.patcher_state(&self.attr))
            .unwrap_or_default()
    }

    fn update(&self, controller: &SingleController, update: PatcherUpdate) {
        controller.set_patcher(&self.attr, update);
    }

    /// The attribute's value in the module, ignoring any cached edit.
    pub fn raw_value(&self) -> Option<Value> {
        self.controller()?.x()?.get(&self.attr).cloned()
    }

    /// Whether the module holds a value containing this attribute.
    pub fn loaded(&self) -> bool {
        self.raw_value().is_some()
    }

    /// The cached edit while dirty, otherwise the module's value.
    pub fn model(&self) -> Option<Value> {
        let state = self.state();
        if state.dirty {
            return state.cached;
        }
        self.raw_value()
    }

    pub fn cached(&self) -> Option<Value> {
        self.state().cached
    }

    pub fn errors(&self) -> Vec<String> {
        self.state().errors
    }

    pub fn set_errors(&self, errors: Vec<String>) {
        if let Some(controller) = self.controller() {
            self.update(&controller, PatcherUpdate::Errors(errors));
        }
    }

    pub fn dirty(&self) -> bool {
        self.state().dirty
    }

    pub fn patching(&self) -> bool {
        self.state().patching
    }

    /// Caches `value` and schedules a debounced write.
    ///
    /// Setting the value the module already holds clears the dirty flag and
    /// drops any pending write. Must be called inside a Tokio runtime.
    pub fn set(self: &Arc<Self>, value: Value) {
        let Some(controller) = self.controller() else {
            tracing::warn!(attr = %self.attr, "Patcher outlived its module");
            return;
        };
        self.update(&controller, PatcherUpdate::Cached(Some(value.clone())));

        if self.raw_value().as_ref() == Some(&value) {
            self.update(&controller, PatcherUpdate::Dirty(false));
            let mut runtime = self.runtime.lock();
            if let Some(pending) = runtime.pending.take() {
                pending.cancel();
            }
            if runtime.phase == WritePhase::Pending {
                runtime.phase = WritePhase::Idle;
            }
            return;
        }

        self.update(&controller, PatcherUpdate::Dirty(true));
        self.schedule(value);
    }

    fn schedule(self: &Arc<Self>, value: Value) {
        let token = CancellationToken::new();
        {
            let mut runtime = self.runtime.lock();
            if let Some(previous) = runtime.pending.replace(token.clone()) {
                previous.cancel();
            }
            runtime.phase = WritePhase::Pending;
        }

        let patcher = Arc::clone(self);
        let delay = self.debounce;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    {
                        let mut runtime = patcher.runtime.lock();
                        if token.is_cancelled() {
                            return;
                        }
                        runtime.pending = None;
                    }
                    patcher.raw_set(value).await;
                }
            }
        });
    }

    /// Writes `value` immediately, bypassing the debounce.
    pub async fn raw_set(&self, value: Value) {
        let Some(controller) = self.controller() else {
            return;
        };
        if !self.loaded() {
            tracing::error!(
                module = %controller.name(),
                attr = %self.attr,
                "Cannot set an attribute that is absent from the module's value"
            );
            self.set_phase(WritePhase::Idle);
            return;
        }

        let token = {
            let mut runtime = self.runtime.lock();
            runtime.in_flight.cancel();
            runtime.in_flight = CancellationToken::new();
            runtime.phase = WritePhase::InFlight;
            runtime.in_flight.clone()
        };
        self.update(&controller, PatcherUpdate::Errors(Vec::new()));

        let mut data = Map::new();
        data.insert(self.attr.clone(), value);
        let data = Value::Object(data);

        let endpoint = controller.endpoint();
        if endpoint == LOCAL_ENDPOINT {
            if let Err(error) = controller.update_x(data) {
                tracing::error!(attr = %self.attr, %error, "Local write rejected");
            } else {
                self.update(&controller, PatcherUpdate::Dirty(false));
            }
            self.set_phase(WritePhase::Idle);
            return;
        }

        self.update(&controller, PatcherUpdate::Patching(true));
        let request = NetRequest::new(Method::PATCH, endpoint, token.clone()).with_data(data);
        let result = controller.client().transport.call(request).await;
        if token.is_cancelled() {
            return;
        }

        match result {
            Ok(response) => {
                let client = controller.client();
                let derived = client.derivers.derive_single(&response, &controller.state());
                if let Err(error) = controller.update_x(derived) {
                    tracing::error!(attr = %self.attr, %error, "Could not merge server response");
                }
                self.update(&controller, PatcherUpdate::Dirty(false));
                self.update(&controller, PatcherUpdate::Patching(false));
                self.set_phase(WritePhase::Idle);
            }
            Err(error) if error.is_cancelled() => {}
            Err(error) => {
                let set = controller
                    .client()
                    .derivers
                    .derive_errors(&error, std::slice::from_ref(&self.attr));
                let message = set
                    .fields
                    .get(&self.attr)
                    .and_then(|messages| messages.first())
                    .or_else(|| set.messages.first())
                    .cloned()
                    .unwrap_or_default();
                tracing::debug!(attr = %self.attr, status = %error.status_label(), "Write failed");
                self.update(&controller, PatcherUpdate::Errors(vec![message]));
                self.update(&controller, PatcherUpdate::Patching(false));
                self.set_phase(WritePhase::Error);
            }
        }
    }

    /// Drops the pending write and aborts the one in flight.
    pub fn cancel(&self) {
        let mut runtime = self.runtime.lock();
        if let Some(pending) = runtime.pending.take() {
            pending.cancel();
        }
        runtime.in_flight.cancel();
        runtime.in_flight = CancellationToken::new();
        runtime.phase = WritePhase::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespace::Namespace;
    use crate::registry::ListenerId;
    use crate::singles::SingleOptions;
    use crate::testing::{providence, MockTransport};
    use crate::transport::TransportError;
    use serde_json::json;

    fn single(root: &crate::Providence, endpoint: &str, x: Value) -> Arc<SingleController> {
        root.single(
            &Namespace::new(["user", "1"]).unwrap(),
            Some(SingleOptions::new().endpoint(endpoint).x(x).ready(true)),
            &ListenerId::new(),
        )
        .unwrap()
        .controller
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn debounced_edit_is_patched_and_merged() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(json!({"name": "Fox", "age": 3}));
        let root = providence(transport.clone());
        let single = single(&root, "/api/user/1/", json!({"name": "Wolf", "age": 3}));
        let patcher = single.patcher("name");

        patcher.set(json!("Fo"));
        patcher.set(json!("Fox"));
        assert!(patcher.dirty());
        assert_eq!(patcher.model(), Some(json!("Fox")));
        assert_eq!(patcher.raw_value(), Some(json!("Wolf")));
        assert_eq!(patcher.phase(), WritePhase::Pending);

        settle().await;

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, Method::PATCH);
        assert_eq!(requests[0].data, Some(json!({"name": "Fox"})));
        assert!(!patcher.dirty());
        assert!(!patcher.patching());
        assert_eq!(single.x(), Some(json!({"name": "Fox", "age": 3})));
        assert_eq!(patcher.phase(), WritePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn setting_the_upstream_value_sends_nothing() {
        let transport = Arc::new(MockTransport::new());
        let root = providence(transport.clone());
        let single = single(&root, "/api/user/1/", json!({"name": "Wolf"}));
        let patcher = single.patcher("name");

        patcher.set(json!("Wolf"));
        assert!(!patcher.dirty());
        settle().await;
        assert!(transport.requests().is_empty());

        // An edit reverted before the debounce elapses is also dropped.
        patcher.set(json!("Fox"));
        patcher.set(json!("Wolf"));
        assert!(!patcher.dirty());
        settle().await;
        assert!(transport.requests().is_empty());
        assert_eq!(patcher.phase(), WritePhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn local_endpoint_updates_in_place() {
        let transport = Arc::new(MockTransport::new());
        let root = providence(transport.clone());
        let single = single(&root, "#", json!({"count": 1}));
        let patcher = single.patcher("count");

        patcher.set(json!(2));
        settle().await;

        assert!(transport.requests().is_empty());
        assert_eq!(single.x(), Some(json!({"count": 2})));
        assert!(!patcher.dirty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_keeps_cache_and_reports_field_error() {
        let transport = Arc::new(MockTransport::new());
        transport.fail(TransportError::http(
            400,
            json!({"name": ["This field may not be blank."]}),
        ));
        let root = providence(transport.clone());
        let single = single(&root, "/api/user/1/", json!({"name": "Wolf"}));
        let patcher = single.patcher("name");

        patcher.set(json!(""));
        settle().await;

        assert_eq!(patcher.errors(), vec!["This field may not be blank.".to_string()]);
        assert!(patcher.dirty());
        assert!(!patcher.patching());
        assert_eq!(patcher.model(), Some(json!("")));
        assert_eq!(single.x(), Some(json!({"name": "Wolf"})));
        assert_eq!(patcher.phase(), WritePhase::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_write_supersedes_in_flight_one() {
        let transport = Arc::new(MockTransport::new());
        let _stalled = transport.gate();
        transport.respond(json!({"name": "Second"}));
        let root = providence(transport.clone());
        let single = single(&root, "/api/user/1/", json!({"name": "Wolf"}));
        let patcher = single.patcher("name");

        patcher.set(json!("First"));
        settle().await;
        assert!(patcher.patching());
        assert_eq!(patcher.phase(), WritePhase::InFlight);

        patcher.set(json!("Second"));
        settle().await;

        assert_eq!(transport.requests().len(), 2);
        assert_eq!(single.x(), Some(json!({"name": "Second"})));
        assert!(!patcher.patching());
        assert!(!patcher.dirty());
    }

    #[tokio::test]
    async fn absent_attribute_is_not_sent() {
        let transport = Arc::new(MockTransport::new());
        let root = providence(transport.clone());
        let single = single(&root, "/api/user/1/", json!({"name": "Wolf"}));
        let patcher = single.patcher("missing");

        patcher.raw_set(json!(1)).await;
        assert!(transport.requests().is_empty());
        assert!(!patcher.loaded());
    }
}
