//! Single-entity modules: one JSON value fetched from and written to one endpoint.

mod controller;
mod patcher;

pub use controller::SingleController;
pub use patcher::{Patcher, WritePhase};

use std::collections::BTreeMap;
use std::sync::Arc;

use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Client;
use crate::contracts::{BoundStore, BuildContext, ModuleKind};
use crate::error::{ModuleError, Result};
use crate::fetchable::{ErrorTracking, FetchableMutation, FetchableState, QueryParams};
use crate::registry::Registry;
use crate::runtime::Providence;
use crate::store::{Store, StoreProxy};
use crate::transport::{NetRequest, NetResponse, TransportError};

/// Per-attribute write-buffer state kept in the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatcherState {
    pub cached: Option<Value>,
    pub errors: Vec<String>,
    pub dirty: bool,
    pub patching: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatcherUpdate {
    Cached(Option<Value>),
    Errors(Vec<String>),
    Dirty(bool),
    Patching(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleState {
    #[serde(flatten)]
    pub meta: FetchableState,
    pub x: Option<Value>,
    pub deleted: bool,
    pub patchers: BTreeMap<String, PatcherState>,
}

impl SingleState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: FetchableState::new(name),
            x: None,
            deleted: false,
            patchers: BTreeMap::new(),
        }
    }

    pub fn patcher(&self, attr: &str) -> PatcherState {
        self.patchers.get(attr).cloned().unwrap_or_default()
    }
}

/// Construction options for a single module.
#[derive(Debug, Clone, Default)]
pub struct SingleOptions {
    pub endpoint: Option<String>,
    pub x: Option<Value>,
    pub persistent: bool,
    pub ready: bool,
    pub params: Option<QueryParams>,
}

impl SingleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn x(mut self, x: Value) -> Self {
        self.x = Some(x);
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn params(mut self, params: QueryParams) -> Self {
        self.params = Some(params);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SingleMutation {
    Fetchable(FetchableMutation),
    /// Replaces the value. `Null` is stored as absent.
    SetX(Option<Value>),
    /// Shallow-merges an object into the current value.
    UpdateX(Value),
    SetDeleted(bool),
    EnsurePatcher(String),
    SetPatcher { attr: String, update: PatcherUpdate },
}

impl From<FetchableMutation> for SingleMutation {
    fn from(value: FetchableMutation) -> Self {
        SingleMutation::Fetchable(value)
    }
}

/// Network operations a single module can run.
#[derive(Debug, Clone, PartialEq)]
pub enum SingleTask {
    Get,
    GetOnce,
    Patch(Value),
    Put(Value),
    Post(Value),
    Delete,
}

pub struct SingleKind;

impl ModuleKind for SingleKind {
    const KIND: &'static str = "single";

    type Options = SingleOptions;
    type State = SingleState;
    type Mutation = SingleMutation;
    type Controller = SingleController;

    fn build_state(_client: &Client, name: String, options: SingleOptions) -> SingleState {
        let mut state = SingleState::new(name);
        if let Some(endpoint) = options.endpoint {
            state.meta.endpoint = endpoint;
        }
        state.meta.persistent = options.persistent;
        state.meta.ready = options.ready;
        state.meta.params = options.params;
        ensure_patchers(&mut state.patchers, options.x.as_ref());
        state.x = options.x.filter(|x| !x.is_null());
        state
    }

    fn apply(state: &mut SingleState, mutation: SingleMutation) -> Result<(), ModuleError> {
        match mutation {
            SingleMutation::Fetchable(mutation) => mutation.apply(&mut state.meta),
            SingleMutation::SetX(x) => {
                let x = x.filter(|x| !x.is_null());
                ensure_patchers(&mut state.patchers, x.as_ref());
                state.x = x;
            }
            SingleMutation::UpdateX(partial) => {
                let Value::Object(partial) = partial else {
                    return Err(ModuleError::NotAnObject {
                        name: state.meta.name.clone(),
                    });
                };
                match state.x.as_mut() {
                    Some(Value::Object(target)) => {
                        for (key, value) in partial {
                            state.patchers.entry(key.clone()).or_default();
                            target.insert(key, value);
                        }
                    }
                    Some(_) => {
                        return Err(ModuleError::NotAnObject {
                            name: state.meta.name.clone(),
                        })
                    }
                    None => {
                        return Err(ModuleError::NullTarget {
                            name: state.meta.name.clone(),
                        })
                    }
                }
            }
            SingleMutation::SetDeleted(deleted) => state.deleted = deleted,
            SingleMutation::EnsurePatcher(attr) => {
                state.patchers.entry(attr).or_default();
            }
            SingleMutation::SetPatcher { attr, update } => {
                let patcher = state.patchers.entry(attr).or_default();
                match update {
                    PatcherUpdate::Cached(cached) => patcher.cached = cached,
                    PatcherUpdate::Errors(errors) => patcher.errors = errors,
                    PatcherUpdate::Dirty(dirty) => patcher.dirty = dirty,
                    PatcherUpdate::Patching(patching) => patcher.patching = patching,
                }
            }
        }
        Ok(())
    }

    fn build_controller(
        ctx: &BuildContext<'_>,
        proxy: Arc<dyn StoreProxy<Self>>,
    ) -> Arc<SingleController> {
        SingleController::new(Arc::clone(ctx.client), proxy)
    }

    fn registry(root: &Providence) -> &Registry<SingleController> {
        root.singles().registry()
    }

    fn store(root: &Providence) -> &Arc<dyn Store<Self>> {
        root.singles().store()
    }
}

fn ensure_patchers(patchers: &mut BTreeMap<String, PatcherState>, x: Option<&Value>) {
    if let Some(Value::Object(map)) = x {
        for key in map.keys() {
            patchers.entry(key.clone()).or_default();
        }
    }
}

// Task bodies. Each runs against a bound store; controllers serialize access
// where needed and delegate here.
impl SingleKind {
    pub(crate) fn begin_get(bound: &BoundStore<'_, Self>) -> CancellationToken {
        bound.cancel.kill_then(|| {
            bound.apply(FetchableMutation::SetFetching(true).into());
            bound.apply(FetchableMutation::ResetErrors.into());
        })
    }

    /// Cancels the operation in flight. A fetch cut short this way leaves
    /// nothing behind to clear `fetching`, so it is cleared here.
    pub(crate) fn halt(bound: &BoundStore<'_, Self>) -> CancellationToken {
        bound
            .cancel
            .kill_then(|| bound.apply(FetchableMutation::SetFetching(false).into()))
    }

    pub(crate) async fn finish_get(
        bound: &BoundStore<'_, Self>,
        token: CancellationToken,
    ) -> Result<Option<Value>> {
        let state = bound.state();
        let request = NetRequest::new(Method::GET, state.meta.endpoint.clone(), token.clone())
            .with_params(state.meta.params.clone());
        let result = bound.client.transport.call(request).await;
        if token.is_cancelled() {
            debug!(module = %state.meta.name, "Fetch superseded");
            return Ok(None);
        }
        match result {
            Ok(response) => {
                let value = bound
                    .client
                    .derivers
                    .derive_single(&response, &bound.state());
                bound.apply(SingleMutation::SetX(Some(value.clone())));
                bound.apply(FetchableMutation::SetReady(true).into());
                bound.apply(FetchableMutation::SetFailed(false).into());
                bound.apply(FetchableMutation::SetFetching(false).into());
                Ok(Some(value))
            }
            Err(error) if error.is_cancelled() => {
                bound.apply(FetchableMutation::SetFetching(false).into());
                Ok(None)
            }
            Err(error) => {
                Self::record_failure(bound, &error);
                Err(error.into())
            }
        }
    }

    fn record_failure(bound: &BoundStore<'_, Self>, error: &TransportError) {
        let set = bound.client.derivers.derive_errors(error, &[]);
        debug!(
            module = bound.proxy.name(),
            status = %error.status_label(),
            "Fetch failed"
        );
        bound.apply(FetchableMutation::SetReady(false).into());
        bound.apply(FetchableMutation::SetFetching(false).into());
        bound.apply(FetchableMutation::SetFailed(true).into());
        bound.apply(FetchableMutation::SetErrors(ErrorTracking::from_failure(error, set.messages)).into());
    }

    /// Sends a write. `None` means the call was superseded or cancelled.
    async fn send(
        bound: &BoundStore<'_, Self>,
        method: Method,
        data: Option<Value>,
    ) -> Result<Option<NetResponse>> {
        let token = Self::halt(bound);
        let mut request = NetRequest::new(method, bound.state().meta.endpoint, token.clone());
        request.data = data;
        let result = bound.client.transport.call(request).await;
        if token.is_cancelled() {
            return Ok(None);
        }
        match result {
            Ok(response) => Ok(Some(response)),
            Err(error) if error.is_cancelled() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// PATCH or PUT, replacing the local value with the server's answer.
    pub(crate) async fn replace(
        bound: &BoundStore<'_, Self>,
        method: Method,
        data: Value,
    ) -> Result<Option<Value>> {
        let Some(response) = Self::send(bound, method, Some(data)).await? else {
            return Ok(None);
        };
        let value = bound
            .client
            .derivers
            .derive_single(&response, &bound.state());
        bound.apply(SingleMutation::SetX(Some(value.clone())));
        Ok(Some(value))
    }

    pub(crate) async fn delete(bound: &BoundStore<'_, Self>) -> Result<Option<Value>> {
        if Self::send(bound, Method::DELETE, None).await?.is_none() {
            return Ok(None);
        }
        bound.apply(SingleMutation::SetDeleted(true));
        bound.apply(FetchableMutation::SetReady(false).into());
        bound.apply(SingleMutation::SetX(None));
        Ok(None)
    }

    /// POST to the endpoint without touching the local value.
    pub(crate) async fn post(bound: &BoundStore<'_, Self>, data: Value) -> Result<Option<Value>> {
        Ok(Self::send(bound, Method::POST, Some(data))
            .await?
            .map(|response| response.data))
    }
}
