use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use http::Method;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use super::{Patcher, PatcherState, PatcherUpdate, SingleKind, SingleMutation, SingleState, SingleTask};
use crate::client::Client;
use crate::contracts::{commit_logged, BoundStore, Controller};
use crate::error::{ModuleError, Result};
use crate::fetchable::{AbortSlot, ErrorTracking, FetchableMutation, QueryParams};
use crate::namespace::{Namespace, NamespaceError};
use crate::store::StoreProxy;

/// Facade over one single module's state and tasks.
pub struct SingleController {
    this: Weak<SingleController>,
    store: Arc<dyn StoreProxy<SingleKind>>,
    client: Arc<Client>,
    cancel: AbortSlot,
    fetch_gate: Mutex<()>,
    patchers: Mutex<HashMap<String, Arc<Patcher>>>,
}

impl fmt::Debug for SingleController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleController")
            .field("name", &self.store.name())
            .finish_non_exhaustive()
    }
}

impl SingleController {
    pub(crate) fn new(client: Arc<Client>, store: Arc<dyn StoreProxy<SingleKind>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            store,
            client,
            cancel: AbortSlot::new(),
            fetch_gate: Mutex::new(()),
            patchers: Mutex::new(HashMap::new()),
        })
    }

    fn bound(&self) -> BoundStore<'_, SingleKind> {
        BoundStore {
            proxy: self.store.as_ref(),
            client: &self.client,
            cancel: &self.cancel,
        }
    }

    fn mutate(&self, mutation: SingleMutation) {
        commit_logged(self.store.as_ref(), mutation);
    }

    pub(crate) fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn state(&self) -> SingleState {
        self.store.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.store.subscribe()
    }

    /// One top-level attribute of the state, by its serialized name.
    pub fn attr(&self, name: &str) -> Option<Value> {
        match serde_json::to_value(self.state()) {
            Ok(Value::Object(mut attrs)) => attrs.remove(name),
            _ => None,
        }
    }

    /// Raw mutation channel.
    pub fn commit(&self, mutation: SingleMutation) -> Result<(), ModuleError> {
        self.store.commit(mutation)
    }

    pub fn namespace(&self) -> Result<Namespace, NamespaceError> {
        Namespace::explode(self.store.name())
    }

    pub fn x(&self) -> Option<Value> {
        self.state().x
    }

    pub fn set_x(&self, x: Option<Value>) {
        self.mutate(SingleMutation::SetX(x));
    }

    /// Shallow-merges `partial` into the current value.
    pub fn update_x(&self, partial: Value) -> Result<(), ModuleError> {
        self.store.commit(SingleMutation::UpdateX(partial))
    }

    pub fn endpoint(&self) -> String {
        self.state().meta.endpoint
    }

    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        self.mutate(FetchableMutation::SetEndpoint(endpoint.into()).into());
    }

    pub fn ready(&self) -> bool {
        self.state().meta.ready
    }

    pub fn set_ready(&self, ready: bool) {
        self.mutate(FetchableMutation::SetReady(ready).into());
    }

    pub fn fetching(&self) -> bool {
        self.state().meta.fetching
    }

    pub fn failed(&self) -> bool {
        self.state().meta.failed
    }

    pub fn set_failed(&self, failed: bool) {
        self.mutate(FetchableMutation::SetFailed(failed).into());
    }

    pub fn deleted(&self) -> bool {
        self.state().deleted
    }

    pub fn params(&self) -> Option<QueryParams> {
        self.state().meta.params
    }

    pub fn set_params(&self, params: Option<QueryParams>) {
        self.mutate(FetchableMutation::SetParams(params).into());
    }

    pub fn errors(&self) -> ErrorTracking {
        self.state().meta.errors
    }

    pub fn set_errors(&self, errors: ErrorTracking) {
        self.mutate(FetchableMutation::SetErrors(errors).into());
    }

    pub fn reset_errors(&self) {
        self.mutate(FetchableMutation::ResetErrors.into());
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.mutate(FetchableMutation::SetPersistent(persistent).into());
    }

    /// Seeds a value and marks the module ready without fetching.
    pub fn make_ready(&self, x: Value) {
        self.mutate(SingleMutation::SetX(Some(x)));
        self.mutate(FetchableMutation::SetFetching(false).into());
        self.set_ready(true);
    }

    /// Cancels whatever network operation this module has in flight.
    pub fn kill(&self) {
        SingleKind::halt(&self.bound());
    }

    /// Fetches the value, superseding any operation already in flight.
    ///
    /// Resolves to `Ok(None)` if this fetch is itself superseded.
    pub async fn get(&self) -> Result<Option<Value>> {
        let token = {
            let _gate = self.fetch_gate.lock();
            SingleKind::begin_get(&self.bound())
        };
        SingleKind::finish_get(&self.bound(), token).await
    }

    /// Fetches only if nothing has been fetched, attempted, or started yet.
    /// Failures are recorded in state rather than returned.
    pub async fn get_once(&self) {
        let token = {
            let _gate = self.fetch_gate.lock();
            if self.state().meta.settled_or_busy() {
                return;
            }
            SingleKind::begin_get(&self.bound())
        };
        if let Err(error) = SingleKind::finish_get(&self.bound(), token).await {
            debug!(module = self.store.name(), %error, "get_once failed");
        }
    }

    pub async fn patch(&self, partial: Value) -> Result<Option<Value>> {
        SingleKind::replace(&self.bound(), Method::PATCH, partial).await
    }

    pub async fn put(&self, x: Value) -> Result<Option<Value>> {
        SingleKind::replace(&self.bound(), Method::PUT, x).await
    }

    pub async fn post(&self, data: Value) -> Result<Option<Value>> {
        SingleKind::post(&self.bound(), data).await
    }

    pub async fn delete(&self) -> Result<Option<Value>> {
        SingleKind::delete(&self.bound()).await
    }

    pub async fn dispatch(&self, task: SingleTask) -> Result<Option<Value>> {
        match task {
            SingleTask::Get => self.get().await,
            SingleTask::GetOnce => {
                self.get_once().await;
                Ok(self.x())
            }
            SingleTask::Patch(partial) => self.patch(partial).await,
            SingleTask::Put(x) => self.put(x).await,
            SingleTask::Post(data) => self.post(data).await,
            SingleTask::Delete => self.delete().await,
        }
    }

    /// The write buffer for `attr`, created on first use.
    pub fn patcher(&self, attr: &str) -> Arc<Patcher> {
        let mut patchers = self.patchers.lock();
        if let Some(patcher) = patchers.get(attr) {
            return Arc::clone(patcher);
        }
        self.mutate(SingleMutation::EnsurePatcher(attr.to_string()));
        let patcher = Patcher::new(
            attr.to_string(),
            self.this.clone(),
            self.client.config.patcher_debounce(),
        );
        patchers.insert(attr.to_string(), Arc::clone(&patcher));
        patcher
    }

    pub fn patcher_state(&self, attr: &str) -> PatcherState {
        self.state().patcher(attr)
    }

    pub(crate) fn set_patcher(&self, attr: &str, update: PatcherUpdate) {
        self.mutate(SingleMutation::SetPatcher {
            attr: attr.to_string(),
            update,
        });
    }
}

impl Controller for SingleController {
    fn name(&self) -> String {
        self.store.name().to_string()
    }

    fn persistent(&self) -> bool {
        self.state().meta.persistent
    }

    fn pre_destroy(&self) {
        self.cancel.kill();
        for patcher in self.patchers.lock().values() {
            patcher.cancel();
        }
    }
}
