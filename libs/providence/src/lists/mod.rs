//! Collection modules: an ordered set of references to single modules.

mod controller;
mod reconcile;

pub use controller::ListController;

use std::sync::Arc;

use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Client;
use crate::contracts::{BoundStore, BuildContext, ModuleKind};
use crate::derivers::unknown_errors;
use crate::error::{ModuleError, Result};
use crate::fetchable::{ErrorTracking, FetchableMutation, FetchableState, QueryParams};
use crate::paginator::PageInfo;
use crate::registry::Registry;
use crate::runtime::{Providence, SingleScope};
use crate::store::{Store, StoreProxy};
use crate::transport::NetRequest;

use reconcile::{add_modules, merge_refs, release_abandoned};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListState {
    #[serde(flatten)]
    pub meta: FetchableState,
    /// Flattened names of the child single modules, in display order.
    pub refs: Vec<String>,
    pub page_info: Option<PageInfo>,
    /// Append fetched pages instead of replacing the list.
    pub grow: bool,
    /// Reverse each fetched page, and prepend it when growing.
    pub reverse: bool,
    pub paginated: bool,
    /// Attribute of each entry that identifies it.
    pub key_prop: String,
}

impl ListState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            meta: FetchableState::new(name),
            refs: Vec::new(),
            page_info: None,
            grow: false,
            reverse: false,
            paginated: true,
            key_prop: "id".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ListOptions {
    pub endpoint: Option<String>,
    pub persistent: bool,
    pub grow: bool,
    pub reverse: bool,
    pub paginated: bool,
    pub key_prop: Option<String>,
    pub params: Option<QueryParams>,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            persistent: false,
            grow: false,
            reverse: false,
            paginated: true,
            key_prop: None,
            params: None,
        }
    }
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn grow(mut self, grow: bool) -> Self {
        self.grow = grow;
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn paginated(mut self, paginated: bool) -> Self {
        self.paginated = paginated;
        self
    }

    pub fn key_prop(mut self, key_prop: impl Into<String>) -> Self {
        self.key_prop = Some(key_prop.into());
        self
    }

    pub fn params(mut self, params: QueryParams) -> Self {
        self.params = Some(params);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListMutation {
    Fetchable(FetchableMutation),
    SetRefs(Vec<String>),
    SetPageInfo(Option<PageInfo>),
    SetGrow(bool),
}

impl From<FetchableMutation> for ListMutation {
    fn from(value: FetchableMutation) -> Self {
        ListMutation::Fetchable(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListTask {
    Get,
    GetOnce,
    SetList(Vec<Value>),
    Prefix(Vec<Value>),
    Extend(Vec<Value>),
    Post(Value),
    MakeReady(Vec<Value>),
}

pub struct ListKind;

impl ModuleKind for ListKind {
    const KIND: &'static str = "list";

    type Options = ListOptions;
    type State = ListState;
    type Mutation = ListMutation;
    type Controller = ListController;

    fn build_state(client: &Client, name: String, options: ListOptions) -> ListState {
        let mut state = ListState::new(name);
        if let Some(endpoint) = options.endpoint {
            state.meta.endpoint = endpoint;
        }
        if let Some(key_prop) = options.key_prop {
            state.key_prop = key_prop;
        }
        state.meta.persistent = options.persistent;
        state.meta.params = options.params;
        state.grow = options.grow;
        state.reverse = options.reverse;
        state.paginated = options.paginated;
        if state.paginated {
            client.paginator.initialize(&mut state);
        }
        state
    }

    fn apply(state: &mut ListState, mutation: ListMutation) -> Result<(), ModuleError> {
        match mutation {
            ListMutation::Fetchable(mutation) => mutation.apply(&mut state.meta),
            ListMutation::SetRefs(refs) => state.refs = refs,
            ListMutation::SetPageInfo(page_info) => state.page_info = page_info,
            ListMutation::SetGrow(grow) => state.grow = grow,
        }
        Ok(())
    }

    fn build_controller(
        ctx: &BuildContext<'_>,
        proxy: Arc<dyn StoreProxy<Self>>,
    ) -> Arc<ListController> {
        ListController::new(Arc::clone(ctx.client), ctx.singles.clone(), proxy)
    }

    fn registry(root: &Providence) -> &Registry<ListController> {
        root.lists()
    }

    fn store(root: &Providence) -> &Arc<dyn Store<Self>> {
        root.list_store()
    }
}

impl ListKind {
    /// Replaces the list's children, releasing the ones no longer present.
    pub(crate) fn set_list(
        bound: &BoundStore<'_, Self>,
        singles: &SingleScope,
        entries: &[Value],
    ) -> Result<()> {
        let state = bound.state();
        let refs = add_modules(&state, singles, entries)?;
        release_abandoned(&state, &refs, singles);
        bound.apply(ListMutation::SetRefs(merge_refs(&refs, &[])));
        Ok(())
    }

    pub(crate) fn prefix(
        bound: &BoundStore<'_, Self>,
        singles: &SingleScope,
        entries: &[Value],
    ) -> Result<()> {
        let state = bound.state();
        let refs = add_modules(&state, singles, entries)?;
        bound.apply(ListMutation::SetRefs(merge_refs(&refs, &state.refs)));
        Ok(())
    }

    pub(crate) fn extend(
        bound: &BoundStore<'_, Self>,
        singles: &SingleScope,
        entries: &[Value],
    ) -> Result<()> {
        let state = bound.state();
        let refs = add_modules(&state, singles, entries)?;
        bound.apply(ListMutation::SetRefs(merge_refs(&state.refs, &refs)));
        Ok(())
    }

    pub(crate) fn make_ready(
        bound: &BoundStore<'_, Self>,
        singles: &SingleScope,
        entries: &[Value],
    ) -> Result<()> {
        Self::set_list(bound, singles, entries)?;
        bound.apply(FetchableMutation::SetFetching(false).into());
        bound.apply(FetchableMutation::SetReady(true).into());
        Ok(())
    }

    pub(crate) fn begin_get(bound: &BoundStore<'_, Self>) -> CancellationToken {
        bound.cancel.kill_then(|| {
            bound.apply(FetchableMutation::SetFetching(true).into());
            bound.apply(FetchableMutation::ResetErrors.into());
        })
    }

    /// Cancels the operation in flight and clears `fetching` with it.
    pub(crate) fn halt(bound: &BoundStore<'_, Self>) -> CancellationToken {
        bound
            .cancel
            .kill_then(|| bound.apply(FetchableMutation::SetFetching(false).into()))
    }

    pub(crate) async fn finish_get(
        bound: &BoundStore<'_, Self>,
        singles: &SingleScope,
        token: CancellationToken,
    ) -> Result<Option<Vec<Value>>> {
        let state = bound.state();
        let request = NetRequest::new(Method::GET, state.meta.endpoint.clone(), token.clone())
            .with_params(state.meta.params.clone());
        let result = bound.client.transport.call(request).await;
        if token.is_cancelled() {
            debug!(module = %state.meta.name, "Fetch superseded");
            return Ok(None);
        }

        let response = match result {
            Ok(response) => response,
            Err(error) if error.is_cancelled() => {
                bound.apply(FetchableMutation::SetFetching(false).into());
                return Ok(None);
            }
            Err(error) => {
                let set = bound.client.derivers.derive_errors(&error, &[]);
                Self::record_failure(bound, ErrorTracking::from_failure(&error, set.messages));
                return Err(error.into());
            }
        };

        let derived = match bound.client.derivers.derive_list(&response, &state) {
            Ok(derived) => derived,
            Err(error) => {
                Self::record_failure(bound, unknown_errors(error.to_string()));
                return Err(error.into());
            }
        };

        let mut list = derived.list;
        if state.reverse {
            list.reverse();
        }
        let reconciled = match (state.grow, state.reverse) {
            (true, true) => Self::prefix(bound, singles, &list),
            (true, false) => Self::extend(bound, singles, &list),
            (false, _) => Self::set_list(bound, singles, &list),
        };
        if let Err(error) = reconciled {
            Self::record_failure(bound, unknown_errors(error.to_string()));
            return Err(error);
        }

        bound.apply(ListMutation::SetPageInfo(derived.page_info));
        bound.apply(FetchableMutation::SetReady(true).into());
        bound.apply(FetchableMutation::SetFailed(false).into());
        bound.apply(FetchableMutation::SetFetching(false).into());
        Ok(Some(list))
    }

    fn record_failure(bound: &BoundStore<'_, Self>, errors: ErrorTracking) {
        debug!(module = bound.proxy.name(), status = %errors.status, "Fetch failed");
        bound.apply(FetchableMutation::SetReady(false).into());
        bound.apply(FetchableMutation::SetFetching(false).into());
        bound.apply(FetchableMutation::SetFailed(true).into());
        bound.apply(FetchableMutation::SetErrors(errors).into());
    }

    /// POST to the list endpoint; the response is not reconciled into the list.
    pub(crate) async fn post(bound: &BoundStore<'_, Self>, data: Value) -> Result<Option<Value>> {
        let token = Self::halt(bound);
        let request =
            NetRequest::new(Method::POST, bound.state().meta.endpoint, token.clone()).with_data(data);
        let result = bound.client.transport.call(request).await;
        if token.is_cancelled() {
            return Ok(None);
        }
        match result {
            Ok(response) => Ok(Some(response.data)),
            Err(error) if error.is_cancelled() => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}
