use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::reconcile::merge_refs;
use super::{ListKind, ListMutation, ListState, ListTask};
use crate::client::Client;
use crate::contracts::{commit_logged, BoundStore, Controller};
use crate::error::{ModuleError, Result};
use crate::fetchable::{AbortSlot, ErrorTracking, FetchableMutation, QueryParams};
use crate::namespace::{Namespace, NamespaceError};
use crate::paginator::PageInfo;
use crate::registry::{EntryRemover, ListenerId, Registration};
use crate::runtime::SingleScope;
use crate::singles::SingleController;
use crate::store::StoreProxy;

/// Facade over one list module.
///
/// Reading [`ListController::list`] registers this controller as a listener on
/// every child it returns and releases children that have since dropped out.
pub struct ListController {
    uid: ListenerId,
    store: Arc<dyn StoreProxy<ListKind>>,
    client: Arc<Client>,
    singles: SingleScope,
    cancel: AbortSlot,
    fetch_gate: Mutex<()>,
    tracker: Mutex<BTreeMap<String, EntryRemover<SingleController>>>,
}

impl fmt::Debug for ListController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListController")
            .field("name", &self.store.name())
            .field("uid", &self.uid)
            .finish_non_exhaustive()
    }
}

impl ListController {
    pub(crate) fn new(
        client: Arc<Client>,
        singles: SingleScope,
        store: Arc<dyn StoreProxy<ListKind>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            uid: ListenerId::new(),
            store,
            client,
            singles,
            cancel: AbortSlot::new(),
            fetch_gate: Mutex::new(()),
            tracker: Mutex::new(BTreeMap::new()),
        })
    }

    fn bound(&self) -> BoundStore<'_, ListKind> {
        BoundStore {
            proxy: self.store.as_ref(),
            client: &self.client,
            cancel: &self.cancel,
        }
    }

    fn mutate(&self, mutation: ListMutation) {
        commit_logged(self.store.as_ref(), mutation);
    }

    pub fn state(&self) -> ListState {
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
    pub fn commit(&self, mutation: ListMutation) -> Result<(), ModuleError> {
        self.store.commit(mutation)
    }

    pub fn namespace(&self) -> Result<Namespace, NamespaceError> {
        Namespace::explode(self.store.name())
    }

    /// Identity this controller uses when it holds child modules.
    pub fn uid(&self) -> &ListenerId {
        &self.uid
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

    pub fn params(&self) -> Option<QueryParams> {
        self.state().meta.params
    }

    pub fn set_params(&self, params: Option<QueryParams>) {
        self.mutate(FetchableMutation::SetParams(params).into());
    }

    pub fn errors(&self) -> ErrorTracking {
        self.state().meta.errors
    }

    pub fn reset_errors(&self) {
        self.mutate(FetchableMutation::ResetErrors.into());
    }

    pub fn grow(&self) -> bool {
        self.state().grow
    }

    pub fn set_grow(&self, grow: bool) {
        self.mutate(ListMutation::SetGrow(grow));
    }

    pub fn refs(&self) -> Vec<String> {
        self.state().refs
    }

    pub fn page_info(&self) -> Option<PageInfo> {
        self.state().page_info
    }

    pub fn set_page_info(&self, page_info: Option<PageInfo>) {
        self.mutate(ListMutation::SetPageInfo(page_info));
    }

    /// Total entry count reported by the server.
    pub fn count(&self) -> Option<u64> {
        self.state().page_info.map(|info| info.count)
    }

    pub fn total_pages(&self) -> Option<u64> {
        self.client.paginator.total_pages(&self.state())
    }

    pub fn current_page(&self) -> u64 {
        self.client.paginator.current_page(&self.state())
    }

    /// Moves to `page` and refetches in the background.
    ///
    /// Fetch failures are recorded in state. Must be called inside a Tokio runtime.
    pub fn set_current_page(self: &Arc<Self>, page: u64) {
        let params = self
            .client
            .paginator
            .with_page(self.state().meta.params.as_ref(), page);
        self.set_params(Some(params));
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(error) = this.get().await {
                debug!(module = this.store.name(), %error, "Page fetch failed");
            }
        });
    }

    /// Live child controllers, in list order, excluding absent and deleted values.
    pub fn list(&self) -> Vec<Arc<SingleController>> {
        let refs = merge_refs(&self.state().refs, &[]);
        let mut controllers = Vec::with_capacity(refs.len());
        let stale = {
            let mut tracker = self.tracker.lock();
            for name in &refs {
                let namespace = match Namespace::explode(name) {
                    Ok(namespace) => namespace,
                    Err(error) => {
                        warn!(entry = %name, %error, "Unparseable list reference");
                        continue;
                    }
                };
                match self.singles.acquire(&namespace, None, &self.uid) {
                    Ok(Registration { controller, remover }) => {
                        tracker.insert(name.clone(), remover);
                        controllers.push(controller);
                    }
                    Err(error) => {
                        warn!(list = self.store.name(), entry = %name, %error, "List entry has no live module")
                    }
                }
            }
            let gone: Vec<String> = tracker
                .keys()
                .filter(|name| !refs.contains(name))
                .cloned()
                .collect();
            gone.iter()
                .filter_map(|name| tracker.remove(name))
                .collect::<Vec<_>>()
        };
        for remover in stale {
            remover.remove(&self.uid);
        }

        controllers
            .into_iter()
            .filter(|controller| {
                let state = controller.state();
                state.x.is_some() && !state.deleted
            })
            .collect()
    }

    /// Values of the live children, in list order.
    pub fn raw_list(&self) -> Vec<Value> {
        self.list()
            .iter()
            .filter_map(|controller| controller.x())
            .collect()
    }

    /// Names of the children this controller currently holds as a listener.
    pub fn managed_names(&self) -> Vec<String> {
        self.tracker.lock().keys().cloned().collect()
    }

    /// Ready with nothing to show on its first page.
    pub fn empty(&self) -> bool {
        let state = self.state();
        (!state.paginated || self.current_page() == 1)
            && state.meta.ready
            && self.list().is_empty()
    }

    pub fn set_list(&self, entries: &[Value]) -> Result<()> {
        ListKind::set_list(&self.bound(), &self.singles, entries)
    }

    pub fn prefix(&self, entries: &[Value]) -> Result<()> {
        ListKind::prefix(&self.bound(), &self.singles, entries)
    }

    pub fn extend(&self, entries: &[Value]) -> Result<()> {
        ListKind::extend(&self.bound(), &self.singles, entries)
    }

    /// Seeds the list from raw entries, one subordinate single per entry, and
    /// marks it ready without fetching. Singles take their value whole instead.
    pub fn make_ready(&self, entries: &[Value]) -> Result<()> {
        ListKind::make_ready(&self.bound(), &self.singles, entries)
    }

    pub fn kill(&self) {
        ListKind::halt(&self.bound());
    }

    /// Fetches the current page, superseding any operation already in flight.
    pub async fn get(&self) -> Result<Option<Vec<Value>>> {
        let token = {
            let _gate = self.fetch_gate.lock();
            ListKind::begin_get(&self.bound())
        };
        ListKind::finish_get(&self.bound(), &self.singles, token).await
    }

    /// Fetches only if nothing has been fetched, attempted, or started yet.
    pub async fn get_once(&self) {
        let token = {
            let _gate = self.fetch_gate.lock();
            if self.state().meta.settled_or_busy() {
                return;
            }
            ListKind::begin_get(&self.bound())
        };
        if let Err(error) = ListKind::finish_get(&self.bound(), &self.singles, token).await {
            debug!(module = self.store.name(), %error, "get_once failed");
        }
    }

    pub async fn post(&self, data: Value) -> Result<Option<Value>> {
        ListKind::post(&self.bound(), data).await
    }

    pub async fn dispatch(&self, task: ListTask) -> Result<Option<Value>> {
        match task {
            ListTask::Get => Ok(self.get().await?.map(Value::Array)),
            ListTask::GetOnce => {
                self.get_once().await;
                Ok(None)
            }
            ListTask::SetList(entries) => {
                self.set_list(&entries)?;
                Ok(Some(Value::Array(entries)))
            }
            ListTask::Prefix(entries) => {
                self.prefix(&entries)?;
                Ok(None)
            }
            ListTask::Extend(entries) => {
                self.extend(&entries)?;
                Ok(None)
            }
            ListTask::Post(data) => self.post(data).await,
            ListTask::MakeReady(entries) => {
                self.make_ready(&entries)?;
                Ok(Some(Value::Array(entries)))
            }
        }
    }

    fn release_tracked(&self) {
        let tracked = std::mem::take(&mut *self.tracker.lock());
        for remover in tracked.into_values() {
            remover.remove(&self.uid);
        }
    }
}

impl Controller for ListController {
    fn name(&self) -> String {
        self.store.name().to_string()
    }

    fn persistent(&self) -> bool {
        self.state().meta.persistent
    }

    fn pre_destroy(&self) {
        self.cancel.kill();
        if let Err(error) = self.set_list(&[]) {
            warn!(module = self.store.name(), %error, "Could not release list entries");
        }
        self.release_tracked();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lists::ListOptions;
    use crate::singles::SingleOptions;
    use crate::testing::{providence, MockTransport};
    use crate::transport::TransportError;
    use crate::Providence;
    use serde_json::json;
    use std::time::Duration;

    fn ns(segments: &[&str]) -> Namespace {
        Namespace::new(segments.iter().copied()).unwrap()
    }

    fn list(root: &Providence, name: &str, options: ListOptions) -> Registration<ListController> {
        root.list(&ns(&[name]), Some(options), &ListenerId::new())
            .unwrap()
    }

    fn ids(values: &[Value]) -> Vec<i64> {
        values.iter().filter_map(|v| v["id"].as_i64()).collect()
    }

    #[tokio::test]
    async fn get_builds_children_with_item_endpoints() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(json!({"results": [{"id": 1}, {"id": 2}], "count": 2, "size": 24}));
        let root = providence(transport.clone());
        let todos = list(&root, "todos", ListOptions::new().endpoint("/api/todos/")).controller;

        let fetched = todos.get().await.unwrap().unwrap();
        assert_eq!(ids(&fetched), vec![1, 2]);
        assert_eq!(todos.refs(), vec!["todos.1".to_string(), "todos.2".to_string()]);
        assert!(todos.ready());
        assert!(!todos.fetching());
        assert_eq!(todos.count(), Some(2));
        assert_eq!(todos.total_pages(), Some(1));

        let requests = transport.requests();
        assert_eq!(requests[0].params.as_ref().unwrap()["page"], "1");

        let child = root.singles().registry().controller(&ns(&["todos", "1"])).unwrap();
        assert_eq!(child.endpoint(), "/api/todos/1/");
        assert!(child.ready());
        let listeners = root.singles().registry().listeners(&ns(&["todos", "1"])).unwrap();
        assert!(listeners.contains(&ListenerId::from("todos")));
    }

    #[tokio::test]
    async fn grow_reverse_prepends_reversed_pages() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(json!({"results": [{"id": 3}, {"id": 4}], "count": 4, "size": 2}));
        let root = providence(transport.clone());
        let feed = list(
            &root,
            "feed",
            ListOptions::new().endpoint("/api/feed/").grow(true).reverse(true),
        )
        .controller;

        feed.make_ready(&[json!({"id": 2}), json!({"id": 1})]).unwrap();
        feed.set_params(Some(
            root.client().paginator.with_page(feed.params().as_ref(), 2),
        ));
        feed.get().await.unwrap();

        assert_eq!(ids(&feed.raw_list()), vec![4, 3, 2, 1]);
        assert_eq!(feed.current_page(), 2);
        assert_eq!(feed.total_pages(), Some(2));
    }

    #[tokio::test]
    async fn grow_without_reverse_appends() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(json!({"results": [{"id": 3}, {"id": 1}], "count": 3, "size": 2}));
        let root = providence(transport.clone());
        let feed = list(&root, "feed", ListOptions::new().endpoint("/api/feed/").grow(true)).controller;

        feed.make_ready(&[json!({"id": 1}), json!({"id": 2})]).unwrap();
        feed.get().await.unwrap();
        assert_eq!(ids(&feed.raw_list()), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn set_list_reuses_kept_children_and_tears_down_dropped_ones() {
        let root = providence(Arc::new(MockTransport::new()));
        let todos = list(&root, "todos", ListOptions::new().endpoint("/api/todos/")).controller;

        todos.set_list(&[json!({"id": 1}), json!({"id": 2})]).unwrap();
        let kept = root.singles().registry().controller(&ns(&["todos", "2"])).unwrap();

        todos
            .set_list(&[json!({"id": 2, "title": "fresh"}), json!({"id": 3})])
            .unwrap();

        assert!(root.singles().registry().controller(&ns(&["todos", "1"])).is_none());
        assert!(!root.singles().store().contains("todos.1"));
        let still = root.singles().registry().controller(&ns(&["todos", "2"])).unwrap();
        assert!(Arc::ptr_eq(&kept, &still));
        assert_eq!(still.x(), Some(json!({"id": 2, "title": "fresh"})));
        assert!(root.singles().registry().controller(&ns(&["todos", "3"])).is_some());
    }

    #[tokio::test]
    async fn children_held_elsewhere_survive_removal() {
        let root = providence(Arc::new(MockTransport::new()));
        let todos = list(&root, "todos", ListOptions::new()).controller;
        todos.set_list(&[json!({"id": 1})]).unwrap();

        let viewer = ListenerId::new();
        root.single(&ns(&["todos", "1"]), None, &viewer).unwrap();

        todos.set_list(&[]).unwrap();
        let child = root.singles().registry().controller(&ns(&["todos", "1"]));
        assert!(child.is_some());
        assert_eq!(
            root.singles().registry().listeners(&ns(&["todos", "1"])).unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn list_filters_deleted_entries_and_tracks_listeners() {
        let root = providence(Arc::new(MockTransport::new()));
        let todos = list(&root, "todos", ListOptions::new()).controller;
        todos
            .set_list(&[json!({"id": 1}), json!({"id": 2}), json!({"id": 3})])
            .unwrap();

        let second = root.singles().registry().controller(&ns(&["todos", "2"])).unwrap();
        second.set_x(None);

        assert_eq!(todos.list().len(), 2);
        assert_eq!(todos.list().len(), 2);
        assert_eq!(
            todos.managed_names(),
            vec!["todos.1".to_string(), "todos.2".to_string(), "todos.3".to_string()]
        );
        let listeners = root.singles().registry().listeners(&ns(&["todos", "1"])).unwrap();
        assert!(listeners.contains(todos.uid()));
        assert_eq!(listeners.len(), 2);

        todos.set_list(&[json!({"id": 1})]).unwrap();
        // Still held through the tracker until the next read.
        assert!(root.singles().registry().controller(&ns(&["todos", "3"])).is_some());
        assert_eq!(todos.list().len(), 1);
        assert!(root.singles().registry().controller(&ns(&["todos", "3"])).is_none());
    }

    #[tokio::test]
    async fn failed_get_records_errors() {
        let transport = Arc::new(MockTransport::new());
        transport.fail(TransportError::http(500, json!({"detail": "Server error."})));
        let root = providence(transport.clone());
        let todos = list(&root, "todos", ListOptions::new().endpoint("/api/todos/")).controller;

        assert!(todos.get().await.is_err());
        assert!(todos.failed());
        assert!(!todos.ready());
        assert_eq!(todos.errors().status, "500");
        assert_eq!(todos.errors().messages, vec!["Server error.".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn changing_page_refetches() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(json!({"results": [{"id": 25}], "count": 25, "size": 24}));
        let root = providence(transport.clone());
        let todos = list(&root, "todos", ListOptions::new().endpoint("/api/todos/")).controller;

        todos.set_current_page(2);
        assert_eq!(todos.current_page(), 2);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(transport.requests()[0].params.as_ref().unwrap()["page"], "2");
        assert_eq!(ids(&todos.raw_list()), vec![25]);
        assert!(!todos.empty());
    }

    #[tokio::test]
    async fn empty_means_ready_first_page_without_entries() {
        let root = providence(Arc::new(MockTransport::new()));
        let todos = list(&root, "todos", ListOptions::new()).controller;
        assert!(!todos.empty());
        todos.make_ready(&[]).unwrap();
        assert!(todos.empty());
    }

    #[tokio::test]
    async fn destroying_the_list_releases_children() {
        let root = providence(Arc::new(MockTransport::new()));
        let listener = ListenerId::new();
        let registration = root
            .list(&ns(&["todos"]), Some(ListOptions::new()), &listener)
            .unwrap();
        registration
            .controller
            .set_list(&[json!({"id": 1}), json!({"id": 2})])
            .unwrap();
        registration.controller.list();

        assert!(!registration.remover.remove(&listener));
        assert!(root.lists().is_empty());
        assert!(root.singles().registry().is_empty());
        assert!(!root.singles().store().contains("todos.1"));
    }

    #[tokio::test]
    async fn existing_children_get_fresh_values_from_other_lists() {
        let root = providence(Arc::new(MockTransport::new()));
        root.single(
            &ns(&["todos", "7"]),
            Some(SingleOptions::new().x(json!({"id": 7, "done": false}))),
            &ListenerId::new(),
        )
        .unwrap();
        let todos = list(&root, "todos", ListOptions::new()).controller;

        todos.set_list(&[json!({"id": 7, "done": true})]).unwrap();
        assert_eq!(todos.raw_list(), vec![json!({"id": 7, "done": true})]);
    }

    #[tokio::test]
    async fn dispatch_routes_tasks() {
        let transport = Arc::new(MockTransport::new());
        transport.respond(json!({"id": 9}));
        let root = providence(transport.clone());
        let todos = list(&root, "todos", ListOptions::new().endpoint("/api/todos/")).controller;

        let created = todos.dispatch(ListTask::Post(json!({"title": "x"}))).await.unwrap();
        assert_eq!(created, Some(json!({"id": 9})));
        todos.dispatch(ListTask::Extend(vec![json!({"id": 9})])).await.unwrap();
        assert_eq!(todos.refs(), vec!["todos.9".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_cut_short_by_post_or_kill_stops_fetching() {
        let transport = Arc::new(MockTransport::new());
        let _first = transport.gate();
        transport.respond(json!({"id": 5}));
        let _second = transport.gate();
        let root = providence(transport.clone());
        let todos = list(&root, "todos", ListOptions::new().endpoint("/api/todos/")).controller;

        let pending = {
            let todos = Arc::clone(&todos);
            tokio::spawn(async move { todos.get().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(todos.fetching());

        todos.post(json!({"title": "x"})).await.unwrap();
        assert!(pending.await.unwrap().unwrap().is_none());
        assert!(!todos.fetching());

        let pending = {
            let todos = Arc::clone(&todos);
            tokio::spawn(async move { todos.get().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(todos.fetching());
        todos.kill();
        assert!(pending.await.unwrap().unwrap().is_none());
        assert!(!todos.fetching());
        assert!(!todos.ready());
    }

    #[tokio::test(start_paused = true)]
    async fn make_ready_during_fetch_settles_the_list() {
        let transport = Arc::new(MockTransport::new());
        let _gate = transport.gate();
        let root = providence(transport.clone());
        let todos = list(&root, "todos", ListOptions::new().endpoint("/api/todos/")).controller;

        let pending = {
            let todos = Arc::clone(&todos);
            tokio::spawn(async move { todos.get().await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;

        todos.make_ready(&[json!({"id": 1})]).unwrap();
        assert!(todos.ready());
        assert!(!todos.fetching());
        pending.abort();
    }
}
