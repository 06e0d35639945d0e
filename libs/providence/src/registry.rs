//! Hierarchical, reference-counted registry of live controllers.
//!
//! There is one [`Registry`] per module kind. Each namespace maps to a node in
//! a tree; a node holds at most one controller, the teardown that releases its
//! backing state, and the set of listeners currently holding it. The last
//! listener to leave destroys the controller (unless it is persistent) and
//! prunes the emptied branch.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::contracts::Controller;
use crate::error::ModuleError;
use crate::namespace::Namespace;

/// Releases the backing-store state of a destroyed controller.
pub type Teardown = Box<dyn FnOnce() + Send>;

/// Opaque identity of a consumer holding a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListenerId(String);

impl ListenerId {
    /// A fresh, unique listener identity.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ListenerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ListenerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no {kind} registered at '{namespace}' and no construction options were supplied")]
    MissingConstructionArgs { kind: &'static str, namespace: String },

    #[error("cannot destroy {kind} '{namespace}' while listeners remain: {}", listeners.join(", "))]
    ListenersRemain {
        kind: &'static str,
        namespace: String,
        listeners: Vec<String>,
    },

    #[error("failed to construct {kind} '{namespace}'")]
    Construction {
        kind: &'static str,
        namespace: String,
        #[source]
        source: ModuleError,
    },
}

/// Partial update applied by [`Registry::register_or_update`].
pub struct EntryUpdate<C> {
    pub listeners: Option<BTreeSet<ListenerId>>,
    pub controller: Option<Arc<C>>,
    pub remover: Option<Teardown>,
}

impl<C> Default for EntryUpdate<C> {
    fn default() -> Self {
        Self {
            listeners: None,
            controller: None,
            remover: None,
        }
    }
}

struct RegistryEntry<C> {
    children: BTreeMap<String, RegistryEntry<C>>,
    controller: Option<Arc<C>>,
    remover: Option<Teardown>,
    listeners: BTreeSet<ListenerId>,
}

impl<C> RegistryEntry<C> {
    fn new() -> Self {
        Self {
            children: BTreeMap::new(),
            controller: None,
            remover: None,
            listeners: BTreeSet::new(),
        }
    }

    fn is_vacant(&self) -> bool {
        self.children.is_empty()
            && self.listeners.is_empty()
            && self.controller.is_none()
            && self.remover.is_none()
    }

    fn find(&self, path: &[String]) -> Option<&Self> {
        path.iter()
            .try_fold(self, |entry, segment| entry.children.get(segment))
    }

    fn find_mut(&mut self, path: &[String]) -> Option<&mut Self> {
        let mut entry = self;
        for segment in path {
            entry = entry.children.get_mut(segment)?;
        }
        Some(entry)
    }

    fn ensure(&mut self, path: &[String]) -> &mut Self {
        let mut entry = self;
        for segment in path {
            entry = entry
                .children
                .entry(segment.clone())
                .or_insert_with(RegistryEntry::new);
        }
        entry
    }

    /// Removes the node at `path` and any ancestors left vacant by its removal.
    fn prune(&mut self, path: &[String]) -> bool {
        let Some((first, rest)) = path.split_first() else {
            return false;
        };
        let Some(child) = self.children.get_mut(first) else {
            return false;
        };
        if !rest.is_empty() {
            child.prune(rest);
        }
        if child.is_vacant() {
            self.children.remove(first);
            return true;
        }
        false
    }

    fn count(&self) -> usize {
        self.children
            .values()
            .map(|child| usize::from(child.controller.is_some()) + child.count())
            .sum()
    }
}

/// A live controller handed out by [`Registry::get_or_create`], together with
/// the handle that releases the caller's hold on it.
pub struct Registration<C> {
    pub controller: Arc<C>,
    pub remover: EntryRemover<C>,
}

impl<C> fmt::Debug for Registration<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("namespace", &self.remover.namespace.flatten())
            .finish()
    }
}

/// Releases one listener's hold on a registry entry.
pub struct EntryRemover<C> {
    registry: Registry<C>,
    namespace: Namespace,
}

impl<C> Clone for EntryRemover<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

impl<C: Controller> EntryRemover<C> {
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Drops `listener`. Returns `true` while other listeners still hold the entry.
    pub fn remove(&self, listener: &ListenerId) -> bool {
        self.registry.remove_listener(&self.namespace, listener)
    }
}

/// Cheap-to-clone handle on one module kind's registry tree.
pub struct Registry<C> {
    kind: &'static str,
    root: Arc<Mutex<RegistryEntry<C>>>,
}

impl<C> Clone for Registry<C> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            root: Arc::clone(&self.root),
        }
    }
}

impl<C> fmt::Debug for Registry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let root = self.root.lock();
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("controllers", &root.count())
            .finish()
    }
}

impl<C: Controller> Registry<C> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            root: Arc::new(Mutex::new(RegistryEntry::new())),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn remover(&self, namespace: Namespace) -> EntryRemover<C> {
        EntryRemover {
            registry: self.clone(),
            namespace,
        }
    }

    /// Returns the live controller at `namespace`, constructing it with `build`
    /// when absent, and records `listener` as a holder.
    ///
    /// The existence check, construction and registration happen under one
    /// lock, so concurrent callers for the same namespace share one controller.
    pub fn get_or_create<F>(
        &self,
        namespace: &Namespace,
        build: Option<F>,
        listener: &ListenerId,
    ) -> Result<Registration<C>, RegistryError>
    where
        F: FnOnce() -> Result<(Arc<C>, Teardown), ModuleError>,
    {
        let path = namespace.segments();
        let mut root = self.root.lock();

        let existing = root
            .find(path)
            .and_then(|entry| entry.controller.clone().filter(|_| entry.remover.is_some()));

        let controller = match existing {
            Some(controller) => controller,
            None => {
                let build = build.ok_or_else(|| RegistryError::MissingConstructionArgs {
                    kind: self.kind,
                    namespace: namespace.flatten(),
                })?;
                let (controller, remover) =
                    build().map_err(|source| RegistryError::Construction {
                        kind: self.kind,
                        namespace: namespace.flatten(),
                        source,
                    })?;
                let entry = root.ensure(path);
                if let Some(stale) = entry.remover.take() {
                    tracing::warn!(
                        kind = self.kind,
                        namespace = %namespace,
                        "Replacing an orphaned store teardown"
                    );
                    stale();
                }
                entry.controller = Some(Arc::clone(&controller));
                entry.remover = Some(remover);
                tracing::debug!(kind = self.kind, namespace = %namespace, "Controller created");
                controller
            }
        };

        root.ensure(path).listeners.insert(listener.clone());

        Ok(Registration {
            controller,
            remover: self.remover(namespace.clone()),
        })
    }

    /// Creates the node if needed and overwrites whichever parts `update` carries.
    pub fn register_or_update(&self, namespace: &Namespace, update: EntryUpdate<C>) {
        let mut root = self.root.lock();
        let entry = root.ensure(namespace.segments());
        if let Some(listeners) = update.listeners {
            entry.listeners = listeners;
        }
        if let Some(controller) = update.controller {
            entry.controller = Some(controller);
        }
        if let Some(remover) = update.remover {
            entry.remover = Some(remover);
        }
    }

    /// Drops a listener. The final listener destroys a non-persistent
    /// controller: its `pre_destroy` hook runs, then its store teardown, and
    /// the node is pruned along with any ancestors left empty.
    pub fn remove_listener(&self, namespace: &Namespace, listener: &ListenerId) -> bool {
        let path = namespace.segments();
        let doomed = {
            let mut root = self.root.lock();
            let Some(entry) = root.find_mut(path) else {
                tracing::warn!(
                    kind = self.kind,
                    namespace = %namespace,
                    listener = %listener,
                    "Tried to remove listener, but the registry entry is missing"
                );
                return false;
            };
            if !entry.listeners.remove(listener) {
                tracing::warn!(
                    kind = self.kind,
                    namespace = %namespace,
                    listener = %listener,
                    "Listener was not registered on this entry"
                );
            }
            if !entry.listeners.is_empty() {
                return true;
            }
            match entry.controller.clone() {
                Some(controller) if controller.persistent() => return false,
                Some(controller) => {
                    entry.controller = None;
                    let remover = entry.remover.take();
                    root.prune(path);
                    (controller, remover)
                }
                None => {
                    root.prune(path);
                    return false;
                }
            }
        };

        let (controller, remover) = doomed;
        controller.pre_destroy();
        if let Some(remover) = remover {
            remover();
        }
        tracing::debug!(kind = self.kind, namespace = %namespace, "Controller destroyed");
        false
    }

    /// Forcibly destroys the entry at `namespace`.
    ///
    /// Missing entries only log a warning. Entries that still have listeners
    /// are refused. Children of the destroyed entry are left in place.
    pub fn destroy(&self, namespace: &Namespace) -> Result<(), RegistryError> {
        let path = namespace.segments();
        let (controller, remover) = {
            let mut root = self.root.lock();
            let Some(entry) = root.find_mut(path) else {
                tracing::warn!(
                    kind = self.kind,
                    namespace = %namespace,
                    "Tried to destroy an entry that is not registered"
                );
                return Ok(());
            };
            if !entry.listeners.is_empty() {
                return Err(RegistryError::ListenersRemain {
                    kind: self.kind,
                    namespace: namespace.flatten(),
                    listeners: entry.listeners.iter().map(ToString::to_string).collect(),
                });
            }
            let controller = entry.controller.take();
            let remover = entry.remover.take();
            root.prune(path);
            (controller, remover)
        };

        if let Some(controller) = controller {
            controller.pre_destroy();
        }
        if let Some(remover) = remover {
            remover();
        }
        Ok(())
    }

    pub fn controller(&self, namespace: &Namespace) -> Option<Arc<C>> {
        self.root
            .lock()
            .find(namespace.segments())
            .and_then(|entry| entry.controller.clone())
    }

    pub fn listeners(&self, namespace: &Namespace) -> Option<BTreeSet<ListenerId>> {
        self.root
            .lock()
            .find(namespace.segments())
            .map(|entry| entry.listeners.clone())
    }

    /// Whether a node (live or routing-only) exists at `namespace`.
    pub fn contains(&self, namespace: &Namespace) -> bool {
        self.root.lock().find(namespace.segments()).is_some()
    }

    /// Number of live controllers in the tree.
    pub fn len(&self) -> usize {
        self.root.lock().count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.lock().children.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Fixture {
        persistent: bool,
        destroyed: AtomicUsize,
    }

    impl Controller for Fixture {
        fn name(&self) -> String {
            "fixture".to_string()
        }

        fn persistent(&self) -> bool {
            self.persistent
        }

        fn pre_destroy(&self) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ns(segments: &[&str]) -> Namespace {
        Namespace::new(segments.iter().copied()).unwrap()
    }

    type Build = Box<dyn FnOnce() -> Result<(Arc<Fixture>, Teardown), ModuleError>>;

    fn builder(fixture: Arc<Fixture>, torn_down: Arc<AtomicUsize>) -> Option<Build> {
        Some(Box::new(move || {
            let teardown: Teardown = Box::new(move || {
                torn_down.fetch_add(1, Ordering::SeqCst);
            });
            Ok((fixture, teardown))
        }))
    }

    #[test]
    fn same_namespace_yields_same_controller() {
        let registry = Registry::<Fixture>::new("fixture");
        let torn_down = Arc::new(AtomicUsize::new(0));
        let namespace = ns(&["user", "1"]);

        let first = registry
            .get_or_create(
                &namespace,
                builder(Arc::default(), torn_down.clone()),
                &ListenerId::from("a"),
            )
            .unwrap();
        let second = registry
            .get_or_create(
                &namespace,
                builder(Arc::default(), torn_down.clone()),
                &ListenerId::from("b"),
            )
            .unwrap();

        assert!(Arc::ptr_eq(&first.controller, &second.controller));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.listeners(&namespace).unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_creators_share_one_controller() {
        const CALLERS: usize = 16;
        let registry = Arc::new(Registry::<Fixture>::new("fixture"));
        let built = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(tokio::sync::Barrier::new(CALLERS));

        let tasks: Vec<_> = (0..CALLERS)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let built = Arc::clone(&built);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    let build: Option<Build> = Some(Box::new(move || {
                        built.fetch_add(1, Ordering::SeqCst);
                        let teardown: Teardown = Box::new(|| {});
                        Ok((Arc::new(Fixture::default()), teardown))
                    }));
                    registry
                        .get_or_create(&ns(&["shared", "1"]), build, &ListenerId::from(format!("l{i}")))
                        .map(|reg| reg.controller)
                })
            })
            .collect();

        let mut controllers = Vec::with_capacity(CALLERS);
        for task in tasks {
            controllers.push(task.await.unwrap().unwrap());
        }

        assert_eq!(built.load(Ordering::SeqCst), 1);
        assert!(controllers.iter().all(|c| Arc::ptr_eq(c, &controllers[0])));
        assert_eq!(registry.listeners(&ns(&["shared", "1"])).unwrap().len(), CALLERS);
    }

    #[test]
    fn missing_entry_without_options_fails() {
        let registry = Registry::<Fixture>::new("fixture");
        let err = registry
            .get_or_create::<Build>(&ns(&["nope"]), None, &ListenerId::new())
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingConstructionArgs { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn construction_failure_leaves_no_node() {
        let registry = Registry::<Fixture>::new("fixture");
        let build: Option<Build> = Some(Box::new(|| {
            Err(ModuleError::MissingState {
                name: "x".to_string(),
            })
        }));
        let err = registry
            .get_or_create(&ns(&["x"]), build, &ListenerId::new())
            .unwrap_err();
        assert!(matches!(err, RegistryError::Construction { .. }));
        assert!(!registry.contains(&ns(&["x"])));
    }

    #[test]
    fn last_listener_destroys_and_prunes_branch() {
        let registry = Registry::<Fixture>::new("fixture");
        let torn_down = Arc::new(AtomicUsize::new(0));
        let fixture = Arc::new(Fixture::default());
        let namespace = ns(&["user", "checklists", "tasks"]);
        let (a, b) = (ListenerId::from("a"), ListenerId::from("b"));

        let reg = registry
            .get_or_create(&namespace, builder(fixture.clone(), torn_down.clone()), &a)
            .unwrap();
        registry
            .get_or_create::<Build>(&namespace, None, &b)
            .unwrap();

        assert!(reg.remover.remove(&a));
        assert_eq!(fixture.destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(torn_down.load(Ordering::SeqCst), 0);

        assert!(!reg.remover.remove(&b));
        assert_eq!(fixture.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(torn_down.load(Ordering::SeqCst), 1);
        assert!(!registry.contains(&ns(&["user"])));
        assert!(registry.is_empty());
    }

    #[test]
    fn pruning_stops_at_occupied_ancestors() {
        let registry = Registry::<Fixture>::new("fixture");
        let torn_down = Arc::new(AtomicUsize::new(0));
        let listener = ListenerId::from("a");

        registry
            .get_or_create(
                &ns(&["user"]),
                builder(Arc::default(), torn_down.clone()),
                &listener,
            )
            .unwrap();
        let child = registry
            .get_or_create(
                &ns(&["user", "tasks"]),
                builder(Arc::default(), torn_down.clone()),
                &listener,
            )
            .unwrap();

        child.remover.remove(&listener);
        assert!(!registry.contains(&ns(&["user", "tasks"])));
        assert!(registry.controller(&ns(&["user"])).is_some());
    }

    #[test]
    fn persistent_controllers_survive_last_listener() {
        let registry = Registry::<Fixture>::new("fixture");
        let torn_down = Arc::new(AtomicUsize::new(0));
        let fixture = Arc::new(Fixture {
            persistent: true,
            ..Fixture::default()
        });
        let listener = ListenerId::new();
        let reg = registry
            .get_or_create(&ns(&["keep"]), builder(fixture.clone(), torn_down.clone()), &listener)
            .unwrap();

        assert!(!reg.remover.remove(&listener));
        assert_eq!(fixture.destroyed.load(Ordering::SeqCst), 0);
        assert!(registry.controller(&ns(&["keep"])).is_some());
    }

    #[test]
    fn removing_from_missing_entry_is_harmless() {
        let registry = Registry::<Fixture>::new("fixture");
        assert!(!registry
            .remover(ns(&["ghost"]))
            .remove(&ListenerId::from("nobody")));
    }

    #[test]
    fn destroy_refuses_while_listeners_remain() {
        let registry = Registry::<Fixture>::new("fixture");
        let torn_down = Arc::new(AtomicUsize::new(0));
        let namespace = ns(&["busy"]);
        registry
            .get_or_create(
                &namespace,
                builder(Arc::default(), torn_down.clone()),
                &ListenerId::from("a"),
            )
            .unwrap();

        let err = registry.destroy(&namespace).unwrap_err();
        assert!(matches!(err, RegistryError::ListenersRemain { ref listeners, .. } if listeners == &["a".to_string()]));
        assert_eq!(torn_down.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn destroy_keeps_entries_with_children() {
        let registry = Registry::<Fixture>::new("fixture");
        let torn_down = Arc::new(AtomicUsize::new(0));
        let parent = ns(&["parent"]);
        let fixture = Arc::new(Fixture::default());

        registry.register_or_update(
            &parent,
            EntryUpdate {
                controller: Some(fixture.clone()),
                ..EntryUpdate::default()
            },
        );
        registry
            .get_or_create(
                &ns(&["parent", "child"]),
                builder(Arc::default(), torn_down.clone()),
                &ListenerId::new(),
            )
            .unwrap();

        registry.destroy(&parent).unwrap();
        assert_eq!(fixture.destroyed.load(Ordering::SeqCst), 1);
        assert!(registry.controller(&parent).is_none());
        assert!(registry.contains(&parent));
        assert!(registry.controller(&ns(&["parent", "child"])).is_some());

        // Missing entries only warn.
        registry.destroy(&ns(&["missing"])).unwrap();
    }

    #[test]
    fn register_or_update_overwrites_listener_set() {
        let registry = Registry::<Fixture>::new("fixture");
        let namespace = ns(&["a", "b"]);
        let listeners: BTreeSet<ListenerId> = ["x", "y"].into_iter().map(ListenerId::from).collect();
        registry.register_or_update(
            &namespace,
            EntryUpdate {
                listeners: Some(listeners.clone()),
                ..EntryUpdate::default()
            },
        );
        assert_eq!(registry.listeners(&namespace).unwrap(), listeners);
        assert!(registry.controller(&namespace).is_none());
    }

    #[test]
    fn listener_ids_are_unique() {
        assert_ne!(ListenerId::new(), ListenerId::new());
        assert_eq!(ListenerId::from("list.todos").as_str(), "list.todos");
    }
}
