//! Backing state containers for modules.
//!
//! A [`Store`] owns one state cell per module name. Controllers never touch
//! the store directly; they go through a [`StoreProxy`] scoped to their own
//! module, which can read a snapshot, commit mutations, and subscribe to
//! change notifications.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::watch;

use crate::contracts::ModuleKind;
use crate::error::ModuleError;
use crate::registry::Teardown;

/// Module-scoped view of a store.
pub trait StoreProxy<K: ModuleKind>: Send + Sync {
    fn name(&self) -> &str;

    /// Snapshot of the current state.
    fn state(&self) -> K::State;

    fn commit(&self, mutation: K::Mutation) -> Result<(), ModuleError>;

    /// Receiver that observes a version counter bumped on every accepted commit.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Container of per-module state cells for one module kind.
pub trait Store<K: ModuleKind>: Send + Sync {
    /// Installs `state` under `name`, returning the teardown that removes it.
    ///
    /// The teardown removes only the cell it installed; a later module
    /// registered under the same name is left alone.
    fn add_module(&self, name: &str, state: K::State) -> Teardown;

    fn proxy(&self, name: &str) -> Result<Arc<dyn StoreProxy<K>>, ModuleError>;

    fn contains(&self, name: &str) -> bool;
}

struct ModuleCell<K: ModuleKind> {
    state: RwLock<K::State>,
    version: watch::Sender<u64>,
}

/// In-process store backed by a concurrent map.
pub struct MemoryStore<K: ModuleKind> {
    modules: Arc<DashMap<String, Arc<ModuleCell<K>>>>,
}

impl<K: ModuleKind> MemoryStore<K> {
    pub fn new() -> Self {
        Self {
            modules: Arc::new(DashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

impl<K: ModuleKind> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ModuleKind> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            modules: Arc::clone(&self.modules),
        }
    }
}

impl<K: ModuleKind> fmt::Debug for MemoryStore<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("kind", &K::KIND)
            .field("modules", &self.names())
            .finish()
    }
}

impl<K: ModuleKind> Store<K> for MemoryStore<K> {
    fn add_module(&self, name: &str, state: K::State) -> Teardown {
        let (version, _) = watch::channel(0);
        let cell = Arc::new(ModuleCell {
            state: RwLock::new(state),
            version,
        });
        if self
            .modules
            .insert(name.to_string(), Arc::clone(&cell))
            .is_some()
        {
            tracing::warn!(kind = K::KIND, module = name, "Replaced existing module state");
        }

        let modules = Arc::clone(&self.modules);
        let name = name.to_string();
        Box::new(move || {
            if modules
                .remove_if(&name, |_, current| Arc::ptr_eq(current, &cell))
                .is_some()
            {
                tracing::trace!(kind = K::KIND, module = %name, "Module state removed");
            }
        })
    }

    fn proxy(&self, name: &str) -> Result<Arc<dyn StoreProxy<K>>, ModuleError> {
        let cell = self
            .modules
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ModuleError::MissingState {
                name: name.to_string(),
            })?;
        Ok(Arc::new(MemoryProxy {
            name: name.to_string(),
            cell,
        }))
    }

    fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }
}

struct MemoryProxy<K: ModuleKind> {
    name: String,
    cell: Arc<ModuleCell<K>>,
}

impl<K: ModuleKind> StoreProxy<K> for MemoryProxy<K> {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> K::State {
        self.cell.state.read().clone()
    }

    fn commit(&self, mutation: K::Mutation) -> Result<(), ModuleError> {
        tracing::trace!(kind = K::KIND, module = %self.name, ?mutation, "Commit");
        {
            let mut state = self.cell.state.write();
            K::apply(&mut state, mutation)?;
        }
        self.cell.version.send_modify(|v| *v = v.wrapping_add(1));
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.cell.version.subscribe()
    }
}
