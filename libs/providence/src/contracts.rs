use std::fmt;
use std::sync::Arc;

use crate::client::Client;
use crate::error::ModuleError;
use crate::fetchable::AbortSlot;
use crate::registry::Registry;
use crate::runtime::{Providence, SingleScope};
use crate::store::{Store, StoreProxy};

/// Behaviour every registry-held controller exposes to its registry.
pub trait Controller: Send + Sync + 'static {
    /// Flattened namespace of the module this controller fronts.
    fn name(&self) -> String;

    /// Persistent controllers are never destroyed when their last listener leaves.
    fn persistent(&self) -> bool;

    /// Runs once, right before the controller's store state is torn down.
    fn pre_destroy(&self);
}

/// A module kind ties together state shape, mutations and the controller
/// wrapping them. Single, List and Form are the three kinds.
pub trait ModuleKind: Sized + Send + Sync + 'static {
    const KIND: &'static str;

    type Options: Send;
    type State: Clone + fmt::Debug + Send + Sync + 'static;
    type Mutation: fmt::Debug + Send + 'static;
    type Controller: Controller;

    fn build_state(client: &Client, name: String, options: Self::Options) -> Self::State;

    /// Applies one mutation. Implementations validate before touching `state`,
    /// so a rejected mutation leaves it unchanged.
    fn apply(state: &mut Self::State, mutation: Self::Mutation) -> Result<(), ModuleError>;

    fn build_controller(
        ctx: &BuildContext<'_>,
        proxy: Arc<dyn StoreProxy<Self>>,
    ) -> Arc<Self::Controller>;

    fn registry(root: &Providence) -> &Registry<Self::Controller>;

    fn store(root: &Providence) -> &Arc<dyn Store<Self>>;
}

/// Shared services handed to controllers at construction time.
pub struct BuildContext<'a> {
    pub client: &'a Arc<Client>,
    pub singles: &'a SingleScope,
}

/// A module's store proxy bound together with the services its tasks need.
pub(crate) struct BoundStore<'a, K: ModuleKind> {
    pub proxy: &'a dyn StoreProxy<K>,
    pub client: &'a Client,
    pub cancel: &'a AbortSlot,
}

impl<K: ModuleKind> BoundStore<'_, K> {
    pub fn state(&self) -> K::State {
        self.proxy.state()
    }

    pub fn commit(&self, mutation: K::Mutation) -> Result<(), ModuleError> {
        self.proxy.commit(mutation)
    }

    /// Commits a mutation that cannot be rejected by well-formed state; a
    /// rejection is logged rather than surfaced.
    pub fn apply(&self, mutation: K::Mutation) {
        commit_logged(self.proxy, mutation);
    }
}

pub(crate) fn commit_logged<K: ModuleKind>(proxy: &dyn StoreProxy<K>, mutation: K::Mutation) {
    if let Err(error) = proxy.commit(mutation) {
        tracing::error!(
            kind = K::KIND,
            module = proxy.name(),
            error = %error,
            "Mutation rejected"
        );
    }
}
