//! The root object: shared client, one registry and one store per module kind.

use std::fmt;
use std::sync::Arc;

use crate::client::Client;
use crate::config::ProvidenceConfig;
use crate::contracts::{BuildContext, ModuleKind};
use crate::derivers::{DefaultDerivers, Derivers};
use crate::error::Result;
use crate::forms::validators::{Validator, ValidatorRegistry};
use crate::forms::{FormController, FormKind, FormOptions};
use crate::lists::{ListController, ListKind, ListOptions};
use crate::namespace::Namespace;
use crate::paginator::{DefaultPaginator, Paginator};
use crate::registry::{ListenerId, Registration, Registry, RegistryError};
use crate::singles::{SingleController, SingleKind, SingleOptions};
use crate::store::{MemoryStore, Store};
use crate::transport::{HttpTransport, Transport};

/// Everything needed to acquire single modules.
///
/// Lists hold one of these to manage their children without holding the root.
#[derive(Clone)]
pub struct SingleScope {
    client: Arc<Client>,
    registry: Registry<SingleController>,
    store: Arc<dyn Store<SingleKind>>,
}

impl fmt::Debug for SingleScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleScope")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl SingleScope {
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn registry(&self) -> &Registry<SingleController> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn Store<SingleKind>> {
        &self.store
    }

    pub fn acquire(
        &self,
        namespace: &Namespace,
        options: Option<SingleOptions>,
        listener: &ListenerId,
    ) -> Result<Registration<SingleController>, RegistryError> {
        acquire::<SingleKind>(self, &self.registry, &self.store, namespace, options, listener)
    }
}

fn acquire<K: ModuleKind>(
    singles: &SingleScope,
    registry: &Registry<K::Controller>,
    store: &Arc<dyn Store<K>>,
    namespace: &Namespace,
    options: Option<K::Options>,
    listener: &ListenerId,
) -> Result<Registration<K::Controller>, RegistryError> {
    let build = options.map(|options| {
        move || {
            let name = namespace.flatten();
            let state = K::build_state(&singles.client, name.clone(), options);
            let teardown = store.add_module(&name, state);
            match store.proxy(&name) {
                Ok(proxy) => {
                    let ctx = BuildContext {
                        client: &singles.client,
                        singles,
                    };
                    Ok((K::build_controller(&ctx, proxy), teardown))
                }
                Err(error) => {
                    teardown();
                    Err(error)
                }
            }
        }
    });
    registry.get_or_create(namespace, build, listener)
}

/// Root of a state-sync tree.
#[derive(Clone)]
pub struct Providence {
    singles: SingleScope,
    lists: Registry<ListController>,
    list_store: Arc<dyn Store<ListKind>>,
    forms: Registry<FormController>,
    form_store: Arc<dyn Store<FormKind>>,
}

impl fmt::Debug for Providence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Providence")
            .field("singles", &self.singles.registry)
            .field("lists", &self.lists)
            .field("forms", &self.forms)
            .finish()
    }
}

impl Providence {
    pub fn builder() -> ProvidenceBuilder {
        ProvidenceBuilder::default()
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.singles.client
    }

    pub fn config(&self) -> &ProvidenceConfig {
        &self.singles.client.config
    }

    pub fn singles(&self) -> &SingleScope {
        &self.singles
    }

    pub fn lists(&self) -> &Registry<ListController> {
        &self.lists
    }

    pub fn list_store(&self) -> &Arc<dyn Store<ListKind>> {
        &self.list_store
    }

    pub fn forms(&self) -> &Registry<FormController> {
        &self.forms
    }

    pub fn form_store(&self) -> &Arc<dyn Store<FormKind>> {
        &self.form_store
    }

    /// Returns the controller for `namespace`, creating it from `options` if
    /// absent, and records `listener` as holding it.
    ///
    /// `options` may be `None` only when the module already exists.
    pub fn acquire<K: ModuleKind>(
        &self,
        namespace: &Namespace,
        options: Option<K::Options>,
        listener: &ListenerId,
    ) -> Result<Registration<K::Controller>> {
        let registration = acquire::<K>(
            &self.singles,
            K::registry(self),
            K::store(self),
            namespace,
            options,
            listener,
        )?;
        Ok(registration)
    }

    pub fn single(
        &self,
        namespace: &Namespace,
        options: Option<SingleOptions>,
        listener: &ListenerId,
    ) -> Result<Registration<SingleController>> {
        self.acquire::<SingleKind>(namespace, options, listener)
    }

    pub fn list(
        &self,
        namespace: &Namespace,
        options: Option<ListOptions>,
        listener: &ListenerId,
    ) -> Result<Registration<ListController>> {
        self.acquire::<ListKind>(namespace, options, listener)
    }

    pub fn form(
        &self,
        namespace: &Namespace,
        options: Option<FormOptions>,
        listener: &ListenerId,
    ) -> Result<Registration<FormController>> {
        self.acquire::<FormKind>(namespace, options, listener)
    }

    /// Forcibly destroys a module that no listener holds anymore.
    pub fn destroy<K: ModuleKind>(&self, namespace: &Namespace) -> Result<()> {
        K::registry(self).destroy(namespace)?;
        Ok(())
    }
}

/// Assembles a [`Providence`] root, defaulting every service not supplied.
pub struct ProvidenceBuilder {
    config: ProvidenceConfig,
    transport: Option<Arc<dyn Transport>>,
    derivers: Option<Arc<dyn Derivers>>,
    paginator: Option<Arc<dyn Paginator>>,
    validators: ValidatorRegistry,
    single_store: Option<Arc<dyn Store<SingleKind>>>,
    list_store: Option<Arc<dyn Store<ListKind>>>,
    form_store: Option<Arc<dyn Store<FormKind>>>,
}

impl Default for ProvidenceBuilder {
    fn default() -> Self {
        Self {
            config: ProvidenceConfig::default(),
            transport: None,
            derivers: None,
            paginator: None,
            validators: ValidatorRegistry::with_defaults(),
            single_store: None,
            list_store: None,
            form_store: None,
        }
    }
}

impl ProvidenceBuilder {
    pub fn config(mut self, config: ProvidenceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn derivers(mut self, derivers: Arc<dyn Derivers>) -> Self {
        self.derivers = Some(derivers);
        self
    }

    pub fn paginator(mut self, paginator: Arc<dyn Paginator>) -> Self {
        self.paginator = Some(paginator);
        self
    }

    pub fn validator(mut self, name: impl Into<String>, validator: Arc<dyn Validator>) -> Self {
        self.validators.register(name, validator);
        self
    }

    pub fn validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = validators;
        self
    }

    pub fn single_store(mut self, store: Arc<dyn Store<SingleKind>>) -> Self {
        self.single_store = Some(store);
        self
    }

    pub fn list_store(mut self, store: Arc<dyn Store<ListKind>>) -> Self {
        self.list_store = Some(store);
        self
    }

    pub fn form_store(mut self, store: Arc<dyn Store<FormKind>>) -> Self {
        self.form_store = Some(store);
        self
    }

    pub fn build(self) -> Result<Providence> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&self.config)?),
        };
        let paginator = self
            .paginator
            .unwrap_or_else(|| Arc::new(DefaultPaginator::new(self.config.page_size)));
        let derivers = self.derivers.unwrap_or_else(|| Arc::new(DefaultDerivers));

        tracing::info!(
            base_url = ?self.config.base_url,
            validators = ?self.validators.names(),
            "Providence root initialized"
        );

        let client = Arc::new(Client {
            config: self.config,
            transport,
            derivers,
            paginator,
            validators: self.validators,
        });

        Ok(Providence {
            singles: SingleScope {
                client,
                registry: Registry::new(SingleKind::KIND),
                store: self
                    .single_store
                    .unwrap_or_else(|| Arc::new(MemoryStore::<SingleKind>::new())),
            },
            lists: Registry::new(ListKind::KIND),
            list_store: self
                .list_store
                .unwrap_or_else(|| Arc::new(MemoryStore::<ListKind>::new())),
            forms: Registry::new(FormKind::KIND),
            form_store: self
                .form_store
                .unwrap_or_else(|| Arc::new(MemoryStore::<FormKind>::new())),
        })
    }
}
