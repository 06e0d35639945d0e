use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use http::Method;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use super::{
    data_from_form, Field, FieldOptions, FieldSetting, Fielder, FormKind, FormMutation, FormState,
    FormTask,
};
use crate::client::Client;
use crate::contracts::{commit_logged, Controller};
use crate::derivers::FormErrorSet;
use crate::error::{ModuleError, Result};
use crate::fetchable::{AbortSlot, ErrorTracking};
use crate::namespace::{Namespace, NamespaceError};
use crate::store::StoreProxy;
use crate::transport::{NetRequest, TransportError};

/// Facade over one form module.
pub struct FormController {
    this: Weak<FormController>,
    store: Arc<dyn StoreProxy<FormKind>>,
    client: Arc<Client>,
    cancel: AbortSlot,
    fielders: Mutex<BTreeMap<String, Arc<Fielder>>>,
}

impl fmt::Debug for FormController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormController")
            .field("name", &self.store.name())
            .finish_non_exhaustive()
    }
}

impl FormController {
    pub(crate) fn new(client: Arc<Client>, store: Arc<dyn StoreProxy<FormKind>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            store,
            client,
            cancel: AbortSlot::new(),
            fielders: Mutex::new(BTreeMap::new()),
        })
    }

    fn mutate(&self, mutation: FormMutation) {
        commit_logged(self.store.as_ref(), mutation);
    }

    pub(crate) fn client(&self) -> &Arc<Client> {
        &self.client
    }

    pub fn state(&self) -> FormState {
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
    pub fn commit(&self, mutation: FormMutation) -> Result<(), ModuleError> {
        self.store.commit(mutation)
    }

    pub fn namespace(&self) -> Result<Namespace, NamespaceError> {
        Namespace::explode(self.store.name())
    }

    pub fn endpoint(&self) -> String {
        self.state().endpoint
    }

    pub fn set_endpoint(&self, endpoint: impl Into<String>) {
        self.mutate(FormMutation::SetEndpoint(endpoint.into()));
    }

    pub fn method(&self) -> String {
        self.state().method
    }

    pub fn set_method(&self, method: impl Into<String>) -> Result<(), ModuleError> {
        self.store.commit(FormMutation::SetMethod(method.into()))
    }

    pub fn sending(&self) -> bool {
        self.state().sending
    }

    pub fn step(&self) -> u32 {
        self.state().step
    }

    pub fn set_step(&self, step: u32) {
        self.mutate(FormMutation::SetStep(step));
    }

    pub fn disabled(&self) -> bool {
        self.state().disabled
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.mutate(FormMutation::SetDisabled(disabled));
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.mutate(FormMutation::SetPersistent(persistent));
    }

    pub fn status(&self) -> String {
        self.state().errors.status
    }

    pub fn set_status(&self, status: impl Into<String>) {
        let mut errors = self.errors();
        errors.status = status.into();
        self.mutate(FormMutation::SetMetaErrors(errors));
    }

    /// Form-level errors, not tied to any field.
    pub fn errors(&self) -> ErrorTracking {
        self.state().errors
    }

    pub fn set_meta_errors(&self, messages: Vec<String>) {
        let mut errors = self.errors();
        errors.messages = messages;
        self.mutate(FormMutation::SetMetaErrors(errors));
    }

    /// The payload `submit` would send right now.
    pub fn data(&self) -> Value {
        data_from_form(&self.state())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.state().fields.contains_key(name)
    }

    pub fn field(&self, name: &str) -> Option<Field> {
        self.state().fields.remove(name)
    }

    pub fn set_field_setting(&self, name: &str, setting: FieldSetting) -> Result<(), ModuleError> {
        self.store.commit(FormMutation::UpdateField {
            name: name.to_string(),
            setting,
        })
    }

    pub fn add_fields(&self, fields: BTreeMap<String, FieldOptions>) {
        let debounce = self.client.config.field_debounce_ms;
        let fields = fields
            .into_iter()
            .map(|(name, options)| (name, options.into_field(debounce)))
            .collect();
        self.mutate(FormMutation::AddFields(fields));
    }

    pub fn del_fields<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        {
            let mut fielders = self.fielders.lock();
            for name in &names {
                if let Some(fielder) = fielders.remove(name) {
                    fielder.cancel_validation();
                }
            }
        }
        self.mutate(FormMutation::DelFields(names));
    }

    pub fn set_errors(&self, errors: FormErrorSet) {
        self.mutate(FormMutation::SetErrors(errors));
    }

    pub fn clear_errors(&self) {
        self.mutate(FormMutation::ClearErrors);
    }

    /// Restores initial values, clears errors and returns to the first step.
    pub fn reset(&self) {
        self.stop_validators();
        self.mutate(FormMutation::ResetForm);
    }

    /// Restores the named fields to their initial values; unknown names are skipped.
    pub fn reset_fields<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mutate(FormMutation::ResetFields(
            names.into_iter().map(Into::into).collect(),
        ));
    }

    /// Cancels any network operation in flight for this form.
    pub fn kill(&self) {
        self.cancel.kill();
    }

    /// Cancels every pending or running field validation.
    pub fn stop_validators(&self) {
        let fielders: Vec<Arc<Fielder>> = self.fielders.lock().values().cloned().collect();
        for fielder in fielders {
            fielder.cancel_validation();
        }
    }

    /// Sends the form's data to its endpoint with its method.
    ///
    /// Resolves to the derived response value, or `Ok(None)` if the request
    /// was cancelled. On failure the errors are recorded in state (see
    /// [`FormController::handle_error`]) and also returned.
    pub async fn submit(&self) -> Result<Option<Value>> {
        self.stop_validators();
        let state = self.state();
        let method = Method::from_bytes(state.method.as_bytes()).map_err(|_| {
            ModuleError::InvalidMethod {
                method: state.method.clone(),
            }
        })?;
        let data = data_from_form(&state);
        self.mutate(FormMutation::SetSending(true));
        self.mutate(FormMutation::ClearErrors);

        let token = self.cancel.current();
        let request = NetRequest::new(method, state.endpoint.clone(), token.clone()).with_data(data);
        let result = self.client.transport.call(request).await;
        match result {
            Ok(_) if token.is_cancelled() => {
                self.mutate(FormMutation::SetSending(false));
                Ok(None)
            }
            Ok(response) => {
                self.mutate(FormMutation::SetSending(false));
                Ok(Some(self.client.derivers.derive_form(&response, &self.state())))
            }
            Err(error) if error.is_cancelled() => {
                debug!(module = self.store.name(), "Submission cancelled");
                self.mutate(FormMutation::SetSending(false));
                Ok(None)
            }
            Err(error) => {
                self.handle_error(&error);
                Err(error.into())
            }
        }
    }

    /// Records a failed submission: field and form errors, `sending` off, and
    /// the step rewound to the earliest step holding an errored field.
    pub fn handle_error(&self, error: &TransportError) {
        let state = self.state();
        let known: Vec<String> = state.fields.keys().cloned().collect();
        let errors = self.client.derivers.derive_errors(error, &known);
        self.stop_validators();

        let step = errors
            .fields
            .iter()
            .filter(|(_, messages)| !messages.is_empty())
            .filter_map(|(name, _)| state.fields.get(name).map(|field| field.step))
            .min()
            .unwrap_or(state.step);

        self.mutate(FormMutation::SetErrors(errors));
        self.mutate(FormMutation::SetSending(false));
        self.mutate(FormMutation::SetStep(step));
    }

    /// The field engine for `name`, or `None` once the field is gone.
    pub fn fielder(&self, name: &str) -> Option<Arc<Fielder>> {
        let mut fielders = self.fielders.lock();
        if !self.has_field(name) {
            if let Some(stale) = fielders.remove(name) {
                stale.cancel_validation();
            }
            return None;
        }
        let fielder = fielders
            .entry(name.to_string())
            .or_insert_with(|| Fielder::new(name.to_string(), self.this.clone()));
        Some(Arc::clone(fielder))
    }

    pub async fn dispatch(&self, task: FormTask) -> Result<Option<Value>> {
        match task {
            FormTask::Submit => self.submit().await,
            FormTask::Reset => {
                self.reset();
                Ok(None)
            }
            FormTask::ClearErrors => {
                self.clear_errors();
                Ok(None)
            }
        }
    }
}

impl Controller for FormController {
    fn name(&self) -> String {
        self.store.name().to_string()
    }

    fn persistent(&self) -> bool {
        self.state().persistent
    }

    fn pre_destroy(&self) {
        self.stop_validators();
        self.cancel.kill();
    }
}
