//! Form modules: named fields, client-side validation, and submission.

mod controller;
mod fielder;
pub mod validators;

pub use controller::FormController;
pub use fielder::Fielder;

use std::collections::BTreeMap;
use std::sync::Arc;

use http::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::client::Client;
use crate::contracts::{BuildContext, ModuleKind};
use crate::derivers::FormErrorSet;
use crate::error::ModuleError;
use crate::fetchable::{ErrorTracking, LOCAL_ENDPOINT};
use crate::registry::Registry;
use crate::runtime::Providence;
use crate::store::{Store, StoreProxy};

use validators::ValidatorSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub value: Value,
    pub initial_value: Value,
    pub errors: Vec<String>,
    pub disabled: bool,
    /// Milliseconds of quiet before validators run.
    pub debounce: u64,
    /// Wizard step this field belongs to.
    pub step: u32,
    pub validators: Vec<ValidatorSpec>,
    /// Omit the field from submitted data while its value equals this.
    pub omit_if: Option<Value>,
}

/// Declaration of a field; unset settings take defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOptions {
    pub value: Value,
    pub initial_value: Option<Value>,
    pub disabled: bool,
    pub debounce: Option<u64>,
    pub step: u32,
    pub validators: Vec<ValidatorSpec>,
    pub omit_if: Option<Value>,
}

impl FieldOptions {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            initial_value: None,
            disabled: false,
            debounce: None,
            step: 1,
            validators: Vec::new(),
            omit_if: None,
        }
    }

    pub fn initial_value(mut self, initial_value: Value) -> Self {
        self.initial_value = Some(initial_value);
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn debounce(mut self, millis: u64) -> Self {
        self.debounce = Some(millis);
        self
    }

    pub fn step(mut self, step: u32) -> Self {
        self.step = step;
        self
    }

    pub fn validator(mut self, spec: ValidatorSpec) -> Self {
        self.validators.push(spec);
        self
    }

    pub fn omit_if(mut self, omit_if: Value) -> Self {
        self.omit_if = Some(omit_if);
        self
    }

    /// Resolves defaults. The initial value falls back to the value.
    pub fn into_field(self, default_debounce: u64) -> Field {
        Field {
            initial_value: self.initial_value.unwrap_or_else(|| self.value.clone()),
            value: self.value,
            errors: Vec::new(),
            disabled: self.disabled,
            debounce: self.debounce.unwrap_or(default_debounce),
            step: self.step,
            validators: self.validators,
            omit_if: self.omit_if,
        }
    }
}

/// One setting of one field, for [`FormMutation::UpdateField`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSetting {
    Value(Value),
    InitialValue(Value),
    Errors(Vec<String>),
    Disabled(bool),
    Debounce(u64),
    Step(u32),
    Validators(Vec<ValidatorSpec>),
    OmitIf(Option<Value>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormState {
    pub name: String,
    pub endpoint: String,
    pub method: String,
    pub errors: ErrorTracking,
    pub disabled: bool,
    pub persistent: bool,
    pub sending: bool,
    pub step: u32,
    pub fields: BTreeMap<String, Field>,
}

impl FormState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: LOCAL_ENDPOINT.to_string(),
            method: Method::POST.to_string(),
            errors: ErrorTracking::default(),
            disabled: false,
            persistent: false,
            sending: false,
            step: 1,
            fields: BTreeMap::new(),
        }
    }

    fn clear_errors(&mut self) {
        self.errors = ErrorTracking::default();
        for field in self.fields.values_mut() {
            field.errors.clear();
        }
    }
}

/// Submittable data: every field's value, minus fields whose value equals
/// their `omit_if` sentinel.
pub fn data_from_form(state: &FormState) -> Value {
    let data: Map<String, Value> = state
        .fields
        .iter()
        .filter(|(_, field)| field.omit_if.as_ref() != Some(&field.value))
        .map(|(name, field)| (name.clone(), field.value.clone()))
        .collect();
    Value::Object(data)
}

#[derive(Debug, Clone)]
pub struct FormOptions {
    pub endpoint: Option<String>,
    pub method: Method,
    pub disabled: bool,
    pub persistent: bool,
    pub fields: BTreeMap<String, FieldOptions>,
}

impl Default for FormOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            method: Method::POST,
            disabled: false,
            persistent: false,
            fields: BTreeMap::new(),
        }
    }
}

impl FormOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn field(mut self, name: impl Into<String>, field: FieldOptions) -> Self {
        self.fields.insert(name.into(), field);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormMutation {
    /// Sets form and field errors; fields absent from the set are cleared.
    SetErrors(FormErrorSet),
    SetEndpoint(String),
    SetStep(u32),
    SetSending(bool),
    SetMethod(String),
    SetPersistent(bool),
    SetDisabled(bool),
    ClearErrors,
    SetMetaErrors(ErrorTracking),
    UpdateField { name: String, setting: FieldSetting },
    AddFields(BTreeMap<String, Field>),
    DelFields(Vec<String>),
    /// Restores every field to its initial value, clears errors, returns to step 1.
    ResetForm,
    ResetFields(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FormTask {
    Submit,
    Reset,
    ClearErrors,
}

pub struct FormKind;

impl ModuleKind for FormKind {
    const KIND: &'static str = "form";

    type Options = FormOptions;
    type State = FormState;
    type Mutation = FormMutation;
    type Controller = FormController;

    fn build_state(client: &Client, name: String, options: FormOptions) -> FormState {
        let mut state = FormState::new(name);
        if let Some(endpoint) = options.endpoint {
            state.endpoint = endpoint;
        }
        state.method = options.method.to_string();
        state.disabled = options.disabled;
        state.persistent = options.persistent;
        state.fields = options
            .fields
            .into_iter()
            .map(|(name, field)| (name, field.into_field(client.config.field_debounce_ms)))
            .collect();
        state
    }

    fn apply(state: &mut FormState, mutation: FormMutation) -> Result<(), ModuleError> {
        match mutation {
            FormMutation::SetErrors(set) => {
                state.errors = ErrorTracking {
                    status: set.status,
                    messages: set.messages,
                };
                for (name, field) in state.fields.iter_mut() {
                    field.errors = set.fields.get(name).cloned().unwrap_or_default();
                }
            }
            FormMutation::SetEndpoint(endpoint) => state.endpoint = endpoint,
            FormMutation::SetStep(step) => state.step = step,
            FormMutation::SetSending(sending) => state.sending = sending,
            FormMutation::SetMethod(method) => {
                Method::from_bytes(method.as_bytes())
                    .map_err(|_| ModuleError::InvalidMethod { method: method.clone() })?;
                state.method = method;
            }
            FormMutation::SetPersistent(persistent) => state.persistent = persistent,
            FormMutation::SetDisabled(disabled) => state.disabled = disabled,
            FormMutation::ClearErrors => state.clear_errors(),
            FormMutation::SetMetaErrors(errors) => state.errors = errors,
            FormMutation::UpdateField { name, setting } => {
                let Some(field) = state.fields.get_mut(&name) else {
                    return Err(ModuleError::UnknownField {
                        name: state.name.clone(),
                        field: name,
                    });
                };
                match setting {
                    FieldSetting::Value(value) => field.value = value,
                    FieldSetting::InitialValue(value) => field.initial_value = value,
                    FieldSetting::Errors(errors) => field.errors = errors,
                    FieldSetting::Disabled(disabled) => field.disabled = disabled,
                    FieldSetting::Debounce(debounce) => field.debounce = debounce,
                    FieldSetting::Step(step) => field.step = step,
                    FieldSetting::Validators(validators) => field.validators = validators,
                    FieldSetting::OmitIf(omit_if) => field.omit_if = omit_if,
                }
            }
            FormMutation::AddFields(fields) => state.fields.extend(fields),
            FormMutation::DelFields(names) => {
                for name in names {
                    state.fields.remove(&name);
                }
            }
            FormMutation::ResetForm => {
                for field in state.fields.values_mut() {
                    field.value = field.initial_value.clone();
                }
                state.clear_errors();
                state.step = 1;
            }
            FormMutation::ResetFields(names) => {
                for name in names {
                    if let Some(field) = state.fields.get_mut(&name) {
                        field.errors.clear();
                        field.value = field.initial_value.clone();
                    }
                }
            }
        }
        Ok(())
    }

    fn build_controller(
        ctx: &BuildContext<'_>,
        proxy: Arc<dyn StoreProxy<Self>>,
    ) -> Arc<FormController> {
        FormController::new(Arc::clone(ctx.client), proxy)
    }

    fn registry(root: &Providence) -> &Registry<FormController> {
        root.forms()
    }

    fn store(root: &Providence) -> &Arc<dyn Store<Self>> {
        root.form_store()
    }
}
