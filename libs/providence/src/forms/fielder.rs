//! Per-field engine for form inputs: debounced client-side validation.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{Field, FieldSetting, FormController};
use super::validators::ValidatorArgs;
use crate::contracts::Controller;

/// Handle on one field of a form.
///
/// Writing the model stores the value at once and schedules the field's
/// validators after its debounce. A newer edit or an explicit cancel aborts
/// both the scheduled run and one already under way.
pub struct Fielder {
    field: String,
    form: Weak<FormController>,
    token: Mutex<CancellationToken>,
}

impl fmt::Debug for Fielder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fielder").field("field", &self.field).finish()
    }
}

impl Fielder {
    pub(crate) fn new(field: String, form: Weak<FormController>) -> Arc<Self> {
        Arc::new(Self {
            field,
            form,
            token: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn field_name(&self) -> &str {
        &self.field
    }

    fn form(&self) -> Option<Arc<FormController>> {
        self.form.upgrade()
    }

    fn snapshot(&self) -> Option<Field> {
        self.form()?.field(&self.field)
    }

    fn update(&self, setting: FieldSetting) {
        let Some(form) = self.form() else {
            return;
        };
        if let Err(error) = form.set_field_setting(&self.field, setting) {
            tracing::warn!(form = %form.name(), field = %self.field, %error, "Field update dropped");
        }
    }

    pub fn raw_value(&self) -> Option<Value> {
        self.snapshot().map(|field| field.value)
    }

    /// Writes the value without triggering validation.
    pub fn set_raw_value(&self, value: Value) {
        self.update(FieldSetting::Value(value));
    }

    /// An owned copy of the current value.
    pub fn model(&self) -> Option<Value> {
        self.raw_value()
    }

    /// Writes the value and schedules validation. Must be called inside a
    /// Tokio runtime.
    pub fn set_model(self: &Arc<Self>, value: Value) {
        self.set_raw_value(value);
        self.validate();
    }

    pub fn errors(&self) -> Vec<String> {
        self.snapshot().map(|field| field.errors).unwrap_or_default()
    }

    pub fn set_errors(&self, errors: Vec<String>) {
        self.update(FieldSetting::Errors(errors));
    }

    pub fn debounce(&self) -> Option<u64> {
        self.snapshot().map(|field| field.debounce)
    }

    pub fn set_debounce(&self, millis: u64) {
        self.update(FieldSetting::Debounce(millis));
    }

    pub fn disabled(&self) -> bool {
        self.snapshot().is_some_and(|field| field.disabled)
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.update(FieldSetting::Disabled(disabled));
    }

    pub fn step(&self) -> Option<u32> {
        self.snapshot().map(|field| field.step)
    }

    pub fn set_step(&self, step: u32) {
        self.update(FieldSetting::Step(step));
    }

    pub fn initial_value(&self) -> Option<Value> {
        self.snapshot().map(|field| field.initial_value)
    }

    pub fn set_initial_value(&self, value: Value) {
        self.update(FieldSetting::InitialValue(value));
    }

    /// Restores the initial value and clears this field's errors.
    pub fn reset(&self) {
        self.cancel_validation();
        if let Some(form) = self.form() {
            form.reset_fields([self.field.as_str()]);
        }
    }

    fn renew_token(&self) -> CancellationToken {
        let mut token = self.token.lock();
        token.cancel();
        *token = CancellationToken::new();
        token.clone()
    }

    /// Schedules a validation run after the field's debounce, superseding any
    /// earlier one.
    pub fn validate(self: &Arc<Self>) {
        let token = self.renew_token();
        let delay = Duration::from_millis(self.debounce().unwrap_or_default());
        let fielder = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => fielder.run_validators(token.clone()).await,
            }
        });
    }

    /// Runs validation immediately, superseding any scheduled run.
    pub async fn validate_now(&self) {
        let token = self.renew_token();
        self.run_validators(token).await;
    }

    /// Aborts scheduled and running validation. Errors already recorded stay.
    pub fn cancel_validation(&self) {
        self.renew_token();
    }

    async fn run_validators(&self, token: CancellationToken) {
        let Some(form) = self.form() else {
            return;
        };
        let state = form.state();
        let Some(field) = state.fields.get(&self.field).cloned() else {
            return;
        };

        let registry = &form.client().validators;
        let mut runs = Vec::with_capacity(field.validators.len());
        for spec in &field.validators {
            let Some(validator) = registry.get(&spec.name) else {
                tracing::error!(
                    form = %form.name(),
                    field = %self.field,
                    validator = %spec.name,
                    available = ?registry.names(),
                    "Unregistered validator"
                );
                continue;
            };
            let args = ValidatorArgs {
                value: field.value.clone(),
                args: spec.args.clone().unwrap_or(Value::Null),
                field_name: self.field.clone(),
                form_state: state.clone(),
                signal: token.clone(),
            };
            runs.push(async move { validator.validate(args).await });
        }

        let results = tokio::select! {
            _ = token.cancelled() => return,
            results = join_all(runs) => results,
        };
        if token.is_cancelled() {
            return;
        }
        self.set_errors(results.into_iter().flatten().collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forms::validators::{validator_fn, ValidatorSpec, EMAIL};
    use crate::forms::{FieldOptions, FormOptions};
    use crate::namespace::Namespace;
    use crate::registry::ListenerId;
    use crate::runtime::Providence;
    use crate::testing::MockTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn form_with(root: &Providence, field: FieldOptions) -> Arc<FormController> {
        root.form(
            &Namespace::new(["contact"]).unwrap(),
            Some(FormOptions::new().field("email", field)),
            &ListenerId::new(),
        )
        .unwrap()
        .controller
    }

    #[tokio::test(start_paused = true)]
    async fn model_writes_then_validates_after_debounce() {
        let root = crate::testing::providence(Arc::new(MockTransport::new()));
        let form = form_with(
            &root,
            FieldOptions::new(json!("")).validator(ValidatorSpec::new(EMAIL)),
        );
        let fielder = form.fielder("email").unwrap();

        fielder.set_model(json!("fox"));
        assert_eq!(fielder.model(), Some(json!("fox")));
        assert!(fielder.errors().is_empty());

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(fielder.errors(), vec!["Emails must contain an @.".to_string()]);

        fielder.set_model(json!("fox@example.com"));
        tokio::time::sleep(Duration::from_millis(501)).await;
        assert!(fielder.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_collapse_into_one_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let root = Providence::builder()
            .transport(Arc::new(MockTransport::new()))
            .validator(
                "count",
                validator_fn(move |_args| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Vec::new()
                    }
                }),
            )
            .build()
            .unwrap();
        let form = form_with(
            &root,
            FieldOptions::new(json!(""))
                .debounce(100)
                .validator(ValidatorSpec::new("count")),
        );
        let fielder = form.fielder("email").unwrap();

        for value in ["a", "ab", "abc"] {
            fielder.set_model(json!(value));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(fielder.raw_value(), Some(json!("abc")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_validation_never_writes_errors() {
        let root = crate::testing::providence(Arc::new(MockTransport::new()));
        let form = form_with(
            &root,
            FieldOptions::new(json!("")).validator(ValidatorSpec::new(EMAIL)),
        );
        let fielder = form.fielder("email").unwrap();

        fielder.set_model(json!("bad"));
        form.stop_validators();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(fielder.errors().is_empty());
    }

    #[tokio::test]
    async fn unregistered_validators_are_skipped() {
        let root = crate::testing::providence(Arc::new(MockTransport::new()));
        let form = form_with(
            &root,
            FieldOptions::new(json!("nope"))
                .validator(ValidatorSpec::new("missing"))
                .validator(ValidatorSpec::new(EMAIL)),
        );
        let fielder = form.fielder("email").unwrap();
        fielder.validate_now().await;
        assert_eq!(fielder.errors(), vec!["Emails must contain an @.".to_string()]);
    }

    #[tokio::test]
    async fn reset_restores_initial_value() {
        let root = crate::testing::providence(Arc::new(MockTransport::new()));
        let form = form_with(&root, FieldOptions::new(json!("start")));
        let fielder = form.fielder("email").unwrap();
        fielder.set_raw_value(json!("changed"));
        fielder.set_errors(vec!["x".into()]);
        fielder.reset();
        assert_eq!(fielder.model(), Some(json!("start")));
        assert!(fielder.errors().is_empty());
        assert_eq!(fielder.initial_value(), Some(json!("start")));
    }
}
