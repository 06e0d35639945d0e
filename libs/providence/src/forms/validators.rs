//! Field validators and the registry that names them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::FormState;

/// Name under which [`EmailValidator`] is registered by default.
pub const EMAIL: &str = "email";

/// A validator attached to a field: registry name plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSpec {
    pub name: String,
    #[serde(default)]
    pub args: Option<Value>,
}

impl ValidatorSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = Some(args);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ValidatorArgs {
    pub value: Value,
    pub args: Value,
    pub field_name: String,
    pub form_state: FormState,
    /// Fires when this validation run is superseded.
    pub signal: CancellationToken,
}

/// Checks one field value, yielding zero or more error messages.
#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, args: ValidatorArgs) -> Vec<String>;
}

struct FnValidator<F>(F);

#[async_trait]
impl<F, Fut> Validator for FnValidator<F>
where
    F: Fn(ValidatorArgs) -> Fut + Send + Sync,
    Fut: Future<Output = Vec<String>> + Send,
{
    async fn validate(&self, args: ValidatorArgs) -> Vec<String> {
        (self.0)(args).await
    }
}

/// Wraps an async closure as a [`Validator`].
pub fn validator_fn<F, Fut>(f: F) -> Arc<dyn Validator>
where
    F: Fn(ValidatorArgs) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<String>> + Send + 'static,
{
    Arc::new(FnValidator(f))
}

/// Validators available to form fields, by name.
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("validators", &self.names())
            .finish()
    }
}

impl ValidatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the bundled validators.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(EMAIL, Arc::new(EmailValidator));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, validator: Arc<dyn Validator>) {
        let name = name.into();
        if self.validators.insert(name.clone(), validator).is_some() {
            tracing::debug!(validator = %name, "Validator replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Validator>> {
        self.validators.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.validators.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Loose structural check on email addresses.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmailValidator;

impl EmailValidator {
    pub fn check(value: &str) -> Vec<String> {
        if value.trim().is_empty() {
            return Vec::new();
        }
        let parts: Vec<&str> = value.split('@').collect();
        let [front, back] = parts.as_slice() else {
            return vec!["Emails must contain an @.".to_string()];
        };
        let front = front.trim_start();
        let back = back.trim_end();
        let message = if front.is_empty() {
            "You must include the username in front of the @."
        } else if back.is_empty() {
            "You must include the domain name after the @."
        } else if front.chars().any(char::is_whitespace) {
            "Emails cannot have a space in the section before the @."
        } else if back.chars().any(char::is_whitespace) {
            "Emails cannot have a space in the domain name."
        } else if !back.contains('.') {
            "Emails without a full domain name are not supported. (Did you forget the suffix?)"
        } else {
            return Vec::new();
        };
        vec![message.to_string()]
    }
}

#[async_trait]
impl Validator for EmailValidator {
    async fn validate(&self, args: ValidatorArgs) -> Vec<String> {
        match &args.value {
            Value::String(value) => Self::check(value),
            Value::Null => Vec::new(),
            other => Self::check(&other.to_string()),
        }
    }
}
