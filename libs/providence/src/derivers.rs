//! Translation of raw responses and failures into module values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ModuleError;
use crate::fetchable::UNKNOWN_STATUS;
use crate::forms::FormState;
use crate::lists::ListState;
use crate::paginator::{PageInfo, PaginationResult};
use crate::singles::SingleState;
use crate::transport::{NetResponse, TransportError, TIMEOUT_CODE};

const TIMEOUT_MESSAGE: &str = "Timed out or aborted. Please try again or contact support.";
const UNKNOWN_MESSAGE: &str = "We had an issue contacting the server. Please try again later.";

/// Error information derived from a failed request, split into messages
/// that belong to known form fields and messages that do not.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormErrorSet {
    pub status: String,
    pub messages: Vec<String>,
    pub fields: BTreeMap<String, Vec<String>>,
}

/// Pluggable response interpretation.
pub trait Derivers: Send + Sync {
    fn derive_single(&self, response: &NetResponse, state: &SingleState) -> Value;

    fn derive_list(
        &self,
        response: &NetResponse,
        state: &ListState,
    ) -> Result<PaginationResult, ModuleError>;

    fn derive_form(&self, response: &NetResponse, state: &FormState) -> Value;

    fn derive_errors(&self, error: &TransportError, known_fields: &[String]) -> FormErrorSet;
}

/// Derivers for REST backends that return entities at the body root and
/// paginate as `{results, count, size}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultDerivers;

impl Derivers for DefaultDerivers {
    fn derive_single(&self, response: &NetResponse, _state: &SingleState) -> Value {
        response.data.clone()
    }

    fn derive_list(
        &self,
        response: &NetResponse,
        state: &ListState,
    ) -> Result<PaginationResult, ModuleError> {
        let malformed = |reason: &str| ModuleError::MalformedResponse {
            name: state.meta.name.clone(),
            reason: reason.to_string(),
        };
        if !state.paginated {
            let list = response
                .data
                .as_array()
                .cloned()
                .ok_or_else(|| malformed("expected a JSON array"))?;
            return Ok(PaginationResult {
                list,
                page_info: None,
            });
        }

        let list = response
            .data
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| malformed("expected a 'results' array"))?;
        let count = response.data.get("count").and_then(Value::as_u64);
        let size = response.data.get("size").and_then(Value::as_u64);
        let page_info = match (count, size) {
            (Some(count), Some(size)) => Some(PageInfo { count, size }),
            _ => None,
        };
        Ok(PaginationResult { list, page_info })
    }

    fn derive_form(&self, response: &NetResponse, _state: &FormState) -> Value {
        response.data.clone()
    }

    fn derive_errors(&self, error: &TransportError, known_fields: &[String]) -> FormErrorSet {
        let mut set = FormErrorSet {
            status: error.status_label(),
            ..FormErrorSet::default()
        };

        let Some(Value::Object(data)) = &error.data else {
            let message = match error.code.as_deref() {
                Some(TIMEOUT_CODE) => TIMEOUT_MESSAGE,
                _ => UNKNOWN_MESSAGE,
            };
            set.messages.push(message.to_string());
            return set;
        };

        let mut unresolved = Vec::new();
        for (key, value) in data {
            if known_fields.iter().any(|field| field == key) {
                set.fields.insert(key.clone(), string_list(value));
            } else if key != "detail" {
                unresolved.push((key, string_list(value)));
            }
        }
        if let Some(detail) = data.get("detail") {
            set.messages.extend(string_list(detail));
        }
        set.messages
            .extend(unresolved.into_iter().map(|(key, messages)| {
                missing_field_message(key, &messages)
            }));
        set
    }
}

/// Message for server-side errors on fields the client does not know about.
pub fn missing_field_message(key: &str, messages: &[String]) -> String {
    format!(
        "Whoops! We had a coding error. Please contact support and tell them the following: {}: {}",
        key,
        messages.join(" ")
    )
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(value_text).collect(),
        Value::Null => Vec::new(),
        other => vec![value_text(other)],
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Fallback status for failures that are not transport errors.
pub(crate) fn unknown_errors(message: String) -> crate::fetchable::ErrorTracking {
    crate::fetchable::ErrorTracking {
        status: UNKNOWN_STATUS.to_string(),
        messages: vec![message],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn splits_known_fields_detail_and_unknown_keys() {
        let error = TransportError::http(
            400,
            json!({
                "email": ["Enter a valid email."],
                "detail": "Submission rejected.",
                "secret": ["Required.", "Really."],
            }),
        );
        let set = DefaultDerivers.derive_errors(&error, &fields(&["email", "name"]));

        assert_eq!(set.status, "400");
        assert_eq!(set.fields["email"], vec!["Enter a valid email."]);
        assert!(!set.fields.contains_key("secret"));
        assert_eq!(
            set.messages,
            vec![
                "Submission rejected.".to_string(),
                "Whoops! We had a coding error. Please contact support and tell them the following: secret: Required. Really.".to_string(),
            ]
        );
    }

    #[test]
    fn timeouts_translate_to_friendly_message() {
        let error = TransportError::network(TIMEOUT_CODE, "timed out");
        let set = DefaultDerivers.derive_errors(&error, &[]);
        assert_eq!(set.status, TIMEOUT_CODE);
        assert_eq!(set.messages, vec![TIMEOUT_MESSAGE.to_string()]);
    }

    #[test]
    fn non_object_bodies_fall_back_to_unknown() {
        let error = TransportError::http(502, json!("<html>bad gateway</html>"));
        let set = DefaultDerivers.derive_errors(&error, &[]);
        assert_eq!(set.messages, vec![UNKNOWN_MESSAGE.to_string()]);
        assert!(set.fields.is_empty());
    }

    #[test]
    fn paginated_lists_read_results_and_page_info() {
        let mut state = ListState::new("list.todos");
        let response = NetResponse::ok(json!({"results": [{"id": 1}], "count": 30, "size": 24}));
        let result = DefaultDerivers.derive_list(&response, &state).unwrap();
        assert_eq!(result.list, vec![json!({"id": 1})]);
        assert_eq!(result.page_info, Some(PageInfo { count: 30, size: 24 }));

        state.paginated = false;
        let response = NetResponse::ok(json!([{"id": 1}, {"id": 2}]));
        let result = DefaultDerivers.derive_list(&response, &state).unwrap();
        assert_eq!(result.list.len(), 2);
        assert!(result.page_info.is_none());
    }

    #[test]
    fn malformed_list_bodies_are_rejected() {
        let state = ListState::new("list.todos");
        let err = DefaultDerivers
            .derive_list(&NetResponse::ok(json!({"items": []})), &state)
            .unwrap_err();
        assert!(matches!(err, ModuleError::MalformedResponse { .. }));
    }
}
