//! Mapping fetched entries onto child single modules.

use std::collections::HashSet;

use serde_json::Value;
use tracing::warn;

use super::ListState;
use crate::contracts::commit_logged;
use crate::error::Result;
use crate::namespace::Namespace;
use crate::registry::ListenerId;
use crate::runtime::SingleScope;
use crate::singles::{SingleMutation, SingleOptions};

/// The listener identity a list registers on its children.
pub(crate) fn owner(state: &ListState) -> ListenerId {
    ListenerId::from(state.meta.name.as_str())
}

fn entry_key(entry: &Value, key_prop: &str) -> Option<String> {
    match entry.get(key_prop)? {
        Value::String(key) if !key.is_empty() => Some(key.clone()),
        Value::Number(key) => Some(key.to_string()),
        Value::Bool(key) => Some(key.to_string()),
        _ => None,
    }
}

/// Ensures a child single module exists for every entry and returns their
/// flattened names in entry order.
///
/// Children that already exist get the entry pushed into them. Entries not
/// yet referenced by the list register the list as a listener on the child.
pub(crate) fn add_modules(
    state: &ListState,
    singles: &SingleScope,
    entries: &[Value],
) -> Result<Vec<String>> {
    let base = Namespace::explode(&state.meta.name)?;
    let append = if state.meta.endpoint.ends_with('/') { "/" } else { "" };
    let owner = owner(state);
    let mut refs = Vec::with_capacity(entries.len());

    for entry in entries {
        let Some(key) = entry_key(entry, &state.key_prop) else {
            warn!(
                list = %state.meta.name,
                key_prop = %state.key_prop,
                "Entry has no usable key; skipped"
            );
            continue;
        };
        let namespace = base.child(key.clone())?;
        let name = namespace.flatten();
        refs.push(name.clone());

        if singles.store().contains(&name) {
            match singles.store().proxy(&name) {
                Ok(proxy) => commit_logged(proxy.as_ref(), SingleMutation::SetX(Some(entry.clone()))),
                Err(error) => warn!(entry = %name, %error, "Could not refresh child value"),
            }
        }
        if state.refs.contains(&name) {
            continue;
        }

        let options = SingleOptions::new()
            .endpoint(format!("{}{}{}", state.meta.endpoint, key, append))
            .x(entry.clone())
            .ready(true);
        singles.acquire(&namespace, Some(options), &owner)?;
    }
    Ok(refs)
}

/// Drops the list's hold on children that are no longer referenced.
pub(crate) fn release_abandoned(state: &ListState, refs: &[String], singles: &SingleScope) {
    let owner = owner(state);
    let keep: HashSet<&String> = refs.iter().collect();
    for name in state.refs.iter().filter(|name| !keep.contains(name)) {
        match Namespace::explode(name) {
            Ok(namespace) => {
                singles.registry().remover(namespace).remove(&owner);
            }
            Err(error) => warn!(entry = %name, %error, "Unparseable list reference"),
        }
    }
}

/// Concatenates two reference lists, keeping the first occurrence of each name.
pub(crate) fn merge_refs(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    first
        .iter()
        .chain(second)
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn merge_keeps_first_occurrence() {
        assert_eq!(
            merge_refs(&names(&["a", "b"]), &names(&["b", "c", "a"])),
            names(&["a", "b", "c"])
        );
        assert_eq!(merge_refs(&names(&["x", "x"]), &[]), names(&["x"]));
    }

    #[test]
    fn keys_accept_strings_and_numbers() {
        assert_eq!(entry_key(&json!({"id": 4}), "id").as_deref(), Some("4"));
        assert_eq!(entry_key(&json!({"slug": "a.b"}), "slug").as_deref(), Some("a.b"));
        assert_eq!(entry_key(&json!({"id": null}), "id"), None);
        assert_eq!(entry_key(&json!({"id": ""}), "id"), None);
        assert_eq!(entry_key(&json!({}), "id"), None);
    }
}
