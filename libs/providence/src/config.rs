use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Runtime tuning for a [`crate::Providence`] root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidenceConfig {
    /// Quiet period before a patcher sends its cached value.
    #[serde(default = "default_patcher_debounce_ms")]
    pub patcher_debounce_ms: u64,
    /// Default quiet period before a form field runs its validators.
    #[serde(default = "default_field_debounce_ms")]
    pub field_debounce_ms: u64,
    /// Page size seeded into paginated lists that do not set one.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Prefix for relative endpoints sent over HTTP.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ProvidenceConfig {
    fn default() -> Self {
        Self {
            patcher_debounce_ms: default_patcher_debounce_ms(),
            field_debounce_ms: default_field_debounce_ms(),
            page_size: default_page_size(),
            base_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ProvidenceConfig {
    pub fn patcher_debounce(&self) -> Duration {
        Duration::from_millis(self.patcher_debounce_ms)
    }
}

fn default_patcher_debounce_ms() -> u64 {
    250
}

fn default_field_debounce_ms() -> u64 {
    500
}

fn default_page_size() -> u32 {
    24
}

fn default_request_timeout_secs() -> u64 {
    30
}
