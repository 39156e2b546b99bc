//! Sensitive-data placeholders.
//!
//! Secret values never travel to the LLM: outgoing text carries
//! `<secret>KEY</secret>` placeholders, and action parameters get the real
//! values substituted back just before execution, scoped by domain pattern.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::url::domain_matches;

/// Either a directly usable secret or a map of secrets scoped to a domain
/// pattern (`{domain_pattern: {key: value}}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SensitiveEntry {
    Value(String),
    Scoped(HashMap<String, String>),
}

/// Top-level sensitive data: `{key: value}` or `{domain_pattern: {key: value}}`
pub type SensitiveData = HashMap<String, SensitiveEntry>;

/// Secrets usable at `current_url`: global entries plus scoped entries whose
/// domain pattern matches. With no URL only global entries apply.
pub fn secrets_for_url(
    sensitive: &SensitiveData,
    current_url: Option<&str>,
) -> HashMap<String, String> {
    let mut secrets = HashMap::new();
    for (key, entry) in sensitive {
        match entry {
            SensitiveEntry::Value(value) => {
                secrets.insert(key.clone(), value.clone());
            }
            SensitiveEntry::Scoped(scoped) => {
                if let Some(url) = current_url
                    && domain_matches(key, url)
                {
                    for (name, value) in scoped {
                        secrets.insert(name.clone(), value.clone());
                    }
                }
            }
        }
    }
    secrets
}

/// All secret key/value pairs regardless of scope (used for redaction)
pub fn all_secrets(sensitive: &SensitiveData) -> HashMap<String, String> {
    let mut secrets = HashMap::new();
    for (key, entry) in sensitive {
        match entry {
            SensitiveEntry::Value(value) => {
                secrets.insert(key.clone(), value.clone());
            }
            SensitiveEntry::Scoped(scoped) => {
                for (name, value) in scoped {
                    secrets.insert(name.clone(), value.clone());
                }
            }
        }
    }
    secrets
}

fn placeholder(key: &str) -> String {
    format!("<secret>{key}</secret>")
}

/// Replace literal secret values with `<secret>KEY</secret>` placeholders
pub fn redact_text(text: &str, sensitive: &SensitiveData) -> String {
    let mut result = text.to_string();
    for (key, value) in all_secrets(sensitive) {
        if !value.is_empty() && result.contains(&value) {
            result = result.replace(&value, &placeholder(&key));
        }
    }
    result
}

/// Replace `<secret>KEY</secret>` placeholders with values available at the
/// current URL. Placeholders with out-of-scope or unknown keys are left
/// unchanged.
pub fn substitute_text(text: &str, secrets: &HashMap<String, String>) -> String {
    let mut result = text.to_string();
    for (key, value) in secrets {
        let token = placeholder(key);
        if result.contains(&token) {
            result = result.replace(&token, value);
        }
    }
    result
}

/// Substitute placeholders across every string of a JSON value
pub fn substitute_value(value: &mut Value, secrets: &HashMap<String, String>) {
    match value {
        Value::String(s) => {
            let replaced = substitute_text(s, secrets);
            if replaced != *s {
                *s = replaced;
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute_value(item, secrets);
            }
        }
        Value::Object(entries) => {
            for (_, item) in entries.iter_mut() {
                substitute_value(item, secrets);
            }
        }
        _ => {}
    }
}

/// Redact secret values across every string of a JSON value
pub fn redact_value(value: &mut Value, sensitive: &SensitiveData) {
    match value {
        Value::String(s) => {
            let replaced = redact_text(s, sensitive);
            if replaced != *s {
                *s = replaced;
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_value(item, sensitive);
            }
        }
        Value::Object(entries) => {
            for (_, item) in entries.iter_mut() {
                redact_value(item, sensitive);
            }
        }
        _ => {}
    }
}
