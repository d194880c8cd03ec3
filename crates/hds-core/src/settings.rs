//! Settings document with dotted key-path lookup and ordered subscribers.
//!
//! Subscribers are invoked synchronously, in registration order, every time
//! a new settings document is applied. Registration order matters: the
//! registry-facing reconcilers are registered before anything that depends
//! on the registry's contents.

use serde_json::Value;
use tracing::debug;

/// Callback invoked with the full settings document after it is applied.
pub type SettingsSubscriber = Box<dyn Fn(&Value) + Send + Sync>;

/// In-memory settings document for the domain server.
pub struct SettingsManager {
    root: Value,
    subscribers: Vec<(String, SettingsSubscriber)>,
}

impl SettingsManager {
    /// Wrap an already-parsed settings document.
    #[must_use]
    pub const fn new(root: Value) -> Self {
        Self {
            root,
            subscribers: Vec::new(),
        }
    }

    /// The full document.
    #[must_use]
    pub const fn root(&self) -> &Value {
        &self.root
    }

    /// Look up a value by dotted key path, e.g. `security.http_username`.
    #[must_use]
    pub fn value(&self, key_path: &str) -> Option<&Value> {
        value_at(&self.root, key_path)
    }

    /// Look up a string value by dotted key path.
    #[must_use]
    pub fn string(&self, key_path: &str) -> Option<&str> {
        self.value(key_path).and_then(Value::as_str)
    }

    /// Look up a string list by dotted key path.
    #[must_use]
    pub fn string_list(&self, key_path: &str) -> Vec<String> {
        self.value(key_path)
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Register a subscriber. Subscribers run in registration order.
    pub fn subscribe(&mut self, label: impl Into<String>, subscriber: SettingsSubscriber) {
        self.subscribers.push((label.into(), subscriber));
    }

    /// Replace the document and notify every subscriber, in order.
    pub fn apply(&mut self, root: Value) {
        self.root = root;
        for (label, subscriber) in &self.subscribers {
            debug!(subscriber = %label, "applying settings change");
            subscriber(&self.root);
        }
    }
}

impl std::fmt::Debug for SettingsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsManager")
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

/// Dotted key-path lookup into a JSON document.
#[must_use]
pub fn value_at<'a>(root: &'a Value, key_path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in key_path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}
