// Settings staged by the host before a run starts.

use serde_json::{Map, Value};

/// Key/value overrides forwarded wholesale to the worker at start.
///
/// Keys are unique and the last write wins. Nothing is validated here; the
/// worker ignores entries it does not understand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SettingsStore {
    values: Map<String, Value>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or overwrite one entry.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The JSON object sent with the worker's `start` command.
    pub fn to_payload(&self) -> String {
        Value::Object(self.values.clone()).to_string()
    }

    /// Like [`to_payload`](Self::to_payload), with `overrides` written over
    /// the stored entries. The store itself is left untouched.
    pub fn payload_with<I, K>(&self, overrides: I) -> String
    where
        I: IntoIterator<Item = (K, String)>,
        K: Into<String>,
    {
        let mut merged = self.values.clone();
        for (key, value) in overrides {
            merged.insert(key.into(), Value::String(value));
        }
        Value::Object(merged).to_string()
    }
}
