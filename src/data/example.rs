use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// String-keyed field map shared by examples, predictions and forward inputs.
pub type Fields = IndexMap<String, Value>;

/// Prefix marking metadata fields that are carried on an example but are
/// neither inputs nor outputs (`__quality_score`, `__teacher`, ...).
pub const META_PREFIX: &str = "__";

pub fn is_meta_key(key: &str) -> bool {
    key.starts_with(META_PREFIX)
}

/// A labeled training item: a field map plus the set of keys that are inputs.
///
/// Everything in `data` that is not an input key and not a `__`-prefixed
/// metadata key counts as an output. Examples are immutable once constructed;
/// [`Example::with_value`] returns a new value instead of mutating.
#[derive(Serialize, Deserialize, Default, Debug, Clone, PartialEq)]
pub struct Example {
    pub data: Fields,
    pub input_keys: Vec<String>,
}

impl Example {
    /// Builds an example, dropping any input key that has no backing field
    /// so that `input_keys ⊆ keys(data)` always holds.
    pub fn new(data: Fields, input_keys: Vec<String>) -> Self {
        let input_keys = input_keys
            .into_iter()
            .filter(|key| data.contains_key(key))
            .collect();
        Self { data, input_keys }
    }

    /// Projection of `data` onto the input keys.
    pub fn inputs(&self) -> Fields {
        self.input_keys
            .iter()
            .filter_map(|key| self.data.get(key).map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// `data` minus inputs minus metadata keys.
    pub fn outputs(&self) -> Fields {
        self.data
            .iter()
            .filter(|(key, _)| !self.input_keys.contains(*key) && !is_meta_key(key))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// String view of a field, with a default for missing or non-string values.
    pub fn get_str(&self, key: &str, default: &str) -> String {
        match self.data.get(key) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => default.to_string(),
        }
    }

    pub fn keys(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }

    /// Returns a copy with one field added or replaced. Input keys are kept.
    pub fn with_value(&self, key: impl Into<String>, value: Value) -> Self {
        let mut data = self.data.clone();
        data.insert(key.into(), value);
        Self {
            data,
            input_keys: self.input_keys.clone(),
        }
    }

    /// True when the example carries at least one input and one output field.
    pub fn has_inputs_and_outputs(&self) -> bool {
        !self.inputs().is_empty() && !self.outputs().is_empty()
    }
}
