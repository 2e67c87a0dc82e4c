use std::{collections::BTreeMap, ops::Index};

use serde::Serialize;

/// Named scalar outputs of one forward pass.
///
/// The key set always equals the bundle's declared outputs.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct InferenceResult {
    values: BTreeMap<String, f64>,
}

impl InferenceResult {
    pub(crate) fn new(values: BTreeMap<String, f64>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

/// Collects named values, e.g. to replay a recorded result.
impl<S: Into<String>> FromIterator<(S, f64)> for InferenceResult {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        Self::new(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        )
    }
}

/// Panics on names outside the schema; the schema is fixed at load time.
impl Index<&str> for InferenceResult {
    type Output = f64;

    fn index(&self, name: &str) -> &f64 {
        match self.values.get(name) {
            Some(value) => value,
            None => panic!("output {name:?} is not part of the model schema"),
        }
    }
}
