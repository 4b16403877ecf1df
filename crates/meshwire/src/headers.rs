//! # Header Map
//!
//! Case-insensitive, multi-valued header storage.
//!
//! ## Invariants
//! - Names are stored lowercased, so `Content-Type` and `content-type` address
//!   the same entry, including entries that arrive through deserialization.
//! - Values keep their insertion order; "first value wins" readers use [`Headers::get`].

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Header name to ordered list of values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, Vec<String>>", into = "BTreeMap<String, Vec<String>>")]
pub struct Headers(BTreeMap<String, Vec<String>>);

impl Headers {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Appends a value, keeping any existing values for the name.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.0.entry(name.to_ascii_lowercase()).or_default().push(value.into());
    }

    /// Replaces every value for the name with a single value.
    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.0.insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    /// Returns the first value for the name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.get_all(name).first().map(String::as_str)
    }

    /// Returns all values for the name, in insertion order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.0
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.0.remove(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// The first `content-type` value, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.get("content-type")
    }

    /// Returns a copy without empty values, dropping names left with none.
    pub fn without_empty_values(&self) -> Self {
        let mut out = Self::new();
        for (name, values) in self.iter() {
            for value in values.iter().filter(|v| !v.is_empty()) {
                out.append(name, value.as_str());
            }
        }
        out
    }
}

impl From<BTreeMap<String, Vec<String>>> for Headers {
    fn from(raw: BTreeMap<String, Vec<String>>) -> Self {
        let mut headers = Self::new();
        for (name, values) in raw {
            for value in values {
                headers.append(&name, value);
            }
        }
        headers
    }
}

impl From<Headers> for BTreeMap<String, Vec<String>> {
    fn from(headers: Headers) -> Self {
        headers.0
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.append(name.as_ref(), value);
        }
        headers
    }
}
