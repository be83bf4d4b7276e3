//! Dotted-key configuration maps.
//!
//! Keys follow the `<component>.<option>` convention (`tvmaot.unpacked_api`,
//! `mlif.debug`, ...). Storage is ordered so that serialising the same
//! configuration always yields the same bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::fmt;

/// A single configuration value (scalar or list).
pub type ConfigValue = Value;

/// An ordered mapping from dotted keys to values with last-writer-wins merging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config(BTreeMap<String, ConfigValue>);

impl Config {
    /// Creates an empty configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a key, replacing any previous value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.0.insert(key.into(), value.into());
    }

    /// Sets a key only if a value is present.
    pub fn insert_some<V: Into<ConfigValue>>(&mut self, key: impl Into<String>, value: Option<V>) {
        if let Some(value) = value {
            self.insert(key, value);
        }
    }

    /// Builder-style variant of [`Config::insert`].
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.insert(key, value);
        self
    }

    /// Returns the value for a key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.0.get(key)
    }

    /// Removes a key.
    pub fn remove(&mut self, key: &str) -> Option<ConfigValue> {
        self.0.remove(key)
    }

    /// Returns true if the key is set.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Returns the number of keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no key is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over keys in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Iterates over entries in key order.
    pub fn iter(&self) -> btree_map::Iter<'_, String, ConfigValue> {
        self.0.iter()
    }

    /// Merges `other` into `self`; keys of `other` win on collision.
    pub fn merge(&mut self, other: &Self) {
        for (key, value) in &other.0 {
            self.0.insert(key.clone(), value.clone());
        }
    }

    /// Consuming variant of [`Config::merge`].
    #[must_use]
    pub fn merged(mut self, other: &Self) -> Self {
        self.merge(other);
        self
    }

    /// Returns the options for one component with the prefix stripped.
    ///
    /// `scoped("tvmaot")` turns `tvmaot.arena_size` into `arena_size`.
    #[must_use]
    pub fn scoped(&self, component: &str) -> Self {
        let prefix = format!("{component}.");
        self.0
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .map(|option| (option.to_string(), value.clone()))
            })
            .collect()
    }

    /// Returns a copy with every key prefixed by `component.`.
    #[must_use]
    pub fn prefixed(&self, component: &str) -> Self {
        self.0
            .iter()
            .map(|(key, value)| (format!("{component}.{key}"), value.clone()))
            .collect()
    }

    /// Interprets a value as a boolean.
    ///
    /// Accepts JSON booleans, integers and the strings `true/false`, `yes/no`,
    /// `on/off`, `1/0` (case-insensitive).
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(value) => Some(*value),
            Value::Number(number) => number.as_i64().map(|n| n != 0),
            Value::String(text) => parse_bool(text),
            _ => None,
        }
    }

    /// Interprets a value as a string. Numbers and booleans are formatted.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            Value::Bool(value) => Some(value.to_string()),
            _ => None,
        }
    }

    /// Interprets a value as an unsigned integer.
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Number(number) => number
                .as_u64()
                .or_else(|| number.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    /// Interprets a value as a list of strings.
    ///
    /// JSON arrays are taken element-wise; strings are split on commas.
    #[must_use]
    pub fn get_list(&self, key: &str) -> Option<Vec<String>> {
        match self.get(key)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .map(|item| match item {
                        Value::String(text) => text.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            Value::String(text) => Some(
                text.split(',')
                    .map(str::trim)
                    .filter(|part| !part.is_empty())
                    .map(String::from)
                    .collect(),
            ),
            Value::Null => None,
            other => Some(vec![other.to_string()]),
        }
    }

    /// Appends an item to a list value, creating the list if needed.
    ///
    /// A scalar value already stored under the key becomes the first element.
    pub fn append(&mut self, key: impl Into<String>, item: impl Into<ConfigValue>) {
        let entry = self.0.entry(key.into()).or_insert_with(|| Value::Array(Vec::new()));
        match entry {
            Value::Array(items) => items.push(item.into()),
            Value::Null => *entry = Value::Array(vec![item.into()]),
            other => {
                let first = other.take();
                *other = Value::Array(vec![first, item.into()]);
            }
        }
    }

    /// Serialises the configuration as compact JSON with sorted keys.
    #[must_use]
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }

    /// Returns the configuration as a JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        Value::Object(self.0.clone().into_iter().collect())
    }

    /// Parses a `key=value` assignment.
    ///
    /// The value is read as JSON when possible and kept as a string otherwise,
    /// so `a.b=3` stores a number and `a.b=foo` stores `"foo"`.
    #[must_use]
    pub fn parse_assignment(assignment: &str) -> Option<(String, ConfigValue)> {
        let (key, raw) = assignment.split_once('=')?;
        let key = key.trim();
        if key.is_empty() {
            return None;
        }
        let raw = raw.trim();
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        Some((key.to_string(), value))
    }
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_canonical_json())
    }
}

impl FromIterator<(String, ConfigValue)> for Config {
    fn from_iter<I: IntoIterator<Item = (String, ConfigValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Config {
    type Item = (&'a String, &'a ConfigValue);
    type IntoIter = btree_map::Iter<'a, String, ConfigValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for Config {
    type Item = (String, ConfigValue);
    type IntoIter = btree_map::IntoIter<String, ConfigValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_merge_last_writer_wins() {
        let mut base = Config::new().with("x.a", 1).with("x.c", "keep");
        let other = Config::new().with("x.a", 2).with("x.b", 3);

        base.merge(&other);

        assert_eq!(base.get("x.a"), Some(&json!(2)));
        assert_eq!(base.get("x.b"), Some(&json!(3)));
        assert_eq!(base.get("x.c"), Some(&json!("keep")));
    }

    #[test]
    fn test_scoped_and_prefixed() {
        let config = Config::new()
            .with("tvmaot.arena_size", 1024)
            .with("tvmaot.unpacked_api", true)
            .with("tvmrt.arena_size", 2048);

        let scoped = config.scoped("tvmaot");
        assert_eq!(scoped.len(), 2);
        assert_eq!(scoped.get_u64("arena_size"), Some(1024));

        let prefixed = scoped.prefixed("tvmcg");
        assert!(prefixed.contains_key("tvmcg.unpacked_api"));
    }

    #[test]
    fn test_typed_getters() {
        let config = Config::new()
            .with("a", "yes")
            .with("b", 0)
            .with("c", "1, 2 ,3")
            .with("d", json!(["x", "y"]))
            .with("e", "42");

        assert_eq!(config.get_bool("a"), Some(true));
        assert_eq!(config.get_bool("b"), Some(false));
        assert_eq!(config.get_list("c"), Some(vec!["1".into(), "2".into(), "3".into()]));
        assert_eq!(config.get_list("d"), Some(vec!["x".into(), "y".into()]));
        assert_eq!(config.get_u64("e"), Some(42));
        assert_eq!(config.get_str("b"), Some("0".to_string()));
        assert_eq!(config.get_bool("missing"), None);
    }

    #[test]
    fn test_append_creates_and_extends_lists() {
        let mut config = Config::new();
        config.append("mlif.libs", "a");
        config.append("mlif.libs", "b");
        config.insert("mlif.scalar", "x");
        config.append("mlif.scalar", "y");

        assert_eq!(config.get("mlif.libs"), Some(&json!(["a", "b"])));
        assert_eq!(config.get("mlif.scalar"), Some(&json!(["x", "y"])));
    }

    #[test]
    fn test_canonical_json_is_sorted() {
        let a = Config::new().with("b.x", 1).with("a.y", 2);
        let b = Config::new().with("a.y", 2).with("b.x", 1);
        assert_eq!(a.to_canonical_json(), b.to_canonical_json());
        assert_eq!(a.to_canonical_json(), r#"{"a.y":2,"b.x":1}"#);
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            Config::parse_assignment("spike.vlen=128"),
            Some(("spike.vlen".to_string(), json!(128)))
        );
        assert_eq!(
            Config::parse_assignment("run.comment = hello"),
            Some(("run.comment".to_string(), json!("hello")))
        );
        assert_eq!(Config::parse_assignment("novalue"), None);
        assert_eq!(Config::parse_assignment("=3"), None);
    }
}
