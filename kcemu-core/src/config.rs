//! Key/value settings consumed by the emulated systems.
//!
//! Values are stored as strings. Lookups never fail: absent or malformed
//! values fall back to the caller's default.

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::KcResult;

/// Flat property map, e.g. `jkcemu.z1013.monitor = "A.2"`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    map: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from literal pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            map: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Parse a JSON object. Strings, numbers and booleans are accepted,
    /// nested values are ignored.
    pub fn from_json(text: &str) -> KcResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let mut props = Self::new();
        if let serde_json::Value::Object(obj) = value {
            for (key, value) in obj {
                let text = match value {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Bool(b) => b.to_string(),
                    serde_json::Value::Number(n) => n.to_string(),
                    _ => continue,
                };
                props.map.insert(key, text);
            }
        }
        Ok(props)
    }

    /// Load a JSON property file.
    pub fn load(path: &Path) -> KcResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn set_bool(&mut self, key: impl Into<String>, value: bool) {
        self.set(key, if value { "true" } else { "false" });
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.map.remove(key)
    }

    /// Trimmed, non-empty value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.map
            .get(key)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_str(key).map(str::to_ascii_lowercase).as_deref() {
            Some("true") | Some("1") | Some("yes") => true,
            Some("false") | Some("0") | Some("no") => false,
            _ => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        self.get_str(key)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(default)
    }

    /// Case-insensitive comparison with an expected value.
    pub fn eq_ignore_case(&self, key: &str, expected: &str) -> bool {
        self.get_str(key)
            .is_some_and(|s| s.eq_ignore_ascii_case(expected))
    }

    /// Keys starting with `prefix`.
    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.map
            .range(prefix.to_string()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_on_missing_and_malformed() {
        let props = Properties::from_pairs([("a", "maybe"), ("b", "12x"), ("c", "  ")]);
        assert!(props.get_bool("a", true));
        assert!(!props.get_bool("missing", false));
        assert_eq!(props.get_int("b", 7), 7);
        assert_eq!(props.get_str("c"), None);
    }

    #[test]
    fn test_json_values_normalised() {
        let props =
            Properties::from_json(r#"{"x.flag": true, "x.kb": 48, "x.name": "KC87", "x.obj": {}}"#)
                .unwrap();
        assert!(props.get_bool("x.flag", false));
        assert_eq!(props.get_int("x.kb", 0), 48);
        assert!(props.eq_ignore_case("x.name", "kc87"));
        assert_eq!(props.get_str("x.obj"), None);
    }

    #[test]
    fn test_prefix_keys() {
        let props = Properties::from_pairs([("p.a", "1"), ("p.b", "2"), ("q.a", "3")]);
        let keys: Vec<_> = props.keys_with_prefix("p.").collect();
        assert_eq!(keys, vec!["p.a", "p.b"]);
    }
}
