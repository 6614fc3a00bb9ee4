//! Typed access to name/value policy properties.
//!
//! Properties come from configuration files written for newer or older
//! releases, so anything unknown or unparsable is logged and ignored.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A named policy plus its raw properties, as found in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl PolicyConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Parse a `key=value,key=value` list. Malformed entries are skipped.
    pub fn parse_properties(list: &str) -> BTreeMap<String, String> {
        list.split(',')
            .filter_map(|pair| {
                let (key, value) = pair.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.trim().to_string()))
            })
            .collect()
    }
}

/// Capacity section of the pool configuration. `None` selects the default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityConfig {
    #[serde(default)]
    pub incrementer: Option<PolicyConfig>,
    #[serde(default)]
    pub decrementer: Option<PolicyConfig>,
}

/// Read-only view over a policy's properties used by policy constructors.
pub struct PolicyProperties<'a> {
    policy: &'a str,
    values: &'a BTreeMap<String, String>,
}

impl<'a> PolicyProperties<'a> {
    pub fn new(policy: &'a str, values: &'a BTreeMap<String, String>) -> Self {
        Self { policy, values }
    }

    pub fn raw(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Parse a property, logging and ignoring values that do not parse.
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.values.get(key)?;
        match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(
                    policy = self.policy,
                    property = key,
                    value = %raw,
                    "invalid capacity policy property ignored"
                );
                None
            }
        }
    }

    /// Log every property not in `known`.
    pub fn warn_unrecognized(&self, known: &[&str]) {
        for key in self.values.keys().filter(|k| !known.contains(&k.as_str())) {
            warn!(
                policy = self.policy,
                property = %key,
                "unrecognized capacity policy property ignored"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_property_list() {
        let props = PolicyConfig::parse_properties("watermark=5, size = 2,broken,=x");
        assert_eq!(props.len(), 2);
        assert_eq!(props.get("watermark").map(String::as_str), Some("5"));
        assert_eq!(props.get("size").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_invalid_value_is_none() {
        let values = PolicyConfig::parse_properties("watermark=lots");
        let props = PolicyProperties::new("watermark", &values);
        assert_eq!(props.parse::<i64>("watermark"), None);
        assert_eq!(props.raw("watermark"), Some("lots"));
        assert_eq!(props.parse::<i64>("missing"), None);
    }
}
