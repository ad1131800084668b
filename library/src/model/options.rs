//! String-keyed option trees read by nodes at resolve and evaluate time.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("option `{key}`: {message}")]
pub struct OptionError {
    pub key: String,
    pub message: String,
}

/// A nested option tree.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct Options(Map<String, JsonValue>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a JSON object. Any other JSON value yields an empty tree.
    pub fn from_json(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(map) => Self(map),
            JsonValue::Null => Self::default(),
            other => {
                log::warn!("Ignoring non-table options value: {}", other);
                Self::default()
            }
        }
    }

    /// Builder-style setter for a top-level key. A value that cannot be serialized is logged
    /// and leaves the key unset.
    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Err(e) = self.set(key, value) {
            log::warn!("Ignoring {}", e);
        }
        self
    }

    /// Sets a top-level key. On error the tree is unchanged.
    pub fn set(
        &mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<(), OptionError> {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.0.insert(key, value);
                Ok(())
            }
            Err(e) => Err(OptionError {
                key,
                message: e.to_string(),
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn lookup(&self, path: &[&str]) -> Option<&JsonValue> {
        let (first, rest) = path.split_first()?;
        let mut current = self.0.get(*first)?;
        for key in rest {
            current = current.as_object()?.get(*key)?;
        }
        Some(current)
    }

    pub fn has(&self, path: &[&str]) -> bool {
        self.lookup(path).is_some()
    }

    /// Reads and deserializes the value at `path`, if present.
    pub fn get<T: DeserializeOwned>(&self, path: &[&str]) -> Result<Option<T>, OptionError> {
        match self.lookup(path) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| OptionError {
                    key: path.join("."),
                    message: e.to_string(),
                }),
        }
    }

    /// Reads the value at `path`, falling back to `default` when absent.
    pub fn get_or<T: DeserializeOwned>(&self, default: T, path: &[&str]) -> Result<T, OptionError> {
        Ok(self.get(path)?.unwrap_or(default))
    }

    pub fn subtree(&self, key: &str) -> Options {
        match self.0.get(key) {
            Some(JsonValue::Object(map)) => Options(map.clone()),
            _ => Options::default(),
        }
    }

    /// Deep merge: tables merge recursively, anything else in `overrides` wins.
    pub fn merged(&self, overrides: &Options) -> Options {
        let mut out = self.0.clone();
        merge_into(&mut out, &overrides.0);
        Options(out)
    }
}

fn merge_into(target: &mut Map<String, JsonValue>, overrides: &Map<String, JsonValue>) {
    for (key, value) in overrides {
        match (target.get_mut(key), value) {
            (Some(JsonValue::Object(existing)), JsonValue::Object(incoming)) => {
                merge_into(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

/// Options supplied with a request: a global tree plus per-node trees keyed by
/// `module::function`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RunOptions {
    #[serde(default)]
    pub global: Options,
    #[serde(default)]
    pub nodes: BTreeMap<String, Options>,
}

impl RunOptions {
    /// The effective options of the node named `full_name`.
    pub fn for_node(&self, full_name: &str) -> Options {
        match self.nodes.get(full_name) {
            Some(node) => self.global.merged(node),
            None => self.global.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_lookup_with_defaults() {
        let opts = Options::from_json(json!({
            "GA_AnnYield": {"Emin": 0.1, "nbins": 26},
            "fast": 1
        }));
        assert_eq!(opts.get_or(0, &["fast"]).unwrap(), 1);
        assert_eq!(opts.get_or(10000.0, &["GA_AnnYield", "Emax"]).unwrap(), 10000.0);
        assert_eq!(opts.get::<u32>(&["GA_AnnYield", "nbins"]).unwrap(), Some(26));
        assert!(opts.has(&["GA_AnnYield", "Emin"]));
    }

    #[test]
    fn wrong_type_is_an_error() {
        let opts = Options::new().with("fast", "yes");
        let err = opts.get::<i32>(&["fast"]).unwrap_err();
        assert_eq!(err.key, "fast");
    }

    #[test]
    fn unserializable_value_is_not_stored() {
        // JSON object keys must be strings.
        let grid: BTreeMap<(i32, i32), f64> = [((0, 1), 0.5)].into_iter().collect();

        let mut opts = Options::new().with("fast", 1);
        let err = opts.set("grid", &grid).unwrap_err();
        assert_eq!(err.key, "grid");
        assert!(!opts.has(&["grid"]));
        assert_eq!(opts.get_or(0, &["fast"]).unwrap(), 1);

        let opts = Options::new().with("grid", &grid);
        assert!(!opts.has(&["grid"]));
        assert!(opts.is_empty());
    }

    #[test]
    fn node_options_override_global_deeply() {
        let run = RunOptions {
            global: Options::from_json(json!({
                "tolerance": 0.01,
                "halo": {"rho0": 0.4, "v0": 235}
            })),
            nodes: [(
                "m::f".to_string(),
                Options::from_json(json!({"halo": {"rho0": 0.3}})),
            )]
            .into_iter()
            .collect(),
        };
        let node = run.for_node("m::f");
        assert_eq!(node.get_or(0.0, &["halo", "rho0"]).unwrap(), 0.3);
        assert_eq!(node.get_or(0, &["halo", "v0"]).unwrap(), 235);
        assert_eq!(node.get_or(0.0, &["tolerance"]).unwrap(), 0.01);
        assert_eq!(run.for_node("m::g").get_or(0.0, &["halo", "rho0"]).unwrap(), 0.4);
    }
}
