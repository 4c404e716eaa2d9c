//! Typed configuration variables.
//!
//! Subsystems declare the knobs they consume with [`Config::lookup`], which
//! registers a named, typed, defaulted variable in a process-global registry
//! (or returns the already-registered handle). Values can be overridden at
//! runtime from a JSON document whose nesting maps onto dotted names:
//!
//! ```
//! use weft::config::Config;
//!
//! let stack_size = Config::lookup::<u32>("fiber.stack_size", 128 * 1024, "fiber stack size");
//! Config::load_json(&serde_json::json!({ "fiber": { "stack_size": 65536 } }));
//! assert_eq!(stack_size.value(), 65536);
//! # stack_size.set(128 * 1024);
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use log::{debug, error};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;
use crate::Result;

static REGISTRY: Lazy<RwLock<HashMap<String, Arc<dyn AnyVar>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

////////////////////////////////////////////////////////////////////////////////
// ConfigVar
////////////////////////////////////////////////////////////////////////////////

/// A registered configuration variable.
pub struct ConfigVar<T> {
    name: String,
    description: String,
    value: RwLock<T>,
}

impl<T> ConfigVar<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// The current value.
    pub fn value(&self) -> T {
        self.value.read().unwrap().clone()
    }

    pub fn set(&self, value: T) {
        *self.value.write().unwrap() = value;
    }
}

/// Type-erased registry entry.
trait AnyVar: Send + Sync {
    fn name(&self) -> &str;
    fn set_json(&self, value: &serde_json::Value) -> Result<()>;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> AnyVar for ConfigVar<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn set_json(&self, value: &serde_json::Value) -> Result<()> {
        let parsed: T = serde_json::from_value(value.clone()).map_err(|source| Error::Config {
            name: self.name.clone(),
            source,
        })?;
        self.set(parsed);
        debug!("config {} = {}", self.name, value);
        Ok(())
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

////////////////////////////////////////////////////////////////////////////////
// Config
////////////////////////////////////////////////////////////////////////////////

/// The process-global variable registry.
pub struct Config;

impl Config {
    /// Registers a variable with its default value, or returns the existing
    /// handle.
    ///
    /// Names are lowercase dotted paths (`[a-z0-9._]`). Looking a name up
    /// with a different type than it was registered with is a programmer
    /// error and panics.
    pub fn lookup<T>(name: &str, default: T, description: &str) -> Arc<ConfigVar<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        assert!(
            !name.is_empty()
                && name
                    .bytes()
                    .all(|c| matches!(c, b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_')),
            "invalid config variable name {:?}",
            name
        );

        let mut registry = REGISTRY.write().unwrap();
        if let Some(existing) = registry.get(name) {
            return existing
                .clone()
                .as_any_arc()
                .downcast::<ConfigVar<T>>()
                .unwrap_or_else(|_| {
                    panic!(
                        "config variable {} already registered with a different type",
                        name
                    )
                });
        }

        let var = Arc::new(ConfigVar {
            name: name.to_string(),
            description: description.to_string(),
            value: RwLock::new(default),
        });
        registry.insert(name.to_string(), var.clone());
        var
    }

    /// Applies overrides from a JSON document. Object nesting turns into
    /// dotted names; keys without a registered variable are ignored, values
    /// that fail to parse for their variable's type are logged and skipped.
    pub fn load_json(root: &serde_json::Value) {
        let mut nodes = Vec::new();
        flatten("", root, &mut nodes);
        for (name, value) in nodes {
            if name.is_empty() || value.is_object() {
                continue;
            }
            let var = REGISTRY.read().unwrap().get(&name.to_lowercase()).cloned();
            if let Some(var) = var {
                if let Err(e) = var.set_json(&value) {
                    error!("config override rejected: {}", e);
                }
            }
        }
    }
}

fn flatten(prefix: &str, node: &serde_json::Value, out: &mut Vec<(String, serde_json::Value)>) {
    out.push((prefix.to_string(), node.clone()));
    if let serde_json::Value::Object(map) = node {
        for (key, value) in map {
            let name = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", prefix, key)
            };
            flatten(&name, value, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_registers_default() {
        let var = Config::lookup::<u32>("test.lookup.answer", 42, "test variable");
        assert_eq!(var.value(), 42);
        assert_eq!(var.name(), "test.lookup.answer");
        assert_eq!(var.description(), "test variable");
    }

    #[test]
    fn lookup_returns_the_same_handle() {
        let a = Config::lookup::<u32>("test.lookup.same", 1, "first");
        a.set(7);
        let b = Config::lookup::<u32>("test.lookup.same", 1, "second");
        assert_eq!(b.value(), 7, "second lookup must see the live value");
    }

    #[test]
    #[should_panic(expected = "different type")]
    fn lookup_with_wrong_type_panics() {
        Config::lookup::<u32>("test.lookup.typed", 0, "as int");
        Config::lookup::<String>("test.lookup.typed", String::new(), "as string");
    }

    #[test]
    #[should_panic(expected = "invalid config variable name")]
    fn invalid_name_panics() {
        Config::lookup::<u32>("Nope Not Valid", 0, "bad name");
    }

    #[test]
    fn json_overrides_apply_by_dotted_name() {
        let var = Config::lookup::<u32>("test.json.depth", 3, "nesting depth");
        Config::load_json(&serde_json::json!({
            "test": { "json": { "depth": 9, "unknown_key": true } }
        }));
        assert_eq!(var.value(), 9);
    }

    #[test]
    fn mistyped_override_is_skipped() {
        let var = Config::lookup::<u32>("test.json.keepme", 5, "survives bad input");
        Config::load_json(&serde_json::json!({
            "test": { "json": { "keepme": "not a number" } }
        }));
        assert_eq!(var.value(), 5);
    }
}
