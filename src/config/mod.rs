//! Layered configuration loading
//!
//! Configuration values arrive from several sources with increasing
//! precedence: the type's defaults, one or more config files, and finally
//! `--key=value` style overrides. [`ConfigLoader`] accumulates all layers
//! into a JSON object tree and deserializes the merged tree into the
//! caller's config type at the end.
//!
//! Keys may use dotted paths (`optimizer.lr`) to address nested fields;
//! they are unflattened into nested objects before merging.
//!
//! # Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use ml_essentials::config::ConfigLoader;
//!
//! #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
//! #[serde(default)]
//! struct MyConfig {
//!     max_epoch: u32,
//!     lr: f64,
//! }
//!
//! # fn main() -> Result<(), ml_essentials::config::ConfigError> {
//! let mut loader = ConfigLoader::<MyConfig>::new();
//! loader.parse_args(&["--max_epoch=200".into(), "--lr=0.001".into()])?;
//! let config = loader.get()?;
//! assert_eq!(config.max_epoch, 200);
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::marker::PhantomData;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// Errors from configuration loading and merging
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unsupported config file extension: {0:?}")]
    UnsupportedExtension(String),

    #[error("at {path}: cannot merge an object attribute into a non-object attribute")]
    ObjectIntoValue { path: String },

    #[error("at {path}: cannot merge a non-object attribute into an object attribute")]
    ValueIntoObject { path: String },

    #[error("config file {0:?} does not contain an object at the top level")]
    NotAnObject(String),

    #[error("invalid argument: {0}")]
    InvalidArg(String),
}

/// Result alias for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Accumulates configuration layers and produces a typed config.
///
/// Later layers override earlier ones key by key; sibling keys from earlier
/// layers survive. The final [`get`](Self::get) starts from the serialized
/// form of `T::default()` so unset keys keep their defaults.
#[derive(Debug)]
pub struct ConfigLoader<T> {
    tree: Map<String, Value>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for ConfigLoader<T> {
    // No bounds needed to build the empty tree.
    fn default() -> Self {
        Self {
            tree: Map::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> ConfigLoader<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Create an empty loader.
    pub fn new() -> Self {
        Self {
            tree: Map::new(),
            _marker: PhantomData,
        }
    }

    /// Create a loader seeded with an existing config object as the lowest
    /// layer.
    pub fn with_seed(seed: &T) -> Result<Self> {
        let mut loader = Self::new();
        let value = serde_json::to_value(seed)?;
        if let Value::Object(map) = value {
            loader.load_object(map)?;
        }
        Ok(loader)
    }

    /// Merge a JSON object into the tree.
    ///
    /// Dotted keys are expanded into nested objects first, so
    /// `{"a.b": 1}` and `{"a": {"b": 1}}` are equivalent layers.
    pub fn load_object(&mut self, object: Map<String, Value>) -> Result<()> {
        let expanded = unflatten(object, "")?;
        let mut current = std::mem::take(&mut self.tree);
        merge_objects(&mut current, expanded, "")?;
        self.tree = current;
        Ok(())
    }

    /// Merge a JSON value; it must be an object.
    pub fn load_value(&mut self, value: Value) -> Result<()> {
        match value {
            Value::Object(map) => self.load_object(map),
            other => Err(ConfigError::NotAnObject(other.to_string())),
        }
    }

    /// Load a JSON config file.
    pub fn load_json(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        match value {
            Value::Object(map) => self.load_object(map),
            Value::Null => Ok(()),
            _ => Err(ConfigError::NotAnObject(path.display().to_string())),
        }
    }

    /// Load a YAML config file. An empty document is a no-op.
    pub fn load_yaml(&mut self, path: &Path) -> Result<()> {
        let text = fs::read_to_string(path)?;
        let value: serde_yaml::Value = serde_yaml::from_str(&text)?;
        match serde_json::to_value(&value)? {
            Value::Object(map) => self.load_object(map),
            Value::Null => Ok(()),
            _ => Err(ConfigError::NotAnObject(path.display().to_string())),
        }
    }

    /// Load a config file, dispatching on its extension.
    ///
    /// Supported extensions: `.yml`, `.yaml`, `.json`.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "yml" | "yaml" => self.load_yaml(path),
            "json" => self.load_json(path),
            other => Err(ConfigError::UnsupportedExtension(other.to_string())),
        }
    }

    /// Parse `--key=value` (or `--key value`) overrides.
    ///
    /// Values are parsed as YAML scalars, so `123`, `1.5`, `true`, `null`
    /// and `[1, 2]` take their typed forms; anything else stays a string.
    pub fn parse_args(&mut self, args: &[String]) -> Result<()> {
        let mut object = Map::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let Some(stripped) = arg.strip_prefix("--") else {
                return Err(ConfigError::InvalidArg(arg.clone()));
            };
            let (key, raw) = match stripped.split_once('=') {
                Some((k, v)) => (k.to_string(), v.to_string()),
                None => {
                    let value = iter.next().ok_or_else(|| {
                        ConfigError::InvalidArg(format!("missing value for `{arg}`"))
                    })?;
                    (stripped.to_string(), value.clone())
                }
            };
            if key.is_empty() {
                return Err(ConfigError::InvalidArg(arg.clone()));
            }
            object.insert(key, parse_scalar(&raw));
        }
        self.load_object(object)
    }

    /// The raw merged tree.
    pub fn get_value(&self) -> Value {
        Value::Object(self.tree.clone())
    }

    /// The merged, typed config.
    pub fn get(&self) -> Result<T> {
        let mut base = match serde_json::to_value(T::default())? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        merge_objects(&mut base, self.tree.clone(), "")?;
        Ok(serde_json::from_value(Value::Object(base))?)
    }
}

/// Parse a CLI override value: YAML scalar forms win, everything else is a
/// string.
fn parse_scalar(raw: &str) -> Value {
    match serde_yaml::from_str::<serde_yaml::Value>(raw) {
        Ok(yaml) => serde_json::to_value(&yaml).unwrap_or_else(|_| Value::String(raw.to_string())),
        Err(_) => Value::String(raw.to_string()),
    }
}

/// Expand dotted keys into nested objects, recursively.
fn unflatten(object: Map<String, Value>, prefix: &str) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for (key, value) in object {
        let value = match value {
            Value::Object(inner) => {
                Value::Object(unflatten(inner, &format!("{prefix}{key}."))?)
            }
            other => other,
        };

        let mut node = &mut out;
        let mut parts = key.split('.').peekable();
        let mut walked = String::from(prefix);
        while let Some(part) = parts.next() {
            walked.push_str(part);
            if parts.peek().is_none() {
                merge_entry(node, part.to_string(), value, &walked)?;
                break;
            }
            walked.push('.');
            let slot = node
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            match slot {
                Value::Object(inner) => node = inner,
                _ => {
                    return Err(ConfigError::ObjectIntoValue {
                        path: walked.trim_end_matches('.').to_string(),
                    })
                }
            }
        }
    }
    Ok(out)
}

/// Merge `src` into `dst`; nested objects merge recursively, any other
/// pairing of object and non-object is an error naming the offending path.
fn merge_objects(
    dst: &mut Map<String, Value>,
    src: Map<String, Value>,
    prefix: &str,
) -> Result<()> {
    for (key, value) in src {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        merge_entry(dst, key, value, &path)?;
    }
    Ok(())
}

/// Merge a single key into `dst`, enforcing the object/non-object rules.
/// `null` always replaces the slot, which is how optional fields reset.
fn merge_entry(dst: &mut Map<String, Value>, key: String, value: Value, path: &str) -> Result<()> {
    let dst_is_object = matches!(dst.get(&key), Some(Value::Object(_)));
    let dst_is_leaf = matches!(dst.get(&key), Some(v) if !v.is_object() && !v.is_null());

    match value {
        Value::Object(src) if dst_is_object => {
            if let Some(Value::Object(inner)) = dst.get_mut(&key) {
                merge_objects(inner, src, path)?;
            }
            Ok(())
        }
        Value::Object(_) if dst_is_leaf => Err(ConfigError::ObjectIntoValue {
            path: path.to_string(),
        }),
        value if dst_is_object && !value.is_null() => Err(ConfigError::ValueIntoObject {
            path: path.to_string(),
        }),
        value => {
            dst.insert(key, value);
            Ok(())
        }
    }
}

/// Flatten a config into a dotted-key map (the on-disk `config.json` form).
///
/// Arrays and scalars are leaves; only nested objects are expanded.
pub fn to_flat_map<T: Serialize>(config: &T) -> Result<BTreeMap<String, Value>> {
    let mut out = BTreeMap::new();
    if let Value::Object(map) = serde_json::to_value(config)? {
        flatten_into(&mut out, map, "");
    }
    Ok(out)
}

/// `T::default()` as a flat map; used for `config.defaults.json`.
pub fn defaults_of<T: Serialize + Default>() -> Result<BTreeMap<String, Value>> {
    to_flat_map(&T::default())
}

fn flatten_into(out: &mut BTreeMap<String, Value>, map: Map<String, Value>, prefix: &str) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) => flatten_into(out, inner, &path),
            other => {
                out.insert(path, other);
            }
        }
    }
}
