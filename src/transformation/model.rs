//! Transformation model
//!
//! A transformation maps pin names to `(celltype, subcelltype, checksum)`
//! triples and names an output pin. Execution metadata (`__meta__`,
//! `__env__`, `__language__`) travels with it but never enters the
//! checksum, so transformations differing only in metadata share a cache
//! entry.

use super::canonical::to_canonical_bytes;
use crate::checksum::Checksum;
use crate::error::{CommuneError, CommuneResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const OUTPUT_KEY: &str = "__output__";
const AS_KEY: &str = "__as__";
const META_KEY: &str = "__meta__";
const ENV_KEY: &str = "__env__";
const LANGUAGE_KEY: &str = "__language__";

/// One input pin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    pub celltype: String,
    pub subcelltype: Option<String>,
    pub checksum: Option<Checksum>,
}

impl Pin {
    pub fn new(celltype: impl Into<String>, checksum: Checksum) -> Self {
        Self {
            celltype: celltype.into(),
            subcelltype: None,
            checksum: Some(checksum),
        }
    }

    fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::String(self.celltype.clone()),
            opt_string(&self.subcelltype),
            self.checksum
                .map(|cs| Value::String(cs.to_hex()))
                .unwrap_or(Value::Null),
        ])
    }

    fn from_value(name: &str, value: &Value) -> CommuneResult<Self> {
        let items = value
            .as_array()
            .filter(|items| items.len() == 3)
            .ok_or_else(|| invalid(format!("pin '{}' must be a 3-element list", name)))?;
        let celltype = items[0]
            .as_str()
            .ok_or_else(|| invalid(format!("pin '{}' has no celltype", name)))?
            .to_string();
        let subcelltype = parse_opt_string(&items[1], name)?;
        let checksum = match &items[2] {
            Value::Null => None,
            Value::String(s) => Some(Checksum::from_hex(s)?),
            _ => return Err(invalid(format!("pin '{}' has a malformed checksum", name))),
        };
        Ok(Self {
            celltype,
            subcelltype,
            checksum,
        })
    }
}

/// The `__output__` descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPin {
    pub name: String,
    pub celltype: String,
    pub subcelltype: Option<String>,
    pub hash_pattern: Option<Value>,
}

impl OutputPin {
    pub fn new(name: impl Into<String>, celltype: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            celltype: celltype.into(),
            subcelltype: None,
            hash_pattern: None,
        }
    }

    fn to_value(&self) -> Value {
        let mut items = vec![
            Value::String(self.name.clone()),
            Value::String(self.celltype.clone()),
            opt_string(&self.subcelltype),
        ];
        if let Some(pattern) = &self.hash_pattern {
            items.push(pattern.clone());
        }
        Value::Array(items)
    }

    fn from_value(value: &Value) -> CommuneResult<Self> {
        let items = value
            .as_array()
            .filter(|items| items.len() == 3 || items.len() == 4)
            .ok_or_else(|| invalid("__output__ must be a 3- or 4-element list"))?;
        let name = items[0]
            .as_str()
            .ok_or_else(|| invalid("__output__ has no name"))?
            .to_string();
        let celltype = items[1]
            .as_str()
            .ok_or_else(|| invalid("__output__ has no celltype"))?
            .to_string();
        let subcelltype = parse_opt_string(&items[2], OUTPUT_KEY)?;
        let hash_pattern = items.get(3).cloned().filter(|v| !v.is_null());
        Ok(Self {
            name,
            celltype,
            subcelltype,
            hash_pattern,
        })
    }
}

/// Metadata that affects how a transformation runs but not its identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionMeta {
    pub meta: Option<Value>,
    pub language: Option<String>,
    pub env: Option<Checksum>,
}

impl ExecutionMeta {
    pub fn is_empty(&self) -> bool {
        self.meta.is_none() && self.language.is_none() && self.env.is_none()
    }

    /// The `local` flag of `__meta__`: `Some(true)` forces local execution,
    /// `Some(false)` forbids it
    pub fn local(&self) -> Option<bool> {
        self.meta.as_ref()?.get("local")?.as_bool()
    }
}

/// A fully resolved transformation
#[derive(Debug, Clone, PartialEq)]
pub struct Transformation {
    pub pins: BTreeMap<String, Pin>,
    pub output: OutputPin,
    pub as_map: Option<BTreeMap<String, String>>,
    pub exec: ExecutionMeta,
}

impl Transformation {
    pub fn new(output: OutputPin) -> Self {
        Self {
            pins: BTreeMap::new(),
            output,
            as_map: None,
            exec: ExecutionMeta::default(),
        }
    }

    pub fn with_pin(mut self, name: impl Into<String>, pin: Pin) -> Self {
        self.pins.insert(name.into(), pin);
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.exec.language = Some(language.into());
        self
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.exec.meta = Some(meta);
        self
    }

    /// The dict form, optionally including execution metadata
    pub fn to_value(&self, include_meta: bool) -> Value {
        let mut map = Map::new();
        for (name, pin) in &self.pins {
            map.insert(name.clone(), pin.to_value());
        }
        map.insert(OUTPUT_KEY.to_string(), self.output.to_value());
        if let Some(as_map) = &self.as_map {
            let renames = as_map
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            map.insert(AS_KEY.to_string(), Value::Object(renames));
        }
        if include_meta {
            if let Some(meta) = &self.exec.meta {
                map.insert(META_KEY.to_string(), meta.clone());
            }
            if let Some(env) = &self.exec.env {
                map.insert(ENV_KEY.to_string(), Value::String(env.to_hex()));
            }
            if let Some(language) = &self.exec.language {
                map.insert(LANGUAGE_KEY.to_string(), Value::String(language.clone()));
            }
        }
        Value::Object(map)
    }

    /// Parse the dict form; reserved metadata keys are picked up when present
    pub fn from_value(value: &Value) -> CommuneResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| invalid("transformation must be a JSON object"))?;
        let output = map
            .get(OUTPUT_KEY)
            .ok_or_else(|| invalid("missing __output__"))
            .and_then(OutputPin::from_value)?;

        let mut tf = Transformation::new(output);
        for (key, value) in map {
            match key.as_str() {
                OUTPUT_KEY => {}
                AS_KEY => {
                    let renames = value
                        .as_object()
                        .ok_or_else(|| invalid("__as__ must be an object"))?;
                    let mut as_map = BTreeMap::new();
                    for (pin, name) in renames {
                        let name = name
                            .as_str()
                            .ok_or_else(|| invalid("__as__ values must be strings"))?;
                        as_map.insert(pin.clone(), name.to_string());
                    }
                    tf.as_map = Some(as_map);
                }
                META_KEY => tf.exec.meta = Some(value.clone()),
                ENV_KEY => {
                    tf.exec.env = match value {
                        Value::String(s) => Some(Checksum::from_hex(s)?),
                        _ => None,
                    }
                }
                LANGUAGE_KEY => tf.exec.language = value.as_str().map(str::to_string),
                _ if key.starts_with("__") => {
                    return Err(invalid(format!("unknown reserved key '{}'", key)));
                }
                _ => {
                    tf.pins.insert(key.clone(), Pin::from_value(key, value)?);
                }
            }
        }
        Ok(tf)
    }

    /// The canonical buffer whose hash is the transformation checksum
    pub fn canonical_buffer(&self) -> CommuneResult<Vec<u8>> {
        Ok(to_canonical_bytes(&self.to_value(false))?)
    }

    pub fn checksum(&self) -> CommuneResult<Checksum> {
        Ok(Checksum::digest(&self.canonical_buffer()?))
    }

    /// Rebuild a transformation from its canonical buffer
    pub fn from_canonical(buffer: &[u8]) -> CommuneResult<Self> {
        let value: Value = serde_json::from_slice(buffer)?;
        Self::from_value(&value)
    }
}

fn opt_string(value: &Option<String>) -> Value {
    value
        .as_ref()
        .map(|s| Value::String(s.clone()))
        .unwrap_or(Value::Null)
}

fn parse_opt_string(value: &Value, context: &str) -> CommuneResult<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        _ => Err(invalid(format!("'{}' has a malformed subcelltype", context))),
    }
}

fn invalid(reason: impl Into<String>) -> CommuneError {
    CommuneError::InvalidTransformation(reason.into())
}
