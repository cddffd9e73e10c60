//! Semantic and syntactic checksums
//!
//! Structured text that differs only in layout should hit the same cache
//! entry. For such celltypes the semantic checksum is the hash of the
//! parsed value re-emitted as canonical JSON; the index remembers which
//! raw (syntactic) buffers map to which semantic checksum. Code celltypes
//! are compared byte for byte.

use super::canonical::to_canonical_bytes;
use crate::checksum::Checksum;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Celltypes whose buffers are normalized before hashing
const SEMANTIC_CELLTYPES: &[&str] = &["cson", "yaml"];

pub fn is_semantic_celltype(celltype: &str) -> bool {
    SEMANTIC_CELLTYPES.contains(&celltype)
}

/// Produces the normalized form of a cosmetically variable buffer
pub trait Normalizer: Send + Sync {
    /// `None` when the buffer cannot be normalized; its syntactic
    /// checksum then stands for itself
    fn normalize(&self, celltype: &str, buffer: &[u8]) -> Option<Vec<u8>>;
}

/// Parses YAML, and CSON written in its JSON subset, into canonical JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredNormalizer;

impl Normalizer for StructuredNormalizer {
    fn normalize(&self, celltype: &str, buffer: &[u8]) -> Option<Vec<u8>> {
        let value = match celltype {
            "yaml" => {
                let value: serde_yaml::Value = serde_yaml::from_slice(buffer).ok()?;
                if !is_plain(&value) {
                    return None;
                }
                serde_json::to_value(&value).ok()?
            }
            "cson" => serde_json::from_slice(buffer).ok()?,
            _ => return None,
        };
        to_canonical_bytes(&value).ok()
    }
}

/// YAML that maps onto JSON without losing anything: no tags, no
/// non-finite floats and only string keys
fn is_plain(value: &serde_yaml::Value) -> bool {
    use serde_yaml::Value;
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => true,
        Value::Number(n) => n.as_f64().map_or(true, f64::is_finite),
        Value::Sequence(items) => items.iter().all(is_plain),
        Value::Mapping(map) => map
            .iter()
            .all(|(k, v)| matches!(k, Value::String(_)) && is_plain(v)),
        Value::Tagged(_) => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Key {
    checksum: Checksum,
    celltype: String,
    subcelltype: Option<String>,
}

impl Key {
    fn new(checksum: Checksum, celltype: &str, subcelltype: Option<&str>) -> Self {
        Self {
            checksum,
            celltype: celltype.to_string(),
            subcelltype: subcelltype.map(str::to_string),
        }
    }
}

#[derive(Default)]
struct IndexState {
    to_semantic: HashMap<Key, Checksum>,
    to_syntactic: HashMap<Key, Vec<Checksum>>,
}

/// Bidirectional syntactic/semantic checksum index
///
/// Syntactic to semantic is a function; semantic to syntactic is a list.
#[derive(Default)]
pub struct SemanticIndex {
    state: Mutex<IndexState>,
}

impl SemanticIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `syntactic` normalizes to `semantic`
    pub fn record(
        &self,
        syntactic: Checksum,
        celltype: &str,
        subcelltype: Option<&str>,
        semantic: Checksum,
    ) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = state
            .to_semantic
            .insert(Key::new(syntactic, celltype, subcelltype), semantic);
        if let Some(previous) = previous.filter(|p| *p != semantic) {
            let stale = Key::new(previous, celltype, subcelltype);
            if let Some(variants) = state.to_syntactic.get_mut(&stale) {
                variants.retain(|v| *v != syntactic);
                if variants.is_empty() {
                    state.to_syntactic.remove(&stale);
                }
            }
        }
        let variants = state
            .to_syntactic
            .entry(Key::new(semantic, celltype, subcelltype))
            .or_default();
        if !variants.contains(&syntactic) {
            variants.push(syntactic);
        }
    }

    pub fn semantic(
        &self,
        syntactic: &Checksum,
        celltype: &str,
        subcelltype: Option<&str>,
    ) -> Option<Checksum> {
        if !is_semantic_celltype(celltype) {
            return Some(*syntactic);
        }
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .to_semantic
            .get(&Key::new(*syntactic, celltype, subcelltype))
            .copied()
    }

    /// Known syntactic variants of a semantic checksum
    pub fn syntactic(
        &self,
        semantic: &Checksum,
        celltype: &str,
        subcelltype: Option<&str>,
    ) -> Vec<Checksum> {
        if !is_semantic_celltype(celltype) {
            return vec![*semantic];
        }
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .to_syntactic
            .get(&Key::new(*semantic, celltype, subcelltype))
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Option<Vec<u8>> {
        StructuredNormalizer.normalize("yaml", text.as_bytes())
    }

    #[test]
    fn yaml_layout_does_not_matter() {
        let a = yaml("# settings\nb: 1\na: [x, y]   # trailing\n\n").unwrap();
        let b = yaml("a:\n  - x\n  - y\nb: 1\n").unwrap();
        assert_eq!(a, b);
        assert_eq!(
            String::from_utf8(a).unwrap(),
            "{\n  \"a\": [\n    \"x\",\n    \"y\"\n  ],\n  \"b\": 1\n}\n"
        );
    }

    #[test]
    fn hash_lines_inside_block_scalars_are_content() {
        let a = yaml("msg: |\n  # not a comment\n  body\n").unwrap();
        let b = yaml("msg: |\n  body\n").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn lossy_yaml_is_not_normalized() {
        assert!(yaml("a: !custom 1\n").is_none());
        assert!(yaml("a: .nan\n").is_none());
        assert!(yaml("? [1, 2]\n: x\n").is_none());
        assert!(yaml("a: [unclosed\n").is_none());
    }

    #[test]
    fn cson_is_normalized_only_as_json() {
        let a = StructuredNormalizer.normalize("cson", br#"{"b": 1, "a": 2}"#);
        let b = StructuredNormalizer.normalize("cson", b"{\n  \"a\": 2,\n  \"b\": 1\n}");
        assert!(a.is_some());
        assert_eq!(a, b);
        assert!(StructuredNormalizer.normalize("cson", b"a: yes\n").is_none());
    }

    #[test]
    fn code_celltypes_are_syntactic() {
        for celltype in ["bash", "python", "ipython", "text"] {
            assert!(!is_semantic_celltype(celltype), "{}", celltype);
        }
        assert!(StructuredNormalizer
            .normalize("bash", b"cat <<EOF\n# keep me\nEOF\n")
            .is_none());
    }

    #[test]
    fn index_maps_both_ways() {
        let index = SemanticIndex::new();
        let sem = Checksum::digest(b"{}\n");
        let syn1 = Checksum::digest(b"# c\n{}\n");
        let syn2 = Checksum::digest(b"{}  \n");

        index.record(syn1, "yaml", None, sem);
        index.record(syn2, "yaml", None, sem);
        index.record(syn2, "yaml", None, sem);

        assert_eq!(index.semantic(&syn1, "yaml", None), Some(sem));
        assert_eq!(index.syntactic(&sem, "yaml", None), vec![syn1, syn2]);
        assert!(index.syntactic(&sem, "cson", None).is_empty());
    }

    #[test]
    fn rerecording_moves_the_variant() {
        let index = SemanticIndex::new();
        let syn = Checksum::digest(b"a: 1\n");
        let old = Checksum::digest(b"old");
        let new = Checksum::digest(b"new");

        index.record(syn, "yaml", None, old);
        index.record(syn, "yaml", None, new);

        assert_eq!(index.semantic(&syn, "yaml", None), Some(new));
        assert!(index.syntactic(&old, "yaml", None).is_empty());
        assert_eq!(index.syntactic(&new, "yaml", None), vec![syn]);
    }

    #[test]
    fn plain_celltypes_are_their_own_semantic() {
        let index = SemanticIndex::new();
        let cs = Checksum::digest(b"data");
        assert_eq!(index.semantic(&cs, "plain", None), Some(cs));
        assert_eq!(index.syntactic(&cs, "plain", None), vec![cs]);
    }
}
