//! Transformations: canonical form, checksum and semantic normalization

mod canonical;
mod model;
mod semantic;

pub use canonical::to_canonical_bytes;
pub use model::{ExecutionMeta, OutputPin, Pin, Transformation};
pub use semantic::{is_semantic_celltype, Normalizer, SemanticIndex, StructuredNormalizer};
