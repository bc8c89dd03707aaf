//! Model catalog: variant metadata and identifier parsing.
//!
//! This module is the canonical place for the variant-to-architecture and
//! variant-to-checkpoint mapping. Adding a variant is a data change here,
//! not a code change elsewhere.

mod variant;

pub use variant::{parse_model_variant, ModelVariant};
