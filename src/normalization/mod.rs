pub mod dedupe;
pub mod metafields;
pub mod title;

pub use dedupe::{normalize_collections, normalize_products, NormalizeReport};
