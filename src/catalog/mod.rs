pub mod assemble;
pub mod flat;
pub mod types;

pub use assemble::{assemble_collections, assemble_products, AssemblyReport, EntityKind};
pub use types::{SourceCollection, SourceProduct};
