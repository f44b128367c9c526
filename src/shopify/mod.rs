pub mod bulk;
pub mod client;
pub mod queries;

pub use bulk::{BulkExporter, BulkSettings};
pub use client::{AdminApi, ShopifyClient, ShopifyConfig};
