//! Shopify -> commerce catalog sync: bulk export, tree assembly,
//! normalization, image relocation and reconciliation.

pub mod api;
pub mod catalog;
pub mod destination;
pub mod error;
pub mod logging;
pub mod media;
pub mod normalization;
pub mod pipeline;
pub mod reconcile;
pub mod runs;
pub mod scheduler;
pub mod shopify;

pub mod util {
    pub mod db;
    pub mod env;
    pub mod sleep;
}

pub use error::{AssetError, BulkError, StoreError};
