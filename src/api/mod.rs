//! HTTP trigger surface: start sync runs and list their records.

pub mod auth;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use handlers::AppState;
pub use server::ApiServer;
