//! HTTP surface of a bureau (Axum).

pub mod api;
pub mod router;
pub mod server;

pub use router::create_app_router;
pub use server::serve;
