//! service-core: shared infrastructure for the finance workspace.
//!
//! Configuration, the `AppError` taxonomy and the response envelope it
//! renders, request extractors, HTTP middleware and tracing setup.
pub mod config;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod observability;
pub mod response;

pub use axum;
pub use serde_json;
pub use tracing;
pub use validator;
