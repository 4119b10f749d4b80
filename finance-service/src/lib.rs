//! finance-service: fee-line formulas, milestone amounts, payment recording
//! and finance student summaries for school finance orders.

pub mod config;
pub mod dtos;
pub mod engine;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

pub use startup::{AppState, Application};
