//! REST API server: admission, job execution, stats and OpenAPI documentation.

pub mod auth;
pub mod dto;
pub mod error;
pub mod limiter;
pub mod openapi;
pub mod routes;
pub mod state;
