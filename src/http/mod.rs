//! HTTP layer: the axum router, request handlers and error envelope.

pub mod handler;
