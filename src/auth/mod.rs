//! Shared-secret authentication for the HTTP surface.
//!
//! When an API key is configured every route except `/health` requires
//! `Authorization: Bearer <key>`; without one, requests pass through.

pub mod middleware;

pub use middleware::require_api_key;
