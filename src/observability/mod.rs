//! Observability infrastructure.
//!
//! Provides structured logging through `tracing`, human-readable or JSON.

pub mod tracing;
