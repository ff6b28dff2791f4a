//! Domain primitives shared by every pixelq crate.
//!
//! Kept free of database and HTTP dependencies so the storage layer, the
//! remote API client and the orchestrator can all depend on it.

pub mod error;
pub mod job_errors;
pub mod params;
pub mod rate_limit;
pub mod types;
