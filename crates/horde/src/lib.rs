//! Client library for the remote generation cluster (AI Horde v2 API).
//!
//! Provides typed request/response messages, payload construction from
//! [`GenerationParams`](pixelq_core::params::GenerationParams), the
//! [`GenerationApi`](api::GenerationApi) trait the orchestrator depends on,
//! and its HTTP implementation [`HordeClient`](api::HordeClient).

pub mod api;
pub mod messages;
pub mod payload;

pub use api::{GenerationApi, HordeApiError, HordeClient, HordeClientConfig};
