//! Core types for the polygate LLM gateway
//!
//! This crate holds the vocabulary shared by every other crate in the
//! workspace: provider identity and capabilities, the model catalog with
//! pricing, the OpenAI-compatible wire types, per-request routing metadata,
//! and the gateway-wide error type. It deliberately contains no I/O.

pub mod catalog;
pub mod error;
pub mod openai;
pub mod provider;
pub mod request;

pub use catalog::ModelCatalog;
pub use error::{AttemptRecord, Error, Result};
pub use openai::{
    ChatMessage, ChatRequest, ChatResponse, Choice, Delta, Role, Stop, StreamChoice, StreamChunk,
    Usage,
};
pub use provider::{Capability, ChatProvider, ChatStream, ModelPricing, ProviderId};
pub use request::{RequestMetadata, RoutingHints, RoutingStrategy};
