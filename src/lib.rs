//! Two-sided reverse proxy for LM Studio: the edge terminates an
//! OpenAI-compatible HTTP API and relays requests over persistent
//! WebSocket connections to workers co-located with the inference runtime.

pub mod auth;
pub mod config;
pub mod edge;
pub mod error;
pub mod protocol;
pub mod worker;
