//! kiln_daemon - HTTP server with OpenAI- and Ollama-compatible APIs
//!
//! This crate provides the daemon server that:
//! - Keeps loaded models resident and evicts them when their keep-alive lapses
//! - Turns engine output into a typed generation event sequence
//! - Assembles those events into streamed or single-shot protocol responses

pub mod api;
pub mod cache;
pub mod error;
pub mod pipeline;
pub mod responder;
pub mod server;
pub mod state;

pub use server::run_server;
