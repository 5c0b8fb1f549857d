//! Mailroom: LLM-drafted email replies with a markdown-to-email renderer.

pub mod api;
pub mod config;
pub mod delivery;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod render;
pub mod store;
