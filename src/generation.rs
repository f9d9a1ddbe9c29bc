//! Text generation against upstream providers
//!
//! This module wraps the primary (Gemini) and fallback (OpenAI-compatible)
//! text-generation backends behind one client, together with the prompt
//! validation and sanitization that runs before any network call.

mod client;
mod gemini;
mod openai;
mod prompt;

pub use client::{GenerationClient, GenerationResult, Provider};
pub use openai::FALLBACK_MODEL;
pub use prompt::{estimate_tokens, sanitize_prompt, validate_prompt};

#[cfg(test)]
pub(crate) use gemini::GeminiClient;
#[cfg(test)]
pub(crate) use openai::OpenAiClient;
