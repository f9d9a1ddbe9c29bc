//! Provider orchestration for text generation
//!
//! One client owning both upstream providers. Generation walks an ordered
//! attempt list (primary, then fallback) and short-circuits on the first
//! success; the caller sees a single result or a single combined error.

use futures::StreamExt;
use serde::Serialize;
use std::fmt;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::generation::gemini::{GeminiClient, GenerateContentResponse};
use crate::generation::openai::{ChatCompletionResponse, FALLBACK_MODEL, OpenAiClient};
use crate::generation::prompt::{estimate_tokens, sanitize_prompt, validate_prompt};
use crate::tiers::Tier;

/// Which upstream backend produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Primary provider
    Gemini,
    /// Fallback provider
    OpenAi,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Gemini => f.write_str("gemini"),
            Provider::OpenAi => f.write_str("openai"),
        }
    }
}

/// Outcome of one generation call.
///
/// Ephemeral: returned to the caller and not persisted by this crate.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    /// Generated text
    pub text: String,

    /// Tokens consumed by the prompt
    pub input_tokens: u32,

    /// Tokens produced by the completion
    pub output_tokens: u32,

    /// Backend that served the call
    pub provider: Provider,

    /// Model that served the call
    pub model: String,
}

/// Client for generating text with primary/fallback provider selection
#[derive(Clone)]
pub struct GenerationClient {
    gemini: Option<GeminiClient>,
    openai: Option<OpenAiClient>,
}

impl GenerationClient {
    /// Build a client from whichever API keys are configured.
    ///
    /// Both keys are optional here; a client with neither key fails every
    /// generation with a configuration error.
    pub fn new(gemini_api_key: Option<String>, openai_api_key: Option<String>) -> Result<Self> {
        let gemini = gemini_api_key.map(GeminiClient::new).transpose()?;
        let openai = openai_api_key.map(OpenAiClient::new).transpose()?;
        Ok(Self { gemini, openai })
    }

    #[cfg(test)]
    pub(crate) fn with_clients(gemini: Option<GeminiClient>, openai: Option<OpenAiClient>) -> Self {
        Self { gemini, openai }
    }

    /// Primary-provider model serving a tier
    pub fn model_for_tier(&self, tier: Tier) -> &'static str {
        tier.model()
    }

    /// Generate text for a prompt, preferring the primary provider.
    ///
    /// Validation failures reject immediately without network traffic.
    /// Provider failures degrade to the fallback when one is configured;
    /// when every configured attempt fails, the combined failure surfaces
    /// as one [`Error::Generation`].
    #[instrument(skip(self, prompt), level = "debug")]
    pub async fn generate(&self, prompt: &str, tier: Tier) -> Result<GenerationResult> {
        validate_prompt(prompt, tier)?;
        let prompt = sanitize_prompt(prompt);

        if self.gemini.is_none() && self.openai.is_none() {
            return Err(Error::Config(
                "no provider API key is configured".to_string(),
            ));
        }

        let mut failures = Vec::new();

        if let Some(gemini) = &self.gemini {
            let model = tier.model();
            match gemini.generate(model, &prompt).await {
                Ok(response) => {
                    debug!(provider = "gemini", model, "generation succeeded");
                    return Ok(result_from_gemini(&prompt, response, model));
                }
                Err(e) => {
                    warn!("Primary provider failed, trying fallback if configured: {}", e);
                    failures.push(format!("gemini/{}: {}", model, e));
                }
            }
        }

        if let Some(openai) = &self.openai {
            match openai.chat(FALLBACK_MODEL, &prompt).await {
                Ok(response) => {
                    debug!(provider = "openai", model = FALLBACK_MODEL, "generation succeeded");
                    return Ok(result_from_openai(&prompt, response));
                }
                Err(e) => {
                    warn!("Fallback provider failed: {}", e);
                    failures.push(format!("openai/{}: {}", FALLBACK_MODEL, e));
                }
            }
        }

        Err(Error::Generation(failures.join("; ")))
    }

    /// Stream text for a prompt from the primary provider.
    ///
    /// The callback runs once per incoming text chunk; the return value is
    /// the accumulated result. There is no fallback on this path.
    #[instrument(skip(self, prompt, on_chunk), level = "debug")]
    pub async fn generate_stream<F>(
        &self,
        prompt: &str,
        tier: Tier,
        mut on_chunk: F,
    ) -> Result<GenerationResult>
    where
        F: FnMut(&str),
    {
        validate_prompt(prompt, tier)?;
        let prompt = sanitize_prompt(prompt);

        let gemini = self.gemini.as_ref().ok_or_else(|| {
            Error::Config("streaming requires a primary provider API key".to_string())
        })?;

        let model = tier.model();
        let stream = gemini.generate_stream(model, &prompt).await?;
        futures::pin_mut!(stream);

        let mut text = String::new();
        let mut usage = None;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let delta = chunk.text();
            if !delta.is_empty() {
                on_chunk(&delta);
                text.push_str(&delta);
            }
            if chunk.usage_metadata.is_some() {
                usage = chunk.usage_metadata;
            }
        }

        let input_tokens = usage
            .as_ref()
            .and_then(|u| u.prompt_token_count)
            .unwrap_or_else(|| estimate_tokens(&prompt) as u32);
        let output_tokens = usage
            .as_ref()
            .and_then(|u| u.candidates_token_count)
            .unwrap_or_else(|| estimate_tokens(&text) as u32);

        Ok(GenerationResult {
            text,
            input_tokens,
            output_tokens,
            provider: Provider::Gemini,
            model: model.to_string(),
        })
    }

    /// Count tokens in a prompt, asking the primary provider when one is
    /// configured and falling back to the local estimator otherwise.
    pub async fn count_tokens(&self, prompt: &str, tier: Tier) -> Result<u32> {
        match &self.gemini {
            Some(gemini) => gemini.count_tokens(tier.model(), prompt).await,
            None => Ok(estimate_tokens(prompt) as u32),
        }
    }

    /// Check the primary-provider key against the API
    pub async fn validate_api_key(&self) -> Result<bool> {
        match &self.gemini {
            Some(gemini) => gemini.validate_key().await,
            None => Err(Error::Config(
                "no primary provider API key is configured".to_string(),
            )),
        }
    }
}

fn result_from_gemini(
    prompt: &str,
    response: GenerateContentResponse,
    model: &str,
) -> GenerationResult {
    let text = response.text();
    let usage = response.usage_metadata.as_ref();

    let input_tokens = usage
        .and_then(|u| u.prompt_token_count)
        .unwrap_or_else(|| estimate_tokens(prompt) as u32);
    let output_tokens = usage
        .and_then(|u| u.candidates_token_count)
        .unwrap_or_else(|| estimate_tokens(&text) as u32);

    GenerationResult {
        text,
        input_tokens,
        output_tokens,
        provider: Provider::Gemini,
        model: model.to_string(),
    }
}

fn result_from_openai(prompt: &str, response: ChatCompletionResponse) -> GenerationResult {
    let text = response.text();
    let usage = response.usage.as_ref();

    let input_tokens = usage
        .map(|u| u.prompt_tokens)
        .unwrap_or_else(|| estimate_tokens(prompt) as u32);
    let output_tokens = usage
        .map(|u| u.completion_tokens)
        .unwrap_or_else(|| estimate_tokens(&text) as u32);

    GenerationResult {
        text,
        input_tokens,
        output_tokens,
        provider: Provider::OpenAi,
        model: FALLBACK_MODEL.to_string(),
    }
}
