//! Text generation adapter over an OpenAI-compatible chat-completions API.
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Generation;
use crate::error::GenerationError;
use crate::model::ContentType;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/";
const TITLE_INPUT_CHARS: usize = 500;
const CONTENT_MAX_TOKENS: u32 = 1000;
const TITLE_MAX_TOKENS: u32 = 50;
const TEMPERATURE: f64 = 0.7;

const TITLE_SYSTEM_PROMPT: &str = "You are a title generator. Generate a concise, engaging title \
(maximum 10 words) based on the provided content.";

static SURROUNDING_QUOTES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"^["']|["']$"#).expect("valid quote regex"));

/// External generation service: content for a prompt, and a short title for a text.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, content_type: ContentType)
        -> Result<String, GenerationError>;

    async fn summarize_title(&self, text: &str) -> Result<String, GenerationError>;
}

pub fn system_prompt(content_type: ContentType) -> &'static str {
    match content_type {
        ContentType::Blog => "You are an expert blog writer. Write engaging, informative, and well-structured blog posts. Use clear headings, proper formatting, and maintain a professional yet accessible tone.",
        ContentType::Product => "You are a professional product description writer. Write compelling, detailed product descriptions that highlight features, benefits, and appeal to potential customers. Be persuasive but honest.",
        ContentType::Caption => "You are a creative social media content writer. Write engaging, concise captions that are perfect for social media posts. Include relevant hashtags when appropriate and maintain an authentic voice.",
    }
}

/// First `TITLE_INPUT_CHARS` characters of the generated text.
pub fn title_input(text: &str) -> &str {
    match text.char_indices().nth(TITLE_INPUT_CHARS) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub fn clean_title(raw: &str) -> String {
    SURROUNDING_QUOTES.replace_all(raw.trim(), "").trim().to_string()
}

pub fn build_chat_request(model: &str, system: &str, user: &str, max_tokens: u32) -> Value {
    json!({
        "model": model,
        "messages": [
            { "role": "system", "content": system },
            { "role": "user", "content": user },
        ],
        "temperature": TEMPERATURE,
        "max_tokens": max_tokens,
    })
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Clone)]
pub struct OpenAiGenerator {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl fmt::Debug for OpenAiGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiGenerator")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl OpenAiGenerator {
    pub fn new(
        api_key: String,
        model: String,
        base_url: Url,
        timeout: Duration,
    ) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .user_agent("content-pipeline/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
            model,
        })
    }

    pub fn from_config(cfg: &Generation) -> Result<Self, GenerationError> {
        let base = if cfg.base_url.trim().is_empty() {
            DEFAULT_BASE_URL
        } else {
            cfg.base_url.as_str()
        };
        let base_url = Url::parse(base)
            .map_err(|e| GenerationError::Other(format!("invalid base url '{base}': {e}")))?;
        Self::new(
            cfg.api_key.clone(),
            cfg.model.clone(),
            base_url,
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    pub fn build_request(&self, body: &Value) -> Result<reqwest::Request, GenerationError> {
        let endpoint = self
            .base_url
            .join("v1/chat/completions")
            .map_err(|e| GenerationError::Other(format!("invalid endpoint: {e}")))?;
        Ok(self
            .http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .build()?)
    }

    async fn complete(&self, system: &str, user: &str, max_tokens: u32)
        -> Result<String, GenerationError> {
        let body = build_chat_request(&self.model, system, user, max_tokens);
        let request = self.build_request(&body)?;
        debug!(url = %request.url(), model = %self.model, "chat completion request");

        let res = self.http.execute(request).await.map_err(|e| {
            if e.is_timeout() {
                GenerationError::Timeout
            } else {
                GenerationError::Request(e)
            }
        })?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%status, "generation service error");
            return Err(GenerationError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let payload: ChatResponse = res.json().await?;
        payload
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or(GenerationError::EmptyOutput)
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        prompt: &str,
        content_type: ContentType,
    ) -> Result<String, GenerationError> {
        let text = self
            .complete(system_prompt(content_type), prompt, CONTENT_MAX_TOKENS)
            .await?;
        info!(%content_type, chars = text.chars().count(), "content generated");
        Ok(text)
    }

    async fn summarize_title(&self, text: &str) -> Result<String, GenerationError> {
        let user = format!("Generate a title for this content:\n\n{}", title_input(text));
        let raw = self
            .complete(TITLE_SYSTEM_PROMPT, &user, TITLE_MAX_TOKENS)
            .await?;
        let title = clean_title(&raw);
        if title.is_empty() {
            return Err(GenerationError::EmptyOutput);
        }
        Ok(title)
    }
}
