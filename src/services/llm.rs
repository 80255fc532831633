use crate::core::config::resolve_secret;
use crate::core::error::PipelineError;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String, // "openai", "gemini" or "ollama"
    pub openai: Option<OpenAIConfig>,
    pub gemini: Option<GeminiConfig>,
    pub ollama: Option<OllamaConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            openai: None,
            gemini: None,
            ollama: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key: String,
    pub base_url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_url")]
    pub base_url: String,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_ollama_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

impl LlmConfig {
    pub fn missing_credentials(&self) -> Vec<String> {
        match self.provider.as_str() {
            "openai" => {
                let key = self.openai.as_ref().map(|c| c.api_key.as_str()).unwrap_or("");
                match resolve_secret(key, "OPENAI_API_KEY") {
                    Some(_) => vec![],
                    None => vec!["llm.openai.api_key (OPENAI_API_KEY)".to_string()],
                }
            }
            "gemini" => {
                let key = self.gemini.as_ref().map(|c| c.api_key.as_str()).unwrap_or("");
                match resolve_secret(key, "GEMINI_API_KEY") {
                    Some(_) => vec![],
                    None => vec!["llm.gemini.api_key (GEMINI_API_KEY)".to_string()],
                }
            }
            "ollama" => vec![],
            other => vec![format!("llm.provider (unknown provider '{}')", other)],
        }
    }
}

/// One chat-completion call: a system/user message pair at a temperature.
#[derive(Debug, Clone, Copy)]
pub struct Completion<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub user: &'a str,
    pub temperature: f32,
}

#[async_trait]
pub trait TextCompletionClient: Send + Sync + Debug {
    /// Returns the raw model text. No retries.
    async fn complete(&self, request: &Completion<'_>) -> Result<String, PipelineError>;
}

pub fn create_llm(config: &LlmConfig) -> Result<Box<dyn TextCompletionClient>, PipelineError> {
    let missing = config.missing_credentials();
    if !missing.is_empty() {
        return Err(PipelineError::Configuration(missing.join(", ")));
    }

    match config.provider.as_str() {
        "openai" => {
            let cfg = config.openai.clone().unwrap_or_default();
            let api_key = resolve_secret(&cfg.api_key, "OPENAI_API_KEY").unwrap_or_default();
            Ok(Box::new(OpenAIClient::new(&api_key, cfg.base_url.as_deref())))
        }
        "gemini" => {
            let cfg = config.gemini.clone().unwrap_or_default();
            let api_key = resolve_secret(&cfg.api_key, "GEMINI_API_KEY").unwrap_or_default();
            Ok(Box::new(GeminiClient::new(&api_key)))
        }
        "ollama" => {
            let base_url = config
                .ollama
                .as_ref()
                .map(|c| c.base_url.clone())
                .unwrap_or_else(default_ollama_url);
            Ok(Box::new(OllamaClient::new(&base_url)))
        }
        other => Err(PipelineError::Configuration(format!(
            "unknown LLM provider: {}",
            other
        ))),
    }
}

fn non_empty(content: Option<String>) -> Option<String> {
    content.filter(|c| !c.trim().is_empty())
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(api_key: &str, base_url: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: base_url
                .unwrap_or("https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    temperature: f32,
    messages: Vec<ChatMessage>,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

fn chat_messages(request: &Completion<'_>) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system",
            content: request.system.to_string(),
        },
        ChatMessage {
            role: "user",
            content: request.user.to_string(),
        },
    ]
}

#[async_trait]
impl TextCompletionClient for OpenAIClient {
    async fn complete(&self, request: &Completion<'_>) -> Result<String, PipelineError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(
            "OpenAI completion: model={} temperature={}",
            request.model, request.temperature
        );

        let request_body = OpenAIRequest {
            model: request.model.to_string(),
            temperature: request.temperature,
            messages: chat_messages(request),
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await
            .map_err(|e| PipelineError::transport("OpenAI", e))?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::upstream("OpenAI", error_text));
        }

        let result: OpenAIResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::transport("OpenAI", e))?;
        result
            .choices
            .into_iter()
            .next()
            .and_then(|choice| non_empty(choice.message.content))
            .ok_or(PipelineError::EmptyResponse("OpenAI"))
    }
}

// --- Gemini ---

#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    system_instruction: GeminiSystemInstruction,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiSystemInstruction {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GeminiError {
    message: String,
}

#[async_trait]
impl TextCompletionClient for GeminiClient {
    async fn complete(&self, request: &Completion<'_>) -> Result<String, PipelineError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            request.model, self.api_key
        );

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: request.user.to_string(),
                }],
            }],
            system_instruction: GeminiSystemInstruction {
                parts: vec![GeminiPart {
                    text: request.system.to_string(),
                }],
            },
            generation_config: GeminiGenerationConfig {
                temperature: request.temperature,
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| PipelineError::transport("Gemini", e))?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::upstream("Gemini", error_text));
        }

        let response_text = resp
            .text()
            .await
            .map_err(|e| PipelineError::transport("Gemini", e))?;
        let result: GeminiResponse = serde_json::from_str(&response_text).map_err(|e| {
            PipelineError::upstream(
                "Gemini",
                format!("unparseable response: {}. Body: {}", e, response_text),
            )
        })?;

        if let Some(err) = result.error {
            return Err(PipelineError::upstream("Gemini", err.message));
        }

        let first = result.candidates.and_then(|c| c.into_iter().next());
        if let Some(candidate) = first {
            let text = candidate
                .content
                .and_then(|content| content.parts.into_iter().next())
                .map(|part| part.text);
            if let Some(text) = non_empty(text) {
                return Ok(text);
            }
            debug!(
                "Gemini response empty. Finish reason: {}",
                candidate.finish_reason.as_deref().unwrap_or("UNKNOWN")
            );
        }

        Err(PipelineError::EmptyResponse("Gemini"))
    }
}

// --- Ollama ---

#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: Option<OpenAIMessageResponse>,
}

#[async_trait]
impl TextCompletionClient for OllamaClient {
    async fn complete(&self, request: &Completion<'_>) -> Result<String, PipelineError> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: request.model.to_string(),
            messages: chat_messages(request),
            stream: false,
            options: OllamaOptions {
                temperature: request.temperature,
            },
        };

        let resp = self
            .client
            .post(&url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| PipelineError::transport("Ollama", e))?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::upstream("Ollama", error_text));
        }

        let result: OllamaResponse = resp
            .json()
            .await
            .map_err(|e| PipelineError::transport("Ollama", e))?;
        result
            .message
            .and_then(|m| non_empty(m.content))
            .ok_or(PipelineError::EmptyResponse("Ollama"))
    }
}
