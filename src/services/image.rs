use crate::core::config::resolve_secret;
use crate::core::error::PipelineError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_image_provider")]
    pub provider: String, // "fal"
    #[serde(default)]
    pub fal: FalConfig,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_output_count")]
    pub output_count: u32,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            provider: default_image_provider(),
            fal: FalConfig::default(),
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_attempts: default_max_poll_attempts(),
            output_format: default_output_format(),
            output_count: default_output_count(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FalConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_fal_base_url")]
    pub base_url: String,
    /// Model path on the queue, e.g. "fal-ai/nano-banana".
    #[serde(default = "default_fal_model")]
    pub model: String,
}

impl Default for FalConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_fal_base_url(),
            model: default_fal_model(),
        }
    }
}

fn default_image_provider() -> String {
    "fal".to_string()
}
fn default_poll_interval_ms() -> u64 {
    5000
}
fn default_max_poll_attempts() -> u32 {
    60
}
fn default_output_format() -> String {
    "png".to_string()
}
fn default_output_count() -> u32 {
    1
}
fn default_fal_base_url() -> String {
    "https://queue.fal.run".to_string()
}
fn default_fal_model() -> String {
    "fal-ai/nano-banana".to_string()
}

impl ImageConfig {
    pub fn missing_credentials(&self) -> Vec<String> {
        match self.provider.as_str() {
            "fal" => match resolve_secret(&self.fal.api_key, "FAL_KEY") {
                Some(_) => vec![],
                None => vec!["image.fal.api_key (FAL_KEY)".to_string()],
            },
            other => vec![format!("image.provider (unknown provider '{}')", other)],
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_attempts: self.max_poll_attempts,
        }
    }
}

/// Fixed-interval polling with a hard attempt cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

#[async_trait]
pub trait ImageEditClient: Send + Sync {
    /// Edits `base_image_url` according to `prompt` and returns the URL of
    /// the first resulting image.
    async fn generate_image(&self, prompt: &str, base_image_url: &str)
        -> Result<String, PipelineError>;
}

pub fn create_image_client(config: &ImageConfig) -> Result<Box<dyn ImageEditClient>, PipelineError> {
    let missing = config.missing_credentials();
    if !missing.is_empty() {
        return Err(PipelineError::Configuration(missing.join(", ")));
    }
    match config.provider.as_str() {
        "fal" => {
            let api_key = resolve_secret(&config.fal.api_key, "FAL_KEY").unwrap_or_default();
            let queue = FalQueue::new(config, &api_key);
            Ok(Box::new(QueuedImageEditor::new(queue, config.poll_policy())))
        }
        other => Err(PipelineError::Configuration(format!(
            "unknown image provider: {}",
            other
        ))),
    }
}

// --- Queue protocol ---

#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStatus {
    pub status: Option<String>,
    pub image_urls: Vec<String>,
}

impl QueueStatus {
    /// Reads `status` and `images[].url` either at the top level or nested
    /// under `data`.
    pub fn from_value(value: &Value) -> Self {
        let field = |name: &str| -> Option<&Value> {
            value
                .get(name)
                .filter(|v| !v.is_null())
                .or_else(|| value.get("data").and_then(|d| d.get(name)))
        };
        let status = field("status").and_then(Value::as_str).map(str::to_string);
        let image_urls = field("images")
            .and_then(Value::as_array)
            .map(|images| {
                images
                    .iter()
                    .filter_map(|img| img.get("url").and_then(Value::as_str))
                    .filter(|url| !url.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self { status, image_urls }
    }

    fn is_failed(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("failed"))
    }
}

/// Transport half of an asynchronous image-editing service.
#[async_trait]
pub trait ImageQueue: Send + Sync {
    /// Enqueues the edit and returns the request id.
    async fn submit(&self, prompt: &str, image_url: &str) -> Result<String, PipelineError>;
    /// Any error here is treated as transient by the poller.
    async fn fetch_status(&self, request_id: &str) -> Result<QueueStatus>;
}

pub struct QueuedImageEditor<Q: ImageQueue> {
    queue: Q,
    policy: PollPolicy,
}

impl<Q: ImageQueue> QueuedImageEditor<Q> {
    pub fn new(queue: Q, policy: PollPolicy) -> Self {
        Self { queue, policy }
    }

    async fn wait_for_result(&self, request_id: &str) -> Result<String, PipelineError> {
        for attempt in 1..=self.policy.max_attempts {
            tokio::time::sleep(self.policy.interval).await;

            let status = match self.queue.fetch_status(request_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(
                        "Poll {}/{} for {} failed, retrying: {:#}",
                        attempt, self.policy.max_attempts, request_id, e
                    );
                    continue;
                }
            };
            debug!(
                "Poll {}/{} for {}: status={:?} images={}",
                attempt,
                self.policy.max_attempts,
                request_id,
                status.status,
                status.image_urls.len()
            );

            if status.is_failed() {
                return Err(PipelineError::GenerationFailed {
                    request_id: request_id.to_string(),
                });
            }
            if let Some(url) = status.image_urls.into_iter().next() {
                return Ok(url);
            }
        }

        Err(PipelineError::Timeout {
            request_id: request_id.to_string(),
            attempts: self.policy.max_attempts,
        })
    }
}

#[async_trait]
impl<Q: ImageQueue> ImageEditClient for QueuedImageEditor<Q> {
    async fn generate_image(
        &self,
        prompt: &str,
        base_image_url: &str,
    ) -> Result<String, PipelineError> {
        let request_id = self.queue.submit(prompt, base_image_url).await?;
        info!("Image request {} queued", request_id);
        self.wait_for_result(&request_id).await
    }
}

// --- fal.ai ---

pub struct FalQueue {
    api_key: String,
    base_url: String,
    model: String,
    output_format: String,
    output_count: u32,
    client: reqwest::Client,
}

impl FalQueue {
    pub fn new(config: &ImageConfig, api_key: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            base_url: config.fal.base_url.trim_end_matches('/').to_string(),
            model: config.fal.model.trim_matches('/').to_string(),
            output_format: config.output_format.clone(),
            output_count: config.output_count,
            client: reqwest::Client::new(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Key {}", self.api_key)
    }
}

fn request_id_from(value: &Value) -> Option<String> {
    value
        .get("request_id")
        .or_else(|| value.get("data").and_then(|d| d.get("request_id")))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl ImageQueue for FalQueue {
    async fn submit(&self, prompt: &str, image_url: &str) -> Result<String, PipelineError> {
        let url = format!("{}/{}/edit", self.base_url, self.model);
        let payload = json!({
            "prompt": prompt,
            "image_urls": [image_url],
            "num_images": self.output_count,
            "output_format": self.output_format,
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&payload)
            .send()
            .await
            .map_err(|e| PipelineError::transport("fal.ai", e))?;

        if !resp.status().is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::upstream("fal.ai", error_text));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| PipelineError::transport("fal.ai", e))?;
        request_id_from(&body).ok_or_else(|| PipelineError::upstream("fal.ai", "no request id"))
    }

    async fn fetch_status(&self, request_id: &str) -> Result<QueueStatus> {
        let url = format!("{}/{}/requests/{}", self.base_url, self.model, request_id);
        let resp = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await
            .context("Failed to reach fal.ai queue")?;

        if !resp.status().is_success() {
            return Err(anyhow!("fal.ai status request returned {}", resp.status()));
        }

        let body: Value = resp.json().await.context("Failed to parse fal.ai status")?;
        Ok(QueueStatus::from_value(&body))
    }
}
