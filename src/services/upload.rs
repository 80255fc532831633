use crate::core::config::resolve_secret;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_upload_provider")]
    pub provider: String, // "imgbb"
    #[serde(default)]
    pub imgbb: ImgbbConfig,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            provider: default_upload_provider(),
            imgbb: ImgbbConfig::default(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ImgbbConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_imgbb_url")]
    pub endpoint: String,
}

impl Default for ImgbbConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            endpoint: default_imgbb_url(),
        }
    }
}

fn default_upload_provider() -> String {
    "imgbb".to_string()
}

fn default_imgbb_url() -> String {
    "https://api.imgbb.com/1/upload".to_string()
}

impl UploadConfig {
    pub fn missing_credentials(&self) -> Vec<String> {
        match self.provider.as_str() {
            "imgbb" => match resolve_secret(&self.imgbb.api_key, "IMGBB_API_KEY") {
                Some(_) => vec![],
                None => vec!["upload.imgbb.api_key (IMGBB_API_KEY)".to_string()],
            },
            other => vec![format!("upload.provider (unknown provider '{}')", other)],
        }
    }
}

/// Turns local image bytes into a publicly reachable URL.
#[async_trait]
pub trait ImageUploader: Send + Sync {
    async fn upload(&self, file_name: &str, data: &[u8]) -> Result<String>;
}

pub fn create_uploader(config: &UploadConfig) -> Result<Box<dyn ImageUploader>> {
    match config.provider.as_str() {
        "imgbb" => {
            let api_key = resolve_secret(&config.imgbb.api_key, "IMGBB_API_KEY")
                .ok_or_else(|| anyhow!("ImgBB api key is not configured"))?;
            Ok(Box::new(ImgbbUploader::new(&api_key, &config.imgbb.endpoint)))
        }
        other => Err(anyhow!("Unknown upload provider: {}", other)),
    }
}

pub struct ImgbbUploader {
    api_key: String,
    endpoint: String,
    client: Client,
}

impl ImgbbUploader {
    pub fn new(api_key: &str, endpoint: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            endpoint: endpoint.to_string(),
            client: Client::new(),
        }
    }
}

/// Reads `data.url` from an ImgBB response and checks that it parses.
fn hosted_url(body: &Value) -> Result<String> {
    let raw = body
        .get("data")
        .and_then(|d| d.get("url"))
        .and_then(Value::as_str)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| anyhow!("Upload response did not contain an image url"))?;
    let parsed = url::Url::parse(raw).with_context(|| format!("Invalid image url: {}", raw))?;
    Ok(parsed.to_string())
}

#[async_trait]
impl ImageUploader for ImgbbUploader {
    async fn upload(&self, file_name: &str, data: &[u8]) -> Result<String> {
        debug!("Uploading {} ({} bytes)", file_name, data.len());
        let part = multipart::Part::bytes(data.to_vec()).file_name(file_name.to_string());
        let form = multipart::Form::new()
            .text("key", self.api_key.clone())
            .part("image", part);

        let resp = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .context("Failed to send upload request")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Upload failed ({}): {}", status, error_text));
        }

        let body: Value = resp.json().await.context("Failed to parse upload response")?;
        hosted_url(&body)
    }
}
