use crate::core::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type BookId = i64;

/// Number of pages every generated book has.
pub const PAGE_COUNT: usize = 3;

/// Rendering strategy, decided once from the free-text style label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IllustrationStyle {
    /// Direct cartoon story, no style derivation.
    Cartoon,
    /// Derived style, stylized/animated cinematic image descriptions.
    Stylized,
    /// Derived style, photorealistic image descriptions ("Ilustração Digital").
    Photorealistic,
}

impl IllustrationStyle {
    pub fn from_label(label: &str) -> Self {
        let lower = label.to_lowercase();
        if lower.contains("cartoon") {
            Self::Cartoon
        } else if lower.contains("ilustracao")
            || lower.contains("ilustração")
            || lower.contains("illustration")
        {
            Self::Photorealistic
        } else {
            Self::Stylized
        }
    }

    pub fn requires_style_derivation(self) -> bool {
        !matches!(self, Self::Cartoon)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleChoice {
    pub label: String,
    pub kind: IllustrationStyle,
}

impl StyleChoice {
    pub fn from_label(label: impl Into<String>) -> Self {
        let label = label.into();
        let kind = IllustrationStyle::from_label(&label);
        Self { label, kind }
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub file_name: String,
    pub data: Vec<u8>,
    /// Who is pictured ("Ana, 6 anos").
    pub description: String,
    /// Narrative role ("mãe", "protagonista").
    pub role: String,
}

#[derive(Debug, Clone)]
pub struct BookCreationRequest {
    pub title: String,
    pub category: String,
    pub audience: String,
    pub language: String,
    pub story: String,
    pub style: StyleChoice,
    pub references: Vec<ReferenceImage>,
    pub base_image_index: usize,
    pub user_id: Option<String>,
}

impl BookCreationRequest {
    pub fn base_image(&self) -> Result<&ReferenceImage, PipelineError> {
        if self.references.is_empty() {
            return Err(PipelineError::InvalidRequest(
                "at least one reference image is required".to_string(),
            ));
        }
        self.references.get(self.base_image_index).ok_or_else(|| {
            PipelineError::InvalidRequest(format!(
                "base image index {} is out of range ({} reference images)",
                self.base_image_index,
                self.references.len()
            ))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookStatus {
    #[serde(rename = "Em Criação")]
    InProgress,
    #[serde(rename = "Finalizado")]
    Finalized,
}

impl BookStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "Em Criação",
            Self::Finalized => "Finalizado",
        }
    }
}

/// Fields written when the book row is first created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewBook {
    pub title: String,
    pub category: String,
    pub audience: String,
    pub language: String,
    pub style: String,
    pub story: String,
    pub is_public: bool,
    pub user_id: Option<String>,
    pub reference_image_url: String,
    pub status: BookStatus,
}

impl NewBook {
    pub fn from_request(request: &BookCreationRequest, reference_image_url: &str) -> Self {
        Self {
            title: request.title.clone(),
            category: request.category.clone(),
            audience: request.audience.clone(),
            language: request.language.clone(),
            style: request.style.label.clone(),
            story: request.story.clone(),
            is_public: true,
            user_id: request.user_id.clone(),
            reference_image_url: reference_image_url.to_string(),
            status: BookStatus::InProgress,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageRecord {
    pub text: String,
    pub image_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookRecord {
    pub id: BookId,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub book: NewBook,
    #[serde(default)]
    pub pages: Vec<PageRecord>,
}

/// Character/style context produced by the style-derivation call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DerivedPromptSet {
    #[serde(rename = "prompt_personagem")]
    pub character_prompt: String,
    #[serde(rename = "prompt_estilo_imagem")]
    pub style_prompt: String,
    #[serde(rename = "ficha_personagem")]
    pub character_bible: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageDraft {
    pub text: String,
    /// English scene description; may be empty when the model omitted it.
    pub image_description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoryResult {
    pub pages: [PageDraft; PAGE_COUNT],
}
