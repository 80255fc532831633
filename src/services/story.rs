use crate::core::error::PipelineError;
use crate::core::state::{
    BookCreationRequest, DerivedPromptSet, IllustrationStyle, PageDraft, StoryResult,
};
use crate::services::generation_config::{GenerationConfig, PromptTemplateSet};
use crate::services::llm::{Completion, TextCompletionClient};
use crate::services::prompt::{identity_rule, render_template, summarize_references};
use log::{info, warn};
use serde::Deserialize;

/// Soft limit the story prompts ask the model to respect.
pub const MAX_PAGE_CHARS: usize = 400;

const STYLIZED_REGISTER: &str =
    "Stylized digital illustration, animated cinematic look, dynamic lighting.";
const PHOTOREALISTIC_REGISTER: &str = "Realistic digital illustration, photorealistic style, natural lighting, detailed textures, life-like appearance, not cartoon or stylized.";
const PHOTOREALISTIC_DERIVATION: &str = "IMPORTANTE: o prompt_estilo_imagem deve especificar um estilo realista e fotográfico, similar a uma foto profissional, não um desenho animado ou ilustração estilizada.";

const IMAGE_REGISTER_TOKEN: &str = "{{IMAGE_REGISTER}}";

/// Builds the system/user message pair for one story strategy.
pub trait StoryPromptBuilder: Send + Sync {
    fn system_prompt(&self) -> String;
    fn user_prompt(&self) -> String;
}

pub struct CartoonStoryPrompt<'a> {
    templates: &'a PromptTemplateSet,
    request: &'a BookCreationRequest,
    identity_rule: &'a str,
}

impl StoryPromptBuilder for CartoonStoryPrompt<'_> {
    fn system_prompt(&self) -> String {
        self.templates.story_cartoon_system.clone()
    }

    fn user_prompt(&self) -> String {
        let summary = summarize_references(&self.request.references);
        render_template(
            &self.templates.story_cartoon_user,
            &[
                ("REFERENCIAS_SUMMARY", summary.as_str()),
                ("LINGUAGEM", self.request.language.as_str()),
                ("ESTILO_IMAGEM", self.request.style.label.as_str()),
                ("CHARACTER_IDENTITY_RULE", self.identity_rule),
                ("HISTORIA", self.request.story.as_str()),
            ],
        )
    }
}

pub struct ImageBaseStoryPrompt<'a> {
    templates: &'a PromptTemplateSet,
    request: &'a BookCreationRequest,
    identity_rule: &'a str,
    derived: Option<&'a DerivedPromptSet>,
}

impl StoryPromptBuilder for ImageBaseStoryPrompt<'_> {
    fn system_prompt(&self) -> String {
        self.templates.story_with_image_base_system.clone()
    }

    fn user_prompt(&self) -> String {
        let summary = summarize_references(&self.request.references);
        let style_prompt = self
            .derived
            .map(|d| d.style_prompt.as_str())
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(self.request.style.label.as_str());
        let bible = match self.derived {
            Some(d) if !d.character_bible.trim().is_empty() => format!(
                "Ficha do personagem (seguir fielmente):\n{}",
                d.character_bible.trim()
            ),
            _ => String::new(),
        };
        let register = match self.request.style.kind {
            IllustrationStyle::Photorealistic => PHOTOREALISTIC_REGISTER,
            _ => STYLIZED_REGISTER,
        };

        let template = &self.templates.story_with_image_base_user;
        let mut user = render_template(
            template,
            &[
                ("REFERENCIAS_SUMMARY", summary.as_str()),
                ("LINGUAGEM", self.request.language.as_str()),
                ("PROMPT_ESTILO_IMAGEM", style_prompt),
                ("FICHA_PERSONAGEM", bible.as_str()),
                ("IMAGE_REGISTER", register),
                ("CHARACTER_IDENTITY_RULE", self.identity_rule),
                ("HISTORIA", self.request.story.as_str()),
            ],
        );
        // Stored templates predate the register token.
        if !template.contains(IMAGE_REGISTER_TOKEN) {
            user.push_str("\n\n");
            user.push_str(register);
        }
        user
    }
}

/// Runs the style-derivation and story stages against the text model.
pub struct StoryGenerator<'a> {
    llm: &'a dyn TextCompletionClient,
    config: &'a GenerationConfig,
}

impl<'a> StoryGenerator<'a> {
    pub fn new(llm: &'a dyn TextCompletionClient, config: &'a GenerationConfig) -> Self {
        Self { llm, config }
    }

    pub fn prompt_for(
        &self,
        request: &'a BookCreationRequest,
        derived: Option<&'a DerivedPromptSet>,
    ) -> Box<dyn StoryPromptBuilder + 'a> {
        let templates = &self.config.prompts;
        let rule = identity_rule(self.config);
        match request.style.kind {
            IllustrationStyle::Cartoon => Box::new(CartoonStoryPrompt {
                templates,
                request,
                identity_rule: rule,
            }),
            IllustrationStyle::Stylized | IllustrationStyle::Photorealistic => {
                Box::new(ImageBaseStoryPrompt {
                    templates,
                    request,
                    identity_rule: rule,
                    derived,
                })
            }
        }
    }

    pub fn derivation_user_prompt(&self, request: &BookCreationRequest) -> String {
        let summary = summarize_references(&request.references);
        let mut user = render_template(
            &self.config.prompts.image_prompts_user,
            &[
                ("HISTORIA", request.story.as_str()),
                ("REFERENCIAS_SUMMARY", summary.as_str()),
                ("ESTILO_IMAGEM", request.style.label.as_str()),
            ],
        );
        if request.style.kind == IllustrationStyle::Photorealistic {
            user.push_str("\n\n");
            user.push_str(PHOTOREALISTIC_DERIVATION);
        }
        user
    }

    /// Character prompt, style prompt and character bible for non-cartoon books.
    pub async fn derive_prompts(
        &self,
        request: &BookCreationRequest,
    ) -> Result<DerivedPromptSet, PipelineError> {
        info!("Deriving character and style prompts ({})", request.style.label);
        let user = self.derivation_user_prompt(request);
        let raw = self
            .llm
            .complete(&Completion {
                model: &self.config.model,
                system: &self.config.prompts.image_prompts_system,
                user: &user,
                temperature: self.config.temperature_image_prompts,
            })
            .await?;
        parse_derived_prompts(&raw)
    }

    pub async fn generate_story(
        &self,
        request: &'a BookCreationRequest,
        derived: Option<&'a DerivedPromptSet>,
    ) -> Result<StoryResult, PipelineError> {
        info!("Generating story text ({:?} strategy)", request.style.kind);
        let prompt = self.prompt_for(request, derived);
        let system = prompt.system_prompt();
        let user = prompt.user_prompt();
        let raw = self
            .llm
            .complete(&Completion {
                model: &self.config.model,
                system: &system,
                user: &user,
                temperature: self.config.temperature_story,
            })
            .await?;
        parse_story(&raw)
    }
}

/// Pulls the body out of a fenced code block (optionally tagged `json`),
/// otherwise returns the trimmed input.
pub fn extract_json(text: &str) -> String {
    if let Some(start) = text.find("```") {
        let mut rest = &text[start + 3..];
        if rest.get(..4).is_some_and(|tag| tag.eq_ignore_ascii_case("json")) {
            rest = &rest[4..];
        }
        if let Some(end) = rest.find("```") {
            return rest[..end].trim().to_string();
        }
    }
    text.trim().to_string()
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct StoryResponse {
    pagina1: PageResponse,
    pagina2: PageResponse,
    pagina3: PageResponse,
}

#[derive(Deserialize)]
struct PageResponse {
    texto: String,
    #[serde(default)]
    imagem: Option<String>,
    #[serde(default, rename = "imagem(em ingles)")]
    imagem_en: Option<String>,
}

impl PageResponse {
    fn into_draft(self, number: usize) -> Result<PageDraft, PipelineError> {
        let text = self.texto.trim().to_string();
        if text.is_empty() {
            return Err(PipelineError::MalformedResponse(format!(
                "pagina{} has empty texto",
                number
            )));
        }
        let chars = text.chars().count();
        if chars > MAX_PAGE_CHARS {
            warn!(
                "pagina{} text has {} characters (limit {}), keeping as-is",
                number, chars, MAX_PAGE_CHARS
            );
        }
        let image_description = self
            .imagem_en
            .filter(|d| !d.trim().is_empty())
            .or(self.imagem)
            .unwrap_or_default()
            .trim()
            .to_string();
        Ok(PageDraft {
            text,
            image_description,
        })
    }
}

fn malformed(what: &str, err: serde_json::Error, body: &str) -> PipelineError {
    let excerpt: String = body.chars().take(200).collect();
    PipelineError::MalformedResponse(format!("{}: {} (body: {})", what, err, excerpt))
}

pub fn parse_story(raw: &str) -> Result<StoryResult, PipelineError> {
    let json = extract_json(raw);
    let response: StoryResponse =
        serde_json::from_str(&json).map_err(|e| malformed("story JSON", e, &json))?;
    Ok(StoryResult {
        pages: [
            response.pagina1.into_draft(1)?,
            response.pagina2.into_draft(2)?,
            response.pagina3.into_draft(3)?,
        ],
    })
}

pub fn parse_derived_prompts(raw: &str) -> Result<DerivedPromptSet, PipelineError> {
    let json = extract_json(raw);
    serde_json::from_str(&json).map_err(|e| malformed("image prompt JSON", e, &json))
}
