use crate::core::error::PipelineError;
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

pub const DEFAULT_AI_MODEL: &str = "gpt-4.1-mini";
pub const DEFAULT_TEMPERATURE: f32 = 0.4;
pub const DEFAULT_TEMPERATURE_IMAGE_PROMPTS: f32 = 0.5;
pub const DEFAULT_TEMPERATURE_STORY: f32 = 0.6;

const DEFAULT_IMAGE_PROMPTS_SYSTEM: &str = "Voce e um especialista em prompts para ilustracoes digitais modernas. \
Retorne APENAS JSON valido, sem markdown e sem explicacoes. \
Os prompts devem estar em ingles. \
Gere tres chaves: prompt_personagem, prompt_estilo_imagem e ficha_personagem. \
prompt_personagem: apenas o personagem principal, identidade visual e traços fisicos, sem cenario. \
prompt_estilo_imagem: apenas o estilo visual (tecnica, paleta, luz, atmosfera), sem personagem. \
ficha_personagem: um character bible detalhado com TODOS os personagens principais da historia, incluindo identidade visual, roupas iniciais, cores, acessorios e detalhes fisicos consistentes para cada um. \
Sempre preserve a identidade do rosto com base na imagem de referencia. \
Evite estilo infantil, chibi ou proporcoes de bebe. \
Busque um visual animado, estilizado e com toque futurista discreto quando fizer sentido. \
Inclua diretrizes de consistencia visual (paleta, textura e iluminacao).";

const DEFAULT_IMAGE_PROMPTS_USER: &str = "Historia base:
{{HISTORIA}}

Personagens e papeis:
{{REFERENCIAS_SUMMARY}}

Estilo desejado: {{ESTILO_IMAGEM}}

Formato de resposta obrigatorio:
{
  \"prompt_personagem\": \"...\",
  \"prompt_estilo_imagem\": \"...\",
  \"ficha_personagem\": \"...\"
}";

const DEFAULT_STORY_CARTOON_SYSTEM: &str = "Crie uma historia infantil curta seguindo as regras abaixo. \
Nao inclua titulo. \
A historia deve ter 3 paginas, maximo 400 caracteres por pagina. \
Linguagem simples, acolhedora e educativa em PT-BR. \
Use os personagens fornecidos e seus papeis. \
A descricao da imagem deve estar em ingles. \
Retorne APENAS JSON valido.";

const DEFAULT_STORY_CARTOON_USER: &str = "Personagens e papeis:
{{REFERENCIAS_SUMMARY}}

Estilo da historia: {{LINGUAGEM}}. Texto final obrigatoriamente em PT-BR.
Estilo da imagem: {{ESTILO_IMAGEM}}

Se houver troca de roupa, isso deve estar EXPLICITO no texto e na descricao da imagem.
Regras para o campo imagem:
- Cartoon-style illustration with clean lines, balanced lighting.
- {{CHARACTER_IDENTITY_RULE}}
- No animals or extra characters unless in story.

Formato de saida OBRIGATORIO:
{
  \"pagina1\": { \"texto\": \"...\", \"imagem\": \"...\" },
  \"pagina2\": { \"texto\": \"...\", \"imagem\": \"...\" },
  \"pagina3\": { \"texto\": \"...\", \"imagem\": \"...\" }
}

Historia base:
{{HISTORIA}}";

const DEFAULT_STORY_WITH_IMAGE_BASE_SYSTEM: &str = "Crie uma historia infantil curta seguindo as regras abaixo. \
Nao inclua titulo. \
A historia deve ter 3 paginas, maximo 400 caracteres por pagina. \
Linguagem simples, acolhedora e educativa em PT-BR. \
Use os personagens fornecidos e seus papeis. \
A descricao da imagem deve estar em ingles. \
IMPORTANTE: Cada pagina deve ter uma acao ou situacao diferente, com poses e movimentos variados dos personagens conectados a narrativa. Evite poses repetitivas ou genericas como 'caminhando de maos dadas' em todas as paginas. \
Retorne APENAS JSON valido.";

const DEFAULT_STORY_WITH_IMAGE_BASE_USER: &str = "Personagens e papeis:
{{REFERENCIAS_SUMMARY}}

Estilo da historia: {{LINGUAGEM}}. Texto final obrigatoriamente em PT-BR.
Estilo da imagem (use como guia):
{{PROMPT_ESTILO_IMAGEM}}
{{FICHA_PERSONAGEM}}

Se houver troca de roupa, isso deve estar EXPLICITO no texto e na descricao da imagem.
Regras para o campo imagem:
- {{IMAGE_REGISTER}}
- {{CHARACTER_IDENTITY_RULE}}
- No animals or extra characters unless in story.
- CRITICAL: Each page must show characters in DIFFERENT, DYNAMIC poses connected to the story action. Avoid static or repetitive poses like 'walking hand-in-hand' across multiple pages. Describe specific actions, movements, gestures, and body positions that match the narrative of each page.

Formato de saida OBRIGATORIO:
{
  \"pagina1\": { \"texto\": \"...\", \"imagem(em ingles)\": \"...\" },
  \"pagina2\": { \"texto\": \"...\", \"imagem(em ingles)\": \"...\" },
  \"pagina3\": { \"texto\": \"...\", \"imagem(em ingles)\": \"...\" }
}

Historia base:
{{HISTORIA}}";

const DEFAULT_CHARACTER_IDENTITY_RULE: &str = "Preserve the exact facial identity from the reference image (face shape, eyes, nose, mouth, eyebrows, hair, skin tone). \
Keep the same apparent age and proportions. \
Keep hairstyle, eye color, skin tone, and facial features consistent across all pages. \
Maintain the same outfit, color palette, and signature accessories in every scene unless the story explicitly says the character changed clothes or context. \
Full body visible in frame, no cropping. \
No text, watermark, logo, or borders. \
Illustration only, not photo or hyper-realism.";

/// Resolved prompt templates; every field is populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplateSet {
    pub image_prompts_system: String,
    pub image_prompts_user: String,
    pub story_cartoon_system: String,
    pub story_cartoon_user: String,
    pub story_with_image_base_system: String,
    pub story_with_image_base_user: String,
    pub character_identity_rule: String,
}

impl Default for PromptTemplateSet {
    fn default() -> Self {
        Self {
            image_prompts_system: DEFAULT_IMAGE_PROMPTS_SYSTEM.to_string(),
            image_prompts_user: DEFAULT_IMAGE_PROMPTS_USER.to_string(),
            story_cartoon_system: DEFAULT_STORY_CARTOON_SYSTEM.to_string(),
            story_cartoon_user: DEFAULT_STORY_CARTOON_USER.to_string(),
            story_with_image_base_system: DEFAULT_STORY_WITH_IMAGE_BASE_SYSTEM.to_string(),
            story_with_image_base_user: DEFAULT_STORY_WITH_IMAGE_BASE_USER.to_string(),
            character_identity_rule: DEFAULT_CHARACTER_IDENTITY_RULE.to_string(),
        }
    }
}

/// Templates as stored in the profile's `ai_prompts` column. Keys may be
/// missing when the row was written by an older settings screen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPromptTemplates {
    pub image_prompts_system: Option<String>,
    pub image_prompts_user: Option<String>,
    pub story_cartoon_system: Option<String>,
    pub story_cartoon_user: Option<String>,
    pub story_with_image_base_system: Option<String>,
    pub story_with_image_base_user: Option<String>,
    pub character_identity_rule: Option<String>,
}

/// Per-user generation settings as persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredGenerationConfig {
    #[serde(default)]
    pub ai_model: Option<String>,
    #[serde(default)]
    pub ai_temperature_default: Option<f32>,
    #[serde(default)]
    pub ai_temperature_image_prompts: Option<f32>,
    #[serde(default)]
    pub ai_temperature_story: Option<f32>,
    #[serde(default)]
    pub ai_prompts: Option<StoredPromptTemplates>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub model: String,
    /// Stored fallback for stage temperatures the profile leaves unset.
    pub temperature_default: f32,
    pub temperature_image_prompts: f32,
    pub temperature_story: f32,
    pub prompts: PromptTemplateSet,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_AI_MODEL.to_string(),
            temperature_default: DEFAULT_TEMPERATURE,
            temperature_image_prompts: DEFAULT_TEMPERATURE_IMAGE_PROMPTS,
            temperature_story: DEFAULT_TEMPERATURE_STORY,
            prompts: PromptTemplateSet::default(),
        }
    }
}

fn pick(stored: Option<String>, default: String) -> String {
    match stored {
        Some(value) if !value.trim().is_empty() => value,
        _ => default,
    }
}

impl GenerationConfig {
    /// Overlays a stored row on the built-in defaults, field by field.
    /// Blank strings count as missing.
    pub fn merge(stored: StoredGenerationConfig) -> Self {
        let defaults = Self::default();
        let saved = stored.ai_prompts.unwrap_or_default();
        let d = defaults.prompts;
        // A stored general temperature stands in for missing stage temperatures.
        let stage_fallback = stored.ai_temperature_default;

        Self {
            model: pick(stored.ai_model, defaults.model),
            temperature_default: stored
                .ai_temperature_default
                .unwrap_or(defaults.temperature_default),
            temperature_image_prompts: stored
                .ai_temperature_image_prompts
                .or(stage_fallback)
                .unwrap_or(defaults.temperature_image_prompts),
            temperature_story: stored
                .ai_temperature_story
                .or(stage_fallback)
                .unwrap_or(defaults.temperature_story),
            prompts: PromptTemplateSet {
                image_prompts_system: pick(saved.image_prompts_system, d.image_prompts_system),
                image_prompts_user: pick(saved.image_prompts_user, d.image_prompts_user),
                story_cartoon_system: pick(saved.story_cartoon_system, d.story_cartoon_system),
                story_cartoon_user: pick(saved.story_cartoon_user, d.story_cartoon_user),
                story_with_image_base_system: pick(
                    saved.story_with_image_base_system,
                    d.story_with_image_base_system,
                ),
                story_with_image_base_user: pick(
                    saved.story_with_image_base_user,
                    d.story_with_image_base_user,
                ),
                character_identity_rule: pick(
                    saved.character_identity_rule,
                    d.character_identity_rule,
                ),
            },
        }
    }

    /// Full row, every key present, as written back by the settings screen.
    pub fn to_stored(&self) -> StoredGenerationConfig {
        let p = &self.prompts;
        StoredGenerationConfig {
            ai_model: Some(self.model.clone()),
            ai_temperature_default: Some(self.temperature_default),
            ai_temperature_image_prompts: Some(self.temperature_image_prompts),
            ai_temperature_story: Some(self.temperature_story),
            ai_prompts: Some(StoredPromptTemplates {
                image_prompts_system: Some(p.image_prompts_system.clone()),
                image_prompts_user: Some(p.image_prompts_user.clone()),
                story_cartoon_system: Some(p.story_cartoon_system.clone()),
                story_cartoon_user: Some(p.story_cartoon_user.clone()),
                story_with_image_base_system: Some(p.story_with_image_base_system.clone()),
                story_with_image_base_user: Some(p.story_with_image_base_user.clone()),
                character_identity_rule: Some(p.character_identity_rule.clone()),
            }),
        }
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// `Ok(None)` when the user has no stored row.
    async fn read_config(&self, user_id: &str) -> Result<Option<StoredGenerationConfig>>;
    async fn write_config(&self, user_id: &str, config: &StoredGenerationConfig) -> Result<()>;
}

/// Snapshot of the user's settings for one run. A missing row (or an
/// anonymous request) yields the defaults; a read failure aborts the run.
pub async fn resolve_config(
    store: &dyn ConfigStore,
    user_id: Option<&str>,
) -> Result<GenerationConfig, PipelineError> {
    let Some(user_id) = user_id else {
        debug!("No user id on request, using default generation config");
        return Ok(GenerationConfig::default());
    };

    match store.read_config(user_id).await {
        Ok(Some(stored)) => {
            info!("Loaded generation config for user {}", user_id);
            Ok(GenerationConfig::merge(stored))
        }
        Ok(None) => {
            debug!("No stored generation config for user {}, using defaults", user_id);
            Ok(GenerationConfig::default())
        }
        Err(e) => Err(PipelineError::Persistence(
            e.context(format!("Failed to read generation config for user {}", user_id)),
        )),
    }
}
