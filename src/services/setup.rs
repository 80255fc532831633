use crate::core::io::Storage;
use crate::core::state::{BookCreationRequest, ReferenceImage, StyleChoice};
use anyhow::{anyhow, bail, Context, Result};
use inquire::Select;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const STYLE_OPTIONS: &[&str] = &["Cartoon", "Ilustração Digital"];

/// A book request as written by hand in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookRequestFile {
    pub title: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub audience: String,
    #[serde(default)]
    pub language: String,
    pub story: String,
    pub style: Option<String>,
    pub user_id: Option<String>,
    pub base_image_index: Option<usize>,
    #[serde(default)]
    pub references: Vec<ReferenceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub path: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub role: String,
}

impl ReferenceEntry {
    fn label(&self) -> String {
        let name = Path::new(&self.path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.clone());
        if self.description.trim().is_empty() {
            name
        } else {
            format!("{} ({})", name, self.description.trim())
        }
    }
}

impl BookRequestFile {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(content)?)
    }

    pub async fn load(path: &str, storage: &dyn Storage) -> Result<Self> {
        let bytes = storage
            .read(path)
            .await
            .with_context(|| format!("Failed to read request file {}", path))?;
        let content = String::from_utf8(bytes)?;
        Self::from_yaml(&content).with_context(|| format!("Failed to parse {}", path))
    }

    /// Reads every reference image (paths relative to `base_dir`) and
    /// builds the pipeline request.
    pub async fn into_request(
        self,
        base_dir: &Path,
        storage: &dyn Storage,
    ) -> Result<BookCreationRequest> {
        let style = self
            .style
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow!("No illustration style chosen"))?;

        let mut references = Vec::with_capacity(self.references.len());
        for entry in self.references {
            let full_path = base_dir.join(&entry.path);
            let full_path = full_path.to_string_lossy();
            let data = storage
                .read(&full_path)
                .await
                .with_context(|| format!("Failed to read reference image {}", full_path))?;
            let file_name = Path::new(&entry.path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| entry.path.clone());
            references.push(ReferenceImage {
                file_name,
                data,
                description: entry.description,
                role: entry.role,
            });
        }

        Ok(BookCreationRequest {
            title: self.title,
            category: self.category,
            audience: self.audience,
            language: self.language,
            story: self.story,
            style: StyleChoice::from_label(style),
            references,
            base_image_index: self.base_image_index.unwrap_or(0),
            user_id: self.user_id.filter(|u| !u.trim().is_empty()),
        })
    }
}

/// Fills in the style and base image when the request file leaves them
/// open. Unattended runs take the first reference image and require a style.
pub fn run_setup(request: &mut BookRequestFile, unattended: bool) -> Result<()> {
    if request.references.is_empty() {
        bail!("The request needs at least one reference image");
    }

    if request.base_image_index.is_none() {
        if unattended || request.references.len() == 1 {
            request.base_image_index = Some(0);
        } else {
            let options: Vec<String> = request.references.iter().map(ReferenceEntry::label).collect();
            let choice = Select::new("Select the base image:", options).raw_prompt()?;
            request.base_image_index = Some(choice.index);
        }
    }

    let has_style = request.style.as_deref().is_some_and(|s| !s.trim().is_empty());
    if !has_style {
        if unattended {
            bail!("No illustration style set and running unattended");
        }
        let choice = Select::new("Select the illustration style:", STYLE_OPTIONS.to_vec()).prompt()?;
        request.style = Some(choice.to_string());
    }

    info!(
        "Base image: {}, style: {}",
        request.base_image_index.unwrap_or(0) + 1,
        request.style.as_deref().unwrap_or_default()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;
    use crate::core::state::IllustrationStyle;

    const REQUEST_YAML: &str = r#"
title: A Manhã de Ana
category: Rotina
audience: 3-5 anos
language: Divertida
story: Ana acorda e brinca no jardim.
style: Ilustração Digital
user_id: user-1
references:
  - path: images/vovo.png
    description: Vovó
  - path: images/ana.png
    description: Ana
    role: protagonista
"#;

    #[test]
    fn test_parse_request_file() {
        let request = BookRequestFile::from_yaml(REQUEST_YAML).unwrap();
        assert_eq!(request.references.len(), 2);
        assert_eq!(request.references[1].role, "protagonista");
        assert_eq!(request.references[0].role, "");
        assert!(request.base_image_index.is_none());
        assert_eq!(request.references[1].label(), "ana.png (Ana)");
    }

    #[test]
    fn test_unattended_setup_defaults_base_image() {
        let mut request = BookRequestFile::from_yaml(REQUEST_YAML).unwrap();
        run_setup(&mut request, true).unwrap();
        assert_eq!(request.base_image_index, Some(0));
    }

    #[test]
    fn test_unattended_setup_requires_style() {
        let mut request = BookRequestFile::from_yaml(REQUEST_YAML).unwrap();
        request.style = None;
        assert!(run_setup(&mut request, true).is_err());
    }

    #[test]
    fn test_setup_rejects_missing_references() {
        let mut request = BookRequestFile::from_yaml(REQUEST_YAML).unwrap();
        request.references.clear();
        assert!(run_setup(&mut request, true).is_err());
    }

    #[tokio::test]
    async fn test_into_request_reads_images_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let images = dir.path().join("images");
        std::fs::create_dir_all(&images).unwrap();
        std::fs::write(images.join("vovo.png"), [1u8, 2]).unwrap();
        std::fs::write(images.join("ana.png"), [3u8]).unwrap();
        std::fs::write(dir.path().join("book.yml"), REQUEST_YAML).unwrap();

        let storage = NativeStorage::new();
        let path = dir.path().join("book.yml");
        let mut file = BookRequestFile::load(&path.to_string_lossy(), &storage)
            .await
            .unwrap();
        file.base_image_index = Some(1);

        let request = file.into_request(dir.path(), &storage).await.unwrap();
        assert_eq!(request.style.kind, IllustrationStyle::Photorealistic);
        assert_eq!(request.references[0].data, vec![1, 2]);
        assert_eq!(request.base_image().unwrap().file_name, "ana.png");
        assert_eq!(request.user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_into_request_missing_image_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = BookRequestFile::from_yaml(REQUEST_YAML).unwrap();
        let err = file
            .into_request(dir.path(), &NativeStorage::new())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("vovo.png"));
    }
}
