use crate::core::config::resolve_secret;
use crate::core::io::Storage;
use crate::core::state::{BookId, BookRecord, BookStatus, NewBook, PageRecord};
use crate::services::generation_config::{ConfigStore, StoredGenerationConfig};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_provider")]
    pub provider: String, // "local" or "supabase"
    #[serde(default = "default_data_folder")]
    pub data_folder: String,
    pub supabase: Option<SupabaseConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_storage_provider(),
            data_folder: default_data_folder(),
            supabase: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SupabaseConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: String,
}

fn default_storage_provider() -> String {
    "local".to_string()
}

fn default_data_folder() -> String {
    "data".to_string()
}

impl StorageConfig {
    pub fn missing_credentials(&self) -> Vec<String> {
        match self.provider.as_str() {
            "local" => vec![],
            "supabase" => {
                let mut missing = Vec::new();
                let url = self.supabase.as_ref().map(|s| s.url.as_str()).unwrap_or("");
                if url.trim().is_empty() {
                    missing.push("storage.supabase.url".to_string());
                }
                let key = self.supabase.as_ref().map(|s| s.api_key.as_str()).unwrap_or("");
                if resolve_secret(key, "SUPABASE_KEY").is_none() {
                    missing.push("storage.supabase.api_key (SUPABASE_KEY)".to_string());
                }
                missing
            }
            other => vec![format!("storage.provider (unknown provider '{}')", other)],
        }
    }
}

/// Book and page persistence.
#[async_trait]
pub trait BookStore: Send + Sync {
    async fn create_book(&self, book: &NewBook) -> Result<BookId>;
    async fn create_page(&self, book_id: BookId, text: &str, image_url: &str) -> Result<()>;
    async fn update_book_status(&self, book_id: BookId, status: BookStatus) -> Result<()>;
    /// Pages come back in creation order.
    async fn get_book(&self, book_id: BookId) -> Result<Option<BookRecord>>;
    /// Removes the pages, then the book.
    async fn delete_book(&self, book_id: BookId) -> Result<()>;
}

/// One back-end serving both stores.
#[derive(Clone)]
pub struct Stores {
    pub books: Arc<dyn BookStore>,
    pub configs: Arc<dyn ConfigStore>,
}

pub fn create_stores(config: &StorageConfig, storage: Arc<dyn Storage>) -> Result<Stores> {
    match config.provider.as_str() {
        "local" => {
            let store = Arc::new(LocalStore::new(storage, &config.data_folder));
            Ok(Stores {
                books: store.clone(),
                configs: store,
            })
        }
        "supabase" => {
            let cfg = config
                .supabase
                .as_ref()
                .ok_or_else(|| anyhow!("storage.supabase section is missing"))?;
            let api_key = resolve_secret(&cfg.api_key, "SUPABASE_KEY")
                .ok_or_else(|| anyhow!("Supabase api key is not configured"))?;
            let store = Arc::new(SupabaseStore::new(&cfg.url, &api_key));
            Ok(Stores {
                books: store.clone(),
                configs: store,
            })
        }
        other => Err(anyhow!("Unknown storage provider: {}", other)),
    }
}

fn status_from_label(label: Option<&str>) -> BookStatus {
    match label {
        Some(s) if s == BookStatus::Finalized.as_str() => BookStatus::Finalized,
        _ => BookStatus::InProgress,
    }
}

// --- Local JSON files ---

/// Books as `{root}/books/{id}.json` (pages embedded), profiles as
/// `{root}/profiles/{user_id}.json`.
pub struct LocalStore {
    storage: Arc<dyn Storage>,
    root: String,
    // Serializes id allocation and read-modify-write of book files.
    write_lock: Mutex<()>,
}

impl LocalStore {
    pub fn new(storage: Arc<dyn Storage>, root: &str) -> Self {
        Self {
            storage,
            root: root.trim_end_matches('/').to_string(),
            write_lock: Mutex::new(()),
        }
    }

    fn books_dir(&self) -> String {
        format!("{}/books", self.root)
    }

    fn book_path(&self, book_id: BookId) -> String {
        format!("{}/{}.json", self.books_dir(), book_id)
    }

    fn profile_path(&self, user_id: &str) -> Result<String> {
        let valid = !user_id.is_empty()
            && user_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            bail!("Invalid user id: {:?}", user_id);
        }
        Ok(format!("{}/profiles/{}.json", self.root, user_id))
    }

    fn counter_path(&self) -> String {
        format!("{}/last_book_id", self.root)
    }

    /// Ids are never reused, even after the newest book is deleted.
    async fn next_id(&self) -> Result<BookId> {
        let counter_path = self.counter_path();
        let last_issued = if self.storage.exists(&counter_path).await? {
            let bytes = self.storage.read(&counter_path).await?;
            String::from_utf8(bytes)?
                .trim()
                .parse::<BookId>()
                .with_context(|| format!("Corrupt id counter {}", counter_path))?
        } else {
            0
        };
        let entries = self.storage.list(&self.books_dir()).await?;
        let max_existing = entries
            .iter()
            .filter_map(|p| Path::new(p).file_stem()?.to_str()?.parse::<BookId>().ok())
            .max()
            .unwrap_or(0);

        let id = last_issued.max(max_existing) + 1;
        self.storage
            .write(&counter_path, id.to_string().as_bytes())
            .await?;
        Ok(id)
    }

    async fn load(&self, book_id: BookId) -> Result<Option<BookRecord>> {
        let path = self.book_path(book_id);
        if !self.storage.exists(&path).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(&path).await?;
        let record = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", path))?;
        Ok(Some(record))
    }

    async fn save(&self, record: &BookRecord) -> Result<()> {
        let content = serde_json::to_vec_pretty(record)?;
        self.storage.write(&self.book_path(record.id), &content).await
    }

    async fn modify<F>(&self, book_id: BookId, f: F) -> Result<()>
    where
        F: FnOnce(&mut BookRecord) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .load(book_id)
            .await?
            .ok_or_else(|| anyhow!("Book {} not found", book_id))?;
        f(&mut record);
        self.save(&record).await
    }
}

#[async_trait]
impl BookStore for LocalStore {
    async fn create_book(&self, book: &NewBook) -> Result<BookId> {
        let _guard = self.write_lock.lock().await;
        let id = self.next_id().await?;
        let record = BookRecord {
            id,
            created_at: Utc::now(),
            book: book.clone(),
            pages: Vec::new(),
        };
        self.save(&record).await?;
        debug!("Created local book {}", id);
        Ok(id)
    }

    async fn create_page(&self, book_id: BookId, text: &str, image_url: &str) -> Result<()> {
        let page = PageRecord {
            text: text.to_string(),
            image_url: image_url.to_string(),
        };
        self.modify(book_id, move |record| record.pages.push(page)).await
    }

    async fn update_book_status(&self, book_id: BookId, status: BookStatus) -> Result<()> {
        self.modify(book_id, move |record| record.book.status = status).await
    }

    async fn get_book(&self, book_id: BookId) -> Result<Option<BookRecord>> {
        self.load(book_id).await
    }

    async fn delete_book(&self, book_id: BookId) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.storage.delete(&self.book_path(book_id)).await
    }
}

#[async_trait]
impl ConfigStore for LocalStore {
    async fn read_config(&self, user_id: &str) -> Result<Option<StoredGenerationConfig>> {
        let path = self.profile_path(user_id)?;
        if !self.storage.exists(&path).await? {
            return Ok(None);
        }
        let bytes = self.storage.read(&path).await?;
        let stored = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse {}", path))?;
        Ok(Some(stored))
    }

    async fn write_config(&self, user_id: &str, config: &StoredGenerationConfig) -> Result<()> {
        let path = self.profile_path(user_id)?;
        let content = serde_json::to_vec_pretty(config)?;
        self.storage.write(&path, &content).await
    }
}

// --- Supabase REST ---

#[derive(Debug, Serialize, Deserialize)]
struct BookRow {
    #[serde(default, skip_serializing)]
    id: Option<BookId>,
    #[serde(default, skip_serializing)]
    created_at: Option<DateTime<Utc>>,
    titulo: Option<String>,
    categoria_livro: Option<String>,
    estilo_das_imagens: Option<String>,
    lingaguem_livro: Option<String>,
    status: Option<String>,
    publico_alvo: Option<String>,
    historia_livro: Option<String>,
    is_public: Option<bool>,
    user_id: Option<String>,
    imagens_referencia: Option<String>,
}

impl From<&NewBook> for BookRow {
    fn from(book: &NewBook) -> Self {
        Self {
            id: None,
            created_at: None,
            titulo: Some(book.title.clone()),
            categoria_livro: Some(book.category.clone()),
            estilo_das_imagens: Some(book.style.clone()),
            lingaguem_livro: Some(book.language.clone()),
            status: Some(book.status.as_str().to_string()),
            publico_alvo: Some(book.audience.clone()),
            historia_livro: Some(book.story.clone()),
            is_public: Some(book.is_public),
            user_id: book.user_id.clone(),
            imagens_referencia: Some(book.reference_image_url.clone()),
        }
    }
}

impl BookRow {
    fn into_record(self, pages: Vec<PageRecord>) -> Result<BookRecord> {
        Ok(BookRecord {
            id: self.id.ok_or_else(|| anyhow!("Book row without id"))?,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            book: NewBook {
                title: self.titulo.unwrap_or_default(),
                category: self.categoria_livro.unwrap_or_default(),
                audience: self.publico_alvo.unwrap_or_default(),
                language: self.lingaguem_livro.unwrap_or_default(),
                style: self.estilo_das_imagens.unwrap_or_default(),
                story: self.historia_livro.unwrap_or_default(),
                is_public: self.is_public.unwrap_or(false),
                user_id: self.user_id,
                reference_image_url: self.imagens_referencia.unwrap_or_default(),
                status: status_from_label(self.status.as_deref()),
            },
            pages,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PageRow {
    book_id: BookId,
    story_description: Option<String>,
    cover_image_url: Option<String>,
}

impl From<PageRow> for PageRecord {
    fn from(row: PageRow) -> Self {
        Self {
            text: row.story_description.unwrap_or_default(),
            image_url: row.cover_image_url.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: BookId,
}

fn encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

const PROFILE_COLUMNS: &str =
    "ai_model,ai_temperature_default,ai_temperature_image_prompts,ai_temperature_story,ai_prompts";

pub struct SupabaseStore {
    rest_url: String,
    api_key: String,
    client: Client,
}

impl SupabaseStore {
    pub fn new(project_url: &str, api_key: &str) -> Self {
        Self {
            rest_url: format!("{}/rest/v1", project_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            client: Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, format!("{}/{}", self.rest_url, path))
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let resp = builder
            .send()
            .await
            .with_context(|| format!("Failed to reach Supabase ({})", what))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            bail!("Supabase {} failed ({}): {}", what, status, error_text);
        }
        Ok(resp)
    }
}

#[async_trait]
impl BookStore for SupabaseStore {
    async fn create_book(&self, book: &NewBook) -> Result<BookId> {
        let builder = self
            .request(reqwest::Method::POST, "books?select=id")
            .header("Prefer", "return=representation")
            .json(&BookRow::from(book));
        let rows: Vec<IdRow> = self
            .send(builder, "insert book")
            .await?
            .json()
            .await
            .context("Failed to parse inserted book")?;
        rows.first()
            .map(|row| row.id)
            .ok_or_else(|| anyhow!("Supabase returned no id for the new book"))
    }

    async fn create_page(&self, book_id: BookId, text: &str, image_url: &str) -> Result<()> {
        let row = PageRow {
            book_id,
            story_description: Some(text.to_string()),
            cover_image_url: Some(image_url.to_string()),
        };
        let builder = self.request(reqwest::Method::POST, "pages_livro").json(&row);
        self.send(builder, "insert page").await?;
        Ok(())
    }

    async fn update_book_status(&self, book_id: BookId, status: BookStatus) -> Result<()> {
        let builder = self
            .request(reqwest::Method::PATCH, &format!("books?id=eq.{}", book_id))
            .json(&serde_json::json!({ "status": status.as_str() }));
        self.send(builder, "update book status").await?;
        Ok(())
    }

    async fn get_book(&self, book_id: BookId) -> Result<Option<BookRecord>> {
        let builder = self.request(
            reqwest::Method::GET,
            &format!("books?id=eq.{}&select=*", book_id),
        );
        let mut books: Vec<BookRow> = self
            .send(builder, "select book")
            .await?
            .json()
            .await
            .context("Failed to parse book")?;
        let Some(book) = books.pop() else {
            return Ok(None);
        };

        let builder = self.request(
            reqwest::Method::GET,
            &format!("pages_livro?book_id=eq.{}&select=*&order=id.asc", book_id),
        );
        let pages: Vec<PageRow> = self
            .send(builder, "select pages")
            .await?
            .json()
            .await
            .context("Failed to parse pages")?;

        book.into_record(pages.into_iter().map(PageRecord::from).collect())
            .map(Some)
    }

    async fn delete_book(&self, book_id: BookId) -> Result<()> {
        let pages = self.request(
            reqwest::Method::DELETE,
            &format!("pages_livro?book_id=eq.{}", book_id),
        );
        self.send(pages, "delete pages").await?;
        let book = self.request(reqwest::Method::DELETE, &format!("books?id=eq.{}", book_id));
        self.send(book, "delete book").await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for SupabaseStore {
    async fn read_config(&self, user_id: &str) -> Result<Option<StoredGenerationConfig>> {
        let builder = self.request(
            reqwest::Method::GET,
            &format!("profiles?id=eq.{}&select={}", encode(user_id), PROFILE_COLUMNS),
        );
        let mut rows: Vec<StoredGenerationConfig> = self
            .send(builder, "select profile")
            .await?
            .json()
            .await
            .context("Failed to parse profile")?;
        Ok(rows.pop())
    }

    async fn write_config(&self, user_id: &str, config: &StoredGenerationConfig) -> Result<()> {
        let builder = self
            .request(
                reqwest::Method::PATCH,
                &format!("profiles?id=eq.{}", encode(user_id)),
            )
            .json(config);
        self.send(builder, "update profile").await?;
        Ok(())
    }
}
