use crate::core::config::{Config, PipelineOptions};
use crate::core::error::PipelineError;
use crate::core::io::Storage;
use crate::core::state::{
    BookCreationRequest, BookId, BookStatus, DerivedPromptSet, NewBook, PageDraft, PAGE_COUNT,
};
use crate::services::generation_config::{resolve_config, ConfigStore, GenerationConfig};
use crate::services::image::{create_image_client, ImageEditClient};
use crate::services::llm::{create_llm, TextCompletionClient};
use crate::services::outfit::allows_outfit_change;
use crate::services::prompt::{compose_page_prompt, identity_rule};
use crate::services::store::{create_stores, BookStore, Stores};
use crate::services::story::StoryGenerator;
use crate::services::upload::{create_uploader, ImageUploader};
use futures_util::{stream, TryStreamExt};
use log::{error, info, warn};
use std::fmt;
use std::sync::Arc;

/// Receives integer percentages, non-decreasing, ending at 100 on success.
pub type ProgressCallback<'a> = Option<&'a (dyn Fn(u8) + Send + Sync)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedBook {
    pub book_id: BookId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Validate,
    ResolveConfig,
    Upload,
    CreateBook,
    DerivePrompts,
    Story,
    PageImage(usize),
    PageSave(usize),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Validate => write!(f, "request validation"),
            Stage::ResolveConfig => write!(f, "configuration"),
            Stage::Upload => write!(f, "base image upload"),
            Stage::CreateBook => write!(f, "book creation"),
            Stage::DerivePrompts => write!(f, "style derivation"),
            Stage::Story => write!(f, "story generation"),
            Stage::PageImage(n) => write!(f, "page {} illustration", n),
            Stage::PageSave(n) => write!(f, "page {} save", n),
        }
    }
}

fn abort(stage: Stage, err: PipelineError) -> PipelineError {
    error!("Book generation aborted during {}: {}", stage, err);
    err
}

/// 72, 83, 95 for pages 1..3.
fn page_progress(index: usize) -> u8 {
    let share = (index + 1) as f32 / PAGE_COUNT as f32 * 35.0;
    60 + share.round() as u8
}

pub struct BookPipeline {
    llm: Box<dyn TextCompletionClient>,
    images: Box<dyn ImageEditClient>,
    uploader: Box<dyn ImageUploader>,
    books: Arc<dyn BookStore>,
    configs: Arc<dyn ConfigStore>,
    options: PipelineOptions,
}

impl BookPipeline {
    pub fn new(
        llm: Box<dyn TextCompletionClient>,
        images: Box<dyn ImageEditClient>,
        uploader: Box<dyn ImageUploader>,
        stores: Stores,
        options: PipelineOptions,
    ) -> Self {
        Self {
            llm,
            images,
            uploader,
            books: stores.books,
            configs: stores.configs,
            options,
        }
    }

    /// Builds every collaborator from the application config. All missing
    /// credentials are reported together, before any network call.
    pub fn from_config(config: &Config, storage: Arc<dyn Storage>) -> Result<Self, PipelineError> {
        let missing = config.missing_credentials();
        if !missing.is_empty() {
            return Err(PipelineError::Configuration(missing.join(", ")));
        }

        let llm = create_llm(&config.llm)?;
        let images = create_image_client(&config.image)?;
        let uploader = create_uploader(&config.upload)
            .map_err(|e| PipelineError::Configuration(format!("{:#}", e)))?;
        let stores = create_stores(&config.storage, storage)
            .map_err(|e| PipelineError::Configuration(format!("{:#}", e)))?;

        Ok(Self::new(llm, images, uploader, stores, config.pipeline.clone()))
    }

    pub fn books(&self) -> Arc<dyn BookStore> {
        self.books.clone()
    }

    /// Runs one book end to end: upload, book row, optional style
    /// derivation, story, three chained page illustrations, finalize.
    pub async fn create_book_with_ai(
        &self,
        request: &BookCreationRequest,
        on_progress: ProgressCallback<'_>,
    ) -> Result<CreatedBook, PipelineError> {
        let report = |percent: u8| {
            if let Some(callback) = on_progress {
                callback(percent);
            }
        };
        report(5);

        let base = request
            .base_image()
            .map_err(|e| abort(Stage::Validate, e))?;
        let config = resolve_config(self.configs.as_ref(), request.user_id.as_deref())
            .await
            .map_err(|e| abort(Stage::ResolveConfig, e))?;

        info!("Uploading base image {}", base.file_name);
        let base_url = self
            .uploader
            .upload(&base.file_name, &base.data)
            .await
            .map_err(|e| abort(Stage::Upload, PipelineError::Upload(e)))?;
        report(15);

        info!("Creating book \"{}\"", request.title);
        let book_id = self
            .books
            .create_book(&NewBook::from_request(request, &base_url))
            .await
            .map_err(|e| {
                abort(
                    Stage::CreateBook,
                    PipelineError::Persistence(e.context("Failed to create book")),
                )
            })?;
        report(20);

        if let Err(e) = self
            .fill_book(book_id, request, &config, &base_url, &report)
            .await
        {
            if self.options.cleanup_on_failure {
                self.discard(book_id).await;
            }
            return Err(e);
        }

        self.finalize(book_id).await;
        report(100);
        info!("Book {} finalized", book_id);
        Ok(CreatedBook { book_id })
    }

    async fn fill_book(
        &self,
        book_id: BookId,
        request: &BookCreationRequest,
        config: &GenerationConfig,
        base_url: &str,
        report: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<(), PipelineError> {
        let generator = StoryGenerator::new(self.llm.as_ref(), config);

        let derived = if request.style.kind.requires_style_derivation() {
            Some(
                generator
                    .derive_prompts(request)
                    .await
                    .map_err(|e| abort(Stage::DerivePrompts, e))?,
            )
        } else {
            None
        };
        report(35);

        let story = generator
            .generate_story(request, derived.as_ref())
            .await
            .map_err(|e| abort(Stage::Story, e))?;
        report(50);

        let rule = identity_rule(config);
        let derived = derived.as_ref();
        stream::iter(story.pages.iter().enumerate().map(Ok::<_, PipelineError>))
            .try_fold(base_url.to_string(), |previous, (index, page)| async move {
                let image_url = self
                    .render_page(book_id, index + 1, page, &previous, derived, rule)
                    .await?;
                report(page_progress(index));
                Ok::<_, PipelineError>(image_url)
            })
            .await?;
        Ok(())
    }

    /// Illustrates one page from the previous page's image and saves it.
    /// Returns the new image URL, which becomes the next page's base.
    async fn render_page(
        &self,
        book_id: BookId,
        page_number: usize,
        page: &PageDraft,
        base_image_url: &str,
        derived: Option<&DerivedPromptSet>,
        rule: &str,
    ) -> Result<String, PipelineError> {
        let outfit_change = allows_outfit_change(&page.text, &page.image_description);
        let prompt = compose_page_prompt(&page.image_description, derived, rule, outfit_change);

        info!("Illustrating page {}/{}", page_number, PAGE_COUNT);
        let image_url = self
            .images
            .generate_image(&prompt, base_image_url)
            .await
            .map_err(|e| abort(Stage::PageImage(page_number), e))?;

        self.books
            .create_page(book_id, &page.text, &image_url)
            .await
            .map_err(|e| {
                abort(
                    Stage::PageSave(page_number),
                    PipelineError::Persistence(
                        e.context(format!("Failed to save page {}", page_number)),
                    ),
                )
            })?;
        Ok(image_url)
    }

    async fn finalize(&self, book_id: BookId) {
        if let Err(e) = self
            .books
            .update_book_status(book_id, BookStatus::Finalized)
            .await
        {
            warn!("Failed to mark book {} as finalized: {:#}", book_id, e);
        }
    }

    async fn discard(&self, book_id: BookId) {
        info!("Removing partially created book {}", book_id);
        if let Err(e) = self.books.delete_book(book_id).await {
            warn!("Failed to remove book {}: {:#}", book_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::state::{BookRecord, ReferenceImage, StyleChoice};
    use crate::services::generation_config::StoredGenerationConfig;
    use crate::services::llm::Completion;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    const STORY_JSON: &str = r#"```json
    {
      "pagina1": { "texto": "Ana acordou cedo.", "imagem(em ingles)": "Ana stretching in bed" },
      "pagina2": { "texto": "Ana vestiu o pijama de novo.", "imagem(em ingles)": "Ana in pajamas" },
      "pagina3": { "texto": "E dormiu feliz.", "imagem(em ingles)": "" }
    }
    ```"#;

    const DERIVED_JSON: &str = r#"{
        "prompt_personagem": "girl, red curls",
        "prompt_estilo_imagem": "soft painterly light",
        "ficha_personagem": "Ana: yellow raincoat"
    }"#;

    #[derive(Debug, Default)]
    struct FakeLlm {
        responses: Mutex<Vec<String>>,
        temperatures: Arc<Mutex<Vec<f32>>>,
    }

    impl FakeLlm {
        fn new(responses: &[&str]) -> Self {
            Self {
                responses: Mutex::new(responses.iter().rev().map(|s| s.to_string()).collect()),
                temperatures: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl TextCompletionClient for FakeLlm {
        async fn complete(&self, request: &Completion<'_>) -> Result<String, PipelineError> {
            self.temperatures.lock().unwrap().push(request.temperature);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or(PipelineError::EmptyResponse("fake"))
        }
    }

    #[derive(Default)]
    struct FakeImages {
        calls: Arc<Mutex<Vec<(String, String)>>>,
        fail_on_call: Option<usize>,
    }

    #[async_trait]
    impl ImageEditClient for FakeImages {
        async fn generate_image(
            &self,
            prompt: &str,
            base_image_url: &str,
        ) -> Result<String, PipelineError> {
            let mut calls = self.calls.lock().unwrap();
            calls.push((prompt.to_string(), base_image_url.to_string()));
            let n = calls.len();
            if self.fail_on_call == Some(n) {
                return Err(PipelineError::GenerationFailed {
                    request_id: format!("req-{}", n),
                });
            }
            Ok(format!("https://gen/page{}.png", n))
        }
    }

    #[derive(Default)]
    struct FakeUploader {
        fail: bool,
    }

    #[async_trait]
    impl ImageUploader for FakeUploader {
        async fn upload(&self, _file_name: &str, _data: &[u8]) -> anyhow::Result<String> {
            if self.fail {
                return Err(anyhow!("Upload failed (400 Bad Request): invalid key"));
            }
            Ok("https://host/base.png".to_string())
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        books: Mutex<Vec<NewBook>>,
        pages: Mutex<Vec<(BookId, String, String)>>,
        statuses: Mutex<Vec<(BookId, BookStatus)>>,
        deleted: Mutex<Vec<BookId>>,
        fail_status: bool,
    }

    #[async_trait]
    impl BookStore for MemoryStore {
        async fn create_book(&self, book: &NewBook) -> anyhow::Result<BookId> {
            let mut books = self.books.lock().unwrap();
            books.push(book.clone());
            Ok(books.len() as BookId)
        }

        async fn create_page(
            &self,
            book_id: BookId,
            text: &str,
            image_url: &str,
        ) -> anyhow::Result<()> {
            self.pages
                .lock()
                .unwrap()
                .push((book_id, text.to_string(), image_url.to_string()));
            Ok(())
        }

        async fn update_book_status(
            &self,
            book_id: BookId,
            status: BookStatus,
        ) -> anyhow::Result<()> {
            if self.fail_status {
                return Err(anyhow!("connection reset"));
            }
            self.statuses.lock().unwrap().push((book_id, status));
            Ok(())
        }

        async fn get_book(&self, _book_id: BookId) -> anyhow::Result<Option<BookRecord>> {
            Ok(None)
        }

        async fn delete_book(&self, book_id: BookId) -> anyhow::Result<()> {
            self.deleted.lock().unwrap().push(book_id);
            Ok(())
        }
    }

    #[async_trait]
    impl ConfigStore for MemoryStore {
        async fn read_config(
            &self,
            _user_id: &str,
        ) -> anyhow::Result<Option<StoredGenerationConfig>> {
            Ok(None)
        }

        async fn write_config(
            &self,
            _user_id: &str,
            _config: &StoredGenerationConfig,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct Harness {
        pipeline: BookPipeline,
        store: Arc<MemoryStore>,
        image_calls: Arc<Mutex<Vec<(String, String)>>>,
        temperatures: Arc<Mutex<Vec<f32>>>,
    }

    fn harness(
        llm: FakeLlm,
        images: FakeImages,
        uploader: FakeUploader,
        store: MemoryStore,
        cleanup_on_failure: bool,
    ) -> Harness {
        let store = Arc::new(store);
        let image_calls = images.calls.clone();
        let temperatures = llm.temperatures.clone();
        let pipeline = BookPipeline::new(
            Box::new(llm),
            Box::new(images),
            Box::new(uploader),
            Stores {
                books: store.clone(),
                configs: store.clone(),
            },
            PipelineOptions { cleanup_on_failure },
        );
        Harness {
            pipeline,
            store,
            image_calls,
            temperatures,
        }
    }

    fn request(style: &str) -> BookCreationRequest {
        BookCreationRequest {
            title: "A Manhã de Ana".to_string(),
            category: "Rotina".to_string(),
            audience: "3-5 anos".to_string(),
            language: "Divertida".to_string(),
            story: "Ana acorda e brinca.".to_string(),
            style: StyleChoice::from_label(style),
            references: vec![
                ReferenceImage {
                    file_name: "vovo.png".to_string(),
                    data: vec![1],
                    description: "Vovó".to_string(),
                    role: String::new(),
                },
                ReferenceImage {
                    file_name: "ana.png".to_string(),
                    data: vec![2],
                    description: "Ana".to_string(),
                    role: "protagonista".to_string(),
                },
            ],
            base_image_index: 1,
            user_id: Some("user-1".to_string()),
        }
    }

    async fn run(h: &Harness, req: &BookCreationRequest) -> (Result<CreatedBook, PipelineError>, Vec<u8>) {
        let progress = Mutex::new(Vec::new());
        let record = |p: u8| progress.lock().unwrap().push(p);
        let result = h.pipeline.create_book_with_ai(req, Some(&record)).await;
        (result, progress.into_inner().unwrap())
    }

    #[test]
    fn test_page_progress_values() {
        assert_eq!(
            (0..PAGE_COUNT).map(page_progress).collect::<Vec<_>>(),
            vec![72, 83, 95]
        );
    }

    #[tokio::test]
    async fn test_cartoon_run_chains_pages_in_order() {
        let h = harness(
            FakeLlm::new(&[STORY_JSON]),
            FakeImages::default(),
            FakeUploader::default(),
            MemoryStore::default(),
            false,
        );

        let (result, progress) = run(&h, &request("Cartoon")).await;
        assert_eq!(result.unwrap(), CreatedBook { book_id: 1 });
        assert_eq!(progress, vec![5, 15, 20, 35, 50, 72, 83, 95, 100]);

        // Only the story call; cartoon books skip style derivation.
        assert_eq!(*h.temperatures.lock().unwrap(), vec![0.6]);

        let calls = h.image_calls.lock().unwrap();
        let bases: Vec<&str> = calls.iter().map(|(_, base)| base.as_str()).collect();
        assert_eq!(
            bases,
            ["https://host/base.png", "https://gen/page1.png", "https://gen/page2.png"]
        );
        assert!(calls[0].0.starts_with("Ana stretching in bed\n"));
        assert!(calls[1].0.contains("Allow outfit change only as explicitly described"));
        assert!(calls[2].0.contains("Do not change clothing across pages"));
        assert!(!calls[0].0.contains("Character bible"));

        let pages = h.store.pages.lock().unwrap();
        let saved: Vec<(&str, &str)> = pages
            .iter()
            .map(|(_, text, url)| (text.as_str(), url.as_str()))
            .collect();
        assert_eq!(
            saved,
            [
                ("Ana acordou cedo.", "https://gen/page1.png"),
                ("Ana vestiu o pijama de novo.", "https://gen/page2.png"),
                ("E dormiu feliz.", "https://gen/page3.png"),
            ]
        );

        let books = h.store.books.lock().unwrap();
        assert_eq!(books[0].reference_image_url, "https://host/base.png");
        assert_eq!(books[0].status, BookStatus::InProgress);
        assert_eq!(
            *h.store.statuses.lock().unwrap(),
            vec![(1, BookStatus::Finalized)]
        );
    }

    #[tokio::test]
    async fn test_non_cartoon_run_derives_prompts_first() {
        let h = harness(
            FakeLlm::new(&[DERIVED_JSON, STORY_JSON]),
            FakeImages::default(),
            FakeUploader::default(),
            MemoryStore::default(),
            false,
        );

        let (result, _) = run(&h, &request("Ilustração Digital")).await;
        assert!(result.is_ok());
        assert_eq!(*h.temperatures.lock().unwrap(), vec![0.5, 0.6]);

        let calls = h.image_calls.lock().unwrap();
        assert!(calls
            .iter()
            .all(|(prompt, _)| prompt.contains("Character bible (follow exactly): Ana: yellow raincoat")));
    }

    #[tokio::test]
    async fn test_page_two_failure_leaves_book_in_progress() {
        let h = harness(
            FakeLlm::new(&[STORY_JSON]),
            FakeImages {
                fail_on_call: Some(2),
                ..Default::default()
            },
            FakeUploader::default(),
            MemoryStore::default(),
            false,
        );

        let (result, progress) = run(&h, &request("Cartoon")).await;
        assert!(matches!(result, Err(PipelineError::GenerationFailed { .. })));
        assert_eq!(progress.last(), Some(&72));
        assert_eq!(h.store.pages.lock().unwrap().len(), 1);
        assert!(h.store.statuses.lock().unwrap().is_empty());
        assert!(h.store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_on_failure_removes_book() {
        let h = harness(
            FakeLlm::new(&[STORY_JSON]),
            FakeImages {
                fail_on_call: Some(3),
                ..Default::default()
            },
            FakeUploader::default(),
            MemoryStore::default(),
            true,
        );

        let (result, _) = run(&h, &request("Cartoon")).await;
        assert!(matches!(result, Err(PipelineError::GenerationFailed { .. })));
        assert_eq!(*h.store.deleted.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_upload_failure_creates_nothing() {
        let h = harness(
            FakeLlm::new(&[STORY_JSON]),
            FakeImages::default(),
            FakeUploader { fail: true },
            MemoryStore::default(),
            true,
        );

        let (result, progress) = run(&h, &request("Cartoon")).await;
        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::Upload(_)));
        assert!(err.to_string().contains("invalid key"));
        assert_eq!(progress, vec![5]);
        assert!(h.store.books.lock().unwrap().is_empty());
        assert!(h.temperatures.lock().unwrap().is_empty());
        assert!(h.store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_failure_is_not_fatal() {
        let h = harness(
            FakeLlm::new(&[STORY_JSON]),
            FakeImages::default(),
            FakeUploader::default(),
            MemoryStore {
                fail_status: true,
                ..Default::default()
            },
            false,
        );

        let (result, progress) = run(&h, &request("Cartoon")).await;
        assert_eq!(result.unwrap().book_id, 1);
        assert_eq!(progress.last(), Some(&100));
        assert_eq!(h.store.pages.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_bad_base_index_is_rejected_before_upload() {
        let h = harness(
            FakeLlm::new(&[STORY_JSON]),
            FakeImages::default(),
            FakeUploader::default(),
            MemoryStore::default(),
            false,
        );
        let mut req = request("Cartoon");
        req.base_image_index = 2;

        let (result, _) = run(&h, &req).await;
        assert!(matches!(result, Err(PipelineError::InvalidRequest(_))));
        assert!(h.store.books.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_story_aborts_after_book_creation() {
        let h = harness(
            FakeLlm::new(&["Era uma vez uma menina..."]),
            FakeImages::default(),
            FakeUploader::default(),
            MemoryStore::default(),
            false,
        );

        let (result, progress) = run(&h, &request("Cartoon")).await;
        assert!(matches!(result, Err(PipelineError::MalformedResponse(_))));
        assert_eq!(progress, vec![5, 15, 20, 35]);
        assert_eq!(h.store.books.lock().unwrap().len(), 1);
        assert!(h.image_calls.lock().unwrap().is_empty());
    }
}
