use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use storybook_gen::core::config::Config;
use storybook_gen::core::io::{NativeStorage, Storage};
use storybook_gen::services::setup::{run_setup, BookRequestFile};
use storybook_gen::services::workflow::BookPipeline;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please ensure 'config.yml' exists with your provider keys.");
            return Err(e);
        }
    };

    let request_path = std::env::args().nth(1).unwrap_or_else(|| "book.yml".to_string());
    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());

    // 1. Request file + interactive choices
    let mut request_file = BookRequestFile::load(&request_path, storage.as_ref()).await?;
    run_setup(&mut request_file, config.unattended)?;

    let base_dir = Path::new(&request_path)
        .parent()
        .unwrap_or_else(|| Path::new("."));
    let request = request_file
        .into_request(base_dir, storage.as_ref())
        .await?;

    // 2. Pipeline
    let pipeline = BookPipeline::from_config(&config, storage.clone())?;

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")?
            .progress_chars("#>-"),
    );
    pb.set_message(request.title.clone());
    let on_progress = |percent: u8| pb.set_position(percent as u64);

    let created = pipeline
        .create_book_with_ai(&request, Some(&on_progress))
        .await;
    pb.finish_and_clear();
    let created = created.context("Book generation failed")?;

    // 3. Result
    let book = pipeline
        .books()
        .get_book(created.book_id)
        .await?
        .context("Created book could not be read back")?;

    println!("Book #{}: {} [{}]", book.id, book.book.title, book.book.status.as_str());
    for (i, page) in book.pages.iter().enumerate() {
        println!("\n--- Page {} ---\n{}\n{}", i + 1, page.text, page.image_url);
    }

    Ok(())
}
