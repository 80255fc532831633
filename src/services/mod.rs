pub mod generation_config;
pub mod image;
pub mod llm;
pub mod outfit;
pub mod prompt;
pub mod setup;
pub mod store;
pub mod story;
pub mod upload;
pub mod workflow;

#[cfg(test)]
pub(crate) mod http_stub;
