use thiserror::Error;

/// Failures that abort a book-generation run.
///
/// Stores, uploaders and other external collaborators report `anyhow` errors;
/// the pipeline wraps them into `Upload` or `Persistence` so callers can match
/// on the failure kind without downcasting.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing configuration: {0}")]
    Configuration(String),

    #[error("invalid book request: {0}")]
    InvalidRequest(String),

    #[error("base image upload failed: {0:#}")]
    Upload(anyhow::Error),

    #[error("{service} returned an error: {body}")]
    Upstream { service: &'static str, body: String },

    #[error("{0} returned an empty response")]
    EmptyResponse(&'static str),

    #[error("malformed model response: {0}")]
    MalformedResponse(String),

    #[error("image generation failed for request {request_id}")]
    GenerationFailed { request_id: String },

    #[error("image generation for request {request_id} timed out after {attempts} polls")]
    Timeout { request_id: String, attempts: u32 },

    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),
}

impl PipelineError {
    pub fn upstream(service: &'static str, body: impl Into<String>) -> Self {
        Self::Upstream {
            service,
            body: body.into(),
        }
    }

    pub fn transport(service: &'static str, err: reqwest::Error) -> Self {
        Self::Upstream {
            service,
            body: err.to_string(),
        }
    }
}
