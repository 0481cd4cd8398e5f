/// RCA backends, the response contract and prompt construction
pub mod backends;
pub mod contract;
pub mod prompt;

pub use backends::{MockBackend, OllamaBackend, OpenAIBackend, RcaBackend};
pub use contract::{parse_rca_result, rca_schema, CandidateAction, RcaResult};
pub use prompt::build_rca_prompt;

use crate::config::BackendConfig;
use crate::error::AnalysisError;
use log::info;
use std::sync::Arc;

/// Instantiate the configured backend
pub fn create_backend(config: &BackendConfig) -> Result<Arc<dyn RcaBackend>, AnalysisError> {
    let backend: Arc<dyn RcaBackend> = match config {
        BackendConfig::Mock => Arc::new(MockBackend::canned()),
        BackendConfig::OpenAI {
            api_key,
            model,
            base_url,
        } => Arc::new(OpenAIBackend::with_base_url(
            api_key.clone(),
            model.clone(),
            base_url.clone(),
        )?),
        BackendConfig::Ollama { endpoint, model } => {
            Arc::new(OllamaBackend::new(endpoint.clone(), model.clone())?)
        }
    };
    info!("Using {} RCA backend", backend.name());
    Ok(backend)
}
