//! Photo-to-poetry backend: upload an image, caption it with an external
//! generator, and turn captions into poems with another.

pub mod cache;
pub mod config;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod routes;
pub mod store;

use std::sync::Arc;

use crate::cache::CaptionCache;
use crate::config::Config;
use crate::generator::ProcessGenerator;
use crate::pipeline::Pipeline;
use crate::routes::AppState;
use crate::store::ArtifactStore;

/// Wire the process-backed pipeline described by `config`.
pub fn build_state(config: &Config) -> Arc<AppState> {
    let generator = ProcessGenerator::new(
        config.caption_command.clone(),
        config.poem_command.clone(),
        config.generator_timeout,
        config.max_concurrent_generations,
    );
    let pipeline = Pipeline::new(
        ArtifactStore::new(&config.uploads_dir),
        Arc::new(CaptionCache::new()),
        Arc::new(generator),
        config.public_base_url.clone(),
    );
    Arc::new(AppState { pipeline })
}
