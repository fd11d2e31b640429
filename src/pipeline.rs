use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::cache::CaptionCache;
use crate::error::{PipelineError, StoreError};
use crate::generator::Generator;
use crate::store::ArtifactStore;

/// Where a single upload got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Stored,
    Captioned,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Received => "received",
            Stage::Stored => "stored",
            Stage::Captioned => "captioned",
            Stage::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadOutcome {
    pub image_name: String,
    pub image_url: String,
    pub caption_url: String,
}

/// Stored image bytes plus a best-effort content type.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Upload, caption and poem flows over the store, cache and generator.
pub struct Pipeline {
    store: ArtifactStore,
    cache: Arc<CaptionCache>,
    generator: Arc<dyn Generator>,
    base_url: String,
}

impl Pipeline {
    pub fn new(
        store: ArtifactStore,
        cache: Arc<CaptionCache>,
        generator: Arc<dyn Generator>,
        base_url: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            store,
            cache,
            generator,
            base_url,
        }
    }

    pub fn cache(&self) -> &CaptionCache {
        &self.cache
    }

    /// Store the image, caption it and remember the caption.
    ///
    /// A captioning failure leaves the stored image in place.
    pub async fn upload_and_caption(&self, encoded: &str) -> Result<UploadOutcome, PipelineError> {
        tracing::debug!(stage = %Stage::Received, size = encoded.len(), "upload");
        if encoded.trim().is_empty() {
            return Err(PipelineError::Validation("Image must not be empty".to_string()));
        }

        let image_name = self.store.save(encoded).await.map_err(|e| {
            tracing::warn!(stage = %Stage::Failed, operation = "store", error = %e, "upload failed");
            match e {
                StoreError::Empty => PipelineError::Validation("Image must not be empty".to_string()),
                other => PipelineError::StoreFailed(other),
            }
        })?;
        tracing::info!(stage = %Stage::Stored, image_name = %image_name, "upload");

        // The store just produced this name, so it is always a plain file name.
        let path = self
            .store
            .path_of(&image_name)
            .ok_or_else(|| PipelineError::StoreFailed(StoreError::NotFound(image_name.clone())))?;

        let caption = match self.generator.caption(&path).await {
            Ok(caption) => caption,
            Err(source) => {
                tracing::warn!(
                    stage = %Stage::Failed,
                    operation = "caption",
                    image_name = %image_name,
                    error = %source,
                    "upload failed"
                );
                return Err(PipelineError::CaptionFailed { image_name, source });
            }
        };

        self.cache.put(image_name.clone(), caption);
        tracing::info!(stage = %Stage::Captioned, image_name = %image_name, "upload");

        Ok(UploadOutcome {
            image_url: format!("{}/image/{}", self.base_url, image_name),
            caption_url: format!("{}/caption/{}", self.base_url, image_name),
            image_name,
        })
    }

    pub async fn fetch_image(&self, image_name: &str) -> Result<StoredImage, PipelineError> {
        match self.store.load(image_name).await {
            Ok(bytes) => Ok(StoredImage {
                content_type: sniff_content_type(&bytes),
                bytes,
            }),
            Err(StoreError::NotFound(_)) => Err(PipelineError::NotFound("Image")),
            Err(e) => Err(PipelineError::StoreFailed(e)),
        }
    }

    pub fn fetch_caption(&self, image_name: &str) -> Result<String, PipelineError> {
        self.cache
            .get(image_name)
            .ok_or(PipelineError::NotFound("Caption"))
    }

    pub async fn convert_to_poem(&self, caption: &str) -> Result<String, PipelineError> {
        if caption.trim().is_empty() {
            return Err(PipelineError::Validation("Caption must not be empty".to_string()));
        }
        self.generator.poem(caption).await.map_err(|e| {
            tracing::warn!(operation = "poem", error = %e, "convert failed");
            PipelineError::ConvertFailed(e)
        })
    }
}

fn sniff_content_type(bytes: &[u8]) -> &'static str {
    use image::ImageFormat;

    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Gif) => "image/gif",
        Ok(ImageFormat::WebP) => "image/webp",
        Ok(ImageFormat::Bmp) => "image/bmp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::generator::FakeGenerator;
    use base64::{engine::general_purpose, Engine as _};

    fn pipeline(dir: &tempfile::TempDir, generator: FakeGenerator) -> Pipeline {
        Pipeline::new(
            ArtifactStore::new(dir.path().join("uploads")),
            Arc::new(CaptionCache::new()),
            Arc::new(generator),
            "http://localhost:8080/",
        )
    }

    fn encode(bytes: &[u8]) -> String {
        general_purpose::STANDARD.encode(bytes)
    }

    #[tokio::test]
    async fn upload_caches_caption_and_derives_urls() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir, FakeGenerator::new());

        let out = pipeline.upload_and_caption(&encode(b"sunset")).await.unwrap();
        assert_eq!(
            out.image_url,
            format!("http://localhost:8080/image/{}", out.image_name)
        );
        assert_eq!(
            out.caption_url,
            format!("http://localhost:8080/caption/{}", out.image_name)
        );
        assert_eq!(pipeline.fetch_caption(&out.image_name).unwrap(), "a photo of sunset");
        assert!(matches!(
            pipeline.fetch_caption("image_0_99.jpg"),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn caption_failure_keeps_image() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir, FakeGenerator::new().failing_captions());

        let err = pipeline.upload_and_caption(&encode(b"fog")).await.unwrap_err();
        let (image_name, source) = match err {
            PipelineError::CaptionFailed { image_name, source } => (image_name, source),
            other => panic!("expected CaptionFailed, got {other:?}"),
        };
        assert!(matches!(source, GenerationError::ProcessFailed { .. }));

        let image = pipeline.fetch_image(&image_name).await.unwrap();
        assert_eq!(image.bytes, b"fog");
        assert!(pipeline.cache().is_empty());
    }

    #[tokio::test]
    async fn bad_payload_is_store_failure() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir, FakeGenerator::new());

        let err = pipeline.upload_and_caption("%%%").await.unwrap_err();
        assert!(matches!(err, PipelineError::StoreFailed(StoreError::Decode(_))));
    }

    #[tokio::test]
    async fn bare_data_uri_header_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir, FakeGenerator::new());

        let err = pipeline
            .upload_and_caption("data:image/png;base64,")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert!(pipeline.cache().is_empty());
        assert!(!dir.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn fetch_image_sniffs_png() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir, FakeGenerator::new());
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0, 0, 0, 13];

        let out = pipeline.upload_and_caption(&encode(&png)).await.unwrap();
        let image = pipeline.fetch_image(&out.image_name).await.unwrap();
        assert_eq!(image.content_type, "image/png");
        assert!(matches!(
            pipeline.fetch_image("../Cargo.toml").await,
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn convert_sends_caption_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(FakeGenerator::new());
        let pipeline = Pipeline::new(
            ArtifactStore::new(dir.path()),
            Arc::new(CaptionCache::new()),
            generator.clone(),
            "http://localhost:8080",
        );

        let caption = "a \"quoted\" cat\non two lines";
        let poem = pipeline.convert_to_poem(caption).await.unwrap();
        assert!(poem.ends_with(caption));

        let sent = generator.poem_requests();
        let parsed: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(parsed["caption"], caption);
    }

    #[tokio::test]
    async fn convert_rejects_blank_and_maps_failures() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(&dir, FakeGenerator::new().failing_poems());

        assert!(matches!(
            pipeline.convert_to_poem("  ").await,
            Err(PipelineError::Validation(_))
        ));
        assert!(matches!(
            pipeline.convert_to_poem("a tree").await,
            Err(PipelineError::ConvertFailed(GenerationError::Timeout(_)))
        ));
    }
}
