use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose, Engine as _};

use crate::error::StoreError;

/// Filesystem-backed store for uploaded images.
///
/// Images are written once under `root` and never mutated. Names come from
/// the upload time plus a per-process sequence number.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    seq: AtomicU64,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            seq: AtomicU64::new(0),
        }
    }

    /// Decode a base64 image (optionally a `data:` URI) and persist it.
    ///
    /// Decoding happens before anything touches the filesystem, so a bad
    /// payload never creates a file or the uploads directory.
    pub async fn save(&self, encoded: &str) -> Result<String, StoreError> {
        let bytes = decode_payload(encoded)?;
        if bytes.is_empty() {
            return Err(StoreError::Empty);
        }

        tokio::fs::create_dir_all(&self.root).await?;

        let image_name = self.next_name();
        tokio::fs::write(self.root.join(&image_name), &bytes).await?;

        tracing::info!(image_name = %image_name, size = bytes.len(), "image saved");
        Ok(image_name)
    }

    /// Read back a stored image. Names that are not a single plain file
    /// name inside the root are reported as not found.
    pub async fn load(&self, image_name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self
            .path_of(image_name)
            .ok_or_else(|| StoreError::NotFound(image_name.to_string()))?;

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(image_name.to_string()))
            }
            Err(e) => Err(StoreError::Storage(e)),
        }
    }

    /// Location of a stored image, if the name is acceptable.
    pub fn path_of(&self, image_name: &str) -> Option<PathBuf> {
        if !is_plain_file_name(image_name) {
            return None;
        }
        Some(self.root.join(image_name))
    }

    fn next_name(&self) -> String {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("image_{secs}_{seq}.jpg")
    }
}

/// Strip an optional `<metadata>,` header and decode the rest. Line-wrapped
/// payloads are accepted.
fn decode_payload(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match encoded.split_once(',') {
        Some((_header, data)) => data,
        None => encoded,
    };
    let compact: String = payload
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    general_purpose::STANDARD.decode(compact)
}

fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
