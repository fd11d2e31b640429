use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// In-memory captions keyed by image name. Lives as long as the process.
#[derive(Debug, Default)]
pub struct CaptionCache {
    captions: RwLock<HashMap<String, String>>,
}

impl CaptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the caption for `image_name`.
    pub fn put(&self, image_name: impl Into<String>, caption: impl Into<String>) {
        self.captions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(image_name.into(), caption.into());
    }

    pub fn get(&self, image_name: &str) -> Option<String> {
        self.captions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(image_name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.captions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn put_overwrites_and_get_is_pure() {
        let cache = CaptionCache::new();
        assert_eq!(cache.get("a.jpg"), None);

        cache.put("a.jpg", "a dog");
        cache.put("a.jpg", "a cat");
        assert_eq!(cache.get("a.jpg").as_deref(), Some("a cat"));
        assert_eq!(cache.get("a.jpg").as_deref(), Some("a cat"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_writers_keep_every_key() {
        let cache = Arc::new(CaptionCache::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.put(format!("{t}-{i}"), format!("caption {t} {i}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(cache.len(), 800);
        assert_eq!(cache.get("3-42").as_deref(), Some("caption 3 42"));
    }
}
