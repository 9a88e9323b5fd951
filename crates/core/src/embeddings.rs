use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::error::PipelineError;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    model: String,
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self {
            model: format!("char-trigram-{DEFAULT}"),
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashingEmbedder {
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            model: format!("char-trigram-{dimensions}"),
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        if text.trim().is_empty() {
            return Err(PipelineError::Embedding(
                "cannot embed empty text".to_string(),
            ));
        }

        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        Ok(vector)
    }
}

#[derive(Debug, Clone, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    texts: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedResponse {
    vectors: Vec<Vec<f32>>,
}

pub struct HttpEmbedder {
    endpoint: String,
    model: String,
    dimensions: usize,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
        api_key: Option<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            dimensions,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        let vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Embedding("empty embedding response".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.iter().any(|text| text.trim().is_empty()) {
            return Err(PipelineError::Embedding(
                "cannot embed empty text".to_string(),
            ));
        }

        let mut request = self.client.post(&self.endpoint).json(&EmbedRequest {
            model: &self.model,
            texts,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::Embedding(format!(
                "embedding endpoint {} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: EmbedResponse = response
            .json()
            .await
            .map_err(|error| PipelineError::Embedding(error.to_string()))?;

        if payload.vectors.len() != texts.len() {
            return Err(PipelineError::Embedding(format!(
                "embedding count {} does not match input count {}",
                payload.vectors.len(),
                texts.len()
            )));
        }

        if let Some(vector) = payload.vectors.iter().find(|v| v.len() != self.dimensions) {
            return Err(PipelineError::Embedding(format!(
                "embedding dimension {} is not {}",
                vector.len(),
                self.dimensions
            )));
        }

        Ok(payload.vectors)
    }
}

struct CachedVector {
    vector: Vec<f32>,
    inserted_at: Instant,
}

/// TTL cache keyed by (model id, content hash). Chunk content is immutable
/// once embedded, so stale entries are acceptable until expiry.
pub struct CachedEmbedder<E> {
    inner: E,
    ttl: Duration,
    capacity: usize,
    cache: RwLock<HashMap<String, CachedVector>>,
}

impl<E: Embedder> CachedEmbedder<E> {
    pub fn new(inner: E) -> Self {
        Self::with_ttl(inner, DEFAULT_CACHE_TTL, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_ttl(inner: E, ttl: Duration, capacity: usize) -> Self {
        Self {
            inner,
            ttl,
            capacity,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.read().expect("cache lock poisoned").len()
    }

    fn cache_key(&self, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.inner.model_id().as_bytes());
        hasher.update([0x1f]);
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn lookup(&self, key: &str) -> Option<Vec<f32>> {
        let cache = self.cache.read().expect("cache lock poisoned");
        cache.get(key).and_then(|entry| {
            if entry.inserted_at.elapsed() < self.ttl {
                Some(entry.vector.clone())
            } else {
                None
            }
        })
    }

    fn store(&self, key: String, vector: Vec<f32>) {
        let mut cache = self.cache.write().expect("cache lock poisoned");
        if cache.len() >= self.capacity {
            let ttl = self.ttl;
            cache.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
            if cache.len() >= self.capacity {
                return;
            }
        }
        cache.insert(
            key,
            CachedVector {
                vector,
                inserted_at: Instant::now(),
            },
        );
    }
}

#[async_trait]
impl<E: Embedder> Embedder for CachedEmbedder<E> {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
        if text.trim().is_empty() {
            return Err(PipelineError::Embedding(
                "cannot embed empty text".to_string(),
            ));
        }

        let key = self.cache_key(text);
        if let Some(vector) = self.lookup(&key) {
            return Ok(vector);
        }

        let vector = self.inner.embed(text).await?;
        self.store(key, vector.clone());
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.iter().any(|text| text.trim().is_empty()) {
            return Err(PipelineError::Embedding(
                "cannot embed empty text".to_string(),
            ));
        }

        let keys: Vec<String> = texts.iter().map(|text| self.cache_key(text)).collect();
        let mut resolved: Vec<Option<Vec<f32>>> =
            keys.iter().map(|key| self.lookup(key)).collect();

        let mut miss_texts = Vec::new();
        let mut miss_keys = Vec::new();
        for (index, slot) in resolved.iter().enumerate() {
            if slot.is_none() && !miss_keys.contains(&keys[index]) {
                miss_keys.push(keys[index].clone());
                miss_texts.push(texts[index].clone());
            }
        }

        if !miss_texts.is_empty() {
            let vectors = self.inner.embed_batch(&miss_texts).await?;
            let fetched: HashMap<&String, &Vec<f32>> =
                miss_keys.iter().zip(vectors.iter()).collect();

            for (index, slot) in resolved.iter_mut().enumerate() {
                if slot.is_none() {
                    if let Some(vector) = fetched.get(&keys[index]) {
                        *slot = Some((*vector).clone());
                    }
                }
            }

            for (key, vector) in miss_keys.into_iter().zip(vectors.into_iter()) {
                self.store(key, vector);
            }
        }

        resolved
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| {
                    PipelineError::Embedding("embedding batch left unresolved text".to_string())
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn embedder_is_deterministic() {
        let embedder = HashingEmbedder::default();
        let first = embedder.embed("Hydraulic pressure and flow").await.unwrap();
        let second = embedder.embed("Hydraulic pressure and flow").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn embedder_outputs_expected_length() {
        let embedder = HashingEmbedder::with_dimensions(32);
        let vector = embedder.embed("abcdef").await.unwrap();
        assert_eq!(vector.len(), 32);
    }

    #[tokio::test]
    async fn empty_text_is_rejected() {
        let embedder = HashingEmbedder::default();
        assert!(embedder.embed("   ").await.is_err());

        let cached = CachedEmbedder::new(HashingEmbedder::default());
        assert!(cached.embed("").await.is_err());
    }

    #[tokio::test]
    async fn batch_matches_individual_calls() {
        let embedder = HashingEmbedder::default();
        let texts = vec!["a".to_string(), "a".to_string(), "bearing wear".to_string()];
        let batch = embedder.embed_batch(&texts).await.unwrap();

        assert_eq!(batch[0], batch[1]);
        assert_eq!(batch[2], embedder.embed("bearing wear").await.unwrap());
    }

    #[test]
    fn http_embedder_reports_model_metadata() {
        let embedder = HttpEmbedder::new("http://localhost:9000/embed", "remote-small", 256, None);
        assert_eq!(embedder.model_id(), "remote-small");
        assert_eq!(embedder.dimensions(), 256);
    }

    #[tokio::test]
    async fn http_embedder_rejects_empty_text_before_sending() {
        let embedder = HttpEmbedder::new("http://localhost:9000/embed", "remote-small", 256, None);
        let result = embedder.embed_batch(&["   ".to_string()]).await;
        assert!(matches!(result, Err(PipelineError::Embedding(_))));
    }

    struct CountingEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text).await
        }
    }

    #[tokio::test]
    async fn cache_hit_skips_recomputation() {
        let counting = CountingEmbedder {
            inner: HashingEmbedder::default(),
            calls: AtomicUsize::new(0),
        };
        let cached = CachedEmbedder::new(counting);

        let first = cached.embed("seal replacement procedure").await.unwrap();
        let second = cached.embed("seal replacement procedure").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cached.cached_entries(), 1);
    }

    #[tokio::test]
    async fn expired_entries_are_recomputed() {
        let counting = CountingEmbedder {
            inner: HashingEmbedder::default(),
            calls: AtomicUsize::new(0),
        };
        let cached = CachedEmbedder::with_ttl(counting, Duration::from_millis(0), 16);

        cached.embed("torque spec").await.unwrap();
        cached.embed("torque spec").await.unwrap();

        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn batch_resolves_duplicates_once() {
        let counting = CountingEmbedder {
            inner: HashingEmbedder::default(),
            calls: AtomicUsize::new(0),
        };
        let cached = CachedEmbedder::new(counting);

        let texts = vec!["same text".to_string(), "same text".to_string()];
        let vectors = cached.embed_batch(&texts).await.unwrap();

        assert_eq!(vectors[0], vectors[1]);
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 1);
    }
}
