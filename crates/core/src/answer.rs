use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::embeddings::Embedder;
use crate::error::GenerationError;
use crate::models::{AnswerRecord, RetrievedPassage, SearchOptions};
use crate::retrieval::RetrievalEngine;
use crate::traits::{DocumentRepository, VectorIndex};

pub const NO_INFORMATION_ANSWER: &str =
    "No relevant information was found in the indexed documents.";

#[derive(Debug, Clone)]
pub struct GeneratedText {
    pub text: String,
    pub confidence: f32,
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn is_available(&self) -> bool;

    async fn generate(
        &self,
        prompt: &str,
        context: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<GeneratedText, GenerationError>;
}

#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn GenerationBackend>>,
}

impl BackendRegistry {
    pub fn register(&mut self, backend: Arc<dyn GenerationBackend>) {
        self.backends.push(backend);
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends
            .iter()
            .map(|backend| backend.name().to_string())
            .collect()
    }

    /// Candidates in fallback order: the preferred backend first when it is
    /// registered, then the remaining backends in registration priority.
    pub fn candidates(&self, preference: Option<&str>) -> Vec<Arc<dyn GenerationBackend>> {
        let mut ordered = Vec::with_capacity(self.backends.len());

        if let Some(name) = preference {
            if let Some(preferred) = self
                .backends
                .iter()
                .find(|backend| backend.name() == name)
            {
                ordered.push(Arc::clone(preferred));
            }
        }

        for backend in &self.backends {
            if !ordered
                .iter()
                .any(|existing: &Arc<dyn GenerationBackend>| existing.name() == backend.name())
            {
                ordered.push(Arc::clone(backend));
            }
        }

        ordered
    }
}

/// Deterministic local backend: picks the context sentences that overlap the
/// question. Always available, so it works as the end of the fallback chain.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveBackend;

#[async_trait]
impl GenerationBackend for ExtractiveBackend {
    fn name(&self) -> &str {
        "extractive"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        prompt: &str,
        context: &str,
        max_tokens: usize,
        _temperature: f32,
    ) -> Result<GeneratedText, GenerationError> {
        let terms: Vec<String> = prompt
            .to_lowercase()
            .split_whitespace()
            .filter(|token| token.len() > 2)
            .map(|token| token.to_string())
            .collect();

        let sentences: Vec<&str> = context
            .lines()
            .filter(|line| !line.trim_start().starts_with("[source:"))
            .flat_map(|line| line.split_inclusive(['.', '!', '?']))
            .map(str::trim)
            .filter(|sentence| !sentence.is_empty())
            .collect();

        let budget = max_tokens.saturating_mul(4).max(80);
        let mut best_overlap = 0.0f32;
        let mut selected = Vec::new();
        let mut used = 0usize;

        for sentence in &sentences {
            let lowered = sentence.to_lowercase();
            let matched = terms
                .iter()
                .filter(|term| lowered.contains(term.as_str()))
                .count();
            if matched == 0 {
                continue;
            }

            let overlap = matched as f32 / terms.len().max(1) as f32;
            best_overlap = best_overlap.max(overlap);

            if used + sentence.len() > budget && !selected.is_empty() {
                break;
            }
            used += sentence.len();
            selected.push(*sentence);
        }

        if selected.is_empty() {
            let fallback: String = sentences.join(" ").chars().take(budget).collect();
            return Ok(GeneratedText {
                text: fallback,
                confidence: 0.1,
            });
        }

        Ok(GeneratedText {
            text: selected.join(" "),
            confidence: best_overlap.clamp(0.0, 1.0),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    context: &'a str,
    max_tokens: usize,
    temperature: f32,
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateResponse {
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
}

pub struct HttpGenerationBackend {
    name: String,
    endpoint: Url,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpGenerationBackend {
    pub fn new(
        name: impl Into<String>,
        endpoint: &str,
        api_key: Option<String>,
    ) -> Result<Self, GenerationError> {
        Ok(Self {
            name: name.into(),
            endpoint: Url::parse(endpoint)?,
            api_key,
            client: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        let probe = self
            .client
            .head(self.endpoint.clone())
            .timeout(Duration::from_secs(2))
            .send()
            .await;

        match probe {
            Ok(response) => !response.status().is_server_error(),
            Err(_) => false,
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        context: &str,
        max_tokens: usize,
        temperature: f32,
    ) -> Result<GeneratedText, GenerationError> {
        let mut request = self.client.post(self.endpoint.clone()).json(&GenerateRequest {
            prompt,
            context,
            max_tokens,
            temperature,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(GenerationError::Backend {
                backend: self.name.clone(),
                details: response.status().to_string(),
            });
        }

        let payload: GenerateResponse =
            response
                .json()
                .await
                .map_err(|error| GenerationError::Backend {
                    backend: self.name.clone(),
                    details: error.to_string(),
                })?;

        Ok(GeneratedText {
            text: payload.text,
            confidence: payload.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
        })
    }
}

#[derive(Debug, Clone)]
pub struct AnswerOptions {
    pub top_k: usize,
    pub min_relevance: f32,
    pub max_tokens: usize,
    pub temperature: f32,
    pub context_char_budget: usize,
    pub generation_timeout: Duration,
}

impl Default for AnswerOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            min_relevance: 0.25,
            max_tokens: 512,
            temperature: 0.2,
            context_char_budget: 6_000,
            generation_timeout: Duration::from_secs(30),
        }
    }
}

pub struct AnswerSynthesizer<E, V> {
    retrieval: Arc<RetrievalEngine<E, V>>,
    backends: BackendRegistry,
    repository: Option<Arc<dyn DocumentRepository>>,
}

impl<E, V> AnswerSynthesizer<E, V>
where
    E: Embedder + Send + Sync + 'static,
    V: VectorIndex + Send + Sync + 'static,
{
    pub fn new(retrieval: Arc<RetrievalEngine<E, V>>, backends: BackendRegistry) -> Self {
        Self {
            retrieval,
            backends,
            repository: None,
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn DocumentRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub async fn answer(
        &self,
        question: &str,
        preference: Option<&str>,
        options: &AnswerOptions,
    ) -> AnswerRecord {
        let search = SearchOptions {
            top_k: options.top_k,
            min_relevance: options.min_relevance,
            rerank: true,
            filter: None,
        };
        let outcome = self.retrieval.search(question, &search).await;

        if outcome.passages.is_empty() {
            let record = make_record(
                question,
                NO_INFORMATION_ANSWER.to_string(),
                "none",
                0.0,
                Vec::new(),
            );
            self.persist(&record).await;
            return record;
        }

        let context = build_context(&outcome.passages, options.context_char_budget);
        let sources: Vec<String> = outcome
            .passages
            .iter()
            .map(|passage| passage.chunk_id.clone())
            .collect();

        for backend in self.backends.candidates(preference) {
            if !backend.is_available().await {
                debug!(backend = backend.name(), "backend unavailable, skipping");
                continue;
            }

            let generated = tokio::time::timeout(
                options.generation_timeout,
                backend.generate(question, &context, options.max_tokens, options.temperature),
            )
            .await;

            match generated {
                Ok(Ok(generated)) => {
                    let record = make_record(
                        question,
                        generated.text,
                        backend.name(),
                        generated.confidence.clamp(0.0, 1.0),
                        sources,
                    );
                    self.persist(&record).await;
                    return record;
                }
                Ok(Err(error)) => {
                    warn!(backend = backend.name(), %error, "generation failed, trying next backend");
                }
                Err(_elapsed) => {
                    warn!(
                        backend = backend.name(),
                        timeout_ms = options.generation_timeout.as_millis() as u64,
                        "generation timed out, trying next backend"
                    );
                }
            }
        }

        let record = make_record(
            question,
            "All generation backends are unavailable.".to_string(),
            "error",
            0.0,
            Vec::new(),
        );
        self.persist(&record).await;
        record
    }

    pub async fn batch_answer(
        self: Arc<Self>,
        questions: Vec<String>,
        preference: Option<String>,
        max_concurrent: usize,
        options: AnswerOptions,
    ) -> Vec<AnswerRecord> {
        let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for (index, question) in questions.iter().enumerate() {
            let synthesizer = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let question = question.clone();
            let preference = preference.clone();
            let options = options.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                let record = synthesizer
                    .answer(&question, preference.as_deref(), &options)
                    .await;
                (index, record)
            });
        }

        let mut slots: Vec<Option<AnswerRecord>> = questions.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, record)) => slots[index] = Some(record),
                Err(error) => warn!(%error, "batch answer task failed"),
            }
        }

        slots
            .into_iter()
            .zip(questions)
            .map(|(slot, question)| {
                slot.unwrap_or_else(|| {
                    make_record(
                        &question,
                        "Answering this question failed.".to_string(),
                        "error",
                        0.0,
                        Vec::new(),
                    )
                })
            })
            .collect()
    }

    async fn persist(&self, record: &AnswerRecord) {
        if let Some(repository) = &self.repository {
            if let Err(error) = repository.put_answer(record.clone()).await {
                warn!(%error, "failed to persist answer record");
            }
        }
    }
}

fn make_record(
    question: &str,
    answer: String,
    model_used: &str,
    confidence: f32,
    source_chunk_ids: Vec<String>,
) -> AnswerRecord {
    AnswerRecord {
        answer_id: Uuid::new_v4().to_string(),
        question: question.to_string(),
        answer,
        model_used: model_used.to_string(),
        confidence,
        source_chunk_ids,
        created_at: Utc::now(),
    }
}

fn build_context(passages: &[RetrievedPassage], char_budget: usize) -> String {
    let mut blocks = Vec::new();
    let mut used = 0usize;

    for passage in passages {
        let block = format!(
            "[source: {} | relevance: {:.2}]\n{}",
            passage.source, passage.relevance, passage.content
        );

        if used + block.len() > char_budget {
            if blocks.is_empty() {
                blocks.push(block.chars().take(char_budget).collect::<String>());
            }
            break;
        }

        used += block.len();
        blocks.push(block);
    }

    blocks.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashingEmbedder;
    use crate::models::IndexEntry;
    use crate::stores::{MemoryRepository, MemoryVectorIndex};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackend {
        name: String,
        available: bool,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeBackend {
        fn new(name: &str, available: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                available,
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl GenerationBackend for FakeBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn is_available(&self) -> bool {
            self.available
        }

        async fn generate(
            &self,
            prompt: &str,
            _context: &str,
            _max_tokens: usize,
            _temperature: f32,
        ) -> Result<GeneratedText, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(GenerationError::Backend {
                    backend: self.name.clone(),
                    details: "simulated outage".to_string(),
                });
            }
            Ok(GeneratedText {
                text: format!("{} answered: {prompt}", self.name),
                confidence: 0.9,
            })
        }
    }

    async fn seeded_engine() -> Arc<RetrievalEngine<HashingEmbedder, MemoryVectorIndex>> {
        let embedder = Arc::new(HashingEmbedder::with_dimensions(32));
        let index = Arc::new(MemoryVectorIndex::default());

        let texts = [
            "The hydraulic pump requires a seal inspection every 500 hours.",
            "Electrical cabinets must be locked out before maintenance.",
        ];
        for (position, text) in texts.iter().enumerate() {
            let vector = embedder.embed(text).await.unwrap();
            let mut metadata = HashMap::new();
            metadata.insert("document_id".to_string(), format!("doc-{position}"));
            metadata.insert("source".to_string(), format!("manual-{position}"));
            index
                .upsert(vec![IndexEntry {
                    id: format!("chunk-{position}"),
                    vector,
                    text: text.to_string(),
                    metadata,
                }])
                .await
                .unwrap();
        }

        Arc::new(RetrievalEngine::new(embedder, index))
    }

    fn lenient_options() -> AnswerOptions {
        AnswerOptions {
            min_relevance: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn empty_retrieval_skips_the_backend_entirely() {
        let embedder = Arc::new(HashingEmbedder::with_dimensions(32));
        let index = Arc::new(MemoryVectorIndex::default());
        let engine = Arc::new(RetrievalEngine::new(embedder, index));

        let backend = FakeBackend::new("primary", true, false);
        let mut registry = BackendRegistry::default();
        registry.register(backend.clone());

        let synthesizer = AnswerSynthesizer::new(engine, registry);
        let record = synthesizer
            .answer("what is the torque spec?", None, &lenient_options())
            .await;

        assert_eq!(record.answer, NO_INFORMATION_ANSWER);
        assert_eq!(record.confidence, 0.0);
        assert!(record.source_chunk_ids.is_empty());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unavailable_preference_falls_back_to_next_backend() {
        let engine = seeded_engine().await;

        let preferred = FakeBackend::new("preferred", false, false);
        let backup = FakeBackend::new("backup", true, false);
        let mut registry = BackendRegistry::default();
        registry.register(preferred);
        registry.register(backup);

        let synthesizer = AnswerSynthesizer::new(engine, registry);
        let record = synthesizer
            .answer(
                "how often is the hydraulic pump inspected?",
                Some("preferred"),
                &lenient_options(),
            )
            .await;

        assert_eq!(record.model_used, "backup");
        assert!(record.confidence > 0.0);
        assert!(!record.source_chunk_ids.is_empty());
    }

    #[tokio::test]
    async fn backend_errors_trigger_fallback_not_propagation() {
        let engine = seeded_engine().await;

        let flaky = FakeBackend::new("flaky", true, true);
        let stable = FakeBackend::new("stable", true, false);
        let mut registry = BackendRegistry::default();
        registry.register(flaky.clone());
        registry.register(stable);

        let synthesizer = AnswerSynthesizer::new(engine, registry);
        let record = synthesizer
            .answer("hydraulic pump inspection", None, &lenient_options())
            .await;

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert_eq!(record.model_used, "stable");
    }

    #[tokio::test]
    async fn exhausted_backends_yield_an_error_tagged_record() {
        let engine = seeded_engine().await;

        let mut registry = BackendRegistry::default();
        registry.register(FakeBackend::new("down", false, false));

        let synthesizer = AnswerSynthesizer::new(engine, registry);
        let record = synthesizer
            .answer("hydraulic pump inspection", None, &lenient_options())
            .await;

        assert_eq!(record.model_used, "error");
        assert_eq!(record.confidence, 0.0);
    }

    #[tokio::test]
    async fn answers_are_persisted_to_the_repository() {
        let engine = seeded_engine().await;
        let repository = Arc::new(MemoryRepository::default());

        let mut registry = BackendRegistry::default();
        registry.register(FakeBackend::new("primary", true, false));

        let synthesizer =
            AnswerSynthesizer::new(engine, registry).with_repository(repository.clone());
        synthesizer
            .answer("hydraulic pump inspection", None, &lenient_options())
            .await;

        assert_eq!(repository.list_answers().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn batch_answers_preserve_input_order() {
        let engine = seeded_engine().await;

        let mut registry = BackendRegistry::default();
        registry.register(FakeBackend::new("primary", true, false));

        let synthesizer = Arc::new(AnswerSynthesizer::new(engine, registry));
        let questions = vec![
            "hydraulic pump inspection".to_string(),
            "electrical lockout procedure".to_string(),
            "seal replacement interval".to_string(),
        ];

        let records = synthesizer
            .batch_answer(questions.clone(), None, 2, lenient_options())
            .await;

        assert_eq!(records.len(), questions.len());
        for (record, question) in records.iter().zip(&questions) {
            assert_eq!(&record.question, question);
        }
    }

    #[test]
    fn context_is_ordered_and_budgeted() {
        let passages = vec![
            RetrievedPassage {
                chunk_id: "a".to_string(),
                document_id: "doc-1".to_string(),
                content: "first passage".to_string(),
                relevance: 0.9,
                source: "manual-1".to_string(),
                tags: Vec::new(),
            },
            RetrievedPassage {
                chunk_id: "b".to_string(),
                document_id: "doc-2".to_string(),
                content: "second passage".to_string(),
                relevance: 0.5,
                source: "manual-2".to_string(),
                tags: Vec::new(),
            },
        ];

        let context = build_context(&passages, 10_000);
        let first = context.find("manual-1").unwrap();
        let second = context.find("manual-2").unwrap();
        assert!(first < second);
        assert!(context.contains("relevance: 0.90"));

        let tight = build_context(&passages, 50);
        assert!(tight.len() <= 50);
        assert!(tight.contains("manual-1"));
    }

    #[tokio::test]
    async fn extractive_backend_is_deterministic() {
        let backend = ExtractiveBackend;
        let context = "[source: m | relevance: 0.90]\nThe pump needs oil. Unrelated sentence here.";

        let first = backend
            .generate("pump oil", context, 64, 0.0)
            .await
            .unwrap();
        let second = backend
            .generate("pump oil", context, 64, 0.0)
            .await
            .unwrap();

        assert_eq!(first.text, second.text);
        assert!(first.text.contains("pump needs oil"));
        assert!(first.confidence > 0.5);
    }
}
