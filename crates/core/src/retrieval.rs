use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::embeddings::Embedder;
use crate::models::{IndexFilter, IndexHit, RetrievalOutcome, RetrievedPassage, SearchOptions};
use crate::traits::VectorIndex;

#[derive(Debug, Clone, Copy)]
pub struct RerankWeights {
    pub base: f32,
    pub phrase: f32,
    pub overlap: f32,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self {
            base: 0.6,
            phrase: 0.25,
            overlap: 0.15,
        }
    }
}

pub struct RetrievalEngine<E, V> {
    embedder: Arc<E>,
    index: Arc<V>,
    weights: RerankWeights,
}

impl<E, V> RetrievalEngine<E, V>
where
    E: Embedder,
    V: VectorIndex,
{
    pub fn new(embedder: Arc<E>, index: Arc<V>) -> Self {
        Self {
            embedder,
            index,
            weights: RerankWeights::default(),
        }
    }

    pub fn with_weights(embedder: Arc<E>, index: Arc<V>, weights: RerankWeights) -> Self {
        Self {
            embedder,
            index,
            weights,
        }
    }

    pub async fn search(&self, query: &str, options: &SearchOptions) -> RetrievalOutcome {
        if query.trim().is_empty() {
            return RetrievalOutcome::default();
        }

        let query_vector = match self.embedder.embed(query).await {
            Ok(vector) => vector,
            Err(error) => {
                warn!(%error, "query embedding failed, degrading to empty result");
                return RetrievalOutcome {
                    passages: Vec::new(),
                    degraded: true,
                };
            }
        };

        let oversample = options.top_k.saturating_mul(3).max(options.top_k);
        let hits = match self
            .index
            .query(&query_vector, oversample, options.filter.as_ref())
            .await
        {
            Ok(hits) => hits,
            Err(error) => {
                warn!(%error, "vector index query failed, degrading to empty result");
                return RetrievalOutcome {
                    passages: Vec::new(),
                    degraded: true,
                };
            }
        };

        let mut passages: Vec<RetrievedPassage> =
            hits.iter().map(passage_from_hit).collect();

        if options.rerank {
            passages = self.rerank(query, passages);
        }

        passages.retain(|passage| passage.relevance >= options.min_relevance);
        passages.truncate(options.top_k);

        RetrievalOutcome {
            passages,
            degraded: false,
        }
    }

    pub async fn search_by_tags(
        &self,
        tags: &[String],
        top_k: usize,
        filter: Option<&IndexFilter>,
    ) -> RetrievalOutcome {
        if tags.is_empty() {
            return RetrievalOutcome::default();
        }

        let mut combined = filter.cloned().unwrap_or_default();
        combined.tags = tags.to_vec();

        let hits = match self
            .index
            .scan(&combined, top_k.saturating_mul(3).max(top_k))
            .await
        {
            Ok(hits) => hits,
            Err(error) => {
                warn!(%error, "tag scan failed, degrading to empty result");
                return RetrievalOutcome {
                    passages: Vec::new(),
                    degraded: true,
                };
            }
        };

        let mut passages: Vec<RetrievedPassage> = hits
            .iter()
            .map(|hit| {
                let mut passage = passage_from_hit(hit);
                let matched = tags
                    .iter()
                    .filter(|tag| passage.tags.contains(tag))
                    .count();
                passage.relevance =
                    (matched as f32 / tags.len() as f32).clamp(0.0, 1.0);
                passage
            })
            .collect();

        passages.sort_by(|left, right| {
            right
                .relevance
                .total_cmp(&left.relevance)
                .then_with(|| left.chunk_id.cmp(&right.chunk_id))
        });
        passages.truncate(top_k);

        RetrievalOutcome {
            passages,
            degraded: false,
        }
    }

    pub async fn find_similar(
        &self,
        chunk_id: &str,
        top_k: usize,
        exclude_same_document: bool,
    ) -> RetrievalOutcome {
        let entry = match self.index.fetch(chunk_id).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return RetrievalOutcome::default(),
            Err(error) => {
                warn!(%error, chunk_id, "stored embedding lookup failed");
                return RetrievalOutcome {
                    passages: Vec::new(),
                    degraded: true,
                };
            }
        };

        let filter = if exclude_same_document {
            entry.metadata.get("document_id").map(|document_id| IndexFilter {
                exclude_document: Some(document_id.clone()),
                ..Default::default()
            })
        } else {
            None
        };

        let hits = match self
            .index
            .query(&entry.vector, top_k.saturating_add(1), filter.as_ref())
            .await
        {
            Ok(hits) => hits,
            Err(error) => {
                warn!(%error, chunk_id, "similarity query failed");
                return RetrievalOutcome {
                    passages: Vec::new(),
                    degraded: true,
                };
            }
        };

        let mut passages: Vec<RetrievedPassage> = hits
            .iter()
            .filter(|hit| hit.id != chunk_id)
            .map(passage_from_hit)
            .collect();
        passages.truncate(top_k);

        RetrievalOutcome {
            passages,
            degraded: false,
        }
    }

    fn rerank(&self, query: &str, mut passages: Vec<RetrievedPassage>) -> Vec<RetrievedPassage> {
        let lowered_query = query.to_lowercase();
        let query_terms = significant_terms(&lowered_query);
        let total_weight = self.weights.base + self.weights.phrase + self.weights.overlap;

        for passage in &mut passages {
            let content = passage.content.to_lowercase();
            let phrase_bonus = if content.contains(&lowered_query) {
                1.0
            } else {
                0.0
            };
            let overlap = keyword_overlap(&content, &query_terms);

            let combined = passage.relevance * self.weights.base
                + phrase_bonus * self.weights.phrase
                + overlap * self.weights.overlap;
            passage.relevance = (combined / total_weight).clamp(0.0, 1.0);
        }

        // stable sort keeps the original vector rank for equal scores
        passages.sort_by(|left, right| right.relevance.total_cmp(&left.relevance));
        passages
    }
}

fn passage_from_hit(hit: &IndexHit) -> RetrievedPassage {
    let document_id = hit
        .metadata
        .get("document_id")
        .cloned()
        .unwrap_or_default();
    let source = hit
        .metadata
        .get("source")
        .cloned()
        .unwrap_or_else(|| document_id.clone());

    RetrievedPassage {
        chunk_id: hit.id.clone(),
        document_id,
        content: hit.text.clone(),
        relevance: hit.relevance.clamp(0.0, 1.0),
        source,
        tags: tags_from_metadata(&hit.metadata),
    }
}

pub(crate) fn tags_from_metadata(metadata: &HashMap<String, String>) -> Vec<String> {
    metadata
        .get("tags")
        .map(|raw| {
            raw.split(',')
                .map(|tag| tag.trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn significant_terms(lowered_query: &str) -> Vec<String> {
    lowered_query
        .split_whitespace()
        .filter(|token| token.len() > 2)
        .map(|token| token.to_string())
        .collect()
}

fn keyword_overlap(lowered_content: &str, query_terms: &[String]) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }

    let matched = query_terms
        .iter()
        .filter(|term| lowered_content.contains(term.as_str()))
        .count();
    matched as f32 / query_terms.len() as f32
}
