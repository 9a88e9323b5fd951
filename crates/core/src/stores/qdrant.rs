use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::error::RetrievalError;
use crate::models::{IndexEntry, IndexFilter, IndexHit};
use crate::traits::VectorIndex;

use super::relevance_from_distance;

pub struct QdrantIndex {
    endpoint: String,
    collection: String,
    client: Client,
    vector_size: usize,
}

impl QdrantIndex {
    pub fn new(
        endpoint: impl Into<String>,
        collection: impl Into<String>,
        vector_size: usize,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            collection: collection.into(),
            client: Client::new(),
            vector_size,
        }
    }

    pub async fn ensure_collection(&self) -> Result<(), RetrievalError> {
        let response = self
            .client
            .get(format!("{}/collections/{}", self.endpoint, self.collection))
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!("{}/collections/{}", self.endpoint, self.collection))
            .json(&json!({
                "vectors": { "size": self.vector_size, "distance": "Cosine" }
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RetrievalError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(())
    }

    fn filter_conditions(filter: &IndexFilter) -> Value {
        let mut must = Vec::new();
        let mut must_not = Vec::new();

        if let Some(document_id) = &filter.document_id {
            must.push(json!({ "key": "document_id", "match": { "value": document_id } }));
        }
        if let Some(excluded) = &filter.exclude_document {
            must_not.push(json!({ "key": "document_id", "match": { "value": excluded } }));
        }
        if !filter.tags.is_empty() {
            must.push(json!({ "key": "tags", "match": { "any": filter.tags } }));
        }

        json!({ "must": must, "must_not": must_not })
    }

    fn hit_from_point(point: &Value) -> IndexHit {
        let payload = point.pointer("/payload").cloned().unwrap_or(Value::Null);
        let id = payload
            .pointer("/chunk_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let text = payload
            .pointer("/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut metadata = HashMap::new();
        if let Some(object) = payload.pointer("/metadata").and_then(Value::as_object) {
            for (key, value) in object {
                if let Some(value) = value.as_str() {
                    metadata.insert(key.clone(), value.to_string());
                }
            }
        }

        let score = point
            .pointer("/score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0) as f32;
        let distance = 1.0 - score;

        IndexHit {
            id,
            text,
            metadata,
            distance,
            relevance: relevance_from_distance(distance),
        }
    }
}

fn point_id(chunk_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(chunk_id.as_bytes());
    let digest = hasher.finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, entries: Vec<IndexEntry>) -> Result<(), RetrievalError> {
        let points = entries
            .iter()
            .map(|entry| {
                if entry.vector.len() != self.vector_size {
                    return Err(RetrievalError::Request(format!(
                        "embedding dimension {} != {}",
                        entry.vector.len(),
                        self.vector_size
                    )));
                }

                Ok(json!({
                    "id": point_id(&entry.id),
                    "vector": entry.vector,
                    "payload": {
                        "chunk_id": entry.id,
                        "text": entry.text,
                        "document_id": entry.metadata.get("document_id"),
                        "tags": entry.metadata.get("tags").map(|raw| {
                            raw.split(',').map(str::trim).collect::<Vec<_>>()
                        }),
                        "metadata": entry.metadata,
                    },
                }))
            })
            .collect::<Result<Vec<_>, RetrievalError>>()?;

        if points.is_empty() {
            return Ok(());
        }

        let response = self
            .client
            .put(format!(
                "{}/collections/{}/points?wait=true",
                self.endpoint, self.collection
            ))
            .json(&json!({ "points": points }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RetrievalError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>, RetrievalError> {
        if vector.len() != self.vector_size {
            return Err(RetrievalError::Request(format!(
                "query vector dim {} is not {}",
                vector.len(),
                self.vector_size
            )));
        }

        let mut body = json!({
            "vector": vector,
            "limit": top_k,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = Self::filter_conditions(filter);
        }

        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/search",
                self.endpoint, self.collection
            ))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RetrievalError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(hits.iter().map(Self::hit_from_point).collect())
    }

    async fn fetch(&self, id: &str) -> Result<Option<IndexEntry>, RetrievalError> {
        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points",
                self.endpoint, self.collection
            ))
            .json(&json!({ "ids": [point_id(id)], "with_payload": true, "with_vector": true }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RetrievalError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let point = match parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .and_then(|points| points.first())
        {
            Some(point) => point.clone(),
            None => return Ok(None),
        };

        let vector = point
            .pointer("/vector")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_f64)
                    .map(|value| value as f32)
                    .collect::<Vec<f32>>()
            })
            .unwrap_or_default();

        let hit = Self::hit_from_point(&point);
        Ok(Some(IndexEntry {
            id: hit.id,
            vector,
            text: hit.text,
            metadata: hit.metadata,
        }))
    }

    async fn scan(
        &self,
        filter: &IndexFilter,
        limit: usize,
    ) -> Result<Vec<IndexHit>, RetrievalError> {
        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/scroll",
                self.endpoint, self.collection
            ))
            .json(&json!({
                "filter": Self::filter_conditions(filter),
                "limit": limit,
                "with_payload": true,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RetrievalError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let points = parsed
            .pointer("/result/points")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(points
            .iter()
            .map(|point| {
                let mut hit = Self::hit_from_point(point);
                hit.distance = 0.0;
                hit.relevance = 1.0;
                hit
            })
            .collect())
    }

    async fn delete(&self, ids: &[String]) -> Result<(), RetrievalError> {
        if ids.is_empty() {
            return Ok(());
        }

        let point_ids: Vec<u64> = ids.iter().map(|id| point_id(id)).collect();
        let response = self
            .client
            .post(format!(
                "{}/collections/{}/points/delete?wait=true",
                self.endpoint, self.collection
            ))
            .json(&json!({ "points": point_ids }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RetrievalError::BackendResponse {
                backend: "qdrant".to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_stable() {
        assert_eq!(point_id("chunk-1"), point_id("chunk-1"));
        assert_ne!(point_id("chunk-1"), point_id("chunk-2"));
    }

    #[test]
    fn filter_conditions_cover_all_fields() {
        let filter = IndexFilter {
            document_id: Some("doc-1".to_string()),
            exclude_document: Some("doc-2".to_string()),
            tags: vec!["safety".to_string()],
        };

        let conditions = QdrantIndex::filter_conditions(&filter);
        assert_eq!(conditions["must"].as_array().unwrap().len(), 2);
        assert_eq!(conditions["must_not"].as_array().unwrap().len(), 1);
    }
}
