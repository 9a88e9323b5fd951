use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document as PdfDocument;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::models::DocumentFormat;
use crate::traits::BlobStorage;

pub const MIN_EXTRACTED_CHARS: usize = 24;

#[derive(Debug, Clone, Serialize)]
struct OcrRequest {
    document_base64: String,
    locator: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    pages: Option<Vec<OcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrPage {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl OcrEndpointConfig {
    pub fn from_env() -> Option<Self> {
        let endpoint = std::env::var("DOC_QA_OCR_ENDPOINT").ok()?;
        let endpoint = endpoint.trim().to_string();
        if endpoint.is_empty() {
            return None;
        }

        let api_key = std::env::var("DOC_QA_OCR_API_KEY").ok().and_then(|value| {
            let key = value.trim().to_string();
            if key.is_empty() {
                None
            } else {
                Some(key)
            }
        });

        Some(Self { endpoint, api_key })
    }
}

pub struct TextExtractor {
    min_chars: usize,
    ocr: Option<OcrEndpointConfig>,
    client: reqwest::Client,
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self {
            min_chars: MIN_EXTRACTED_CHARS,
            ocr: OcrEndpointConfig::from_env(),
            client: reqwest::Client::new(),
        }
    }
}

impl TextExtractor {
    pub fn with_min_chars(min_chars: usize) -> Self {
        Self {
            min_chars,
            ..Default::default()
        }
    }

    pub async fn extract(
        &self,
        storage: &dyn BlobStorage,
        locator: &str,
        format: DocumentFormat,
    ) -> Result<String, PipelineError> {
        if !storage.exists(locator).await? {
            return Err(PipelineError::Storage(format!("no document at {locator}")));
        }
        let bytes = storage.read(locator).await?;

        let text = match format {
            DocumentFormat::PlainText => decode_text(&bytes),
            DocumentFormat::Markdown => strip_markdown(&decode_text(&bytes)),
            DocumentFormat::Html => strip_html(&decode_text(&bytes)),
            DocumentFormat::Pdf => self.extract_pdf(&bytes, locator).await?,
        };

        let normalized = normalize_text(&text);
        if normalized.chars().count() < self.min_chars {
            return Err(PipelineError::Extraction(format!(
                "decoded content below quality gate for {locator}"
            )));
        }

        Ok(normalized)
    }

    async fn extract_pdf(&self, bytes: &[u8], locator: &str) -> Result<String, PipelineError> {
        match extract_pdf_text(bytes, locator) {
            Ok(text) => Ok(text),
            Err(PipelineError::Extraction(parse_error)) => {
                match self.extract_with_remote_ocr(bytes, locator).await {
                    Ok(Some(text)) => Ok(text),
                    Ok(None) => Err(PipelineError::Extraction(parse_error)),
                    Err(ocr_error) => Err(PipelineError::Extraction(format!(
                        "{parse_error}; remote OCR fallback failed: {ocr_error}"
                    ))),
                }
            }
            Err(error) => Err(error),
        }
    }

    async fn extract_with_remote_ocr(
        &self,
        bytes: &[u8],
        locator: &str,
    ) -> Result<Option<String>, PipelineError> {
        let cfg = match &self.ocr {
            Some(cfg) => cfg,
            None => return Ok(None),
        };

        let payload = OcrRequest {
            document_base64: STANDARD.encode(bytes),
            locator: locator.to_string(),
        };

        let mut request = self
            .client
            .post(&cfg.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &cfg.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::Extraction(format!(
                "remote OCR request to {} returned {}",
                cfg.endpoint,
                response.status()
            )));
        }

        let payload: OcrResponse = response
            .json()
            .await
            .map_err(|error| PipelineError::Extraction(error.to_string()))?;

        let text = ocr_payload_text(&payload);
        if text.trim().is_empty() {
            return Err(PipelineError::Extraction(format!(
                "remote OCR response has no readable text: {locator}"
            )));
        }

        Ok(Some(text))
    }
}

fn ocr_payload_text(payload: &OcrResponse) -> String {
    if let Some(pages) = &payload.pages {
        let collected = pages
            .iter()
            .filter_map(|page| page.text.as_ref().map(|text| text.trim().to_string()))
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>();

        if !collected.is_empty() {
            return collected.join("\n\n");
        }
    }

    payload.text.clone().unwrap_or_default()
}

fn extract_pdf_text(bytes: &[u8], locator: &str) -> Result<String, PipelineError> {
    let document = PdfDocument::load_mem(bytes)
        .map_err(|error| PipelineError::Extraction(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| PipelineError::Extraction(error.to_string()))?;

        if !text.trim().is_empty() {
            pages.push(text);
        }
    }

    if pages.is_empty() {
        return Err(PipelineError::Extraction(format!(
            "pdf had no readable page text: {locator}"
        )));
    }

    Ok(pages.join("\n\n"))
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        // fallback decoder: treat bytes as Latin-1
        Err(_) => bytes.iter().map(|byte| *byte as char).collect(),
    }
}

pub fn normalize_text(text: &str) -> String {
    text.chars()
        .filter(|ch| !ch.is_control() || ch.is_whitespace())
        .collect::<String>()
        .replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_markdown(text: &str) -> String {
    let link_re = Regex::new(r"\[([^\]]*)\]\([^)]*\)").expect("static regex");
    let marker_re = Regex::new(r"[*_`#]+").expect("static regex");

    let without_links = link_re.replace_all(text, "$1");
    marker_re.replace_all(&without_links, "").to_string()
}

fn strip_html(text: &str) -> String {
    let block_re = Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>")
        .expect("static regex");
    let tag_re = Regex::new(r"<[^>]+>").expect("static regex");

    let without_blocks = block_re.replace_all(text, " ");
    let without_tags = tag_re.replace_all(&without_blocks, " ");

    without_tags
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryBlobStorage;

    #[tokio::test]
    async fn plain_text_is_normalized() {
        let storage = MemoryBlobStorage::default();
        storage.put("a.txt", b"A  \t lot\nof   spacing in this little document".to_vec());

        let extractor = TextExtractor::with_min_chars(10);
        let text = extractor
            .extract(&storage, "a.txt", DocumentFormat::PlainText)
            .await
            .expect("extraction should succeed");

        assert_eq!(text, "A lot of spacing in this little document");
    }

    #[tokio::test]
    async fn invalid_utf8_uses_fallback_decoder() {
        let storage = MemoryBlobStorage::default();
        storage.put(
            "legacy.txt",
            b"caf\xe9 menu with enough text to pass the gate".to_vec(),
        );

        let extractor = TextExtractor::with_min_chars(10);
        let text = extractor
            .extract(&storage, "legacy.txt", DocumentFormat::PlainText)
            .await
            .expect("fallback decoding should succeed");

        assert!(text.contains("café"));
    }

    #[tokio::test]
    async fn short_content_fails_the_quality_gate() {
        let storage = MemoryBlobStorage::default();
        storage.put("tiny.txt", b"hi".to_vec());

        let extractor = TextExtractor::default();
        let result = extractor
            .extract(&storage, "tiny.txt", DocumentFormat::PlainText)
            .await;

        assert!(matches!(result, Err(PipelineError::Extraction(_))));
    }

    #[tokio::test]
    async fn html_tags_and_entities_are_stripped() {
        let storage = MemoryBlobStorage::default();
        storage.put(
            "page.html",
            b"<html><style>p{color:red}</style><p>Tom &amp; Jerry run the maintenance shop</p></html>"
                .to_vec(),
        );

        let extractor = TextExtractor::with_min_chars(10);
        let text = extractor
            .extract(&storage, "page.html", DocumentFormat::Html)
            .await
            .expect("extraction should succeed");

        assert_eq!(text, "Tom & Jerry run the maintenance shop");
    }

    #[tokio::test]
    async fn markdown_markers_are_stripped() {
        let storage = MemoryBlobStorage::default();
        storage.put(
            "notes.md",
            b"# Heading\n\nSome **bold** text and a [link](http://example.com) to follow".to_vec(),
        );

        let extractor = TextExtractor::with_min_chars(10);
        let text = extractor
            .extract(&storage, "notes.md", DocumentFormat::Markdown)
            .await
            .expect("extraction should succeed");

        assert_eq!(text, "Heading Some bold text and a link to follow");
    }

    #[test]
    fn unreadable_pdf_reports_extraction_error() {
        let result = extract_pdf_text(b"%PDF-1.4\n%broken", "x.pdf");
        assert!(matches!(result, Err(PipelineError::Extraction(_))));
    }

    #[test]
    fn ocr_payload_prefers_page_list() {
        let payload = OcrResponse {
            pages: Some(vec![
                OcrPage {
                    text: Some("  ".to_string()),
                },
                OcrPage {
                    text: Some("Page 2".to_string()),
                },
            ]),
            text: Some("ignored".to_string()),
        };
        assert_eq!(ocr_payload_text(&payload), "Page 2");
    }
}
