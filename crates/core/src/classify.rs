use async_trait::async_trait;

use crate::error::PipelineError;
use crate::traits::Classifier;

#[derive(Debug, Clone)]
pub struct TagRule {
    pub tag: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct KeywordClassifier {
    rules: Vec<TagRule>,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<TagRule>) -> Self {
        Self { rules }
    }

    pub fn with_rule(mut self, tag: impl Into<String>, keywords: &[&str]) -> Self {
        self.rules.push(TagRule {
            tag: tag.into(),
            keywords: keywords
                .iter()
                .map(|keyword| keyword.to_lowercase())
                .collect(),
        });
        self
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<Vec<String>, PipelineError> {
        let lowered = text.to_lowercase();
        Ok(self
            .rules
            .iter()
            .filter(|rule| {
                rule.keywords
                    .iter()
                    .any(|keyword| lowered.contains(keyword.as_str()))
            })
            .map(|rule| rule.tag.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn matching_keywords_produce_tags() {
        let classifier = KeywordClassifier::default()
            .with_rule("hydraulics", &["pump", "pressure"])
            .with_rule("electrical", &["voltage"]);

        let tags = classifier
            .classify("The PUMP lost pressure during the test")
            .await
            .unwrap();

        assert_eq!(tags, vec!["hydraulics".to_string()]);
    }

    #[tokio::test]
    async fn unmatched_text_yields_no_tags() {
        let classifier = KeywordClassifier::default().with_rule("hydraulics", &["pump"]);
        let tags = classifier.classify("nothing relevant here").await.unwrap();
        assert!(tags.is_empty());
    }
}
