//! Analyzer backed by an HTTP inference service.
//!
//! Request: `POST <url>` with `{"texts": [...]}`.
//! Response: a JSON array with one
//! `{"sentiment": {label: score}, "sensitive_topics": {topic: score}}`
//! object per text.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use kurisu_core::Annotation;

use super::{AnalyzerError, TextAnalyzer, check_len};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    texts: &'a [String],
}

#[derive(Debug, Deserialize)]
struct AnalyzeResult {
    #[serde(default)]
    sentiment: BTreeMap<String, f64>,
    #[serde(default)]
    sensitive_topics: BTreeMap<String, f64>,
}

impl From<AnalyzeResult> for Annotation {
    fn from(result: AnalyzeResult) -> Self {
        Annotation {
            sentiment: result.sentiment,
            sensitive_topics: result.sensitive_topics,
        }
    }
}

pub struct HttpAnalyzer {
    client: Client,
    url: String,
}

impl HttpAnalyzer {
    pub fn new(url: impl Into<String>) -> Result<Self, AnalyzerError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AnalyzerError::Request(format!("http client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

fn parse_results(body: &str) -> Result<Vec<Annotation>, AnalyzerError> {
    let results: Vec<AnalyzeResult> =
        serde_json::from_str(body).map_err(|e| AnalyzerError::Response(e.to_string()))?;
    Ok(results.into_iter().map(Annotation::from).collect())
}

#[async_trait]
impl TextAnalyzer for HttpAnalyzer {
    #[instrument(skip(self, texts), fields(count = texts.len()), err)]
    async fn analyze(&self, texts: &[String]) -> Result<Vec<Annotation>, AnalyzerError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.url)
            .json(&AnalyzeRequest { texts })
            .send()
            .await
            .map_err(|e| AnalyzerError::Request(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AnalyzerError::Response(e.to_string()))?;
        if !status.is_success() {
            return Err(AnalyzerError::Request(format!("analyzer returned {status}: {body}")));
        }

        let annotations = parse_results(&body)?;
        check_len(texts.len(), &annotations)?;
        debug!(count = annotations.len(), "texts analyzed");
        Ok(annotations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_results_in_order() {
        let body = r#"[
            {"sentiment": {"positive": 0.9, "negative": 0.1}, "sensitive_topics": {"politics": 0.7}},
            {"sentiment": {"neutral": 1.0}}
        ]"#;

        let annotations = parse_results(body).unwrap();
        assert_eq!(annotations.len(), 2);
        assert_eq!(annotations[0].sentiment["positive"], 0.9);
        assert_eq!(annotations[0].sensitive_topics["politics"], 0.7);
        assert!(annotations[1].sensitive_topics.is_empty());
    }

    #[test]
    fn rejects_non_array_body() {
        let err = parse_results(r#"{"error": "model not loaded"}"#).unwrap_err();
        assert!(matches!(err, AnalyzerError::Response(_)));
    }
}
