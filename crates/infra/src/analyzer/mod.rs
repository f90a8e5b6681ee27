//! Text analysis backends used by the analysis worker.
//!
//! The models themselves live outside this workspace; an analyzer only has to
//! turn a batch of texts into one [`Annotation`] per text, in order.

use async_trait::async_trait;

use kurisu_core::Annotation;

#[cfg(feature = "http-analyzer")]
pub mod http;

#[cfg(feature = "http-analyzer")]
pub use http::HttpAnalyzer;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AnalyzerError {
    #[error("analyzer request failed: {0}")]
    Request(String),

    #[error("invalid analyzer response: {0}")]
    Response(String),

    #[error("analyzer returned {got} results for {expected} texts")]
    LengthMismatch { expected: usize, got: usize },
}

#[async_trait]
pub trait TextAnalyzer: Send + Sync {
    /// Annotate `texts`; the result has the same length and order.
    async fn analyze(&self, texts: &[String]) -> Result<Vec<Annotation>, AnalyzerError>;
}

/// Fail with [`AnalyzerError::LengthMismatch`] unless there is one annotation
/// per text.
pub fn check_len(expected: usize, annotations: &[Annotation]) -> Result<(), AnalyzerError> {
    if annotations.len() == expected {
        Ok(())
    } else {
        Err(AnalyzerError::LengthMismatch {
            expected,
            got: annotations.len(),
        })
    }
}
