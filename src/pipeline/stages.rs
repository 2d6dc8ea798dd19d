//! Collaborator contracts for the document pipeline.
//!
//! The pipeline core only owns sequencing and concurrency; extraction,
//! chunking, analysis, embedding, and summarization are external
//! collaborators behind these traits. Implementations wrap whatever PDF
//! library or AI/embedding client the application uses.

use crate::error::WorkerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Output of text extraction.
#[derive(Debug, Clone)]
pub struct ExtractedText {
    /// Full extracted text
    pub text: String,
    /// Pages in the source document
    pub page_count: usize,
}

/// One ordered piece of a document's text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// Zero-based position within the document
    pub index: usize,
    /// Chunk text
    pub text: String,
}

/// Structured analysis of one chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkAnalysis {
    /// Themes the model found in the chunk
    pub themes: Vec<String>,
    /// Notable quotes, verbatim
    pub quotes: Vec<String>,
    /// Keywords for retrieval
    pub keywords: Vec<String>,
    /// Free-form observations
    pub insights: Vec<String>,
}

/// Document-level context handed to the analyzer alongside each chunk.
#[derive(Debug, Clone)]
pub struct DocumentContext {
    /// Pipeline-assigned document identifier
    pub document_id: String,
    /// Human-facing name of the document
    pub original_name: String,
    /// Pages in the source document
    pub page_count: usize,
    /// Chunks the document was split into
    pub total_chunks: usize,
}

/// Extracts plain text from raw document bytes.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Extract text and page count from `bytes`.
    async fn extract(&self, bytes: &[u8], filename: &str) -> Result<ExtractedText, WorkerError>;
}

/// Splits extracted text into an ordered chunk list.
#[async_trait]
pub trait Chunker: Send + Sync {
    /// Chunk `text`; indices must be contiguous from zero.
    async fn chunk(&self, text: &str) -> Result<Vec<DocumentChunk>, WorkerError>;
}

/// Runs the AI analysis call for one chunk.
#[async_trait]
pub trait ChunkAnalyzer: Send + Sync {
    /// Analyze one chunk in the context of its document.
    async fn analyze(
        &self,
        chunk: &DocumentChunk,
        context: &DocumentContext,
    ) -> Result<ChunkAnalysis, WorkerError>;
}

/// Produces an embedding vector for a piece of text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed `text` into a numeric vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, WorkerError>;
}

/// Condenses per-chunk analyses into a document summary.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize the successful chunk analyses of one document.
    async fn summarize(&self, analyses: &[ChunkAnalysis]) -> Result<String, WorkerError>;
}
