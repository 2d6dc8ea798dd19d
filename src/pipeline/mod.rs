//! Document-analysis pipeline orchestrator.
//!
//! Composes three [`TaskEngine`]s — one for per-chunk analysis calls, one
//! for per-chunk embedding calls, one for whole-document fan-out — and
//! sequences extraction, chunking, parallel analysis, parallel embedding,
//! aggregation, and optional summarization, with stage-banded progress
//! reporting.
//!
//! A single chunk's analysis or embedding failure is dropped from the
//! aggregate rather than aborting the document; a single document's failure
//! is reported as its own failed report without aborting siblings.

use crate::config::PipelineConfig;
use crate::engine::{RunOptions, TaskEngine};
use crate::error::{EngineResult, WorkerError};
use crate::task::TaskReport;
use futures::stream::Stream;
use std::collections::HashMap;
use std::sync::Arc;

pub mod stages;

pub use stages::{
    ChunkAnalysis, ChunkAnalyzer, Chunker, DocumentChunk, DocumentContext, Embedder,
    ExtractedText, Summarizer, TextExtractor,
};

/// Pipeline stage, for progress reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStage {
    /// Text extraction and chunking (0–25 %)
    Extracting,
    /// Parallel per-chunk analysis (25–75 %)
    Analyzing,
    /// Parallel per-chunk embedding (75–100 %)
    Embedding,
    /// Summarization of the aggregate
    Summarizing,
    /// All stages finished
    Complete,
}

/// Progress update delivered to the caller's callback.
#[derive(Debug, Clone)]
pub struct PipelineProgress {
    /// Pipeline-assigned document identifier
    pub document_id: String,
    /// Chunks finished in the current stage
    pub current_chunk: usize,
    /// Total chunks in the document
    pub total_chunks: usize,
    /// Stage the document is in
    pub stage: ProcessingStage,
    /// Overall completion, 0.0–100.0
    pub percentage: f32,
}

/// Progress callback for pipeline runs.
pub type PipelineProgressFn = Arc<dyn Fn(PipelineProgress) + Send + Sync>;

/// Options for pipeline runs.
#[derive(Clone, Default)]
pub struct ProcessOptions {
    /// Called on every stage transition and chunk completion
    pub on_progress: Option<PipelineProgressFn>,
}

impl ProcessOptions {
    /// Attach a progress callback.
    pub fn with_progress(mut self, callback: PipelineProgressFn) -> Self {
        self.on_progress = Some(callback);
        self
    }
}

/// One document handed to the pipeline.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    /// Raw document bytes
    pub bytes: Vec<u8>,
    /// Storage filename, handed to the extractor
    pub filename: String,
    /// Human-facing name, carried into the report
    pub original_name: String,
}

/// Per-chunk results within a [`DocumentReport`].
///
/// `analysis` or `embedding` is `None` when that chunk's call failed after
/// retries; the chunk is then absent from the document aggregate.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    /// Zero-based position within the document
    pub index: usize,
    /// Chunk text
    pub text: String,
    /// Analysis, if the AI call succeeded
    pub analysis: Option<ChunkAnalysis>,
    /// Embedding vector, if the embedding call succeeded
    pub embedding: Option<Vec<f32>>,
}

/// Aggregated outcome of one document.
#[derive(Debug, Clone)]
pub struct DocumentReport {
    /// Pipeline-assigned document identifier
    pub document_id: String,
    /// Human-facing name of the document
    pub original_name: String,
    /// Pages the extractor reported
    pub page_count: usize,
    /// Chunks the document was split into
    pub total_chunks: usize,
    /// Chunks with a successful analysis
    pub analyzed_chunks: usize,
    /// Chunks with a successful embedding
    pub embedded_chunks: usize,
    /// Per-chunk results in document order
    pub chunks: Vec<ChunkResult>,
    /// Themes ranked by occurrence frequency, ties by first appearance
    pub themes: Vec<String>,
    /// Keywords ranked by occurrence frequency, ties by first appearance
    pub keywords: Vec<String>,
    /// Quotes, deduplicated in first-seen order
    pub quotes: Vec<String>,
    /// Insights, deduplicated in first-seen order
    pub insights: Vec<String>,
    /// Document summary, when a summarizer ran successfully
    pub summary: Option<String>,
}

/// Collaborators plus the chunk-level engines, shared between the pipeline
/// handle and the document-level fan-out workers.
struct PipelineInner {
    config: PipelineConfig,
    extractor: Arc<dyn TextExtractor>,
    chunker: Arc<dyn Chunker>,
    analyzer: Arc<dyn ChunkAnalyzer>,
    embedder: Arc<dyn Embedder>,
    summarizer: Option<Arc<dyn Summarizer>>,
    analysis_engine: TaskEngine<DocumentChunk>,
    embedding_engine: TaskEngine<String>,
}

/// Multi-stage document-analysis pipeline.
///
/// Holds no ambient global state: construct one explicitly with its
/// collaborators and pass it around.
pub struct DocumentPipeline {
    inner: Arc<PipelineInner>,
    document_engine: TaskEngine<DocumentInput>,
}

impl DocumentPipeline {
    /// Build a pipeline from a validated configuration and its
    /// collaborators. Pass `None` for the summarizer to skip that stage.
    pub fn new(
        config: PipelineConfig,
        extractor: Arc<dyn TextExtractor>,
        chunker: Arc<dyn Chunker>,
        analyzer: Arc<dyn ChunkAnalyzer>,
        embedder: Arc<dyn Embedder>,
        summarizer: Option<Arc<dyn Summarizer>>,
    ) -> EngineResult<Self> {
        let analysis_engine = TaskEngine::new(config.analysis.clone())?;
        let embedding_engine = TaskEngine::new(config.embedding.clone())?;
        let document_engine = TaskEngine::new(config.documents.clone())?;

        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                extractor,
                chunker,
                analyzer,
                embedder,
                summarizer,
                analysis_engine,
                embedding_engine,
            }),
            document_engine,
        })
    }

    /// Run one document through every stage.
    ///
    /// Stage failures (extraction, chunking) fail the document; per-chunk
    /// failures are dropped from the aggregate.
    pub async fn process_single_document(
        &self,
        input: DocumentInput,
        options: &ProcessOptions,
    ) -> Result<DocumentReport, WorkerError> {
        self.inner.process_document(input, options).await
    }

    /// Fan a set of documents across the document-level engine.
    ///
    /// Two-level fan-out: documents in parallel, chunks within each
    /// document in parallel. Resolves once every document has a terminal
    /// report; check each report's outcome.
    pub async fn process_documents(
        &self,
        documents: Vec<DocumentInput>,
        options: ProcessOptions,
    ) -> EngineResult<Vec<TaskReport<DocumentReport>>> {
        let worker = self.document_worker(options);
        self.document_engine
            .run_all(documents, worker, RunOptions::default().preserve_order())
            .await
    }

    /// Like [`process_documents`](Self::process_documents), yielding each
    /// document's report as it completes.
    pub async fn process_document_stream(
        &self,
        documents: Vec<DocumentInput>,
        options: ProcessOptions,
    ) -> EngineResult<impl Stream<Item = TaskReport<DocumentReport>> + Send> {
        let worker = self.document_worker(options);
        self.document_engine.run_stream(documents, worker).await
    }

    /// Snapshot of the document-level engine's metrics.
    pub async fn metrics(&self) -> crate::engine::MetricsSnapshot {
        self.document_engine.metrics().await
    }

    /// Shut all three engines down. Idempotent.
    pub async fn shutdown(&self) {
        self.document_engine.shutdown().await;
        self.inner.analysis_engine.shutdown().await;
        self.inner.embedding_engine.shutdown().await;
    }

    fn document_worker(
        &self,
        options: ProcessOptions,
    ) -> impl Fn(DocumentInput) -> futures::future::BoxFuture<'static, Result<DocumentReport, WorkerError>>
    + Send
    + Sync
    + 'static {
        let inner = Arc::clone(&self.inner);
        move |document| {
            let inner = Arc::clone(&inner);
            let options = options.clone();
            Box::pin(async move { inner.process_document(document, &options).await })
        }
    }
}

impl PipelineInner {
    async fn process_document(
        &self,
        input: DocumentInput,
        options: &ProcessOptions,
    ) -> Result<DocumentReport, WorkerError> {
        let document_id = uuid::Uuid::new_v4().to_string();
        tracing::info!("processing document {} ({})", document_id, input.original_name);

        // Stage 1: extraction + chunking, 0–25 %.
        emit(options, &document_id, 0, 0, ProcessingStage::Extracting, 0.0);
        let extracted = self.extractor.extract(&input.bytes, &input.filename).await?;
        let chunks = self.chunker.chunk(&extracted.text).await?;
        let total_chunks = chunks.len();
        emit(
            options,
            &document_id,
            0,
            total_chunks,
            ProcessingStage::Extracting,
            25.0,
        );
        tracing::debug!(
            "document {}: {} pages, {} chunks",
            document_id,
            extracted.page_count,
            total_chunks
        );

        let context = Arc::new(DocumentContext {
            document_id: document_id.clone(),
            original_name: input.original_name.clone(),
            page_count: extracted.page_count,
            total_chunks,
        });

        // Stage 2: parallel analysis, 25–75 % linear in completed chunks.
        let analyzer = Arc::clone(&self.analyzer);
        let analysis_context = Arc::clone(&context);
        let analysis_reports = self
            .analysis_engine
            .run_all(
                chunks.clone(),
                move |chunk| {
                    let analyzer = Arc::clone(&analyzer);
                    let context = Arc::clone(&analysis_context);
                    async move { analyzer.analyze(&chunk, &context).await }
                },
                stage_options(options, &document_id, total_chunks, ProcessingStage::Analyzing, 25.0),
            )
            .await
            .map_err(|error| WorkerError::permanent(format!("analysis dispatch: {error}")))?;

        // Stage 3: parallel embedding, 75–100 %.
        let embedder = Arc::clone(&self.embedder);
        let chunk_texts: Vec<String> = chunks.iter().map(|chunk| chunk.text.clone()).collect();
        let embedding_reports = self
            .embedding_engine
            .run_all(
                chunk_texts,
                move |text| {
                    let embedder = Arc::clone(&embedder);
                    async move { embedder.embed(&text).await }
                },
                stage_options(options, &document_id, total_chunks, ProcessingStage::Embedding, 75.0),
            )
            .await
            .map_err(|error| WorkerError::permanent(format!("embedding dispatch: {error}")))?;

        // Stage 4: aggregation. Failed chunks drop out; siblings survive.
        let mut chunk_results = Vec::with_capacity(total_chunks);
        for (position, chunk) in chunks.into_iter().enumerate() {
            let analysis = analysis_reports
                .get(position)
                .and_then(|report| report.output().cloned());
            let embedding = embedding_reports
                .get(position)
                .and_then(|report| report.output().cloned());
            chunk_results.push(ChunkResult {
                index: chunk.index,
                text: chunk.text,
                analysis,
                embedding,
            });
        }

        let analyses: Vec<&ChunkAnalysis> = chunk_results
            .iter()
            .filter_map(|chunk| chunk.analysis.as_ref())
            .collect();
        let analyzed_chunks = analyses.len();
        let embedded_chunks = chunk_results
            .iter()
            .filter(|chunk| chunk.embedding.is_some())
            .count();

        let themes = rank_by_frequency(analyses.iter().flat_map(|a| a.themes.iter().cloned()));
        let keywords = rank_by_frequency(analyses.iter().flat_map(|a| a.keywords.iter().cloned()));
        let quotes = dedupe_first_seen(analyses.iter().flat_map(|a| a.quotes.iter().cloned()));
        let insights = dedupe_first_seen(analyses.iter().flat_map(|a| a.insights.iter().cloned()));

        // Stage 5: optional summarization over the surviving analyses.
        let summary = match (&self.summarizer, self.config.summarize) {
            (Some(summarizer), true) if analyzed_chunks > 0 => {
                emit(
                    options,
                    &document_id,
                    total_chunks,
                    total_chunks,
                    ProcessingStage::Summarizing,
                    100.0,
                );
                let owned: Vec<ChunkAnalysis> = analyses.iter().map(|a| (*a).clone()).collect();
                match summarizer.summarize(&owned).await {
                    Ok(summary) => Some(summary),
                    Err(error) => {
                        tracing::warn!("document {} summarization failed: {}", document_id, error);
                        None
                    }
                }
            }
            _ => None,
        };

        emit(
            options,
            &document_id,
            total_chunks,
            total_chunks,
            ProcessingStage::Complete,
            100.0,
        );
        tracing::info!(
            "document {} complete: {}/{} analyzed, {}/{} embedded",
            document_id,
            analyzed_chunks,
            total_chunks,
            embedded_chunks,
            total_chunks
        );

        Ok(DocumentReport {
            document_id,
            original_name: input.original_name,
            page_count: extracted.page_count,
            total_chunks,
            analyzed_chunks,
            embedded_chunks,
            chunks: chunk_results,
            themes,
            keywords,
            quotes,
            insights,
            summary,
        })
    }
}

/// Send a progress update, if the caller asked for them.
fn emit(
    options: &ProcessOptions,
    document_id: &str,
    current_chunk: usize,
    total_chunks: usize,
    stage: ProcessingStage,
    percentage: f32,
) {
    if let Some(on_progress) = &options.on_progress {
        on_progress(PipelineProgress {
            document_id: document_id.to_string(),
            current_chunk,
            total_chunks,
            stage,
            percentage,
        });
    }
}

/// Engine run options for one chunk-parallel stage: preserve document order
/// and map engine progress into this stage's percentage band (each band
/// spans 50 or 25 points, linear in completed/total).
fn stage_options(
    options: &ProcessOptions,
    document_id: &str,
    total_chunks: usize,
    stage: ProcessingStage,
    band_start: f32,
) -> RunOptions {
    let run = RunOptions::default().preserve_order();
    let Some(on_progress) = options.on_progress.clone() else {
        return run;
    };

    let document_id = document_id.to_string();
    let band_width = match stage {
        ProcessingStage::Analyzing => 50.0,
        _ => 25.0,
    };
    run.with_progress(Arc::new(move |completed, total| {
        let fraction = if total == 0 {
            1.0
        } else {
            completed as f32 / total as f32
        };
        on_progress(PipelineProgress {
            document_id: document_id.clone(),
            current_chunk: completed,
            total_chunks,
            stage,
            percentage: band_start + band_width * fraction,
        });
    }))
}

/// Deduplicate and rank by occurrence frequency descending, ties broken by
/// first-seen order.
fn rank_by_frequency(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut order = 0usize;
    for value in values {
        let entry = counts.entry(value).or_insert_with(|| {
            let slot = (0, order);
            order += 1;
            slot
        });
        entry.0 += 1;
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.0.cmp(&a.1.0).then(a.1.1.cmp(&b.1.1)));
    ranked.into_iter().map(|(value, _)| value).collect()
}

/// Deduplicate preserving first-seen order.
fn dedupe_first_seen(values: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.clone()))
        .collect()
}
