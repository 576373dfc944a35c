//! # Ingestion pipeline
//!
//! Shared resolve/parse/normalize/deliver stages used by the three drivers:
//!
//! - [`snapshot::SnapshotDriver`]: latest result of every probe, one batch
//!   per measurement.
//! - [`historical::HistoricalDriver`]: a time range replayed window by
//!   window, one batch per window.
//! - [`live::LiveDriver`]: the result stream, buffered into `chunk_size`
//!   batches.
//!
//! Every driver run owns a [`RunContext`] holding its counters and warn-once
//! state. Runs share only the registry, the normalizer and the sink.

pub mod historical;
pub mod live;
pub mod snapshot;

use crate::document::Document;
use crate::measurement::Measurement;
use crate::metrics;
use crate::normalizer::ResultNormalizer;
use crate::registry::ProbeRegistry;
use crate::sink::{BatchSink, SubmitOptions};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Counters of one driver run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Payloads seen
    pub processed: u64,
    /// Documents produced by normalization
    pub documents: usize,
    /// Documents accepted by the sink
    pub indexed: usize,
    /// Documents rejected item by item
    pub failed_items: usize,
    /// Batches that failed as a whole
    pub failed_batches: usize,
    /// Payloads skipped because their probe is unknown
    pub unresolved: u64,
    pub parse_errors: u64,
    pub warnings_emitted: usize,
}

/// Per-run state: counters plus the probes and kinds already warned about.
#[derive(Debug, Default)]
pub struct RunContext {
    pub stats: RunStats,
    warned_probes: HashSet<String>,
    warned_kinds: HashSet<String>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a payload whose probe could not be resolved. Warns once per
    /// probe key per run.
    pub fn unresolved(&mut self, key: &str) {
        self.stats.unresolved += 1;
        if self.warned_probes.insert(key.to_string()) {
            warn!("{}:Probe not in registry, skipping its results", key);
            self.stats.warnings_emitted += 1;
            metrics::increment_unresolved_probes();
        }
    }

    /// Records a result of a kind without a dedicated normalizer. Warns once
    /// per kind per run.
    pub fn unhandled_kind(&mut self, kind: &str) {
        if self.warned_kinds.insert(kind.to_string()) {
            warn!("No normalizer for measurement type {}, indexing raw result", kind);
            self.stats.warnings_emitted += 1;
        }
    }

    pub fn parse_error(&mut self, key: &str, kind: &str, reason: &dyn std::fmt::Display) {
        warn!("{}:Could not parse {} result: {}", key, kind, reason);
        self.stats.parse_errors += 1;
        metrics::increment_parse_errors(kind);
    }
}

pub struct Ingestor {
    registry: Arc<ProbeRegistry>,
    normalizer: ResultNormalizer,
    sink: Arc<dyn BatchSink>,
    options: SubmitOptions,
    progress_every: u64,
}

impl Ingestor {
    pub fn new(
        registry: Arc<ProbeRegistry>,
        normalizer: ResultNormalizer,
        sink: Arc<dyn BatchSink>,
        options: SubmitOptions,
    ) -> Self {
        Self {
            registry,
            normalizer,
            sink,
            options,
            progress_every: 1000,
        }
    }

    pub fn with_progress_every(mut self, every: u64) -> Self {
        self.progress_every = every.max(1);
        self
    }

    pub fn options(&self) -> &SubmitOptions {
        &self.options
    }

    fn record_processed(&self, ctx: &mut RunContext) {
        ctx.stats.processed += 1;
        if ctx.stats.processed % self.progress_every == 0 {
            info!(
                "Processed {} results ({} documents, {} indexed)",
                ctx.stats.processed, ctx.stats.documents, ctx.stats.indexed
            );
        }
    }

    /// Resolves the probe, parses and normalizes one payload. Unknown probes
    /// and unparsable payloads yield no documents.
    pub async fn ingest(&self, ctx: &mut RunContext, probe_id: u32, payload: &Value) -> Vec<Document> {
        self.record_processed(ctx);

        let Some(probe) = self.registry.get(probe_id) else {
            ctx.unresolved(&probe_id.to_string());
            return Vec::new();
        };

        let measurement = match Measurement::parse(payload) {
            Ok(measurement) => measurement,
            Err(e) => {
                let kind = payload.get("type").and_then(Value::as_str).unwrap_or("unknown");
                ctx.parse_error(&probe_id.to_string(), kind, &e);
                return Vec::new();
            }
        };

        let documents = self.normalizer.normalize(&measurement, &probe, ctx).await;
        ctx.stats.documents += documents.len();
        documents
    }

    /// Like [`Ingestor::ingest`], taking the probe id from the payload's
    /// `prb_id`.
    pub async fn ingest_tagged(&self, ctx: &mut RunContext, payload: &Value) -> Vec<Document> {
        let prb_id = payload
            .get("prb_id")
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok());
        match prb_id {
            Some(prb_id) => self.ingest(ctx, prb_id, payload).await,
            None => {
                self.record_processed(ctx);
                let kind = payload.get("type").and_then(Value::as_str).unwrap_or("unknown");
                ctx.parse_error("?", kind, &"missing or invalid prb_id");
                Vec::new()
            }
        }
    }

    /// Submits one batch and returns how many documents were accepted. A
    /// failed batch counts as zero and is logged with its contents.
    pub async fn deliver(&self, ctx: &mut RunContext, batch: &[Document]) -> usize {
        if batch.is_empty() {
            debug!("Nothing to deliver");
            return 0;
        }

        match self.sink.submit(batch, &self.options).await {
            Ok(report) => {
                for item in &report.errors {
                    warn!("{}:Rejected by index: {}", item.id, item.reason);
                }
                ctx.stats.indexed += report.success;
                ctx.stats.failed_items += report.errors.len();
                metrics::increment_documents_indexed(report.success);
                metrics::increment_documents_rejected(report.errors.len());
                info!(
                    "Indexed {} of {} documents ({} rejected)",
                    report.success,
                    batch.len(),
                    report.errors.len()
                );
                report.success
            }
            Err(e) => {
                let contents = serde_json::to_string(batch)
                    .unwrap_or_else(|encode_err| format!("<unencodable batch: {}>", encode_err));
                error!(
                    "Delivery of {} documents failed: {}. Batch: {}",
                    batch.len(),
                    e,
                    contents
                );
                ctx.stats.failed_batches += 1;
                metrics::increment_batches_failed();
                0
            }
        }
    }
}
