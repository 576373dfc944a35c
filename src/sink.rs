//! # Batch delivery
//!
//! [`BatchSink`] is the indexing backend seam. [`ElasticsearchSink`] delivers
//! through the `_bulk` API, one NDJSON request per chunk, rotating across the
//! configured hosts.

use crate::document::Document;
use crate::error::DeliveryError;
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SubmitOptions {
    /// Used for documents without their own index
    pub index: String,
    /// Used for documents without their own type; empty sends no `_type`
    pub doc_type: String,
    pub chunk_size: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ItemError {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitReport {
    pub success: usize,
    pub errors: Vec<ItemError>,
}

impl SubmitReport {
    fn merge(&mut self, other: SubmitReport) {
        self.success += other.success;
        self.errors.extend(other.errors);
    }
}

#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Delivers `batch`. Item rejections are reported in the returned
    /// report; an `Err` means the batch as a whole failed.
    async fn submit(&self, batch: &[Document], opts: &SubmitOptions) -> Result<SubmitReport, DeliveryError>;
}

pub struct ElasticsearchSink {
    client: reqwest::Client,
    hosts: Vec<String>,
    next_host: AtomicUsize,
}

impl ElasticsearchSink {
    /// `hosts` are base URLs such as `http://localhost:9200`.
    pub fn new(hosts: Vec<String>) -> Result<Self, DeliveryError> {
        if hosts.is_empty() {
            return Err(DeliveryError::Transport {
                host: String::new(),
                reason: "no hosts configured".to_string(),
            });
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| DeliveryError::Transport {
                host: hosts[0].clone(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            hosts,
            next_host: AtomicUsize::new(0),
        })
    }

    fn next_host(&self) -> &str {
        let i = self.next_host.fetch_add(1, Ordering::Relaxed) % self.hosts.len();
        &self.hosts[i]
    }

    async fn submit_chunk(&self, chunk: &[Document], opts: &SubmitOptions) -> Result<SubmitReport, DeliveryError> {
        let host = self.next_host();
        let body = bulk_body(chunk, opts)?;
        let url = format!("{}/_bulk", host);
        debug!("Submitting {} documents to {}", chunk.len(), url);

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/x-ndjson")
            .timeout(opts.timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error(host, opts, e))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Bulk request to {} failed with HTTP {}", host, status);
            return Ok(failed_chunk(chunk, &format!("HTTP {}", status.as_u16())));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| transport_error(host, opts, e))?;
        Ok(parse_bulk_response(chunk, &payload))
    }
}

fn transport_error(host: &str, opts: &SubmitOptions, e: reqwest::Error) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Timeout {
            host: host.to_string(),
            timeout_secs: opts.timeout.as_secs(),
        }
    } else {
        DeliveryError::Transport {
            host: host.to_string(),
            reason: e.to_string(),
        }
    }
}

fn failed_chunk(chunk: &[Document], reason: &str) -> SubmitReport {
    SubmitReport {
        success: 0,
        errors: chunk
            .iter()
            .map(|doc| ItemError {
                id: doc.id.clone(),
                reason: reason.to_string(),
            })
            .collect(),
    }
}

/// NDJSON `_bulk` payload for one chunk.
pub fn bulk_body(chunk: &[Document], opts: &SubmitOptions) -> Result<String, DeliveryError> {
    let mut body = String::new();
    for doc in chunk {
        let index = if doc.index.is_empty() { &opts.index } else { &doc.index };
        let doc_type = if doc.doc_type.is_empty() { &opts.doc_type } else { &doc.doc_type };

        let mut meta = json!({"_index": index, "_id": doc.id});
        if !doc_type.is_empty() {
            meta["_type"] = json!(doc_type);
        }
        body.push_str(&serde_json::to_string(&json!({ "index": meta }))?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&doc.body)?);
        body.push('\n');
    }
    Ok(body)
}

/// Splits a `_bulk` response into accepted items and per-item rejections.
pub fn parse_bulk_response(chunk: &[Document], payload: &Value) -> SubmitReport {
    let Some(items) = payload.get("items").and_then(Value::as_array) else {
        if payload.get("errors") == Some(&Value::Bool(false)) {
            return SubmitReport {
                success: chunk.len(),
                errors: vec![],
            };
        }
        return failed_chunk(chunk, "malformed bulk response");
    };

    let mut report = SubmitReport::default();
    for (i, item) in items.iter().enumerate() {
        let result = item
            .as_object()
            .and_then(|obj| obj.values().next())
            .unwrap_or(&Value::Null);
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
        if (200..300).contains(&status) {
            report.success += 1;
            continue;
        }
        let id = result
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| chunk.get(i).map(|doc| doc.id.clone()))
            .unwrap_or_default();
        let reason = match result.get("error") {
            Some(Value::String(s)) => s.clone(),
            Some(error) => error
                .get("reason")
                .or_else(|| error.get("type"))
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string()),
            None => format!("status {}", status),
        };
        report.errors.push(ItemError { id, reason });
    }
    for doc in chunk.iter().skip(items.len()) {
        report.errors.push(ItemError {
            id: doc.id.clone(),
            reason: "missing from bulk response".to_string(),
        });
    }
    report
}

#[async_trait]
impl BatchSink for ElasticsearchSink {
    async fn submit(&self, batch: &[Document], opts: &SubmitOptions) -> Result<SubmitReport, DeliveryError> {
        let mut report = SubmitReport::default();
        for chunk in batch.chunks(opts.chunk_size.max(1)) {
            report.merge(self.submit_chunk(chunk, opts).await?);
        }
        Ok(report)
    }
}
