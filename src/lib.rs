//! # Atlas Indexer
//!
//! Ingests RIPE Atlas measurement results (DNS lookups, traceroutes and any
//! other kind), enriches them with probe metadata and delivers them in
//! bounded batches to an Elasticsearch-compatible bulk API.
//!
//! ## Overview
//!
//! Data flows one way:
//!
//! - **Probes**: the archive is enriched once (location, ASN holders, prefix
//!   lengths, registries) and cached on disk
//! - **Normalization**: nested, type specific results are flattened into
//!   uniform documents
//! - **Delivery**: documents are chunked and submitted, tolerating partial
//!   failure
//!
//! ## Architecture
//!
//! ### Probe Layer
//! [`registry::ProbeRegistry`] owns the probe set and refreshes it with a
//! worker pool. Enrichment goes through the [`lookup::MetadataLookup`] seam.
//!
//! ### Normalization Layer
//! [`measurement::Measurement`] is the typed view of a raw payload;
//! [`normalizer::ResultNormalizer`] turns it into [`document::Document`]s.
//!
//! ### Pipeline Layer
//! Snapshot, historical replay and live stream drivers share the
//! [`pipeline::Ingestor`] stages and report [`pipeline::RunStats`].

// Core Types
/// Error types per failure mode
pub mod error;
/// Probe records and enrichment
pub mod probe;
/// Typed measurement results
pub mod measurement;
/// Indexable documents and stable ids
pub mod document;

// Sources & Lookups
/// Atlas REST and stream clients
pub mod source;
/// RIPEstat and country metadata lookups
pub mod lookup;

// Processing
/// Probe registry with concurrent refresh and on-disk cache
pub mod registry;
/// DNS wire-format decoding for `abuf`
pub mod dns_wire;
/// Result normalization per measurement type
pub mod normalizer;
/// Ingestion drivers
pub mod pipeline;

// Delivery
/// Batch sink and Elasticsearch bulk adapter
pub mod sink;

// Infrastructure
/// Metrics and observability
pub mod metrics;
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use document::Document;
pub use measurement::Measurement;
pub use normalizer::ResultNormalizer;
pub use pipeline::{Ingestor, RunStats};
pub use registry::ProbeRegistry;
pub use settings::Settings;
pub use sink::{BatchSink, ElasticsearchSink};
