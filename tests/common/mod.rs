//! In-memory fakes of every external seam.

#![allow(dead_code)]

use async_trait::async_trait;
use atlas_indexer::error::{DeliveryError, FetchError, LookupError};
use atlas_indexer::lookup::{AsnOrigin, Location, MetadataLookup};
use atlas_indexer::normalizer::ResultNormalizer;
use atlas_indexer::pipeline::Ingestor;
use atlas_indexer::registry::ProbeRegistry;
use atlas_indexer::sink::{BatchSink, ItemError, SubmitOptions, SubmitReport};
use atlas_indexer::source::{AtlasApi, MeasurementInfo, ResultStream};
use atlas_indexer::Document;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
pub struct FakeAtlas {
    pub archive: Vec<Value>,
    pub latest: HashMap<u64, BTreeMap<String, Vec<Value>>>,
    pub start_time: Option<i64>,
    /// Every historical result; `fetch_results` filters by timestamp
    pub results: Vec<Value>,
    pub windows: Mutex<Vec<(i64, i64)>>,
    pub fail_results: AtomicBool,
}

#[async_trait]
impl AtlasApi for FakeAtlas {
    async fn fetch_probe_archive(&self) -> Result<Vec<Value>, FetchError> {
        Ok(self.archive.clone())
    }

    async fn fetch_latest(&self, msm_id: u64) -> Result<BTreeMap<String, Vec<Value>>, FetchError> {
        self.latest
            .get(&msm_id)
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: format!("latest/{}", msm_id),
                status: 404,
            })
    }

    async fn fetch_measurement(&self, msm_id: u64) -> Result<MeasurementInfo, FetchError> {
        Ok(MeasurementInfo {
            id: msm_id,
            start_time: self.start_time,
        })
    }

    async fn fetch_results(&self, msm_id: u64, start: i64, stop: i64) -> Result<Vec<Value>, FetchError> {
        if self.fail_results.load(Ordering::SeqCst) {
            return Err(FetchError::Stream(format!("results of {} unavailable", msm_id)));
        }
        self.windows.lock().unwrap().push((start, stop));
        Ok(self
            .results
            .iter()
            .filter(|r| {
                let ts = r["timestamp"].as_i64().unwrap_or(-1);
                ts >= start && ts <= stop
            })
            .cloned()
            .collect())
    }
}

pub struct FakeStream {
    pub events: Vec<Value>,
}

#[async_trait]
impl ResultStream for FakeStream {
    async fn subscribe(&self, _msm_ids: &[u64]) -> Result<BoxStream<'static, Value>, FetchError> {
        Ok(stream::iter(self.events.clone()).boxed())
    }
}

#[derive(Default)]
pub struct FakeLookup {
    pub origins: HashMap<IpAddr, AsnOrigin>,
}

#[async_trait]
impl MetadataLookup for FakeLookup {
    async fn location(&self, _code: &str) -> Result<Location, LookupError> {
        Ok(Location {
            country: "Netherlands".to_string(),
            region: Some("Europe".to_string()),
            subregion: Some("Western Europe".to_string()),
        })
    }

    async fn asn_holder(&self, asn: u32) -> Result<Option<String>, LookupError> {
        Ok(Some(format!("AS{}", asn)))
    }

    async fn registry_authorities(&self, _prefix: &str) -> Result<Vec<String>, LookupError> {
        Ok(vec!["ripe".to_string()])
    }

    async fn origin_asns(&self, addresses: &[IpAddr]) -> Result<HashMap<IpAddr, AsnOrigin>, LookupError> {
        Ok(addresses
            .iter()
            .filter_map(|ip| self.origins.get(ip).map(|o| (*ip, o.clone())))
            .collect())
    }
}

/// Records every submitted batch. Calls listed in `timeout_calls` fail with
/// a timeout; ids in `reject` are refused item by item.
#[derive(Default)]
pub struct MemorySink {
    pub batches: Mutex<Vec<Vec<Document>>>,
    pub timeout_calls: HashSet<usize>,
    pub reject: HashSet<String>,
    pub calls: Mutex<usize>,
}

impl MemorySink {
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }
}

#[async_trait]
impl BatchSink for MemorySink {
    async fn submit(&self, batch: &[Document], opts: &SubmitOptions) -> Result<SubmitReport, DeliveryError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            *calls - 1
        };
        if self.timeout_calls.contains(&call) {
            return Err(DeliveryError::Timeout {
                host: "memory".to_string(),
                timeout_secs: opts.timeout.as_secs(),
            });
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        let errors: Vec<ItemError> = batch
            .iter()
            .filter(|doc| self.reject.contains(&doc.id))
            .map(|doc| ItemError {
                id: doc.id.clone(),
                reason: "mapper_parsing_exception".to_string(),
            })
            .collect();
        Ok(SubmitReport {
            success: batch.len() - errors.len(),
            errors,
        })
    }
}

pub fn probe_record(id: u32) -> Value {
    json!({
        "id": id, "asn_v4": 3333, "prefix_v4": "193.0.0.0/21",
        "country_code": "NL", "latitude": 52.3, "longitude": 4.9,
        "status_name": "Connected", "tags": ["system-ipv4-works"]
    })
}

pub fn dns_result(msm_id: u64, prb_id: u32, timestamp: i64) -> Value {
    json!({
        "type": "dns", "msm_id": msm_id, "prb_id": prb_id, "timestamp": timestamp,
        "from": "192.0.2.10", "af": 4, "dst_addr": "193.0.14.129", "proto": "UDP",
        "fw": 4790, "lts": 20,
        "result": {"rt": 12.5, "size": 45, "ANCOUNT": 1}
    })
}

pub struct Harness {
    pub atlas: Arc<FakeAtlas>,
    pub sink: Arc<MemorySink>,
    pub ingestor: Arc<Ingestor>,
    _dir: TempDir,
}

/// Builds an ingestor whose registry holds the probes of `atlas.archive`.
pub async fn harness(atlas: FakeAtlas, sink: MemorySink, chunk_size: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let atlas = Arc::new(atlas);
    let sink = Arc::new(sink);
    let lookup: Arc<dyn MetadataLookup> = Arc::new(FakeLookup::default());

    let registry = Arc::new(ProbeRegistry::new(
        atlas.clone(),
        lookup.clone(),
        dir.path().join("probes.bin"),
        4,
    ));
    registry.refresh(false).await.unwrap();

    let options = SubmitOptions {
        index: "atlas-test".to_string(),
        doc_type: String::new(),
        chunk_size,
        timeout: Duration::from_secs(5),
    };
    let normalizer = ResultNormalizer::new(lookup, "atlas-test", "");
    let ingestor = Arc::new(Ingestor::new(registry, normalizer, sink.clone(), options));

    Harness {
        atlas,
        sink,
        ingestor,
        _dir: dir,
    }
}
