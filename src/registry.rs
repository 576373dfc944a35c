//! # Probe registry
//!
//! Process-wide set of enriched probes keyed by id, persisted to a bincode
//! cache file between runs.
//!
//! ## Refresh
//!
//! [`ProbeRegistry::refresh`] pulls the whole archive and enriches every new
//! probe with a pool of worker tasks. Workers read from one bounded queue and
//! hand finished probes to a single collector task, which is the only writer
//! of the set. Readers (`get`, `exists`) never block on a refresh.

use crate::error::{CacheError, FetchError};
use crate::lookup::MetadataLookup;
use crate::metrics;
use crate::probe::{ArchiveProbe, Probe, ProbeEnricher};
use crate::source::AtlasApi;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// On-disk layout of the cache file.
#[derive(Debug, Serialize, Deserialize)]
struct ProbeCache {
    probes: Vec<Probe>,
}

pub struct ProbeRegistry {
    source: Arc<dyn AtlasApi>,
    enricher: ProbeEnricher,
    probes: Arc<DashMap<u32, Arc<Probe>>>,
    cache_path: PathBuf,
    workers: usize,
}

impl ProbeRegistry {
    pub fn new(
        source: Arc<dyn AtlasApi>,
        lookup: Arc<dyn MetadataLookup>,
        cache_path: impl Into<PathBuf>,
        workers: usize,
    ) -> Self {
        Self {
            source,
            enricher: ProbeEnricher::new(lookup),
            probes: Arc::new(DashMap::new()),
            cache_path: cache_path.into(),
            workers: workers.max(1),
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Restores the set from the cache file and returns how many probes were
    /// loaded. A missing or undecodable cache leaves the set empty.
    pub fn load(&self) -> usize {
        let bytes = match fs::read(&self.cache_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(
                    "No probe cache at {}, starting empty",
                    self.cache_path.display()
                );
                return 0;
            }
            Err(e) => {
                warn!(
                    "Could not read probe cache {}: {}",
                    self.cache_path.display(),
                    e
                );
                return 0;
            }
        };

        let cache: ProbeCache = match bincode::deserialize(&bytes) {
            Ok(cache) => cache,
            Err(e) => {
                warn!(
                    "Probe cache {} is corrupt, starting empty: {}",
                    self.cache_path.display(),
                    e
                );
                return 0;
            }
        };

        let count = cache.probes.len();
        for probe in cache.probes {
            self.probes.insert(probe.id, Arc::new(probe));
        }
        metrics::set_registry_size(self.probes.len());
        info!(
            "Loaded {} probes from {}",
            count,
            self.cache_path.display()
        );
        count
    }

    /// Writes the durable probe records to a temp file, then renames it over
    /// the cache file.
    pub fn save(&self) -> Result<(), CacheError> {
        let mut probes: Vec<Probe> = self
            .probes
            .iter()
            .map(|entry| entry.value().as_ref().clone())
            .collect();
        probes.sort_by_key(|p| p.id);
        let bytes = bincode::serialize(&ProbeCache { probes })?;

        let tmp_path = self.cache_path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.cache_path)?;
        debug!(
            "Saved {} probes to {}",
            self.probes.len(),
            self.cache_path.display()
        );
        Ok(())
    }

    /// Fetches the archive and adds every probe not yet known. With `force`
    /// the set is cleared first. Returns the number of probes added; on a
    /// fetch failure the set is left as it was.
    pub async fn refresh(&self, force: bool) -> Result<usize, FetchError> {
        info!("Refreshing probe registry (force={})", force);
        let records = match self.source.fetch_probe_archive().await {
            Ok(records) => records,
            Err(e) => {
                error!("Could not fetch probe archive: {}", e);
                return Err(e);
            }
        };
        info!("Probe archive holds {} records", records.len());

        if force {
            self.probes.clear();
        }

        let (work_tx, work_rx) = mpsc::channel::<ArchiveProbe>(self.workers * 2);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Probe>();

        let probes = Arc::clone(&self.probes);
        let collector = tokio::spawn(async move {
            let mut added = 0usize;
            while let Some(probe) = done_rx.recv().await {
                match probes.entry(probe.id) {
                    Entry::Occupied(_) => debug!("{}:Duplicate probe dropped", probe.id),
                    Entry::Vacant(slot) => {
                        slot.insert(Arc::new(probe));
                        added += 1;
                    }
                }
            }
            added
        });

        let mut workers = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let work_rx = Arc::clone(&work_rx);
            let done_tx = done_tx.clone();
            let enricher = self.enricher.clone();
            let probes = Arc::clone(&self.probes);
            workers.push(tokio::spawn(async move {
                loop {
                    let next = work_rx.lock().await.recv().await;
                    let Some(record) = next else { break };
                    if probes.contains_key(&record.id) {
                        debug!("{}:Probe exists, skipping", record.id);
                        continue;
                    }
                    debug!("{}:Building probe", record.id);
                    let probe = enricher.enrich(record).await;
                    if done_tx.send(probe).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(done_tx);

        for raw in records {
            match serde_json::from_value::<ArchiveProbe>(raw) {
                Ok(record) => {
                    if work_tx.send(record).await.is_err() {
                        error!("All probe workers exited, stopping refresh early");
                        break;
                    }
                }
                Err(e) => warn!("Skipping undecodable probe record: {}", e),
            }
        }
        drop(work_tx);

        for worker in workers {
            if let Err(e) = worker.await {
                error!("Probe worker failed: {}", e);
            }
        }
        let added = match collector.await {
            Ok(added) => added,
            Err(e) => {
                error!("Probe collector failed: {}", e);
                0
            }
        };

        metrics::increment_probes_added(added);
        metrics::set_registry_size(self.probes.len());
        info!(
            "Probe registry refreshed: {} added, {} total",
            added,
            self.probes.len()
        );

        if let Err(e) = self.save() {
            error!(
                "Could not save probe cache {}: {}",
                self.cache_path.display(),
                e
            );
        }
        Ok(added)
    }

    pub fn get(&self, id: u32) -> Option<Arc<Probe>> {
        self.probes.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn exists(&self, id: u32) -> bool {
        self.probes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}
