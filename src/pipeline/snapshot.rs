use super::{Ingestor, RunContext, RunStats};
use crate::error::FetchError;
use crate::source::AtlasApi;
use log::info;
use std::sync::Arc;

/// Indexes the latest result of every probe, one batch per measurement.
pub struct SnapshotDriver {
    source: Arc<dyn AtlasApi>,
    ingestor: Arc<Ingestor>,
}

impl SnapshotDriver {
    pub fn new(source: Arc<dyn AtlasApi>, ingestor: Arc<Ingestor>) -> Self {
        Self { source, ingestor }
    }

    pub async fn run(&self, msm_ids: &[u64]) -> Result<RunStats, FetchError> {
        let mut ctx = RunContext::new();

        for &msm_id in msm_ids {
            let latest = self.source.fetch_latest(msm_id).await?;
            info!("Measurement {}: latest results from {} probes", msm_id, latest.len());

            let mut batch = Vec::new();
            for (key, payloads) in &latest {
                let Ok(probe_id) = key.trim().parse::<u32>() else {
                    ctx.unresolved(key);
                    continue;
                };
                for payload in payloads {
                    batch.extend(self.ingestor.ingest(&mut ctx, probe_id, payload).await);
                }
            }
            self.ingestor.deliver(&mut ctx, &batch).await;
        }

        info!("Snapshot run finished: {:?}", ctx.stats);
        Ok(ctx.stats)
    }
}
