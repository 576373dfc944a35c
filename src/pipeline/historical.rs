use super::{Ingestor, RunContext, RunStats};
use crate::error::FetchError;
use crate::source::AtlasApi;
use chrono::Utc;
use log::info;
use std::sync::Arc;

/// Replay windows `[a, a + period]` covering `[start, stop)`. Each window
/// starts one second after the previous one ends; the last window is not
/// clamped to `stop`.
pub fn windows(start: i64, stop: i64, period: i64) -> Vec<(i64, i64)> {
    let period = period.max(1);
    let mut out = Vec::new();
    let mut a = start;
    while a < stop {
        out.push((a, a + period));
        a += period + 1;
    }
    out
}

/// Replays a time range of results, one batch per window.
pub struct HistoricalDriver {
    source: Arc<dyn AtlasApi>,
    ingestor: Arc<Ingestor>,
    start: i64,
    stop: i64,
    period: i64,
    now: i64,
}

impl HistoricalDriver {
    pub fn new(source: Arc<dyn AtlasApi>, ingestor: Arc<Ingestor>, start: i64, stop: i64, period: i64) -> Self {
        Self {
            source,
            ingestor,
            start,
            stop,
            period,
            now: Utc::now().timestamp(),
        }
    }

    /// Overrides the upper bound captured at construction.
    pub fn with_now(mut self, now: i64) -> Self {
        self.now = now;
        self
    }

    pub async fn run(&self, msm_ids: &[u64]) -> Result<RunStats, FetchError> {
        let mut ctx = RunContext::new();

        for &msm_id in msm_ids {
            let info = self.source.fetch_measurement(msm_id).await?;
            let start = self.start.max(info.start_time.unwrap_or(self.start));
            let stop = self.stop.min(self.now);
            let plan = windows(start, stop, self.period);
            info!(
                "Measurement {}: replaying {} -> {} in {} windows",
                msm_id,
                start,
                stop,
                plan.len()
            );

            for (a, b) in plan {
                let results = self.source.fetch_results(msm_id, a, b).await?;
                info!("Measurement {}: {} results in [{}, {}]", msm_id, results.len(), a, b);

                let mut batch = Vec::new();
                for payload in &results {
                    batch.extend(self.ingestor.ingest_tagged(&mut ctx, payload).await);
                }
                self.ingestor.deliver(&mut ctx, &batch).await;
            }
        }

        info!("Historical run finished: {:?}", ctx.stats);
        Ok(ctx.stats)
    }
}
