use super::{Ingestor, RunContext, RunStats};
use crate::error::FetchError;
use crate::source::ResultStream;
use futures::StreamExt;
use log::info;
use std::sync::Arc;

/// Indexes streamed results. All subscribed measurements share one buffer
/// that is delivered every `chunk_size` documents.
pub struct LiveDriver {
    stream: Arc<dyn ResultStream>,
    ingestor: Arc<Ingestor>,
}

impl LiveDriver {
    pub fn new(stream: Arc<dyn ResultStream>, ingestor: Arc<Ingestor>) -> Self {
        Self { stream, ingestor }
    }

    /// Runs until the stream ends, then delivers whatever is still buffered.
    pub async fn run(&self, msm_ids: &[u64]) -> Result<RunStats, FetchError> {
        let chunk_size = self.ingestor.options().chunk_size.max(1);
        let mut ctx = RunContext::new();
        let mut events = self.stream.subscribe(msm_ids).await?;
        let mut buffer = Vec::with_capacity(chunk_size);
        info!("Streaming results of {:?}", msm_ids);

        while let Some(event) = events.next().await {
            buffer.extend(self.ingestor.ingest_tagged(&mut ctx, &event).await);
            while buffer.len() >= chunk_size {
                let batch: Vec<_> = buffer.drain(..chunk_size).collect();
                self.ingestor.deliver(&mut ctx, &batch).await;
            }
        }

        info!("Result stream ended with {} buffered documents", buffer.len());
        if !buffer.is_empty() {
            self.ingestor.deliver(&mut ctx, &buffer).await;
        }
        Ok(ctx.stats)
    }
}
