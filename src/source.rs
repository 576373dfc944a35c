//! # Measurement source
//!
//! [`AtlasApi`] covers the request/response side of the Atlas API (probe
//! archive, latest results, historical results, measurement metadata);
//! [`ResultStream`] covers the push feed. [`AtlasClient`] and
//! [`AtlasStream`] are the HTTP and websocket adapters.

use crate::error::FetchError;
use crate::settings::Atlas as AtlasSettings;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Measurement metadata needed to bound a historical replay.
#[derive(Debug, Clone, Deserialize)]
pub struct MeasurementInfo {
    #[serde(alias = "msm_id")]
    pub id: u64,
    /// Creation / start time, epoch seconds
    #[serde(default)]
    pub start_time: Option<i64>,
}

#[async_trait]
pub trait AtlasApi: Send + Sync {
    /// Every probe record of the archive, undecoded.
    async fn fetch_probe_archive(&self) -> Result<Vec<Value>, FetchError>;

    /// Latest results of a measurement keyed by probe id.
    async fn fetch_latest(&self, msm_id: u64) -> Result<BTreeMap<String, Vec<Value>>, FetchError>;

    async fn fetch_measurement(&self, msm_id: u64) -> Result<MeasurementInfo, FetchError>;

    /// Results reported in `[start, stop]`, each tagged with `prb_id`.
    async fn fetch_results(&self, msm_id: u64, start: i64, stop: i64)
        -> Result<Vec<Value>, FetchError>;
}

#[async_trait]
pub trait ResultStream: Send + Sync {
    /// Subscribes to results of every measurement in `msm_ids`. The stream
    /// ends when the underlying subscription ends.
    async fn subscribe(&self, msm_ids: &[u64]) -> Result<BoxStream<'static, Value>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct ArchivePage {
    #[serde(alias = "results")]
    objects: Vec<Value>,
}

/// HTTP adapter for the Atlas REST API.
pub struct AtlasClient {
    client: reqwest::Client,
    probe_archive_url: String,
    latest_url: String,
    measurement_url: String,
}

impl AtlasClient {
    pub fn new(settings: &AtlasSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_seconds))
            .build()
            .map_err(|source| FetchError::Http {
                url: settings.probe_archive_url.clone(),
                source,
            })?;
        Ok(Self {
            client,
            probe_archive_url: settings.probe_archive_url.clone(),
            latest_url: settings.latest_url.trim_end_matches('/').to_string(),
            measurement_url: settings.measurement_url.trim_end_matches('/').to_string(),
        })
    }

    /// Overrides the latest/results/metadata endpoints (the CLI `--url`).
    pub fn with_measurement_urls(mut self, latest: Option<String>, measurement: Option<String>) -> Self {
        if let Some(latest) = latest {
            self.latest_url = latest.trim_end_matches('/').to_string();
        }
        if let Some(measurement) = measurement {
            self.measurement_url = measurement.trim_end_matches('/').to_string();
        }
        self
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        info!("fetching {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| FetchError::Http {
                url: url.to_string(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }
        let body = response.json::<T>().await.map_err(|e| FetchError::Decode {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        info!("fetched {}", url);
        Ok(body)
    }
}

#[async_trait]
impl AtlasApi for AtlasClient {
    async fn fetch_probe_archive(&self) -> Result<Vec<Value>, FetchError> {
        let page: ArchivePage = self.get_json(&self.probe_archive_url).await?;
        Ok(page.objects)
    }

    async fn fetch_latest(&self, msm_id: u64) -> Result<BTreeMap<String, Vec<Value>>, FetchError> {
        let url = format!("{}/{}/", self.latest_url, msm_id);
        self.get_json(&url).await
    }

    async fn fetch_measurement(&self, msm_id: u64) -> Result<MeasurementInfo, FetchError> {
        let url = format!("{}/{}/", self.measurement_url, msm_id);
        self.get_json(&url).await
    }

    async fn fetch_results(
        &self,
        msm_id: u64,
        start: i64,
        stop: i64,
    ) -> Result<Vec<Value>, FetchError> {
        let base = format!("{}/{}/result/", self.measurement_url, msm_id);
        let url = Url::parse_with_params(
            &base,
            &[("start", start.to_string()), ("stop", stop.to_string())],
        )
        .map_err(|e| FetchError::Decode {
            url: base.clone(),
            reason: e.to_string(),
        })?;
        self.get_json(url.as_str()).await
    }
}

/// Websocket adapter for the Atlas result stream.
///
/// Speaks the `["event", payload]` framing: it sends one `atlas_subscribe`
/// per measurement and yields the payload of every `atlas_result`.
pub struct AtlasStream {
    url: String,
}

impl AtlasStream {
    pub fn new(settings: &AtlasSettings) -> Self {
        Self {
            url: settings.stream_url.clone(),
        }
    }
}

pub fn subscribe_message(msm_id: u64) -> String {
    serde_json::json!(["atlas_subscribe", {"streamType": "result", "msm": msm_id}]).to_string()
}

/// Extracts the result payload from one stream frame.
pub fn result_from_frame(text: &str) -> Option<Value> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!("Ignoring non-JSON stream frame: {}", e);
            return None;
        }
    };
    let event = frame.get(0).and_then(Value::as_str)?;
    match event {
        "atlas_result" => frame.get(1).cloned(),
        "atlas_error" => {
            warn!("Atlas stream error: {}", frame.get(1).unwrap_or(&Value::Null));
            None
        }
        other => {
            debug!("Ignoring stream event {}", other);
            None
        }
    }
}

#[async_trait]
impl ResultStream for AtlasStream {
    async fn subscribe(&self, msm_ids: &[u64]) -> Result<BoxStream<'static, Value>, FetchError> {
        info!("Connecting to Atlas stream: {}", self.url);
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FetchError::Stream(format!("connect {}: {}", self.url, e)))?;
        let (mut write, read) = ws_stream.split();

        for &msm_id in msm_ids {
            write
                .send(Message::Text(subscribe_message(msm_id)))
                .await
                .map_err(|e| FetchError::Stream(format!("subscribe {}: {}", msm_id, e)))?;
            info!("Subscribed to measurement {}", msm_id);
        }

        // The write half lives as long as the stream so the socket stays open.
        let stream = read
            .take_while(|msg| {
                let keep_going = match msg {
                    Ok(Message::Close(_)) => {
                        warn!("Atlas stream closed by server");
                        false
                    }
                    Err(e) => {
                        warn!("Atlas stream error: {}", e);
                        false
                    }
                    _ => true,
                };
                futures::future::ready(keep_going)
            })
            .filter_map(move |msg| {
                let _keepalive = &write;
                let payload = match msg {
                    Ok(Message::Text(text)) => result_from_frame(&text),
                    _ => None,
                };
                futures::future::ready(payload)
            });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_message_shape() {
        let msg: Value = serde_json::from_str(&subscribe_message(1001)).unwrap();
        assert_eq!(msg[0], "atlas_subscribe");
        assert_eq!(msg[1]["msm"], 1001);
        assert_eq!(msg[1]["streamType"], "result");
    }

    #[test]
    fn test_result_from_frame() {
        let frame = r#"["atlas_result", {"type": "dns", "prb_id": 5, "msm_id": 10}]"#;
        let payload = result_from_frame(frame).unwrap();
        assert_eq!(payload["prb_id"], 5);

        assert!(result_from_frame(r#"["atlas_subscribed", {"msm": 10}]"#).is_none());
        assert!(result_from_frame("not json").is_none());
    }

    #[test]
    fn test_archive_page_accepts_results_alias() {
        let page: ArchivePage = serde_json::from_str(r#"{"results": [{"id": 1}]}"#).unwrap();
        assert_eq!(page.objects.len(), 1);
        let page: ArchivePage = serde_json::from_str(r#"{"objects": [], "meta": {}}"#).unwrap();
        assert!(page.objects.is_empty());
    }

    #[test]
    fn test_measurement_info_decodes() {
        let info: MeasurementInfo =
            serde_json::from_str(r#"{"id": 10001, "start_time": 1400000000, "type": {"name": "dns"}}"#)
                .unwrap();
        assert_eq!(info.id, 10001);
        assert_eq!(info.start_time, Some(1400000000));
    }
}
