use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Atlas {
    #[serde(default = "default_probe_archive_url")]
    pub probe_archive_url: String,
    #[serde(default = "default_latest_url")]
    pub latest_url: String,
    #[serde(default = "default_measurement_url")]
    pub measurement_url: String,
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_probe_archive_url() -> String {
    "https://atlas.ripe.net/api/v1/probe-archive/?format=json".to_string()
}
fn default_latest_url() -> String {
    "https://atlas.ripe.net/api/v1/measurement-latest".to_string()
}
fn default_measurement_url() -> String {
    "https://atlas.ripe.net/api/v1/measurement".to_string()
}
fn default_stream_url() -> String {
    "wss://atlas-stream.ripe.net/stream/".to_string()
}
fn default_request_timeout_seconds() -> u64 {
    30
}

impl Default for Atlas {
    fn default() -> Self {
        Self {
            probe_archive_url: default_probe_archive_url(),
            latest_url: default_latest_url(),
            measurement_url: default_measurement_url(),
            stream_url: default_stream_url(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Lookup {
    #[serde(default = "default_ripestat_url")]
    pub ripestat_url: String,
    #[serde(default = "default_country_url")]
    pub country_url: String,
    /// Identifies this client to RIPEstat (`sourceapp` query parameter)
    #[serde(default = "default_sourceapp")]
    pub sourceapp: String,
    #[serde(default = "default_request_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Parallel requests used to resolve one batch of traceroute origins
    #[serde(default = "default_origin_concurrency")]
    pub origin_concurrency: usize,
}

fn default_ripestat_url() -> String {
    "https://stat.ripe.net/data".to_string()
}
fn default_country_url() -> String {
    "https://restcountries.com/v2/alpha".to_string()
}
fn default_sourceapp() -> String {
    "atlas-indexer".to_string()
}
fn default_origin_concurrency() -> usize {
    8
}

impl Default for Lookup {
    fn default() -> Self {
        Self {
            ripestat_url: default_ripestat_url(),
            country_url: default_country_url(),
            sourceapp: default_sourceapp(),
            timeout_seconds: default_request_timeout_seconds(),
            origin_concurrency: default_origin_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Probes {
    #[serde(default = "default_cache_file")]
    pub cache_file: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_cache_file() -> String {
    "probes.bin".to_string()
}
fn default_workers() -> usize {
    200
}

impl Default for Probes {
    fn default() -> Self {
        Self {
            cache_file: default_cache_file(),
            workers: default_workers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Sink {
    /// `host[:port]` entries; port defaults to 9200
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    #[serde(default = "default_index")]
    pub index: String,
    /// Empty means "derive from the measurement kind"
    #[serde(default)]
    pub doc_type: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_submit_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_hosts() -> Vec<String> {
    vec!["localhost:9200".to_string()]
}
fn default_index() -> String {
    "atlas-index".to_string()
}
fn default_chunk_size() -> usize {
    200
}
fn default_submit_timeout_seconds() -> u64 {
    60
}

impl Default for Sink {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            index: default_index(),
            doc_type: String::new(),
            chunk_size: default_chunk_size(),
            timeout_seconds: default_submit_timeout_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Pipeline {
    /// Historical replay window size in seconds
    #[serde(default = "default_chunk_period")]
    pub chunk_period: i64,
    #[serde(default = "default_start_time")]
    pub start_time: i64,
    #[serde(default = "default_stop_time")]
    pub stop_time: i64,
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

fn default_chunk_period() -> i64 {
    86_400
}
fn default_start_time() -> i64 {
    1_262_304_000 // 2010-01-01
}
fn default_stop_time() -> i64 {
    4_102_444_800 // 2100-01-01
}
fn default_progress_every() -> u64 {
    1000
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            chunk_period: default_chunk_period(),
            start_time: default_start_time(),
            stop_time: default_stop_time(),
            progress_every: default_progress_every(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub atlas: Atlas,
    #[serde(default)]
    pub lookup: Lookup,
    #[serde(default)]
    pub probes: Probes,
    #[serde(default)]
    pub sink: Sink,
    #[serde(default)]
    pub pipeline: Pipeline,
}

impl Settings {
    /// Loads `Config.toml` (optional) and `ATLAS__SECTION__KEY` variables
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .add_source(Environment::with_prefix("ATLAS").separator("__"))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Comma or JSON list, same format the CLI accepts
        if let Ok(raw_hosts) = env::var("ATLAS_SINK_HOSTS") {
            if let Some(list) = parse_string_list(&raw_hosts) {
                if !list.is_empty() {
                    settings.sink.hosts = list;
                }
            }
        }

        Ok(settings)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.sink.timeout_seconds)
    }

    /// Sink hosts as base URLs (`http://host:port`)
    pub fn sink_base_urls(&self) -> Vec<String> {
        self.sink.hosts.iter().map(|h| host_to_base_url(h)).collect()
    }
}

/// Parses a host list given either as a JSON array or comma separated.
pub fn parse_string_list(input: &str) -> Option<Vec<String>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(vec![]);
    }

    if trimmed.starts_with('[') {
        if let Ok(v) = serde_json::from_str::<Vec<String>>(trimmed) {
            return Some(v);
        }
        let without_brackets = trimmed.trim_start_matches('[').trim_end_matches(']');
        return Some(split_list(without_brackets));
    }

    Some(split_list(trimmed))
}

fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `host`, `host:port` or a full URL; bare hosts get port 9200.
pub fn host_to_base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        return host.to_string();
    }
    match host.split_once(':') {
        Some((name, port)) if !port.is_empty() => format!("http://{}:{}", name, port),
        Some((name, _)) => format!("http://{}:9200", name),
        None => format!("http://{}:9200", host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.sink.chunk_size, 200);
        assert_eq!(settings.sink.timeout_seconds, 60);
        assert_eq!(settings.probes.workers, 200);
        assert_eq!(settings.pipeline.chunk_period, 86_400);
        assert_eq!(settings.pipeline.progress_every, 1000);
        assert!(settings.sink.doc_type.is_empty());
    }

    #[test]
    fn test_parse_string_list_formats() {
        assert_eq!(
            parse_string_list("a:9200, b").unwrap(),
            vec!["a:9200".to_string(), "b".to_string()]
        );
        assert_eq!(
            parse_string_list(r#"["a", "b:1"]"#).unwrap(),
            vec!["a".to_string(), "b:1".to_string()]
        );
        assert_eq!(
            parse_string_list("[a, b]").unwrap(),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(parse_string_list("  ").unwrap().is_empty());
    }

    #[test]
    fn test_host_to_base_url() {
        assert_eq!(host_to_base_url("localhost"), "http://localhost:9200");
        assert_eq!(host_to_base_url("es1:9201"), "http://es1:9201");
        assert_eq!(host_to_base_url("https://es.example/"), "https://es.example");
    }
}
