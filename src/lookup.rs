//! # Metadata lookups
//!
//! Geolocation, ASN holder names and routing-registry data used to enrich
//! probes and traceroute hops. [`MetadataLookup`] is the seam; the
//! [`RipeStatLookup`] adapter talks to RIPEstat and a country metadata API.

use crate::error::LookupError;
use crate::settings::Lookup as LookupSettings;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use url::Url;

/// Country breakdown attached to a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    pub region: Option<String>,
    pub subregion: Option<String>,
}

/// Origin AS announcing an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsnOrigin {
    pub asn: u32,
    pub holder: Option<String>,
}

#[async_trait]
pub trait MetadataLookup: Send + Sync {
    /// Location for an ISO 3166 alpha-2 country code.
    async fn location(&self, country_code: &str) -> Result<Location, LookupError>;

    /// Holder name registered for an AS number.
    async fn asn_holder(&self, asn: u32) -> Result<Option<String>, LookupError>;

    /// Registry authorities (e.g. `ripe`) responsible for a prefix.
    async fn registry_authorities(&self, prefix: &str) -> Result<Vec<String>, LookupError>;

    /// Origin AS for each address in one batched call. Addresses without a
    /// known origin are absent from the result.
    async fn origin_asns(
        &self,
        addresses: &[IpAddr],
    ) -> Result<HashMap<IpAddr, AsnOrigin>, LookupError>;
}

#[derive(Debug, Deserialize)]
struct StatEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct AsOverview {
    #[serde(default)]
    holder: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Whois {
    #[serde(default)]
    authorities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NetworkInfo {
    #[serde(default)]
    asns: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CountryRecord {
    name: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    subregion: Option<String>,
}

/// HTTP adapter over RIPEstat data calls and a country metadata API.
pub struct RipeStatLookup {
    client: reqwest::Client,
    stat_url: String,
    country_url: String,
    sourceapp: String,
    origin_concurrency: usize,
}

impl RipeStatLookup {
    pub fn new(settings: &LookupSettings) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .build()
            .map_err(|e| LookupError::Decode(format!("could not build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            stat_url: settings.ripestat_url.trim_end_matches('/').to_string(),
            country_url: settings.country_url.clone(),
            sourceapp: settings.sourceapp.clone(),
            origin_concurrency: settings.origin_concurrency.max(1),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: Url) -> Result<T, LookupError> {
        let url_str = url.to_string();
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| LookupError::Http {
                url: url_str.clone(),
                source,
            })?;
        if !response.status().is_success() {
            return Err(LookupError::Status {
                url: url_str,
                status: response.status().as_u16(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| LookupError::Decode(format!("{}: {}", url_str, e)))
    }

    async fn data_call<T: serde::de::DeserializeOwned>(
        &self,
        call: &str,
        resource: &str,
    ) -> Result<T, LookupError> {
        let url = Url::parse_with_params(
            &format!("{}/{}/data.json", self.stat_url, call),
            &[("resource", resource), ("sourceapp", self.sourceapp.as_str())],
        )
        .map_err(|e| LookupError::Decode(e.to_string()))?;
        let envelope: StatEnvelope<T> = self.get_json(url).await?;
        Ok(envelope.data)
    }

    async fn origin_for(&self, address: IpAddr) -> Result<Option<u32>, LookupError> {
        let info: NetworkInfo = self.data_call("network-info", &address.to_string()).await?;
        Ok(info.asns.iter().find_map(|asn| asn.parse::<u32>().ok()))
    }
}

#[async_trait]
impl MetadataLookup for RipeStatLookup {
    async fn location(&self, country_code: &str) -> Result<Location, LookupError> {
        let url = Url::parse_with_params(&self.country_url, &[("codes", country_code.to_lowercase())])
            .map_err(|e| LookupError::Decode(e.to_string()))?;
        let records: Vec<CountryRecord> = self.get_json(url).await?;
        let first = records
            .into_iter()
            .next()
            .ok_or_else(|| LookupError::NotFound(country_code.to_string()))?;
        Ok(Location {
            country: first.name,
            region: first.region,
            subregion: first.subregion,
        })
    }

    async fn asn_holder(&self, asn: u32) -> Result<Option<String>, LookupError> {
        let overview: AsOverview = self.data_call("as-overview", &asn.to_string()).await?;
        Ok(overview.holder)
    }

    async fn registry_authorities(&self, prefix: &str) -> Result<Vec<String>, LookupError> {
        let whois: Whois = self.data_call("whois", prefix).await?;
        Ok(whois.authorities)
    }

    async fn origin_asns(
        &self,
        addresses: &[IpAddr],
    ) -> Result<HashMap<IpAddr, AsnOrigin>, LookupError> {
        // RIPEstat resolves one resource per call; fan out with a bound and
        // resolve each distinct origin AS name once.
        let origins: Vec<(IpAddr, Result<Option<u32>, LookupError>)> =
            stream::iter(addresses.iter().copied())
                .map(|address| async move { (address, self.origin_for(address).await) })
                .buffer_unordered(self.origin_concurrency)
                .collect()
                .await;

        let mut holders: HashMap<u32, Option<String>> = HashMap::new();
        let mut resolved = HashMap::with_capacity(origins.len());
        for (address, origin) in origins {
            match origin {
                Ok(Some(asn)) => {
                    if !holders.contains_key(&asn) {
                        let holder = self.asn_holder(asn).await.unwrap_or_else(|e| {
                            debug!("Could not fetch holder for AS{}: {}", asn, e);
                            None
                        });
                        holders.insert(asn, holder);
                    }
                    let holder = holders.get(&asn).cloned().flatten();
                    resolved.insert(address, AsnOrigin { asn, holder });
                }
                Ok(None) => debug!("No origin AS announced for {}", address),
                Err(e) => debug!("Origin lookup for {} failed: {}", address, e),
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_envelope_decodes_holder() {
        let raw = r#"{"status":"ok","data":{"holder":"RIPE-NCC-AS - Reseaux IP Europeens","type":"as"}}"#;
        let parsed: StatEnvelope<AsOverview> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.data.holder.as_deref(),
            Some("RIPE-NCC-AS - Reseaux IP Europeens")
        );
    }

    #[test]
    fn test_network_info_takes_first_numeric_asn() {
        let raw = r#"{"data":{"asns":["3333","1234"],"prefix":"193.0.0.0/21"}}"#;
        let parsed: StatEnvelope<NetworkInfo> = serde_json::from_str(raw).unwrap();
        let first = parsed.data.asns.iter().find_map(|a| a.parse::<u32>().ok());
        assert_eq!(first, Some(3333));
    }

    #[test]
    fn test_country_record_decodes() {
        let raw = r#"[{"name":"Netherlands","region":"Europe","subregion":"Western Europe","alpha2Code":"NL"}]"#;
        let parsed: Vec<CountryRecord> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed[0].name, "Netherlands");
        assert_eq!(parsed[0].subregion.as_deref(), Some("Western Europe"));
    }
}
