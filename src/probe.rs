//! # Probe records
//!
//! [`ArchiveProbe`] is one record of the upstream probe archive as delivered.
//! [`Probe`] is the durable, enriched record the registry owns and persists:
//! it holds data only, never client handles, so it can be written to the
//! cache as-is and read back without reconstructing anything.
//!
//! Enrichment happens once, in [`ProbeEnricher::enrich`], and every lookup it
//! performs fails soft.

use crate::lookup::{Location, MetadataLookup};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

/// A probe tag as delivered by the archive: either a plain string or an
/// object carrying `name`/`slug`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ArchiveTag {
    Plain(String),
    Object {
        #[serde(default)]
        slug: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
}

impl ArchiveTag {
    fn into_label(self) -> Option<String> {
        match self {
            ArchiveTag::Plain(s) => Some(s),
            ArchiveTag::Object { slug, name } => slug.or(name),
        }
    }
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let tags: Option<Vec<ArchiveTag>> = Option::deserialize(deserializer)?;
    Ok(tags
        .unwrap_or_default()
        .into_iter()
        .filter_map(ArchiveTag::into_label)
        .collect())
}

/// One record of the probe archive.
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveProbe {
    pub id: u32,
    #[serde(default)]
    pub status_name: Option<String>,
    #[serde(default)]
    pub status_since: Option<i64>,
    #[serde(default)]
    pub address_v4: Option<String>,
    #[serde(default)]
    pub address_v6: Option<String>,
    #[serde(default)]
    pub asn_v4: Option<u32>,
    #[serde(default)]
    pub asn_v6: Option<u32>,
    #[serde(default)]
    pub prefix_v4: Option<String>,
    #[serde(default)]
    pub prefix_v6: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub is_anchor: Option<bool>,
    #[serde(default)]
    pub is_public: Option<bool>,
    #[serde(default)]
    pub resource_uri: Option<String>,
    #[serde(default, deserialize_with = "deserialize_tags")]
    pub tags: Vec<String>,
}

/// Durable probe record: archive attributes plus enrichment.
///
/// Identity is the probe id; two records with the same id compare equal
/// regardless of their enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Probe {
    pub id: u32,
    pub status: Option<String>,
    pub status_since: Option<i64>,
    pub address_v4: Option<String>,
    pub address_v6: Option<String>,
    pub asn_v4: Option<u32>,
    pub asn_v6: Option<u32>,
    pub prefix_v4: Option<String>,
    pub prefix_v6: Option<String>,
    pub country_code: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub is_anchor: Option<bool>,
    pub is_public: Option<bool>,
    pub resource_uri: Option<String>,
    pub tooltip: String,
    /// `[longitude, latitude]`
    pub geojson: Option<[f64; 2]>,
    pub tags: Vec<String>,
    pub location: Option<Location>,
    pub asn_v4_name: Option<String>,
    pub asn_v6_name: Option<String>,
    pub prefixlen_v4: Option<u8>,
    pub prefixlen_v6: Option<u8>,
    pub rir_v4: Option<String>,
    pub rir_v6: Option<String>,
}

impl Probe {
    /// Builds the record from archive attributes alone, with every
    /// enrichment field unset.
    pub fn from_archive(record: ArchiveProbe) -> Self {
        let geojson = match (record.longitude, record.latitude) {
            (Some(lon), Some(lat)) => Some([lon, lat]),
            _ => None,
        };
        Self {
            id: record.id,
            status: record.status_name,
            status_since: record.status_since,
            address_v4: record.address_v4,
            address_v6: record.address_v6,
            asn_v4: record.asn_v4,
            asn_v6: record.asn_v6,
            prefix_v4: record.prefix_v4,
            prefix_v6: record.prefix_v6,
            country_code: record.country_code,
            latitude: record.latitude,
            longitude: record.longitude,
            is_anchor: record.is_anchor,
            is_public: record.is_public,
            resource_uri: record.resource_uri,
            tooltip: tooltip_for(record.id),
            geojson,
            tags: record.tags,
            location: None,
            asn_v4_name: None,
            asn_v6_name: None,
            prefixlen_v4: None,
            prefixlen_v6: None,
            rir_v4: None,
            rir_v6: None,
        }
    }
}

impl PartialEq for Probe {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Probe {}

impl Hash for Probe {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

pub fn tooltip_for(id: u32) -> String {
    format!("Probe #{0}: https://atlas.ripe.net/probes/{0}/", id)
}

/// Prefix length of a CIDR string such as `193.0.0.0/21` or `2001:db8::/32`.
pub fn prefix_len(prefix: &str) -> Result<u8, String> {
    let (addr, len) = prefix
        .trim()
        .split_once('/')
        .ok_or_else(|| format!("{} is not in CIDR notation", prefix))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|e| format!("invalid address in {}: {}", prefix, e))?;
    let len: u8 = len
        .parse()
        .map_err(|e| format!("invalid prefix length in {}: {}", prefix, e))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if len > max {
        return Err(format!("prefix length {} exceeds {} in {}", len, max, prefix));
    }
    Ok(len)
}

/// Turns archive records into enriched probes.
#[derive(Clone)]
pub struct ProbeEnricher {
    lookup: Arc<dyn MetadataLookup>,
}

impl ProbeEnricher {
    pub fn new(lookup: Arc<dyn MetadataLookup>) -> Self {
        Self { lookup }
    }

    /// Builds an enriched probe. Any failing lookup leaves its field unset.
    pub async fn enrich(&self, record: ArchiveProbe) -> Probe {
        let mut probe = Probe::from_archive(record);
        let id = probe.id;

        if let Some(code) = probe.country_code.clone() {
            match self.lookup.location(&code).await {
                Ok(location) => {
                    debug!("{}:Add location for {}", id, code);
                    probe.location = Some(location);
                }
                Err(e) => warn!("{}:Could not fetch location for {}: {}", id, code, e),
            }
        }

        if let Some(asn) = probe.asn_v4 {
            probe.asn_v4_name = self.asn_name(id, asn).await;
        }
        if let Some(asn) = probe.asn_v6 {
            probe.asn_v6_name = if probe.asn_v4 == Some(asn) {
                probe.asn_v4_name.clone()
            } else {
                self.asn_name(id, asn).await
            };
        }

        if let Some(prefix) = probe.prefix_v4.clone() {
            probe.prefixlen_v4 = self.prefix_len(id, &prefix);
            probe.rir_v4 = self.rir(id, &prefix).await;
        }
        if let Some(prefix) = probe.prefix_v6.clone() {
            probe.prefixlen_v6 = self.prefix_len(id, &prefix);
            probe.rir_v6 = self.rir(id, &prefix).await;
        }

        probe
    }

    async fn asn_name(&self, id: u32, asn: u32) -> Option<String> {
        match self.lookup.asn_holder(asn).await {
            Ok(holder) => {
                debug!("{}:Add AS name {:?} for AS{}", id, holder, asn);
                holder
            }
            Err(e) => {
                warn!("{}:Could not fetch holder for AS{}: {}", id, asn, e);
                None
            }
        }
    }

    async fn rir(&self, id: u32, prefix: &str) -> Option<String> {
        match self.lookup.registry_authorities(prefix).await {
            Ok(authorities) => {
                let rir = authorities.join(",");
                debug!("{}:Add RIR {:?} for {}", id, rir, prefix);
                Some(rir)
            }
            Err(e) => {
                warn!("{}:Could not fetch registry for {}: {}", id, prefix, e);
                None
            }
        }
    }

    fn prefix_len(&self, id: u32, prefix: &str) -> Option<u8> {
        match prefix_len(prefix) {
            Ok(len) => {
                debug!("{}:Add prefix length {} for {}", id, len, prefix);
                Some(len)
            }
            Err(e) => {
                warn!("{}:Could not get prefix length: {}", id, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LookupError;
    use crate::lookup::AsnOrigin;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLookup {
        asn_calls: AtomicUsize,
        fail_location: bool,
    }

    #[async_trait]
    impl MetadataLookup for CountingLookup {
        async fn location(&self, code: &str) -> Result<Location, LookupError> {
            if self.fail_location {
                return Err(LookupError::NotFound(code.to_string()));
            }
            Ok(Location {
                country: "Netherlands".to_string(),
                region: Some("Europe".to_string()),
                subregion: Some("Western Europe".to_string()),
            })
        }

        async fn asn_holder(&self, asn: u32) -> Result<Option<String>, LookupError> {
            self.asn_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(format!("HOLDER-{}", asn)))
        }

        async fn registry_authorities(&self, _prefix: &str) -> Result<Vec<String>, LookupError> {
            Ok(vec!["ripe".to_string(), "arin".to_string()])
        }

        async fn origin_asns(
            &self,
            _addresses: &[IpAddr],
        ) -> Result<HashMap<IpAddr, AsnOrigin>, LookupError> {
            Ok(HashMap::new())
        }
    }

    fn archive(json: serde_json::Value) -> ArchiveProbe {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_archive_tags_accept_strings_and_objects() {
        let record = archive(serde_json::json!({
            "id": 7,
            "tags": ["home", {"name": "Cable", "slug": "cable"}, {"name": "NAT"}]
        }));
        assert_eq!(record.tags, vec!["home", "cable", "NAT"]);
    }

    #[test]
    fn test_from_archive_derives_tooltip_and_geojson() {
        let probe = Probe::from_archive(archive(serde_json::json!({
            "id": 42, "latitude": 52.3, "longitude": 4.9
        })));
        assert_eq!(probe.tooltip, "Probe #42: https://atlas.ripe.net/probes/42/");
        assert_eq!(probe.geojson, Some([4.9, 52.3]));
    }

    #[test]
    fn test_prefix_len() {
        assert_eq!(prefix_len("193.0.0.0/21"), Ok(21));
        assert_eq!(prefix_len("2001:67c:2e8::/48"), Ok(48));
        assert!(prefix_len("193.0.0.0").is_err());
        assert!(prefix_len("10.0.0.0/33").is_err());
        assert!(prefix_len("not-an-ip/8").is_err());
    }

    #[test]
    fn test_equality_uses_id_only() {
        let a = Probe::from_archive(archive(serde_json::json!({"id": 1, "country_code": "NL"})));
        let b = Probe::from_archive(archive(serde_json::json!({"id": 1, "country_code": "DE"})));
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_same_asn_is_looked_up_once() {
        let lookup = Arc::new(CountingLookup::default());
        let enricher = ProbeEnricher::new(lookup.clone());
        let probe = enricher
            .enrich(archive(serde_json::json!({
                "id": 3, "asn_v4": 3333, "asn_v6": 3333
            })))
            .await;
        assert_eq!(lookup.asn_calls.load(Ordering::SeqCst), 1);
        assert_eq!(probe.asn_v4_name.as_deref(), Some("HOLDER-3333"));
        assert_eq!(probe.asn_v6_name.as_deref(), Some("HOLDER-3333"));
    }

    #[tokio::test]
    async fn test_failed_lookup_leaves_field_unset() {
        let lookup = Arc::new(CountingLookup {
            fail_location: true,
            ..Default::default()
        });
        let enricher = ProbeEnricher::new(lookup);
        let probe = enricher
            .enrich(archive(serde_json::json!({
                "id": 4, "country_code": "NL", "prefix_v4": "bogus", "prefix_v6": "2001:db8::/32"
            })))
            .await;
        assert!(probe.location.is_none());
        assert!(probe.prefixlen_v4.is_none());
        assert_eq!(probe.rir_v4.as_deref(), Some("ripe,arin"));
        assert_eq!(probe.prefixlen_v6, Some(32));
    }
}
