//! # Result normalization
//!
//! Flattens typed measurement results plus their probe into indexable
//! [`Document`]s:
//!
//! - **DNS**: one document per query/answer exchange, each carrying the
//!   decoded `abuf` sections.
//! - **Traceroute**: one document per result. Hop origins are resolved to
//!   origin ASNs with a single batched lookup.
//! - **Generic**: the raw payload minus transport keys. An unhandled kind is
//!   warned about once per run, through the caller's [`RunContext`].

use crate::dns_wire::decode_abuf;
use crate::document::{stable_id, Document};
use crate::lookup::{AsnOrigin, MetadataLookup};
use crate::measurement::{
    iso_timestamp, strip_transport_fields, DnsResult, Envelope, GenericResult, Measurement,
    TracerouteResult,
};
use crate::pipeline::RunContext;
use crate::probe::Probe;
use log::{debug, warn};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;

pub struct ResultNormalizer {
    lookup: Arc<dyn MetadataLookup>,
    index: String,
    doc_type: String,
}

impl ResultNormalizer {
    /// An empty `doc_type` derives the type from the measurement kind.
    pub fn new(
        lookup: Arc<dyn MetadataLookup>,
        index: impl Into<String>,
        doc_type: impl Into<String>,
    ) -> Self {
        Self {
            lookup,
            index: index.into(),
            doc_type: doc_type.into(),
        }
    }

    pub fn doc_type_for(&self, kind: &str) -> String {
        if self.doc_type.is_empty() {
            format!("{}-results", kind)
        } else {
            self.doc_type.clone()
        }
    }

    pub async fn normalize(
        &self,
        measurement: &Measurement,
        probe: &Probe,
        ctx: &mut RunContext,
    ) -> Vec<Document> {
        match measurement {
            Measurement::Dns(dns) => self.normalize_dns(dns, probe),
            Measurement::Traceroute(tr) => vec![self.normalize_traceroute(tr, probe).await],
            Measurement::Generic(generic) => {
                ctx.unhandled_kind(&generic.kind);
                vec![self.normalize_generic(generic, probe)]
            }
        }
    }

    fn envelope(&self, doc: &mut Document, env: &Envelope, kind: &str, probe: &Probe) {
        doc.set("msm_id", env.msm_id);
        doc.set("prb_id", env.prb_id);
        doc.set("type", kind);
        doc.set("timestamp", iso_timestamp(env.timestamp));
        doc.set("from", &env.from);
        doc.set("msm_name", &env.msm_name);
        doc.set("group_id", env.group_id);
        doc.set("probe", probe);
    }

    fn normalize_dns(&self, dns: &DnsResult, probe: &Probe) -> Vec<Document> {
        let env = &dns.envelope;
        let doc_type = self.doc_type_for("dns");
        let queries = dns.queries();
        if queries.is_empty() {
            debug!("{}:DNS result for msm {} has no responses", env.prb_id, env.msm_id);
        }

        queries
            .iter()
            .enumerate()
            .map(|(i, query)| {
                let id = stable_id(env.msm_id, env.prb_id, i, env.timestamp);
                let mut doc = Document::new(&self.index, &doc_type, id);
                self.envelope(&mut doc, env, "dns", probe);
                doc.set("response_index", i);
                doc.set("af", query.af);
                doc.set("dst_addr", &query.dst_addr);
                doc.set("src_addr", &query.src_addr);
                doc.set("proto", &query.proto);
                doc.set("error", &query.error);

                let Some(response) = &query.result else {
                    return doc;
                };
                doc.set("response_time", response.rt);
                doc.set("response_size", response.size);

                match response.abuf.as_deref() {
                    Some(abuf) => match decode_abuf(abuf) {
                        Ok(msg) => {
                            doc.set("header", &msg.header);
                            doc.set("edns0", &msg.edns0);
                            doc.set("questions", &msg.questions);
                            doc.set("answers", &msg.answers);
                            doc.set("authorities", &msg.authorities);
                            doc.set("additionals", &msg.additionals);
                        }
                        Err(e) => {
                            debug!("{}:Could not decode abuf of response {}: {}", env.prb_id, i, e);
                            doc.set("abuf_error", e.to_string());
                        }
                    },
                    None => {
                        debug!("{}:Response {} carries no abuf", env.prb_id, i);
                        doc.set("abuf_error", "abuf missing");
                    }
                }
                doc
            })
            .collect()
    }

    async fn resolve_origins(&self, prb_id: u32, addresses: &[IpAddr]) -> HashMap<IpAddr, AsnOrigin> {
        if addresses.is_empty() {
            return HashMap::new();
        }
        match self.lookup.origin_asns(addresses).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!("{}:Origin AS lookup failed: {}", prb_id, e);
                HashMap::new()
            }
        }
    }

    async fn normalize_traceroute(&self, tr: &TracerouteResult, probe: &Probe) -> Document {
        let env = &tr.envelope;

        let mut seen = HashSet::new();
        let origins: Vec<IpAddr> = tr
            .result
            .iter()
            .filter_map(|hop| hop.first_origin())
            .filter_map(|origin| origin.parse::<IpAddr>().ok())
            .filter(|ip| seen.insert(*ip))
            .collect();
        let resolved = self.resolve_origins(env.prb_id, &origins).await;

        let mut as_hops = HashSet::new();
        let hops: Vec<Value> = tr
            .result
            .iter()
            .map(|hop| {
                let mut entry = Map::new();
                entry.insert("hop".to_string(), json!(hop.hop));
                if let Some(error) = &hop.error {
                    entry.insert("error".to_string(), json!(error));
                }
                entry.insert("result".to_string(), json!(hop.result));

                match hop.first_origin() {
                    Some(origin) => {
                        entry.insert("first_origin".to_string(), json!(origin));
                        let origin_as = origin
                            .parse::<IpAddr>()
                            .ok()
                            .and_then(|ip| resolved.get(&ip));
                        match origin_as {
                            Some(AsnOrigin { asn, holder }) => {
                                entry.insert("asn".to_string(), json!(asn));
                                if let Some(holder) = holder {
                                    entry.insert("asn_name".to_string(), json!(holder));
                                }
                                as_hops.insert(*asn);
                            }
                            None => debug!("{}:No origin AS for hop {} ({})", env.prb_id, hop.hop, origin),
                        }
                    }
                    None => debug!("{}:Hop {} has no origin", env.prb_id, hop.hop),
                }
                Value::Object(entry)
            })
            .collect();

        let last = tr.result.last();
        let destination_ip_responded = last.map_or(false, |hop| {
            hop.result
                .iter()
                .any(|p| p.from.is_some() && p.from == tr.dst_addr)
        });
        let last_hop_responded = last.map_or(false, |hop| hop.result.iter().any(|p| p.rtt.is_some()));
        let last_rtt = last.and_then(|hop| hop.result.iter().rev().find_map(|p| p.rtt));

        let id = stable_id(env.msm_id, env.prb_id, 0, env.timestamp);
        let mut doc = Document::new(&self.index, &self.doc_type_for("traceroute"), id);
        self.envelope(&mut doc, env, "traceroute", probe);
        doc.set("af", tr.af);
        doc.set("dst_addr", &tr.dst_addr);
        doc.set("dst_name", &tr.dst_name);
        doc.set("src_addr", &tr.src_addr);
        doc.set("paris_id", tr.paris_id);
        doc.set("proto", &tr.proto);
        doc.set("size", tr.size);
        doc.set("endtime", tr.endtime.and_then(iso_timestamp));
        doc.set("destination_ip_responded", destination_ip_responded);
        doc.set("last_hop_responded", last_hop_responded);
        doc.set("last_rtt", last_rtt);
        doc.set("total_hops", hops.len());
        doc.set("total_as_hops", as_hops.len());
        doc.set("hops", hops);
        doc
    }

    fn normalize_generic(&self, generic: &GenericResult, probe: &Probe) -> Document {
        let id = stable_id(
            generic.msm_id.unwrap_or(0),
            generic.prb_id.unwrap_or(probe.id),
            0,
            generic.timestamp.unwrap_or(0),
        );
        let mut doc = Document::new(&self.index, &self.doc_type_for(&generic.kind), id);
        doc.body.extend(strip_transport_fields(&generic.raw));
        doc.set("probe", probe);
        doc
    }
}
