//! # Measurement results
//!
//! Typed views of raw Atlas result payloads. [`Measurement::parse`] dispatches
//! on the payload's `type` into a closed set of variants; kinds without a
//! dedicated model fall through to [`Measurement::Generic`], which keeps the
//! raw object.

use crate::error::ParseError;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Keys used by the transport and bookkeeping layers, never indexed.
pub const TRANSPORT_FIELDS: [&str; 9] = [
    "fw",
    "lts",
    "abuf",
    "qbuf",
    "raw_data",
    "logger",
    "stat_api",
    "is_error",
    "is_malformed",
];

pub const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Epoch seconds as `YYYY-MM-DDTHH:MM:SS` (UTC, no offset).
pub fn iso_timestamp(epoch: i64) -> Option<String> {
    Utc.timestamp_opt(epoch, 0)
        .single()
        .map(|dt| dt.format(ISO_FORMAT).to_string())
}

/// Copy of `map` without transport keys, applied to nested objects too.
pub fn strip_transport_fields(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(key, _)| !TRANSPORT_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), strip_value(value)))
        .collect()
}

fn strip_value(value: &Value) -> Value {
    match value {
        Value::Object(inner) => Value::Object(strip_transport_fields(inner)),
        Value::Array(items) => Value::Array(items.iter().map(strip_value).collect()),
        other => other.clone(),
    }
}

/// Fields shared by every typed result.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub msm_id: u64,
    pub prb_id: u32,
    pub timestamp: i64,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub msm_name: Option<String>,
    #[serde(default)]
    pub group_id: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsResponse {
    #[serde(default)]
    pub rt: Option<f64>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, rename = "ID")]
    pub id: Option<u16>,
    #[serde(default, rename = "ANCOUNT")]
    pub ancount: Option<u16>,
    #[serde(default, rename = "NSCOUNT")]
    pub nscount: Option<u16>,
    #[serde(default, rename = "ARCOUNT")]
    pub arcount: Option<u16>,
    #[serde(default, rename = "QDCOUNT")]
    pub qdcount: Option<u16>,
    #[serde(default)]
    pub abuf: Option<String>,
}

/// One query/answer exchange. A `resultset` entry deserializes into this
/// directly; the single-result form is assembled from the top level.
#[derive(Debug, Clone, Deserialize)]
pub struct DnsQuery {
    #[serde(default)]
    pub af: Option<u8>,
    #[serde(default)]
    pub dst_addr: Option<String>,
    #[serde(default)]
    pub src_addr: Option<String>,
    #[serde(default)]
    pub proto: Option<String>,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub result: Option<DnsResponse>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsResult {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default)]
    pub af: Option<u8>,
    #[serde(default)]
    pub dst_addr: Option<String>,
    #[serde(default)]
    pub src_addr: Option<String>,
    #[serde(default)]
    pub proto: Option<String>,
    #[serde(default)]
    pub result: Option<DnsResponse>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub resultset: Vec<DnsQuery>,
}

impl DnsResult {
    /// Every exchange of this result, in delivery order.
    pub fn queries(&self) -> Vec<DnsQuery> {
        if !self.resultset.is_empty() {
            return self.resultset.clone();
        }
        if self.result.is_none() && self.error.is_none() {
            return Vec::new();
        }
        vec![DnsQuery {
            af: self.af,
            dst_addr: self.dst_addr.clone(),
            src_addr: self.src_addr.clone(),
            proto: self.proto.clone(),
            time: None,
            result: self.result.clone(),
            error: self.error.clone(),
        }]
    }
}

/// One reply (or timeout marker) within a hop.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Packet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dup: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub itos: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ittl: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edst: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hop {
    #[serde(default)]
    pub hop: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Vec<Packet>,
}

impl Hop {
    /// Source address of the first packet, if any.
    pub fn first_origin(&self) -> Option<&str> {
        self.result.first().and_then(|p| p.from.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TracerouteResult {
    #[serde(flatten)]
    pub envelope: Envelope,
    #[serde(default)]
    pub af: Option<u8>,
    #[serde(default)]
    pub dst_addr: Option<String>,
    #[serde(default)]
    pub dst_name: Option<String>,
    #[serde(default)]
    pub src_addr: Option<String>,
    #[serde(default)]
    pub paris_id: Option<u32>,
    #[serde(default)]
    pub proto: Option<String>,
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub endtime: Option<i64>,
    #[serde(default)]
    pub result: Vec<Hop>,
}

/// Result of a kind without a dedicated model.
#[derive(Debug, Clone)]
pub struct GenericResult {
    pub kind: String,
    pub msm_id: Option<u64>,
    pub prb_id: Option<u32>,
    pub timestamp: Option<i64>,
    pub raw: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub enum Measurement {
    Dns(DnsResult),
    Traceroute(TracerouteResult),
    Generic(GenericResult),
}

impl Measurement {
    pub fn parse(raw: &Value) -> Result<Self, ParseError> {
        let obj = raw.as_object().ok_or_else(|| ParseError::InvalidField {
            field: "payload",
            reason: "not a JSON object".to_string(),
        })?;
        let kind = obj.get("type").and_then(Value::as_str).unwrap_or("unknown");

        match kind {
            "dns" => {
                require_envelope(obj)?;
                Ok(Measurement::Dns(serde_json::from_value(raw.clone())?))
            }
            "traceroute" => {
                require_envelope(obj)?;
                Ok(Measurement::Traceroute(serde_json::from_value(raw.clone())?))
            }
            other => Ok(Measurement::Generic(GenericResult {
                kind: other.to_string(),
                msm_id: obj.get("msm_id").and_then(Value::as_u64),
                prb_id: obj
                    .get("prb_id")
                    .and_then(Value::as_u64)
                    .and_then(|id| u32::try_from(id).ok()),
                timestamp: obj.get("timestamp").and_then(Value::as_i64),
                raw: obj.clone(),
            })),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Measurement::Dns(_) => "dns",
            Measurement::Traceroute(_) => "traceroute",
            Measurement::Generic(g) => &g.kind,
        }
    }
}

fn require_envelope(obj: &Map<String, Value>) -> Result<(), ParseError> {
    for field in ["msm_id", "prb_id", "timestamp"] {
        match obj.get(field) {
            None | Some(Value::Null) => return Err(ParseError::MissingField(field)),
            Some(v) if !v.is_number() => {
                return Err(ParseError::InvalidField {
                    field,
                    reason: format!("expected a number, got {}", v),
                })
            }
            Some(_) => {}
        }
    }
    Ok(())
}
