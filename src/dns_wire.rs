//! # DNS wire decoding
//!
//! Atlas DNS results carry the raw answer as a base64 `abuf`. This module
//! decodes it into header, EDNS0, question and record sections with typed
//! rdata for the common record types. Unknown rdata is kept as base64.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Upper bound on compression pointer hops while reading one name.
const MAX_POINTER_JUMPS: usize = 64;

const TYPE_OPT: u16 = 41;

#[derive(Debug, Error, PartialEq)]
pub enum WireError {
    #[error("abuf is not valid base64: {0}")]
    Base64(String),

    #[error("message truncated at offset {offset}")]
    Truncated { offset: usize },

    #[error("invalid label type at offset {offset}")]
    BadLabel { offset: usize },

    #[error("compression pointer loop in name at offset {offset}")]
    PointerLoop { offset: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsHeader {
    pub id: u16,
    pub qr: bool,
    pub opcode: String,
    pub aa: bool,
    pub tc: bool,
    pub rd: bool,
    pub ra: bool,
    pub z: bool,
    pub ad: bool,
    pub cd: bool,
    pub rcode: String,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edns0Option {
    pub code: u16,
    pub name: String,
    pub length: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nsid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Edns0 {
    pub udp_size: u16,
    pub extended_rcode: u8,
    pub version: u8,
    pub do_flag: bool,
    pub options: Vec<Edns0Option>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Question {
    pub name: String,
    #[serde(rename = "type")]
    pub qtype: String,
    pub class: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResourceRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: String,
    pub class: String,
    pub ttl: u32,
    pub rd_length: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preference: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<u32>,
    /// TXT strings joined by a space, or base64 rdata for other types
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub edns0: Option<Edns0>,
    pub questions: Vec<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    /// Additional records other than the OPT pseudo-record
    pub additionals: Vec<ResourceRecord>,
}

pub fn type_name(code: u16) -> String {
    match code {
        1 => "A".to_string(),
        2 => "NS".to_string(),
        5 => "CNAME".to_string(),
        6 => "SOA".to_string(),
        12 => "PTR".to_string(),
        15 => "MX".to_string(),
        16 => "TXT".to_string(),
        28 => "AAAA".to_string(),
        33 => "SRV".to_string(),
        41 => "OPT".to_string(),
        43 => "DS".to_string(),
        46 => "RRSIG".to_string(),
        47 => "NSEC".to_string(),
        48 => "DNSKEY".to_string(),
        255 => "ANY".to_string(),
        other => format!("TYPE{}", other),
    }
}

pub fn class_name(code: u16) -> String {
    match code {
        1 => "IN".to_string(),
        3 => "CH".to_string(),
        4 => "HS".to_string(),
        255 => "ANY".to_string(),
        other => format!("CLASS{}", other),
    }
}

fn opcode_name(code: u8) -> String {
    match code {
        0 => "QUERY".to_string(),
        1 => "IQUERY".to_string(),
        2 => "STATUS".to_string(),
        4 => "NOTIFY".to_string(),
        5 => "UPDATE".to_string(),
        other => format!("OPCODE{}", other),
    }
}

fn rcode_name(code: u8) -> String {
    match code {
        0 => "NOERROR".to_string(),
        1 => "FORMERR".to_string(),
        2 => "SERVFAIL".to_string(),
        3 => "NXDOMAIN".to_string(),
        4 => "NOTIMP".to_string(),
        5 => "REFUSED".to_string(),
        other => format!("RCODE{}", other),
    }
}

fn option_name(code: u16) -> String {
    match code {
        3 => "NSID".to_string(),
        8 => "ClientSubnet".to_string(),
        10 => "COOKIE".to_string(),
        11 => "TcpKeepalive".to_string(),
        12 => "Padding".to_string(),
        other => format!("OPT{}", other),
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn at(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let slice = self
            .buf
            .get(self.pos..self.pos + n)
            .ok_or(WireError::Truncated { offset: self.pos })?;
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn name(&mut self) -> Result<String, WireError> {
        let (name, next) = read_name(self.buf, self.pos)?;
        self.pos = next;
        Ok(name)
    }
}

/// Reads a possibly compressed name starting at `start`. Returns the name in
/// dotted form with a trailing dot and the offset just past it in the
/// uncompressed stream.
fn read_name(buf: &[u8], start: usize) -> Result<(String, usize), WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut resume: Option<usize> = None;
    let mut jumps = 0usize;

    loop {
        let len = *buf.get(pos).ok_or(WireError::Truncated { offset: pos })? as usize;
        match len & 0xC0 {
            0x00 if len == 0 => {
                pos += 1;
                break;
            }
            0x00 => {
                let label = buf
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(WireError::Truncated { offset: pos })?;
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + len;
            }
            0xC0 => {
                let low = *buf.get(pos + 1).ok_or(WireError::Truncated { offset: pos })? as usize;
                if resume.is_none() {
                    resume = Some(pos + 2);
                }
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(WireError::PointerLoop { offset: start });
                }
                pos = ((len & 0x3F) << 8) | low;
            }
            _ => return Err(WireError::BadLabel { offset: pos }),
        }
    }

    let name = if labels.is_empty() {
        ".".to_string()
    } else {
        format!("{}.", labels.join("."))
    };
    Ok((name, resume.unwrap_or(pos)))
}

enum Record {
    Resource(ResourceRecord),
    Opt(Edns0),
}

fn read_header(r: &mut Reader) -> Result<DnsHeader, WireError> {
    let id = r.u16()?;
    let flags = r.u16()?;
    Ok(DnsHeader {
        id,
        qr: flags & 0x8000 != 0,
        opcode: opcode_name(((flags >> 11) & 0x0F) as u8),
        aa: flags & 0x0400 != 0,
        tc: flags & 0x0200 != 0,
        rd: flags & 0x0100 != 0,
        ra: flags & 0x0080 != 0,
        z: flags & 0x0040 != 0,
        ad: flags & 0x0020 != 0,
        cd: flags & 0x0010 != 0,
        rcode: rcode_name((flags & 0x000F) as u8),
        qdcount: r.u16()?,
        ancount: r.u16()?,
        nscount: r.u16()?,
        arcount: r.u16()?,
    })
}

fn read_question(r: &mut Reader) -> Result<Question, WireError> {
    Ok(Question {
        name: r.name()?,
        qtype: type_name(r.u16()?),
        class: class_name(r.u16()?),
    })
}

fn read_opt(class: u16, ttl: u32, rdata: &[u8]) -> Result<Edns0, WireError> {
    let mut options = Vec::new();
    let mut r = Reader::new(rdata);
    while r.pos < rdata.len() {
        let code = r.u16()?;
        let length = r.u16()?;
        let data = r.bytes(length as usize)?;
        options.push(Edns0Option {
            code,
            name: option_name(code),
            length,
            nsid: (code == 3).then(|| String::from_utf8_lossy(data).into_owned()),
        });
    }
    Ok(Edns0 {
        udp_size: class,
        extended_rcode: (ttl >> 24) as u8,
        version: ((ttl >> 16) & 0xFF) as u8,
        do_flag: ttl & 0x8000 != 0,
        options,
    })
}

fn read_record(r: &mut Reader) -> Result<Record, WireError> {
    let name = r.name()?;
    let rtype = r.u16()?;
    let class = r.u16()?;
    let ttl = r.u32()?;
    let rd_length = r.u16()?;
    let rdata_start = r.pos;
    let rdata = r.bytes(rd_length as usize)?;

    if rtype == TYPE_OPT {
        return Ok(Record::Opt(read_opt(class, ttl, rdata)?));
    }

    let mut record = ResourceRecord {
        name,
        rtype: type_name(rtype),
        class: class_name(class),
        ttl,
        rd_length,
        ..Default::default()
    };

    // Names inside rdata may point anywhere in the message, so they are read
    // against the full buffer.
    let msg = r.buf;
    match rtype {
        1 if rdata.len() == 4 => {
            record.address = Some(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]).to_string());
        }
        28 if rdata.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata);
            record.address = Some(Ipv6Addr::from(octets).to_string());
        }
        2 | 5 | 12 => {
            record.target = Some(read_name(msg, rdata_start)?.0);
        }
        15 => {
            let mut sub = Reader::at(msg, rdata_start);
            record.preference = Some(sub.u16()?);
            record.target = Some(sub.name()?);
        }
        6 => {
            let mut sub = Reader::at(msg, rdata_start);
            record.mname = Some(sub.name()?);
            record.rname = Some(sub.name()?);
            record.serial = Some(sub.u32()?);
            record.refresh = Some(sub.u32()?);
            record.retry = Some(sub.u32()?);
            record.expire = Some(sub.u32()?);
            record.minimum = Some(sub.u32()?);
        }
        16 => {
            let mut sub = Reader::new(rdata);
            let mut strings = Vec::new();
            while sub.pos < rdata.len() {
                let len = sub.u8()? as usize;
                strings.push(String::from_utf8_lossy(sub.bytes(len)?).into_owned());
            }
            record.data = Some(strings.join(" "));
        }
        _ => {
            record.data = Some(STANDARD.encode(rdata));
        }
    }
    Ok(Record::Resource(record))
}

fn read_section(r: &mut Reader, count: u16, edns0: &mut Option<Edns0>) -> Result<Vec<ResourceRecord>, WireError> {
    let mut records = Vec::new();
    for _ in 0..count {
        match read_record(r)? {
            Record::Resource(rr) => records.push(rr),
            Record::Opt(opt) => *edns0 = Some(opt),
        }
    }
    Ok(records)
}

/// Decodes a raw DNS message.
pub fn decode(buf: &[u8]) -> Result<DnsMessage, WireError> {
    let mut r = Reader::new(buf);
    let header = read_header(&mut r)?;

    let mut questions = Vec::new();
    for _ in 0..header.qdcount {
        questions.push(read_question(&mut r)?);
    }

    let mut edns0 = None;
    let answers = read_section(&mut r, header.ancount, &mut edns0)?;
    let authorities = read_section(&mut r, header.nscount, &mut edns0)?;
    let additionals = read_section(&mut r, header.arcount, &mut edns0)?;

    Ok(DnsMessage {
        header,
        edns0,
        questions,
        answers,
        authorities,
        additionals,
    })
}

/// Decodes a base64 `abuf`.
pub fn decode_abuf(abuf: &str) -> Result<DnsMessage, WireError> {
    let bytes = STANDARD
        .decode(abuf.trim())
        .map_err(|e| WireError::Base64(e.to_string()))?;
    decode(&bytes)
}
