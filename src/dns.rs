//! Stand-alone DNS message codec and answer cache.
//!
//! A name-resolution helper, deliberately not wired into the tunnel data
//! path. The codec covers the classic message layout: 12-byte header,
//! question section and resource records, with label-suffix compression
//! (backward pointer scheme) on encode and pointer following on decode.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

/// Query kind, 4-bit field of the header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode(pub u8);

impl Opcode {
    /// Standard query.
    pub const QUERY: Opcode = Opcode(0);
    /// Inverse query.
    pub const INV_QUERY: Opcode = Opcode(1);
    /// Server status request.
    pub const STATUS: Opcode = Opcode(2);
}

/// Response code, low 4 bits of the second flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rcode(pub u8);

impl Rcode {
    pub const OK: Rcode = Rcode(0);
    pub const FORMAT_ERROR: Rcode = Rcode(1);
    pub const SERVER_FAILURE: Rcode = Rcode(2);
    pub const NAME_ERROR: Rcode = Rcode(3);
    pub const NOT_IMPLEMENTED: Rcode = Rcode(4);
}

/// Type of a resource record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordType(pub u16);

impl RecordType {
    /// Host address.
    pub const A: RecordType = RecordType(1);
    /// Authoritative name server.
    pub const NS: RecordType = RecordType(2);
    /// Canonical name for an alias.
    pub const CNAME: RecordType = RecordType(5);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Class(pub u16);

impl Class {
    pub const IN: Class = Class(1);
    pub const CH: Class = Class(3);
    pub const HS: Class = Class(4);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub rtype: RecordType,
    pub class: Class,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: RecordType,
    pub class: Class,
    pub ttl: u32,
    pub data: Vec<u8>,
}

impl Record {
    /// Host address record for an IPv4 address.
    pub fn a(name: &str, addr: Ipv4Addr, ttl: u32) -> Record {
        Record {
            name: name.to_owned(),
            rtype: RecordType::A,
            class: Class::IN,
            ttl,
            data: addr.octets().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub id: u16,
    pub opcode: Opcode,
    pub rcode: Rcode,
    pub quests: Vec<Question>,
    pub answers: Vec<Record>,
    pub records: Vec<Record>,
}

impl Default for Opcode {
    fn default() -> Self {
        Opcode::QUERY
    }
}

impl Default for Rcode {
    fn default() -> Self {
        Rcode::OK
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("no header")]
    NoHeader,
    #[error("not enough data")]
    NotEnoughData,
    #[error("empty name")]
    EmptyName,
    #[error("recursive pointer")]
    RecursivePointer,
}

/// Encode a message. The response flag derives from the content: any
/// answers or a non-ok rcode mark the message as a response.
pub fn encode(m: &Message) -> Vec<u8> {
    let mut g = Encoder {
        buf: Vec::with_capacity(64),
        offsets: HashMap::new(),
    };

    let response = !m.answers.is_empty() || m.rcode != Rcode::OK;
    g.u16(m.id);
    g.u8((u8::from(response) << 7) | ((m.opcode.0 & 0b1111) << 3));
    g.u8(m.rcode.0 & 0b1111);
    g.u16(m.quests.len() as u16);
    g.u16(m.answers.len() as u16);
    g.u16(0); // authority records
    g.u16(m.records.len() as u16);

    for q in &m.quests {
        g.name(&q.name);
        g.u16(q.rtype.0);
        g.u16(q.class.0);
    }
    for r in m.answers.iter().chain(&m.records) {
        g.record(r);
    }
    g.buf
}

struct Encoder {
    buf: Vec<u8>,
    /// Offsets of previously encoded name suffixes, for the backward
    /// pointer compression scheme.
    offsets: HashMap<String, u16>,
}

impl Encoder {
    fn record(&mut self, r: &Record) {
        self.name(&r.name);
        self.u16(r.rtype.0);
        self.u16(r.class.0);
        self.u32(r.ttl);
        self.u16(r.data.len() as u16);
        self.buf.extend_from_slice(&r.data);
    }

    fn name(&mut self, s: &str) {
        if s.is_empty() {
            // zero terminator for the root name
            self.u8(0);
            return;
        }

        if let Some(&offset) = self.offsets.get(s) {
            self.u16(offset | 0xC000);
            return;
        }
        // Pointers carry 14-bit offsets; suffixes further out simply go
        // uncompressed.
        if self.buf.len() <= 0x3FFF {
            self.offsets.insert(s.to_owned(), self.buf.len() as u16);
        }

        match s.split_once('.') {
            Some((prefix, suffix)) => {
                self.label(prefix);
                self.name(suffix);
            }
            None => {
                self.label(s);
                self.u8(0);
            }
        }
    }

    fn label(&mut self, s: &str) {
        self.u8(s.len() as u8);
        self.buf.extend_from_slice(s.as_bytes());
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
}

pub fn decode(data: &[u8]) -> Result<Message, DnsError> {
    let mut d = Decoder {
        buf: data,
        pos: 0,
        mark: 0,
    };

    if d.len() < 12 {
        return Err(DnsError::NoHeader);
    }
    let id = d.u16()?;
    let b = d.u8()?;
    let opcode = Opcode((b >> 3) & 0b1111);
    let b = d.u8()?;
    let rcode = Rcode(b & 0b1111);

    let quests = d.u16()?;
    let answers = d.u16()?;
    let servers = d.u16()?;
    let records = d.u16()?;

    let mut m = Message {
        id,
        opcode,
        rcode,
        ..Message::default()
    };
    for _ in 0..quests {
        m.quests.push(d.quest()?);
    }
    for _ in 0..answers {
        m.answers.push(d.record()?);
    }
    // Authority and additional sections land together; nothing here
    // distinguishes their use.
    for _ in 0..u32::from(servers) + u32::from(records) {
        m.records.push(d.record()?);
    }
    Ok(m)
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Saved position before jumping to a pointer offset. Zero means no
    /// jump is active.
    mark: usize,
}

impl Decoder<'_> {
    fn quest(&mut self) -> Result<Question, DnsError> {
        let name = self.name()?;
        if name.is_empty() {
            return Err(DnsError::EmptyName);
        }
        if self.len() < 4 {
            return Err(DnsError::NotEnoughData);
        }
        Ok(Question {
            name,
            rtype: RecordType(self.u16()?),
            class: Class(self.u16()?),
        })
    }

    fn record(&mut self) -> Result<Record, DnsError> {
        let name = self.name()?;
        if self.len() < 2 + 2 + 4 + 2 {
            return Err(DnsError::NotEnoughData);
        }
        let rtype = RecordType(self.u16()?);
        let class = Class(self.u16()?);
        let ttl = self.u32()?;
        let length = self.u16()? as usize;
        if self.len() < length {
            return Err(DnsError::NotEnoughData);
        }
        Ok(Record {
            name,
            rtype,
            class,
            ttl,
            data: self.data(length).to_vec(),
        })
    }

    /// Decodes a name from a sequence of labels terminated by a zero
    /// byte, following at most one compression pointer.
    fn name(&mut self) -> Result<String, DnsError> {
        let mut out = String::new();
        loop {
            let Some(label) = self.label()? else {
                return Ok(out);
            };
            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(&String::from_utf8_lossy(label));
        }
    }

    fn label(&mut self) -> Result<Option<&[u8]>, DnsError> {
        if self.len() < 1 {
            return Err(DnsError::NotEnoughData);
        }
        let length = self.u8()?;
        if length == 0 {
            self.restore();
            return Ok(None);
        }
        if length >> 6 == 0b11 {
            if self.mark != 0 {
                return Err(DnsError::RecursivePointer);
            }
            if self.len() < 1 {
                return Err(DnsError::NotEnoughData);
            }
            let b = self.u8()?;
            let offset = (u16::from(length & 0b11_1111) << 8) | u16::from(b);
            self.jump(offset);
            return self.label();
        }

        let length = usize::from(length);
        if length > self.len() {
            return Err(DnsError::NotEnoughData);
        }
        Ok(Some(self.data(length)))
    }

    fn jump(&mut self, offset: u16) {
        self.mark = self.pos;
        self.pos = usize::from(offset).min(self.buf.len());
    }

    fn restore(&mut self) {
        if self.mark != 0 {
            self.pos = self.mark;
            self.mark = 0;
        }
    }

    fn len(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, DnsError> {
        if self.len() < 1 {
            return Err(DnsError::NotEnoughData);
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn u16(&mut self) -> Result<u16, DnsError> {
        if self.len() < 2 {
            return Err(DnsError::NotEnoughData);
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        if self.len() < 4 {
            return Err(DnsError::NotEnoughData);
        }
        let v = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn data(&mut self, n: usize) -> &[u8] {
        let p = self.pos;
        self.pos += n;
        &self.buf[p..self.pos]
    }
}

struct CacheEntry {
    list: Vec<IpAddr>,
    stored: Instant,
    ttl: u32,
}

/// Answer cache keyed by domain name. Entries expire by their ttl.
#[derive(Default)]
pub struct Cache {
    map: Mutex<HashMap<String, CacheEntry>>,
}

impl Cache {
    pub fn new() -> Cache {
        Cache::default()
    }

    pub fn set(&self, name: &str, list: Vec<IpAddr>, ttl: u32, now: Instant) {
        self.map.lock().insert(
            name.to_owned(),
            CacheEntry {
                list,
                stored: now,
                ttl,
            },
        );
    }

    /// Returns the stored address list and its remaining ttl.
    pub fn get(&self, name: &str, now: Instant) -> Option<(Vec<IpAddr>, u32)> {
        let map = self.map.lock();
        let entry = map.get(name)?;
        let age = now.saturating_duration_since(entry.stored);
        if age >= Duration::from_secs(u64::from(entry.ttl)) {
            return None;
        }
        let left = entry.ttl - age.as_secs() as u32;
        Some((entry.list.clone(), left))
    }
}
