use std::fmt;

use anyhow::Context;

use crate::wire::{Decode, Encode, NameCache, WireBuf};

/// The Internet class; everything this crate touches lives in it.
pub const CLASS_IN: u16 = 1;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Soa,
    Ptr,
    Txt,
    Aaaa,
    Any,
    Other(u16),
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            6 => RecordType::Soa,
            12 => RecordType::Ptr,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            255 => RecordType::Any,
            other => RecordType::Other(other),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Soa => 6,
            RecordType::Ptr => 12,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Any => 255,
            RecordType::Other(v) => v,
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordType::A => f.write_str("A"),
            RecordType::Ns => f.write_str("NS"),
            RecordType::Cname => f.write_str("CNAME"),
            RecordType::Soa => f.write_str("SOA"),
            RecordType::Ptr => f.write_str("PTR"),
            RecordType::Txt => f.write_str("TXT"),
            RecordType::Aaaa => f.write_str("AAAA"),
            RecordType::Any => f.write_str("ANY"),
            RecordType::Other(v) => write!(f, "TYPE{v}"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct Question {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
}

impl Question {
    pub fn new(name: impl Into<String>, rtype: RecordType) -> Self {
        Question {
            name: name.into(),
            rtype,
            class: CLASS_IN,
        }
    }
}

impl Decode for Question {
    fn decode(buf: &mut WireBuf<'_>) -> anyhow::Result<Self> {
        let name = buf.read_name().context("QNAME is missing")?;
        let rtype = buf.read_u16().context("QTYPE is missing")?.into();
        let class = buf.read_u16().context("QCLASS is missing")?;
        Ok(Question { name, rtype, class })
    }
}

impl Encode for Question {
    fn encode(&self, buf: &mut WireBuf<'_>, names: &mut NameCache) -> anyhow::Result<()> {
        buf.write_name(&self.name, Some(names)).context("writing QNAME")?;
        buf.put_u16(self.rtype.into());
        buf.put_u16(self.class);
        Ok(())
    }
}
