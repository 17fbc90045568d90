use std::fmt;

use anyhow::Context;

use crate::wire::{Decode, Encode, NameCache, WireBuf};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Opcode {
    #[default]
    Query,
    InverseQuery,
    Status,
    Other(u8),
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value {
            0 => Opcode::Query,
            1 => Opcode::InverseQuery,
            2 => Opcode::Status,
            other => Opcode::Other(other & 0xF),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(value: Opcode) -> Self {
        match value {
            Opcode::Query => 0,
            Opcode::InverseQuery => 1,
            Opcode::Status => 2,
            Opcode::Other(v) => v & 0xF,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Query => f.write_str("QUERY"),
            Opcode::InverseQuery => f.write_str("IQUERY"),
            Opcode::Status => f.write_str("STATUS"),
            Opcode::Other(v) => write!(f, "OPCODE{v}"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Rcode {
    #[default]
    NoError,
    FormErr,
    ServFail,
    NxDomain,
    NotImp,
    Refused,
    Other(u8),
}

impl From<u8> for Rcode {
    fn from(value: u8) -> Self {
        match value {
            0 => Rcode::NoError,
            1 => Rcode::FormErr,
            2 => Rcode::ServFail,
            3 => Rcode::NxDomain,
            4 => Rcode::NotImp,
            5 => Rcode::Refused,
            other => Rcode::Other(other & 0xF),
        }
    }
}

impl From<Rcode> for u8 {
    fn from(value: Rcode) -> Self {
        match value {
            Rcode::NoError => 0,
            Rcode::FormErr => 1,
            Rcode::ServFail => 2,
            Rcode::NxDomain => 3,
            Rcode::NotImp => 4,
            Rcode::Refused => 5,
            Rcode::Other(v) => v & 0xF,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rcode::NoError => f.write_str("NOERROR"),
            Rcode::FormErr => f.write_str("FORMERR"),
            Rcode::ServFail => f.write_str("SERVFAIL"),
            Rcode::NxDomain => f.write_str("NXDOMAIN"),
            Rcode::NotImp => f.write_str("NOTIMP"),
            Rcode::Refused => f.write_str("REFUSED"),
            Rcode::Other(v) => write!(f, "RCODE{v}"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Header {
    pub id: u16,
    pub response: bool,
    pub opcode: Opcode,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    /// Raw Z/AD/CD bits, carried through untouched.
    pub reserved: u8,
    pub rcode: Rcode,
    pub question_count: u16,
    pub answer_count: u16,
    pub authority_count: u16,
    pub additional_count: u16,
}

impl Header {
    pub fn flags_word(&self) -> u16 {
        (self.response as u16) << 15
            | (u8::from(self.opcode) as u16) << 11
            | (self.authoritative as u16) << 10
            | (self.truncated as u16) << 9
            | (self.recursion_desired as u16) << 8
            | (self.recursion_available as u16) << 7
            | ((self.reserved & 0x7) as u16) << 4
            | u8::from(self.rcode) as u16
    }

    fn apply_flags_word(&mut self, flags: u16) {
        self.response = flags & 0x8000 != 0;
        self.opcode = (((flags >> 11) & 0xF) as u8).into();
        self.authoritative = flags & 0x0400 != 0;
        self.truncated = flags & 0x0200 != 0;
        self.recursion_desired = flags & 0x0100 != 0;
        self.recursion_available = flags & 0x0080 != 0;
        self.reserved = ((flags >> 4) & 0x7) as u8;
        self.rcode = ((flags & 0xF) as u8).into();
    }
}

impl Decode for Header {
    fn decode(buf: &mut WireBuf<'_>) -> anyhow::Result<Self> {
        let mut header = Header {
            id: buf.read_u16().context("id is missing")?,
            ..Default::default()
        };
        header.apply_flags_word(buf.read_u16().context("flags are missing")?);
        header.question_count = buf.read_u16().context("question count is missing")?;
        header.answer_count = buf.read_u16().context("answer count is missing")?;
        header.authority_count = buf.read_u16().context("authority count is missing")?;
        header.additional_count = buf.read_u16().context("additional count is missing")?;
        Ok(header)
    }
}

impl Encode for Header {
    fn encode(&self, buf: &mut WireBuf<'_>, _names: &mut NameCache) -> anyhow::Result<()> {
        buf.put_u16(self.id);
        buf.put_u16(self.flags_word());
        buf.put_u16(self.question_count);
        buf.put_u16(self.answer_count);
        buf.put_u16(self.authority_count);
        buf.put_u16(self.additional_count);
        Ok(())
    }
}
