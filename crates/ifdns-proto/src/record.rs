use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::Context;

use crate::question::RecordType;
use crate::wire::{Decode, Encode, NameCache, WireBuf};
use crate::CLASS_IN;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Record {
    pub name: String,
    pub class: u16,
    pub ttl: u32,
    pub data: RData,
}

impl Record {
    pub fn new(name: impl Into<String>, ttl: u32, data: RData) -> Self {
        Record {
            name: name.into(),
            class: CLASS_IN,
            ttl,
            data,
        }
    }

    pub fn rtype(&self) -> RecordType {
        self.data.rtype()
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ns(String),
    Soa {
        mname: String,
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Ptr(String),
    Txt(Vec<String>),
    /// Record types the pipeline never inspects, kept as raw RDATA.
    /// Compression pointers inside such RDATA are not rewritten on re-encode.
    Other {
        rtype: u16,
        bytes: Vec<u8>,
    },
}

impl RData {
    pub fn rtype(&self) -> RecordType {
        match self {
            RData::A(_) => RecordType::A,
            RData::Aaaa(_) => RecordType::Aaaa,
            RData::Cname(_) => RecordType::Cname,
            RData::Ns(_) => RecordType::Ns,
            RData::Soa { .. } => RecordType::Soa,
            RData::Ptr(_) => RecordType::Ptr,
            RData::Txt(_) => RecordType::Txt,
            RData::Other { rtype, .. } => RecordType::Other(*rtype),
        }
    }

    fn decode_with_type(buf: &mut WireBuf<'_>, rtype: RecordType) -> anyhow::Result<Self> {
        let rd_length = buf.read_u16().context("RDLENGTH is missing")? as usize;
        let rd_end = buf.pos() + rd_length;
        let data = match rtype {
            RecordType::A => {
                anyhow::ensure!(rd_length == 4, "A record: unexpected RDLENGTH {rd_length}");
                let octets: [u8; 4] = buf.take(4).context("A record: address is missing")?.try_into()?;
                RData::A(Ipv4Addr::from(octets))
            }
            RecordType::Aaaa => {
                anyhow::ensure!(rd_length == 16, "AAAA record: unexpected RDLENGTH {rd_length}");
                let octets: [u8; 16] = buf.take(16).context("AAAA record: address is missing")?.try_into()?;
                RData::Aaaa(Ipv6Addr::from(octets))
            }
            RecordType::Cname => RData::Cname(buf.read_name().context("CNAME record: target is missing")?),
            RecordType::Ns => RData::Ns(buf.read_name().context("NS record: nsdname is missing")?),
            RecordType::Soa => RData::Soa {
                mname: buf.read_name().context("SOA record: mname is missing")?,
                rname: buf.read_name().context("SOA record: rname is missing")?,
                serial: buf.read_u32().context("SOA record: serial is missing")?,
                refresh: buf.read_u32().context("SOA record: refresh is missing")?,
                retry: buf.read_u32().context("SOA record: retry is missing")?,
                expire: buf.read_u32().context("SOA record: expire is missing")?,
                minimum: buf.read_u32().context("SOA record: minimum is missing")?,
            },
            RecordType::Ptr => RData::Ptr(buf.read_name().context("PTR record: target is missing")?),
            RecordType::Txt => {
                let mut strings = Vec::new();
                let mut remaining = rd_length;
                while remaining > 0 {
                    let len = buf.read_u8().context("TXT record: string length is missing")? as usize;
                    anyhow::ensure!(len < remaining, "TXT record: string runs past RDLENGTH");
                    let bytes = buf.take(len).context("TXT record: string is missing")?;
                    strings.push(String::from_utf8_lossy(bytes).into_owned());
                    remaining -= 1 + len;
                }
                RData::Txt(strings)
            }
            RecordType::Any => anyhow::bail!("ANY is not a record type that appears on the wire"),
            other => RData::Other {
                rtype: other.into(),
                bytes: buf
                    .take(rd_length)
                    .with_context(|| format!("{other} record: RDATA is missing"))?
                    .to_vec(),
            },
        };
        // Name decompression may leave the cursor short of RDLENGTH; trust the length field.
        buf.seek(rd_end).context("RDATA is shorter than RDLENGTH")?;
        Ok(data)
    }
}

impl Decode for Record {
    fn decode(buf: &mut WireBuf<'_>) -> anyhow::Result<Self> {
        let name = buf.read_name().context("NAME is missing")?;
        let rtype: RecordType = buf.read_u16().context("TYPE is missing")?.into();
        let class = buf.read_u16().context("CLASS is missing")?;
        let ttl = buf.read_u32().context("TTL is missing")?;
        let data = RData::decode_with_type(buf, rtype).context("can't decode RDATA")?;
        Ok(Record { name, class, ttl, data })
    }
}

impl Encode for Record {
    fn encode(&self, buf: &mut WireBuf<'_>, names: &mut NameCache) -> anyhow::Result<()> {
        buf.write_name(&self.name, Some(names)).context("writing NAME")?;
        buf.put_u16(self.rtype().into());
        buf.put_u16(self.class);
        buf.put_u32(self.ttl);

        // RDLENGTH is not known upfront for name-bearing RDATA; stub and patch.
        let length_at = buf.len();
        buf.put_u16(0);
        match &self.data {
            RData::A(addr) => buf.put_slice(&addr.octets()),
            RData::Aaaa(addr) => buf.put_slice(&addr.octets()),
            RData::Cname(target) => buf.write_name(target, Some(names)).context("writing CNAME target")?,
            RData::Ns(nsdname) => buf.write_name(nsdname, Some(names)).context("writing NSDNAME")?,
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => {
                buf.write_name(mname, Some(names)).context("writing SOA mname")?;
                buf.write_name(rname, Some(names)).context("writing SOA rname")?;
                buf.put_u32(*serial);
                buf.put_u32(*refresh);
                buf.put_u32(*retry);
                buf.put_u32(*expire);
                buf.put_u32(*minimum);
            }
            RData::Ptr(target) => buf.write_name(target, Some(names)).context("writing PTR target")?,
            RData::Txt(strings) => {
                for s in strings {
                    anyhow::ensure!(s.len() <= 255, "TXT record: string is too long");
                    buf.put_u8(s.len() as u8);
                    buf.put_slice(s.as_bytes());
                }
            }
            RData::Other { bytes, .. } => buf.put_slice(bytes),
        }
        let rd_length = buf.len() - length_at - 2;
        buf.patch_u16(length_at, rd_length as u16).context("patching RDLENGTH")
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.\t{}\tIN\t{}\t", self.name, self.ttl, self.rtype())?;
        match &self.data {
            RData::A(addr) => write!(f, "{addr}"),
            RData::Aaaa(addr) => write!(f, "{addr}"),
            RData::Cname(target) => write!(f, "{target}."),
            RData::Ns(nsdname) => write!(f, "{nsdname}."),
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => write!(f, "{mname}. {rname}. {serial} {refresh} {retry} {expire} {minimum}"),
            RData::Ptr(target) => write!(f, "{target}."),
            RData::Txt(strings) => {
                let mut first = true;
                for s in strings {
                    if !first {
                        f.write_str(" ")?;
                    }
                    write!(f, "\"{s}\"")?;
                    first = false;
                }
                Ok(())
            }
            RData::Other { bytes, .. } => {
                write!(f, "\\# {}", bytes.len())?;
                for b in bytes {
                    write!(f, " {b:02x}")?;
                }
                Ok(())
            }
        }
    }
}
