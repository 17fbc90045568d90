use core::str;
use std::borrow::Cow;
use std::collections::HashMap;

use anyhow::Context;

/// Offsets of already-written name suffixes, used to emit compression pointers.
pub type NameCache = HashMap<String, u16>;

pub trait Decode: Sized {
    fn decode(buf: &mut WireBuf<'_>) -> anyhow::Result<Self>;
}

pub trait Encode {
    fn encode(&self, buf: &mut WireBuf<'_>, names: &mut NameCache) -> anyhow::Result<()>;
}

/// Cursor over a DNS message buffer. Reads advance `pos`; writes append at the end.
pub struct WireBuf<'a> {
    data: Cow<'a, [u8]>,
    pos: usize,
}

impl<'a> WireBuf<'a> {
    pub fn parse(src: &[u8]) -> WireBuf<'_> {
        WireBuf {
            data: Cow::Borrowed(src),
            pos: 0,
        }
    }

    pub fn build() -> WireBuf<'static> {
        WireBuf {
            data: Cow::Owned(Vec::with_capacity(512)),
            pos: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data.into_owned()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Moves the read cursor to an absolute position within the buffer.
    pub fn seek(&mut self, pos: usize) -> anyhow::Result<()> {
        anyhow::ensure!(pos <= self.data.len(), "seek past the end of the buffer");
        self.pos = pos;
        Ok(())
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        let b = *self.data.get(self.pos).context("unexpected end of message")?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        self.take(2)
            .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        self.take(4)
            .map(|bytes| u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn take(&mut self, n: usize) -> anyhow::Result<&[u8]> {
        let bytes = self
            .data
            .get(self.pos..self.pos + n)
            .context("unexpected end of message")?;
        self.pos += n;
        Ok(bytes)
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.to_mut().push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.to_mut().extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.to_mut().extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_slice(&mut self, src: &[u8]) {
        self.data.to_mut().extend_from_slice(src);
    }

    /// Overwrites two bytes written earlier, e.g. a stubbed RDLENGTH.
    pub fn patch_u16(&mut self, at: usize, v: u16) -> anyhow::Result<()> {
        let slot = self
            .data
            .to_mut()
            .get_mut(at..at + 2)
            .context("patch position is out of bounds")?;
        slot.copy_from_slice(&v.to_be_bytes());
        Ok(())
    }

    /// Reads a possibly-compressed domain name and leaves the cursor right
    /// after its in-stream representation. The returned name carries no
    /// trailing dot; the root name is the empty string.
    pub fn read_name(&mut self) -> anyhow::Result<String> {
        let mut labels: Vec<&str> = Vec::new();
        let mut pos = self.pos;
        let mut jumps = 0;
        // Position to resume reading from, captured before the first jump.
        let mut resume: Option<usize> = None;
        loop {
            let len = *self.data.get(pos).context("name runs past the end of the message")? as usize;
            if len & 0xC0 == 0xC0 {
                let lo = *self
                    .data
                    .get(pos + 1)
                    .context("compression pointer is missing its second byte")?
                    as usize;
                if resume.is_none() {
                    resume = Some(pos + 2);
                }
                jumps += 1;
                anyhow::ensure!(jumps <= 16, "too many compression pointers, assuming a loop");
                pos = ((len & 0x3F) << 8) | lo;
            } else if len == 0 {
                if resume.is_none() {
                    resume = Some(pos + 1);
                }
                break;
            } else {
                let bytes = self
                    .data
                    .get(pos + 1..pos + 1 + len)
                    .with_context(|| format!("label of length {len} runs past the end of the message"))?;
                labels.push(str::from_utf8(bytes).context("label is not valid UTF-8")?);
                pos += 1 + len;
            }
        }
        let name = labels.join(".");
        if let Some(resume) = resume {
            self.pos = resume;
        }
        Ok(name)
    }

    /// Writes a domain name, emitting a compression pointer for the longest
    /// suffix already present in `names`.
    pub fn write_name(&mut self, name: &str, mut names: Option<&mut NameCache>) -> anyhow::Result<()> {
        let name = name.trim_end_matches('.');
        if name.is_empty() {
            self.put_u8(0);
            return Ok(());
        }
        anyhow::ensure!(name.len() <= 253, "name '{name}' is too long");

        let mut rest = name;
        loop {
            if let Some(&offset) = names.as_deref().and_then(|cache| cache.get(rest)) {
                self.put_u16(0xC000 | offset);
                return Ok(());
            }
            let here = self.data.len();
            if here <= 0x3FFF {
                if let Some(cache) = names.as_deref_mut() {
                    cache.insert(rest.to_string(), here as u16);
                }
            }
            let (label, tail) = match rest.split_once('.') {
                Some((label, tail)) => (label, Some(tail)),
                None => (rest, None),
            };
            anyhow::ensure!(
                !label.is_empty() && label.len() <= 63,
                "invalid label '{label}' in name '{name}'"
            );
            self.put_u8(label.len() as u8);
            self.put_slice(label.as_bytes());
            match tail {
                Some(tail) => rest = tail,
                None => break,
            }
        }
        self.put_u8(0);
        Ok(())
    }
}
