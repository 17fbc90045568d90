//! DNS wire-format types for ifdns.
//!
//! Decoding is tolerant of compression pointers anywhere a name may appear;
//! encoding compresses shared suffixes within a single message. EDNS payloads
//! ride through as opaque records.

#[cfg(test)]
pub(crate) mod test_utils;

mod header;
mod question;
mod record;
mod wire;

use std::fmt;

use anyhow::Context;
pub use header::{Header, Opcode, Rcode};
pub use question::{Question, RecordType, CLASS_IN};
pub use record::{RData, Record};
pub use wire::{Decode, Encode, NameCache, WireBuf};

#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl Message {
    pub fn new() -> Self {
        Message::default()
    }

    /// A recursive query with a single question.
    pub fn query(id: u16, name: impl Into<String>, rtype: RecordType) -> Self {
        let mut msg = Message::new();
        msg.header.id = id;
        msg.header.recursion_desired = true;
        msg.questions.push(Question::new(name, rtype));
        msg
    }

    /// An empty response to `req`: same id and opcode, question echoed back.
    pub fn reply_to(req: &Message, rcode: Rcode) -> Self {
        let mut msg = Message::new();
        msg.header.id = req.header.id;
        msg.header.opcode = req.header.opcode;
        msg.header.response = true;
        msg.header.recursion_desired = req.header.recursion_desired;
        msg.header.recursion_available = true;
        msg.header.rcode = rcode;
        msg.questions = req.questions.clone();
        msg
    }

    pub fn first_question(&self) -> Option<&Question> {
        self.questions.first()
    }

    /// True iff the message carries exactly one question, optionally of the given type.
    pub fn has_single_question(&self, rtype: Option<RecordType>) -> bool {
        match self.questions.as_slice() {
            [question] => rtype.map_or(true, |rtype| question.rtype == rtype),
            _ => false,
        }
    }

    pub fn from_wire(bytes: &[u8]) -> anyhow::Result<Message> {
        Message::decode(&mut WireBuf::parse(bytes))
    }

    pub fn to_wire(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = WireBuf::build();
        self.encode(&mut buf, &mut NameCache::new())?;
        Ok(buf.into_bytes())
    }
}

impl Decode for Message {
    fn decode(buf: &mut WireBuf<'_>) -> anyhow::Result<Self> {
        let header = Header::decode(buf).context("header parsing error")?;

        let mut questions = Vec::with_capacity(header.question_count as usize);
        for idx in 0..header.question_count {
            questions.push(Question::decode(buf).with_context(|| format!("question parsing error at idx {idx}"))?);
        }

        let mut decode_section = |count: u16, section: &str| -> anyhow::Result<Vec<Record>> {
            let mut records = Vec::with_capacity(count as usize);
            for idx in 0..count {
                records.push(
                    Record::decode(buf).with_context(|| format!("{section} record parsing error at idx {idx}"))?,
                );
            }
            Ok(records)
        };

        let answers = decode_section(header.answer_count, "answer")?;
        let authorities = decode_section(header.authority_count, "authority")?;
        let additionals = decode_section(header.additional_count, "additional")?;

        Ok(Message {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

impl Encode for Message {
    fn encode(&self, buf: &mut WireBuf<'_>, names: &mut NameCache) -> anyhow::Result<()> {
        // Counts are derived from the sections rather than trusted from the header.
        let mut header = self.header.clone();
        header.question_count = self.questions.len() as u16;
        header.answer_count = self.answers.len() as u16;
        header.authority_count = self.authorities.len() as u16;
        header.additional_count = self.additionals.len() as u16;
        header.encode(buf, names).context("writing header")?;

        for (idx, question) in self.questions.iter().enumerate() {
            question
                .encode(buf, names)
                .with_context(|| format!("writing question at idx {idx}"))?;
        }
        for (section, records) in [
            ("answer", &self.answers),
            ("authority", &self.authorities),
            ("additional", &self.additionals),
        ] {
            for (idx, record) in records.iter().enumerate() {
                record
                    .encode(buf, names)
                    .with_context(|| format!("writing {section} record at idx {idx}"))?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            ";; opcode: {}, status: {}, id: {}",
            self.header.opcode, self.header.rcode, self.header.id
        )?;
        write!(f, "\n;; flags:")?;
        for (set, flag) in [
            (self.header.response, "qr"),
            (self.header.authoritative, "aa"),
            (self.header.truncated, "tc"),
            (self.header.recursion_desired, "rd"),
            (self.header.recursion_available, "ra"),
        ] {
            if set {
                write!(f, " {flag}")?;
            }
        }
        write!(
            f,
            "; QUERY: {}, ANSWER: {}, AUTHORITY: {}, ADDITIONAL: {}",
            self.questions.len(),
            self.answers.len(),
            self.authorities.len(),
            self.additionals.len()
        )?;
        if !self.questions.is_empty() {
            write!(f, "\n\n;; QUESTION SECTION:")?;
            for q in &self.questions {
                write!(f, "\n;{}.\tIN\t{}", q.name, q.rtype)?;
            }
        }
        for (title, records) in [
            ("ANSWER", &self.answers),
            ("AUTHORITY", &self.authorities),
            ("ADDITIONAL", &self.additionals),
        ] {
            if !records.is_empty() {
                write!(f, "\n\n;; {title} SECTION:")?;
                for record in records {
                    write!(f, "\n{record}")?;
                }
            }
        }
        Ok(())
    }
}
