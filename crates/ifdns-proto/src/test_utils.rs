use proptest::prelude::*;

use crate::{Header, Message, Opcode, Question, RData, Rcode, Record, RecordType};

pub fn arb_name() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z][a-z0-9-]{0,9}", 1..4).prop_map(|labels| labels.join("."))
}

pub fn arb_question() -> impl Strategy<Value = Question> {
    (arb_name(), arb_record_type(), 1..=4u16).prop_map(|(name, rtype, class)| Question { name, rtype, class })
}

fn arb_record_type() -> impl Strategy<Value = RecordType> {
    prop_oneof![
        Just(RecordType::A),
        Just(RecordType::Ns),
        Just(RecordType::Cname),
        Just(RecordType::Soa),
        Just(RecordType::Ptr),
        Just(RecordType::Txt),
        Just(RecordType::Aaaa),
        // Values below 1000 could collide with types this crate decodes.
        (1000..=u16::MAX).prop_map(RecordType::Other),
    ]
}

fn arb_rdata() -> impl Strategy<Value = RData> {
    prop_oneof![
        any::<[u8; 4]>().prop_map(|octets| RData::A(octets.into())),
        any::<[u8; 16]>().prop_map(|octets| RData::Aaaa(octets.into())),
        arb_name().prop_map(RData::Cname),
        arb_name().prop_map(RData::Ns),
        arb_name().prop_map(RData::Ptr),
        prop::collection::vec("[ -~]{0,40}", 0..3).prop_map(RData::Txt),
        (arb_name(), arb_name(), any::<[u32; 5]>()).prop_map(|(mname, rname, [serial, refresh, retry, expire, minimum])| {
            RData::Soa {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            }
        }),
        ((1000..=u16::MAX), prop::collection::vec(any::<u8>(), 0..32))
            .prop_map(|(rtype, bytes)| RData::Other { rtype, bytes }),
    ]
}

pub fn arb_record() -> impl Strategy<Value = Record> {
    (arb_name(), 1..=4u16, any::<u32>(), arb_rdata()).prop_map(|(name, class, ttl, data)| Record {
        name,
        class,
        ttl,
        data,
    })
}

fn arb_opcode() -> impl Strategy<Value = Opcode> {
    prop_oneof![Just(Opcode::Query), Just(Opcode::InverseQuery), Just(Opcode::Status)]
}

fn arb_rcode() -> impl Strategy<Value = Rcode> {
    prop_oneof![
        Just(Rcode::NoError),
        Just(Rcode::FormErr),
        Just(Rcode::ServFail),
        Just(Rcode::NxDomain),
        Just(Rcode::NotImp),
        Just(Rcode::Refused),
    ]
}

pub fn arb_message() -> impl Strategy<Value = Message> {
    (
        (any::<u16>(), any::<bool>(), arb_opcode(), any::<[bool; 4]>(), 0..8u8, arb_rcode()),
        prop::collection::vec(arb_question(), 0..3),
        prop::collection::vec(arb_record(), 0..4),
        prop::collection::vec(arb_record(), 0..3),
        prop::collection::vec(arb_record(), 0..3),
    )
        .prop_map(
            |(
                (id, response, opcode, [authoritative, truncated, recursion_desired, recursion_available], reserved, rcode),
                questions,
                answers,
                authorities,
                additionals,
            )| {
                let header = Header {
                    id,
                    response,
                    opcode,
                    authoritative,
                    truncated,
                    recursion_desired,
                    recursion_available,
                    reserved,
                    rcode,
                    question_count: questions.len() as u16,
                    answer_count: answers.len() as u16,
                    authority_count: authorities.len() as u16,
                    additional_count: additionals.len() as u16,
                };
                Message {
                    header,
                    questions,
                    answers,
                    authorities,
                    additionals,
                }
            },
        )
}
