//! Common constants, functions, and types for inspecting and constructing
//! DNS messages.
//!
//! Everything protocol-agnostic about DNS messages lives here: decoding and
//! encoding, EDNS inspection, TTL arithmetic, and the canned response
//! shapes the pipeline emits. Transport framing stays in
//! [`server`][crate::server]; filtering decisions stay in
//! [`filter`][crate::filter].

pub mod ecs;
pub mod json;

use trust_dns_proto::op::{Edns, Message, MessageType, ResponseCode};
use trust_dns_proto::rr::{RData, Record, RecordType};

use crate::error::Error;

/// The default size used for EDNS content.
///
/// See <https://datatracker.ietf.org/doc/html/rfc6891#section-6.2.5>.
pub const DEFAULT_EDNS_UDP_SIZE: u16 = 4096;

/// Maximum UDP response size for clients that do not advertise EDNS.
pub const FALLBACK_UDP_SIZE: u16 = 512;

/// Maximum DNS message size over stream transports.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Decodes a wireformat DNS message.
///
/// # Errors
///
/// Returns [`Error::MalformedMessage`] if the bytes do not parse.
pub fn decode(bytes: &[u8]) -> Result<Message, Error> {
    Message::from_vec(bytes).map_err(Error::MalformedMessage)
}

/// Encodes a DNS message to wireformat.
///
/// # Errors
///
/// Returns [`Error::Internal`]: all messages the pipeline builds should
/// encode.
pub fn encode(msg: &Message) -> Result<Vec<u8>, Error> {
    msg.to_vec()
        .map_err(|err| Error::Internal(format!("encoding message: {err}")))
}

/// Encodes a response for a datagram transport, truncating it to `max_size`
/// if needed. A truncated response keeps the question and OPT record, drops
/// every other section, and sets the TC bit.
///
/// # Errors
///
/// See [`encode`].
pub fn encode_for_udp(msg: &Message, max_size: u16) -> Result<Vec<u8>, Error> {
    let bytes = encode(msg)?;
    if bytes.len() <= usize::from(max_size) {
        return Ok(bytes);
    }

    let mut truncated = msg.clone();
    truncated.set_truncated(true);
    truncated.take_answers();
    truncated.take_name_servers();
    truncated.take_additionals();
    if let Some(edns) = msg.edns() {
        truncated.set_edns(edns.clone());
    }

    encode(&truncated)
}

/// The maximum UDP response size advertised by the client, clamped to sane
/// bounds; [`FALLBACK_UDP_SIZE`] without EDNS.
pub fn client_udp_size(req: &Message) -> u16 {
    match req.edns() {
        Some(edns) => edns.max_payload().clamp(512, DEFAULT_EDNS_UDP_SIZE),
        None => FALLBACK_UDP_SIZE,
    }
}

/// True if the message has an EDNS pseudosection with the DNSSEC OK (DO)
/// bit set.
pub fn is_do(msg: &Message) -> bool {
    msg.edns().is_some_and(Edns::dnssec_ok)
}

/// The minimum TTL across every real resource record of the message, or
/// `None` if the message has no such records. OPT pseudo-records are
/// ignored.
pub fn min_ttl(msg: &Message) -> Option<u32> {
    msg.answers()
        .iter()
        .chain(msg.name_servers())
        .chain(msg.additionals())
        .filter(|rec| rec.record_type() != RecordType::OPT)
        .map(Record::ttl)
        .min()
}

/// Decrements every record TTL by `elapsed_secs`, saturating at zero.
pub fn decrement_ttls(msg: &mut Message, elapsed_secs: u32) {
    let adjust = |mut recs: Vec<Record>| -> Vec<Record> {
        for rec in &mut recs {
            if rec.record_type() != RecordType::OPT {
                rec.set_ttl(rec.ttl().saturating_sub(elapsed_secs));
            }
        }

        recs
    };

    let answers = adjust(msg.take_answers());
    msg.insert_answers(answers);
    let authority = adjust(msg.take_name_servers());
    msg.insert_name_servers(authority);
    let additionals = adjust(msg.take_additionals());
    msg.insert_additionals(additionals);
}

/// Starts a response to `req`: same ID and opcode, the question echoed,
/// QR=1, RD echoed, RA set, and the client's EDNS size and DO bit mirrored
/// in a fresh OPT.
pub fn response_from(req: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(req.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(req.op_code());
    resp.set_recursion_desired(req.recursion_desired());
    resp.set_recursion_available(true);
    for query in req.queries() {
        resp.add_query(query.clone());
    }

    if let Some(req_edns) = req.edns() {
        let mut edns = Edns::new();
        edns.set_max_payload(req_edns.max_payload().max(512));
        edns.set_dnssec_ok(req_edns.dnssec_ok());
        resp.set_edns(edns);
    }

    resp
}

/// A response to `req` with the given response code and no records.
pub fn response_with_code(req: &Message, code: ResponseCode) -> Message {
    let mut resp = response_from(req);
    resp.set_response_code(code);
    resp
}

pub fn servfail(req: &Message) -> Message {
    response_with_code(req, ResponseCode::ServFail)
}

pub fn refused(req: &Message) -> Message {
    response_with_code(req, ResponseCode::Refused)
}

pub fn nxdomain(req: &Message) -> Message {
    response_with_code(req, ResponseCode::NXDomain)
}

pub fn formerr(req: &Message) -> Message {
    response_with_code(req, ResponseCode::FormErr)
}

/// True if the answer section holds at least one address or alias record
/// worth examining in the response filtering phase.
pub fn has_filterable_answers(msg: &Message) -> bool {
    msg.answers().iter().any(|rec| {
        matches!(
            rec.data(),
            Some(RData::A(_) | RData::AAAA(_) | RData::CNAME(_) | RData::HTTPS(_)),
        )
    })
}
