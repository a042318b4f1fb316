//! The JSON rendering of DNS messages served at `/resolve`.
//!
//! Distinct from the RFC 8484 wireformat surface: maps a message onto a
//! JSON object with `Status`, header flags, and the four sections, with
//! each record's RDATA in canonical textual form (address literals for
//! A/AAAA, the target for CNAME, quoted strings for TXT, RFC 9460
//! presentation for SVCB/HTTPS).

use serde::{Deserialize, Serialize};
use trust_dns_proto::op::Message;
use trust_dns_proto::rr::rdata::svcb::{SvcParamValue, SVCB};
use trust_dns_proto::rr::{RData, Record};

/// A DNS message rendered for the JSON API.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JsonMessage {
    #[serde(rename = "Status")]
    pub status: u16,
    #[serde(rename = "TC")]
    pub tc: bool,
    #[serde(rename = "RD")]
    pub rd: bool,
    #[serde(rename = "RA")]
    pub ra: bool,
    #[serde(rename = "AD")]
    pub ad: bool,
    #[serde(rename = "CD")]
    pub cd: bool,
    #[serde(rename = "Question")]
    pub question: Vec<JsonQuestion>,
    #[serde(rename = "Answer", default, skip_serializing_if = "Vec::is_empty")]
    pub answer: Vec<JsonRecord>,
    #[serde(rename = "Authority", default, skip_serializing_if = "Vec::is_empty")]
    pub authority: Vec<JsonRecord>,
    #[serde(rename = "Extra", default, skip_serializing_if = "Vec::is_empty")]
    pub extra: Vec<JsonRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonQuestion {
    pub name: String,
    #[serde(rename = "type")]
    pub rr_type: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JsonRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub rr_type: u16,
    #[serde(rename = "TTL")]
    pub ttl: u32,
    pub data: String,
}

impl From<&Message> for JsonMessage {
    fn from(msg: &Message) -> Self {
        Self {
            status: u16::from(msg.response_code()),
            tc: msg.truncated(),
            rd: msg.recursion_desired(),
            ra: msg.recursion_available(),
            ad: msg.authentic_data(),
            cd: msg.checking_disabled(),
            question: msg
                .queries()
                .iter()
                .map(|q| JsonQuestion {
                    name: q.name().to_string(),
                    rr_type: u16::from(q.query_type()),
                })
                .collect(),
            answer: msg.answers().iter().map(JsonRecord::from).collect(),
            authority: msg.name_servers().iter().map(JsonRecord::from).collect(),
            extra: msg
                .additionals()
                .iter()
                .filter(|rec| rec.record_type() != trust_dns_proto::rr::RecordType::OPT)
                .map(JsonRecord::from)
                .collect(),
        }
    }
}

impl From<&Record> for JsonRecord {
    fn from(rec: &Record) -> Self {
        Self {
            name: rec.name().to_string(),
            rr_type: u16::from(rec.record_type()),
            ttl: rec.ttl(),
            data: rec.data().map(rdata_text).unwrap_or_default(),
        }
    }
}

/// The canonical textual form of an RDATA value. Types the edge never
/// synthesizes or inspects render as an empty string.
fn rdata_text(rdata: &RData) -> String {
    match rdata {
        RData::A(ip) => ip.to_string(),
        RData::AAAA(ip) => ip.to_string(),
        RData::CNAME(name) | RData::NS(name) | RData::PTR(name) => name.to_string(),
        RData::TXT(txt) => txt
            .txt_data()
            .iter()
            .map(|chunk| quote_txt(chunk))
            .collect::<Vec<_>>()
            .join(" "),
        RData::SOA(soa) => format!(
            "{} {} {} {} {} {} {}",
            soa.mname(),
            soa.rname(),
            soa.serial(),
            soa.refresh(),
            soa.retry(),
            soa.expire(),
            soa.minimum(),
        ),
        RData::SVCB(svcb) | RData::HTTPS(svcb) => svcb_presentation(svcb),
        _ => String::new(),
    }
}

/// One TXT character-string, quoted.
fn quote_txt(chunk: &[u8]) -> String {
    let text = String::from_utf8_lossy(chunk);
    let escaped = text.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// RFC 9460 presentation of an SVCB/HTTPS record:
/// `<priority> <target> [alpn=... port=... ipv4hint=... ipv6hint=...]`.
pub fn svcb_presentation(svcb: &SVCB) -> String {
    let mut out = format!("{} {}", svcb.svc_priority(), svcb.target_name());

    for (_, value) in svcb.svc_params() {
        match value {
            SvcParamValue::Alpn(alpn) => {
                out.push_str(" alpn=");
                out.push_str(&alpn.0.join(","));
            }
            SvcParamValue::Port(port) => {
                out.push_str(&format!(" port={port}"));
            }
            SvcParamValue::Ipv4Hint(hint) => {
                let ips: Vec<String> = hint.0.iter().map(ToString::to_string).collect();
                out.push_str(" ipv4hint=");
                out.push_str(&ips.join(","));
            }
            SvcParamValue::Ipv6Hint(hint) => {
                let ips: Vec<String> = hint.0.iter().map(ToString::to_string).collect();
                out.push_str(" ipv6hint=");
                out.push_str(&ips.join(","));
            }
            _ => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    use trust_dns_proto::op::{MessageType, Query, ResponseCode};
    use trust_dns_proto::rr::rdata::svcb::{Alpn, IpHint, SvcParamKey};
    use trust_dns_proto::rr::rdata::TXT;
    use trust_dns_proto::rr::{Name, RecordType};

    use super::*;

    #[test]
    fn renders_a_answer() {
        let name = Name::from_str("example.org.").unwrap();
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.set_recursion_desired(true);
        msg.set_recursion_available(true);
        msg.set_response_code(ResponseCode::NoError);
        msg.add_query(Query::query(name.clone(), RecordType::A));
        msg.add_answer(Record::from_rdata(
            name,
            300,
            RData::A(Ipv4Addr::new(93, 184, 216, 34)),
        ));

        let json = JsonMessage::from(&msg);
        assert_eq!(json.status, 0);
        assert!(json.rd && json.ra);
        assert_eq!(json.question[0].name, "example.org.");
        assert_eq!(json.question[0].rr_type, 1);
        assert_eq!(json.answer[0].data, "93.184.216.34");
        assert_eq!(json.answer[0].ttl, 300);

        let text = serde_json::to_string(&json).unwrap();
        assert!(text.contains("\"Status\":0"), "got: {text}");
        assert!(text.contains("\"Answer\""), "got: {text}");
        assert!(!text.contains("\"Authority\""), "got: {text}");
    }

    #[test]
    fn renders_txt_quoted() {
        let txt = TXT::new(vec!["hello world".to_string(), "x\"y".to_string()]);
        let rec = Record::from_rdata(
            Name::from_str("example.org.").unwrap(),
            60,
            RData::TXT(txt),
        );

        let json = JsonRecord::from(&rec);
        assert_eq!(json.data, "\"hello world\" \"x\\\"y\"");
    }

    #[test]
    fn renders_svcb_presentation() {
        let svcb = SVCB::new(
            1,
            Name::from_str("dns.example.com.").unwrap(),
            vec![
                (
                    SvcParamKey::Alpn,
                    SvcParamValue::Alpn(Alpn(vec!["h2".to_string(), "h3".to_string()])),
                ),
                (SvcParamKey::Port, SvcParamValue::Port(443)),
                (
                    SvcParamKey::Ipv4Hint,
                    SvcParamValue::Ipv4Hint(IpHint(vec![Ipv4Addr::new(94, 140, 14, 14)])),
                ),
            ],
        );

        assert_eq!(
            svcb_presentation(&svcb),
            "1 dns.example.com. alpn=h2,h3 port=443 ipv4hint=94.140.14.14",
        );
    }
}
