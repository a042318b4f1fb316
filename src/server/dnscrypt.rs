//! DNSCrypt v2 over UDP.
//!
//! The server publishes a signed certificate as a TXT answer for the
//! provider name (`2.dnscrypt-cert.<domain>`); the certificate carries the
//! short-term X25519 public key and the client magic. Encrypted queries
//! open with that magic, followed by the client's public key, its half of
//! the nonce, and an XChaCha20-Poly1305 box. The X25519 shared secret is
//! computed once per client public key and cached; subsequent queries from
//! the same client reuse it.
//!
//! Queries are padded to a 256-byte minimum with the ISO/IEC 7816-4 scheme
//! (`0x80` then zeros); responses are padded to a 64-byte boundary.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use dashmap::DashMap;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;
use rand::RngCore;
use tokio::net::UdpSocket;
use trust_dns_proto::op::{MessageType, OpCode};
use trust_dns_proto::rr::rdata::TXT;
use trust_dns_proto::rr::{Name, RData, Record, RecordType};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::config::DnsCryptConfig;
use crate::dnsmsg;
use crate::error::Error;
use crate::pipeline::{Outcome, Pipeline};

use super::{ClientInfo, Protocol, ServerGroup};

const CERT_MAGIC: [u8; 4] = *b"DNSC";
const ES_VERSION_XCHACHA: [u8; 2] = [0x00, 0x02];
const PROTOCOL_MINOR: [u8; 2] = [0x00, 0x00];
const RESOLVER_MAGIC: &[u8; 8] = b"r6fnvWj8";

const CLIENT_MAGIC_LEN: usize = 8;
const PUBLIC_KEY_LEN: usize = 32;
const CLIENT_NONCE_LEN: usize = 12;
const RESOLVER_NONCE_LEN: usize = 12;

/// Minimum padded query length.
const MIN_QUERY_LEN: usize = 256;
/// Responses are padded to this boundary.
const RESPONSE_PAD_TO: usize = 64;

struct CertState {
    wire: Vec<u8>,
    expires: SystemTime,
}

/// The per-server DNSCrypt state.
pub struct DnsCryptServer {
    provider_name: Name,
    signing_key: SigningKey,
    secret: StaticSecret,
    public_key: PublicKey,
    client_magic: [u8; CLIENT_MAGIC_LEN],
    cert_ttl: Duration,
    serial: std::sync::atomic::AtomicU32,
    cert: Mutex<Option<CertState>>,
    /// Precomputed X25519 shared keys per client public key.
    shared_keys: DashMap<[u8; PUBLIC_KEY_LEN], [u8; 32]>,
}

impl DnsCryptServer {
    /// Builds the server state from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the provider key is not a hex-encoded
    /// 32-byte Ed25519 seed or the provider name does not parse.
    pub fn new(conf: &DnsCryptConfig) -> Result<Self, Error> {
        let seed = decode_hex_key(&conf.provider_key)?;
        let signing_key = SigningKey::from_bytes(&seed);

        let mut provider_name = Name::from_ascii(&conf.provider_name)
            .map_err(|err| Error::Config(format!("dnscrypt provider name: {err}")))?;
        provider_name.set_fqdn(true);

        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public_key = PublicKey::from(&secret);

        let mut client_magic = [0u8; CLIENT_MAGIC_LEN];
        rand::thread_rng().fill_bytes(&mut client_magic);

        Ok(Self {
            provider_name,
            signing_key,
            secret,
            public_key,
            client_magic,
            cert_ttl: conf.certificate_ttl.as_duration(),
            serial: std::sync::atomic::AtomicU32::new(1),
            cert: Mutex::new(None),
            shared_keys: DashMap::new(),
        })
    }

    /// Serves DNSCrypt datagrams on `addr`.
    pub async fn serve(
        self: Arc<Self>,
        pipeline: Arc<Pipeline>,
        group: Arc<ServerGroup>,
        addr: SocketAddr,
    ) -> Result<(), Error> {
        let sock = Arc::new(UdpSocket::bind(addr).await?);
        tracing::info!(%addr, provider = %self.provider_name, "dnscrypt listening");

        loop {
            let mut buf = vec![0; dnsmsg::DEFAULT_EDNS_UDP_SIZE as usize];
            let (len, peer) = match sock.recv_from(&mut buf).await {
                Ok(recv) => recv,
                Err(err) => {
                    tracing::warn!(error = %err, "dnscrypt recv error");
                    continue;
                }
            };
            buf.truncate(len);

            let server = Arc::clone(&self);
            let sock = Arc::clone(&sock);
            let pipeline = Arc::clone(&pipeline);
            let group = Arc::clone(&group);
            tokio::spawn(async move {
                match server.handle_datagram(&pipeline, &group, &buf, peer).await {
                    Ok(Some(reply)) => {
                        if let Err(err) = sock.send_to(&reply, peer).await {
                            tracing::debug!(error = %err, %peer, "dnscrypt send error");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => tracing::debug!(error = %err, %peer, "dnscrypt drop"),
                }
            });
        }
    }

    async fn handle_datagram(
        &self,
        pipeline: &Pipeline,
        group: &ServerGroup,
        raw: &[u8],
        peer: SocketAddr,
    ) -> Result<Option<Vec<u8>>, Error> {
        if raw.starts_with(&self.client_magic) {
            return self.handle_encrypted(pipeline, group, raw, peer).await;
        }

        // Not an encrypted query; the only plain query answered on this
        // port is the provider certificate TXT.
        self.handle_cert_query(raw)
    }

    async fn handle_encrypted(
        &self,
        pipeline: &Pipeline,
        group: &ServerGroup,
        raw: &[u8],
        peer: SocketAddr,
    ) -> Result<Option<Vec<u8>>, Error> {
        let min_len = CLIENT_MAGIC_LEN + PUBLIC_KEY_LEN + CLIENT_NONCE_LEN;
        if raw.len() <= min_len {
            return Err(Error::DnsCrypt("query too short".into()));
        }

        let mut client_pk = [0u8; PUBLIC_KEY_LEN];
        client_pk.copy_from_slice(&raw[CLIENT_MAGIC_LEN..CLIENT_MAGIC_LEN + PUBLIC_KEY_LEN]);
        let client_nonce = &raw[min_len - CLIENT_NONCE_LEN..min_len];
        let sealed = &raw[min_len..];

        let shared = self.shared_key(client_pk);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&shared));

        let mut nonce = [0u8; 24];
        nonce[..CLIENT_NONCE_LEN].copy_from_slice(client_nonce);
        let padded = cipher
            .decrypt(XNonce::from_slice(&nonce), sealed)
            .map_err(|_| Error::DnsCrypt("query failed to decrypt".into()))?;
        let query = unpad(&padded).ok_or_else(|| Error::DnsCrypt("bad query padding".into()))?;

        let client = ClientInfo::plain(peer);
        let outcome = pipeline
            .handle(query, &client, group, Protocol::DnsCrypt)
            .await;
        let resp = match outcome {
            Outcome::Respond(resp) => resp,
            Outcome::Drop => return Ok(None),
        };

        let mut resolver_nonce = [0u8; RESOLVER_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut resolver_nonce);
        let mut full_nonce = [0u8; 24];
        full_nonce[..CLIENT_NONCE_LEN].copy_from_slice(client_nonce);
        full_nonce[CLIENT_NONCE_LEN..].copy_from_slice(&resolver_nonce);

        let padded = pad(&resp.wire, RESPONSE_PAD_TO);
        let sealed = cipher
            .encrypt(XNonce::from_slice(&full_nonce), padded.as_slice())
            .map_err(|_| Error::DnsCrypt("response failed to encrypt".into()))?;

        let mut reply = Vec::with_capacity(RESOLVER_MAGIC.len() + full_nonce.len() + sealed.len());
        reply.extend_from_slice(RESOLVER_MAGIC);
        reply.extend_from_slice(&full_nonce);
        reply.extend_from_slice(&sealed);
        Ok(Some(reply))
    }

    /// Answers a plain TXT query for the provider name with the signed
    /// certificate.
    fn handle_cert_query(&self, raw: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let req = dnsmsg::decode(raw)?;
        if req.op_code() != OpCode::Query || req.message_type() != MessageType::Query {
            return Ok(None);
        }

        let Some(query) = req.queries().first() else {
            return Ok(None);
        };
        if query.query_type() != RecordType::TXT
            || query.name().to_lowercase() != self.provider_name
        {
            return Ok(None);
        }

        let cert = self.current_cert();
        let mut resp = dnsmsg::response_from(&req);
        resp.add_answer(Record::from_rdata(
            query.name().clone(),
            600,
            RData::TXT(TXT::from_bytes(vec![cert.as_slice()])),
        ));

        Ok(Some(dnsmsg::encode(&resp)?))
    }

    /// The current certificate, rebuilt when the previous one expires.
    fn current_cert(&self) -> Vec<u8> {
        let mut cert = self.cert.lock();
        let now = SystemTime::now();
        if let Some(state) = cert.as_ref() {
            if now < state.expires {
                return state.wire.clone();
            }
        }

        let serial = self
            .serial
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let wire = self.build_cert(now, serial);
        *cert = Some(CertState {
            wire: wire.clone(),
            expires: now + self.cert_ttl,
        });

        wire
    }

    fn build_cert(&self, now: SystemTime, serial: u32) -> Vec<u8> {
        let ts_start = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let ts_end = ts_start.saturating_add(self.cert_ttl.as_secs() as u32);

        // The signed portion: resolver pk, client magic, serial, validity.
        let mut signed = Vec::with_capacity(52);
        signed.extend_from_slice(self.public_key.as_bytes());
        signed.extend_from_slice(&self.client_magic);
        signed.extend_from_slice(&serial.to_be_bytes());
        signed.extend_from_slice(&ts_start.to_be_bytes());
        signed.extend_from_slice(&ts_end.to_be_bytes());

        let signature = self.signing_key.sign(&signed);

        let mut cert = Vec::with_capacity(4 + 2 + 2 + 64 + signed.len());
        cert.extend_from_slice(&CERT_MAGIC);
        cert.extend_from_slice(&ES_VERSION_XCHACHA);
        cert.extend_from_slice(&PROTOCOL_MINOR);
        cert.extend_from_slice(&signature.to_bytes());
        cert.extend_from_slice(&signed);
        cert
    }

    fn shared_key(&self, client_pk: [u8; PUBLIC_KEY_LEN]) -> [u8; 32] {
        if let Some(key) = self.shared_keys.get(&client_pk) {
            return *key;
        }

        let shared = self
            .secret
            .diffie_hellman(&PublicKey::from(client_pk))
            .to_bytes();
        self.shared_keys.insert(client_pk, shared);
        shared
    }
}

fn decode_hex_key(raw: &str) -> Result<[u8; 32], Error> {
    let cleaned: String = raw.chars().filter(|c| *c != ':').collect();
    let bytes = hex::decode(cleaned)
        .map_err(|err| Error::Config(format!("dnscrypt provider key: {err}")))?;
    <[u8; 32]>::try_from(bytes.as_slice())
        .map_err(|_| Error::Config("dnscrypt provider key: want 32 bytes".into()))
}

/// ISO/IEC 7816-4 padding: `0x80`, zeros to the boundary (or minimum).
fn pad(msg: &[u8], boundary: usize) -> Vec<u8> {
    let target = (msg.len() + 1).div_ceil(boundary) * boundary;
    let target = target.max(boundary);
    let mut padded = Vec::with_capacity(target);
    padded.extend_from_slice(msg);
    padded.push(0x80);
    padded.resize(target, 0);
    padded
}

fn unpad(padded: &[u8]) -> Option<&[u8]> {
    let pos = padded.iter().rposition(|&b| b != 0)?;
    (padded[pos] == 0x80).then(|| &padded[..pos])
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration as StdDuration;

    use trust_dns_proto::op::Message;

    use crate::config::GoDuration;

    use super::*;

    fn test_server() -> DnsCryptServer {
        let conf = DnsCryptConfig {
            provider_name: "2.dnscrypt-cert.example.com".to_string(),
            provider_key: hex::encode([7u8; 32]),
            certificate_ttl: GoDuration(StdDuration::from_secs(86400)),
        };
        DnsCryptServer::new(&conf).unwrap()
    }

    /// The client side of query padding: to the 256-byte minimum.
    fn pad_query(msg: &[u8]) -> Vec<u8> {
        let mut padded = msg.to_vec();
        padded.push(0x80);
        if padded.len() < MIN_QUERY_LEN {
            padded.resize(MIN_QUERY_LEN, 0);
        }
        padded
    }

    #[test]
    fn padding_roundtrip() {
        for len in [0, 1, 63, 64, 65, 200, 512] {
            let msg = vec![0xAB; len];
            let padded = pad_query(&msg);
            assert!(padded.len() >= MIN_QUERY_LEN || len + 1 > MIN_QUERY_LEN);
            assert_eq!(unpad(&padded).unwrap(), msg.as_slice());
        }
    }

    #[test]
    fn cert_is_signed_and_versioned() {
        use ed25519_dalek::Verifier;

        let server = test_server();
        let cert = server.current_cert();

        assert_eq!(&cert[..4], &CERT_MAGIC);
        assert_eq!(&cert[4..6], &ES_VERSION_XCHACHA);

        let signature = ed25519_dalek::Signature::from_bytes(
            <&[u8; 64]>::try_from(&cert[8..72]).unwrap(),
        );
        let signed = &cert[72..];
        server
            .signing_key
            .verifying_key()
            .verify(signed, &signature)
            .unwrap();

        // The resolver public key leads the signed portion.
        assert_eq!(&signed[..32], server.public_key.as_bytes());
    }

    #[test]
    fn cert_query_answered() {
        let server = test_server();

        let mut req = Message::new();
        req.set_id(42);
        req.set_message_type(MessageType::Query);
        req.set_op_code(OpCode::Query);
        req.add_query(trust_dns_proto::op::Query::query(
            Name::from_str("2.dnscrypt-cert.example.com.").unwrap(),
            RecordType::TXT,
        ));
        let raw = dnsmsg::encode(&req).unwrap();

        let reply = server.handle_cert_query(&raw).unwrap().unwrap();
        let resp = dnsmsg::decode(&reply).unwrap();
        assert_eq!(resp.id(), 42);
        assert_eq!(resp.answers().len(), 1);

        let Some(RData::TXT(txt)) = resp.answers()[0].data() else {
            panic!("want a txt answer");
        };
        let cert: Vec<u8> = txt.txt_data().iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(&cert[..4], &CERT_MAGIC);
    }

    #[test]
    fn shared_keys_are_cached() {
        let server = test_server();
        let client_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let client_pk = PublicKey::from(&client_secret).to_bytes();

        let first = server.shared_key(client_pk);
        let second = server.shared_key(client_pk);
        assert_eq!(first, second);
        assert_eq!(server.shared_keys.len(), 1);

        // The client derives the same secret from the server's public key.
        let client_side = client_secret
            .diffie_hellman(&PublicKey::from(server.public_key.to_bytes()))
            .to_bytes();
        assert_eq!(first, client_side);
    }
}
