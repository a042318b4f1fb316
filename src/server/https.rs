//! DNS over HTTPS (RFC 8484) and the JSON variant.
//!
//! The server answers `/dns-query` (GET with `?dns=<base64url>`, POST with
//! an `application/dns-message` body), `/resolve` (the JSON API), and
//! `/dns-query/<device-id>[/]` for device-scoped queries. TLS is terminated
//! here so the SNI reaches device-ID detection; paths the DNS surface does
//! not own are left to an external web handler and answered 404 in its
//! absence.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::{header, Method, Request, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use trust_dns_proto::op::{Edns, Message, MessageType, OpCode, Query};
use trust_dns_proto::rr::{Name, RecordType};
use trust_dns_proto::serialize::binary::BinEncodable;

use crate::dnsmsg::{self, json::JsonMessage};
use crate::error::Error;
use crate::pipeline::{Outcome, Pipeline};

use super::{ClientInfo, Protocol, ServerGroup};

const CONTENT_TYPE_DNS_MESSAGE: &str = "application/dns-message";
const CONTENT_TYPE_DNS_JSON: &str = "application/dns-json";

/// The per-request HTTP body cap; far above any legal DNS message.
const MAX_BODY_BYTES: usize = dnsmsg::MAX_MESSAGE_SIZE;

#[derive(Clone)]
struct HttpsState {
    pipeline: Arc<Pipeline>,
    group: Arc<ServerGroup>,
}

/// Connection-scoped facts injected under each request.
#[derive(Clone)]
struct ConnMeta {
    peer: SocketAddr,
    server_name: Option<String>,
}

/// Serves DoH on `addr`. With TLS material on the group the listener
/// terminates TLS itself; without it the server speaks plain HTTP for
/// deployments behind a terminating proxy.
pub async fn serve(
    pipeline: Arc<Pipeline>,
    group: Arc<ServerGroup>,
    addr: SocketAddr,
    request_timeout: Duration,
) -> Result<(), Error> {
    let acceptor = if group.has_tls() {
        Some(TlsAcceptor::from(
            group.tls_config(&[b"h2", b"http/1.1"])?,
        ))
    } else {
        None
    };

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, tls = acceptor.is_some(), "https listening");

    let state = HttpsState { pipeline, group };
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "https accept error");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let state = state.clone();
        tokio::spawn(async move {
            match acceptor {
                Some(acceptor) => {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(tls_stream) => tls_stream,
                        Err(err) => {
                            tracing::debug!(error = %err, %peer, "https handshake failed");
                            return;
                        }
                    };
                    let server_name = tls_stream
                        .get_ref()
                        .1
                        .server_name()
                        .map(ToString::to_string);
                    serve_connection(state, tls_stream, peer, server_name, request_timeout).await;
                }
                None => {
                    serve_connection(state, stream, peer, None, request_timeout).await;
                }
            }
        });
    }
}

async fn serve_connection<S>(
    state: HttpsState,
    stream: S,
    peer: SocketAddr,
    server_name: Option<String>,
    request_timeout: Duration,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let app = Router::new()
        .fallback(handle_http)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::timeout::TimeoutLayer::new(request_timeout))
        .layer(Extension(ConnMeta { peer, server_name }))
        .with_state(state);

    if let Err(err) = hyper::server::conn::Http::new()
        .serve_connection(stream, app)
        .await
    {
        tracing::debug!(error = %err, %peer, "https connection error");
    }
}

async fn handle_http(
    State(state): State<HttpsState>,
    Extension(meta): Extension<ConnMeta>,
    req: Request<Body>,
) -> HttpResponse {
    let path = req.uri().path().to_string();

    if path == "/resolve" {
        return handle_json(&state, &meta, &req).await;
    }

    if path.starts_with("/dns-query") {
        return handle_wireformat(&state, &meta, req).await;
    }

    // Non-DNS paths belong to the external web handler.
    StatusCode::NOT_FOUND.into_response()
}

/// The RFC 8484 wireformat endpoint.
async fn handle_wireformat(
    state: &HttpsState,
    meta: &ConnMeta,
    req: Request<Body>,
) -> HttpResponse {
    let path = req.uri().path().to_string();

    let raw = if req.method() == Method::GET {
        let Some(dns_param) = req.uri().query().and_then(|q| url_query_param(q, "dns")) else {
            return (StatusCode::BAD_REQUEST, "missing dns query parameter").into_response();
        };
        match URL_SAFE_NO_PAD.decode(dns_param.as_bytes()) {
            Ok(raw) => raw,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, "bad dns query parameter").into_response();
            }
        }
    } else if req.method() == Method::POST {
        let body = match hyper::body::to_bytes(req.into_body()).await {
            Ok(body) => body,
            Err(_) => return StatusCode::BAD_REQUEST.into_response(),
        };
        if body.len() > MAX_BODY_BYTES {
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
        body.to_vec()
    } else {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    };

    let client = ClientInfo {
        addr: meta.peer,
        tls_server_name: meta.server_name.clone(),
        url_path: Some(path),
    };

    match state
        .pipeline
        .handle(&raw, &client, &state.group, Protocol::Https)
        .await
    {
        Outcome::Respond(resp) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, CONTENT_TYPE_DNS_MESSAGE)],
            resp.wire,
        )
            .into_response(),
        Outcome::Drop => StatusCode::TOO_MANY_REQUESTS.into_response(),
    }
}

/// The JSON endpoint: `GET /resolve?name=&type=&cd=&do=&ct=`.
async fn handle_json(state: &HttpsState, meta: &ConnMeta, req: &Request<Body>) -> HttpResponse {
    if req.method() != Method::GET {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let query = req.uri().query().unwrap_or_default();
    let Some(name_param) = url_query_param(query, "name") else {
        return (StatusCode::BAD_REQUEST, "missing name parameter").into_response();
    };
    let Ok(mut name) = Name::from_ascii(&name_param) else {
        return (StatusCode::BAD_REQUEST, "bad name parameter").into_response();
    };
    name.set_fqdn(true);

    let qtype = match url_query_param(query, "type") {
        None => RecordType::A,
        Some(raw) => match parse_record_type(&raw) {
            Some(qtype) => qtype,
            None => return (StatusCode::BAD_REQUEST, "bad type parameter").into_response(),
        },
    };
    let checking_disabled = url_query_param(query, "cd").is_some_and(|v| truthy(&v));
    let dnssec_ok = url_query_param(query, "do").is_some_and(|v| truthy(&v));

    let mut msg = Message::new();
    msg.set_id(rand::random());
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    msg.set_checking_disabled(checking_disabled);
    msg.add_query(Query::query(name, qtype));
    if dnssec_ok {
        let mut edns = Edns::new();
        edns.set_max_payload(dnsmsg::DEFAULT_EDNS_UDP_SIZE);
        edns.set_dnssec_ok(true);
        msg.set_edns(edns);
    }

    let raw = match msg.to_bytes() {
        Ok(raw) => raw,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    let client = ClientInfo {
        addr: meta.peer,
        tls_server_name: meta.server_name.clone(),
        url_path: None,
    };

    match state
        .pipeline
        .handle(&raw, &client, &state.group, Protocol::Https)
        .await
    {
        Outcome::Respond(resp) => {
            let json = JsonMessage::from(&resp.msg);
            match serde_json::to_string(&json) {
                Ok(body) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, CONTENT_TYPE_DNS_JSON)],
                    body,
                )
                    .into_response(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
        Outcome::Drop => StatusCode::TOO_MANY_REQUESTS.into_response(),
    }
}

/// A record type from either a mnemonic (`AAAA`) or a number (`28`).
fn parse_record_type(raw: &str) -> Option<RecordType> {
    if let Ok(num) = raw.parse::<u16>() {
        return Some(RecordType::from(num));
    }

    raw.to_ascii_uppercase().parse().ok()
}

fn truthy(raw: &str) -> bool {
    matches!(raw, "1" | "true")
}

/// A minimal query-string accessor; DoH parameters are plain tokens that
/// need no percent-decoding beyond base64url's alphabet.
fn url_query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| v.to_string())
    })
}
