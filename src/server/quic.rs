//! DNS over QUIC (RFC 9250).
//!
//! Every bidirectional stream carries exactly one query/response pair with
//! the 2-byte length prefix; the connection itself has a shared idle
//! timeout. Streams run in independent tasks, so responses on one
//! connection are unordered, as the RFC allows.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use quinn::{Connection, Endpoint};

use crate::dnsmsg;
use crate::error::Error;
use crate::pipeline::{Outcome, Pipeline};

use super::{ClientInfo, Protocol, ServerGroup};

/// The DoQ ALPN token.
const ALPN_DOQ: &[u8] = b"doq";

/// Serves DoQ on `addr` with the group's certificates.
pub async fn serve(
    pipeline: Arc<Pipeline>,
    group: Arc<ServerGroup>,
    addr: SocketAddr,
    idle_timeout: Duration,
) -> Result<(), Error> {
    let tls_config = group.tls_config(&[ALPN_DOQ])?;

    let mut server_config = quinn::ServerConfig::with_crypto(tls_config);
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        idle_timeout
            .try_into()
            .map_err(|_| Error::Config("quic idle timeout out of range".into()))?,
    ));
    server_config.transport_config(Arc::new(transport));

    let endpoint = Endpoint::server(server_config, addr)?;
    tracing::info!(%addr, "quic listening");

    while let Some(connecting) = endpoint.accept().await {
        let pipeline = Arc::clone(&pipeline);
        let group = Arc::clone(&group);
        tokio::spawn(async move {
            let connection = match connecting.await {
                Ok(connection) => connection,
                Err(err) => {
                    tracing::debug!(error = %err, "quic handshake failed");
                    return;
                }
            };

            serve_connection(pipeline, group, connection).await;
        });
    }

    Ok(())
}

async fn serve_connection(pipeline: Arc<Pipeline>, group: Arc<ServerGroup>, conn: Connection) {
    let peer = conn.remote_address();
    let server_name = conn
        .handshake_data()
        .and_then(|data| data.downcast::<quinn::crypto::rustls::HandshakeData>().ok())
        .and_then(|data| data.server_name);

    loop {
        let (send, recv) = match conn.accept_bi().await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::debug!(error = %err, %peer, "quic connection done");
                return;
            }
        };

        let pipeline = Arc::clone(&pipeline);
        let group = Arc::clone(&group);
        let client = ClientInfo {
            addr: peer,
            tls_server_name: server_name.clone(),
            url_path: None,
        };
        tokio::spawn(async move {
            if let Err(err) = serve_stream(pipeline, group, client, send, recv).await {
                tracing::debug!(error = %err, "quic stream error");
            }
        });
    }
}

/// One stream, one query.
async fn serve_stream(
    pipeline: Arc<Pipeline>,
    group: Arc<ServerGroup>,
    client: ClientInfo,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
) -> Result<(), Error> {
    let mut len_buf = [0u8; 2];
    recv.read_exact(&mut len_buf)
        .await
        .map_err(|err| Error::Internal(format!("quic read: {err}")))?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    if len == 0 || len > dnsmsg::MAX_MESSAGE_SIZE {
        return Ok(());
    }

    let mut raw = vec![0; len];
    recv.read_exact(&mut raw)
        .await
        .map_err(|err| Error::Internal(format!("quic read: {err}")))?;

    match pipeline.handle(&raw, &client, &group, Protocol::Quic).await {
        Outcome::Respond(resp) => {
            let len = u16::try_from(resp.wire.len()).unwrap_or(u16::MAX);
            send.write_all(&len.to_be_bytes())
                .await
                .map_err(|err| Error::Internal(format!("quic write: {err}")))?;
            send.write_all(&resp.wire)
                .await
                .map_err(|err| Error::Internal(format!("quic write: {err}")))?;
            send.finish()
                .await
                .map_err(|err| Error::Internal(format!("quic finish: {err}")))?;
        }
        Outcome::Drop => {
            // Rate limited: reset the stream without an answer.
            let _ = send.reset(quinn::VarInt::from_u32(0));
        }
    }

    Ok(())
}
