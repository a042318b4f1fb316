//! DNS over TCP and over TLS (DoT).
//!
//! Both use the RFC 1035 2-byte length-prefixed framing. One connection can
//! carry interleaved queries: every framed message runs in its own task and
//! responses are written back in completion order; clients correlate by DNS
//! message id. A rate-limit denial closes the whole connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_rustls::TlsAcceptor;

use crate::dnsmsg;
use crate::error::Error;
use crate::pipeline::{Outcome, Pipeline};

use super::{ClientInfo, Protocol, ServerGroup};

/// Serves plain DNS-over-TCP on `addr`.
pub async fn serve(
    pipeline: Arc<Pipeline>,
    group: Arc<ServerGroup>,
    addr: SocketAddr,
    idle_timeout: Duration,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "dns-tcp listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "tcp accept error");
                continue;
            }
        };

        let pipeline = Arc::clone(&pipeline);
        let group = Arc::clone(&group);
        tokio::spawn(async move {
            let client = ClientInfo::plain(peer);
            serve_stream(pipeline, group, stream, client, Protocol::DnsTcp, idle_timeout).await;
        });
    }
}

/// Serves DNS-over-TLS on `addr` with the group's certificates.
pub async fn serve_tls(
    pipeline: Arc<Pipeline>,
    group: Arc<ServerGroup>,
    addr: SocketAddr,
    idle_timeout: Duration,
) -> Result<(), Error> {
    let tls_config = group.tls_config(&[b"dot"])?;
    let acceptor = TlsAcceptor::from(tls_config);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "tls listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::warn!(error = %err, "tls accept error");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let pipeline = Arc::clone(&pipeline);
        let group = Arc::clone(&group);
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream,
                Err(err) => {
                    tracing::debug!(error = %err, %peer, "tls handshake failed");
                    return;
                }
            };

            let server_name = tls_stream
                .get_ref()
                .1
                .server_name()
                .map(ToString::to_string);
            let client = ClientInfo {
                addr: peer,
                tls_server_name: server_name,
                url_path: None,
            };
            serve_stream(pipeline, group, tls_stream, client, Protocol::Tls, idle_timeout).await;
        });
    }
}

/// Runs the framed read/dispatch/write loops over one established stream.
async fn serve_stream<S>(
    pipeline: Arc<Pipeline>,
    group: Arc<ServerGroup>,
    stream: S,
    client: ClientInfo,
    proto: Protocol,
    idle_timeout: Duration,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (resp_tx, mut resp_rx) = mpsc::channel::<Vec<u8>>(16);
    let closed = Arc::new(AtomicBool::new(false));
    let close_notify = Arc::new(Notify::new());

    let writer_task = tokio::spawn(async move {
        while let Some(wire) = resp_rx.recv().await {
            let len = u16::try_from(wire.len()).unwrap_or(u16::MAX);
            if writer.write_all(&len.to_be_bytes()).await.is_err() {
                break;
            }
            if writer.write_all(&wire).await.is_err() {
                break;
            }
        }

        let _ = writer.shutdown().await;
    });

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, idle_timeout) => frame,
            () = close_notify.notified() => break,
        };
        let Some(raw) = frame else { break };

        if closed.load(Ordering::Relaxed) {
            break;
        }

        let pipeline = Arc::clone(&pipeline);
        let group = Arc::clone(&group);
        let client = client.clone();
        let resp_tx = resp_tx.clone();
        let closed = Arc::clone(&closed);
        let close_notify = Arc::clone(&close_notify);
        tokio::spawn(async move {
            match pipeline.handle(&raw, &client, &group, proto).await {
                Outcome::Respond(resp) => {
                    if resp.wire.len() <= dnsmsg::MAX_MESSAGE_SIZE {
                        let _ = resp_tx.send(resp.wire).await;
                    }
                }
                Outcome::Drop => {
                    closed.store(true, Ordering::Relaxed);
                    close_notify.notify_waiters();
                }
            }
        });
    }

    drop(resp_tx);
    let _ = writer_task.await;
}

/// Reads one 2-byte length-prefixed message, or `None` on EOF, error, or
/// idle timeout.
async fn read_frame<R>(reader: &mut R, idle_timeout: Duration) -> Option<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let read = async {
        let mut len_buf = [0u8; 2];
        reader.read_exact(&mut len_buf).await.ok()?;
        let len = usize::from(u16::from_be_bytes(len_buf));
        if len == 0 {
            return None;
        }

        let mut buf = vec![0; len];
        reader.read_exact(&mut buf).await.ok()?;
        Some(buf)
    };

    tokio::time::timeout(idle_timeout, read).await.ok().flatten()
}
