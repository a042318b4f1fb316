//! Plain DNS over UDP.
//!
//! One task per datagram. Responses larger than the client's advertised
//! EDNS size (512 bytes without EDNS) are truncated with the TC bit set so
//! the client retries over TCP.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use crate::dnsmsg;
use crate::pipeline::{Outcome, Pipeline};

use super::{ClientInfo, Protocol, ServerGroup};

/// Binds `addr` and serves datagrams until the task is cancelled.
pub async fn serve(
    pipeline: Arc<Pipeline>,
    group: Arc<ServerGroup>,
    addr: SocketAddr,
) -> Result<(), crate::error::Error> {
    let sock = Arc::new(UdpSocket::bind(addr).await?);
    tracing::info!(%addr, "dns-udp listening");

    loop {
        let mut buf = vec![0; dnsmsg::DEFAULT_EDNS_UDP_SIZE as usize];
        let (len, peer) = match sock.recv_from(&mut buf).await {
            Ok(recv) => recv,
            Err(err) => {
                tracing::warn!(error = %err, "udp recv error");
                continue;
            }
        };
        buf.truncate(len);

        let sock = Arc::clone(&sock);
        let pipeline = Arc::clone(&pipeline);
        let group = Arc::clone(&group);
        tokio::spawn(async move {
            let client = ClientInfo::plain(peer);
            match pipeline.handle(&buf, &client, &group, Protocol::DnsUdp).await {
                Outcome::Respond(resp) => {
                    let max = dnsmsg::client_udp_size(&resp.msg);
                    let wire = if resp.wire.len() <= usize::from(max) {
                        resp.wire
                    } else {
                        match dnsmsg::encode_for_udp(&resp.msg, max) {
                            Ok(wire) => wire,
                            Err(err) => {
                                tracing::debug!(error = %err, "truncating response");
                                return;
                            }
                        }
                    };

                    if let Err(err) = sock.send_to(&wire, peer).await {
                        tracing::debug!(error = %err, %peer, "udp send error");
                    }
                }
                Outcome::Drop => {}
            }
        });
    }
}
