//! RTP/RTCP demultiplexing
//!
//! Some transport peers multiplex RTP and RTCP onto one UDP flow; the
//! downstream transcoder wants them on separate ports. The demuxer inspects
//! the payload-type field (byte 1, low 7 bits) of each datagram: values
//! above 90 or equal to 0 are media, everything else is control.
//!
//! RTCP traffic also drives a keepalive: during media silence the last RTCP
//! message is re-sent to the RTP port on an interval shorter than the
//! transcoder's read timeout, so it never declares the pipe dead.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Result;

/// Largest datagram we expect on the multiplexed flow
const MAX_DATAGRAM_SIZE: usize = 2048;

/// True when the payload-type byte marks an RTP (media) datagram
pub fn is_rtp_payload(payload_type_byte: u8) -> bool {
    let payload_type = payload_type_byte & 0x7f;
    payload_type > 90 || payload_type == 0
}

/// Splits one multiplexed UDP flow into RTP and RTCP destinations
pub struct RtpDemuxer {
    local_port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RtpDemuxer {
    /// Bind `listen_port` and start forwarding
    ///
    /// Media goes to `rtp_port`, control to `rtcp_port`, both on loopback
    /// where the transcoder listens.
    pub async fn start(
        listen_port: u16,
        rtp_port: u16,
        rtcp_port: u16,
        heartbeat_interval: Duration,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port,
        ))
        .await?;
        let local_port = socket.local_addr()?.port();
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            demux_loop(socket, rtp_port, rtcp_port, heartbeat_interval, task_cancel).await;
        });

        debug!(
            "RTP demuxer on port {} -> rtp {}, rtcp {}",
            local_port, rtp_port, rtcp_port
        );
        Ok(Self {
            local_port,
            cancel,
            task,
        })
    }

    /// The bound multiplexed port
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Stop forwarding and release the socket
    pub fn close(&self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

impl Drop for RtpDemuxer {
    fn drop(&mut self) {
        self.close();
    }
}

async fn demux_loop(
    socket: UdpSocket,
    rtp_port: u16,
    rtcp_port: u16,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
) {
    let rtp_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), rtp_port);
    let rtcp_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), rtcp_port);
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let mut last_rtcp: Option<Vec<u8>> = None;
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => {
                let (len, _peer) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("RTP demuxer receive failed: {}", e);
                        break;
                    }
                };
                if len < 2 {
                    continue;
                }
                let datagram = &buf[..len];
                if is_rtp_payload(datagram[1]) {
                    trace!("RTP datagram, {} bytes", len);
                    let _ = socket.send_to(datagram, rtp_addr).await;
                } else {
                    trace!("RTCP datagram, {} bytes", len);
                    let _ = socket.send_to(datagram, rtcp_addr).await;
                    // Control traffic re-arms the keepalive
                    last_rtcp = Some(datagram.to_vec());
                    heartbeat.reset();
                }
            }
            _ = heartbeat.tick() => {
                if let Some(message) = &last_rtcp {
                    trace!("RTCP keepalive, {} bytes", message.len());
                    let _ = socket.send_to(message, rtp_addr).await;
                }
            }
        }
    }
}
