//! Report Listener
//!
//! Receives reports mirrored by the switch and hands them to the
//! [`CacheController`] one at a time, in arrival order.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{CacheController, ReportOutcome};
use crate::error::Result;
use crate::protocol::{extract_payload, ProtocolCodec, ProtocolMessage};

/// How report datagrams are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFraming {
    /// Each datagram is one protocol message
    #[default]
    Payload,
    /// Each datagram is a captured Ethernet frame wrapping the message
    Frame,
}

/// UDP endpoint receiving switch reports.
pub struct ReportListener {
    socket: UdpSocket,
    controller: Arc<CacheController>,
    codec: ProtocolCodec,
    framing: ReportFraming,
}

impl ReportListener {
    pub async fn bind(
        addr: SocketAddr,
        controller: Arc<CacheController>,
        codec: ProtocolCodec,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            controller,
            codec,
            framing: ReportFraming::default(),
        })
    }

    pub fn with_framing(mut self, framing: ReportFraming) -> Self {
        self.framing = framing;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Decode one received datagram.
    pub fn decode(&self, datagram: &[u8]) -> Result<ProtocolMessage> {
        match self.framing {
            ReportFraming::Payload => self.codec.decode(datagram),
            ReportFraming::Frame => self.codec.decode(extract_payload(datagram)?),
        }
    }

    /// Serve reports until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(
            "Listening for switch reports on {} ({:?} framing)",
            self.local_addr()?,
            self.framing
        );

        let mut buf = vec![0u8; 65536];
        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Report receive failed: {}", e);
                        continue;
                    }
                },
            };

            let msg = match self.decode(&buf[..len]) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Discarding malformed report from {}: {}", peer, e);
                    continue;
                }
            };

            match self.controller.handle_report(&msg).await {
                Ok(ReportOutcome::Ignored) => {}
                Ok(outcome) => debug!("Report {} for {} applied: {:?}", msg.op, msg.key_str(), outcome),
                Err(e) => warn!("Report {} for {} failed: {}", msg.op, msg.key_str(), e),
            }
        }

        info!("Report listener stopped");
        Ok(())
    }
}

impl std::fmt::Debug for ReportListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportListener")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("framing", &self.framing)
            .finish()
    }
}
