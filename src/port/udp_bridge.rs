// UDP Bridge Port Implementation
// Simulates a Modbus RTU serial port through a UDP-to-serial hardware gateway

use crate::frame::RequestDescriptor;
use crate::port::envelope::{self, DEFAULT_BRIDGE_PORT, MIN_DATAGRAM_LEN, RESPONSE_MAGIC};
use crate::port::{CloseReason, Port, PortError, PortEvent, PortState, PortStats};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, trace, warn};

// ============================================================================
// UDP BRIDGE CONFIG
// ============================================================================

/// Configuration for the UDP bridge port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpBridgeConfig {
    /// Host name or IP of the bridge
    pub bridge_address: String,
    /// UDP port of the bridge
    pub bridge_port: u16,
    /// Local address to bind to
    pub bind_address: String,
    /// Local port to bind to (0 for random)
    pub bind_port: u16,
    /// RS-485 connector on the bridge (0..=2)
    pub connector: u16,
    /// RS-485 hub on the bridge (1..=2)
    pub hub: u16,
    /// Largest datagram accepted from the bridge
    pub recv_buffer_size: usize,
}

impl Default for UdpBridgeConfig {
    fn default() -> Self {
        Self {
            bridge_address: "127.0.0.1".to_string(),
            bridge_port: DEFAULT_BRIDGE_PORT,
            bind_address: "0.0.0.0".to_string(),
            bind_port: 0,
            connector: 0,
            hub: 1,
            recv_buffer_size: 2048,
        }
    }
}

impl UdpBridgeConfig {
    pub fn new(bridge_address: &str) -> Self {
        Self {
            bridge_address: bridge_address.to_string(),
            ..Self::default()
        }
    }

    pub fn with_bridge_port(mut self, port: u16) -> Self {
        self.bridge_port = port;
        self
    }

    pub fn with_bind_address(mut self, addr: &str) -> Self {
        self.bind_address = addr.to_string();
        self
    }

    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    pub fn with_connector(mut self, connector: u16) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_hub(mut self, hub: u16) -> Self {
        self.hub = hub;
        self
    }

    pub fn with_recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PortError> {
        if self.bridge_address.is_empty() {
            return Err(PortError::InvalidConfig("bridge_address cannot be empty".to_string()));
        }
        if self.bridge_port == 0 {
            return Err(PortError::InvalidConfig("bridge_port cannot be 0".to_string()));
        }
        if self.connector > 2 {
            return Err(PortError::InvalidConfig(format!(
                "connector must be 0..=2, got {}",
                self.connector
            )));
        }
        if !(1..=2).contains(&self.hub) {
            return Err(PortError::InvalidConfig(format!("hub must be 1..=2, got {}", self.hub)));
        }
        if self.recv_buffer_size < MIN_DATAGRAM_LEN {
            return Err(PortError::InvalidConfig(format!(
                "recv_buffer_size must be at least {}",
                MIN_DATAGRAM_LEN
            )));
        }
        Ok(())
    }
}

// ============================================================================
// UDP BRIDGE PORT
// ============================================================================

/// RTU port tunnelled through a UDP-to-serial bridge.
///
/// Only one request may be outstanding: each `write` replaces the pending
/// request descriptor, and the descriptor is consumed by the first matching
/// answer. `is_open` reflects the local socket only; the bridge is never
/// contacted until the first write.
pub struct UdpBridgePort {
    config: UdpBridgeConfig,
    state: PortState,
    socket: Option<UdpSocket>,
    bridge: Option<SocketAddr>,
    pending: Option<RequestDescriptor>,
    events: VecDeque<PortEvent>,
    stats: PortStats,
}

impl UdpBridgePort {
    pub fn new(config: UdpBridgeConfig) -> Self {
        Self {
            config,
            state: PortState::Closed,
            socket: None,
            bridge: None,
            pending: None,
            events: VecDeque::new(),
            stats: PortStats::default(),
        }
    }

    pub fn config(&self) -> &UdpBridgeConfig {
        &self.config
    }

    /// Local socket address while open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Resolved bridge address while open
    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        self.bridge
    }

    /// The request the next answer will be matched against
    pub fn pending_request(&self) -> Option<&RequestDescriptor> {
        self.pending.as_ref()
    }

    async fn bind(&self) -> Result<(UdpSocket, SocketAddr), PortError> {
        let target = (self.config.bridge_address.as_str(), self.config.bridge_port);
        let candidates: Vec<SocketAddr> = lookup_host(target)
            .await
            .map_err(|e| PortError::ConnectionFailed(format!("resolve bridge: {}", e)))?
            .collect();
        let bridge = candidates
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| candidates.first())
            .copied()
            .ok_or_else(|| {
                PortError::ConnectionFailed(format!(
                    "bridge {} did not resolve",
                    self.config.bridge_address
                ))
            })?;

        let local = (self.config.bind_address.as_str(), self.config.bind_port);
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| PortError::ConnectionFailed(format!("bind: {}", e)))?;

        Ok((socket, bridge))
    }

    /// Extract the answer frame carried by a bridge datagram, if it matches
    /// the pending request. Anything else is dropped and counted.
    fn accept_datagram(&mut self, datagram: &[u8]) -> Option<Vec<u8>> {
        let request = match self.pending {
            Some(request) if request.is_trackable() => request,
            _ => {
                self.stats.datagrams_ignored += 1;
                trace!(len = datagram.len(), "datagram without pending request");
                return None;
            }
        };

        if datagram.len() < MIN_DATAGRAM_LEN {
            self.stats.datagrams_ignored += 1;
            trace!(len = datagram.len(), "datagram too short");
            return None;
        }

        if envelope::magic(datagram) != Some(RESPONSE_MAGIC) {
            self.stats.datagrams_ignored += 1;
            trace!(magic = ?envelope::magic(datagram), "unexpected bridge magic");
            return None;
        }

        let candidates = envelope::response_candidates(datagram, request.expected_len());
        let frame = candidates
            .primary
            .filter(|c| request.accepts(c))
            .or_else(|| candidates.fallback.filter(|c| request.accepts(c)));

        match frame {
            Some(frame) => {
                self.pending = None;
                self.stats.frames_received += 1;
                self.stats.bytes_received += frame.len() as u64;
                trace!(frame = %hex::encode(frame), "bridge answer");
                Some(frame.to_vec())
            }
            None => {
                self.stats.frames_rejected += 1;
                debug!(
                    unit_id = request.unit_id(),
                    function = request.function_code(),
                    expected_len = request.expected_len(),
                    datagram = %hex::encode(datagram),
                    "bridge answer failed validation"
                );
                None
            }
        }
    }
}

impl Port for UdpBridgePort {
    async fn open(&mut self) -> Result<(), PortError> {
        if self.state.is_open() {
            return Err(PortError::AlreadyOpen);
        }
        self.config.validate()?;

        self.state.transition_to(PortState::Opening)?;

        match self.bind().await {
            Ok((socket, bridge)) => {
                debug!(local = ?socket.local_addr().ok(), %bridge, "udp bridge port open");
                self.socket = Some(socket);
                self.bridge = Some(bridge);
                self.state.transition_to(PortState::Open)?;
                self.stats.opens += 1;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "udp bridge port failed to open");
                self.state.transition_to(PortState::Closed)?;
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<(), PortError> {
        if !self.state.is_open() {
            return Ok(());
        }

        self.socket = None;
        self.bridge = None;
        self.pending = None;
        self.state.transition_to(PortState::Closed)?;
        self.stats.closes += 1;
        self.events.push_back(PortEvent::Closed {
            reason: CloseReason::Requested,
        });

        debug!("udp bridge port closed");
        Ok(())
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), PortError> {
        let (socket, bridge) = match (&self.socket, self.bridge) {
            (Some(socket), Some(bridge)) => (socket, bridge),
            _ => return Err(PortError::NotOpen),
        };

        let Some(request) = RequestDescriptor::from_frame(frame) else {
            self.stats.frames_skipped += 1;
            debug!(len = frame.len(), "frame too short, not sent");
            return Ok(());
        };

        if let Some(previous) = self.pending.replace(request) {
            debug!(
                unit_id = previous.unit_id(),
                function = previous.function_code(),
                "pending request superseded"
            );
        }

        let datagram = envelope::encode_request(
            frame,
            self.config.connector,
            self.config.hub,
            request.expected_len(),
        );

        socket
            .send_to(&datagram, bridge)
            .await
            .map_err(|e| PortError::SendFailed(e.to_string()))?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += datagram.len() as u64;
        trace!(frame = %hex::encode(frame), expected_len = request.expected_len(), "sent to bridge");

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn state(&self) -> PortState {
        self.state
    }

    async fn poll_events(&mut self) -> Vec<PortEvent> {
        let mut buf = vec![0u8; self.config.recv_buffer_size];

        loop {
            let result = match self.socket.as_ref() {
                Some(socket) => socket.try_recv_from(&mut buf),
                None => break,
            };
            match result {
                Ok((n, _peer)) => {
                    if let Some(frame) = self.accept_datagram(&buf[..n]) {
                        self.events.push_back(PortEvent::DataReceived { frame });
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!(error = %e, "udp receive error");
                    break;
                }
            }
        }

        self.events.drain(..).collect()
    }

    async fn next_event(&mut self) -> Option<PortEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }

        let mut buf = vec![0u8; self.config.recv_buffer_size];
        loop {
            let socket = self.socket.as_ref()?;
            let (n, peer) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(error = %e, "udp receive error");
                    // Let other tasks run if the error keeps coming back
                    tokio::task::yield_now().await;
                    continue;
                }
            };
            trace!(%peer, len = n, "datagram");

            if let Some(frame) = self.accept_datagram(&buf[..n]) {
                return Some(PortEvent::DataReceived { frame });
            }
        }
    }

    fn stats(&self) -> PortStats {
        self.stats.clone()
    }
}
