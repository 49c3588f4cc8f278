// Port Traits and Core Types
// Defines the abstract Port contract and the types shared by every adapter

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ============================================================================
// PORT STATE
// ============================================================================

/// Lifecycle state of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortState {
    Closed,
    Opening,
    Open,
}

impl Default for PortState {
    fn default() -> Self {
        Self::Closed
    }
}

impl PortState {
    /// Check if transition to another state is valid
    pub fn can_transition_to(&self, target: &PortState) -> bool {
        match (self, target) {
            (Self::Closed, Self::Opening) => true,
            (Self::Opening, Self::Open) => true,
            (Self::Opening, Self::Closed) => true, // Open failed
            (Self::Open, Self::Closed) => true,
            _ => false,
        }
    }

    /// Move to `target`, refusing transitions the lifecycle does not allow
    pub fn transition_to(&mut self, target: PortState) -> Result<(), PortError> {
        if !self.can_transition_to(&target) {
            return Err(PortError::InvalidTransition {
                from: *self,
                to: target,
            });
        }
        *self = target;
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }
}

// ============================================================================
// PORT EVENTS
// ============================================================================

/// Why a port left the open state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called
    Requested,
    /// The lower layer dropped the connection on its own
    TransportDisconnected,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "closed by caller"),
            Self::TransportDisconnected => write!(f, "transport disconnected"),
        }
    }
}

/// Events emitted by a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A complete inbound frame
    DataReceived { frame: Vec<u8> },

    /// The port closed; fires at most once per open/close cycle
    Closed { reason: CloseReason },
}

impl PortEvent {
    pub fn frame(&self) -> Option<&[u8]> {
        match self {
            Self::DataReceived { frame } => Some(frame),
            Self::Closed { .. } => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }
}

// ============================================================================
// PORT ERRORS
// ============================================================================

/// Errors surfaced by `open`, `close` and `write`
#[derive(Debug, Clone, Error)]
pub enum PortError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No device selected: {0}")]
    DeviceNotSelected(String),

    #[error("Open failed at {step}: {reason}")]
    OpenFailed { step: String, reason: String },

    #[error("Close failed: {}", .0.join("; "))]
    CloseFailed(Vec<String>),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Port not open")]
    NotOpen,

    #[error("Port already open")]
    AlreadyOpen,

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: PortState, to: PortState },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl PortError {
    /// Check if this error belongs to the connection lifecycle
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_)
                | Self::DeviceNotSelected(_)
                | Self::OpenFailed { .. }
                | Self::CloseFailed(_)
                | Self::AlreadyOpen
        )
    }

    /// Check if this is a send-related error
    pub fn is_send_error(&self) -> bool {
        matches!(self, Self::SendFailed(_) | Self::NotOpen)
    }
}

impl From<std::io::Error> for PortError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

// ============================================================================
// PORT STATISTICS
// ============================================================================

/// Counters for port traffic, including everything dropped on the floor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortStats {
    /// Frames handed to the medium
    pub frames_sent: u64,
    /// Bytes handed to the medium (envelope included)
    pub bytes_sent: u64,
    /// Frames emitted as `DataReceived`
    pub frames_received: u64,
    /// Bytes emitted as `DataReceived`
    pub bytes_received: u64,
    /// Outbound frames too short to forward
    pub frames_skipped: u64,
    /// Inbound datagrams ignored before validation (no request, short, bad magic)
    pub datagrams_ignored: u64,
    /// Inbound candidates that failed validation
    pub frames_rejected: u64,
    /// Successful opens
    pub opens: u64,
    /// Closed events emitted
    pub closes: u64,
}

// ============================================================================
// PORT TRAIT
// ============================================================================

/// Uniform transport contract consumed by a Modbus master.
///
/// Ports move bytes only. There is no timeout inside a port: a request that
/// never gets a matching response simply produces no `DataReceived`, and the
/// caller's own timeout is the failure signal.
#[allow(async_fn_in_trait)]
pub trait Port {
    /// Establish the connection
    async fn open(&mut self) -> Result<(), PortError>;

    /// Tear the connection down; closing a closed port is a no-op
    async fn close(&mut self) -> Result<(), PortError>;

    /// Send one frame
    async fn write(&mut self, frame: &[u8]) -> Result<(), PortError>;

    /// Current connection state
    fn is_open(&self) -> bool;

    /// Current lifecycle state
    fn state(&self) -> PortState;

    /// Drain every event that is ready without waiting
    async fn poll_events(&mut self) -> Vec<PortEvent>;

    /// Wait for the next event; `None` once the port is closed and drained
    async fn next_event(&mut self) -> Option<PortEvent>;

    /// Traffic counters
    fn stats(&self) -> PortStats;
}
