// BLE Port Implementation
// Carries RTU frames over a GATT write characteristic and a notify characteristic

use crate::port::gatt::{CharacteristicHandle, DeviceHandle, DeviceRequest, GattCentral, GattError};
use crate::port::{CloseReason, Port, PortError, PortEvent, PortState, PortStats};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

// ============================================================================
// BLE PORT CONFIG
// ============================================================================

/// Configuration for the BLE port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlePortConfig {
    /// Service holding the characteristic frames are written to
    pub write_service: String,
    /// Characteristic frames are written to
    pub write_characteristic: String,
    /// Service holding the characteristic answers arrive on
    pub notify_service: String,
    /// Characteristic answers arrive on
    pub notify_characteristic: String,
}

impl Default for BlePortConfig {
    fn default() -> Self {
        Self {
            write_service: "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string(), // Nordic UART
            write_characteristic: "6e400002-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
            notify_service: "6e400001-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
            notify_characteristic: "6e400003-b5a3-f393-e0a9-e50e24dcca9e".to_string(),
        }
    }
}

impl BlePortConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_service(mut self, uuid: &str) -> Self {
        self.write_service = uuid.to_string();
        self
    }

    pub fn with_write_characteristic(mut self, uuid: &str) -> Self {
        self.write_characteristic = uuid.to_string();
        self
    }

    pub fn with_notify_service(mut self, uuid: &str) -> Self {
        self.notify_service = uuid.to_string();
        self
    }

    pub fn with_notify_characteristic(mut self, uuid: &str) -> Self {
        self.notify_characteristic = uuid.to_string();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PortError> {
        let fields = [
            ("write_service", &self.write_service),
            ("write_characteristic", &self.write_characteristic),
            ("notify_service", &self.notify_service),
            ("notify_characteristic", &self.notify_characteristic),
        ];
        for (name, value) in fields {
            if value.trim().is_empty() {
                return Err(PortError::InvalidConfig(format!("{} cannot be empty", name)));
            }
        }
        Ok(())
    }

    /// Device filter: advertise the write service, grant access to both
    pub fn device_request(&self) -> DeviceRequest {
        let mut optional_services = vec![self.write_service.clone()];
        if !self.notify_service.eq_ignore_ascii_case(&self.write_service) {
            optional_services.push(self.notify_service.clone());
        }
        DeviceRequest {
            filter_services: vec![self.write_service.clone()],
            optional_services,
        }
    }
}

// ============================================================================
// OPEN SEQUENCE
// ============================================================================

/// Steps of the BLE open sequence, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStep {
    SelectDevice,
    WatchDisconnect,
    Connect,
    ResolveWrite,
    ResolveNotify,
    Subscribe,
    WatchNotifications,
}

impl fmt::Display for OpenStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SelectDevice => "device selection",
            Self::WatchDisconnect => "disconnect listener",
            Self::Connect => "GATT connect",
            Self::ResolveWrite => "write characteristic",
            Self::ResolveNotify => "notify characteristic",
            Self::Subscribe => "notification subscribe",
            Self::WatchNotifications => "notification listener",
        };
        write!(f, "{}", name)
    }
}

fn step_error(step: OpenStep) -> impl FnOnce(GattError) -> PortError {
    move |e| PortError::OpenFailed {
        step: step.to_string(),
        reason: e.to_string(),
    }
}

/// Resources an open attempt has acquired so far, released if it fails
#[derive(Default)]
struct Acquired {
    device: Option<DeviceHandle>,
    connected: bool,
    subscribed: Option<CharacteristicHandle>,
}

struct Session {
    device: DeviceHandle,
    write_char: CharacteristicHandle,
    notify_char: CharacteristicHandle,
    disconnects: mpsc::UnboundedReceiver<()>,
    notifications: mpsc::UnboundedReceiver<Vec<u8>>,
}

enum Inbound {
    Value(Vec<u8>),
    Disconnected,
    NotificationsEnded,
}

// ============================================================================
// BLE PORT
// ============================================================================

/// RTU port over Bluetooth Low Energy.
///
/// Frames are written in one characteristic write; notified values are
/// relayed as-is, with no framing or validation.
pub struct BlePort {
    central: Arc<dyn GattCentral>,
    config: BlePortConfig,
    state: PortState,
    session: Option<Session>,
    events: VecDeque<PortEvent>,
    stats: PortStats,
}

impl BlePort {
    pub fn new(central: Arc<dyn GattCentral>, config: BlePortConfig) -> Self {
        Self {
            central,
            config,
            state: PortState::Closed,
            session: None,
            events: VecDeque::new(),
            stats: PortStats::default(),
        }
    }

    pub fn config(&self) -> &BlePortConfig {
        &self.config
    }

    /// The connected device, while open
    pub fn device(&self) -> Option<&DeviceHandle> {
        self.session.as_ref().map(|s| &s.device)
    }

    async fn establish(&self, acquired: &mut Acquired) -> Result<Session, PortError> {
        let central = &self.central;

        let device = central
            .request_device(&self.config.device_request())
            .await
            .map_err(|e| match e {
                GattError::Cancelled(reason) => PortError::DeviceNotSelected(reason),
                other => step_error(OpenStep::SelectDevice)(other),
            })?;
        acquired.device = Some(device.clone());
        debug!(device = device.id(), "device selected");

        let disconnects = central.watch_disconnect(&device);
        trace!(step = %OpenStep::WatchDisconnect, "listener registered");

        central
            .connect(&device)
            .await
            .map_err(step_error(OpenStep::Connect))?;
        acquired.connected = true;

        let write_char = central
            .resolve_characteristic(
                &device,
                &self.config.write_service,
                &self.config.write_characteristic,
            )
            .await
            .map_err(step_error(OpenStep::ResolveWrite))?;

        let notify_char = central
            .resolve_characteristic(
                &device,
                &self.config.notify_service,
                &self.config.notify_characteristic,
            )
            .await
            .map_err(step_error(OpenStep::ResolveNotify))?;

        central
            .start_notifications(&notify_char)
            .await
            .map_err(step_error(OpenStep::Subscribe))?;
        acquired.subscribed = Some(notify_char.clone());

        let notifications = central.watch_notifications(&notify_char);
        trace!(step = %OpenStep::WatchNotifications, "listener registered");

        Ok(Session {
            device,
            write_char,
            notify_char,
            disconnects,
            notifications,
        })
    }

    /// Undo a partial open
    async fn release(&self, acquired: Acquired) {
        if let Some(characteristic) = acquired.subscribed {
            if let Err(e) = self.central.stop_notifications(&characteristic).await {
                warn!(error = %e, "failed to stop notifications after open failure");
            }
        }
        if let Some(device) = acquired.device {
            if acquired.connected || self.central.is_connected(&device) {
                if let Err(e) = self.central.disconnect(&device).await {
                    warn!(error = %e, "failed to disconnect after open failure");
                }
            }
        }
    }

    fn relay(&mut self, value: Vec<u8>) -> PortEvent {
        self.stats.frames_received += 1;
        self.stats.bytes_received += value.len() as u64;
        trace!(frame = %hex::encode(&value), "notification");
        PortEvent::DataReceived { frame: value }
    }

    /// Queue everything the backend has delivered without waiting, then
    /// react to a dropped link or an ended notification stream.
    async fn drain_inbound(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let mut values = Vec::new();
        let mut notifications_ended = false;
        loop {
            match session.notifications.try_recv() {
                Ok(value) => values.push(value),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    notifications_ended = true;
                    break;
                }
            }
        }
        let disconnected = match session.disconnects.try_recv() {
            Ok(()) | Err(mpsc::error::TryRecvError::Disconnected) => true,
            Err(mpsc::error::TryRecvError::Empty) => !self.central.is_connected(&session.device),
        };

        for value in values {
            let event = self.relay(value);
            self.events.push_back(event);
        }

        if disconnected {
            self.on_transport_disconnect();
        } else if notifications_ended {
            self.on_notifications_ended().await;
        }
    }

    /// The peripheral went away without `close()` being called
    fn on_transport_disconnect(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        debug!(device = session.device.id(), "device disconnected");
        if self.state.transition_to(PortState::Closed).is_ok() {
            self.stats.closes += 1;
            self.events.push_back(PortEvent::Closed {
                reason: CloseReason::TransportDisconnected,
            });
        }
    }

    /// The backend ended the notification stream; the link is useless
    /// for answers, so drop it rather than keep it connected.
    async fn on_notifications_ended(&mut self) {
        if let Some(session) = self.session.as_ref() {
            warn!(device = session.device.id(), "notification stream ended");
            if self.central.is_connected(&session.device) {
                if let Err(e) = self.central.disconnect(&session.device).await {
                    warn!(error = %e, "failed to disconnect after notification stream ended");
                }
            }
        }
        self.on_transport_disconnect();
    }
}

impl Port for BlePort {
    async fn open(&mut self) -> Result<(), PortError> {
        self.drain_inbound().await;
        if self.session.is_some() {
            return Err(PortError::AlreadyOpen);
        }
        self.config.validate()?;

        self.state.transition_to(PortState::Opening)?;

        let mut acquired = Acquired::default();
        match self.establish(&mut acquired).await {
            Ok(session) => {
                debug!(device = session.device.id(), "ble port open");
                self.session = Some(session);
                self.state.transition_to(PortState::Open)?;
                self.stats.opens += 1;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "ble port failed to open");
                self.release(acquired).await;
                self.state.transition_to(PortState::Closed)?;
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<(), PortError> {
        // A link that already dropped closes through its own event
        self.drain_inbound().await;
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        let mut errors = Vec::new();

        if self.central.is_connected(&session.device) {
            if let Err(e) = self.central.stop_notifications(&session.notify_char).await {
                errors.push(format!("stop notifications: {}", e));
            }
        }

        // Drop both listeners before disconnecting
        let Session { device, disconnects, notifications, .. } = session;
        drop(notifications);
        drop(disconnects);

        if self.central.is_connected(&device) {
            if let Err(e) = self.central.disconnect(&device).await {
                errors.push(format!("disconnect: {}", e));
            }
        }

        self.state.transition_to(PortState::Closed)?;
        self.stats.closes += 1;
        self.events.push_back(PortEvent::Closed {
            reason: CloseReason::Requested,
        });

        if errors.is_empty() {
            debug!(device = device.id(), "ble port closed");
            Ok(())
        } else {
            warn!(device = device.id(), errors = ?errors, "ble port closed with errors");
            Err(PortError::CloseFailed(errors))
        }
    }

    async fn write(&mut self, frame: &[u8]) -> Result<(), PortError> {
        self.drain_inbound().await;
        let session = self.session.as_ref().ok_or(PortError::NotOpen)?;

        self.central
            .write_value(&session.write_char, frame)
            .await
            .map_err(|e| PortError::SendFailed(e.to_string()))?;

        self.stats.frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        trace!(frame = %hex::encode(frame), "written");

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |s| self.central.is_connected(&s.device))
    }

    fn state(&self) -> PortState {
        // A dropped link reads as closed before its event is drained
        if self.state.is_open() && !self.is_open() {
            PortState::Closed
        } else {
            self.state
        }
    }

    async fn poll_events(&mut self) -> Vec<PortEvent> {
        self.drain_inbound().await;
        self.events.drain(..).collect()
    }

    async fn next_event(&mut self) -> Option<PortEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }

        let session = self.session.as_mut()?;
        let inbound = tokio::select! {
            biased;
            value = session.notifications.recv() => match value {
                Some(value) => Inbound::Value(value),
                None => Inbound::NotificationsEnded,
            },
            _ = session.disconnects.recv() => Inbound::Disconnected,
        };

        match inbound {
            Inbound::Value(value) => Some(self.relay(value)),
            Inbound::Disconnected => {
                self.on_transport_disconnect();
                self.events.pop_front()
            }
            Inbound::NotificationsEnded => {
                self.on_notifications_ended().await;
                self.events.pop_front()
            }
        }
    }

    fn stats(&self) -> PortStats {
        self.stats.clone()
    }
}
