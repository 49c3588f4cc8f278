// GATT Central Backend
// Abstracts the host Bluetooth stack the BLE port drives: device selection,
// connection, characteristic lookup, notifications and writes

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// HANDLES
// ============================================================================

/// A peripheral chosen by the central
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    id: String,
    name: Option<String>,
}

impl DeviceHandle {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// A resolved characteristic on a connected device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicHandle {
    device_id: String,
    service: String,
    uuid: String,
}

impl CharacteristicHandle {
    pub fn new(device: &DeviceHandle, service: &str, uuid: &str) -> Self {
        Self {
            device_id: device.id().to_string(),
            service: service.to_lowercase(),
            uuid: uuid.to_lowercase(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }
}

/// Which peripherals the central may offer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    /// A device must advertise one of these services
    pub filter_services: Vec<String>,
    /// Extra services the port needs access to once connected
    pub optional_services: Vec<String>,
}

// ============================================================================
// GATT ERRORS
// ============================================================================

#[derive(Debug, Clone, Error)]
pub enum GattError {
    #[error("Device selection cancelled: {0}")]
    Cancelled(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Device not connected")]
    NotConnected,

    #[error("Backend error: {0}")]
    Backend(String),
}

// ============================================================================
// GATT CENTRAL TRAIT
// ============================================================================

/// Host Bluetooth stack operations used by the BLE port.
///
/// Listener registration hands back a receiver; dropping it removes the
/// listener.
#[async_trait]
pub trait GattCentral: Send + Sync {
    /// Pick a peripheral matching the request
    async fn request_device(&self, request: &DeviceRequest) -> Result<DeviceHandle, GattError>;

    /// Listen for the device dropping its GATT connection
    fn watch_disconnect(&self, device: &DeviceHandle) -> mpsc::UnboundedReceiver<()>;

    /// Connect the GATT layer
    async fn connect(&self, device: &DeviceHandle) -> Result<(), GattError>;

    fn is_connected(&self, device: &DeviceHandle) -> bool;

    /// Look up a characteristic inside a primary service
    async fn resolve_characteristic(
        &self,
        device: &DeviceHandle,
        service: &str,
        characteristic: &str,
    ) -> Result<CharacteristicHandle, GattError>;

    async fn start_notifications(&self, characteristic: &CharacteristicHandle) -> Result<(), GattError>;

    async fn stop_notifications(&self, characteristic: &CharacteristicHandle) -> Result<(), GattError>;

    /// Listen for value changes on a characteristic
    fn watch_notifications(&self, characteristic: &CharacteristicHandle) -> mpsc::UnboundedReceiver<Vec<u8>>;

    async fn write_value(&self, characteristic: &CharacteristicHandle, value: &[u8]) -> Result<(), GattError>;

    async fn disconnect(&self, device: &DeviceHandle) -> Result<(), GattError>;
}

// ============================================================================
// MOCK GATT CENTRAL
// ============================================================================

/// Operations the mock can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    Connect,
    StartNotifications,
    StopNotifications,
    Write,
    Disconnect,
}

#[derive(Default)]
struct MockState {
    device: Option<DeviceHandle>,
    services: Vec<(String, String)>,
    failures: Vec<MockFailure>,
    connected: bool,
    notifying: bool,
    disconnect_listeners: Vec<mpsc::UnboundedSender<()>>,
    notification_listeners: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    listeners_registered: usize,
    written: Vec<Vec<u8>>,
    disconnect_calls: usize,
}

/// In-memory GATT central for testing
pub struct MockGattCentral {
    state: Mutex<MockState>,
}

impl MockGattCentral {
    /// Create a mock with no device in range (selection is cancelled)
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    /// Offer a device exposing the given (service, characteristic) pairs
    pub fn with_device(self, device: DeviceHandle, characteristics: &[(&str, &str)]) -> Self {
        {
            let mut state = self.lock();
            state.device = Some(device);
            state.services = characteristics
                .iter()
                .map(|(s, c)| (s.to_lowercase(), c.to_lowercase()))
                .collect();
        }
        self
    }

    /// Make an operation fail
    pub fn with_failure(self, failure: MockFailure) -> Self {
        self.lock().failures.push(failure);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, failure: MockFailure) -> Result<(), GattError> {
        if self.lock().failures.contains(&failure) {
            return Err(GattError::Backend(format!("mock {:?} failure", failure)));
        }
        Ok(())
    }

    /// Push a value change to every notification listener
    pub fn notify(&self, value: &[u8]) {
        let mut state = self.lock();
        if !state.notifying {
            return;
        }
        state
            .notification_listeners
            .retain(|tx| tx.send(value.to_vec()).is_ok());
    }

    /// Simulate the peripheral dropping the connection
    pub fn trigger_disconnect(&self) {
        let mut state = self.lock();
        state.connected = false;
        state.notifying = false;
        state.disconnect_listeners.retain(|tx| tx.send(()).is_ok());
    }

    /// Drop every notification listener while the link stays up
    pub fn end_notifications(&self) {
        self.lock().notification_listeners.clear();
    }

    /// Listeners whose receiver is still alive
    pub fn active_listeners(&self) -> usize {
        let state = self.lock();
        state.disconnect_listeners.iter().filter(|tx| !tx.is_closed()).count()
            + state.notification_listeners.iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Listeners ever registered
    pub fn listeners_registered(&self) -> usize {
        self.lock().listeners_registered
    }

    pub fn connected(&self) -> bool {
        self.lock().connected
    }

    pub fn notifying(&self) -> bool {
        self.lock().notifying
    }

    /// Values written to any characteristic, in order
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.lock().written.clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.lock().disconnect_calls
    }
}

impl Default for MockGattCentral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GattCentral for MockGattCentral {
    async fn request_device(&self, request: &DeviceRequest) -> Result<DeviceHandle, GattError> {
        let state = self.lock();
        let device = state
            .device
            .clone()
            .ok_or_else(|| GattError::Cancelled("no device chosen".to_string()))?;

        let advertised = request.filter_services.is_empty()
            || request
                .filter_services
                .iter()
                .any(|wanted| state.services.iter().any(|(s, _)| s.eq_ignore_ascii_case(wanted)));
        if !advertised {
            return Err(GattError::Cancelled("no matching device".to_string()));
        }

        Ok(device)
    }

    fn watch_disconnect(&self, _device: &DeviceHandle) -> mpsc::UnboundedReceiver<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.disconnect_listeners.push(tx);
        state.listeners_registered += 1;
        rx
    }

    async fn connect(&self, _device: &DeviceHandle) -> Result<(), GattError> {
        self.check(MockFailure::Connect)?;
        self.lock().connected = true;
        Ok(())
    }

    fn is_connected(&self, _device: &DeviceHandle) -> bool {
        self.lock().connected
    }

    async fn resolve_characteristic(
        &self,
        device: &DeviceHandle,
        service: &str,
        characteristic: &str,
    ) -> Result<CharacteristicHandle, GattError> {
        let state = self.lock();
        if !state.connected {
            return Err(GattError::NotConnected);
        }
        if !state.services.iter().any(|(s, _)| s.eq_ignore_ascii_case(service)) {
            return Err(GattError::NotFound(format!("service {}", service)));
        }
        let found = state
            .services
            .iter()
            .any(|(s, c)| s.eq_ignore_ascii_case(service) && c.eq_ignore_ascii_case(characteristic));
        if !found {
            return Err(GattError::NotFound(format!("characteristic {}", characteristic)));
        }
        Ok(CharacteristicHandle::new(device, service, characteristic))
    }

    async fn start_notifications(&self, _characteristic: &CharacteristicHandle) -> Result<(), GattError> {
        self.check(MockFailure::StartNotifications)?;
        self.lock().notifying = true;
        Ok(())
    }

    async fn stop_notifications(&self, _characteristic: &CharacteristicHandle) -> Result<(), GattError> {
        self.check(MockFailure::StopNotifications)?;
        let mut state = self.lock();
        if !state.connected {
            return Err(GattError::NotConnected);
        }
        state.notifying = false;
        Ok(())
    }

    fn watch_notifications(&self, _characteristic: &CharacteristicHandle) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();
        state.notification_listeners.push(tx);
        state.listeners_registered += 1;
        rx
    }

    async fn write_value(&self, _characteristic: &CharacteristicHandle, value: &[u8]) -> Result<(), GattError> {
        self.check(MockFailure::Write)?;
        let mut state = self.lock();
        if !state.connected {
            return Err(GattError::NotConnected);
        }
        state.written.push(value.to_vec());
        Ok(())
    }

    async fn disconnect(&self, _device: &DeviceHandle) -> Result<(), GattError> {
        self.lock().disconnect_calls += 1;
        self.check(MockFailure::Disconnect)?;
        let mut state = self.lock();
        state.connected = false;
        state.notifying = false;
        Ok(())
    }
}
