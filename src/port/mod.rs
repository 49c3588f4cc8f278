// Port module - THE WIRE (abstract)
// Provides interchangeable RTU transports for a Modbus master: UDP bridge and BLE

mod traits;
pub mod envelope;
mod udp_bridge;
pub mod gatt;
mod ble;

pub use traits::{
    // Core trait
    Port,
    // Lifecycle
    PortState,
    // Events and errors
    CloseReason, PortError, PortEvent,
    // Statistics
    PortStats,
};

pub use udp_bridge::{UdpBridgeConfig, UdpBridgePort};

pub use gatt::{
    CharacteristicHandle, DeviceHandle, DeviceRequest, GattCentral, GattError,
    MockFailure, MockGattCentral,
};

pub use ble::{BlePort, BlePortConfig, OpenStep};
